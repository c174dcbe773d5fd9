//! Supervision core for an autonomous skill bot.
//!
//! This library provides the observe/learn/gate loop around skill
//! execution:
//! - Workflow routing with per-route analytics and lifecycle events
//! - Structured outcome capture with fingerprinting and recurrence counts
//! - Two-stage, risk-weighted human approval gates with an audit trail
//! - A self-improvement loop that mines errors, corrections, and gate
//!   decisions into approval-tracked proposals
//! - An auto-fix engine that materializes proposals into source patches
//!   under backup/test/rollback discipline
//!
//! # Composition
//!
//! The logger is the leaf capability; the router, the gates, and the
//! improvement loop hold it. The improvement loop additionally reads
//! router analytics and gate statistics, and the auto-fix engine closes
//! the loop by recording fixes back into the logger:
//!
//! ```text
//! message ─▶ router ─▶ (plan gate) ─▶ handler ─▶ (verify gate) ─▶ events
//!               │                       │
//!               └────────▶ logger ◀─────┘
//!                            ▲
//!      analyze ─▶ insights ─▶│─▶ proposals ─▶ fixes ─▶ deploy/rollback
//! ```

pub mod autofix;
pub mod errlog;
pub mod events;
pub mod gates;
pub mod improvement;
pub mod router;

// Re-export key logger types
pub use errlog::{
    CaptureContext, ErrorClass, ErrorLogger, ErrorReport, LogError, LogResult, LoggerConfig,
    OutcomeRecord, QueryFilter, RecurringError, Severity, SkillError, SkillOutcome,
};

// Re-export key router types
pub use router::{
    handler_fn, priority, AnalyticsSummary, MiddlewareAction, ParallelDispatch, PostMiddleware,
    PreCheckResult, PreMiddleware, RiskLevel, RouteBuilder, RouteOutcome, RouterError,
    RouterResult, SkillHandler, SkillRequest, WorkflowRouter,
};

// Re-export key gate types
pub use gates::{
    rule_fn, CheckOutcome, GateContext, GateError, GatePolicy, GateResolution, GateResult,
    GateStage, GateStatistics, GateStatus, GatesConfig, PendingGateInfo, PlanGateMiddleware,
    PlanSpec, RuleCheck, VerificationGates, VerifyRule,
};

// Re-export key improvement-loop types
pub use improvement::{
    AnalysisReport, Correction, FeedbackRating, Insight, InsightSeverity, InsightType, LoopConfig,
    LoopError, LoopResult, MetricsSnapshot, Proposal, ProposalAction, ProposalFilter,
    ProposalStatus, SelfImprovementLoop, Trend,
};

// Re-export key auto-fix types
pub use autofix::{
    AutoFixConfig, AutoFixEngine, Fix, FixError, FixOracle, FixResult, FixStatus, MockOracle,
    ProcessTestRunner, SkillTestRunner, TestRun,
};

// Re-export the event surface
pub use events::{EventBus, EventHistory, SharedEventBus, SupervisionEvent};

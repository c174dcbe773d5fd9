//! Lifecycle events published by the router, the gates, the improvement
//! loop, and the auto-fix engine.
//!
//! The chat surface subscribes to these to render approval prompts and
//! progress; `event_type()` strings are the stable contract it matches on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errlog::OutcomeRecord;
use crate::gates::{GateStage, RuleCheck};
use crate::improvement::InsightSeverity;
use crate::router::RiskLevel;

/// All supervision lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisionEvent {
    /// A message matched a route.
    RouteMatched {
        skill: String,
        agent: String,
        timestamp: DateTime<Utc>,
    },

    /// No route matched a message.
    RouteMissed {
        message_preview: String,
        timestamp: DateTime<Utc>,
    },

    /// A routed execution completed successfully.
    SkillSucceeded {
        skill: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A routed execution failed; carries the captured logger record.
    SkillFailed {
        skill: String,
        record: OutcomeRecord,
        timestamp: DateTime<Utc>,
    },

    /// A gate is waiting for external approval.
    GatePending {
        gate_id: String,
        gate: GateStage,
        skill: String,
        risk: RiskLevel,
        #[serde(skip_serializing_if = "Option::is_none")]
        plan: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        checks: Option<Vec<RuleCheck>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        failed_checks: Option<Vec<RuleCheck>>,
        timeout_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// One or more verify-gate checks failed.
    VerificationFailed {
        skill: String,
        risk: RiskLevel,
        failed_checks: Vec<RuleCheck>,
        timestamp: DateTime<Utc>,
    },

    /// A post-execution verification was rejected.
    VerificationRejected {
        skill: String,
        risk: RiskLevel,
        reasons: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// The improvement loop created a proposal.
    ProposalCreated {
        proposal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        skill: Option<String>,
        action: String,
        severity: InsightSeverity,
        description: String,
        timestamp: DateTime<Utc>,
    },

    /// An analysis cycle finished.
    AnalysisComplete {
        insights: usize,
        proposals_created: usize,
        timestamp: DateTime<Utc>,
    },

    /// A proposal was approved.
    ProposalApproved {
        proposal_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A proposal was rejected.
    ProposalRejected {
        proposal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A proposal was marked applied.
    ProposalApplied {
        proposal_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The auto-fix engine started generating a patch.
    FixGenerating {
        fix_id: String,
        proposal_id: String,
        skill: String,
        timestamp: DateTime<Utc>,
    },

    /// A patch is ready for review.
    FixReady {
        fix_id: String,
        skill: String,
        source_file: String,
        timestamp: DateTime<Utc>,
    },

    /// Patch synthesis or application failed terminally.
    FixFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        fix_id: Option<String>,
        proposal_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A fix was approved for application.
    FixApproved {
        fix_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A fix was rejected.
    FixRejected {
        fix_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An applied fix is running the skill's test.
    FixTesting {
        fix_id: String,
        skill: String,
        timestamp: DateTime<Utc>,
    },

    /// A fix passed its test and is deployed.
    FixDeployed {
        fix_id: String,
        skill: String,
        timestamp: DateTime<Utc>,
    },

    /// A fix failed its test and was rolled back.
    FixRolledBack {
        fix_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The apply pipeline finished, deployed or not.
    PipelineComplete {
        fix_id: String,
        deployed: bool,
        timestamp: DateTime<Utc>,
    },
}

impl SupervisionEvent {
    /// Event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RouteMatched { timestamp, .. }
            | Self::RouteMissed { timestamp, .. }
            | Self::SkillSucceeded { timestamp, .. }
            | Self::SkillFailed { timestamp, .. }
            | Self::GatePending { timestamp, .. }
            | Self::VerificationFailed { timestamp, .. }
            | Self::VerificationRejected { timestamp, .. }
            | Self::ProposalCreated { timestamp, .. }
            | Self::AnalysisComplete { timestamp, .. }
            | Self::ProposalApproved { timestamp, .. }
            | Self::ProposalRejected { timestamp, .. }
            | Self::ProposalApplied { timestamp, .. }
            | Self::FixGenerating { timestamp, .. }
            | Self::FixReady { timestamp, .. }
            | Self::FixFailed { timestamp, .. }
            | Self::FixApproved { timestamp, .. }
            | Self::FixRejected { timestamp, .. }
            | Self::FixTesting { timestamp, .. }
            | Self::FixDeployed { timestamp, .. }
            | Self::FixRolledBack { timestamp, .. }
            | Self::PipelineComplete { timestamp, .. } => *timestamp,
        }
    }

    /// Stable event-type string, the chat-surface contract.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RouteMatched { .. } => "match",
            Self::RouteMissed { .. } => "no-match",
            Self::SkillSucceeded { .. } => "success",
            Self::SkillFailed { .. } => "error",
            Self::GatePending { .. } => "gate-pending",
            Self::VerificationFailed { .. } => "verification-failed",
            Self::VerificationRejected { .. } => "verification-rejected",
            Self::ProposalCreated { .. } => "new-proposal",
            Self::AnalysisComplete { .. } => "analysis-complete",
            Self::ProposalApproved { .. } => "proposal-approved",
            Self::ProposalRejected { .. } => "proposal-rejected",
            Self::ProposalApplied { .. } => "proposal-applied",
            Self::FixGenerating { .. } => "fix-generating",
            Self::FixReady { .. } => "fix-ready",
            Self::FixFailed { .. } => "fix-failed",
            Self::FixApproved { .. } => "fix-approved",
            Self::FixRejected { .. } => "fix-rejected",
            Self::FixTesting { .. } => "fix-testing",
            Self::FixDeployed { .. } => "fix-deployed",
            Self::FixRolledBack { .. } => "fix-rolled-back",
            Self::PipelineComplete { .. } => "pipeline-complete",
        }
    }

    /// The skill this event concerns, when skill-scoped.
    pub fn skill(&self) -> Option<&str> {
        match self {
            Self::RouteMatched { skill, .. }
            | Self::SkillSucceeded { skill, .. }
            | Self::SkillFailed { skill, .. }
            | Self::GatePending { skill, .. }
            | Self::VerificationFailed { skill, .. }
            | Self::VerificationRejected { skill, .. }
            | Self::FixGenerating { skill, .. }
            | Self::FixReady { skill, .. }
            | Self::FixTesting { skill, .. }
            | Self::FixDeployed { skill, .. } => Some(skill),
            Self::ProposalCreated { skill, .. } => skill.as_deref(),
            _ => None,
        }
    }

    /// Gate identifier, for gate-pending events.
    pub fn gate_id(&self) -> Option<&str> {
        match self {
            Self::GatePending { gate_id, .. } => Some(gate_id),
            _ => None,
        }
    }
}

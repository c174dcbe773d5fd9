//! Outcome capture for skill executions.
//!
//! The logger is the leaf capability of the supervision core: the router
//! wraps every handler invocation through it, the gates mirror their
//! decisions into it, and the improvement loop mines it for recurring
//! failures. It never holds references back into those components.
//!
//! 1. **Types** (`types.rs`): the tagged outcome record and the error
//!    triple handlers surface.
//! 2. **Classifier** (`classifier.rs`): deterministic classification
//!    cascade and severity inference.
//! 3. **Fingerprint** (`fingerprint.rs`): environment-invariant stack
//!    hashing for root-cause identity.
//! 4. **Logger** (`logger.rs`): capture, wrapped execution, day-file
//!    persistence, occurrence counting, queries, and reports.

pub mod classifier;
pub mod fingerprint;
pub mod logger;
pub mod types;

pub use classifier::{classify, infer_severity};
pub use fingerprint::{stack_fingerprint, NO_STACK};
pub use logger::{
    CaptureContext, CriticalCallback, ErrorLogger, ErrorReport, LogError, LogResult, LoggerConfig,
    QueryFilter, RecurringError, SkillOutcome, ThresholdCallback,
};
pub use types::{
    new_record_id, summarize_input, truncate_utf8, ErrorClass, OutcomeRecord, Severity, SkillError,
};

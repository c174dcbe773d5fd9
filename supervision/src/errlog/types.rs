//! Outcome record model — every skill execution attempt leaves one record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum length of a serialized input summary.
pub const INPUT_SUMMARY_MAX: usize = 500;

/// Error classification taxonomy, surfaced verbatim in records and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Syntax,
    Logic,
    Api,
    Dependency,
    Timeout,
    Permission,
    Validation,
    Network,
    Unknown,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Logic => write!(f, "logic"),
            Self::Api => write!(f, "api"),
            Self::Dependency => write!(f, "dependency"),
            Self::Timeout => write!(f, "timeout"),
            Self::Permission => write!(f, "permission"),
            Self::Validation => write!(f, "validation"),
            Self::Network => write!(f, "network"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Severity of a captured error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Error surfaced by a skill handler.
///
/// Carries the JS-style error triple the classifier and fingerprinter
/// operate on: a name (e.g. `TypeError`), a message, and an optional stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SkillError {
    /// Create an error with a name and message, no stack.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for SkillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for SkillError {}

/// One persisted outcome record. Serialized as one line of JSON in the
/// daily log file, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeRecord {
    /// A captured skill failure.
    Error {
        id: String,
        timestamp: DateTime<Utc>,
        classification: ErrorClass,
        severity: Severity,
        skill: String,
        agent: String,
        message: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        fingerprint: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_summary: Option<String>,
        occurrence_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// A successful skill execution.
    Success {
        id: String,
        timestamp: DateTime<Utc>,
        skill: String,
        agent: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_summary: Option<String>,
    },

    /// A note that a fix was recorded against an error fingerprint.
    FixNote {
        id: String,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skill: Option<String>,
        fingerprint: String,
        note: String,
    },

    /// A resolved verification gate, mirrored into the outcome log.
    GateDecision {
        id: String,
        timestamp: DateTime<Utc>,
        gate: String,
        skill: String,
        status: String,
        risk: String,
    },
}

impl OutcomeRecord {
    /// Record identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::Error { id, .. }
            | Self::Success { id, .. }
            | Self::FixNote { id, .. }
            | Self::GateDecision { id, .. } => id,
        }
    }

    /// Record timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Error { timestamp, .. }
            | Self::Success { timestamp, .. }
            | Self::FixNote { timestamp, .. }
            | Self::GateDecision { timestamp, .. } => *timestamp,
        }
    }

    /// Skill the record belongs to, when skill-scoped.
    pub fn skill(&self) -> Option<&str> {
        match self {
            Self::Error { skill, .. }
            | Self::Success { skill, .. }
            | Self::GateDecision { skill, .. } => Some(skill),
            Self::FixNote { skill, .. } => skill.as_deref(),
        }
    }

    /// Error fingerprint, for error and fix-note records.
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Self::Error { fingerprint, .. } | Self::FixNote { fingerprint, .. } => {
                Some(fingerprint)
            }
            _ => None,
        }
    }

    /// Error classification, for error records.
    pub fn classification(&self) -> Option<ErrorClass> {
        match self {
            Self::Error { classification, .. } => Some(*classification),
            _ => None,
        }
    }

    /// Occurrence count at capture time, for error records.
    pub fn occurrence_count(&self) -> Option<u32> {
        match self {
            Self::Error {
                occurrence_count, ..
            } => Some(*occurrence_count),
            _ => None,
        }
    }

    /// Whether this is an error record.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Generate a random 12-hex-character record identifier.
pub fn new_record_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Truncate a string to at most `max` bytes on a char boundary.
pub fn truncate_utf8(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Serialize an input value and truncate it for storage in a record.
pub fn summarize_input(input: &Value) -> String {
    let mut text = serde_json::to_string(input).unwrap_or_default();
    truncate_utf8(&mut text, INPUT_SUMMARY_MAX);
    text
}

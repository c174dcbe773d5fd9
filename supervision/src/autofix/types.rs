//! Fix records: one concrete source patch per proposal, shepherded
//! through backup, apply, test, and optional rollback.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errlog::new_record_id;

/// Lifecycle of a fix. Monotonic except for `Applying → RolledBack` on
/// test failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Generating,
    Ready,
    Approved,
    Applying,
    Testing,
    Deployed,
    Failed,
    RolledBack,
    Rejected,
}

impl std::fmt::Display for FixStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generating => write!(f, "generating"),
            Self::Ready => write!(f, "ready"),
            Self::Approved => write!(f, "approved"),
            Self::Applying => write!(f, "applying"),
            Self::Testing => write!(f, "testing"),
            Self::Deployed => write!(f, "deployed"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A concrete source patch tracked through the apply pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fix {
    pub id: String,
    pub proposal_id: String,
    pub skill: String,
    pub status: FixStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_results: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    /// Fingerprint of the error family this fix targets, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Fix {
    /// Create a fix record in the `Generating` state.
    pub fn generating(proposal_id: &str, skill: &str) -> Self {
        Self {
            id: new_record_id(),
            proposal_id: proposal_id.to_string(),
            skill: skill.to_string(),
            status: FixStatus::Generating,
            source_file: None,
            original_code: None,
            fixed_code: None,
            diff: None,
            explanation: None,
            test_results: None,
            backup_path: None,
            fingerprint: None,
            created_at: Utc::now(),
            approved_at: None,
            deployed_at: None,
            rejected_at: None,
            failure_reason: None,
        }
    }
}

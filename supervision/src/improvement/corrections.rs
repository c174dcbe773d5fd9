//! User corrections: the explicit teaching signal.
//!
//! Corrections never mutate or self-delete; the pattern hash groups
//! semantically equivalent corrections across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errlog::new_record_id;
use crate::gates::md5_10;

/// One recorded correction of a skill's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub id: String,
    pub skill: String,
    /// Summary of what the skill produced.
    pub original: Value,
    /// Summary of what it should have produced.
    pub corrected: Value,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub pattern_hash: String,
}

impl Correction {
    pub fn new(
        skill: impl Into<String>,
        original: Value,
        corrected: Value,
        reason: impl Into<String>,
        context: Option<Value>,
    ) -> Self {
        let skill = skill.into();
        let reason = reason.into();
        let pattern_hash = correction_pattern_hash(&skill, &reason);
        Self {
            id: new_record_id(),
            skill,
            original,
            corrected,
            reason,
            context,
            timestamp: Utc::now(),
            pattern_hash,
        }
    }
}

/// Pattern hash for a correction: `md5_10(skill + lowercased_trimmed(reason))`.
pub fn correction_pattern_hash(skill: &str, reason: &str) -> String {
    md5_10(&format!("{skill}{}", reason.trim().to_lowercase()))
}

/// User feedback on a skill's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackRating {
    /// A 1–5 star rating.
    Score(u8),
    ThumbsUp,
    ThumbsDown,
}

impl FeedbackRating {
    /// Negative feedback is translated into an anonymous correction.
    pub fn is_negative(&self) -> bool {
        match self {
            Self::Score(score) => *score <= 2,
            Self::ThumbsDown => true,
            Self::ThumbsUp => false,
        }
    }
}

/// Case-insensitive mode of the reasons in a correction group.
pub fn common_reason(corrections: &[&Correction]) -> String {
    let mut counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for correction in corrections {
        *counts
            .entry(correction.reason.trim().to_lowercase())
            .or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(reason, _)| reason)
        .unwrap_or_default()
}

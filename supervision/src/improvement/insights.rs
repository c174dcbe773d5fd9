//! Typed insights produced by an analysis cycle.
//!
//! Insights are regenerated from scratch on every cycle; they are never
//! authoritative state across cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errlog::new_record_id;

/// What kind of observation an insight encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    ErrorPattern,
    CorrectionPattern,
    RiskAdjustment,
    NewRoute,
    Performance,
    UnusedRoute,
    AutoFix,
    SkillUpdate,
}

impl std::fmt::Display for InsightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ErrorPattern => write!(f, "error_pattern"),
            Self::CorrectionPattern => write!(f, "correction_pattern"),
            Self::RiskAdjustment => write!(f, "risk_adjustment"),
            Self::NewRoute => write!(f, "new_route"),
            Self::Performance => write!(f, "performance"),
            Self::UnusedRoute => write!(f, "unused_route"),
            Self::AutoFix => write!(f, "auto_fix"),
            Self::SkillUpdate => write!(f, "skill_update"),
        }
    }
}

/// Insight severity, ordered for report sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightSeverity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for InsightSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// One detected pattern, with its supporting data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub insight_type: InsightType,
    pub severity: InsightSeverity,
    /// The skill concerned, when skill-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    pub message: String,
    /// Structured supporting data (fingerprints, counts, patterns).
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Insight {
    pub fn new(
        insight_type: InsightType,
        severity: InsightSeverity,
        skill: Option<String>,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: new_record_id(),
            insight_type,
            severity,
            skill,
            message: message.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severity_ordering() {
        assert!(InsightSeverity::High > InsightSeverity::Medium);
        assert!(InsightSeverity::Medium > InsightSeverity::Low);
    }

    #[test]
    fn test_insight_serde_roundtrip() {
        let insight = Insight::new(
            InsightType::ErrorPattern,
            InsightSeverity::Medium,
            Some("token-audit".to_string()),
            "Recurring network error",
            json!({ "fingerprint": "abc123def456", "count": 4 }),
        );
        let json = serde_json::to_string(&insight).unwrap();
        assert!(json.contains("\"insight_type\":\"error_pattern\""));
        let parsed: Insight = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.insight_type, InsightType::ErrorPattern);
        assert_eq!(parsed.skill.as_deref(), Some("token-audit"));
    }
}

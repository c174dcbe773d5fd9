//! Approval-tracked proposals derived from insights.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::insights::{Insight, InsightSeverity, InsightType};
use crate::errlog::new_record_id;

/// Lifecycle status of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    Expired,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Applied => write!(f, "applied"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// The action a proposal suggests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalAction {
    AddErrorHandling,
    UpdateSkillLogic,
    AdjustRiskLevel,
    AddNewRoute,
    OptimizePerformance,
    ReviewUnusedRoute,
    ManualReview,
}

impl std::fmt::Display for ProposalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddErrorHandling => write!(f, "add_error_handling"),
            Self::UpdateSkillLogic => write!(f, "update_skill_logic"),
            Self::AdjustRiskLevel => write!(f, "adjust_risk_level"),
            Self::AddNewRoute => write!(f, "add_new_route"),
            Self::OptimizePerformance => write!(f, "optimize_performance"),
            Self::ReviewUnusedRoute => write!(f, "review_unused_route"),
            Self::ManualReview => write!(f, "manual_review"),
        }
    }
}

/// Estimated effort to carry out a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
    Unknown,
}

/// Map an insight type to its action kind, effort, and implementation hint.
pub fn action_for(insight_type: InsightType) -> (ProposalAction, Effort, &'static str) {
    match insight_type {
        InsightType::ErrorPattern => (
            ProposalAction::AddErrorHandling,
            Effort::Medium,
            "Add targeted error handling (retry, fallback, clearer message) around the failing call",
        ),
        InsightType::CorrectionPattern => (
            ProposalAction::UpdateSkillLogic,
            Effort::High,
            "Update the skill's logic to incorporate the repeated user correction",
        ),
        InsightType::RiskAdjustment => (
            ProposalAction::AdjustRiskLevel,
            Effort::Low,
            "Adjust the route's declared risk level (auto-applicable)",
        ),
        InsightType::NewRoute => (
            ProposalAction::AddNewRoute,
            Effort::Medium,
            "Add a route covering the unmatched message cluster",
        ),
        InsightType::Performance => (
            ProposalAction::OptimizePerformance,
            Effort::Medium,
            "Profile the skill and optimize the slow or failing path",
        ),
        InsightType::UnusedRoute => (
            ProposalAction::ReviewUnusedRoute,
            Effort::Low,
            "Review whether the route should be kept, merged, or removed",
        ),
        InsightType::AutoFix | InsightType::SkillUpdate => (
            ProposalAction::ManualReview,
            Effort::Unknown,
            "Review manually; no automated action is defined for this insight",
        ),
    }
}

/// A structured suggestion tracked through an approval lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub insight_type: InsightType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    pub severity: InsightSeverity,
    pub status: ProposalStatus,
    pub action: ProposalAction,
    pub description: String,
    /// Human hint about how to carry the proposal out.
    pub implementation: String,
    pub effort: Effort,
    /// Supporting data carried over from the insight (fingerprint,
    /// pattern hash, cluster members).
    pub data: Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Proposal {
    /// Build a pending proposal from an insight, per the action table.
    pub fn from_insight(insight: &Insight) -> Self {
        let (action, effort, implementation) = action_for(insight.insight_type);
        Self {
            id: new_record_id(),
            insight_type: insight.insight_type,
            skill: insight.skill.clone(),
            severity: insight.severity,
            status: ProposalStatus::Pending,
            action,
            description: insight.message.clone(),
            implementation: implementation.to_string(),
            effort,
            data: insight.data.clone(),
            created_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
            applied_at: None,
            notes: None,
            rejection_reason: None,
        }
    }
}

/// Filter for proposal listings. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub status: Option<ProposalStatus>,
    pub skill: Option<String>,
    pub severity: Option<InsightSeverity>,
}

impl ProposalFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(ProposalStatus::Pending),
            ..Self::default()
        }
    }

    pub fn matches(&self, proposal: &Proposal) -> bool {
        if let Some(status) = self.status {
            if proposal.status != status {
                return false;
            }
        }
        if let Some(ref skill) = self.skill {
            if proposal.skill.as_deref() != Some(skill.as_str()) {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if proposal.severity != severity {
                return false;
            }
        }
        true
    }
}

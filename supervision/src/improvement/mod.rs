//! The self-improvement loop: mines errors, corrections, gate decisions,
//! and route analytics into typed insights and approval-tracked proposals.
//!
//! 1. **Corrections** (`corrections.rs`): the explicit teaching signal and
//!    its pattern hash.
//! 2. **Insights** (`insights.rs`): typed observations, rebuilt from
//!    scratch each cycle.
//! 3. **Clustering** (`clustering.rs`): greedy grouping of unmatched
//!    messages into new-route candidates.
//! 4. **Proposals** (`proposals.rs`): the action table and approval
//!    lifecycle.
//! 5. **Metrics** (`metrics.rs`): per-cycle snapshots and the error-rate
//!    trend.
//! 6. **Loop** (this file): the analysis passes, proposal generation with
//!    the pending-uniqueness invariant, and persistence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod clustering;
pub mod corrections;
pub mod insights;
pub mod metrics;
pub mod proposals;

pub use clustering::{cluster_messages, MessageCluster};
pub use corrections::{common_reason, correction_pattern_hash, Correction, FeedbackRating};
pub use insights::{Insight, InsightSeverity, InsightType};
pub use metrics::{compute_trend, MetricsSnapshot, Trend, METRICS_CAPACITY};
pub use proposals::{
    action_for, Effort, Proposal, ProposalAction, ProposalFilter, ProposalStatus,
};

use crate::errlog::{ErrorLogger, LogError};
use crate::events::{SharedEventBus, SupervisionEvent};
use crate::gates::{GateError, VerificationGates};
use crate::router::WorkflowRouter;

/// Errors above this count escalate an error-pattern insight to high.
const HIGH_SEVERITY_COUNT: u32 = 10;

/// Errors per skill above which a performance insight fires.
const SKILL_ERROR_MIN: u64 = 5;

/// Success percentage below which a route is underperforming.
const SUCCESS_RATE_MIN: f64 = 80.0;

/// Executions required before a route's success rate is judged.
const ROUTE_EXECUTION_MIN: u64 = 5;

/// Average duration above which a route is slow, in milliseconds.
const SLOW_ROUTE_MS: u64 = 5_000;

/// Plan-gate expiry fraction above which longer timeouts are suggested.
const EXPIRY_RATE_MAX: f64 = 0.3;

/// Cluster size required for a new-route insight.
const CLUSTER_MIN: usize = 3;

/// Unmatched examples carried in a new-route insight.
const CLUSTER_EXAMPLES: usize = 5;

/// Errors from the improvement loop.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// Failed to read a file from disk.
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a file to disk.
    #[error("Failed to write {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize or parse JSON data.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// No proposal exists with this id.
    #[error("Unknown proposal '{0}'")]
    ProposalNotFound(String),

    /// The logger could not be read or written.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Gate statistics could not be read.
    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Result type alias for improvement-loop operations.
pub type LoopResult<T> = Result<T, LoopError>;

/// Configuration for the improvement loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Directory for corrections, proposals, insights, and metrics files.
    pub data_dir: PathBuf,
    /// Fingerprint count at which an error-pattern insight fires.
    pub error_threshold: u32,
    /// Corrections sharing a pattern hash required for a proposal.
    pub correction_threshold: usize,
    /// Gate rejections per skill required for a raise-risk insight.
    pub rejection_threshold: u64,
    /// Unmatched messages required before clustering runs.
    pub miss_threshold: usize,
    /// Default analysis lookback, in days.
    pub lookback_days: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("improvement-data"),
            error_threshold: 3,
            correction_threshold: 3,
            rejection_threshold: 3,
            miss_threshold: 5,
            lookback_days: 7,
        }
    }
}

/// Output of one analysis cycle.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub insights: Vec<Insight>,
    pub new_proposals: Vec<Proposal>,
}

/// The self-improvement loop engine.
pub struct SelfImprovementLoop {
    config: LoopConfig,
    corrections: Mutex<Vec<Correction>>,
    proposals: Mutex<Vec<Proposal>>,
    insights: Mutex<Vec<Insight>>,
    metrics: Mutex<Vec<MetricsSnapshot>>,
    logger: Arc<ErrorLogger>,
    router: Option<Arc<WorkflowRouter>>,
    gates: Option<Arc<VerificationGates>>,
    bus: SharedEventBus,
}

impl SelfImprovementLoop {
    /// Create a loop over a data directory, loading persisted state.
    pub fn new(
        config: LoopConfig,
        logger: Arc<ErrorLogger>,
        bus: SharedEventBus,
    ) -> LoopResult<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| LoopError::FileWrite {
            path: config.data_dir.clone(),
            source: e,
        })?;
        let corrections = load_json_array(&config.data_dir.join("corrections.json"))?;
        let proposals = load_json_array(&config.data_dir.join("proposals.json"))?;
        let insights = load_json_array(&config.data_dir.join("insights.json"))?;
        let metrics = load_json_array(&config.data_dir.join("metrics-history.json"))?;
        Ok(Self {
            config,
            corrections: Mutex::new(corrections),
            proposals: Mutex::new(proposals),
            insights: Mutex::new(insights),
            metrics: Mutex::new(metrics),
            logger,
            router: None,
            gates: None,
            bus,
        })
    }

    /// Attach the router for analytics-driven passes.
    pub fn with_router(mut self, router: Arc<WorkflowRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Attach the gates for decision-statistics passes.
    pub fn with_gates(mut self, gates: Arc<VerificationGates>) -> Self {
        self.gates = Some(gates);
        self
    }

    /// Create a shared reference to this loop.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    // ------------------------------------------------------------------
    // Corrections and feedback
    // ------------------------------------------------------------------

    /// Record a user correction. When enough corrections share a pattern
    /// hash, a proposal is created immediately, outside the periodic cycle.
    pub async fn record_correction(
        &self,
        skill: &str,
        original: Value,
        corrected: Value,
        reason: &str,
        context: Option<Value>,
    ) -> LoopResult<Correction> {
        let correction = Correction::new(skill, original, corrected, reason, context);
        let pattern_hash = correction.pattern_hash.clone();

        let group: Vec<Correction> = {
            let mut corrections = self.corrections.lock().await;
            corrections.push(correction.clone());
            self.save_corrections(&corrections)?;
            corrections
                .iter()
                .filter(|c| c.pattern_hash == pattern_hash)
                .cloned()
                .collect()
        };
        info!(skill, pattern_hash = %pattern_hash, count = group.len(), "correction recorded");

        if group.len() >= self.config.correction_threshold {
            self.create_correction_proposal(skill, &pattern_hash, &group)
                .await?;
        }
        Ok(correction)
    }

    /// Record user feedback. Negative feedback becomes an anonymous
    /// correction carrying the comment.
    pub async fn record_feedback(
        &self,
        skill: &str,
        rating: FeedbackRating,
        comment: &str,
    ) -> LoopResult<Option<Correction>> {
        if !rating.is_negative() {
            return Ok(None);
        }
        let correction = self
            .record_correction(skill, Value::Null, Value::Null, comment, None)
            .await?;
        Ok(Some(correction))
    }

    /// All recorded corrections.
    pub async fn corrections(&self) -> Vec<Correction> {
        self.corrections.lock().await.clone()
    }

    /// Most recent corrections for one skill, newest first.
    pub async fn corrections_for_skill(&self, skill: &str, limit: usize) -> Vec<Correction> {
        self.corrections
            .lock()
            .await
            .iter()
            .rev()
            .filter(|c| c.skill == skill)
            .take(limit)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Analysis
    // ------------------------------------------------------------------

    /// Run one analysis cycle: rebuild insights, generate proposals,
    /// snapshot metrics.
    pub async fn analyze(&self, lookback_days: Option<u32>) -> LoopResult<AnalysisReport> {
        let days = lookback_days.unwrap_or(self.config.lookback_days);
        let mut insights = Vec::new();

        // 1. Recurring error fingerprints.
        let counts = self.logger.occurrence_counts().await;
        let recurring = self.logger.recurring_errors(counts.len().max(1)).await?;
        for entry in &recurring {
            if entry.count < self.config.error_threshold {
                continue;
            }
            let severity = if entry.count > HIGH_SEVERITY_COUNT {
                InsightSeverity::High
            } else {
                InsightSeverity::Medium
            };
            let (skill, classification, message) = match &entry.last_seen {
                Some(record) => (
                    record.skill().map(String::from),
                    record.classification().map(|c| c.to_string()),
                    record_message(record),
                ),
                None => (None, None, None),
            };
            insights.push(Insight::new(
                InsightType::ErrorPattern,
                severity,
                skill.clone(),
                format!(
                    "Error recurring {}x{}: {}",
                    entry.count,
                    skill
                        .as_deref()
                        .map(|s| format!(" in {s}"))
                        .unwrap_or_default(),
                    message.as_deref().unwrap_or("(no recent record)"),
                ),
                json!({
                    "fingerprint": entry.fingerprint,
                    "count": entry.count,
                    "classification": classification,
                    "message": message,
                }),
            ));
        }

        // 2. Skill error rates.
        let report = self.logger.report(days)?;
        for (skill, errors) in &report.by_skill {
            if *errors > SKILL_ERROR_MIN {
                insights.push(Insight::new(
                    InsightType::Performance,
                    InsightSeverity::Medium,
                    Some(skill.clone()),
                    format!("Skill {skill} produced {errors} errors in the last {days} days"),
                    json!({ "error_count": errors, "days": days }),
                ));
            }
        }

        // 3. Correction patterns.
        {
            let corrections = self.corrections.lock().await;
            let cutoff = Utc::now() - Duration::days(i64::from(days));
            let mut by_hash: std::collections::HashMap<&str, Vec<&Correction>> =
                std::collections::HashMap::new();
            for correction in corrections.iter().filter(|c| c.timestamp >= cutoff) {
                by_hash
                    .entry(correction.pattern_hash.as_str())
                    .or_default()
                    .push(correction);
            }
            let mut hashes: Vec<_> = by_hash.into_iter().collect();
            hashes.sort_by_key(|(hash, _)| *hash);
            for (hash, group) in hashes {
                if group.len() < self.config.correction_threshold {
                    continue;
                }
                let reason = common_reason(&group);
                insights.push(Insight::new(
                    InsightType::CorrectionPattern,
                    InsightSeverity::High,
                    Some(group[0].skill.clone()),
                    format!(
                        "Skill {} corrected {} times for the same reason: {}",
                        group[0].skill,
                        group.len(),
                        reason
                    ),
                    json!({
                        "patternHash": hash,
                        "count": group.len(),
                        "commonReason": reason,
                    }),
                ));
            }
        }

        // 4. Gate-driven risk adjustments.
        if let Some(gates) = &self.gates {
            let stats = gates.statistics(days)?;
            for skill in &stats.auto_approval_candidates {
                insights.push(Insight::new(
                    InsightType::RiskAdjustment,
                    InsightSeverity::Low,
                    Some(skill.clone()),
                    format!("Skill {skill} is consistently approved; risk could be lowered"),
                    json!({ "direction": "lower" }),
                ));
            }
            let mut skills: Vec<_> = stats.per_skill.iter().collect();
            skills.sort_by_key(|(skill, _)| skill.as_str());
            for (skill, counts) in skills {
                if counts.rejected >= self.config.rejection_threshold {
                    insights.push(Insight::new(
                        InsightType::RiskAdjustment,
                        InsightSeverity::Medium,
                        Some(skill.clone()),
                        format!(
                            "Skill {skill} was rejected {} times; risk should be raised",
                            counts.rejected
                        ),
                        json!({ "direction": "raise", "rejections": counts.rejected }),
                    ));
                }
            }
            let expiry_rate = stats.plan_gate_expiry_rate();
            if expiry_rate > EXPIRY_RATE_MAX {
                insights.push(Insight::new(
                    InsightType::SkillUpdate,
                    InsightSeverity::Low,
                    None,
                    format!(
                        "{:.0}% of plan gates expire; consider longer approval timeouts",
                        expiry_rate * 100.0
                    ),
                    json!({ "expiry_rate": expiry_rate }),
                ));
            }
        }

        // 5. Route performance and unused routes.
        if let Some(router) = &self.router {
            let summary = router.analytics_summary().await;
            let mut routes: Vec<_> = summary.routes.iter().collect();
            routes.sort_by_key(|(name, _)| name.as_str());
            for (name, route) in routes {
                if route.executions.total > ROUTE_EXECUTION_MIN
                    && route.success_rate < SUCCESS_RATE_MIN
                {
                    insights.push(Insight::new(
                        InsightType::Performance,
                        InsightSeverity::Medium,
                        Some(name.clone()),
                        format!(
                            "Route {name} succeeds only {:.1}% of the time over {} executions",
                            route.success_rate, route.executions.total
                        ),
                        json!({
                            "success_rate": route.success_rate,
                            "executions": route.executions.total,
                        }),
                    ));
                }
                if route.avg_duration_ms > SLOW_ROUTE_MS {
                    insights.push(Insight::new(
                        InsightType::Performance,
                        InsightSeverity::Low,
                        Some(name.clone()),
                        format!(
                            "Route {name} averages {}ms per execution",
                            route.avg_duration_ms
                        ),
                        json!({ "avg_duration_ms": route.avg_duration_ms }),
                    ));
                }
            }
            for name in router.route_names().await {
                if !summary.routes.contains_key(&name) {
                    insights.push(Insight::new(
                        InsightType::UnusedRoute,
                        InsightSeverity::Low,
                        Some(name.clone()),
                        format!("Route {name} has never been hit or executed"),
                        json!({}),
                    ));
                }
            }

            // 6. Unmatched-message clusters.
            let ring = router.unmatched_messages().await;
            if ring.len() >= self.config.miss_threshold {
                let messages: Vec<String> = ring.iter().map(|m| m.message.clone()).collect();
                for cluster in cluster_messages(&messages) {
                    if cluster.members.len() < CLUSTER_MIN {
                        continue;
                    }
                    let examples: Vec<&String> =
                        cluster.members.iter().take(CLUSTER_EXAMPLES).collect();
                    insights.push(Insight::new(
                        InsightType::NewRoute,
                        InsightSeverity::Medium,
                        None,
                        format!(
                            "{} unmatched messages look alike; a route may be missing: \"{}\"",
                            cluster.members.len(),
                            cluster.representative
                        ),
                        json!({
                            "representative": cluster.representative,
                            "examples": examples,
                            "suggested_pattern": cluster.suggested_pattern(),
                            "count": cluster.members.len(),
                        }),
                    ));
                }
            }
        }

        let new_proposals = self.generate_proposals(&insights).await?;

        {
            let mut stored = self.insights.lock().await;
            *stored = insights.clone();
            save_json_array(&self.config.data_dir.join("insights.json"), &stored)?;
        }

        self.snapshot_metrics(&insights, &report).await?;

        self.bus.publish(SupervisionEvent::AnalysisComplete {
            insights: insights.len(),
            proposals_created: new_proposals.len(),
            timestamp: Utc::now(),
        });
        info!(
            insights = insights.len(),
            proposals = new_proposals.len(),
            "analysis cycle complete"
        );

        Ok(AnalysisReport {
            insights,
            new_proposals,
        })
    }

    /// Insights from the last analysis cycle.
    pub async fn recent_insights(&self) -> Vec<Insight> {
        self.insights.lock().await.clone()
    }

    // ------------------------------------------------------------------
    // Proposal management
    // ------------------------------------------------------------------

    /// List proposals matching a filter, sorted high → low severity.
    pub async fn list_proposals(&self, filter: &ProposalFilter) -> Vec<Proposal> {
        let mut matching: Vec<Proposal> = self
            .proposals
            .lock()
            .await
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.severity.cmp(&a.severity));
        matching
    }

    /// Fetch one proposal by id.
    pub async fn get_proposal(&self, id: &str) -> Option<Proposal> {
        self.proposals.lock().await.iter().find(|p| p.id == id).cloned()
    }

    /// Approve a pending proposal.
    pub async fn approve_proposal(&self, id: &str) -> LoopResult<Proposal> {
        let proposal = self
            .update_proposal(id, |proposal| {
                proposal.status = ProposalStatus::Approved;
                proposal.approved_at = Some(Utc::now());
            })
            .await?;
        self.bus.publish(SupervisionEvent::ProposalApproved {
            proposal_id: id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(proposal)
    }

    /// Reject a proposal with an optional reason.
    pub async fn reject_proposal(&self, id: &str, reason: Option<String>) -> LoopResult<Proposal> {
        let reason_clone = reason.clone();
        let proposal = self
            .update_proposal(id, move |proposal| {
                proposal.status = ProposalStatus::Rejected;
                proposal.rejected_at = Some(Utc::now());
                proposal.rejection_reason = reason_clone.clone();
            })
            .await?;
        self.bus.publish(SupervisionEvent::ProposalRejected {
            proposal_id: id.to_string(),
            reason,
            timestamp: Utc::now(),
        });
        Ok(proposal)
    }

    /// Mark a proposal applied, with optional notes.
    pub async fn mark_applied(&self, id: &str, notes: Option<String>) -> LoopResult<Proposal> {
        let notes_clone = notes.clone();
        let proposal = self
            .update_proposal(id, move |proposal| {
                proposal.status = ProposalStatus::Applied;
                proposal.applied_at = Some(Utc::now());
                proposal.notes = notes_clone.clone();
            })
            .await?;
        self.bus.publish(SupervisionEvent::ProposalApplied {
            proposal_id: id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(proposal)
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// The retained metrics history, oldest first.
    pub async fn metrics_history(&self) -> Vec<MetricsSnapshot> {
        self.metrics.lock().await.clone()
    }

    /// Error-rate trend over recent snapshots.
    pub async fn trend(&self) -> Trend {
        compute_trend(&self.metrics.lock().await)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn create_correction_proposal(
        &self,
        skill: &str,
        pattern_hash: &str,
        group: &[Correction],
    ) -> LoopResult<()> {
        let refs: Vec<&Correction> = group.iter().collect();
        let reason = common_reason(&refs);
        let insight = Insight::new(
            InsightType::CorrectionPattern,
            InsightSeverity::High,
            Some(skill.to_string()),
            format!(
                "Skill {skill} corrected {} times for the same reason: {reason}",
                group.len()
            ),
            json!({
                "patternHash": pattern_hash,
                "count": group.len(),
                "commonReason": reason,
            }),
        );

        let created = {
            let mut proposals = self.proposals.lock().await;
            let duplicate = proposals.iter().any(|p| {
                p.status == ProposalStatus::Pending
                    && p.insight_type == InsightType::CorrectionPattern
                    && (p.skill.as_deref() == Some(skill)
                        || p.data.get("patternHash").and_then(Value::as_str)
                            == Some(pattern_hash))
            });
            if duplicate {
                debug!(skill, pattern_hash, "correction proposal already pending");
                None
            } else {
                let proposal = Proposal::from_insight(&insight);
                proposals.push(proposal.clone());
                self.save_proposals(&proposals)?;
                Some(proposal)
            }
        };

        if let Some(proposal) = created {
            self.publish_proposal(&proposal);
        }
        Ok(())
    }

    async fn generate_proposals(&self, insights: &[Insight]) -> LoopResult<Vec<Proposal>> {
        let created: Vec<Proposal> = {
            let mut proposals = self.proposals.lock().await;
            let mut created = Vec::new();
            for insight in insights {
                let duplicate = proposals.iter().any(|p| {
                    p.status == ProposalStatus::Pending
                        && p.insight_type == insight.insight_type
                        && p.skill == insight.skill
                });
                if duplicate {
                    continue;
                }
                let proposal = Proposal::from_insight(insight);
                proposals.push(proposal.clone());
                created.push(proposal);
            }
            if !created.is_empty() {
                self.save_proposals(&proposals)?;
            }
            created
        };
        for proposal in &created {
            self.publish_proposal(proposal);
        }
        Ok(created)
    }

    fn publish_proposal(&self, proposal: &Proposal) {
        self.bus.publish(SupervisionEvent::ProposalCreated {
            proposal_id: proposal.id.clone(),
            skill: proposal.skill.clone(),
            action: proposal.action.to_string(),
            severity: proposal.severity,
            description: proposal.description.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn update_proposal(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Proposal),
    ) -> LoopResult<Proposal> {
        let mut proposals = self.proposals.lock().await;
        let Some(proposal) = proposals.iter_mut().find(|p| p.id == id) else {
            return Err(LoopError::ProposalNotFound(id.to_string()));
        };
        mutate(proposal);
        let updated = proposal.clone();
        self.save_proposals(&proposals)?;
        Ok(updated)
    }

    async fn snapshot_metrics(
        &self,
        insights: &[Insight],
        report: &crate::errlog::ErrorReport,
    ) -> LoopResult<()> {
        let (total_routed, unmatched_count) = match &self.router {
            Some(router) => {
                let summary = router.analytics_summary().await;
                let total = summary.routes.values().map(|r| r.executions.total).sum();
                let unmatched = router.unmatched_messages().await.len();
                (Some(total), Some(unmatched))
            }
            None => (None, None),
        };
        let pending = self
            .proposals
            .lock()
            .await
            .iter()
            .filter(|p| p.status == ProposalStatus::Pending)
            .count();
        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            insight_count: insights.len(),
            pending_proposals: pending,
            correction_count: self.corrections.lock().await.len(),
            error_rate: Some(report.error_rate),
            total_routed,
            unmatched_count,
        };

        let mut metrics = self.metrics.lock().await;
        metrics.push(snapshot);
        while metrics.len() > METRICS_CAPACITY {
            metrics.remove(0);
        }
        save_json_array(&self.config.data_dir.join("metrics-history.json"), &metrics)?;
        Ok(())
    }

    fn save_corrections(&self, corrections: &[Correction]) -> LoopResult<()> {
        save_json_array(&self.config.data_dir.join("corrections.json"), corrections)
    }

    fn save_proposals(&self, proposals: &[Proposal]) -> LoopResult<()> {
        save_json_array(&self.config.data_dir.join("proposals.json"), proposals)
    }
}

fn record_message(record: &crate::errlog::OutcomeRecord) -> Option<String> {
    match record {
        crate::errlog::OutcomeRecord::Error { message, .. } => Some(message.clone()),
        _ => None,
    }
}

fn load_json_array<T: DeserializeOwned>(path: &Path) -> LoopResult<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path).map_err(|e| LoopError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_str(&data)?)
}

fn save_json_array<T: Serialize>(path: &Path, items: &[T]) -> LoopResult<()> {
    let data = serde_json::to_string_pretty(items)?;
    std::fs::write(path, data).map_err(|e| LoopError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

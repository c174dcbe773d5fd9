//! Two-stage verification gates: risk-weighted human approval around
//! skill execution.
//!
//! 1. **Policy** (`policy.rs`): the risk → gate table.
//! 2. **Rules** (`rules.rs`): built-in and custom output checks for the
//!    verify gate.
//! 3. **History** (`history.rs`): pattern hashes, auto-pass promotion,
//!    cooldowns.
//! 4. **Audit** (`audit.rs`): day-file audit trail and gate statistics.
//! 5. **Middleware** (`middleware.rs`): the plan gate as a router
//!    pre-middleware.
//! 6. **Gates** (this file): the plan gate, the verify gate, the pending
//!    index with oneshot waiters, the expiration sweeper, and shutdown.
//!
//! Suspension model: each pending gate parks its caller on a oneshot
//! receive bounded by a per-gate timeout (authoritative); a periodic
//! sweeper expires stragglers as a safety net. Many gates may be pending
//! at once. External resolution is idempotent: resolving an absent gate
//! returns false.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod audit;
pub mod history;
pub mod middleware;
pub mod policy;
pub mod rules;

pub use audit::{audit_summary, AuditEntry, AuditTrail, GateStatistics, StatusCounts};
pub use history::{md5_10, plan_pattern_hash, ApprovalHistory, AUTO_PASS_THRESHOLD};
pub use middleware::PlanGateMiddleware;
pub use policy::{policy_for, GatePolicy};
pub use rules::{builtin_rules, rule_fn, run_rules, CheckOutcome, RuleCheck, VerifyRule};

use crate::errlog::{ErrorLogger, LogError};
use crate::events::{SharedEventBus, SupervisionEvent};
use crate::router::RiskLevel;

/// Errors from the verification-gate subsystem.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
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

    /// The logger failed to persist a gate decision.
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Result type alias for gate operations.
pub type GateResult<T> = Result<T, GateError>;

/// Which checkpoint a gate is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateStage {
    /// Pre-execution plan gate.
    #[serde(rename = "gate1")]
    Plan,
    /// Post-execution verify gate.
    #[serde(rename = "gate2")]
    Verify,
}

impl std::fmt::Display for GateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "gate1"),
            Self::Verify => write!(f, "gate2"),
        }
    }
}

/// Terminal state of a gate dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Approved,
    /// Approved with caller-supplied edits.
    Edited,
    Rejected,
    Expired,
    /// Policy does not gate this risk level.
    Skipped,
    /// Bypassed the human loop from prior approval history.
    AutoPassed,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Edited => write!(f, "edited"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
            Self::Skipped => write!(f, "skipped"),
            Self::AutoPassed => write!(f, "auto_passed"),
        }
    }
}

/// A plan submitted to the pre-execution gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub description: String,
    /// Structured steps; when present these define the pattern identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
}

impl PlanSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            steps: None,
            rollback: None,
            risk: None,
        }
    }

    pub fn with_steps(mut self, steps: Value) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_rollback(mut self, rollback: impl Into<String>) -> Self {
        self.rollback = Some(rollback.into());
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = Some(risk);
        self
    }
}

/// Caller context for a gate dispatch.
#[derive(Debug, Clone, Default)]
pub struct GateContext {
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
    pub risk: Option<RiskLevel>,
    /// Input the skill ran against; enables the input-reflection rule.
    pub original_input: Option<Value>,
}

impl GateContext {
    pub fn with_risk(risk: RiskLevel) -> Self {
        Self {
            risk: Some(risk),
            ..Self::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.original_input = Some(input);
        self
    }
}

/// How a gate dispatch resolved.
#[derive(Debug, Clone)]
pub struct GateResolution {
    /// Set when a pending gate was created.
    pub gate_id: Option<String>,
    pub status: GateStatus,
    pub reason: Option<String>,
    /// Edits supplied with an approval.
    pub edits: Option<Value>,
    /// Verify-gate checks, in declaration order.
    pub checks: Vec<RuleCheck>,
}

impl GateResolution {
    fn of(status: GateStatus) -> Self {
        Self {
            gate_id: None,
            status,
            reason: None,
            edits: None,
            checks: Vec::new(),
        }
    }

    /// Whether execution may proceed past this gate.
    pub fn passed(&self) -> bool {
        matches!(
            self.status,
            GateStatus::Approved | GateStatus::Edited | GateStatus::Skipped | GateStatus::AutoPassed
        )
    }
}

/// A pending gate visible to the chat surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingGateInfo {
    pub gate_id: String,
    pub gate: GateStage,
    pub skill: String,
    pub risk: RiskLevel,
    pub expires_at: DateTime<Utc>,
}

/// External resolution delivered to a suspended gate.
enum ExternalResolution {
    Approve { edits: Option<Value> },
    Reject { reason: Option<String> },
    Expire,
}

struct PendingGate {
    sender: oneshot::Sender<ExternalResolution>,
    gate: GateStage,
    skill: String,
    risk: RiskLevel,
    expires_at: DateTime<Utc>,
}

/// Configuration for the verification gates.
#[derive(Debug, Clone)]
pub struct GatesConfig {
    /// Directory for the audit-trail day files.
    pub audit_dir: PathBuf,
    /// How long a pending gate waits for external resolution.
    pub approval_timeout: Duration,
    /// Period of the expiration sweeper.
    pub sweep_interval: Duration,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            audit_dir: PathBuf::from("audit-trail"),
            approval_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// The two-stage verification gate engine.
pub struct VerificationGates {
    config: GatesConfig,
    pending: Arc<Mutex<HashMap<String, PendingGate>>>,
    history: Mutex<ApprovalHistory>,
    global_rules: RwLock<Vec<Arc<dyn VerifyRule>>>,
    skill_rules: RwLock<HashMap<String, Vec<Arc<dyn VerifyRule>>>>,
    audit: AuditTrail,
    logger: Arc<ErrorLogger>,
    bus: SharedEventBus,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl VerificationGates {
    pub fn new(
        config: GatesConfig,
        logger: Arc<ErrorLogger>,
        bus: SharedEventBus,
    ) -> GateResult<Self> {
        let audit = AuditTrail::new(config.audit_dir.clone())?;
        Ok(Self {
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            history: Mutex::new(ApprovalHistory::new()),
            global_rules: RwLock::new(Vec::new()),
            skill_rules: RwLock::new(HashMap::new()),
            audit,
            logger,
            bus,
            sweeper: Mutex::new(None),
        })
    }

    /// Create a shared reference to this engine.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Start the periodic expiration sweeper. The per-gate timeout is
    /// authoritative; the sweeper is a safety net for abandoned waiters.
    pub async fn start_sweeper(&self) {
        let pending = self.pending.clone();
        let interval = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let expired: Vec<(String, PendingGate)> = {
                    let mut map = pending.lock().await;
                    let ids: Vec<String> = map
                        .iter()
                        .filter(|(_, gate)| gate.expires_at <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter()
                        .filter_map(|id| map.remove(&id).map(|gate| (id, gate)))
                        .collect()
                };
                for (gate_id, gate) in expired {
                    debug!(gate_id = %gate_id, "sweeper expiring pending gate");
                    let _ = gate.sender.send(ExternalResolution::Expire);
                }
            }
        });
        let mut sweeper = self.sweeper.lock().await;
        if let Some(old) = sweeper.replace(handle) {
            old.abort();
        }
    }

    /// Cancel timers and force-resolve every pending gate as rejected.
    pub async fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        let drained: Vec<(String, PendingGate)> =
            self.pending.lock().await.drain().collect();
        for (gate_id, gate) in drained {
            info!(gate_id = %gate_id, "force-rejecting pending gate on shutdown");
            let _ = gate.sender.send(ExternalResolution::Reject {
                reason: Some("System shutdown".to_string()),
            });
        }
    }

    /// Register a rule applied to every skill.
    pub async fn add_rule(&self, rule: Arc<dyn VerifyRule>) {
        self.global_rules.write().await.push(rule);
    }

    /// Register a rule applied only to one skill, after the global rules.
    pub async fn add_skill_rule(&self, skill: &str, rule: Arc<dyn VerifyRule>) {
        self.skill_rules
            .write()
            .await
            .entry(skill.to_string())
            .or_default()
            .push(rule);
    }

    /// Gates currently awaiting external resolution.
    pub async fn pending_gates(&self) -> Vec<PendingGateInfo> {
        self.pending
            .lock()
            .await
            .iter()
            .map(|(gate_id, gate)| PendingGateInfo {
                gate_id: gate_id.clone(),
                gate: gate.gate,
                skill: gate.skill.clone(),
                risk: gate.risk,
                expires_at: gate.expires_at,
            })
            .collect()
    }

    /// Externally approve a pending gate, optionally with edits.
    /// Returns false if the gate is unknown or already resolved.
    pub async fn approve(&self, gate_id: &str, edits: Option<Value>) -> bool {
        let Some(gate) = self.pending.lock().await.remove(gate_id) else {
            return false;
        };
        gate.sender.send(ExternalResolution::Approve { edits }).is_ok()
    }

    /// Externally reject a pending gate. Returns false if unknown.
    pub async fn reject(&self, gate_id: &str, reason: Option<String>) -> bool {
        let Some(gate) = self.pending.lock().await.remove(gate_id) else {
            return false;
        };
        gate.sender.send(ExternalResolution::Reject { reason }).is_ok()
    }

    /// Aggregate gate statistics from the audit trail.
    pub fn statistics(&self, days: u32) -> GateResult<GateStatistics> {
        self.audit.statistics(days)
    }

    /// Dispatch the pre-execution plan gate.
    pub async fn plan(
        &self,
        skill: &str,
        plan: &PlanSpec,
        ctx: &GateContext,
    ) -> GateResult<GateResolution> {
        let risk = ctx.risk.or(plan.risk).unwrap_or(RiskLevel::Medium);
        let policy = policy_for(risk);
        if !policy.plan_gate {
            return Ok(GateResolution::of(GateStatus::Skipped));
        }

        let pattern_hash = plan_pattern_hash(skill, plan);
        let user_id = ctx.user_id.as_deref().unwrap_or(history::ANONYMOUS_USER);

        {
            let history = self.history.lock().await;
            if history.auto_passes(&pattern_hash) {
                info!(skill, pattern_hash = %pattern_hash, "plan gate auto-passed");
                let resolution = GateResolution::of(GateStatus::AutoPassed);
                self.finalize(GateStage::Plan, skill, risk, &policy, &resolution, ctx, Some(plan), None)
                    .await?;
                return Ok(resolution);
            }
            if let Some(remaining) =
                history.cooldown_remaining(skill, user_id, policy.cooldown_seconds)
            {
                let mut resolution = GateResolution::of(GateStatus::Rejected);
                resolution.reason = Some(format!("Cooldown active: retry in {remaining}s"));
                self.finalize(GateStage::Plan, skill, risk, &policy, &resolution, ctx, Some(plan), None)
                    .await?;
                return Ok(resolution);
            }
        }

        let plan_value = serde_json::to_value(plan)?;
        let (gate_id, receiver) = self.insert_pending(GateStage::Plan, skill, risk).await;
        self.bus.publish(SupervisionEvent::GatePending {
            gate_id: gate_id.clone(),
            gate: GateStage::Plan,
            skill: skill.to_string(),
            risk,
            plan: Some(plan_value),
            output: None,
            checks: None,
            failed_checks: None,
            timeout_ms: self.config.approval_timeout.as_millis() as u64,
            timestamp: Utc::now(),
        });

        let mut resolution = self.await_resolution(&gate_id, receiver).await;
        if matches!(resolution.status, GateStatus::Approved | GateStatus::Edited) {
            let mut history = self.history.lock().await;
            history.record_approval(&pattern_hash);
            if policy.cooldown_seconds > 0 {
                history.touch_cooldown(skill, user_id);
            }
        }
        resolution.gate_id = Some(gate_id);
        self.finalize(GateStage::Plan, skill, risk, &policy, &resolution, ctx, Some(plan), None)
            .await?;
        Ok(resolution)
    }

    /// Dispatch the post-execution verify gate.
    pub async fn verify(
        &self,
        skill: &str,
        output: &Value,
        ctx: &GateContext,
    ) -> GateResult<GateResolution> {
        let risk = ctx.risk.unwrap_or(RiskLevel::Medium);
        let policy = policy_for(risk);
        if !policy.verify_gate {
            return Ok(GateResolution::of(GateStatus::Skipped));
        }

        let rules: Vec<Arc<dyn VerifyRule>> = {
            let mut rules = builtin_rules();
            rules.extend(self.global_rules.read().await.iter().cloned());
            if let Some(skill_rules) = self.skill_rules.read().await.get(skill) {
                rules.extend(skill_rules.iter().cloned());
            }
            rules
        };
        let checks = run_rules(&rules, output, ctx);
        let failed: Vec<RuleCheck> = checks.iter().filter(|c| !c.pass).cloned().collect();

        if !failed.is_empty() {
            warn!(skill, failed = failed.len(), "verification checks failed");
            self.bus.publish(SupervisionEvent::VerificationFailed {
                skill: skill.to_string(),
                risk,
                failed_checks: failed.clone(),
                timestamp: Utc::now(),
            });
        }

        let escalates = matches!(risk, RiskLevel::High | RiskLevel::Critical);
        let resolution = if failed.is_empty() && !escalates {
            let mut resolution = GateResolution::of(GateStatus::AutoPassed);
            resolution.checks = checks;
            resolution
        } else if failed.is_empty() || escalates {
            // All-pass at high risk, or failures at high risk: suspend for
            // the user either way.
            let output_value = output.clone();
            let (gate_id, receiver) = self.insert_pending(GateStage::Verify, skill, risk).await;
            self.bus.publish(SupervisionEvent::GatePending {
                gate_id: gate_id.clone(),
                gate: GateStage::Verify,
                skill: skill.to_string(),
                risk,
                plan: None,
                output: Some(output_value),
                checks: Some(checks.clone()),
                failed_checks: if failed.is_empty() {
                    None
                } else {
                    Some(failed.clone())
                },
                timeout_ms: self.config.approval_timeout.as_millis() as u64,
                timestamp: Utc::now(),
            });
            let mut resolution = self.await_resolution(&gate_id, receiver).await;
            resolution.gate_id = Some(gate_id);
            resolution.checks = checks;
            resolution
        } else {
            let mut resolution = GateResolution::of(GateStatus::Rejected);
            resolution.reason = Some(
                failed
                    .iter()
                    .filter_map(|c| c.reason.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            );
            resolution.checks = checks;
            resolution
        };

        if resolution.status == GateStatus::Rejected {
            let reasons = match &resolution.reason {
                Some(reason) => vec![reason.clone()],
                None => failed.iter().filter_map(|c| c.reason.clone()).collect(),
            };
            self.bus.publish(SupervisionEvent::VerificationRejected {
                skill: skill.to_string(),
                risk,
                reasons,
                timestamp: Utc::now(),
            });
        }

        let checks_snapshot = resolution.checks.clone();
        self.finalize(
            GateStage::Verify,
            skill,
            risk,
            &policy,
            &resolution,
            ctx,
            None,
            Some((output, &checks_snapshot)),
        )
        .await?;
        Ok(resolution)
    }

    async fn insert_pending(
        &self,
        stage: GateStage,
        skill: &str,
        risk: RiskLevel,
    ) -> (String, oneshot::Receiver<ExternalResolution>) {
        let gate_id = format!(
            "{stage}:{skill}:{}",
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        );
        let (sender, receiver) = oneshot::channel();
        let expires_at =
            Utc::now() + chrono::Duration::milliseconds(self.config.approval_timeout.as_millis() as i64);
        self.pending.lock().await.insert(
            gate_id.clone(),
            PendingGate {
                sender,
                gate: stage,
                skill: skill.to_string(),
                risk,
                expires_at,
            },
        );
        (gate_id, receiver)
    }

    async fn await_resolution(
        &self,
        gate_id: &str,
        receiver: oneshot::Receiver<ExternalResolution>,
    ) -> GateResolution {
        let outcome = tokio::time::timeout(self.config.approval_timeout, receiver).await;
        // Whichever path resolved first, the index entry must be gone.
        self.pending.lock().await.remove(gate_id);
        match outcome {
            Ok(Ok(ExternalResolution::Approve { edits })) => {
                let mut resolution = GateResolution::of(if edits.is_some() {
                    GateStatus::Edited
                } else {
                    GateStatus::Approved
                });
                resolution.edits = edits;
                resolution
            }
            Ok(Ok(ExternalResolution::Reject { reason })) => {
                let mut resolution = GateResolution::of(GateStatus::Rejected);
                resolution.reason = reason;
                resolution
            }
            Ok(Ok(ExternalResolution::Expire)) | Ok(Err(_)) | Err(_) => {
                let mut resolution = GateResolution::of(GateStatus::Expired);
                resolution.reason = Some("Approval timed out".to_string());
                resolution
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        stage: GateStage,
        skill: &str,
        risk: RiskLevel,
        policy: &GatePolicy,
        resolution: &GateResolution,
        ctx: &GateContext,
        plan: Option<&PlanSpec>,
        output: Option<(&Value, &[RuleCheck])>,
    ) -> GateResult<()> {
        if policy.audit_trail {
            let entry = AuditEntry {
                timestamp: Utc::now(),
                gate: stage,
                skill: skill.to_string(),
                status: resolution.status,
                risk,
                user_id: ctx.user_id.clone(),
                plan: match plan {
                    Some(plan) => Some(serde_json::to_value(plan)?),
                    None => None,
                },
                output_summary: output.map(|(value, _)| audit_summary(value)),
                checks: output.map(|(_, checks)| checks.to_vec()),
            };
            self.audit.append(&entry)?;
        }
        self.logger
            .record_gate_decision(
                &stage.to_string(),
                skill,
                &resolution.status.to_string(),
                &risk.to_string(),
            )
            .await?;
        Ok(())
    }
}

//! Risk-keyed gate policy.

use serde::{Deserialize, Serialize};

use crate::router::RiskLevel;

/// Which gates apply at a risk level, and with what discipline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Whether the pre-execution plan gate applies.
    pub plan_gate: bool,
    /// Whether the post-execution verify gate applies.
    pub verify_gate: bool,
    /// Minimum seconds between approvals for the same skill and user.
    pub cooldown_seconds: u64,
    /// Whether resolved gates are appended to the audit trail.
    pub audit_trail: bool,
}

impl GatePolicy {
    const fn new(plan_gate: bool, verify_gate: bool, cooldown_seconds: u64, audit_trail: bool) -> Self {
        Self {
            plan_gate,
            verify_gate,
            cooldown_seconds,
            audit_trail,
        }
    }
}

/// Canonical policy table.
pub fn policy_for(risk: RiskLevel) -> GatePolicy {
    match risk {
        RiskLevel::None | RiskLevel::Low => GatePolicy::new(false, false, 0, false),
        RiskLevel::Medium => GatePolicy::new(false, true, 0, false),
        RiskLevel::High => GatePolicy::new(true, true, 0, true),
        RiskLevel::Critical => GatePolicy::new(true, true, 30, true),
    }
}

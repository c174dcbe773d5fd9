//! Approval history: pattern hashes, auto-pass promotion, and per-user
//! cooldowns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde_json::Value;

use super::PlanSpec;

/// Identical approvals required before a plan pattern auto-passes.
pub const AUTO_PASS_THRESHOLD: u32 = 3;

/// Cooldown key when no user id is supplied.
pub const ANONYMOUS_USER: &str = "anonymous";

/// First 10 hex chars of the md5 of the input.
pub fn md5_10(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))[..10].to_string()
}

/// Pattern hash for a plan: `md5_10("{skill}:{canonical_json(steps ?? description)}")`.
///
/// Serialization via `serde_json` is the deterministic canonical form; the
/// same steps array or description always hashes identically.
pub fn plan_pattern_hash(skill: &str, plan: &PlanSpec) -> String {
    let subject = match &plan.steps {
        Some(steps) => serde_json::to_string(steps).unwrap_or_default(),
        None => serde_json::to_string(&Value::String(plan.description.clone())).unwrap_or_default(),
    };
    md5_10(&format!("{skill}:{subject}"))
}

/// Approval state for one plan pattern.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternApproval {
    pub count: u32,
    pub last_approved_at: Option<DateTime<Utc>>,
}

/// In-memory approval bookkeeping owned by the gates component.
#[derive(Debug, Default)]
pub struct ApprovalHistory {
    approvals: HashMap<String, PatternApproval>,
    cooldowns: HashMap<String, DateTime<Utc>>,
}

impl ApprovalHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Approvals recorded for a pattern hash.
    pub fn approval_count(&self, pattern_hash: &str) -> u32 {
        self.approvals
            .get(pattern_hash)
            .map(|a| a.count)
            .unwrap_or(0)
    }

    /// Record an approval (or edited approval) of a pattern.
    pub fn record_approval(&mut self, pattern_hash: &str) {
        let entry = self.approvals.entry(pattern_hash.to_string()).or_default();
        entry.count += 1;
        entry.last_approved_at = Some(Utc::now());
    }

    /// Whether the pattern has been approved often enough to auto-pass.
    pub fn auto_passes(&self, pattern_hash: &str) -> bool {
        self.approval_count(pattern_hash) >= AUTO_PASS_THRESHOLD
    }

    /// Seconds left in the cooldown window for a skill/user pair, if any.
    pub fn cooldown_remaining(&self, skill: &str, user_id: &str, cooldown_seconds: u64) -> Option<u64> {
        if cooldown_seconds == 0 {
            return None;
        }
        let key = cooldown_key(skill, user_id);
        let last = self.cooldowns.get(&key)?;
        let elapsed = Utc::now().signed_duration_since(*last).num_seconds().max(0) as u64;
        if elapsed < cooldown_seconds {
            Some(cooldown_seconds - elapsed)
        } else {
            None
        }
    }

    /// Stamp the cooldown window for a skill/user pair.
    pub fn touch_cooldown(&mut self, skill: &str, user_id: &str) {
        self.cooldowns.insert(cooldown_key(skill, user_id), Utc::now());
    }
}

fn cooldown_key(skill: &str, user_id: &str) -> String {
    format!("cooldown:{skill}:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(description: &str) -> PlanSpec {
        PlanSpec {
            description: description.to_string(),
            steps: None,
            rollback: None,
            risk: None,
        }
    }

    #[test]
    fn test_md5_10_shape() {
        let hash = md5_10("deploy:plan");
        assert_eq!(hash.len(), 10);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_pattern_hash_stable() {
        let a = plan_pattern_hash("deploy", &plan("Deploy v2"));
        let b = plan_pattern_hash("deploy", &plan("Deploy v2"));
        assert_eq!(a, b);
        assert_ne!(a, plan_pattern_hash("deploy", &plan("Deploy v3")));
        assert_ne!(a, plan_pattern_hash("restart", &plan("Deploy v2")));
    }

    #[test]
    fn test_steps_win_over_description() {
        let mut with_steps = plan("Deploy v2");
        with_steps.steps = Some(serde_json::json!(["build", "push"]));
        assert_ne!(
            plan_pattern_hash("deploy", &with_steps),
            plan_pattern_hash("deploy", &plan("Deploy v2"))
        );
    }

    #[test]
    fn test_auto_pass_threshold() {
        let mut history = ApprovalHistory::new();
        let hash = "abcdef0123";
        for _ in 0..2 {
            history.record_approval(hash);
        }
        assert!(!history.auto_passes(hash));
        history.record_approval(hash);
        assert!(history.auto_passes(hash));
    }

    #[test]
    fn test_cooldown_window() {
        let mut history = ApprovalHistory::new();
        assert_eq!(history.cooldown_remaining("deploy", "u1", 30), None);
        history.touch_cooldown("deploy", "u1");
        let remaining = history.cooldown_remaining("deploy", "u1", 30).unwrap();
        assert!(remaining > 0 && remaining <= 30);
        // Other users and skills are unaffected.
        assert_eq!(history.cooldown_remaining("deploy", "u2", 30), None);
        assert_eq!(history.cooldown_remaining("restart", "u1", 30), None);
    }

    #[test]
    fn test_zero_cooldown_never_blocks() {
        let mut history = ApprovalHistory::new();
        history.touch_cooldown("deploy", "u1");
        assert_eq!(history.cooldown_remaining("deploy", "u1", 0), None);
    }
}

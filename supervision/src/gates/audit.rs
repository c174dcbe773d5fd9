//! Audit trail: newline-delimited JSON of resolved gates, plus the
//! aggregation that feeds auto-approval candidates into the improvement
//! loop.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::rules::RuleCheck;
use super::{GateError, GateResult, GateStage, GateStatus};
use crate::router::RiskLevel;

/// Plan and output summaries are truncated to this length.
const SUMMARY_MAX: usize = 300;

/// Resolutions required before a skill becomes an auto-approval candidate.
const CANDIDATE_MIN_RESOLUTIONS: u64 = 5;

/// One resolved gate, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub gate: GateStage,
    pub skill: String,
    pub status: GateStatus,
    pub risk: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<Vec<RuleCheck>>,
}

/// Truncate a serialized value for audit storage.
pub fn audit_summary(value: &Value) -> String {
    let mut text = serde_json::to_string(value).unwrap_or_default();
    crate::errlog::types::truncate_utf8(&mut text, SUMMARY_MAX);
    text
}

/// Per-status resolution counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub approved: u64,
    pub rejected: u64,
    pub expired: u64,
    pub skipped: u64,
    pub auto: u64,
}

impl StatusCounts {
    fn record(&mut self, status: GateStatus) {
        match status {
            GateStatus::Approved | GateStatus::Edited => self.approved += 1,
            GateStatus::Rejected => self.rejected += 1,
            GateStatus::Expired => self.expired += 1,
            GateStatus::Skipped => self.skipped += 1,
            GateStatus::AutoPassed => self.auto += 1,
        }
    }

    /// Resolutions that reached a decision (everything but skips).
    pub fn resolutions(&self) -> u64 {
        self.approved + self.rejected + self.expired + self.auto
    }
}

/// Aggregated gate statistics over an audit window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateStatistics {
    pub per_gate: HashMap<GateStage, StatusCounts>,
    pub per_skill: HashMap<String, StatusCounts>,
    /// Skills with enough resolutions and zero rejections; candidates for
    /// a lower risk tier.
    pub auto_approval_candidates: Vec<String>,
}

impl GateStatistics {
    /// Fraction of plan-gate resolutions that expired (0.0 with none).
    pub fn plan_gate_expiry_rate(&self) -> f64 {
        let Some(counts) = self.per_gate.get(&GateStage::Plan) else {
            return 0.0;
        };
        let resolutions = counts.resolutions();
        if resolutions == 0 {
            return 0.0;
        }
        counts.expired as f64 / resolutions as f64
    }
}

/// Append-only audit trail over a data directory of UTC day files.
pub struct AuditTrail {
    data_dir: PathBuf,
}

impl AuditTrail {
    pub fn new(data_dir: PathBuf) -> GateResult<Self> {
        std::fs::create_dir_all(&data_dir).map_err(|e| GateError::FileWrite {
            path: data_dir.clone(),
            source: e,
        })?;
        Ok(Self { data_dir })
    }

    /// Append one resolved gate.
    pub fn append(&self, entry: &AuditEntry) -> GateResult<()> {
        let date = Utc::now().date_naive();
        let path = self.data_dir.join(format!("{date}.json"));
        let line = serde_json::to_string(entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GateError::FileWrite {
                path: path.clone(),
                source: e,
            })?;
        writeln!(file, "{line}").map_err(|e| GateError::FileWrite { path, source: e })?;
        Ok(())
    }

    /// Read entries from the last N day files. Malformed lines are skipped.
    pub fn read_days(&self, days: u32) -> GateResult<Vec<AuditEntry>> {
        let today = Utc::now().date_naive();
        let mut entries = Vec::new();
        for offset in (0..days.max(1)).rev() {
            let date = today - Duration::days(i64::from(offset));
            let path = self.data_dir.join(format!("{date}.json"));
            if !path.exists() {
                continue;
            }
            let data = std::fs::read_to_string(&path).map_err(|e| GateError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            for line in data.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "skipping malformed audit line");
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Aggregate statistics over the last N days.
    pub fn statistics(&self, days: u32) -> GateResult<GateStatistics> {
        let mut stats = GateStatistics::default();
        for entry in self.read_days(days)? {
            stats.per_gate.entry(entry.gate).or_default().record(entry.status);
            stats
                .per_skill
                .entry(entry.skill.clone())
                .or_default()
                .record(entry.status);
        }

        let mut candidates: Vec<String> = stats
            .per_skill
            .iter()
            .filter(|(_, counts)| {
                counts.resolutions() >= CANDIDATE_MIN_RESOLUTIONS && counts.rejected == 0
            })
            .map(|(skill, _)| skill.clone())
            .collect();
        candidates.sort();
        stats.auto_approval_candidates = candidates;
        Ok(stats)
    }
}

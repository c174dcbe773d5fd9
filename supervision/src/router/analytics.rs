//! Per-router analytics: hit counters, execution stats, and the bounded
//! ring of unmatched messages that feeds new-route discovery.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capacity of the unmatched-message ring.
const UNMATCHED_CAPACITY: usize = 50;

/// Unmatched messages are truncated to this length before storage.
const UNMATCHED_MESSAGE_MAX: usize = 100;

/// How many unmatched messages a summary reports.
const SUMMARY_UNMATCHED: usize = 5;

/// Execution counters for one route.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

impl ExecutionStats {
    /// Success percentage with one decimal.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.successes as f64 / self.total as f64 * 1000.0).round() / 10.0
    }

    /// Integer average duration.
    pub fn avg_duration_ms(&self) -> u64 {
        if self.total == 0 {
            return 0;
        }
        self.total_duration_ms / self.total
    }
}

/// A message no route matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedMessage {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Mutable analytics state owned by the router.
#[derive(Debug, Default)]
pub struct RouteAnalytics {
    hits: HashMap<String, u64>,
    executions: HashMap<String, ExecutionStats>,
    unmatched: VecDeque<UnmatchedMessage>,
}

impl RouteAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pattern match against a route.
    pub fn record_hit(&mut self, route: &str) {
        *self.hits.entry(route.to_string()).or_insert(0) += 1;
    }

    /// Record a completed handler execution.
    pub fn record_execution(&mut self, route: &str, ok: bool, duration_ms: u64) {
        let stats = self.executions.entry(route.to_string()).or_default();
        stats.total += 1;
        if ok {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.total_duration_ms += duration_ms;
    }

    /// Record a message no route matched, truncated for storage.
    pub fn record_unmatched(&mut self, message: &str) {
        let mut message = message.to_string();
        crate::errlog::types::truncate_utf8(&mut message, UNMATCHED_MESSAGE_MAX);
        self.unmatched.push_back(UnmatchedMessage {
            message,
            timestamp: Utc::now(),
        });
        while self.unmatched.len() > UNMATCHED_CAPACITY {
            self.unmatched.pop_front();
        }
    }

    pub fn hits(&self) -> &HashMap<String, u64> {
        &self.hits
    }

    pub fn executions(&self) -> &HashMap<String, ExecutionStats> {
        &self.executions
    }

    /// The full unmatched ring, oldest first.
    pub fn unmatched(&self) -> Vec<UnmatchedMessage> {
        self.unmatched.iter().cloned().collect()
    }

    /// Build the per-route summary.
    pub fn summary(&self) -> AnalyticsSummary {
        let mut routes = HashMap::new();
        let names: std::collections::HashSet<&String> =
            self.hits.keys().chain(self.executions.keys()).collect();
        for name in names {
            let executions = self.executions.get(name).copied().unwrap_or_default();
            routes.insert(
                name.clone(),
                RouteSummary {
                    hits: self.hits.get(name).copied().unwrap_or(0),
                    success_rate: executions.success_rate(),
                    avg_duration_ms: executions.avg_duration_ms(),
                    executions,
                },
            );
        }
        let recent_unmatched = self
            .unmatched
            .iter()
            .rev()
            .take(SUMMARY_UNMATCHED)
            .cloned()
            .collect();
        AnalyticsSummary {
            routes,
            recent_unmatched,
        }
    }
}

/// Summary line for one route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSummary {
    pub hits: u64,
    pub executions: ExecutionStats,
    /// Percentage, one decimal.
    pub success_rate: f64,
    pub avg_duration_ms: u64,
}

/// Snapshot of router analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub routes: HashMap<String, RouteSummary>,
    /// The last five unmatched messages, newest first.
    pub recent_unmatched: Vec<UnmatchedMessage>,
}

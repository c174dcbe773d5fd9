//! Metrics snapshots appended by each analysis run, and the error-rate
//! trend over recent snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshots retained in the history ring.
pub const METRICS_CAPACITY: usize = 90;

/// How many recent snapshots the trend considers.
const TREND_WINDOW: usize = 4;

/// Error-rate ratio at or below which the trend is improving.
const IMPROVING_RATIO: f64 = 0.8;

/// Error-rate ratio at or above which the trend is degrading.
const DEGRADING_RATIO: f64 = 1.2;

/// Summary appended by one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub insight_count: usize,
    pub pending_proposals: usize,
    pub correction_count: usize,
    /// Error rate over the analysis window, when the logger was readable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    /// Total routed executions, when a router is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_routed: Option<u64>,
    /// Unmatched-message count, when a router is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unmatched_count: Option<usize>,
}

/// Direction of the recent error-rate trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
    /// Not enough history to tell.
    Unknown,
}

/// Compare the newest error rate against the oldest within the window.
pub fn compute_trend(snapshots: &[MetricsSnapshot]) -> Trend {
    let window: Vec<&MetricsSnapshot> = snapshots
        .iter()
        .rev()
        .take(TREND_WINDOW)
        .filter(|s| s.error_rate.is_some())
        .collect();
    if window.len() < 2 {
        return Trend::Unknown;
    }
    let latest = window.first().and_then(|s| s.error_rate).unwrap_or(0.0);
    let earliest = window.last().and_then(|s| s.error_rate).unwrap_or(0.0);

    if earliest == 0.0 {
        return if latest > 0.0 {
            Trend::Degrading
        } else {
            Trend::Stable
        };
    }
    let ratio = latest / earliest;
    if ratio <= IMPROVING_RATIO {
        Trend::Improving
    } else if ratio >= DEGRADING_RATIO {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(error_rate: Option<f64>) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            insight_count: 0,
            pending_proposals: 0,
            correction_count: 0,
            error_rate,
            total_routed: None,
            unmatched_count: None,
        }
    }

    #[test]
    fn test_unknown_with_little_history() {
        assert_eq!(compute_trend(&[]), Trend::Unknown);
        assert_eq!(compute_trend(&[snapshot(Some(0.5))]), Trend::Unknown);
        assert_eq!(
            compute_trend(&[snapshot(None), snapshot(None)]),
            Trend::Unknown
        );
    }

    #[test]
    fn test_improving() {
        let snapshots = vec![snapshot(Some(0.5)), snapshot(Some(0.4)), snapshot(Some(0.3))];
        assert_eq!(compute_trend(&snapshots), Trend::Improving);
    }

    #[test]
    fn test_degrading() {
        let snapshots = vec![snapshot(Some(0.2)), snapshot(Some(0.3)), snapshot(Some(0.4))];
        assert_eq!(compute_trend(&snapshots), Trend::Degrading);
    }

    #[test]
    fn test_stable() {
        let snapshots = vec![snapshot(Some(0.30)), snapshot(Some(0.31))];
        assert_eq!(compute_trend(&snapshots), Trend::Stable);
    }

    #[test]
    fn test_only_window_counts() {
        // Older snapshots beyond the window are ignored.
        let mut snapshots = vec![snapshot(Some(9.0))];
        snapshots.extend([
            snapshot(Some(0.3)),
            snapshot(Some(0.3)),
            snapshot(Some(0.3)),
            snapshot(Some(0.3)),
        ]);
        assert_eq!(compute_trend(&snapshots), Trend::Stable);
    }

    #[test]
    fn test_zero_baseline() {
        assert_eq!(
            compute_trend(&[snapshot(Some(0.0)), snapshot(Some(0.2))]),
            Trend::Degrading
        );
        assert_eq!(
            compute_trend(&[snapshot(Some(0.0)), snapshot(Some(0.0))]),
            Trend::Stable
        );
    }
}

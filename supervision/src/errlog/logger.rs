//! The error logger: captures outcome records, maintains the fingerprint
//! occurrence counter, and serves typed queries over the daily log files.
//!
//! On-disk layout (one directory per logger):
//! - `YYYY-MM-DD.json` — newline-delimited JSON outcome records, UTC-dated.
//! - `_occurrences.json` — pretty-printed fingerprint → count map.
//!
//! Filesystem failures during capture or append are fatal for the call;
//! malformed lines encountered during query are skipped.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::classifier::{classify, infer_severity};
use super::fingerprint::stack_fingerprint;
use super::types::{
    new_record_id, summarize_input, ErrorClass, OutcomeRecord, Severity, SkillError,
};

/// Filename of the persisted fingerprint counter map.
const OCCURRENCES_FILE: &str = "_occurrences.json";

/// Errors from the logger subsystem.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
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
}

/// Result type alias for logger operations.
pub type LogResult<T> = Result<T, LogError>;

/// Callback fired when a critical-severity error is captured.
pub type CriticalCallback = Box<dyn Fn(&OutcomeRecord) + Send + Sync>;

/// Callback fired when a fingerprint's count exceeds the recurrence threshold.
pub type ThresholdCallback = Box<dyn Fn(&OutcomeRecord, u32) + Send + Sync>;

/// Configuration for the error logger.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Directory holding day files and the occurrence counter.
    pub data_dir: PathBuf,
    /// Occurrence count above which the threshold callback fires.
    pub recurrence_threshold: u32,
    /// Default lookback window for queries, in days.
    pub query_days: u32,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("errors"),
            recurrence_threshold: 2,
            query_days: 7,
        }
    }
}

/// Context supplied with a captured error.
#[derive(Debug, Clone, Default)]
pub struct CaptureContext {
    pub skill: String,
    pub agent: String,
    /// Raw input to the skill; summarized and truncated for storage.
    pub input: Option<Value>,
    /// Explicit severity override. Wins over inference.
    pub severity: Option<Severity>,
    pub metadata: Option<Value>,
}

impl CaptureContext {
    pub fn new(skill: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            skill: skill.into(),
            agent: agent.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Outcome of a wrapped skill execution.
#[derive(Debug, Clone)]
pub struct SkillOutcome {
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<SkillError>,
    /// The persisted record: an error record on failure, a success record
    /// on success.
    pub record: Option<OutcomeRecord>,
    pub duration_ms: u64,
}

/// Filter for outcome-record queries. Unset fields match everything.
///
/// A classification filter implicitly restricts the result to error
/// records.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub skill: Option<String>,
    pub classification: Option<ErrorClass>,
    pub fingerprint: Option<String>,
    pub min_occurrences: Option<u32>,
    pub days: Option<u32>,
}

/// A recurring error fingerprint with its live count.
#[derive(Debug, Clone)]
pub struct RecurringError {
    pub fingerprint: String,
    pub count: u32,
    /// Most recent matching error record in the query window, if any.
    pub last_seen: Option<OutcomeRecord>,
}

/// Quantitative summary over the query window.
#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    pub total_errors: u64,
    pub total_successes: u64,
    /// errors / (errors + successes); 0.0 with no executions.
    pub error_rate: f64,
    pub by_classification: HashMap<ErrorClass, u64>,
    pub by_severity: HashMap<Severity, u64>,
    pub by_skill: HashMap<String, u64>,
}

/// The error logger. One instance owns one data directory.
pub struct ErrorLogger {
    config: LoggerConfig,
    occurrences: Mutex<HashMap<String, u32>>,
    on_critical: Option<CriticalCallback>,
    on_threshold: Option<ThresholdCallback>,
}

impl ErrorLogger {
    /// Create a logger over a data directory, loading the persisted
    /// fingerprint counter if present.
    pub fn new(config: LoggerConfig) -> LogResult<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| LogError::FileWrite {
            path: config.data_dir.clone(),
            source: e,
        })?;
        let occurrences = load_occurrences(&config.data_dir.join(OCCURRENCES_FILE))?;
        Ok(Self {
            config,
            occurrences: Mutex::new(occurrences),
            on_critical: None,
            on_threshold: None,
        })
    }

    /// Register a callback for critical-severity captures.
    pub fn with_on_critical(mut self, callback: CriticalCallback) -> Self {
        self.on_critical = Some(callback);
        self
    }

    /// Register a callback for fingerprints exceeding the recurrence
    /// threshold.
    pub fn with_on_threshold(mut self, callback: ThresholdCallback) -> Self {
        self.on_threshold = Some(callback);
        self
    }

    /// Capture a skill failure as a structured error record.
    pub async fn capture(
        &self,
        error: &SkillError,
        ctx: CaptureContext,
    ) -> LogResult<OutcomeRecord> {
        let classification = classify(&error.name, &error.message);
        let severity = ctx
            .severity
            .unwrap_or_else(|| infer_severity(&ctx.skill, classification));
        let fingerprint = stack_fingerprint(error.stack.as_deref());

        let count = {
            let mut occurrences = self.occurrences.lock().await;
            let count = occurrences.entry(fingerprint.clone()).or_insert(0);
            *count += 1;
            let count = *count;
            self.persist_occurrences(&occurrences)?;
            count
        };

        let record = OutcomeRecord::Error {
            id: new_record_id(),
            timestamp: Utc::now(),
            classification,
            severity,
            skill: ctx.skill.clone(),
            agent: ctx.agent.clone(),
            message: error.message.clone(),
            name: error.name.clone(),
            stack: error.stack.clone(),
            fingerprint: fingerprint.clone(),
            input_summary: ctx.input.as_ref().map(summarize_input),
            occurrence_count: count,
            metadata: ctx.metadata,
        };

        self.append_record(&record)?;
        warn!(
            skill = %ctx.skill,
            classification = %classification,
            severity = %severity,
            fingerprint = %fingerprint,
            occurrence = count,
            "skill error captured"
        );

        if severity == Severity::Critical {
            if let Some(callback) = &self.on_critical {
                callback(&record);
            }
        }
        if count > self.config.recurrence_threshold {
            if let Some(callback) = &self.on_threshold {
                callback(&record, count);
            }
        }

        Ok(record)
    }

    /// Append a success record for a completed skill execution.
    pub async fn record_success(
        &self,
        skill: &str,
        agent: &str,
        duration_ms: u64,
        input: Option<&Value>,
    ) -> LogResult<OutcomeRecord> {
        let record = OutcomeRecord::Success {
            id: new_record_id(),
            timestamp: Utc::now(),
            skill: skill.to_string(),
            agent: agent.to_string(),
            duration_ms,
            input_summary: input.map(summarize_input),
        };
        self.append_record(&record)?;
        Ok(record)
    }

    /// Record a fix against an error fingerprint and reset its counter so
    /// a re-occurrence re-escalates from zero.
    pub async fn record_fix(
        &self,
        fingerprint: &str,
        note: &str,
        skill: Option<&str>,
    ) -> LogResult<OutcomeRecord> {
        let record = OutcomeRecord::FixNote {
            id: new_record_id(),
            timestamp: Utc::now(),
            skill: skill.map(String::from),
            fingerprint: fingerprint.to_string(),
            note: note.to_string(),
        };
        self.append_record(&record)?;

        let mut occurrences = self.occurrences.lock().await;
        occurrences.remove(fingerprint);
        self.persist_occurrences(&occurrences)?;
        Ok(record)
    }

    /// Mirror a resolved verification gate into the outcome log.
    pub async fn record_gate_decision(
        &self,
        gate: &str,
        skill: &str,
        status: &str,
        risk: &str,
    ) -> LogResult<OutcomeRecord> {
        let record = OutcomeRecord::GateDecision {
            id: new_record_id(),
            timestamp: Utc::now(),
            gate: gate.to_string(),
            skill: skill.to_string(),
            status: status.to_string(),
            risk: risk.to_string(),
        };
        self.append_record(&record)?;
        Ok(record)
    }

    /// Time and capture a skill execution.
    ///
    /// Handler failures are recovered here and surfaced as a structured
    /// outcome; only filesystem failures propagate.
    pub async fn run<Fut>(
        &self,
        skill: &str,
        agent: &str,
        input: Option<Value>,
        severity: Option<Severity>,
        fut: Fut,
    ) -> LogResult<SkillOutcome>
    where
        Fut: Future<Output = Result<Value, SkillError>>,
    {
        let started = Instant::now();
        match fut.await {
            Ok(result) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let record = self
                    .record_success(skill, agent, duration_ms, input.as_ref())
                    .await?;
                Ok(SkillOutcome {
                    ok: true,
                    result: Some(result),
                    error: None,
                    record: Some(record),
                    duration_ms,
                })
            }
            Err(error) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let mut ctx = CaptureContext::new(skill, agent);
                ctx.input = input;
                ctx.severity = severity;
                let record = self.capture(&error, ctx).await?;
                Ok(SkillOutcome {
                    ok: false,
                    result: None,
                    error: Some(error),
                    record: Some(record),
                    duration_ms,
                })
            }
        }
    }

    /// Query outcome records over the last N day files.
    pub fn query(&self, filter: &QueryFilter) -> LogResult<Vec<OutcomeRecord>> {
        let days = filter.days.unwrap_or(self.config.query_days).max(1);
        let today = Utc::now().date_naive();
        let mut records = Vec::new();

        for offset in (0..days).rev() {
            let date = today - Duration::days(i64::from(offset));
            let path = self.config.data_dir.join(format!("{date}.json"));
            if !path.exists() {
                continue;
            }
            let data = std::fs::read_to_string(&path).map_err(|e| LogError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            for line in data.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<OutcomeRecord>(line) {
                    Ok(record) => {
                        if record_matches(&record, filter) {
                            records.push(record);
                        }
                    }
                    Err(e) => debug!(path = %path.display(), error = %e, "skipping malformed log line"),
                }
            }
        }
        Ok(records)
    }

    /// Top-K fingerprints by occurrence count, each annotated with the most
    /// recent matching record in the query window.
    pub async fn recurring_errors(&self, top_k: usize) -> LogResult<Vec<RecurringError>> {
        let mut counts: Vec<(String, u32)> = {
            let occurrences = self.occurrences.lock().await;
            occurrences.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(top_k);

        let errors = self.query(&QueryFilter::default())?;
        let mut latest: HashMap<&str, &OutcomeRecord> = HashMap::new();
        for record in &errors {
            if let Some(fp) = record.fingerprint() {
                if record.is_error() {
                    latest.insert(fp, record);
                }
            }
        }

        Ok(counts
            .into_iter()
            .map(|(fingerprint, count)| RecurringError {
                last_seen: latest.get(fingerprint.as_str()).map(|r| (*r).clone()),
                fingerprint,
                count,
            })
            .collect())
    }

    /// Snapshot of the fingerprint occurrence counter.
    pub async fn occurrence_counts(&self) -> HashMap<String, u32> {
        self.occurrences.lock().await.clone()
    }

    /// Live count for a single fingerprint.
    pub async fn occurrence_count(&self, fingerprint: &str) -> u32 {
        self.occurrences
            .lock()
            .await
            .get(fingerprint)
            .copied()
            .unwrap_or(0)
    }

    /// Aggregate a quantitative report over the last N days.
    pub fn report(&self, days: u32) -> LogResult<ErrorReport> {
        let filter = QueryFilter {
            days: Some(days),
            ..QueryFilter::default()
        };
        let mut report = ErrorReport::default();
        for record in self.query(&filter)? {
            match record {
                OutcomeRecord::Error {
                    classification,
                    severity,
                    skill,
                    ..
                } => {
                    report.total_errors += 1;
                    *report.by_classification.entry(classification).or_insert(0) += 1;
                    *report.by_severity.entry(severity).or_insert(0) += 1;
                    *report.by_skill.entry(skill).or_insert(0) += 1;
                }
                OutcomeRecord::Success { .. } => report.total_successes += 1,
                _ => {}
            }
        }
        let executions = report.total_errors + report.total_successes;
        if executions > 0 {
            report.error_rate = report.total_errors as f64 / executions as f64;
        }
        Ok(report)
    }

    fn append_record(&self, record: &OutcomeRecord) -> LogResult<()> {
        let date = Utc::now().date_naive();
        let path = self.config.data_dir.join(format!("{date}.json"));
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::FileWrite {
                path: path.clone(),
                source: e,
            })?;
        writeln!(file, "{line}").map_err(|e| LogError::FileWrite { path, source: e })?;
        Ok(())
    }

    fn persist_occurrences(&self, occurrences: &HashMap<String, u32>) -> LogResult<()> {
        let path = self.config.data_dir.join(OCCURRENCES_FILE);
        let data = serde_json::to_string_pretty(occurrences)?;
        std::fs::write(&path, data).map_err(|e| LogError::FileWrite { path, source: e })?;
        Ok(())
    }
}

fn load_occurrences(path: &Path) -> LogResult<HashMap<String, u32>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path).map_err(|e| LogError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_str(&data)?)
}

fn record_matches(record: &OutcomeRecord, filter: &QueryFilter) -> bool {
    if filter.classification.is_some() && !record.is_error() {
        return false;
    }
    if let Some(ref skill) = filter.skill {
        if record.skill() != Some(skill.as_str()) {
            return false;
        }
    }
    if let Some(classification) = filter.classification {
        if record.classification() != Some(classification) {
            return false;
        }
    }
    if let Some(ref fingerprint) = filter.fingerprint {
        if record.fingerprint() != Some(fingerprint.as_str()) {
            return false;
        }
    }
    if let Some(min) = filter.min_occurrences {
        match record.occurrence_count() {
            Some(count) if count >= min => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn temp_logger() -> (tempfile::TempDir, ErrorLogger) {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggerConfig {
            data_dir: dir.path().join("errors"),
            ..LoggerConfig::default()
        };
        let logger = ErrorLogger::new(config).unwrap();
        (dir, logger)
    }

    #[tokio::test]
    async fn test_capture_appends_and_counts() {
        let (_dir, logger) = temp_logger();
        let error = SkillError::new("Error", "ECONNREFUSED 127.0.0.1");

        let record = logger
            .capture(&error, CaptureContext::new("token-audit", "analyst"))
            .await
            .unwrap();

        assert_eq!(record.classification(), Some(ErrorClass::Network));
        assert_eq!(record.occurrence_count(), Some(1));
        let fp = record.fingerprint().unwrap().to_string();
        assert_eq!(logger.occurrence_count(&fp).await, 1);

        let found = logger
            .query(&QueryFilter {
                skill: Some("token-audit".to_string()),
                fingerprint: Some(fp),
                ..QueryFilter::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), record.id());
    }

    #[tokio::test]
    async fn test_explicit_severity_wins() {
        let (_dir, logger) = temp_logger();
        let error = SkillError::new("Error", "odd");
        let record = logger
            .capture(
                &error,
                CaptureContext::new("audit", "analyst").with_severity(Severity::High),
            )
            .await
            .unwrap();
        match record {
            OutcomeRecord::Error { severity, .. } => assert_eq!(severity, Severity::High),
            _ => panic!("expected error record"),
        }
    }

    #[tokio::test]
    async fn test_threshold_callback_fires_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let logger = ErrorLogger::new(LoggerConfig {
            data_dir: dir.path().join("errors"),
            recurrence_threshold: 2,
            query_days: 7,
        })
        .unwrap()
        .with_on_threshold(Box::new(move |_, count| {
            fired_clone.store(count, Ordering::SeqCst);
        }));

        let error = SkillError::new("Error", "boom");
        for _ in 0..2 {
            logger
                .capture(&error, CaptureContext::new("audit", "a"))
                .await
                .unwrap();
        }
        // Count 2 does not strictly exceed the threshold of 2.
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        logger
            .capture(&error, CaptureContext::new("audit", "a"))
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_critical_callback() {
        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let logger = ErrorLogger::new(LoggerConfig {
            data_dir: dir.path().join("errors"),
            ..LoggerConfig::default()
        })
        .unwrap()
        .with_on_critical(Box::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        logger
            .capture(
                &SkillError::new("Error", "boom"),
                CaptureContext::new("deploy-contract", "ops"),
            )
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_fix_resets_counter() {
        let (_dir, logger) = temp_logger();
        let error = SkillError::new("Error", "boom");
        let record = logger
            .capture(&error, CaptureContext::new("audit", "a"))
            .await
            .unwrap();
        let fp = record.fingerprint().unwrap().to_string();
        logger
            .capture(&error, CaptureContext::new("audit", "a"))
            .await
            .unwrap();
        assert_eq!(logger.occurrence_count(&fp).await, 2);

        logger.record_fix(&fp, "patched", Some("audit")).await.unwrap();
        assert_eq!(logger.occurrence_count(&fp).await, 0);

        let record = logger
            .capture(&error, CaptureContext::new("audit", "a"))
            .await
            .unwrap();
        assert_eq!(record.occurrence_count(), Some(1));
    }

    #[tokio::test]
    async fn test_run_wraps_success_and_failure() {
        let (_dir, logger) = temp_logger();

        let ok = logger
            .run("audit", "a", None, None, async {
                Ok(serde_json::json!({"score": 7}))
            })
            .await
            .unwrap();
        assert!(ok.ok);
        assert!(ok.result.is_some());

        let failed = logger
            .run("audit", "a", None, None, async {
                Err(SkillError::new("TypeError", "x is not a function"))
            })
            .await
            .unwrap();
        assert!(!failed.ok);
        let record = failed.record.unwrap();
        assert_eq!(record.classification(), Some(ErrorClass::Logic));
    }

    #[tokio::test]
    async fn test_classification_filter_excludes_successes() {
        let (_dir, logger) = temp_logger();
        logger.record_success("audit", "a", 5, None).await.unwrap();
        logger
            .capture(
                &SkillError::new("Error", "timeout"),
                CaptureContext::new("audit", "a"),
            )
            .await
            .unwrap();

        let found = logger
            .query(&QueryFilter {
                classification: Some(ErrorClass::Timeout),
                ..QueryFilter::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_error());
    }

    #[tokio::test]
    async fn test_recurring_errors_ranked() {
        let (_dir, logger) = temp_logger();
        let frequent = SkillError::new("Error", "boom").with_stack(
            "Error: boom\n    at f (/app/skills/a.js:1:1)",
        );
        let rare = SkillError::new("Error", "boom").with_stack(
            "Error: boom\n    at g (/app/skills/b.js:1:1)",
        );
        for _ in 0..3 {
            logger
                .capture(&frequent, CaptureContext::new("audit", "a"))
                .await
                .unwrap();
        }
        logger
            .capture(&rare, CaptureContext::new("audit", "a"))
            .await
            .unwrap();

        let recurring = logger.recurring_errors(5).await.unwrap();
        assert_eq!(recurring.len(), 2);
        assert_eq!(recurring[0].count, 3);
        assert!(recurring[0].last_seen.is_some());
    }

    #[tokio::test]
    async fn test_report_aggregates() {
        let (_dir, logger) = temp_logger();
        logger.record_success("audit", "a", 5, None).await.unwrap();
        logger
            .capture(
                &SkillError::new("Error", "ECONNREFUSED"),
                CaptureContext::new("audit", "a"),
            )
            .await
            .unwrap();

        let report = logger.report(1).unwrap();
        assert_eq!(report.total_errors, 1);
        assert_eq!(report.total_successes, 1);
        assert!((report.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.by_classification[&ErrorClass::Network], 1);
        assert_eq!(report.by_skill["audit"], 1);
    }

    #[tokio::test]
    async fn test_counter_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggerConfig {
            data_dir: dir.path().join("errors"),
            ..LoggerConfig::default()
        };
        let fp = {
            let logger = ErrorLogger::new(config.clone()).unwrap();
            let record = logger
                .capture(
                    &SkillError::new("Error", "boom"),
                    CaptureContext::new("audit", "a"),
                )
                .await
                .unwrap();
            record.fingerprint().unwrap().to_string()
        };

        let reloaded = ErrorLogger::new(config).unwrap();
        assert_eq!(reloaded.occurrence_count(&fp).await, 1);
    }
}

//! The auto-fix engine: materializes an approved proposal into a source
//! patch under backup/test/rollback discipline.
//!
//! 1. **Types** (`types.rs`): the fix record and its lifecycle.
//! 2. **Oracle** (`oracle.rs`): the LLM seam, prompt, and response
//!    contract, with a deterministic mock.
//! 3. **Locate** (`locate.rs`): source and test-file localization from
//!    stacks and the skills directory.
//! 4. **Templates** (`templates.rs`): deterministic fallback patches keyed
//!    by error classification.
//! 5. **Diff** (`diff.rs`): the line diff attached to every fix.
//! 6. **Engine** (this file): generation, approval surface, and the
//!    backup → apply → test → deploy-or-rollback pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub mod diff;
pub mod locate;
pub mod oracle;
pub mod templates;
pub mod types;

pub use diff::line_diff;
pub use locate::{locate_from_stack, locate_in_skills_dir, locate_test_file, LocatedSource};
pub use oracle::{
    build_fix_prompt, parse_oracle_response, FixOracle, MockOracle, OracleError, SynthesizedFix,
};
pub use templates::{apply_template, TemplateFix, AUTO_FIX_MARKER};
pub use types::{Fix, FixStatus};

use crate::errlog::{ErrorClass, ErrorLogger, LogError, OutcomeRecord, QueryFilter};
use crate::events::{SharedEventBus, SupervisionEvent};
use crate::improvement::{LoopError, ProposalStatus, SelfImprovementLoop};

/// Corrections included in an oracle prompt.
const PROMPT_CORRECTIONS: usize = 5;

/// Test output retained on a fix record.
const TEST_OUTPUT_MAX: usize = 2_000;

/// Errors from the auto-fix engine.
#[derive(Debug, thiserror::Error)]
pub enum FixError {
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

    /// The proposal has not been approved.
    #[error("Proposal '{0}' is not approved")]
    ProposalNotApproved(String),

    /// No fix exists with this id.
    #[error("Unknown fix '{0}'")]
    FixNotFound(String),

    /// The fix is not in a status that allows the operation.
    #[error("Fix '{fix}' is {status}, which does not allow this operation")]
    InvalidStatus { fix: String, status: FixStatus },

    /// No source file could be located for the skill.
    #[error("No source file found for skill '{0}'")]
    SourceNotFound(String),

    /// The oracle response carried no code block.
    #[error("Oracle response contained no code block")]
    NoCodeBlock,

    /// The oracle call failed.
    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// The logger could not be read or written.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The improvement loop rejected a proposal update.
    #[error(transparent)]
    Loop(#[from] LoopError),
}

/// Result type alias for auto-fix operations.
pub type FixResult<T> = Result<T, FixError>;

/// Output of one skill-test run.
#[derive(Debug, Clone)]
pub struct TestRun {
    pub output: String,
    pub timed_out: bool,
}

/// Runs a skill's test file. The default implementation shells out; tests
/// substitute deterministic runners.
#[async_trait]
pub trait SkillTestRunner: Send + Sync {
    async fn run(&self, test_file: &Path) -> Result<TestRun, String>;
}

/// Runs the test file as a subprocess under a hard timeout.
pub struct ProcessTestRunner {
    pub program: String,
    pub timeout: Duration,
}

impl Default for ProcessTestRunner {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl SkillTestRunner for ProcessTestRunner {
    async fn run(&self, test_file: &Path) -> Result<TestRun, String> {
        let mut command = tokio::process::Command::new(&self.program);
        command.arg(test_file).kill_on_drop(true);
        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(TestRun {
                    output: text,
                    timed_out: false,
                })
            }
            Ok(Err(e)) => Err(format!("failed to spawn test: {e}")),
            Err(_) => Ok(TestRun {
                output: String::new(),
                timed_out: true,
            }),
        }
    }
}

/// The substring rule distinguishing test pass from fail.
fn test_passed(run: &TestRun) -> bool {
    if run.timed_out {
        return false;
    }
    let lower = run.output.to_lowercase();
    !(lower.contains("failed") && !lower.contains("0 failed"))
}

/// Configuration for the auto-fix engine.
#[derive(Debug, Clone)]
pub struct AutoFixConfig {
    /// Directory for the fixes file and backups.
    pub data_dir: PathBuf,
    /// Directory holding the skill source trees.
    pub skills_dir: PathBuf,
}

impl Default for AutoFixConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("autofix-data"),
            skills_dir: std::env::var("SUPERVISION_SKILLS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("skills")),
        }
    }
}

/// The auto-fix engine.
pub struct AutoFixEngine {
    config: AutoFixConfig,
    fixes: Mutex<Vec<Fix>>,
    oracle: Option<Arc<dyn FixOracle>>,
    test_runner: Arc<dyn SkillTestRunner>,
    logger: Arc<ErrorLogger>,
    improvement: Arc<SelfImprovementLoop>,
    bus: SharedEventBus,
}

impl AutoFixEngine {
    pub fn new(
        config: AutoFixConfig,
        logger: Arc<ErrorLogger>,
        improvement: Arc<SelfImprovementLoop>,
        bus: SharedEventBus,
    ) -> FixResult<Self> {
        std::fs::create_dir_all(config.data_dir.join("backups")).map_err(|e| {
            FixError::FileWrite {
                path: config.data_dir.join("backups"),
                source: e,
            }
        })?;
        let fixes = load_fixes(&config.data_dir.join("fixes.json"))?;
        Ok(Self {
            config,
            fixes: Mutex::new(fixes),
            oracle: None,
            test_runner: Arc::new(ProcessTestRunner::default()),
            logger,
            improvement,
            bus,
        })
    }

    /// Attach an LLM oracle; without one the deterministic templates are
    /// used.
    pub fn with_oracle(mut self, oracle: Arc<dyn FixOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Substitute the test runner.
    pub fn with_test_runner(mut self, runner: Arc<dyn SkillTestRunner>) -> Self {
        self.test_runner = runner;
        self
    }

    /// Create a shared reference to this engine.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// All fix records.
    pub async fn list_fixes(&self) -> Vec<Fix> {
        self.fixes.lock().await.clone()
    }

    /// Fetch one fix by id.
    pub async fn get_fix(&self, id: &str) -> Option<Fix> {
        self.fixes.lock().await.iter().find(|f| f.id == id).cloned()
    }

    /// Generate a patch for an approved proposal.
    pub async fn generate_fix(&self, proposal_id: &str) -> FixResult<Fix> {
        let proposal = self
            .improvement
            .get_proposal(proposal_id)
            .await
            .ok_or_else(|| FixError::ProposalNotFound(proposal_id.to_string()))?;
        if proposal.status != ProposalStatus::Approved {
            return Err(FixError::ProposalNotApproved(proposal_id.to_string()));
        }
        let skill = proposal
            .skill
            .clone()
            .ok_or_else(|| FixError::SourceNotFound("(no skill on proposal)".to_string()))?;

        let fix = Fix::generating(proposal_id, &skill);
        let fix_id = fix.id.clone();
        self.push_fix(fix).await?;
        self.bus.publish(SupervisionEvent::FixGenerating {
            fix_id: fix_id.clone(),
            proposal_id: proposal_id.to_string(),
            skill: skill.clone(),
            timestamp: Utc::now(),
        });

        match self.synthesize(&skill, &proposal.description, &proposal.data).await {
            Ok(outcome) => {
                let updated = self
                    .update_fix(&fix_id, |fix| {
                        fix.status = FixStatus::Ready;
                        fix.source_file = Some(outcome.source_file.clone());
                        fix.original_code = Some(outcome.original.clone());
                        fix.fixed_code = Some(outcome.fixed.clone());
                        fix.diff = Some(outcome.diff.clone());
                        fix.explanation = Some(outcome.explanation.clone());
                        fix.fingerprint = outcome.fingerprint.clone();
                    })
                    .await?;
                info!(fix_id = %fix_id, skill = %skill, "fix ready for review");
                self.bus.publish(SupervisionEvent::FixReady {
                    fix_id,
                    skill,
                    source_file: outcome.source_file.display().to_string(),
                    timestamp: Utc::now(),
                });
                Ok(updated)
            }
            Err(error) => {
                let reason = error.to_string();
                self.update_fix(&fix_id, |fix| {
                    fix.status = FixStatus::Failed;
                    fix.failure_reason = Some(reason.clone());
                })
                .await?;
                warn!(fix_id = %fix_id, skill = %skill, error = %reason, "fix synthesis failed");
                self.bus.publish(SupervisionEvent::FixFailed {
                    fix_id: Some(fix_id),
                    proposal_id: proposal_id.to_string(),
                    reason,
                    timestamp: Utc::now(),
                });
                Err(error)
            }
        }
    }

    /// Approve a ready fix. Approval does not apply it.
    pub async fn approve_fix(&self, fix_id: &str) -> FixResult<Fix> {
        let updated = self
            .transition(fix_id, &[FixStatus::Ready], |fix| {
                fix.status = FixStatus::Approved;
                fix.approved_at = Some(Utc::now());
            })
            .await?;
        self.bus.publish(SupervisionEvent::FixApproved {
            fix_id: fix_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(updated)
    }

    /// Reject a fix before application.
    pub async fn reject_fix(&self, fix_id: &str, reason: Option<String>) -> FixResult<Fix> {
        let reason_clone = reason.clone();
        let updated = self
            .transition(fix_id, &[FixStatus::Ready, FixStatus::Approved], move |fix| {
                fix.status = FixStatus::Rejected;
                fix.rejected_at = Some(Utc::now());
                fix.failure_reason = reason_clone.clone();
            })
            .await?;
        self.bus.publish(SupervisionEvent::FixRejected {
            fix_id: fix_id.to_string(),
            reason,
            timestamp: Utc::now(),
        });
        Ok(updated)
    }

    /// Apply an approved fix: backup, overwrite, test, deploy or roll
    /// back. Test failures do not propagate; they surface on the record.
    pub async fn apply_fix(&self, fix_id: &str) -> FixResult<Fix> {
        let fix = self
            .get_fix(fix_id)
            .await
            .ok_or_else(|| FixError::FixNotFound(fix_id.to_string()))?;
        if fix.status != FixStatus::Approved {
            return Err(FixError::InvalidStatus {
                fix: fix_id.to_string(),
                status: fix.status,
            });
        }
        let source_file = fix
            .source_file
            .clone()
            .ok_or_else(|| FixError::SourceNotFound(fix.skill.clone()))?;
        let fixed_code = fix.fixed_code.clone().unwrap_or_default();

        self.update_fix(fix_id, |fix| fix.status = FixStatus::Applying).await?;

        // Checkpoint 1: backup.
        let backup_name = format!(
            "{}.{}.bak",
            source_file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "source".to_string()),
            Utc::now().timestamp_millis()
        );
        let backup_path = self.config.data_dir.join("backups").join(backup_name);
        std::fs::copy(&source_file, &backup_path).map_err(|e| FixError::FileWrite {
            path: backup_path.clone(),
            source: e,
        })?;
        self.update_fix(fix_id, |fix| fix.backup_path = Some(backup_path.clone()))
            .await?;

        // Checkpoint 2: overwrite the source.
        std::fs::write(&source_file, &fixed_code).map_err(|e| FixError::FileWrite {
            path: source_file.clone(),
            source: e,
        })?;

        // Checkpoint 3: locate and run the skill's test.
        let test_file = locate_test_file(&self.config.skills_dir, &fix.skill);
        let (passed, test_results) = match &test_file {
            None => (
                true,
                "no test file found; treated as pass".to_string(),
            ),
            Some(test_file) => {
                self.update_fix(fix_id, |fix| fix.status = FixStatus::Testing).await?;
                self.bus.publish(SupervisionEvent::FixTesting {
                    fix_id: fix_id.to_string(),
                    skill: fix.skill.clone(),
                    timestamp: Utc::now(),
                });
                match self.test_runner.run(test_file).await {
                    Ok(run) => {
                        let mut output = if run.timed_out {
                            "test timed out".to_string()
                        } else {
                            run.output.clone()
                        };
                        crate::errlog::truncate_utf8(&mut output, TEST_OUTPUT_MAX);
                        (test_passed(&run), output)
                    }
                    Err(spawn_error) => {
                        // Subprocess failure: restore and mark failed.
                        restore_backup(&backup_path, &source_file)?;
                        let updated = self
                            .update_fix(fix_id, |fix| {
                                fix.status = FixStatus::Failed;
                                fix.failure_reason = Some(spawn_error.clone());
                            })
                            .await?;
                        self.bus.publish(SupervisionEvent::FixFailed {
                            fix_id: Some(fix_id.to_string()),
                            proposal_id: fix.proposal_id.clone(),
                            reason: spawn_error,
                            timestamp: Utc::now(),
                        });
                        self.bus.publish(SupervisionEvent::PipelineComplete {
                            fix_id: fix_id.to_string(),
                            deployed: false,
                            timestamp: Utc::now(),
                        });
                        return Ok(updated);
                    }
                }
            }
        };

        let updated = if passed {
            let updated = self
                .update_fix(fix_id, |fix| {
                    fix.status = FixStatus::Deployed;
                    fix.deployed_at = Some(Utc::now());
                    fix.test_results = Some(test_results.clone());
                })
                .await?;
            if let Some(fingerprint) = &fix.fingerprint {
                self.logger
                    .record_fix(
                        fingerprint,
                        &format!("auto-fix {fix_id} deployed"),
                        Some(&fix.skill),
                    )
                    .await?;
            }
            self.improvement
                .mark_applied(&fix.proposal_id, Some(format!("auto-fix {fix_id} deployed")))
                .await?;
            info!(fix_id = %fix_id, skill = %fix.skill, "fix deployed");
            self.bus.publish(SupervisionEvent::FixDeployed {
                fix_id: fix_id.to_string(),
                skill: fix.skill.clone(),
                timestamp: Utc::now(),
            });
            updated
        } else {
            // Checkpoint 4: roll back from the backup.
            restore_backup(&backup_path, &source_file)?;
            let reason = format!("test failed: {test_results}");
            let updated = self
                .update_fix(fix_id, |fix| {
                    fix.status = FixStatus::RolledBack;
                    fix.test_results = Some(test_results.clone());
                    fix.failure_reason = Some(reason.clone());
                })
                .await?;
            warn!(fix_id = %fix_id, skill = %fix.skill, "fix rolled back");
            self.bus.publish(SupervisionEvent::FixRolledBack {
                fix_id: fix_id.to_string(),
                reason,
                timestamp: Utc::now(),
            });
            updated
        };

        self.bus.publish(SupervisionEvent::PipelineComplete {
            fix_id: fix_id.to_string(),
            deployed: passed,
            timestamp: Utc::now(),
        });
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn synthesize(
        &self,
        skill: &str,
        issue: &str,
        data: &Value,
    ) -> FixResult<SynthesisOutcome> {
        let fingerprint = data
            .get("fingerprint")
            .and_then(Value::as_str)
            .map(String::from);

        // Most recent matching error record, for stack localization and
        // prompt context.
        let error_record = match &fingerprint {
            Some(fingerprint) => self
                .logger
                .query(&QueryFilter {
                    fingerprint: Some(fingerprint.clone()),
                    days: Some(30),
                    ..QueryFilter::default()
                })?
                .into_iter()
                .filter(|r| r.is_error())
                .last(),
            None => None,
        };

        let located = error_record
            .as_ref()
            .and_then(|record| match record {
                OutcomeRecord::Error { stack: Some(stack), .. } => locate_from_stack(stack),
                _ => None,
            })
            .or_else(|| {
                locate_in_skills_dir(&self.config.skills_dir, skill)
                    .map(|path| LocatedSource { path, line: None })
            })
            .ok_or_else(|| FixError::SourceNotFound(skill.to_string()))?;

        let original =
            std::fs::read_to_string(&located.path).map_err(|e| FixError::FileRead {
                path: located.path.clone(),
                source: e,
            })?;

        let (fixed, explanation) = match &self.oracle {
            Some(oracle) => {
                let corrections = self
                    .improvement
                    .corrections_for_skill(skill, PROMPT_CORRECTIONS)
                    .await;
                let prompt =
                    build_fix_prompt(skill, issue, error_record.as_ref(), &corrections, &original);
                let response = oracle.complete(&prompt).await?;
                let synthesized =
                    parse_oracle_response(&response).ok_or(FixError::NoCodeBlock)?;
                (synthesized.fixed_code, synthesized.explanation)
            }
            None => {
                let classification = error_record
                    .as_ref()
                    .and_then(|r| r.classification())
                    .unwrap_or(ErrorClass::Unknown);
                let message = match &error_record {
                    Some(OutcomeRecord::Error { message, .. }) => message.clone(),
                    _ => String::new(),
                };
                let template =
                    apply_template(classification, &original, &message, located.line);
                (template.fixed_code, template.explanation)
            }
        };

        let diff = line_diff(&original, &fixed);
        Ok(SynthesisOutcome {
            source_file: located.path,
            original,
            fixed,
            explanation,
            diff,
            fingerprint,
        })
    }

    async fn push_fix(&self, fix: Fix) -> FixResult<()> {
        let mut fixes = self.fixes.lock().await;
        fixes.push(fix);
        self.save_fixes(&fixes)
    }

    async fn update_fix(&self, id: &str, mutate: impl FnOnce(&mut Fix)) -> FixResult<Fix> {
        let mut fixes = self.fixes.lock().await;
        let Some(fix) = fixes.iter_mut().find(|f| f.id == id) else {
            return Err(FixError::FixNotFound(id.to_string()));
        };
        mutate(fix);
        let updated = fix.clone();
        self.save_fixes(&fixes)?;
        Ok(updated)
    }

    async fn transition(
        &self,
        id: &str,
        allowed: &[FixStatus],
        mutate: impl FnOnce(&mut Fix),
    ) -> FixResult<Fix> {
        let mut fixes = self.fixes.lock().await;
        let Some(fix) = fixes.iter_mut().find(|f| f.id == id) else {
            return Err(FixError::FixNotFound(id.to_string()));
        };
        if !allowed.contains(&fix.status) {
            return Err(FixError::InvalidStatus {
                fix: id.to_string(),
                status: fix.status,
            });
        }
        mutate(fix);
        let updated = fix.clone();
        self.save_fixes(&fixes)?;
        Ok(updated)
    }

    fn save_fixes(&self, fixes: &[Fix]) -> FixResult<()> {
        let path = self.config.data_dir.join("fixes.json");
        let data = serde_json::to_string_pretty(fixes)?;
        std::fs::write(&path, data).map_err(|e| FixError::FileWrite { path, source: e })?;
        Ok(())
    }
}

struct SynthesisOutcome {
    source_file: PathBuf,
    original: String,
    fixed: String,
    explanation: String,
    diff: String,
    fingerprint: Option<String>,
}

fn restore_backup(backup: &Path, source: &Path) -> FixResult<()> {
    std::fs::copy(backup, source).map_err(|e| FixError::FileWrite {
        path: source.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn load_fixes(path: &Path) -> FixResult<Vec<Fix>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path).map_err(|e| FixError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_str(&data)?)
}

//! Auto-fix pipeline integration tests: generation from an approved
//! proposal, the approval surface, and apply with deploy or rollback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use supervision::{
    AutoFixConfig, AutoFixEngine, CaptureContext, ErrorLogger, EventBus, FixStatus, LoggerConfig,
    LoopConfig, MockOracle, ProposalFilter, ProposalStatus, SelfImprovementLoop, SharedEventBus,
    SkillError, SkillTestRunner, TestRun,
};

const SKILL_SOURCE: &str = "const axios = require('axios');\n\nasync function runAudit(input) {\n  const data = await axios.get(input.url);\n  return data.summary.score;\n}\n\nmodule.exports = runAudit;\n";

/// Deterministic test runner returning a canned output.
struct StaticTestRunner {
    output: String,
}

#[async_trait]
impl SkillTestRunner for StaticTestRunner {
    async fn run(&self, _test_file: &Path) -> Result<TestRun, String> {
        Ok(TestRun {
            output: self.output.clone(),
            timed_out: false,
        })
    }
}

struct World {
    _dir: tempfile::TempDir,
    logger: Arc<ErrorLogger>,
    improvement: Arc<SelfImprovementLoop>,
    bus: SharedEventBus,
    skills_dir: PathBuf,
    source_file: PathBuf,
}

/// Build a skills tree with one skill, seed a recurring error against it,
/// and produce an approved error-pattern proposal.
async fn make_world() -> (World, String) {
    let dir = tempfile::tempdir().unwrap();
    let skills_dir = dir.path().join("skills");
    let skill_dir = skills_dir.join("x1-demo-audit");
    std::fs::create_dir_all(&skill_dir).unwrap();
    let source_file = skill_dir.join("index.js");
    std::fs::write(&source_file, SKILL_SOURCE).unwrap();
    std::fs::write(skill_dir.join("test.js"), "// exercises runAudit\n").unwrap();

    let logger = Arc::new(
        ErrorLogger::new(LoggerConfig {
            data_dir: dir.path().join("errors"),
            ..LoggerConfig::default()
        })
        .unwrap(),
    );
    let bus = EventBus::new().shared();

    let stack = format!(
        "Error: ECONNREFUSED 127.0.0.1\n    at runAudit ({}:4:20)\n    at dispatch (/core/node_modules/router/index.js:9:1)",
        source_file.display()
    );
    for _ in 0..3 {
        logger
            .capture(
                &SkillError::new("Error", "ECONNREFUSED 127.0.0.1").with_stack(stack.clone()),
                CaptureContext::new("demo-audit", "analyst"),
            )
            .await
            .unwrap();
    }

    let improvement = Arc::new(
        SelfImprovementLoop::new(
            LoopConfig {
                data_dir: dir.path().join("improvement-data"),
                ..LoopConfig::default()
            },
            logger.clone(),
            bus.clone(),
        )
        .unwrap(),
    );
    improvement.analyze(Some(1)).await.unwrap();
    let pending = improvement.list_proposals(&ProposalFilter::pending()).await;
    assert_eq!(pending.len(), 1);
    let proposal_id = pending[0].id.clone();
    improvement.approve_proposal(&proposal_id).await.unwrap();

    (
        World {
            _dir: dir,
            logger,
            improvement,
            bus,
            skills_dir,
            source_file,
        },
        proposal_id,
    )
}

fn make_engine(world: &World, runner_output: &str) -> AutoFixEngine {
    AutoFixEngine::new(
        AutoFixConfig {
            data_dir: world._dir.path().join("autofix-data"),
            skills_dir: world.skills_dir.clone(),
        },
        world.logger.clone(),
        world.improvement.clone(),
        world.bus.clone(),
    )
    .unwrap()
    .with_test_runner(Arc::new(StaticTestRunner {
        output: runner_output.to_string(),
    }))
}

#[tokio::test]
async fn test_generate_requires_approved_proposal() {
    let (world, _proposal_id) = make_world().await;
    let engine = make_engine(&world, "ok");

    let err = engine.generate_fix("missing").await.unwrap_err();
    assert!(matches!(err, supervision::FixError::ProposalNotFound(_)));
}

#[tokio::test]
async fn test_template_fix_generation() {
    let (world, proposal_id) = make_world().await;
    let engine = make_engine(&world, "ok");

    let fix = engine.generate_fix(&proposal_id).await.unwrap();
    assert_eq!(fix.status, FixStatus::Ready);
    assert_eq!(fix.source_file.as_ref().unwrap(), &world.source_file);
    assert_eq!(fix.original_code.as_deref(), Some(SKILL_SOURCE));
    // The network template injects the retry helper, marked for the diff.
    let fixed = fix.fixed_code.unwrap();
    assert!(fixed.contains("retryWithBackoff"));
    assert!(fixed.contains("[AUTO-FIX]"));
    assert!(fix.diff.unwrap().contains("+ // [AUTO-FIX] retry with exponential backoff"));
    assert!(fix.fingerprint.is_some());
    // Generation does not touch the source file.
    assert_eq!(
        std::fs::read_to_string(&world.source_file).unwrap(),
        SKILL_SOURCE
    );
}

#[tokio::test]
async fn test_apply_deploys_on_passing_test() {
    let (world, proposal_id) = make_world().await;
    let engine = make_engine(&world, "4 passing, 0 failed");

    let fix = engine.generate_fix(&proposal_id).await.unwrap();
    let fingerprint = fix.fingerprint.clone().unwrap();
    engine.approve_fix(&fix.id).await.unwrap();
    let applied = engine.apply_fix(&fix.id).await.unwrap();

    assert_eq!(applied.status, FixStatus::Deployed);
    assert!(applied.deployed_at.is_some());
    // The source now carries the patch.
    let deployed = std::fs::read_to_string(&world.source_file).unwrap();
    assert!(deployed.contains("retryWithBackoff"));
    // The fingerprint counter was cleared by the recorded fix.
    assert_eq!(world.logger.occurrence_count(&fingerprint).await, 0);
    // The originating proposal is applied.
    let proposal = world.improvement.get_proposal(&proposal_id).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Applied);
}

#[tokio::test]
async fn test_apply_rolls_back_on_failing_test() {
    let (world, proposal_id) = make_world().await;
    let engine = make_engine(&world, "2 of 4 tests failed");
    let mut rx = world.bus.subscribe();

    let fix = engine.generate_fix(&proposal_id).await.unwrap();
    engine.approve_fix(&fix.id).await.unwrap();
    let applied = engine.apply_fix(&fix.id).await.unwrap();

    assert_eq!(applied.status, FixStatus::RolledBack);
    // Byte-for-byte restoration of the pre-apply content.
    assert_eq!(
        std::fs::read_to_string(&world.source_file).unwrap(),
        SKILL_SOURCE
    );
    // A backup exists.
    let backup = applied.backup_path.unwrap();
    assert!(backup.exists());
    assert_eq!(std::fs::read_to_string(backup).unwrap(), SKILL_SOURCE);
    // The originating proposal remains approved, not applied.
    let proposal = world.improvement.get_proposal(&proposal_id).await.unwrap();
    assert_eq!(proposal.status, ProposalStatus::Approved);

    // The pipeline narrated its transitions.
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event.event_type());
    }
    assert!(seen.contains(&"fix-generating"));
    assert!(seen.contains(&"fix-ready"));
    assert!(seen.contains(&"fix-approved"));
    assert!(seen.contains(&"fix-testing"));
    assert!(seen.contains(&"fix-rolled-back"));
    assert!(seen.contains(&"pipeline-complete"));
}

#[tokio::test]
async fn test_missing_test_file_treated_as_pass() {
    let (world, proposal_id) = make_world().await;
    // Remove the test file; the pipeline must deploy with an annotation.
    std::fs::remove_file(world.skills_dir.join("x1-demo-audit").join("test.js")).unwrap();
    let engine = make_engine(&world, "irrelevant");

    let fix = engine.generate_fix(&proposal_id).await.unwrap();
    engine.approve_fix(&fix.id).await.unwrap();
    let applied = engine.apply_fix(&fix.id).await.unwrap();

    assert_eq!(applied.status, FixStatus::Deployed);
    assert!(applied
        .test_results
        .unwrap()
        .contains("no test file found"));
}

#[tokio::test]
async fn test_oracle_fix_generation_and_parse_failure() {
    let (world, proposal_id) = make_world().await;

    let engine = make_engine(&world, "ok").with_oracle(Arc::new(MockOracle::new(
        "EXPLANATION: Swapped in a retrying client.\n```javascript\nmodule.exports = async () => 'fixed';\n```",
    )));
    let fix = engine.generate_fix(&proposal_id).await.unwrap();
    assert_eq!(fix.status, FixStatus::Ready);
    assert_eq!(
        fix.fixed_code.as_deref(),
        Some("module.exports = async () => 'fixed';")
    );
    assert_eq!(
        fix.explanation.as_deref(),
        Some("Swapped in a retrying client.")
    );

    // An oracle answer without a code block is a synthesis failure.
    let engine =
        make_engine(&world, "ok").with_oracle(Arc::new(MockOracle::new("no code here")));
    let err = engine.generate_fix(&proposal_id).await.unwrap_err();
    assert!(matches!(err, supervision::FixError::NoCodeBlock));
    let failed = engine
        .list_fixes()
        .await
        .into_iter()
        .find(|f| f.status == FixStatus::Failed)
        .unwrap();
    assert!(failed.failure_reason.unwrap().contains("no code block"));
}

#[tokio::test]
async fn test_reject_blocks_apply() {
    let (world, proposal_id) = make_world().await;
    let engine = make_engine(&world, "ok");

    let fix = engine.generate_fix(&proposal_id).await.unwrap();
    engine
        .reject_fix(&fix.id, Some("too invasive".to_string()))
        .await
        .unwrap();
    let err = engine.apply_fix(&fix.id).await.unwrap_err();
    assert!(matches!(err, supervision::FixError::InvalidStatus { .. }));
    // The source file was never touched.
    assert_eq!(
        std::fs::read_to_string(&world.source_file).unwrap(),
        SKILL_SOURCE
    );
}

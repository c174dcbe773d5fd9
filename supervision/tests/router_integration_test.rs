//! Router integration tests: priority selection, lifecycle events, and
//! analytics aggregation across routed calls.

use std::sync::Arc;

use serde_json::json;
use supervision::{
    handler_fn, priority, ErrorLogger, EventBus, LoggerConfig, RouteBuilder, SkillError,
    WorkflowRouter,
};

fn make_router(dir: &tempfile::TempDir) -> (Arc<WorkflowRouter>, supervision::SharedEventBus) {
    let logger = Arc::new(
        ErrorLogger::new(LoggerConfig {
            data_dir: dir.path().join("errors"),
            ..LoggerConfig::default()
        })
        .unwrap(),
    );
    let bus = EventBus::new().shared();
    (WorkflowRouter::new(logger, bus.clone()).shared(), bus)
}

// ── Property: the numerically lower priority wins, regardless of
// insertion order ──

#[tokio::test]
async fn prop_lower_priority_number_wins() {
    let pairs = [
        (priority::CRITICAL, priority::HIGH),
        (priority::HIGH, priority::NORMAL),
        (priority::NORMAL, priority::LOW),
        (priority::LOW, priority::FALLBACK),
        (priority::CRITICAL, priority::FALLBACK),
    ];

    for (winner_priority, loser_priority) in pairs {
        let dir = tempfile::tempdir().unwrap();
        let (router, _bus) = make_router(&dir);

        // Insert the loser first so ordering cannot come from insertion.
        router
            .add_route(
                RouteBuilder::new("loser", handler_fn(|_| async { Ok(json!("loser")) }))
                    .pattern("^probe$")
                    .priority(loser_priority),
            )
            .await
            .unwrap();
        router
            .add_route(
                RouteBuilder::new("winner", handler_fn(|_| async { Ok(json!("winner")) }))
                    .pattern("^probe$")
                    .priority(winner_priority),
            )
            .await
            .unwrap();

        let outcome = router.route("probe", json!({})).await.unwrap();
        assert_eq!(
            outcome.skill.as_deref(),
            Some("winner"),
            "priorities {winner_priority} vs {loser_priority}"
        );
    }
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (router, bus) = make_router(&dir);
    let mut rx = bus.subscribe();

    router
        .add_route(
            RouteBuilder::new("ping", handler_fn(|_| async { Ok(json!("pong")) }))
                .pattern("^ping$"),
        )
        .await
        .unwrap();

    router.route("ping", json!({})).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().event_type(), "match");
    assert_eq!(rx.recv().await.unwrap().event_type(), "success");

    router.route("unknown message", json!({})).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().event_type(), "no-match");
}

#[tokio::test]
async fn test_error_event_carries_record() {
    let dir = tempfile::tempdir().unwrap();
    let (router, bus) = make_router(&dir);
    let mut rx = bus.subscribe();

    router
        .add_route(
            RouteBuilder::new(
                "flaky",
                handler_fn(|_| async { Err(SkillError::new("Error", "ETIMEDOUT")) }),
            )
            .pattern("^run$"),
        )
        .await
        .unwrap();

    router.route("run", json!({})).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().event_type(), "match");
    let event = rx.recv().await.unwrap();
    assert_eq!(event.event_type(), "error");
    match event {
        supervision::SupervisionEvent::SkillFailed { record, .. } => {
            assert_eq!(
                record.classification(),
                Some(supervision::ErrorClass::Timeout)
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_analytics_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    let (router, _bus) = make_router(&dir);

    router
        .add_route(
            RouteBuilder::new(
                "mixed",
                handler_fn(|req| async move {
                    if req.message.contains("fail") {
                        Err(SkillError::new("Error", "boom"))
                    } else {
                        Ok(json!("ok"))
                    }
                }),
            )
            .pattern("^mixed.*"),
        )
        .await
        .unwrap();

    for message in ["mixed ok", "mixed ok", "mixed ok", "mixed fail"] {
        router.route(message, json!({})).await.unwrap();
    }
    for message in ["nope 1", "nope 2"] {
        router.route(message, json!({})).await.unwrap();
    }

    let summary = router.analytics_summary().await;
    let mixed = &summary.routes["mixed"];
    assert_eq!(mixed.hits, 4);
    assert_eq!(mixed.executions.total, 4);
    assert_eq!(mixed.executions.successes, 3);
    assert_eq!(mixed.executions.failures, 1);
    assert!((mixed.success_rate - 75.0).abs() < f64::EPSILON);
    assert_eq!(summary.recent_unmatched.len(), 2);
    assert_eq!(summary.recent_unmatched[0].message, "nope 2");
}

#[tokio::test]
async fn test_parallel_dispatch_settles_all() {
    let dir = tempfile::tempdir().unwrap();
    let (router, _bus) = make_router(&dir);

    for name in ["alpha", "beta", "gamma"] {
        let label = name.to_string();
        router
            .add_route(
                RouteBuilder::new(
                    name,
                    handler_fn(move |_| {
                        let label = label.clone();
                        async move { Ok(json!({ "from": label })) }
                    }),
                )
                .pattern(&format!("^{name}$")),
            )
            .await
            .unwrap();
    }

    let dispatch = router
        .dispatch_parallel(&["alpha", "beta", "gamma", "delta"], json!({ "n": 1 }))
        .await
        .unwrap();

    assert_eq!(dispatch.results.len(), 3);
    assert_eq!(dispatch.results["alpha"], json!({ "from": "alpha" }));
    assert_eq!(dispatch.errors.len(), 1);
    assert!(dispatch.errors["delta"].contains("Unknown route"));

    // Executions were recorded for the known routes.
    let summary = router.analytics_summary().await;
    assert_eq!(summary.routes["beta"].executions.total, 1);
}

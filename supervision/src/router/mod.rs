//! Workflow routing: one asynchronous entry point that turns an opaque
//! message into a typed outcome.
//!
//! 1. **Routes** (`route.rs`): declarative skill bindings with patterns,
//!    aliases, priority tiers, risk levels, and pre-checks.
//! 2. **Analytics** (`analytics.rs`): hit/execution counters and the
//!    unmatched-message ring that feeds new-route discovery.
//! 3. **Router** (this file): matching, the execution pipeline
//!    (middleware → pre-checks → wrapped handler), event emission,
//!    fallback, and parallel dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

pub mod analytics;
pub mod route;

pub use analytics::{
    AnalyticsSummary, ExecutionStats, RouteAnalytics, RouteSummary, UnmatchedMessage,
};
pub use route::{
    handler_fn, priority, PreCheck, PreCheckResult, RiskLevel, Route, RouteBuilder, SkillHandler,
    SkillRequest,
};

use crate::errlog::{CaptureContext, ErrorLogger, LogError, OutcomeRecord, SkillError};
use crate::events::{SharedEventBus, SupervisionEvent};

/// Message previews in events are truncated to this length.
const PREVIEW_MAX: usize = 100;

/// Pseudo-skills failures in middleware are logged against.
const MIDDLEWARE_PRE_SKILL: &str = "middleware-pre";
const MIDDLEWARE_POST_SKILL: &str = "middleware-post";

/// Errors from the routing subsystem.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// A route pattern failed to compile.
    #[error("Invalid pattern for route '{route}': {source}")]
    InvalidPattern {
        route: String,
        source: regex::Error,
    },

    /// A route with this name already exists.
    #[error("Duplicate route name '{0}'")]
    DuplicateRoute(String),

    /// The logger failed to persist an outcome.
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Result type alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// What a pre-middleware asks the pipeline to do.
#[derive(Debug, Clone)]
pub enum MiddlewareAction {
    Continue,
    /// Deliberately short-circuit the pipeline (the plan-gate integration
    /// path). Reported to the caller as a pre-check failure.
    Abort { reason: String },
}

/// Middleware running before the handler.
///
/// An `Err` is logged against the `middleware-pre` pseudo-skill and does
/// not abort the call; aborting requires an explicit
/// [`MiddlewareAction::Abort`].
#[async_trait]
pub trait PreMiddleware: Send + Sync {
    async fn before(
        &self,
        request: &SkillRequest,
        route: &str,
        risk: RiskLevel,
    ) -> Result<MiddlewareAction, SkillError>;
}

/// Middleware running after the handler, with the outcome.
///
/// An `Err` is logged against the `middleware-post` pseudo-skill and does
/// not alter the outcome.
#[async_trait]
pub trait PostMiddleware: Send + Sync {
    async fn after(&self, outcome: &RouteOutcome) -> Result<(), SkillError>;
}

/// Typed outcome of one `route()` call.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub matched: bool,
    pub skill: Option<String>,
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// The persisted logger record, when the handler ran.
    pub record: Option<OutcomeRecord>,
    pub duration_ms: u64,
}

impl RouteOutcome {
    fn no_match() -> Self {
        Self {
            matched: false,
            skill: None,
            ok: false,
            result: None,
            error: Some("No matching route".to_string()),
            record: None,
            duration_ms: 0,
        }
    }

    fn aborted(skill: &str, reason: String) -> Self {
        Self {
            matched: true,
            skill: Some(skill.to_string()),
            ok: false,
            result: None,
            error: Some(reason),
            record: None,
            duration_ms: 0,
        }
    }
}

/// Results of a parallel dispatch, keyed deterministically by route name.
#[derive(Debug, Clone, Default)]
pub struct ParallelDispatch {
    pub results: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, String>,
}

/// The workflow router. Holds the ordered route list and dispatches
/// messages through the logger-wrapped execution pipeline.
pub struct WorkflowRouter {
    routes: RwLock<Vec<Route>>,
    pre_middleware: RwLock<Vec<Arc<dyn PreMiddleware>>>,
    post_middleware: RwLock<Vec<Arc<dyn PostMiddleware>>>,
    fallback: RwLock<Option<Arc<dyn SkillHandler>>>,
    analytics: Mutex<RouteAnalytics>,
    logger: Arc<ErrorLogger>,
    bus: SharedEventBus,
}

impl WorkflowRouter {
    pub fn new(logger: Arc<ErrorLogger>, bus: SharedEventBus) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            pre_middleware: RwLock::new(Vec::new()),
            post_middleware: RwLock::new(Vec::new()),
            fallback: RwLock::new(None),
            analytics: Mutex::new(RouteAnalytics::new()),
            logger,
            bus,
        }
    }

    /// Create a shared reference to this router.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Compile and add a route, keeping the list ordered by priority.
    /// Insertion order is preserved within a priority tier.
    pub async fn add_route(&self, builder: RouteBuilder) -> RouterResult<()> {
        let name = builder.name().to_string();
        let route = builder
            .build()
            .map_err(|source| RouterError::InvalidPattern { route: name, source })?;
        let mut routes = self.routes.write().await;
        if routes.iter().any(|r| r.name == route.name) {
            return Err(RouterError::DuplicateRoute(route.name));
        }
        let position = routes
            .iter()
            .position(|r| r.priority > route.priority)
            .unwrap_or(routes.len());
        info!(route = %route.name, priority = route.priority, risk = %route.risk, "route added");
        routes.insert(position, route);
        Ok(())
    }

    /// Enable or disable a route by name. Returns false if unknown.
    pub async fn set_route_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut routes = self.routes.write().await;
        match routes.iter_mut().find(|r| r.name == name) {
            Some(route) => {
                route.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Register a pre-middleware. Runs in registration order.
    pub async fn use_pre(&self, middleware: Arc<dyn PreMiddleware>) {
        self.pre_middleware.write().await.push(middleware);
    }

    /// Register a post-middleware. Runs in registration order.
    pub async fn use_post(&self, middleware: Arc<dyn PostMiddleware>) {
        self.post_middleware.write().await.push(middleware);
    }

    /// Set the handler invoked when no route matches.
    pub async fn set_fallback(&self, handler: Arc<dyn SkillHandler>) {
        *self.fallback.write().await = Some(handler);
    }

    /// Names of all declared routes, in priority order.
    pub async fn route_names(&self) -> Vec<String> {
        self.routes.read().await.iter().map(|r| r.name.clone()).collect()
    }

    /// Snapshot of the analytics summary.
    pub async fn analytics_summary(&self) -> AnalyticsSummary {
        self.analytics.lock().await.summary()
    }

    /// The full unmatched-message ring, oldest first.
    pub async fn unmatched_messages(&self) -> Vec<UnmatchedMessage> {
        self.analytics.lock().await.unmatched()
    }

    /// Route a message to the first matching skill and execute it.
    pub async fn route(&self, message: &str, context: Value) -> RouterResult<RouteOutcome> {
        let trimmed = message.trim();

        let matched = {
            let routes = self.routes.read().await;
            routes.iter().find_map(|route| {
                if !route.enabled {
                    return None;
                }
                route.patterns.iter().find_map(|pattern| {
                    pattern.captures(trimmed).map(|caps| {
                        let captures = caps
                            .iter()
                            .map(|c| c.map(|m| m.as_str().to_string()))
                            .collect::<Vec<_>>();
                        (
                            route.name.clone(),
                            route.agent.clone(),
                            route.risk,
                            route.handler.clone(),
                            route.pre_checks.clone(),
                            captures,
                        )
                    })
                })
            })
        };

        let Some((name, agent, risk, handler, pre_checks, captures)) = matched else {
            return self.handle_unmatched(trimmed, context).await;
        };

        self.analytics.lock().await.record_hit(&name);
        self.bus.publish(SupervisionEvent::RouteMatched {
            skill: name.clone(),
            agent: agent.clone(),
            timestamp: Utc::now(),
        });

        let request = SkillRequest {
            message: trimmed.to_string(),
            captures,
            context: context.clone(),
        };

        // Pre-middleware: errors are contained, aborts short-circuit.
        let pre_middleware = self.pre_middleware.read().await.clone();
        for middleware in pre_middleware {
            match middleware.before(&request, &name, risk).await {
                Ok(MiddlewareAction::Continue) => {}
                Ok(MiddlewareAction::Abort { reason }) => {
                    debug!(route = %name, reason = %reason, "pipeline aborted by middleware");
                    return Ok(RouteOutcome::aborted(&name, reason));
                }
                Err(error) => {
                    self.logger
                        .capture(&error, CaptureContext::new(MIDDLEWARE_PRE_SKILL, "system"))
                        .await?;
                }
            }
        }

        for check in &pre_checks {
            let result = check(&request);
            if !result.pass {
                let reason = result.reason.unwrap_or_else(|| "unspecified".to_string());
                return Ok(RouteOutcome::aborted(
                    &name,
                    format!("Pre-check failed: {reason}"),
                ));
            }
        }

        let input = json!({ "message": trimmed, "context": context });
        let outcome = self
            .logger
            .run(
                &name,
                &agent,
                Some(input),
                Some(risk.default_severity()),
                handler.handle(request),
            )
            .await?;

        self.analytics
            .lock()
            .await
            .record_execution(&name, outcome.ok, outcome.duration_ms);

        let route_outcome = RouteOutcome {
            matched: true,
            skill: Some(name.clone()),
            ok: outcome.ok,
            result: outcome.result,
            error: outcome.error.as_ref().map(|e| e.to_string()),
            record: outcome.record,
            duration_ms: outcome.duration_ms,
        };

        // Post-middleware: errors are contained.
        let post_middleware = self.post_middleware.read().await.clone();
        for middleware in post_middleware {
            if let Err(error) = middleware.after(&route_outcome).await {
                self.logger
                    .capture(&error, CaptureContext::new(MIDDLEWARE_POST_SKILL, "system"))
                    .await?;
            }
        }

        // Lifecycle events fire strictly after the post-middleware chain.
        if route_outcome.ok {
            self.bus.publish(SupervisionEvent::SkillSucceeded {
                skill: name,
                duration_ms: route_outcome.duration_ms,
                timestamp: Utc::now(),
            });
        } else if let Some(record) = route_outcome.record.clone() {
            self.bus.publish(SupervisionEvent::SkillFailed {
                skill: name,
                record,
                timestamp: Utc::now(),
            });
        }

        Ok(route_outcome)
    }

    /// Invoke the named routes concurrently with a shared input.
    ///
    /// Unknown names produce a per-name error without aborting the others.
    /// Completion order is not guaranteed; the maps are keyed by name.
    pub async fn dispatch_parallel(
        &self,
        names: &[&str],
        input: Value,
    ) -> RouterResult<ParallelDispatch> {
        let targets: Vec<(String, Option<(Arc<dyn SkillHandler>, String, RiskLevel)>)> = {
            let routes = self.routes.read().await;
            names
                .iter()
                .map(|name| {
                    let found = routes
                        .iter()
                        .find(|r| r.name == *name)
                        .map(|r| (r.handler.clone(), r.agent.clone(), r.risk));
                    (name.to_string(), found)
                })
                .collect()
        };

        let tasks = targets.into_iter().map(|(name, target)| {
            let input = input.clone();
            async move {
                match target {
                    None => (name.clone(), Err(format!("Unknown route: {name}")), None),
                    Some((handler, agent, risk)) => {
                        let request = SkillRequest {
                            message: String::new(),
                            captures: Vec::new(),
                            context: input.clone(),
                        };
                        let run = self
                            .logger
                            .run(
                                &name,
                                &agent,
                                Some(input),
                                Some(risk.default_severity()),
                                handler.handle(request),
                            )
                            .await;
                        match run {
                            Ok(outcome) => {
                                let duration = outcome.duration_ms;
                                let ok = outcome.ok;
                                let payload = if ok {
                                    Ok(outcome.result.unwrap_or(Value::Null))
                                } else {
                                    Err(outcome
                                        .error
                                        .map(|e| e.to_string())
                                        .unwrap_or_else(|| "handler failed".to_string()))
                                };
                                (name, payload, Some((ok, duration)))
                            }
                            Err(e) => (name, Err(format!("log failure: {e}")), None),
                        }
                    }
                }
            }
        });

        let mut dispatch = ParallelDispatch::default();
        let mut analytics = Vec::new();
        for (name, payload, stats) in join_all(tasks).await {
            if let Some((ok, duration)) = stats {
                analytics.push((name.clone(), ok, duration));
            }
            match payload {
                Ok(value) => {
                    dispatch.results.insert(name, value);
                }
                Err(error) => {
                    dispatch.errors.insert(name, error);
                }
            }
        }

        let mut guard = self.analytics.lock().await;
        for (name, ok, duration) in analytics {
            guard.record_execution(&name, ok, duration);
        }
        Ok(dispatch)
    }

    async fn handle_unmatched(&self, trimmed: &str, context: Value) -> RouterResult<RouteOutcome> {
        self.analytics.lock().await.record_unmatched(trimmed);
        let mut preview = trimmed.to_string();
        crate::errlog::truncate_utf8(&mut preview, PREVIEW_MAX);
        self.bus.publish(SupervisionEvent::RouteMissed {
            message_preview: preview,
            timestamp: Utc::now(),
        });

        let fallback = self.fallback.read().await.clone();
        let Some(handler) = fallback else {
            return Ok(RouteOutcome::no_match());
        };

        let request = SkillRequest {
            message: trimmed.to_string(),
            captures: Vec::new(),
            context: context.clone(),
        };
        let input = json!({ "message": trimmed, "context": context });
        let outcome = self
            .logger
            .run("fallback", "system", Some(input), None, handler.handle(request))
            .await?;
        Ok(RouteOutcome {
            matched: false,
            skill: Some("fallback".to_string()),
            ok: outcome.ok,
            result: outcome.result,
            error: outcome.error.as_ref().map(|e| e.to_string()),
            record: outcome.record,
            duration_ms: outcome.duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errlog::LoggerConfig;
    use crate::events::EventBus;

    fn make_router() -> (tempfile::TempDir, WorkflowRouter) {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(
            ErrorLogger::new(LoggerConfig {
                data_dir: dir.path().join("errors"),
                ..LoggerConfig::default()
            })
            .unwrap(),
        );
        let bus = EventBus::new().shared();
        (dir, WorkflowRouter::new(logger, bus))
    }

    fn echo_handler() -> Arc<dyn SkillHandler> {
        handler_fn(|req| async move { Ok(json!({ "echo": req.message })) })
    }

    #[tokio::test]
    async fn test_first_pattern_in_priority_order_wins() {
        let (_dir, router) = make_router();
        router
            .add_route(
                RouteBuilder::new("generic", handler_fn(|_| async { Ok(json!("generic")) }))
                    .pattern(r"(?i)price")
                    .priority(priority::NORMAL),
            )
            .await
            .unwrap();
        router
            .add_route(
                RouteBuilder::new("specific", handler_fn(|_| async { Ok(json!("specific")) }))
                    .pattern(r"(?i)^price\s+\w+")
                    .priority(priority::HIGH),
            )
            .await
            .unwrap();

        let outcome = router.route("price BTC", json!({})).await.unwrap();
        assert_eq!(outcome.skill.as_deref(), Some("specific"));
        assert_eq!(outcome.result, Some(json!("specific")));
    }

    #[tokio::test]
    async fn test_disabled_route_skipped() {
        let (_dir, router) = make_router();
        router
            .add_route(
                RouteBuilder::new("ping", echo_handler())
                    .pattern("^ping$")
                    .disabled(),
            )
            .await
            .unwrap();
        let outcome = router.route("ping", json!({})).await.unwrap();
        assert!(!outcome.matched);

        assert!(router.set_route_enabled("ping", true).await);
        let outcome = router.route("ping", json!({})).await.unwrap();
        assert!(outcome.matched);
    }

    #[tokio::test]
    async fn test_duplicate_route_rejected() {
        let (_dir, router) = make_router();
        router
            .add_route(RouteBuilder::new("ping", echo_handler()).pattern("^ping$"))
            .await
            .unwrap();
        let err = router
            .add_route(RouteBuilder::new("ping", echo_handler()).pattern("^ping$"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::DuplicateRoute(_)));
    }

    #[tokio::test]
    async fn test_no_match_outcome_and_ring() {
        let (_dir, router) = make_router();
        let outcome = router.route("  completely unknown  ", json!({})).await.unwrap();
        assert!(!outcome.matched);
        assert_eq!(outcome.error.as_deref(), Some("No matching route"));
        let unmatched = router.unmatched_messages().await;
        assert_eq!(unmatched.len(), 1);
        // Message was trimmed before storage.
        assert_eq!(unmatched[0].message, "completely unknown");
    }

    #[tokio::test]
    async fn test_pre_check_failure_short_circuits() {
        let (_dir, router) = make_router();
        router
            .add_route(
                RouteBuilder::new("guarded", echo_handler())
                    .pattern("^go$")
                    .pre_check(|_| PreCheckResult::fail("not ready")),
            )
            .await
            .unwrap();
        let outcome = router.route("go", json!({})).await.unwrap();
        assert!(outcome.matched);
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("Pre-check failed: not ready"));
        // The handler never ran.
        let summary = router.analytics_summary().await;
        assert_eq!(summary.routes["guarded"].executions.total, 0);
    }

    #[tokio::test]
    async fn test_handler_failure_captured_not_propagated() {
        let (_dir, router) = make_router();
        router
            .add_route(
                RouteBuilder::new(
                    "flaky",
                    handler_fn(|_| async { Err(SkillError::new("Error", "ECONNREFUSED")) }),
                )
                .pattern("^run$"),
            )
            .await
            .unwrap();
        let outcome = router.route("run", json!({})).await.unwrap();
        assert!(outcome.matched);
        assert!(!outcome.ok);
        let record = outcome.record.unwrap();
        assert_eq!(
            record.classification(),
            Some(crate::errlog::ErrorClass::Network)
        );
    }

    #[tokio::test]
    async fn test_capture_groups_reach_handler() {
        let (_dir, router) = make_router();
        router
            .add_route(
                RouteBuilder::new(
                    "price",
                    handler_fn(|req| async move {
                        Ok(json!({ "symbol": req.captures[1].clone() }))
                    }),
                )
                .pattern(r"(?i)^price\s+(\w+)$"),
            )
            .await
            .unwrap();
        let outcome = router.route("price BTC", json!({})).await.unwrap();
        assert_eq!(outcome.result, Some(json!({ "symbol": "BTC" })));
    }

    #[tokio::test]
    async fn test_fallback_invoked_only_without_match() {
        let (_dir, router) = make_router();
        router
            .set_fallback(handler_fn(|_| async { Ok(json!("fell back")) }))
            .await;
        router
            .add_route(RouteBuilder::new("ping", echo_handler()).pattern("^ping$"))
            .await
            .unwrap();

        let outcome = router.route("unknown", json!({})).await.unwrap();
        assert!(!outcome.matched);
        assert_eq!(outcome.result, Some(json!("fell back")));

        let outcome = router.route("ping", json!({})).await.unwrap();
        assert!(outcome.matched);
        assert_ne!(outcome.result, Some(json!("fell back")));
    }

    #[tokio::test]
    async fn test_parallel_dispatch_by_name() {
        let (_dir, router) = make_router();
        router
            .add_route(
                RouteBuilder::new("a", handler_fn(|_| async { Ok(json!("A")) })).pattern("^a$"),
            )
            .await
            .unwrap();
        router
            .add_route(
                RouteBuilder::new(
                    "b",
                    handler_fn(|_| async { Err(SkillError::new("Error", "boom")) }),
                )
                .pattern("^b$"),
            )
            .await
            .unwrap();

        let dispatch = router
            .dispatch_parallel(&["a", "b", "missing"], json!({ "shared": true }))
            .await
            .unwrap();
        assert_eq!(dispatch.results["a"], json!("A"));
        assert!(dispatch.errors["b"].contains("boom"));
        assert!(dispatch.errors["missing"].contains("Unknown route"));
    }

    #[tokio::test]
    async fn test_middleware_abort_and_containment() {
        let (_dir, router) = make_router();

        struct Gatekeeper;
        #[async_trait]
        impl PreMiddleware for Gatekeeper {
            async fn before(
                &self,
                request: &SkillRequest,
                _route: &str,
                _risk: RiskLevel,
            ) -> Result<MiddlewareAction, SkillError> {
                if request.message.contains("blocked") {
                    Ok(MiddlewareAction::Abort {
                        reason: "Pre-check failed: plan rejected".to_string(),
                    })
                } else {
                    Ok(MiddlewareAction::Continue)
                }
            }
        }

        struct Broken;
        #[async_trait]
        impl PreMiddleware for Broken {
            async fn before(
                &self,
                _request: &SkillRequest,
                _route: &str,
                _risk: RiskLevel,
            ) -> Result<MiddlewareAction, SkillError> {
                Err(SkillError::new("Error", "middleware exploded"))
            }
        }

        router.use_pre(Arc::new(Broken)).await;
        router.use_pre(Arc::new(Gatekeeper)).await;
        router
            .add_route(RouteBuilder::new("echo", echo_handler()).pattern("^say .+"))
            .await
            .unwrap();

        // Broken middleware is contained; the call still succeeds.
        let outcome = router.route("say hi", json!({})).await.unwrap();
        assert!(outcome.ok);

        // Deliberate abort short-circuits.
        let outcome = router.route("say blocked", json!({})).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("plan rejected"));
    }
}

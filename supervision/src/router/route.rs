//! Route declarations — the binding between message patterns and skills.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errlog::{Severity, SkillError};

/// Canonical priority tiers. Lower sorts earlier.
pub mod priority {
    pub const CRITICAL: i32 = 0;
    pub const HIGH: i32 = 1;
    pub const NORMAL: i32 = 2;
    pub const LOW: i32 = 3;
    pub const FALLBACK: i32 = 99;
}

/// Risk level of a skill. Drives gate policy and default severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Default capture severity for failures of a skill at this risk.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::Critical => Severity::Critical,
            Self::High => Severity::High,
            Self::Medium => Severity::Medium,
            Self::Low | Self::None => Severity::Low,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Request handed to a matched skill handler.
#[derive(Debug, Clone)]
pub struct SkillRequest {
    /// The trimmed incoming message.
    pub message: String,
    /// Capture groups from the matching pattern; index 0 is the full match.
    pub captures: Vec<Option<String>>,
    /// Caller-supplied context (user, chat, arbitrary metadata).
    pub context: Value,
}

/// A named, invokable unit of work bound to a route.
#[async_trait]
pub trait SkillHandler: Send + Sync {
    async fn handle(&self, request: SkillRequest) -> Result<Value, SkillError>;
}

/// Wrap an async closure as a [`SkillHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn SkillHandler>
where
    F: Fn(SkillRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, SkillError>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> SkillHandler for FnHandler<F>
    where
        F: Fn(SkillRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SkillError>> + Send + 'static,
    {
        async fn handle(&self, request: SkillRequest) -> Result<Value, SkillError> {
            (self.0)(request).await
        }
    }

    Arc::new(FnHandler(f))
}

/// Outcome of a pre-check predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreCheckResult {
    pub pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PreCheckResult {
    pub fn pass() -> Self {
        Self {
            pass: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            pass: false,
            reason: Some(reason.into()),
        }
    }
}

/// Ordered predicate evaluated before a route's handler runs.
pub type PreCheck = Arc<dyn Fn(&SkillRequest) -> PreCheckResult + Send + Sync>;

/// Declarative skill binding held by the router.
///
/// Routes are added imperatively and never mutated afterwards except via
/// explicit enable/disable.
#[derive(Clone)]
pub struct Route {
    pub name: String,
    pub patterns: Vec<Regex>,
    pub aliases: Vec<String>,
    pub handler: Arc<dyn SkillHandler>,
    pub agent: String,
    pub priority: i32,
    pub risk: RiskLevel,
    pub auto_execute: bool,
    pub pre_checks: Vec<PreCheck>,
    pub enabled: bool,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("patterns", &self.patterns.len())
            .field("aliases", &self.aliases)
            .field("agent", &self.agent)
            .field("priority", &self.priority)
            .field("risk", &self.risk)
            .field("auto_execute", &self.auto_execute)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Builder for [`Route`]. Pattern strings are compiled at build time.
pub struct RouteBuilder {
    name: String,
    patterns: Vec<String>,
    aliases: Vec<String>,
    handler: Arc<dyn SkillHandler>,
    agent: String,
    priority: i32,
    risk: RiskLevel,
    auto_execute: Option<bool>,
    pre_checks: Vec<PreCheck>,
    enabled: bool,
}

impl RouteBuilder {
    /// Name of the route under construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn new(name: impl Into<String>, handler: Arc<dyn SkillHandler>) -> Self {
        Self {
            name: name.into(),
            patterns: Vec::new(),
            aliases: Vec::new(),
            handler,
            agent: "system".to_string(),
            priority: priority::NORMAL,
            risk: RiskLevel::Low,
            auto_execute: None,
            pre_checks: Vec::new(),
            enabled: true,
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn auto_execute(mut self, auto_execute: bool) -> Self {
        self.auto_execute = Some(auto_execute);
        self
    }

    pub fn pre_check(
        mut self,
        check: impl Fn(&SkillRequest) -> PreCheckResult + Send + Sync + 'static,
    ) -> Self {
        self.pre_checks.push(Arc::new(check));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Compile patterns and aliases into a [`Route`].
    ///
    /// Each alias `a` expands into the additional pattern `(?i)^a\b`,
    /// appended after the declared patterns.
    pub fn build(self) -> Result<Route, regex::Error> {
        let mut patterns = Vec::with_capacity(self.patterns.len() + self.aliases.len());
        for pattern in &self.patterns {
            patterns.push(Regex::new(pattern)?);
        }
        for alias in &self.aliases {
            patterns.push(Regex::new(&format!(r"(?i)^{}\b", regex::escape(alias)))?);
        }
        let auto_execute = self
            .auto_execute
            .unwrap_or(!matches!(self.risk, RiskLevel::High | RiskLevel::Critical));
        Ok(Route {
            name: self.name,
            patterns,
            aliases: self.aliases,
            handler: self.handler,
            agent: self.agent,
            priority: self.priority,
            risk: self.risk,
            auto_execute,
            pre_checks: self.pre_checks,
            enabled: self.enabled,
        })
    }
}

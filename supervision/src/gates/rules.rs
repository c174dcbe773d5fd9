//! Verification rule engine: the built-in output checks plus custom
//! global and skill-scoped rules.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::GateContext;

/// Minimum token length considered when checking input reflection.
const REFLECTION_TOKEN_MIN: usize = 4;

/// Outcome of a single rule check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CheckOutcome {
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

/// A rule check annotated with the rule that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCheck {
    pub rule: String,
    pub pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A verification rule over a skill's output.
///
/// A rule that returns `Err` is treated as a failed check, never
/// propagated.
pub trait VerifyRule: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn check(&self, output: &Value, ctx: &GateContext) -> Result<CheckOutcome, String>;
}

/// Wrap a closure as a [`VerifyRule`].
pub fn rule_fn(
    name: impl Into<String>,
    check: impl Fn(&Value, &GateContext) -> Result<CheckOutcome, String> + Send + Sync + 'static,
) -> Arc<dyn VerifyRule> {
    struct FnRule<F> {
        name: String,
        check: F,
    }

    impl<F> VerifyRule for FnRule<F>
    where
        F: Fn(&Value, &GateContext) -> Result<CheckOutcome, String> + Send + Sync,
    {
        fn name(&self) -> &str {
            &self.name
        }

        fn check(&self, output: &Value, ctx: &GateContext) -> Result<CheckOutcome, String> {
            (self.check)(output, ctx)
        }
    }

    Arc::new(FnRule {
        name: name.into(),
        check,
    })
}

/// Run a rule set in declaration order, converting rule panics-by-Err into
/// failed checks.
pub fn run_rules(
    rules: &[Arc<dyn VerifyRule>],
    output: &Value,
    ctx: &GateContext,
) -> Vec<RuleCheck> {
    rules
        .iter()
        .map(|rule| match rule.check(output, ctx) {
            Ok(outcome) => RuleCheck {
                rule: rule.name().to_string(),
                pass: outcome.pass,
                reason: outcome.reason,
            },
            Err(message) => RuleCheck {
                rule: rule.name().to_string(),
                pass: false,
                reason: Some(format!("Rule threw error: {message}")),
            },
        })
        .collect()
}

/// The built-in rules applied to every verify-gate evaluation.
pub fn builtin_rules() -> Vec<Arc<dyn VerifyRule>> {
    vec![
        Arc::new(OutputPresent),
        Arc::new(NotErrorShaped),
        Arc::new(InputReflected),
    ]
}

/// Output must be non-nil.
struct OutputPresent;

impl VerifyRule for OutputPresent {
    fn name(&self) -> &str {
        "output-present"
    }

    fn description(&self) -> &str {
        "Output is non-nil"
    }

    fn check(&self, output: &Value, _ctx: &GateContext) -> Result<CheckOutcome, String> {
        if output.is_null() {
            Ok(CheckOutcome::fail("Output is empty"))
        } else {
            Ok(CheckOutcome::pass())
        }
    }
}

/// Output must not be a structured error.
struct NotErrorShaped;

impl VerifyRule for NotErrorShaped {
    fn name(&self) -> &str {
        "not-error-shaped"
    }

    fn description(&self) -> &str {
        "Output is not a structured error"
    }

    fn check(&self, output: &Value, _ctx: &GateContext) -> Result<CheckOutcome, String> {
        if output.get("error").and_then(Value::as_bool) == Some(true) {
            return Ok(CheckOutcome::fail("Output carries error=true"));
        }
        if let Some(status) = output.get("status").and_then(Value::as_str) {
            if status == "error" || status == "failed" {
                return Ok(CheckOutcome::fail(format!("Output status is '{status}'")));
            }
        }
        Ok(CheckOutcome::pass())
    }
}

/// When the original input is available, at least one substantial token
/// from it must appear in the output.
struct InputReflected;

impl VerifyRule for InputReflected {
    fn name(&self) -> &str {
        "input-reflected"
    }

    fn description(&self) -> &str {
        "Output references the input"
    }

    fn check(&self, output: &Value, ctx: &GateContext) -> Result<CheckOutcome, String> {
        let Some(input) = &ctx.original_input else {
            return Ok(CheckOutcome::pass());
        };
        let input_text = serde_json::to_string(input).unwrap_or_default();
        let output_text = serde_json::to_string(output)
            .unwrap_or_default()
            .to_lowercase();

        let reflected = tokens(&input_text)
            .into_iter()
            .any(|token| output_text.contains(&token));
        if reflected {
            Ok(CheckOutcome::pass())
        } else {
            Ok(CheckOutcome::fail(
                "Output shares no substantial token with the input",
            ))
        }
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= REFLECTION_TOKEN_MIN)
        .map(String::from)
        .collect()
}

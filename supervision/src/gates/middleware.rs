//! Router integration: the plan gate as a pre-middleware.
//!
//! When attached, every routed execution passes the plan gate before its
//! handler runs; a gate that does not pass deliberately aborts the
//! pipeline, which the router reports as a pre-check failure.

use std::sync::Arc;

use async_trait::async_trait;

use super::{GateContext, PlanSpec, VerificationGates};
use crate::errlog::SkillError;
use crate::router::{MiddlewareAction, PreMiddleware, RiskLevel, SkillRequest};

/// Pre-middleware that dispatches the plan gate for every routed call.
pub struct PlanGateMiddleware {
    gates: Arc<VerificationGates>,
}

impl PlanGateMiddleware {
    pub fn new(gates: Arc<VerificationGates>) -> Self {
        Self { gates }
    }
}

#[async_trait]
impl PreMiddleware for PlanGateMiddleware {
    async fn before(
        &self,
        request: &SkillRequest,
        route: &str,
        risk: RiskLevel,
    ) -> Result<MiddlewareAction, SkillError> {
        let plan = PlanSpec::new(format!("Execute {route}: {}", request.message));
        let ctx = GateContext {
            user_id: request
                .context
                .get("userId")
                .and_then(|v| v.as_str())
                .map(String::from),
            chat_id: request
                .context
                .get("chatId")
                .and_then(|v| v.as_str())
                .map(String::from),
            risk: Some(risk),
            original_input: Some(request.context.clone()),
        };

        // Gate failures abort rather than fail open.
        let resolution = match self.gates.plan(route, &plan, &ctx).await {
            Ok(resolution) => resolution,
            Err(error) => {
                return Ok(MiddlewareAction::Abort {
                    reason: format!("Plan gate error: {error}"),
                })
            }
        };

        if resolution.passed() {
            Ok(MiddlewareAction::Continue)
        } else {
            Ok(MiddlewareAction::Abort {
                reason: format!(
                    "Plan gate {}: {}",
                    resolution.status,
                    resolution.reason.unwrap_or_else(|| "not approved".to_string())
                ),
            })
        }
    }
}

//! Error classification and severity inference.
//!
//! A deterministic cascade over the error name and lowercased message.
//! Tier order is load-bearing: the logic tier (error-name check) runs
//! before the dependency keywords so `TypeError("x is not a function")`
//! classifies as logic, not dependency.

use super::types::{ErrorClass, Severity};

/// Skill-name keywords that force critical severity.
const CRITICAL_SKILL_KEYWORDS: [&str; 5] = ["deploy", "delete", "transfer", "swap", "send"];

const NETWORK_KEYWORDS: [&str; 4] = ["econnrefused", "enotfound", "fetch failed", "network"];
const TIMEOUT_KEYWORDS: [&str; 3] = ["timeout", "etimedout", "deadline"];
const PERMISSION_KEYWORDS: [&str; 4] = ["401", "403", "unauthorized", "permission"];
const API_KEYWORDS: [&str; 5] = ["404", "429", "500", "api", "rate limit"];
const DEPENDENCY_KEYWORDS: [&str; 3] = ["cannot find module", "module not found", "is not a function"];
const VALIDATION_KEYWORDS: [&str; 4] = ["invalid", "required", "expected", "must be"];

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| haystack.contains(k))
}

/// Classify an error from its name and message.
pub fn classify(name: &str, message: &str) -> ErrorClass {
    let msg = message.to_lowercase();

    if name == "SyntaxError" || msg.contains("unexpected token") {
        return ErrorClass::Syntax;
    }
    if contains_any(&msg, &NETWORK_KEYWORDS) {
        return ErrorClass::Network;
    }
    if contains_any(&msg, &TIMEOUT_KEYWORDS) {
        return ErrorClass::Timeout;
    }
    if contains_any(&msg, &PERMISSION_KEYWORDS) {
        return ErrorClass::Permission;
    }
    if contains_any(&msg, &API_KEYWORDS) {
        return ErrorClass::Api;
    }
    if matches!(name, "TypeError" | "ReferenceError" | "RangeError") {
        return ErrorClass::Logic;
    }
    if contains_any(&msg, &DEPENDENCY_KEYWORDS) {
        return ErrorClass::Dependency;
    }
    if contains_any(&msg, &VALIDATION_KEYWORDS) {
        return ErrorClass::Validation;
    }
    ErrorClass::Unknown
}

/// Infer severity from the skill name and classification.
///
/// Skills whose name suggests irreversible side effects are always
/// critical. An explicit caller-supplied severity wins over this at the
/// capture site.
pub fn infer_severity(skill: &str, classification: ErrorClass) -> Severity {
    let skill_lower = skill.to_lowercase();
    if CRITICAL_SKILL_KEYWORDS
        .iter()
        .any(|k| skill_lower.contains(k))
    {
        return Severity::Critical;
    }
    match classification {
        ErrorClass::Api | ErrorClass::Network | ErrorClass::Permission => Severity::High,
        ErrorClass::Logic | ErrorClass::Validation => Severity::Medium,
        _ => Severity::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_by_name() {
        assert_eq!(classify("SyntaxError", "anything"), ErrorClass::Syntax);
    }

    #[test]
    fn test_syntax_by_message() {
        assert_eq!(
            classify("Error", "Unexpected token '}' in JSON"),
            ErrorClass::Syntax
        );
    }

    #[test]
    fn test_network_before_timeout() {
        // "fetch failed" wins even though a timeout keyword could appear later
        assert_eq!(
            classify("Error", "fetch failed after deadline"),
            ErrorClass::Network
        );
    }

    #[test]
    fn test_timeout() {
        assert_eq!(classify("Error", "ETIMEDOUT"), ErrorClass::Timeout);
    }

    #[test]
    fn test_permission() {
        assert_eq!(
            classify("Error", "Request rejected: 403 Forbidden"),
            ErrorClass::Permission
        );
    }

    #[test]
    fn test_api() {
        assert_eq!(classify("Error", "rate limit exceeded"), ErrorClass::Api);
    }

    #[test]
    fn test_logic_beats_dependency() {
        // The load-bearing precedence case.
        assert_eq!(
            classify("TypeError", "x is not a function"),
            ErrorClass::Logic
        );
    }

    #[test]
    fn test_dependency() {
        assert_eq!(
            classify("Error", "Cannot find module 'leftpad'"),
            ErrorClass::Dependency
        );
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            classify("Error", "field `amount` is required"),
            ErrorClass::Validation
        );
    }

    #[test]
    fn test_unknown_fallthrough() {
        assert_eq!(classify("Error", "something odd"), ErrorClass::Unknown);
    }

    #[test]
    fn test_critical_skill_keyword() {
        assert_eq!(
            infer_severity("token-deploy", ErrorClass::Unknown),
            Severity::Critical
        );
        assert_eq!(
            infer_severity("swap-executor", ErrorClass::Logic),
            Severity::Critical
        );
    }

    #[test]
    fn test_severity_by_classification() {
        assert_eq!(infer_severity("audit", ErrorClass::Network), Severity::High);
        assert_eq!(infer_severity("audit", ErrorClass::Logic), Severity::Medium);
        assert_eq!(infer_severity("audit", ErrorClass::Syntax), Severity::Low);
    }
}

//! Deterministic fix templates, used when no oracle is configured.
//!
//! Each template is a string-level transformation of the skill source,
//! keyed by the error classification. Every injected block carries the
//! `[AUTO-FIX]` marker so the resulting diff is unambiguous.

use std::sync::LazyLock;

use regex::Regex;

use crate::errlog::ErrorClass;

/// Marker prefixed to every injected block.
pub const AUTO_FIX_MARKER: &str = "[AUTO-FIX]";

static FUNCTION_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^.*\b(?:async\s+)?function\b[^{]*\{\s*$|^.*=>\s*\{\s*$").unwrap()
});

static LAST_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^.*\brequire\s*\(.*$").unwrap());

static UNDEFINED_ACCESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z_$][A-Za-z0-9_$]*)\s*\.").unwrap());

/// A synthesized template fix.
#[derive(Debug, Clone)]
pub struct TemplateFix {
    pub fixed_code: String,
    pub explanation: String,
}

/// Apply the template for a classification to the source.
///
/// `stack_line` is the 1-based failing line from the error's stack frame,
/// used only by the undefined-access guard.
pub fn apply_template(
    classification: ErrorClass,
    source: &str,
    error_message: &str,
    stack_line: Option<usize>,
) -> TemplateFix {
    match classification {
        ErrorClass::Validation => inject_validation_preamble(source),
        ErrorClass::Api | ErrorClass::Network => inject_retry_helper(source),
        ErrorClass::Timeout => inject_timeout_helper(source),
        ErrorClass::Logic if error_message.contains("Cannot read properties of undefined") => {
            inject_null_check(source, stack_line)
        }
        _ => wrap_in_try_catch(source),
    }
}

/// Insert an input-validation preamble at the top of the main entry
/// function.
fn inject_validation_preamble(source: &str) -> TemplateFix {
    let preamble = format!(
        "  // {AUTO_FIX_MARKER} validate input before use\n  if (input === undefined || input === null) {{\n    throw new Error('Invalid input: expected a value');\n  }}\n"
    );
    match FUNCTION_OPEN.find(source) {
        Some(open) => {
            let insert_at = open.end();
            let mut fixed = String::with_capacity(source.len() + preamble.len());
            fixed.push_str(&source[..insert_at]);
            if !source[..insert_at].ends_with('\n') {
                fixed.push('\n');
            }
            fixed.push_str(&preamble);
            fixed.push_str(&source[insert_at..]);
            TemplateFix {
                fixed_code: fixed,
                explanation: "Injected an input-validation preamble into the entry function"
                    .to_string(),
            }
        }
        None => wrap_in_try_catch(source),
    }
}

/// Insert a retry-with-backoff helper after the last require, leaving it
/// available for the skill to adopt.
fn inject_retry_helper(source: &str) -> TemplateFix {
    let helper = format!(
        "\n// {AUTO_FIX_MARKER} retry with exponential backoff\nasync function retryWithBackoff(fn, retries = 3, baseDelayMs = 500) {{\n  for (let attempt = 0; attempt < retries; attempt++) {{\n    try {{\n      return await fn();\n    }} catch (err) {{\n      if (attempt === retries - 1) throw err;\n      await new Promise((resolve) => setTimeout(resolve, baseDelayMs * 2 ** attempt));\n    }}\n  }}\n}}\n"
    );
    TemplateFix {
        fixed_code: insert_after_last_require(source, &helper),
        explanation: "Added a retryWithBackoff helper for flaky remote calls".to_string(),
    }
}

/// Insert a race-against-timer helper after the last require.
fn inject_timeout_helper(source: &str) -> TemplateFix {
    let helper = format!(
        "\n// {AUTO_FIX_MARKER} bound slow operations with a timeout\nfunction withTimeout(promise, ms = 10000) {{\n  return Promise.race([\n    promise,\n    new Promise((_, reject) => setTimeout(() => reject(new Error('Operation timed out')), ms)),\n  ]);\n}}\n"
    );
    TemplateFix {
        fixed_code: insert_after_last_require(source, &helper),
        explanation: "Added a withTimeout helper to bound slow operations".to_string(),
    }
}

/// Insert a guard immediately before the offending line. The backup and
/// rollback discipline covers the case where the file drifted since the
/// stack was recorded.
fn inject_null_check(source: &str, stack_line: Option<usize>) -> TemplateFix {
    let lines: Vec<&str> = source.lines().collect();
    let Some(line_number) = stack_line.filter(|n| *n >= 1 && *n <= lines.len()) else {
        return wrap_in_try_catch(source);
    };
    let offending = lines[line_number - 1];
    let Some(ident) = UNDEFINED_ACCESS
        .captures(offending)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
    else {
        return wrap_in_try_catch(source);
    };
    let indent: String = offending
        .chars()
        .take_while(|c| c.is_whitespace())
        .collect();
    let guard = format!(
        "{indent}// {AUTO_FIX_MARKER} guard: bail out when {ident} is undefined\n{indent}if ({ident} === undefined || {ident} === null) {{\n{indent}  return undefined;\n{indent}}}\n"
    );

    let mut fixed = String::with_capacity(source.len() + guard.len());
    for (index, line) in lines.iter().enumerate() {
        if index == line_number - 1 {
            fixed.push_str(&guard);
        }
        fixed.push_str(line);
        fixed.push('\n');
    }
    TemplateFix {
        fixed_code: fixed,
        explanation: format!("Guarded line {line_number} against undefined `{ident}`"),
    }
}

/// Wrap the main entry function's body in try/catch.
fn wrap_in_try_catch(source: &str) -> TemplateFix {
    let Some(open) = FUNCTION_OPEN.find(source) else {
        // No recognizable entry function: annotate the top of the file so
        // the diff still marks the attempt.
        let fixed = format!(
            "// {AUTO_FIX_MARKER} review: automatic fix could not locate an entry function\n{source}"
        );
        return TemplateFix {
            fixed_code: fixed,
            explanation: "No entry function found; annotated for manual review".to_string(),
        };
    };

    let body_start = open.end();
    let Some(body_end) = matching_brace(source, body_start) else {
        let fixed = format!(
            "// {AUTO_FIX_MARKER} review: automatic fix could not parse the entry function\n{source}"
        );
        return TemplateFix {
            fixed_code: fixed,
            explanation: "Entry function braces unbalanced; annotated for manual review"
                .to_string(),
        };
    };

    let mut fixed = String::with_capacity(source.len() + 128);
    fixed.push_str(&source[..body_start]);
    fixed.push_str(&format!("\n  // {AUTO_FIX_MARKER} catch and surface unexpected errors\n  try {{"));
    fixed.push_str(&source[body_start..body_end]);
    fixed.push_str(&format!(
        "  }} catch (err) {{\n    console.error('{AUTO_FIX_MARKER} unexpected error:', err.message);\n    throw err;\n  }}\n"
    ));
    fixed.push_str(&source[body_end..]);
    TemplateFix {
        fixed_code: fixed,
        explanation: "Wrapped the entry function body in try/catch".to_string(),
    }
}

/// Byte offset of the closing brace matching the one just before `start`.
fn matching_brace(source: &str, start: usize) -> Option<usize> {
    let mut depth = 1usize;
    for (offset, c) in source[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn insert_after_last_require(source: &str, block: &str) -> String {
    match LAST_REQUIRE.find_iter(source).last() {
        Some(last) => {
            let insert_at = last.end();
            let mut fixed = String::with_capacity(source.len() + block.len());
            fixed.push_str(&source[..insert_at]);
            fixed.push('\n');
            fixed.push_str(block);
            fixed.push_str(&source[insert_at..]);
            fixed
        }
        None => format!("{block}\n{source}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKILL: &str = "const axios = require('axios');\nconst util = require('util');\n\nasync function runAudit(input) {\n  const data = await axios.get(input.url);\n  return data.summary.score;\n}\n\nmodule.exports = runAudit;\n";

    #[test]
    fn test_validation_preamble_lands_in_entry() {
        let fix = apply_template(ErrorClass::Validation, SKILL, "input is required", None);
        assert!(fix.fixed_code.contains("[AUTO-FIX] validate input"));
        let preamble_at = fix.fixed_code.find("validate input").unwrap();
        let function_at = fix.fixed_code.find("function runAudit").unwrap();
        assert!(preamble_at > function_at);
    }

    #[test]
    fn test_retry_helper_after_last_require() {
        let fix = apply_template(ErrorClass::Network, SKILL, "ECONNREFUSED", None);
        let helper_at = fix.fixed_code.find("retryWithBackoff").unwrap();
        let last_require_at = fix.fixed_code.rfind("require('util')").unwrap();
        assert!(helper_at > last_require_at);
        assert!(fix.fixed_code.contains(AUTO_FIX_MARKER));
    }

    #[test]
    fn test_timeout_helper() {
        let fix = apply_template(ErrorClass::Timeout, SKILL, "ETIMEDOUT", None);
        assert!(fix.fixed_code.contains("withTimeout"));
        assert!(fix.fixed_code.contains("Promise.race"));
    }

    #[test]
    fn test_null_check_guards_offending_line() {
        // Line 6 is `return data.summary.score;`.
        let fix = apply_template(
            ErrorClass::Logic,
            SKILL,
            "Cannot read properties of undefined (reading 'score')",
            Some(6),
        );
        assert!(fix.fixed_code.contains("when data is undefined"));
        let guard_at = fix.fixed_code.find("data === undefined").unwrap();
        let offending_at = fix.fixed_code.find("data.summary.score").unwrap();
        assert!(guard_at < offending_at);
    }

    #[test]
    fn test_null_check_out_of_range_falls_back() {
        let fix = apply_template(
            ErrorClass::Logic,
            SKILL,
            "Cannot read properties of undefined (reading 'score')",
            Some(999),
        );
        assert!(fix.fixed_code.contains("try {"));
    }

    #[test]
    fn test_logic_without_undefined_wraps_try_catch() {
        let fix = apply_template(ErrorClass::Logic, SKILL, "x is not a function", None);
        assert!(fix.fixed_code.contains("try {"));
        assert!(fix.fixed_code.contains("catch (err)"));
        // The wrap goes inside the entry function, before module.exports.
        let catch_at = fix.fixed_code.find("catch (err)").unwrap();
        let exports_at = fix.fixed_code.find("module.exports").unwrap();
        assert!(catch_at < exports_at);
    }

    #[test]
    fn test_unknown_wraps_try_catch() {
        let fix = apply_template(ErrorClass::Unknown, SKILL, "mystery", None);
        assert!(fix.fixed_code.contains("try {"));
    }

    #[test]
    fn test_sourceless_file_annotated() {
        let fix = apply_template(ErrorClass::Unknown, "const x = 1;\n", "mystery", None);
        assert!(fix.fixed_code.starts_with("// [AUTO-FIX] review"));
    }
}

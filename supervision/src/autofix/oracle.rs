//! The LLM oracle seam: a single text-in/text-out callable, the prompt
//! the engine builds for it, and the strict response contract it must
//! honor.
//!
//! The deterministic mock mirrors the real oracle for tests.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::errlog::OutcomeRecord;
use crate::improvement::Correction;

/// Errors from an oracle call.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Oracle request failed: {0}")]
    RequestFailed(String),
}

/// A patch-synthesis oracle. Implementations wrap whatever model serves
/// the deployment; the core only sees prompt in, text out.
#[async_trait]
pub trait FixOracle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError>;
}

/// Deterministic oracle for tests: returns a canned response or fails.
pub struct MockOracle {
    response: Option<String>,
}

impl MockOracle {
    /// An oracle that always returns the given response.
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
        }
    }

    /// An oracle whose calls always fail.
    pub fn failing() -> Self {
        Self { response: None }
    }
}

#[async_trait]
impl FixOracle for MockOracle {
    async fn complete(&self, _prompt: &str) -> Result<String, OracleError> {
        match &self.response {
            Some(response) => Ok(response.clone()),
            None => Err(OracleError::RequestFailed("mock oracle failure".to_string())),
        }
    }
}

/// A parsed oracle response.
#[derive(Debug, Clone)]
pub struct SynthesizedFix {
    pub explanation: String,
    pub fixed_code: String,
}

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-zA-Z]*\n(.*?)\n?```").unwrap());

/// Parse the `EXPLANATION:` free text and the fenced code block out of an
/// oracle response. Returns `None` when no code block is present.
pub fn parse_oracle_response(response: &str) -> Option<SynthesizedFix> {
    let fixed_code = CODE_BLOCK.captures(response)?.get(1)?.as_str().to_string();

    let explanation = response
        .split_once("EXPLANATION:")
        .map(|(_, rest)| {
            rest.split("```")
                .next()
                .unwrap_or("")
                .trim()
                .to_string()
        })
        .unwrap_or_default();

    Some(SynthesizedFix {
        explanation,
        fixed_code,
    })
}

/// Build the patch-synthesis prompt.
pub fn build_fix_prompt(
    skill: &str,
    issue: &str,
    error: Option<&OutcomeRecord>,
    corrections: &[Correction],
    source: &str,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("Fix the skill `{skill}`.\n\n"));
    prompt.push_str(&format!("## Issue\n\n{issue}\n\n"));

    if let Some(OutcomeRecord::Error {
        message,
        classification,
        occurrence_count,
        stack,
        input_summary,
        ..
    }) = error
    {
        prompt.push_str("## Error details\n\n");
        prompt.push_str(&format!("- Message: {message}\n"));
        prompt.push_str(&format!("- Classification: {classification}\n"));
        prompt.push_str(&format!("- Occurrences: {occurrence_count}\n"));
        if let Some(stack) = stack {
            prompt.push_str(&format!("- Stack:\n{stack}\n"));
        }
        if let Some(input) = input_summary {
            prompt.push_str(&format!("- Input: {input}\n"));
        }
        prompt.push('\n');
    }

    if !corrections.is_empty() {
        prompt.push_str("## Recent user corrections\n\n");
        for correction in corrections {
            prompt.push_str(&format!("- {}\n", correction.reason));
        }
        prompt.push('\n');
    }

    prompt.push_str("## Source\n\n```javascript\n");
    prompt.push_str(source);
    prompt.push_str("\n```\n\n");

    prompt.push_str("## Rules\n\n");
    prompt.push_str("1. Return ONLY the complete fixed file in one code block\n");
    prompt.push_str("2. Do not add new dependencies\n");
    prompt.push_str("3. Make the minimum change that fixes the issue\n");
    prompt.push_str("4. Start your answer with `EXPLANATION:` followed by one short paragraph\n");

    prompt
}

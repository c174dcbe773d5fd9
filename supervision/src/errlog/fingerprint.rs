//! Stack fingerprinting — an environment-invariant identity for error
//! families.
//!
//! Two errors share a fingerprint iff their call-site frames match after
//! line/column numbers and absolute path prefixes are stripped. The same
//! function failing at a different line, or on a different machine, hashes
//! identically.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Sentinel fingerprint for a missing or empty stack.
pub const NO_STACK: &str = "no-stack";

/// How many call-site frames participate in the fingerprint.
const FRAME_DEPTH: usize = 5;

/// Length of the hex fingerprint.
const FINGERPRINT_LEN: usize = 12;

static CALL_SITE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*at\s+").unwrap());

static LINE_COL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\d+(:\d+)?").unwrap());

/// Absolute path prefix up to (and including) the last separator.
static ABS_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[A-Za-z]:)?[/\\](?:[^/\\():\s]+[/\\])*").unwrap());

/// Compute the 12-hex stack fingerprint.
pub fn stack_fingerprint(stack: Option<&str>) -> String {
    let Some(stack) = stack else {
        return NO_STACK.to_string();
    };
    if stack.trim().is_empty() {
        return NO_STACK.to_string();
    }

    let frames: Vec<String> = stack
        .lines()
        .filter(|line| CALL_SITE.is_match(line))
        .take(FRAME_DEPTH)
        .map(|line| {
            let trimmed = line.trim();
            let no_positions = LINE_COL.replace_all(trimmed, "");
            ABS_PATH.replace_all(&no_positions, "").into_owned()
        })
        .collect();

    if frames.is_empty() {
        return NO_STACK.to_string();
    }

    let digest = Sha256::digest(frames.join("|").as_bytes());
    format!("{digest:x}")[..FINGERPRINT_LEN].to_string()
}

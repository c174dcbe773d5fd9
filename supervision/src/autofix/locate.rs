//! Source and test-file localization for skills.
//!
//! Skills live as script files under a skills directory, one subdirectory
//! per skill (optionally prefixed `x1-`). Errors carry stacks whose frames
//! point back into those files.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Path fragments that disqualify a stack frame as the fix target:
/// dependencies, the logger itself, and runtime internals.
const EXCLUDED_FRAME_MARKERS: [&str; 4] = ["node_modules", "error-logger", "errlog", "internal"];

/// Entry-file candidates inside a skill directory, in preference order.
const ENTRY_CANDIDATES: [&str; 2] = ["index.js", "main.js"];

/// Extensions that count as skill source files.
const SOURCE_EXTENSIONS: [&str; 4] = ["js", "mjs", "cjs", "ts"];

static FRAME_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(?([^\s()]+?):(\d+):(\d+)\)?\s*$").unwrap());

/// A located source file, with the failing line when a stack supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedSource {
    pub path: PathBuf,
    /// 1-based line of the first relevant stack frame.
    pub line: Option<usize>,
}

/// Extract the first usable frame location from a stack trace: the first
/// `at` frame whose file lies outside dependency and logger paths.
pub fn locate_from_stack(stack: &str) -> Option<LocatedSource> {
    for line in stack.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("at ") {
            continue;
        }
        let Some(caps) = FRAME_LOCATION.captures(trimmed) else {
            continue;
        };
        let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if EXCLUDED_FRAME_MARKERS.iter().any(|m| path.contains(m)) {
            continue;
        }
        let line_number = caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok());
        return Some(LocatedSource {
            path: PathBuf::from(path),
            line: line_number,
        });
    }
    None
}

/// Candidate directories for a skill: `{skill}` and `x1-{skill}`.
fn skill_dirs(skills_dir: &Path, skill: &str) -> Vec<PathBuf> {
    vec![
        skills_dir.join(skill),
        skills_dir.join(format!("x1-{skill}")),
    ]
}

/// Find a skill's source file in the skills directory: the entry file if
/// present, otherwise the first source file found.
pub fn locate_in_skills_dir(skills_dir: &Path, skill: &str) -> Option<PathBuf> {
    for dir in skill_dirs(skills_dir, skill) {
        if !dir.is_dir() {
            continue;
        }
        for entry in ENTRY_CANDIDATES {
            let candidate = dir.join(entry);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        let mut sources: Vec<PathBuf> = std::fs::read_dir(&dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| SOURCE_EXTENSIONS.contains(&e))
                        .unwrap_or(false)
            })
            .collect();
        sources.sort();
        if let Some(first) = sources.into_iter().next() {
            return Some(first);
        }
    }
    None
}

/// Find a skill's test file: `test.js` under the skill directory, under
/// its `tests/` subdirectory, or under the `x1-` variant; falling back to
/// `{skills}/tests/{skill}.test.js`.
pub fn locate_test_file(skills_dir: &Path, skill: &str) -> Option<PathBuf> {
    for dir in skill_dirs(skills_dir, skill) {
        for candidate in [dir.join("test.js"), dir.join("tests").join("test.js")] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    let shared = skills_dir.join("tests").join(format!("{skill}.test.js"));
    shared.is_file().then_some(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = "TypeError: Cannot read properties of undefined (reading 'price')\n    at formatReport (/home/bot/node_modules/chalk/index.js:10:5)\n    at logError (/home/bot/core/error-logger/logger.js:88:3)\n    at runAudit (/home/bot/skills/x1-token-audit/index.js:42:13)\n    at dispatch (/home/bot/core/router.js:118:9)";

    #[test]
    fn test_stack_skips_excluded_frames() {
        let located = locate_from_stack(STACK).unwrap();
        assert_eq!(
            located.path,
            PathBuf::from("/home/bot/skills/x1-token-audit/index.js")
        );
        assert_eq!(located.line, Some(42));
    }

    #[test]
    fn test_stack_without_usable_frames() {
        assert_eq!(locate_from_stack("Error: boom"), None);
        assert_eq!(
            locate_from_stack("Error\n    at x (/a/node_modules/y.js:1:1)"),
            None
        );
    }

    #[test]
    fn test_skills_dir_entry_preference() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("x1-token-audit");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("helper.js"), "x").unwrap();
        std::fs::write(skill_dir.join("index.js"), "x").unwrap();

        let found = locate_in_skills_dir(dir.path(), "token-audit").unwrap();
        assert!(found.ends_with("x1-token-audit/index.js"));
    }

    #[test]
    fn test_skills_dir_first_source_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("audit");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("zz.js"), "x").unwrap();
        std::fs::write(skill_dir.join("aa.js"), "x").unwrap();
        std::fs::write(skill_dir.join("notes.txt"), "x").unwrap();

        let found = locate_in_skills_dir(dir.path(), "audit").unwrap();
        assert!(found.ends_with("audit/aa.js"));
    }

    #[test]
    fn test_missing_skill_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(locate_in_skills_dir(dir.path(), "ghost"), None);
    }

    #[test]
    fn test_test_file_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("audit").join("tests");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(skill_dir.join("test.js"), "x").unwrap();

        let found = locate_test_file(dir.path(), "audit").unwrap();
        assert!(found.ends_with("audit/tests/test.js"));

        assert_eq!(locate_test_file(dir.path(), "other"), None);
    }
}

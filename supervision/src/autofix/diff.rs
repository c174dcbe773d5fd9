//! Line-by-line diff between the original and fixed source.

/// Lines that differ are emitted as a `-` original line followed by a
/// `+` fixed line; insertions and deletions past the shorter file appear
/// on their own.
pub fn line_diff(original: &str, fixed: &str) -> String {
    let original_lines: Vec<&str> = original.lines().collect();
    let fixed_lines: Vec<&str> = fixed.lines().collect();
    let max = original_lines.len().max(fixed_lines.len());

    let mut diff = String::new();
    for index in 0..max {
        let old = original_lines.get(index);
        let new = fixed_lines.get(index);
        match (old, new) {
            (Some(old), Some(new)) if old == new => {}
            (old, new) => {
                if let Some(old) = old {
                    diff.push_str(&format!("- {old}\n"));
                }
                if let Some(new) = new {
                    diff.push_str(&format!("+ {new}\n"));
                }
            }
        }
    }
    diff
}

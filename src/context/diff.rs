//! Line diffs for recorded changes

use similar::{ChangeTag, TextDiff};

/// Unified line diff with three lines of context. Empty when nothing changed.
pub fn unified_diff(old_content: &str, new_content: &str) -> String {
    TextDiff::from_lines(old_content, new_content)
        .unified_diff()
        .context_radius(3)
        .header("", "")
        .to_string()
}

/// Count of (added, removed) lines.
pub fn line_changes(old_content: &str, new_content: &str) -> (usize, usize) {
    TextDiff::from_lines(old_content, new_content)
        .iter_all_changes()
        .fold((0, 0), |(added, removed), change| match change.tag() {
            ChangeTag::Insert => (added + 1, removed),
            ChangeTag::Delete => (added, removed + 1),
            ChangeTag::Equal => (added, removed),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unified_diff_marks_lines() {
        let diff = unified_diff("a\nb\nc\n", "a\nx\nc\n");
        assert!(diff.starts_with("--- "));
        assert!(diff.contains("@@ -1,3 +1,3 @@"));
        assert!(diff.contains("\n-b\n"));
        assert!(diff.contains("\n+x\n"));
    }

    #[test]
    fn test_identical_content_has_empty_diff() {
        assert!(unified_diff("same\n", "same\n").is_empty());
        assert_eq!(line_changes("same\n", "same\n"), (0, 0));
    }

    #[test]
    fn test_line_changes() {
        assert_eq!(line_changes("", "one\ntwo\n"), (2, 0));
        assert_eq!(line_changes("a\nb\n", "a\n"), (0, 1));
    }
}

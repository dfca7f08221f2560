//! Unified diff between two file trees

use similar::TextDiff;
use std::collections::{BTreeMap, BTreeSet};

/// Standard `diff -u` text across two path → content maps. Added files
/// diff against `/dev/null`, deleted files diff to it; unchanged files
/// are omitted. An empty result means the trees are identical.
pub fn unified_diff(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> String {
    let mut paths: BTreeSet<&String> = BTreeSet::new();
    paths.extend(old.keys());
    paths.extend(new.keys());

    let mut out = String::new();
    for path in paths {
        let before = old.get(path);
        let after = new.get(path);
        match (before, after) {
            (Some(a), Some(b)) if a == b => continue,
            (Some(a), Some(b)) => {
                let diff = TextDiff::from_lines(a.as_str(), b.as_str());
                out.push_str(&format!(
                    "{}",
                    diff.unified_diff()
                        .context_radius(3)
                        .header(&format!("a/{}", path), &format!("b/{}", path))
                ));
            }
            (None, Some(b)) => {
                let diff = TextDiff::from_lines("", b.as_str());
                out.push_str(&format!(
                    "{}",
                    diff.unified_diff()
                        .context_radius(3)
                        .header("/dev/null", &format!("b/{}", path))
                ));
            }
            (Some(a), None) => {
                let diff = TextDiff::from_lines(a.as_str(), "");
                out.push_str(&format!(
                    "{}",
                    diff.unified_diff()
                        .context_radius(3)
                        .header(&format!("a/{}", path), "/dev/null")
                ));
            }
            (None, None) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identical_trees_yield_empty_diff() {
        let files = map(&[("a.ts", "hello\n")]);
        assert!(unified_diff(&files, &files).is_empty());
    }

    #[test]
    fn added_file_diffs_against_dev_null() {
        let diff = unified_diff(&map(&[]), &map(&[("new.ts", "line\n")]));
        assert!(diff.contains("--- /dev/null"));
        assert!(diff.contains("+++ b/new.ts"));
        assert!(diff.contains("+line"));
    }

    #[test]
    fn deleted_file_diffs_to_dev_null() {
        let diff = unified_diff(&map(&[("old.ts", "line\n")]), &map(&[]));
        assert!(diff.contains("--- a/old.ts"));
        assert!(diff.contains("+++ /dev/null"));
        assert!(diff.contains("-line"));
    }

    #[test]
    fn modified_file_shows_both_sides() {
        let diff = unified_diff(
            &map(&[("app.tsx", "count\n")]),
            &map(&[("app.tsx", "count\nreset\n")]),
        );
        assert!(diff.contains("--- a/app.tsx"));
        assert!(diff.contains("+++ b/app.tsx"));
        assert!(diff.contains("+reset"));
        assert!(!diff.contains("-count"));
    }
}

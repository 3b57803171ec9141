//! Server path helpers.
//!
//! Server paths look like `$/Project/dir/file.txt`. They are compared
//! case-insensitively, segment by segment. `$/` is the root folder.

use std::cmp::Ordering;

use crate::{PathError, Result};

/// The root folder of the repository
pub const ROOT: &str = "$/";

/// Segment separator for server paths
pub const SEPARATOR: char = '/';

/// Default maximum length of a server path (in UTF-16 code units)
pub const MAX_SERVER_PATH_SIZE: usize = 259;

/// Returns true when `path` is rooted at `$`.
pub fn is_server_path(path: &str) -> bool {
    path == "$" || path.starts_with("$/")
}

/// Normalize a server path: collapse repeated separators, drop a trailing
/// separator (except on the root) and reject relative segments.
pub fn canonicalize(path: &str) -> Result<String> {
    if !is_server_path(path) {
        return Err(PathError::NotServerPath(path.to_string()));
    }

    let mut out = String::with_capacity(path.len());
    out.push('$');
    for segment in path[1..].split(SEPARATOR).filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || segment.trim() != segment {
            return Err(PathError::InvalidSegment(path.to_string()));
        }
        out.push(SEPARATOR);
        out.push_str(segment);
    }
    if out.len() == 1 {
        out.push(SEPARATOR);
    }
    Ok(out)
}

/// Split a path into its segments (`$/A/b` → `["$", "A", "b"]`).
pub fn segments(path: &str) -> impl Iterator<Item = &str> + Clone {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

fn fold(segment: &str) -> String {
    segment.to_lowercase()
}

/// Case-insensitive equality.
pub fn equals(a: &str, b: &str) -> bool {
    compare(a, b) == Ordering::Equal
}

/// Segment-wise case-insensitive ordering; parents sort before children.
pub fn compare(a: &str, b: &str) -> Ordering {
    let mut left = segments(a);
    let mut right = segments(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => match fold(l).cmp(&fold(r)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Case-sensitive equality, used to detect case-only renames.
pub fn equals_exact(a: &str, b: &str) -> bool {
    segments(a).eq(segments(b))
}

/// Number of segments below `$` (`$/` is 0, `$/A` is 1).
pub fn depth(path: &str) -> usize {
    segments(path).count().saturating_sub(1)
}

/// True when `item` is `parent` or lies beneath it.
pub fn is_child(parent: &str, item: &str) -> bool {
    let mut p = segments(parent);
    let mut i = segments(item);
    loop {
        match (p.next(), i.next()) {
            (None, _) => return true,
            (Some(_), None) => return false,
            (Some(a), Some(b)) => {
                if fold(a) != fold(b) {
                    return false;
                }
            }
        }
    }
}

/// True when `item` is exactly one level beneath `parent`.
pub fn is_direct_child(parent: &str, item: &str) -> bool {
    is_child(parent, item) && depth(item) == depth(parent) + 1
}

/// Parent folder of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    let segs: Vec<&str> = segments(path).collect();
    if segs.len() <= 1 {
        return None;
    }
    Some(join(&segs[..segs.len() - 1]))
}

/// Last segment of `path` (empty for the root).
pub fn file_name(path: &str) -> &str {
    let segs = segments(path);
    match segs.clone().count() {
        0 | 1 => "",
        _ => segs.last().unwrap_or(""),
    }
}

/// Append `relative` to `parent`. An empty `relative` returns `parent`.
pub fn combine(parent: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches(SEPARATOR);
    if relative.is_empty() {
        return parent.to_string();
    }
    if parent.ends_with(SEPARATOR) {
        format!("{}{}", parent, relative)
    } else {
        format!("{}{}{}", parent, SEPARATOR, relative)
    }
}

/// The part of `item` beneath `parent` (empty when equal). Falls back to
/// `item` unchanged when it is not under `parent`.
pub fn make_relative(item: &str, parent: &str) -> String {
    if !is_child(parent, item) {
        return item.to_string();
    }
    let skip = segments(parent).count();
    segments(item).skip(skip).collect::<Vec<_>>().join("/")
}

/// Rebase `item` from beneath `old_parent` to beneath `new_parent`.
pub fn rebase(item: &str, old_parent: &str, new_parent: &str) -> String {
    combine(new_parent, &make_relative(item, old_parent))
}

/// A team project lives one level beneath the root.
pub fn is_team_project(path: &str) -> bool {
    depth(path) == 1
}

/// True when the last segment carries a `*` or `?` wildcard.
pub fn is_wildcard(path: &str) -> bool {
    let name = file_name(path);
    name.contains('*') || name.contains('?')
}

/// Case-insensitive glob match of a single name against `pattern`.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let name: Vec<char> = name.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    glob(&name, &pattern)
}

fn glob(name: &[char], pattern: &[char]) -> bool {
    let (mut n, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            n += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((sp, sn)) = star {
            p = sp + 1;
            n = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Length of `path` as the server counts it (UTF-16 code units).
pub fn server_length(path: &str) -> usize {
    path.encode_utf16().count()
}

fn join(segs: &[&str]) -> String {
    if segs.len() == 1 {
        return ROOT.to_string();
    }
    segs.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("$").unwrap(), "$/");
        assert_eq!(canonicalize("$/").unwrap(), "$/");
        assert_eq!(canonicalize("$//Proj//a/").unwrap(), "$/Proj/a");
        assert!(matches!(
            canonicalize("/Proj"),
            Err(PathError::NotServerPath(_))
        ));
        assert!(matches!(
            canonicalize("$/Proj/../x"),
            Err(PathError::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("$/Proj/a").as_deref(), Some("$/Proj"));
        assert_eq!(parent("$/Proj").as_deref(), Some("$/"));
        assert_eq!(parent("$/"), None);
        assert_eq!(file_name("$/Proj/a.txt"), "a.txt");
        assert_eq!(file_name("$/"), "");
    }

    #[test]
    fn test_is_child_is_case_insensitive() {
        assert!(is_child("$/Proj", "$/proj/A"));
        assert!(is_child("$/Proj", "$/PROJ"));
        assert!(is_child("$/", "$/anything"));
        assert!(!is_child("$/Proj", "$/Project"));
        assert!(!is_child("$/Proj/a", "$/Proj"));
    }

    #[test]
    fn test_relative_and_rebase() {
        assert_eq!(make_relative("$/A/b/c", "$/a"), "b/c");
        assert_eq!(make_relative("$/A", "$/A"), "");
        assert_eq!(rebase("$/A/b/c", "$/A", "$/Z"), "$/Z/b/c");
        assert_eq!(rebase("$/A", "$/A", "$/Z"), "$/Z");
        assert_eq!(combine("$/", "A"), "$/A");
    }

    #[test]
    fn test_compare_orders_parents_first() {
        assert_eq!(compare("$/A", "$/A/B"), Ordering::Less);
        assert_eq!(compare("$/A/B", "$/A.b"), Ordering::Less);
        assert_eq!(compare("$/a", "$/A"), Ordering::Equal);
    }

    #[test]
    fn test_wildcards() {
        assert!(is_wildcard("$/A/*.txt"));
        assert!(!is_wildcard("$/A*/b"));
        assert!(matches_pattern("Readme.TXT", "*.txt"));
        assert!(matches_pattern("a1", "a?"));
        assert!(!matches_pattern("abc", "a?"));
    }

    #[test]
    fn test_case_only_detection() {
        assert!(equals("$/A/b", "$/a/B"));
        assert!(!equals_exact("$/A/b", "$/a/B"));
        assert!(equals_exact("$/A/b", "$/A/b"));
    }
}

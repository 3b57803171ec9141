//! Local (on-disk) path helpers.
//!
//! Local paths are absolute. Comparisons fold case so that the local-path
//! index agrees with the case-insensitive server namespace.

use std::path::{Component, Path, PathBuf};

/// Folded index key for a local path (`/` separated, lowercase).
pub fn fold(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push_str(&p.as_os_str().to_string_lossy().to_lowercase()),
            Component::RootDir => out.push('/'),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str("..");
            }
            Component::Normal(s) => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&s.to_string_lossy().to_lowercase());
            }
        }
    }
    out
}

/// Case-insensitive path equality.
pub fn equals(a: &Path, b: &Path) -> bool {
    fold(a) == fold(b)
}

fn folded_components(path: &Path) -> Vec<String> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect()
}

/// True when `item` is `parent` or lies beneath it.
pub fn is_child(parent: &Path, item: &Path) -> bool {
    let p = folded_components(parent);
    let i = folded_components(item);
    i.len() >= p.len() && p.iter().zip(i.iter()).all(|(a, b)| a == b)
}

/// True when `item` is exactly one level beneath `parent`.
pub fn is_direct_child(parent: &Path, item: &Path) -> bool {
    let p = folded_components(parent);
    let i = folded_components(item);
    i.len() == p.len() + 1 && p.iter().zip(i.iter()).all(|(a, b)| a == b)
}

/// Rebase `item` from beneath `old_parent` to beneath `new_parent`.
/// Returns `None` when `item` is not under `old_parent`.
pub fn rebase(item: &Path, old_parent: &Path, new_parent: &Path) -> Option<PathBuf> {
    if !is_child(old_parent, item) {
        return None;
    }
    let skip = folded_components(old_parent).len();
    let mut out = new_parent.to_path_buf();
    for component in item.components().filter(|c| !matches!(c, Component::CurDir)).skip(skip) {
        out.push(component.as_os_str());
    }
    Some(out)
}

/// The volume a path lives on: its prefix and root (`/` on Unix, `C:\` on
/// Windows). Baselines are partitioned by this value.
pub fn partition_of(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            _ => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_and_equals() {
        assert_eq!(fold(Path::new("/Work/Proj/A.txt")), "/work/proj/a.txt");
        assert!(equals(Path::new("/work/A"), Path::new("/WORK/a")));
        assert!(!equals(Path::new("/work/A"), Path::new("/work/B")));
    }

    #[test]
    fn test_children() {
        assert!(is_child(Path::new("/w"), Path::new("/W/x/y")));
        assert!(is_child(Path::new("/w"), Path::new("/w")));
        assert!(!is_child(Path::new("/w/x"), Path::new("/w")));
        assert!(is_direct_child(Path::new("/w"), Path::new("/w/.lws")));
        assert!(!is_direct_child(Path::new("/w"), Path::new("/w/a/.lws")));
    }

    #[test]
    fn test_rebase() {
        let moved = rebase(Path::new("/w/a/b.txt"), Path::new("/w/a"), Path::new("/w/z")).unwrap();
        assert_eq!(moved, PathBuf::from("/w/z/b.txt"));
        assert!(rebase(Path::new("/x/b"), Path::new("/w"), Path::new("/z")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_partition_of_unix() {
        assert_eq!(partition_of(Path::new("/home/user/ws")), PathBuf::from("/"));
    }
}

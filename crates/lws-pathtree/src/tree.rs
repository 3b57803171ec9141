//! Sparse path tree.
//!
//! Every path segment is a node; nodes that carry no value but have a
//! populated descendant are "sparse". Sparse nodes are pruned as soon as
//! their last descendant goes away.

use std::collections::btree_map::{self, BTreeMap};

use crate::{PathError, Result};

#[derive(Debug, Clone)]
struct Node<T> {
    /// Full path of this node, in the case it was last written with
    path: String,
    value: Option<T>,
    /// Children keyed by case-folded segment
    children: BTreeMap<String, Node<T>>,
}

impl<T> Node<T> {
    fn sparse(path: String) -> Self {
        Self {
            path,
            value: None,
            children: BTreeMap::new(),
        }
    }

    fn count(&self) -> usize {
        usize::from(self.value.is_some()) + self.children.values().map(Node::count).sum::<usize>()
    }
}

/// A node produced by a tree walk
#[derive(Debug)]
pub struct TreeNode<'a, T> {
    /// Path of the node, in stored case
    pub path: &'a str,
    /// `None` only for sparse nodes
    pub value: Option<&'a T>,
    /// Whether any node (sparse or not) exists beneath this one
    pub has_children: bool,
    /// Sub-tree walks: distance below the starting node.
    /// Ancestor walks: segment index from the top of the tree.
    pub depth: usize,
}

impl<T> Clone for TreeNode<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TreeNode<'_, T> {}

/// Options for [`PathTree::subtree`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubTreeOptions {
    /// Yield the queried node itself
    pub include_root: bool,
    /// Yield nodes that carry no value
    pub include_sparse: bool,
}

impl SubTreeOptions {
    pub const CHILDREN: SubTreeOptions = SubTreeOptions {
        include_root: false,
        include_sparse: false,
    };

    pub const WITH_ROOT: SubTreeOptions = SubTreeOptions {
        include_root: true,
        include_sparse: false,
    };
}

/// Case-insensitive tree of values keyed by separated paths.
#[derive(Debug, Clone)]
pub struct PathTree<T> {
    separator: char,
    root: Node<T>,
    count: usize,
}

impl<T> Default for PathTree<T> {
    fn default() -> Self {
        Self::new('/')
    }
}

impl<T> PathTree<T> {
    /// Create an empty tree splitting keys on `separator`.
    pub fn new(separator: char) -> Self {
        Self {
            separator,
            root: Node::sparse(String::new()),
            count: 0,
        }
    }

    /// Number of values stored.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.root.children.clear();
        self.count = 0;
    }

    fn keys<'p>(&self, path: &'p str) -> impl Iterator<Item = (String, &'p str)> + 'p {
        path.split(self.separator)
            .filter(|s| !s.is_empty())
            .map(|s| (s.to_lowercase(), s))
    }

    fn find(&self, path: &str) -> Option<&Node<T>> {
        let mut node = &self.root;
        for (key, _) in self.keys(path) {
            node = node.children.get(&key)?;
        }
        Some(node)
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut Node<T>> {
        let keys: Vec<String> = self.keys(path).map(|(k, _)| k).collect();
        let mut node = &mut self.root;
        for key in keys {
            node = node.children.get_mut(&key)?;
        }
        Some(node)
    }

    /// Walk to `path`, creating sparse nodes along the way.
    fn find_or_create(&mut self, path: &str) -> &mut Node<T> {
        let sep = self.separator;
        let parts: Vec<(String, String)> = self.keys(path).map(|(k, s)| (k, s.to_string())).collect();
        let mut node = &mut self.root;
        let mut prefix = String::new();
        for (i, (key, segment)) in parts.into_iter().enumerate() {
            if i > 0 {
                prefix.push(sep);
            }
            prefix.push_str(&segment);
            let child_path = prefix.clone();
            node = node
                .children
                .entry(key)
                .or_insert_with(|| Node::sparse(child_path));
        }
        node
    }

    /// Insert a value. When a value is already present it is replaced only
    /// if `overwrite` is set; the previous value is returned.
    pub fn insert(&mut self, path: &str, value: T, overwrite: bool) -> Result<Option<T>> {
        let node = self.find_or_create(path);
        if node.value.is_some() && !overwrite {
            return Err(PathError::DuplicateKey(path.to_string()));
        }
        node.path = path.to_string();
        let previous = node.value.replace(value);
        if previous.is_none() {
            self.count += 1;
        }
        Ok(previous)
    }

    /// Insert or replace the value at `path`.
    pub fn set(&mut self, path: &str, value: T) -> Option<T> {
        let node = self.find_or_create(path);
        node.path = path.to_string();
        let previous = node.value.replace(value);
        if previous.is_none() {
            self.count += 1;
        }
        previous
    }

    /// Exact lookup.
    pub fn get(&self, path: &str) -> Option<&T> {
        self.find(path).and_then(|n| n.value.as_ref())
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut T> {
        self.find_mut(path).and_then(|n| n.value.as_mut())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Stored path (original case) of the value at `path`.
    pub fn stored_path(&self, path: &str) -> Option<&str> {
        self.find(path)
            .filter(|n| n.value.is_some())
            .map(|n| n.path.as_str())
    }

    /// Value of the closest ancestor-or-self of `path`.
    pub fn get_nearest(&self, path: &str) -> Option<(&str, &T)> {
        self.ancestors(path, false)
            .next()
            .and_then(|n| n.value.map(|v| (n.path, v)))
    }

    /// Replace the value at `path` with the closure's result in one walk.
    /// Returning `None` removes the value.
    pub fn modify<F>(&mut self, path: &str, f: F)
    where
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let node = self.find_or_create(path);
        let had = node.value.is_some();
        let updated = f(node.value.take());
        let has = updated.is_some();
        if has {
            node.path = path.to_string();
        }
        node.value = updated;
        match (had, has) {
            (false, true) => self.count += 1,
            (true, false) => self.count -= 1,
            _ => {}
        }
        if !has {
            self.prune(path);
        }
    }

    /// Remove the value at `path`, and with `remove_children` everything
    /// beneath it. Returns true when anything was removed.
    pub fn remove(&mut self, path: &str, remove_children: bool) -> bool {
        let keys: Vec<String> = self.keys(path).map(|(k, _)| k).collect();
        if keys.is_empty() {
            if !remove_children {
                return false;
            }
            let removed = self.count > 0;
            self.clear();
            return removed;
        }
        let removed = Self::remove_at(&mut self.root, &keys, remove_children);
        self.count -= removed;
        removed > 0
    }

    /// Take the value out of the tree.
    pub fn take(&mut self, path: &str) -> Option<T> {
        let value = self.find_mut(path).and_then(|n| n.value.take());
        if value.is_some() {
            self.count -= 1;
            self.prune(path);
        }
        value
    }

    fn remove_at(node: &mut Node<T>, keys: &[String], remove_children: bool) -> usize {
        let Some((key, rest)) = keys.split_first() else {
            return 0;
        };
        let Some(child) = node.children.get_mut(key) else {
            return 0;
        };
        if rest.is_empty() {
            if remove_children {
                let removed = child.count();
                node.children.remove(key);
                return removed;
            }
            let removed = usize::from(child.value.take().is_some());
            if child.children.is_empty() {
                node.children.remove(key);
            }
            return removed;
        }
        let removed = Self::remove_at(child, rest, remove_children);
        if child.value.is_none() && child.children.is_empty() {
            node.children.remove(key);
        }
        removed
    }

    /// Drop empty sparse nodes along `path`.
    fn prune(&mut self, path: &str) {
        let keys: Vec<String> = self.keys(path).map(|(k, _)| k).collect();
        Self::prune_at(&mut self.root, &keys);
    }

    fn prune_at(node: &mut Node<T>, keys: &[String]) {
        let Some((key, rest)) = keys.split_first() else {
            return;
        };
        if let Some(child) = node.children.get_mut(key) {
            Self::prune_at(child, rest);
            if child.value.is_none() && child.children.is_empty() {
                node.children.remove(key);
            }
        }
    }

    /// Depth-bounded pre-order walk of the sub-tree rooted at `path`.
    ///
    /// `depth` 0 visits only the root (when `include_root`), 1 adds its
    /// immediate children and `usize::MAX` is unbounded. A path with no node
    /// yields nothing.
    pub fn subtree(&self, path: &str, options: SubTreeOptions, depth: usize) -> SubTree<'_, T> {
        let start = self.find(path);
        SubTree::new(start, options, depth)
    }

    /// Every value in the tree, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> + Clone {
        SubTree::new(Some(&self.root), SubTreeOptions::CHILDREN, usize::MAX)
            .filter_map(|n| n.value.map(|v| (n.path, v)))
    }

    /// Values immediately beneath `path`.
    pub fn children(&self, path: &str) -> impl Iterator<Item = (&str, &T)> + Clone {
        self.subtree(path, SubTreeOptions::CHILDREN, 1)
            .filter_map(|n| n.value.map(|v| (n.path, v)))
    }

    /// Whether any value exists strictly beneath `path`.
    pub fn has_descendants(&self, path: &str) -> bool {
        self.find(path).is_some_and(|n| !n.children.is_empty())
    }

    /// Nearest-first walk of `path` and its ancestors.
    pub fn ancestors(&self, path: &str, include_sparse: bool) -> Ancestors<'_, T> {
        let mut chain = Vec::new();
        let mut node = &self.root;
        for (key, _) in self.keys(path) {
            match node.children.get(&key) {
                Some(child) => {
                    chain.push(child);
                    node = child;
                }
                None => break,
            }
        }
        Ancestors {
            chain,
            include_sparse,
        }
    }
}

/// Lazy pre-order iterator over a sub-tree. Cloning restarts from the
/// clone's current position.
pub struct SubTree<'a, T> {
    pending_root: Option<&'a Node<T>>,
    stack: Vec<btree_map::Values<'a, String, Node<T>>>,
    max_depth: usize,
    include_sparse: bool,
}

impl<T> Clone for SubTree<'_, T> {
    fn clone(&self) -> Self {
        Self {
            pending_root: self.pending_root,
            stack: self.stack.clone(),
            max_depth: self.max_depth,
            include_sparse: self.include_sparse,
        }
    }
}

impl<'a, T> SubTree<'a, T> {
    fn new(start: Option<&'a Node<T>>, options: SubTreeOptions, max_depth: usize) -> Self {
        let mut stack = Vec::new();
        if let Some(node) = start {
            if max_depth > 0 && !node.children.is_empty() {
                stack.push(node.children.values());
            }
        }
        Self {
            pending_root: start.filter(|_| options.include_root),
            stack,
            max_depth,
            include_sparse: options.include_sparse,
        }
    }

    fn emit(&self, node: &'a Node<T>, depth: usize) -> Option<TreeNode<'a, T>> {
        if node.value.is_none() && !self.include_sparse {
            return None;
        }
        Some(TreeNode {
            path: &node.path,
            value: node.value.as_ref(),
            has_children: !node.children.is_empty(),
            depth,
        })
    }
}

impl<'a, T> Iterator for SubTree<'a, T> {
    type Item = TreeNode<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(root) = self.pending_root.take() {
            // The virtual tree root has an empty path and is never yielded
            if !root.path.is_empty() {
                if let Some(node) = self.emit(root, 0) {
                    return Some(node);
                }
            }
        }

        loop {
            let depth = self.stack.len();
            let top = self.stack.last_mut()?;
            match top.next() {
                Some(node) => {
                    if depth < self.max_depth && !node.children.is_empty() {
                        self.stack.push(node.children.values());
                    }
                    if let Some(out) = self.emit(node, depth) {
                        return Some(out);
                    }
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

/// Nearest-first iterator over a path and its ancestors.
pub struct Ancestors<'a, T> {
    chain: Vec<&'a Node<T>>,
    include_sparse: bool,
}

impl<T> Clone for Ancestors<'_, T> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            include_sparse: self.include_sparse,
        }
    }
}

impl<'a, T> Iterator for Ancestors<'a, T> {
    type Item = TreeNode<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.chain.pop() {
            if node.value.is_none() && !self.include_sparse {
                continue;
            }
            return Some(TreeNode {
                path: &node.path,
                value: node.value.as_ref(),
                has_children: !node.children.is_empty(),
                depth: self.chain.len(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PathTree<u32> {
        let mut tree = PathTree::new('/');
        for (i, p) in ["$/A", "$/A/b", "$/A/b/c", "$/A.b", "$/Z/deep/x"].iter().enumerate() {
            tree.insert(p, i as u32, false).unwrap();
        }
        tree
    }

    fn paths<'a>(it: impl Iterator<Item = TreeNode<'a, u32>>) -> Vec<String> {
        it.map(|n| n.path.to_string()).collect()
    }

    #[test]
    fn test_get_is_case_insensitive() {
        let tree = sample();
        assert_eq!(tree.get("$/a/B"), Some(&1));
        assert_eq!(tree.stored_path("$/a/B"), Some("$/A/b"));
        assert_eq!(tree.get("$/Z/deep"), None);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_insert_duplicate() {
        let mut tree = sample();
        assert!(matches!(
            tree.insert("$/a", 9, false),
            Err(PathError::DuplicateKey(_))
        ));
        assert_eq!(tree.insert("$/a", 9, true).unwrap(), Some(0));
        assert_eq!(tree.stored_path("$/A"), Some("$/a"));
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_subtree_order_and_depth() {
        let tree = sample();
        let all = paths(tree.subtree("$", SubTreeOptions::CHILDREN, usize::MAX));
        assert_eq!(all, vec!["$/A", "$/A/b", "$/A/b/c", "$/A.b", "$/Z/deep/x"]);

        let one = paths(tree.subtree("$/A", SubTreeOptions::WITH_ROOT, 1));
        assert_eq!(one, vec!["$/A", "$/A/b"]);

        let none = paths(tree.subtree("$/A", SubTreeOptions::WITH_ROOT, 0));
        assert_eq!(none, vec!["$/A"]);

        assert_eq!(tree.subtree("$/missing", SubTreeOptions::WITH_ROOT, usize::MAX).count(), 0);
    }

    #[test]
    fn test_sparse_nodes() {
        let tree = sample();
        let opts = SubTreeOptions {
            include_root: false,
            include_sparse: true,
        };
        let nodes: Vec<_> = tree.subtree("$/Z", opts, usize::MAX).collect();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].value.is_none());
        assert!(nodes[0].has_children);
        assert_eq!(nodes[1].value, Some(&4));
        assert!(tree.has_descendants("$/Z"));
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let tree = sample();
        let chain = paths(tree.ancestors("$/A/b/c/d", false));
        assert_eq!(chain, vec!["$/A/b/c", "$/A/b", "$/A"]);
        assert_eq!(tree.get_nearest("$/A/b/zzz"), Some(("$/A/b", &1)));
    }

    #[test]
    fn test_remove_prunes_sparse_nodes() {
        let mut tree = sample();
        assert!(tree.remove("$/Z/deep/x", false));
        assert!(!tree.has_descendants("$/Z"));
        assert_eq!(tree.subtree("$/Z", SubTreeOptions { include_root: true, include_sparse: true }, usize::MAX).count(), 0);

        assert!(tree.remove("$/A", true));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get("$/A.b"), Some(&3));
    }

    #[test]
    fn test_remove_keeps_children() {
        let mut tree = sample();
        assert!(tree.remove("$/A/b", false));
        assert_eq!(tree.get("$/A/b/c"), Some(&2));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_modify() {
        let mut tree = sample();
        tree.modify("$/A", |v| v.map(|x| x + 10));
        assert_eq!(tree.get("$/A"), Some(&10));
        tree.modify("$/new/item", |v| Some(v.unwrap_or(42)));
        assert_eq!(tree.get("$/new/item"), Some(&42));
        tree.modify("$/new/item", |_| None);
        assert!(!tree.has_descendants("$/new"));
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_walk_can_stop_and_restart() {
        let tree = sample();
        let mut walk = tree.subtree("$/A", SubTreeOptions::WITH_ROOT, usize::MAX);
        assert_eq!(walk.next().map(|n| n.path), Some("$/A"));
        let resumed = walk.clone();
        assert_eq!(paths(walk), paths(resumed));
    }
}

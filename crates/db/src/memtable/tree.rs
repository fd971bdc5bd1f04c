// Copyright 2025 loam developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cmp::Ordering;

use crate::format::Entry;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Color {
    Red,
    Black,
}

type Link = Option<Box<Node>>;

struct Node {
    entry: Entry,
    color: Color,
    left:  Link,
    right: Link,
}

impl Node {
    fn new(entry: Entry) -> Box<Node> {
        Box::new(Node {
            entry,
            color: Color::Red,
            left: None,
            right: None,
        })
    }
}

/// Left-leaning red-black tree keyed by entry key.
///
/// Invariants: red links lean left (a right-leaning red is rotated away),
/// no node has two consecutive red left links, and the root is always
/// black. Inserting an existing key replaces its entry in place, so `len`
/// counts distinct keys.
pub(crate) struct LlrbTree {
    root: Link,
    len:  usize,
}

impl LlrbTree {
    pub(crate) fn new() -> Self { Self { root: None, len: 0 } }

    /// Number of distinct keys.
    pub(crate) fn len(&self) -> usize { self.len }

    pub(crate) fn is_empty(&self) -> bool { self.len == 0 }

    /// Inserts or replaces the entry for its key.
    pub(crate) fn insert(&mut self, entry: Entry) {
        let mut root = Self::insert_node(self.root.take(), entry, &mut self.len);
        root.color = Color::Black;
        self.root = Some(root);
    }

    fn insert_node(link: Link, entry: Entry, len: &mut usize) -> Box<Node> {
        let mut node = match link {
            None => {
                *len += 1;
                return Node::new(entry);
            }
            Some(node) => node,
        };

        match entry.key.cmp(&node.entry.key) {
            Ordering::Less => node.left = Some(Self::insert_node(node.left.take(), entry, len)),
            Ordering::Greater => {
                node.right = Some(Self::insert_node(node.right.take(), entry, len))
            }
            Ordering::Equal => node.entry = entry,
        }

        Self::rebalance(node)
    }

    /// Standard bottom-up fix-ups: rotate a right-leaning red left, rotate
    /// two consecutive left reds right, then split a red pair by flipping
    /// colors.
    fn rebalance(mut node: Box<Node>) -> Box<Node> {
        if is_red(&node.right) && !is_red(&node.left) {
            node = rotate_left(node);
        }
        if is_red(&node.left) && node.left.as_ref().is_some_and(|left| is_red(&left.left)) {
            node = rotate_right(node);
        }
        if is_red(&node.left) && is_red(&node.right) {
            flip_colors(&mut node);
        }
        node
    }

    /// Finds the entry for `key`, tombstones included.
    pub(crate) fn get(&self, key: &[u8]) -> Option<&Entry> {
        let mut current = self.root.as_deref();
        while let Some(node) = current {
            match key.cmp(node.entry.key.as_slice()) {
                Ordering::Less => current = node.left.as_deref(),
                Ordering::Greater => current = node.right.as_deref(),
                Ordering::Equal => return Some(&node.entry),
            }
        }
        None
    }

    /// In-order traversal: entries in ascending key order.
    pub(crate) fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(self.len);
        Self::collect(&self.root, &mut out);
        out
    }

    fn collect(link: &Link, out: &mut Vec<Entry>) {
        if let Some(node) = link {
            Self::collect(&node.left, out);
            out.push(node.entry.clone());
            Self::collect(&node.right, out);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }
}

fn is_red(link: &Link) -> bool { matches!(link, Some(node) if node.color == Color::Red) }

fn rotate_left(mut node: Box<Node>) -> Box<Node> {
    let Some(mut pivot) = node.right.take() else {
        return node;
    };
    node.right = pivot.left.take();
    pivot.color = node.color;
    node.color = Color::Red;
    pivot.left = Some(node);
    pivot
}

fn rotate_right(mut node: Box<Node>) -> Box<Node> {
    let Some(mut pivot) = node.left.take() else {
        return node;
    };
    node.left = pivot.right.take();
    pivot.color = node.color;
    node.color = Color::Red;
    pivot.right = Some(node);
    pivot
}

fn flip_colors(node: &mut Node) {
    node.color = Color::Red;
    if let Some(left) = node.left.as_mut() {
        left.color = Color::Black;
    }
    if let Some(right) = node.right.as_mut() {
        right.color = Color::Black;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Entry;

    fn insert(tree: &mut LlrbTree, key: &str, value: &str) {
        tree.insert(Entry::insert(key.as_bytes(), value.as_bytes()));
    }

    /// Checks the red-black structure: no right-leaning red link, no two
    /// consecutive left reds, equal black height on every path. Returns the
    /// black height.
    fn check_invariants(link: &Link, parent_is_red: bool) -> usize {
        let Some(node) = link else { return 1 };

        if node.color == Color::Red {
            assert!(!parent_is_red, "two consecutive red links");
        }
        assert!(
            !is_red(&node.right),
            "right-leaning red link at {:?}",
            node.entry
        );

        let left_height = check_invariants(&node.left, node.color == Color::Red);
        let right_height = check_invariants(&node.right, false);
        assert_eq!(left_height, right_height, "unequal black height");

        left_height + usize::from(node.color == Color::Black)
    }

    fn assert_balanced(tree: &LlrbTree) {
        assert!(
            !is_red(&tree.root),
            "root must be black after every insert"
        );
        check_invariants(&tree.root, false);
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut tree = LlrbTree::new();
        for i in 0..256 {
            insert(&mut tree, &format!("key{i:04}"), "value");
            assert_balanced(&tree);
        }
        assert_eq!(tree.len(), 256);
    }

    #[test]
    fn descending_inserts_stay_balanced() {
        let mut tree = LlrbTree::new();
        for i in (0..256).rev() {
            insert(&mut tree, &format!("key{i:04}"), "value");
        }
        assert_balanced(&tree);
        assert_eq!(tree.len(), 256);
    }

    #[test]
    fn reinserting_a_key_updates_in_place() {
        let mut tree = LlrbTree::new();
        insert(&mut tree, "key", "old");
        insert(&mut tree, "key", "new");

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(b"key").unwrap().value, b"new".to_vec());
    }

    #[test]
    fn tombstones_are_stored_like_inserts() {
        let mut tree = LlrbTree::new();
        insert(&mut tree, "key", "value");
        tree.insert(Entry::tombstone(b"key".to_vec()));

        assert_eq!(tree.len(), 1);
        assert!(tree.get(b"key").unwrap().is_tombstone());
    }

    #[test]
    fn get_missing_key_is_none() {
        let mut tree = LlrbTree::new();
        insert(&mut tree, "present", "value");
        assert!(tree.get(b"absent").is_none());
    }

    #[test]
    fn in_order_traversal_is_sorted() {
        let mut tree = LlrbTree::new();
        for key in ["pear", "apple", "plum", "fig", "cherry", "banana"] {
            insert(&mut tree, key, "v");
        }

        let keys: Vec<_> = tree.entries().into_iter().map(|e| e.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn clear_resets_the_tree() {
        let mut tree = LlrbTree::new();
        for i in 0..32 {
            insert(&mut tree, &format!("key{i}"), "value");
        }
        tree.clear();

        assert!(tree.is_empty());
        assert!(tree.get(b"key0").is_none());
        assert!(tree.entries().is_empty());
    }
}

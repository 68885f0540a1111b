//! Scapegoat tree of bounded leaf nodes.
//!
//! The outer tree is an α-balanced (α = √½) binary search tree whose nodes
//! each hold one bounded leaf container, ordered by the leaf's minimum item.
//! No rotations: an insert that lands too deep rebuilds the subtree under
//! the scapegoat ancestor, and sustained erasure rebuilds the whole tree.
//! Nodes live in an index arena, so cursors are plain `(node, index)` pairs
//! rather than pointers into mapped memory.

use std::cmp::Ordering;

pub mod compressed;
mod node;

pub use compressed::{CompressedLookupTree, NodeCodec, U64DeltaCodec};
pub(crate) use node::LeafNode;

/// Item comparator. Implementations must be a total order.
pub trait Compare<T> {
    fn cmp(&self, a: &T, b: &T) -> Ordering;

    #[inline]
    fn lt(&self, a: &T, b: &T) -> bool {
        self.cmp(a, b) == Ordering::Less
    }

    #[inline]
    fn le(&self, a: &T, b: &T) -> bool {
        self.cmp(a, b) != Ordering::Greater
    }

    #[inline]
    fn eq(&self, a: &T, b: &T) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }
}

/// Comparator delegating to the item's `Ord`.
#[derive(Default, Clone, Copy, Debug)]
pub struct NaturalOrder;

impl<T: Ord> Compare<T> for NaturalOrder {
    #[inline]
    fn cmp(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

/// Default number of items per leaf node.
pub const DEFAULT_NODE_CAPACITY: usize = 64;

/// Stable handle to one item: arena node plus index within the node. Valid
/// until the next structural mutation of the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    node: u32,
    index: u32,
}

struct Node<T> {
    leaf: LeafNode<T>,
    left: Option<u32>,
    right: Option<u32>,
    parent: Option<u32>,
}

/// Scapegoat-balanced ordered multiset with bounded leaf nodes.
pub struct SgbTree<T, C = NaturalOrder> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
    root: Option<u32>,
    cmp: C,
    node_capacity: usize,
    len: usize,
    node_count: usize,
    /// High-water node count since the last full rebuild; drives the
    /// deletion rebalance rule.
    max_node_count: usize,
}

impl<T: Clone, C: Compare<T> + Default> SgbTree<T, C> {
    pub fn new() -> Self {
        Self::with_node_capacity(C::default(), DEFAULT_NODE_CAPACITY)
    }
}

impl<T: Clone, C: Compare<T> + Default> Default for SgbTree<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, C: Compare<T>> SgbTree<T, C> {
    pub fn with_comparator(cmp: C) -> Self {
        Self::with_node_capacity(cmp, DEFAULT_NODE_CAPACITY)
    }

    pub fn with_node_capacity(cmp: C, node_capacity: usize) -> Self {
        assert!(node_capacity >= 2, "leaf nodes hold at least two items");
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            cmp,
            node_capacity,
            len: 0,
            node_count: 0,
            max_node_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn get(&self, cursor: Cursor) -> &T {
        self.nodes[cursor.node as usize].leaf.get(cursor.index as usize)
    }

    // -- arena plumbing -------------------------------------------------

    fn node(&self, idx: u32) -> &Node<T> {
        &self.nodes[idx as usize]
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node<T> {
        &mut self.nodes[idx as usize]
    }

    fn alloc_node(&mut self, leaf: LeafNode<T>) -> u32 {
        let node = Node {
            leaf,
            left: None,
            right: None,
            parent: None,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    fn release_node(&mut self, idx: u32) {
        self.nodes[idx as usize].leaf = LeafNode::new(0);
        self.free.push(idx);
    }

    // -- ordered navigation over leaf nodes -----------------------------

    /// Node with the greatest key not greater than `probe`.
    fn lower_equal_node(&self, probe: &T) -> Option<u32> {
        let mut cur = self.root;
        let mut result = None;
        while let Some(idx) = cur {
            if self.cmp.le(self.node(idx).leaf.key(), probe) {
                result = Some(idx);
                cur = self.node(idx).right;
            } else {
                cur = self.node(idx).left;
            }
        }
        result
    }

    fn min_node_from(&self, mut idx: u32) -> u32 {
        while let Some(left) = self.node(idx).left {
            idx = left;
        }
        idx
    }

    fn max_node_from(&self, mut idx: u32) -> u32 {
        while let Some(right) = self.node(idx).right {
            idx = right;
        }
        idx
    }

    fn next_node(&self, idx: u32) -> Option<u32> {
        if let Some(right) = self.node(idx).right {
            return Some(self.min_node_from(right));
        }
        let mut child = idx;
        let mut parent = self.node(idx).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    fn prev_node(&self, idx: u32) -> Option<u32> {
        if let Some(left) = self.node(idx).left {
            return Some(self.max_node_from(left));
        }
        let mut child = idx;
        let mut parent = self.node(idx).parent;
        while let Some(p) = parent {
            if self.node(p).right == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    // -- mutation -------------------------------------------------------

    pub fn insert(&mut self, item: T) {
        self.len += 1;
        let Some(root) = self.root else {
            let mut leaf = LeafNode::new(self.node_capacity);
            leaf.append(item, &self.cmp);
            let idx = self.alloc_node(leaf);
            self.root = Some(idx);
            self.node_count = 1;
            self.max_node_count = 1;
            return;
        };

        let target = self
            .lower_equal_node(&item)
            .unwrap_or_else(|| self.min_node_from(root));
        if self.node(target).leaf.len() >= self.node_capacity {
            // full: split the upper half into a fresh sibling node
            let upper = {
                let cmp = &self.cmp;
                // split borrows: the comparator is read-only state
                let leaf = &mut self.nodes[target as usize].leaf;
                leaf.split_upper_half(cmp)
            };
            let goes_right = !self.cmp.lt(&item, &upper[0]);
            let new_idx = self.insert_leaf(LeafNode::from_sorted(upper));
            let into = if goes_right { new_idx } else { target };
            let cmp = &self.cmp;
            self.nodes[into as usize].leaf.append(item, cmp);
        } else {
            let cmp = &self.cmp;
            self.nodes[target as usize].leaf.append(item, cmp);
        }
    }

    /// Insert a prepared leaf node into the outer tree, rebuilding at the
    /// scapegoat when the insertion lands too deep.
    fn insert_leaf(&mut self, leaf: LeafNode<T>) -> u32 {
        let key = leaf.key().clone();
        let idx = self.alloc_node(leaf);
        self.node_count += 1;
        self.max_node_count = self.max_node_count.max(self.node_count);

        let mut cur = self.root.expect("insert_leaf on an empty tree");
        let mut depth = 1usize;
        loop {
            depth += 1;
            if self.cmp.lt(&key, self.node(cur).leaf.key()) {
                match self.node(cur).left {
                    Some(left) => cur = left,
                    None => {
                        self.node_mut(cur).left = Some(idx);
                        break;
                    }
                }
            } else {
                match self.node(cur).right {
                    Some(right) => cur = right,
                    None => {
                        self.node_mut(cur).right = Some(idx);
                        break;
                    }
                }
            }
        }
        self.node_mut(idx).parent = Some(cur);

        if depth > self.depth_limit() {
            self.rebuild_at_scapegoat(idx);
        }
        idx
    }

    /// Depth bound log₍₁/α₎(n) + 1 with α = √½, i.e. ⌊2·log₂ n⌋ + 1.
    fn depth_limit(&self) -> usize {
        let n = self.node_count as u64;
        if n < 2 {
            return 1;
        }
        (n * n).ilog2() as usize + 1
    }

    fn subtree_count(&self, idx: u32) -> u64 {
        let mut stack = vec![idx];
        let mut count = 0u64;
        while let Some(i) = stack.pop() {
            count += 1;
            if let Some(l) = self.node(i).left {
                stack.push(l);
            }
            if let Some(r) = self.node(i).right {
                stack.push(r);
            }
        }
        count
    }

    fn rebuild_at_scapegoat(&mut self, inserted: u32) {
        // walk up accumulating subtree sizes; the highest α-weight violation
        // is the scapegoat (child² · 2 > parent² ⇔ child > parent·√½)
        let mut child = inserted;
        let mut child_size = 1u64;
        let mut scapegoat = None;
        while let Some(parent) = self.node(child).parent {
            let sibling = if self.node(parent).left == Some(child) {
                self.node(parent).right
            } else {
                self.node(parent).left
            };
            let parent_size = child_size + 1 + sibling.map_or(0, |s| self.subtree_count(s));
            if child_size * child_size * 2 > parent_size * parent_size {
                scapegoat = Some(parent);
            }
            child = parent;
            child_size = parent_size;
        }
        if let Some(at) = scapegoat {
            self.rebuild(at);
        }
    }

    /// Rebuild the subtree rooted at `at` into perfectly balanced shape.
    fn rebuild(&mut self, at: u32) {
        let parent = self.node(at).parent;
        let mut ordered = Vec::new();
        self.collect_in_order(at, &mut ordered);
        let new_root = self.link_balanced(&ordered, parent);
        match parent {
            None => self.root = Some(new_root),
            Some(p) => {
                if self.node(p).left == Some(at) {
                    self.node_mut(p).left = Some(new_root);
                } else {
                    self.node_mut(p).right = Some(new_root);
                }
            }
        }
    }

    fn collect_in_order(&self, idx: u32, out: &mut Vec<u32>) {
        // iterative in-order traversal
        let mut stack = Vec::new();
        let mut cur = Some(idx);
        while cur.is_some() || !stack.is_empty() {
            while let Some(i) = cur {
                stack.push(i);
                cur = self.node(i).left;
            }
            let i = stack.pop().expect("in-order stack underflow");
            out.push(i);
            cur = self.node(i).right;
        }
    }

    fn link_balanced(&mut self, ordered: &[u32], parent: Option<u32>) -> u32 {
        let mid = ordered.len() / 2;
        let idx = ordered[mid];
        let node = self.node_mut(idx);
        node.parent = parent;
        node.left = None;
        node.right = None;
        if mid > 0 {
            let left = self.link_balanced(&ordered[..mid], Some(idx));
            self.node_mut(idx).left = Some(left);
        }
        if mid + 1 < ordered.len() {
            let right = self.link_balanced(&ordered[mid + 1..], Some(idx));
            self.node_mut(idx).right = Some(right);
        }
        idx
    }

    /// Remove a whole leaf node from the outer tree.
    fn remove_node(&mut self, idx: u32) {
        let (left, right) = (self.node(idx).left, self.node(idx).right);
        let victim = if left.is_some() && right.is_some() {
            // move the successor's payload here, then unlink the successor
            let succ = self.min_node_from(right.expect("checked above"));
            let leaf = std::mem::replace(&mut self.nodes[succ as usize].leaf, LeafNode::new(0));
            self.nodes[idx as usize].leaf = leaf;
            succ
        } else {
            idx
        };

        let child = self.node(victim).left.or(self.node(victim).right);
        let parent = self.node(victim).parent;
        if let Some(c) = child {
            self.node_mut(c).parent = parent;
        }
        match parent {
            None => self.root = child,
            Some(p) => {
                if self.node(p).left == Some(victim) {
                    self.node_mut(p).left = child;
                } else {
                    self.node_mut(p).right = child;
                }
            }
        }
        self.release_node(victim);
        self.node_count -= 1;

        // deletion rebalance: rebuild everything once the tree shrank past
        // the α envelope of its high-water size
        let n = self.node_count as u64;
        let m = self.max_node_count as u64;
        if let Some(root) = self.root {
            if n * n * 2 < m * m {
                self.rebuild(root);
                self.max_node_count = self.node_count;
            }
        } else {
            self.max_node_count = 0;
        }
    }

    /// Remove the item under `cursor`. The cursor (and any other) is
    /// invalidated.
    pub fn erase_at(&mut self, cursor: Cursor) {
        let cmp_len = {
            let cmp = &self.cmp;
            let leaf = &mut self.nodes[cursor.node as usize].leaf;
            leaf.erase_at(cursor.index as usize, cmp);
            leaf.len()
        };
        self.len -= 1;
        if cmp_len == 0 {
            self.remove_node(cursor.node);
        }
    }

    /// Remove one item equal to `probe`; false when none exists.
    pub fn erase_equal(&mut self, probe: &T) -> bool {
        match self.find_equal(probe) {
            Some(cursor) => {
                self.erase_at(cursor);
                true
            }
            None => false,
        }
    }

    /// Mutate the item under `cursor` in place. The closure must not change
    /// the item's position in the comparator's order.
    pub fn modify_at<R>(&mut self, cursor: Cursor, f: impl FnOnce(&mut T) -> R) -> R {
        f(self.nodes[cursor.node as usize]
            .leaf
            .get_mut(cursor.index as usize))
    }

    // -- queries --------------------------------------------------------

    pub fn find_equal(&self, probe: &T) -> Option<Cursor> {
        let node = self.lower_equal_node(probe)?;
        let index = self.node(node).leaf.find_equal(probe, &self.cmp)?;
        Some(Cursor {
            node,
            index: index as u32,
        })
    }

    /// Greatest item not greater than `probe`.
    pub fn lower_equal_bound(&self, probe: &T) -> Option<Cursor> {
        let node = self.lower_equal_node(probe)?;
        let index = self.node(node).leaf.lower_equal(probe, &self.cmp)?;
        Some(Cursor {
            node,
            index: index as u32,
        })
    }

    /// Smallest item not smaller than `probe`.
    pub fn upper_equal_bound(&self, probe: &T) -> Option<Cursor> {
        let root = self.root?;
        match self.lower_equal_node(probe) {
            Some(node) => match self.node(node).leaf.upper_equal(probe, &self.cmp) {
                Some(index) => Some(Cursor {
                    node,
                    index: index as u32,
                }),
                // everything in this node is below the probe; the answer is
                // the minimum of the next node
                None => self.next_node(node).map(|next| Cursor {
                    node: next,
                    index: 0,
                }),
            },
            // the probe is below every key, so below every item
            None => Some(Cursor {
                node: self.min_node_from(root),
                index: 0,
            }),
        }
    }

    pub fn find_min(&self) -> Option<Cursor> {
        let root = self.root?;
        Some(Cursor {
            node: self.min_node_from(root),
            index: 0,
        })
    }

    pub fn find_max(&self) -> Option<Cursor> {
        let root = self.root?;
        let node = self.max_node_from(root);
        let index = self.node(node).leaf.find_max(&self.cmp)?;
        Some(Cursor {
            node,
            index: index as u32,
        })
    }

    /// Greatest item ≤ `probe` together with its immediate neighbors, which
    /// may sit in adjacent leaf nodes. `None` when no item is ≤ `probe`.
    ///
    /// Takes `&mut self` because the center node is folded sorted to make
    /// in-node neighbors exact.
    pub fn lower_equal_window(&mut self, probe: &T) -> Option<[Option<Cursor>; 3]> {
        let node = self.lower_equal_node(probe)?;
        {
            let cmp = &self.cmp;
            self.nodes[node as usize].leaf.sort_all(cmp);
        }
        let leaf = &self.node(node).leaf;
        let at = leaf.lower_equal(probe, &self.cmp)?;
        let center = Cursor {
            node,
            index: at as u32,
        };
        let prev = if at > 0 {
            Some(Cursor {
                node,
                index: (at - 1) as u32,
            })
        } else {
            self.prev_node(node).and_then(|p| {
                self.node(p).leaf.find_max(&self.cmp).map(|i| Cursor {
                    node: p,
                    index: i as u32,
                })
            })
        };
        let next = if at + 1 < leaf.len() {
            Some(Cursor {
                node,
                index: (at + 1) as u32,
            })
        } else {
            self.next_node(node).map(|n| Cursor { node: n, index: 0 })
        };
        Some([prev, Some(center), next])
    }

    // -- iteration ------------------------------------------------------

    /// Fully sorted iteration over all items.
    pub fn iter(&self) -> SortedIter<'_, T, C> {
        let node = self.root.map(|r| self.min_node_from(r));
        let mut iter = SortedIter {
            tree: self,
            node,
            buf: Vec::new(),
            pos: 0,
        };
        iter.load();
        iter
    }

    /// Ascending partially-sorted iteration starting at `cursor`: the rest
    /// of the cursor's node in storage order, then subsequent nodes.
    pub fn iter_from(&self, cursor: Cursor) -> UnsortedIter<'_, T, C> {
        UnsortedIter {
            tree: self,
            node: Some(cursor.node),
            index: cursor.index as usize,
            descending: false,
        }
    }

    /// Iterate leaf nodes in key order, yielding each node's items in
    /// storage order.
    pub fn iter_nodes(&self) -> NodeIter<'_, T, C> {
        NodeIter {
            tree: self,
            node: self.root.map(|r| self.min_node_from(r)),
        }
    }

    /// Descending partially-sorted iteration: nodes from highest key to
    /// lowest, items within a node in reverse storage order.
    pub fn iter_unsorted_desc(&self) -> UnsortedIter<'_, T, C> {
        let node = self.root.map(|r| self.max_node_from(r));
        let index = node.map_or(0, |n| self.node(n).leaf.len().saturating_sub(1));
        UnsortedIter {
            tree: self,
            node,
            index,
            descending: true,
        }
    }
}

/// See [`SgbTree::iter`].
pub struct SortedIter<'a, T, C> {
    tree: &'a SgbTree<T, C>,
    node: Option<u32>,
    buf: Vec<T>,
    pos: usize,
}

impl<T: Clone, C: Compare<T>> SortedIter<'_, T, C> {
    fn load(&mut self) {
        self.buf.clear();
        self.pos = 0;
        if let Some(node) = self.node {
            self.buf
                .extend_from_slice(self.tree.node(node).leaf.items());
            self.buf.sort_by(|a, b| self.tree.cmp.cmp(a, b));
        }
    }
}

impl<T: Clone, C: Compare<T>> Iterator for SortedIter<'_, T, C> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let node = self.node?;
            if self.pos < self.buf.len() {
                let item = self.buf[self.pos].clone();
                self.pos += 1;
                return Some(item);
            }
            self.node = self.tree.next_node(node);
            self.load();
        }
    }
}

/// See [`SgbTree::iter_nodes`].
pub struct NodeIter<'a, T, C> {
    tree: &'a SgbTree<T, C>,
    node: Option<u32>,
}

impl<'a, T: Clone, C: Compare<T>> Iterator for NodeIter<'a, T, C> {
    type Item = &'a [T];

    fn next(&mut self) -> Option<&'a [T]> {
        let node = self.node?;
        self.node = self.tree.next_node(node);
        Some(self.tree.node(node).leaf.items())
    }
}

/// See [`SgbTree::iter_from`] and [`SgbTree::iter_unsorted_desc`].
pub struct UnsortedIter<'a, T, C> {
    tree: &'a SgbTree<T, C>,
    node: Option<u32>,
    index: usize,
    descending: bool,
}

impl<T: Clone, C: Compare<T>> Iterator for UnsortedIter<'_, T, C> {
    type Item = (Cursor, T);

    fn next(&mut self) -> Option<(Cursor, T)> {
        let node = self.node?;
        let leaf = &self.tree.node(node).leaf;
        debug_assert!(self.index < leaf.len());
        let cursor = Cursor {
            node,
            index: self.index as u32,
        };
        let item = leaf.get(self.index).clone();
        if self.descending {
            if self.index == 0 {
                self.node = self.tree.prev_node(node);
                self.index = self
                    .node
                    .map_or(0, |n| self.tree.node(n).leaf.len().saturating_sub(1));
            } else {
                self.index -= 1;
            }
        } else {
            self.index += 1;
            if self.index >= leaf.len() {
                self.node = self.tree.next_node(node);
                self.index = 0;
            }
        }
        Some((cursor, item))
    }
}

impl<T: Clone + std::fmt::Debug, C: Compare<T>> std::fmt::Debug for SgbTree<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SgbTree")
            .field("len", &self.len)
            .field("node_count", &self.node_count)
            .finish()
    }
}

//! Compressed lookup-tree variant.
//!
//! Nodes store node-relative (compressed) elements to save space: the first
//! item appended to a node seeds its header, every later item is stored as a
//! delta against that header. Items that cannot be expressed relative to a
//! node's header open a node of their own, so dense key populations compress
//! well while sparse outliers stay representable.

use super::Compare;

/// Per-node compression capability: derive a header from a node's first
/// item, then pack and unpack items relative to it.
pub trait NodeCodec<T> {
    type Header: Clone;
    type Packed: Clone;

    /// Header seeded by the first item of a node.
    fn derive_header(&self, item: &T) -> Self::Header;

    /// Whether `item` is representable relative to `header`.
    fn can_fit(&self, header: &Self::Header, item: &T) -> bool;

    fn compress(&self, header: &Self::Header, item: &T) -> Self::Packed;

    fn uncompress(&self, header: &Self::Header, packed: &Self::Packed) -> T;
}

/// Codec for `u64` keys stored as `u32` deltas against the node's base key.
#[derive(Default, Clone, Copy, Debug)]
pub struct U64DeltaCodec;

impl NodeCodec<u64> for U64DeltaCodec {
    type Header = u64;
    type Packed = u32;

    fn derive_header(&self, item: &u64) -> u64 {
        *item
    }

    fn can_fit(&self, header: &u64, item: &u64) -> bool {
        item.checked_sub(*header)
            .is_some_and(|delta| delta <= u32::MAX as u64)
    }

    fn compress(&self, header: &u64, item: &u64) -> u32 {
        (*item - *header) as u32
    }

    fn uncompress(&self, header: &u64, packed: &u32) -> u64 {
        *header + *packed as u64
    }
}

struct CompressedNode<H, P> {
    header: H,
    /// Packed items, kept sorted in uncompressed order.
    packed: Vec<P>,
}

/// Ordered lookup table of delta-compressed nodes.
///
/// The API mirrors the uncompressed tree's lookup surface; queries
/// materialize items on the way out. Nodes split at their median and
/// re-derive headers, so a node's base always equals its smallest item.
pub struct CompressedLookupTree<T, C, D: NodeCodec<T>> {
    nodes: Vec<CompressedNode<D::Header, D::Packed>>,
    cmp: C,
    codec: D,
    node_capacity: usize,
    len: usize,
}

impl<T: Clone, C: Compare<T>, D: NodeCodec<T>> CompressedLookupTree<T, C, D> {
    pub fn new(cmp: C, codec: D, node_capacity: usize) -> Self {
        assert!(node_capacity >= 2, "nodes hold at least two items");
        Self {
            nodes: Vec::new(),
            cmp,
            codec,
            node_capacity,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn item_at(&self, node: usize, index: usize) -> T {
        let node = &self.nodes[node];
        self.codec.uncompress(&node.header, &node.packed[index])
    }

    fn key_of(&self, node: usize) -> T {
        self.item_at(node, 0)
    }

    /// Greatest node whose key is not greater than `probe`.
    fn lower_equal_node(&self, probe: &T) -> Option<usize> {
        let at = self
            .nodes
            .len()
            .min(self.partition_nodes(probe));
        at.checked_sub(1)
    }

    /// Number of leading nodes whose key is ≤ `probe`.
    fn partition_nodes(&self, probe: &T) -> usize {
        let mut lo = 0usize;
        let mut hi = self.nodes.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.cmp.le(&self.key_of(mid), probe) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Position of the first item in `node` that is not less than `probe`.
    fn partition_items(&self, node: usize, probe: &T) -> usize {
        let mut lo = 0usize;
        let mut hi = self.nodes[node].packed.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.cmp.lt(&self.item_at(node, mid), probe) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn insert(&mut self, item: T) {
        let Some(target) = self.lower_equal_node(&item).or((!self.nodes.is_empty()).then_some(0))
        else {
            self.open_node(0, &item);
            self.len += 1;
            return;
        };

        if !self.codec.can_fit(&self.nodes[target].header, &item) {
            // a new minimum may still belong here once the node is rebased
            // onto it
            if self.cmp.lt(&item, &self.key_of(target))
                && self.nodes[target].packed.len() < self.node_capacity
            {
                let new_header = self.codec.derive_header(&item);
                let mut items = self.materialize(target);
                if items.iter().all(|it| self.codec.can_fit(&new_header, it)) {
                    items.insert(0, item);
                    self.repack(target, &items);
                    self.len += 1;
                    return;
                }
            }
            // not representable against this node's base: give it a node of
            // its own at the proper position
            let at = self.partition_nodes(&item);
            self.open_node(at, &item);
            self.len += 1;
            return;
        }
        if self.nodes[target].packed.len() >= self.node_capacity {
            self.split_node(target);
            // re-route: the split may have moved the item's home node
            return self.insert(item);
        }

        let at = self.partition_items(target, &item);
        if at == 0 {
            // a new minimum becomes the node's base: re-derive the header
            // and re-pack everything against it
            let mut items: Vec<T> = self.materialize(target);
            items.insert(0, item);
            self.repack(target, &items);
        } else {
            let packed = self.codec.compress(&self.nodes[target].header, &item);
            self.nodes[target].packed.insert(at, packed);
        }
        self.len += 1;
    }

    /// Remove one item equal to `probe`; false when none exists.
    pub fn erase_equal(&mut self, probe: &T) -> bool {
        let Some(node) = self.lower_equal_node(probe) else {
            return false;
        };
        let at = self.partition_items(node, probe);
        if at >= self.nodes[node].packed.len() || !self.cmp.eq(&self.item_at(node, at), probe) {
            return false;
        }
        if at == 0 {
            let mut items = self.materialize(node);
            items.remove(0);
            if items.is_empty() {
                self.nodes.remove(node);
            } else {
                self.repack(node, &items);
            }
        } else {
            self.nodes[node].packed.remove(at);
        }
        self.len -= 1;
        true
    }

    pub fn find_equal(&self, probe: &T) -> Option<T> {
        let node = self.lower_equal_node(probe)?;
        let at = self.partition_items(node, probe);
        (at < self.nodes[node].packed.len())
            .then(|| self.item_at(node, at))
            .filter(|item| self.cmp.eq(item, probe))
    }

    /// Greatest item not greater than `probe`.
    pub fn lower_equal_bound(&self, probe: &T) -> Option<T> {
        let node = self.lower_equal_node(probe)?;
        let at = self.partition_items(node, probe);
        if at < self.nodes[node].packed.len() {
            let item = self.item_at(node, at);
            if self.cmp.eq(&item, probe) {
                return Some(item);
            }
        }
        // every item before `at` is smaller
        at.checked_sub(1).map(|i| self.item_at(node, i))
    }

    /// Smallest item not smaller than `probe`.
    pub fn upper_equal_bound(&self, probe: &T) -> Option<T> {
        let node = match self.lower_equal_node(probe) {
            Some(node) => {
                let at = self.partition_items(node, probe);
                if at < self.nodes[node].packed.len() {
                    return Some(self.item_at(node, at));
                }
                node + 1
            }
            None => 0,
        };
        (node < self.nodes.len()).then(|| self.item_at(node, 0))
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.nodes.iter().flat_map(move |node| {
            node.packed
                .iter()
                .map(move |packed| self.codec.uncompress(&node.header, packed))
        })
    }

    fn materialize(&self, node: usize) -> Vec<T> {
        let node_ref = &self.nodes[node];
        node_ref
            .packed
            .iter()
            .map(|packed| self.codec.uncompress(&node_ref.header, packed))
            .collect()
    }

    fn repack(&mut self, node: usize, items: &[T]) {
        let header = self.codec.derive_header(&items[0]);
        let packed = items
            .iter()
            .map(|item| self.codec.compress(&header, item))
            .collect();
        self.nodes[node] = CompressedNode { header, packed };
    }

    fn open_node(&mut self, at: usize, item: &T) {
        let header = self.codec.derive_header(item);
        let packed = vec![self.codec.compress(&header, item)];
        self.nodes.insert(at, CompressedNode { header, packed });
    }

    /// Split at the median; the upper half re-derives its header from its
    /// new smallest item.
    fn split_node(&mut self, node: usize) {
        let items = self.materialize(node);
        let mid = items.len() / 2;
        let (lower, upper) = items.split_at(mid);
        self.repack(node, lower);
        let header = self.codec.derive_header(&upper[0]);
        let packed = upper
            .iter()
            .map(|item| self.codec.compress(&header, item))
            .collect();
        self.nodes.insert(
            node + 1,
            CompressedNode { header, packed },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sgb::NaturalOrder;

    fn tree() -> CompressedLookupTree<u64, NaturalOrder, U64DeltaCodec> {
        CompressedLookupTree::new(NaturalOrder, U64DeltaCodec, 8)
    }

    #[test]
    fn dense_keys_share_one_header() {
        let mut cut = tree();
        for key in [100u64, 104, 101, 107, 103] {
            cut.insert(key);
        }
        assert_eq!(cut.node_count(), 1);
        let items: Vec<u64> = cut.iter().collect();
        assert_eq!(items, vec![100, 101, 103, 104, 107]);
    }

    #[test]
    fn far_apart_keys_open_their_own_nodes() {
        let mut cut = tree();
        cut.insert(10);
        // beyond the u32 delta window of the first node's base
        cut.insert(10 + (u32::MAX as u64) + 5);
        assert_eq!(cut.node_count(), 2);
        assert_eq!(cut.len(), 2);
        assert_eq!(cut.find_equal(&(10 + (u32::MAX as u64) + 5)), Some(10 + (u32::MAX as u64) + 5));
    }

    #[test]
    fn a_new_minimum_rebases_the_node() {
        let mut cut = tree();
        cut.insert(500);
        cut.insert(600);
        cut.insert(400);
        assert_eq!(cut.node_count(), 1);
        let items: Vec<u64> = cut.iter().collect();
        assert_eq!(items, vec![400, 500, 600]);
        assert_eq!(cut.lower_equal_bound(&450), Some(400));
    }

    #[test]
    fn splits_keep_lookup_exact() {
        let mut cut = tree();
        for key in 0..100u64 {
            cut.insert(key * 3);
        }
        assert!(cut.node_count() > 1);
        assert_eq!(cut.len(), 100);
        for key in 0..100u64 {
            assert_eq!(cut.find_equal(&(key * 3)), Some(key * 3));
        }
        assert_eq!(cut.find_equal(&4), None);
        assert_eq!(cut.lower_equal_bound(&100), Some(99));
        assert_eq!(cut.upper_equal_bound(&100), Some(102));
        assert_eq!(cut.upper_equal_bound(&298), None);
        let items: Vec<u64> = cut.iter().collect();
        assert!(items.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn erase_drops_items_and_empty_nodes() {
        let mut cut = tree();
        for key in [7u64, 9, 11] {
            cut.insert(key);
        }
        assert!(cut.erase_equal(&9));
        assert!(!cut.erase_equal(&9));
        assert!(cut.erase_equal(&7));
        assert!(cut.erase_equal(&11));
        assert!(cut.is_empty());
        assert_eq!(cut.node_count(), 0);
    }
}

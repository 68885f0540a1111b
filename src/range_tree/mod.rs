//! Sort/filter index over a `(key, value)` collection.
//!
//! Values are grouped into key-disjoint ranges of bounded size. Inside a
//! range, items keep their arrival order; an overflowing range sheds its
//! highest keys into the next range (or a fresh one), so ranges stay packed
//! from the low end. Null-keyed values live in a separate bucket so
//! key-ordered queries can skip them wholesale.

mod iter;

pub use iter::{
    FtIterator, FtRangeIterator, RangeCursor, RangeIterator, RangeIteratorFactory, RangeValues,
    SortIterator, VecFtIterator,
};

/// Default cap on items per range.
pub const DEFAULT_RANGE_LIMIT: usize = 128;

/// One keyed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Item<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Item<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// Stored item plus its global arrival stamp; the stamp keeps equal-key
/// traversal stable even after items migrate between ranges.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Entry<K, V> {
    item: Item<K, V>,
    seq: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct RangeNode<K, V> {
    lo: K,
    hi: K,
    /// Unique `(key, value)` pairs.
    items: Vec<Entry<K, V>>,
}

impl<K: Ord + Copy, V: Ord + Copy> RangeNode<K, V> {
    pub(crate) fn lo(&self) -> K {
        self.lo
    }

    pub(crate) fn hi(&self) -> K {
        self.hi
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = V> + '_ {
        self.items.iter().map(|e| e.item.value)
    }

    /// Items sorted by key; equal keys keep arrival order.
    pub(crate) fn key_sorted(&self) -> Vec<Item<K, V>> {
        let mut entries = self.items.clone();
        entries.sort_by_key(|e| (e.item.key, e.seq));
        entries.into_iter().map(|e| e.item).collect()
    }
}

/// Outer sorted tree of bounded value ranges.
pub struct RangeTree<K, V> {
    ranges: Vec<RangeNode<K, V>>,
    nulls: Vec<V>,
    limit: usize,
    len: usize,
    next_seq: u64,
}

impl<K: Ord + Copy, V: Ord + Copy> Default for RangeTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Copy, V: Ord + Copy> RangeTree<K, V> {
    pub fn new() -> Self {
        Self::with_range_limit(DEFAULT_RANGE_LIMIT)
    }

    /// Create with an explicit per-range item cap.
    pub fn with_range_limit(limit: usize) -> Self {
        assert!(limit >= 2, "ranges hold at least two items");
        Self {
            ranges: Vec::new(),
            nulls: Vec::new(),
            limit,
            len: 0,
            next_seq: 0,
        }
    }

    /// Total number of stored values, null-keyed ones included.
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// True when any value carries a real (non-null) key.
    pub fn has_any_non_null(&self) -> bool {
        !self.ranges.is_empty()
    }

    pub(crate) fn range(&self, index: usize) -> &RangeNode<K, V> {
        &self.ranges[index]
    }

    pub(crate) fn null_values(&self) -> &[V] {
        &self.nulls
    }

    /// Insert a batch of keyed values. Exact `(key, value)` duplicates are
    /// skipped.
    pub fn bulk_insert<I: IntoIterator<Item = Item<K, V>>>(&mut self, items: I) {
        for item in items {
            self.insert_one(item);
        }
    }

    /// Insert values under the null key.
    pub fn bulk_insert_null<I: IntoIterator<Item = V>>(&mut self, values: I) {
        for value in values {
            if !self.nulls.contains(&value) {
                self.nulls.push(value);
                self.len += 1;
            }
        }
    }

    fn insert_one(&mut self, item: Item<K, V>) {
        let seq = self.next_seq;
        if self.ranges.is_empty() {
            self.ranges.push(RangeNode {
                lo: item.key,
                hi: item.key,
                items: vec![Entry { item, seq }],
            });
            self.len += 1;
            self.next_seq += 1;
            return;
        }

        // lowest range whose interval can cover the key; keys above every
        // range extend the last one
        let mut at = self.ranges.partition_point(|r| r.hi < item.key);
        if at == self.ranges.len() {
            at = self.ranges.len() - 1;
        }
        let range = &mut self.ranges[at];
        if range.items.iter().any(|e| e.item == item) {
            return;
        }
        range.lo = range.lo.min(item.key);
        range.hi = range.hi.max(item.key);
        range.items.push(Entry { item, seq });
        self.len += 1;
        self.next_seq += 1;
        if range.items.len() > self.limit {
            self.split_overflow(at);
        }
    }

    /// Shed the sorted overflow of `at` into the next range, cascading while
    /// needed.
    fn split_overflow(&mut self, mut at: usize) {
        while self.ranges[at].items.len() > self.limit {
            let range = &mut self.ranges[at];
            let mut order: Vec<usize> = (0..range.items.len()).collect();
            order.sort_by_key(|&i| (range.items[i].item.key, range.items[i].seq));

            let mut overflowing = vec![false; range.items.len()];
            for &i in &order[self.limit..] {
                overflowing[i] = true;
            }
            let mut moved = Vec::with_capacity(range.items.len() - self.limit);
            let mut kept = Vec::with_capacity(self.limit);
            for (i, entry) in range.items.drain(..).enumerate() {
                if overflowing[i] {
                    moved.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            let kept_hi = kept
                .iter()
                .map(|e| e.item.key)
                .max()
                .expect("kept side of a split is never empty");
            let moved_lo = moved
                .iter()
                .map(|e| e.item.key)
                .min()
                .expect("moved side of a split is never empty");
            let moved_hi = moved
                .iter()
                .map(|e| e.item.key)
                .max()
                .expect("moved side of a split is never empty");
            range.items = kept;
            range.hi = kept_hi;

            if at + 1 < self.ranges.len() {
                let next = &mut self.ranges[at + 1];
                next.lo = next.lo.min(moved_lo);
                next.items.extend(moved);
            } else {
                self.ranges.push(RangeNode {
                    lo: moved_lo,
                    hi: moved_hi,
                    items: moved,
                });
            }
            at += 1;
        }
    }

    /// Range iterator positioned at the first range whose interval reaches
    /// `key`, clamped to the last range when the key lies above everything.
    pub fn lower_bound(&self, key: K, inclusive: bool) -> RangeCursor<'_, K, V> {
        if self.ranges.is_empty() {
            return RangeCursor::finished(self);
        }
        let mut at = self
            .ranges
            .partition_point(|r| if inclusive { r.hi < key } else { r.hi <= key });
        if at == self.ranges.len() {
            at = self.ranges.len() - 1;
        }
        RangeCursor::at(self, at, true)
    }

    /// Descending counterpart of [`lower_bound`](Self::lower_bound):
    /// positioned at the last range whose interval reaches down to `key`.
    pub fn upper_bound(&self, key: K, inclusive: bool) -> RangeCursor<'_, K, V> {
        if self.ranges.is_empty() {
            return RangeCursor::finished(self);
        }
        let at = self
            .ranges
            .partition_point(|r| if inclusive { r.lo <= key } else { r.lo < key });
        RangeCursor::at(self, at.saturating_sub(1), false)
    }

    /// Iterate ranges in ascending (or descending) key order.
    pub fn begin_range(&self, ascending: bool) -> RangeCursor<'_, K, V> {
        if self.ranges.is_empty() {
            return RangeCursor::finished(self);
        }
        let start = if ascending { 0 } else { self.ranges.len() - 1 };
        RangeCursor::at(self, start, ascending)
    }
}

impl<K: Ord + Copy + std::fmt::Debug, V: Ord + Copy> std::fmt::Debug for RangeTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bounds: Vec<(K, K)> = self.ranges.iter().map(|r| (r.lo, r.hi)).collect();
        f.debug_struct("RangeTree")
            .field("len", &self.len)
            .field("nulls", &self.nulls.len())
            .field("ranges", &bounds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn items<K: Copy, V: Copy>(pairs: &[(K, V)]) -> Vec<Item<K, V>> {
        pairs.iter().map(|&(k, v)| Item::new(k, v)).collect()
    }

    const SMALL_SET: [(i32, u64); 10] = [
        (0, 0),
        (27, 4),
        (42134, 44),
        (99, 3),
        (152, 8),
        (123, 9),
        (152, 12),
        (3312, 19),
        (921, 444),
        (1923, 94),
    ];

    const SORT_SET: [(i32, u64); 7] = [
        (99, 3),
        (199, 5),
        (13, 2),
        (199, 7),
        (142, 9),
        (152, 8),
        (27, 4),
    ];

    const WIDE_SET: [(i32, u64); 11] = [
        (99, 3),
        (199, 5),
        (13, 2),
        (199, 7),
        (142, 9),
        (152, 8),
        (27, 4),
        (123, 6),
        (148, 11),
        (391, 10),
        (9234, 12),
    ];

    fn range_summary(tree: &RangeTree<i32, u64>, ascending: bool) -> String {
        let mut out = String::new();
        let mut range = tree.begin_range(ascending);
        while !range.is_end() {
            let (lo, _) = range.bounds().unwrap();
            out.push_str(&format!("{lo}:{};", range.len()));
            range.next();
        }
        out
    }

    #[test]
    fn bulk_insert_into_an_empty_tree_makes_one_range() {
        let mut cut = RangeTree::new();
        cut.bulk_insert(items(&SMALL_SET));
        assert_eq!(cut.range_count(), 1);
        assert_eq!(cut.size(), 10);
        assert!(cut.has_any_non_null());
    }

    #[test]
    fn a_single_range_iterates_sorted_by_value() {
        let mut cut = RangeTree::new();
        cut.bulk_insert(items(&SMALL_SET));
        let range = cut.begin_range(true);
        let mut last = 0u64;
        for value in range.make_iterator().unwrap() {
            assert!(last <= value);
            last = value;
        }
    }

    #[test]
    fn the_range_size_limit_splits_ranges() {
        let mut cut = RangeTree::with_range_limit(8);
        cut.bulk_insert(items(&SMALL_SET));
        assert_eq!(cut.range_count(), 2);
    }

    #[test]
    fn new_elements_join_the_covering_range() {
        let mut cut = RangeTree::with_range_limit(8);
        cut.bulk_insert(items(&SMALL_SET));
        // one more element lands in the last range
        cut.bulk_insert(items(&[(94134, 22)]));
        assert_eq!(cut.range_count(), 2);
    }

    #[test]
    fn ranges_iterate_in_key_order() {
        let mut cut = RangeTree::with_range_limit(8);
        cut.bulk_insert(items(&SMALL_SET));
        assert_eq!(range_summary(&cut, true), "0:8;3312:2;");
    }

    #[test]
    fn ranges_iterate_in_descending_key_order() {
        let mut cut = RangeTree::with_range_limit(4);
        cut.bulk_insert(items(&SMALL_SET));
        assert_eq!(range_summary(&cut, false), "3312:2;152:4;0:4;");
    }

    #[test]
    fn overflowing_inserts_explode_existing_ranges() {
        let mut cut = RangeTree::with_range_limit(8);
        cut.bulk_insert(items(&SMALL_SET));
        cut.bulk_insert(items(&[(29, 4), (199, 3), (142, 8)]));
        assert_eq!(cut.range_count(), 3);
    }

    #[test]
    fn exact_duplicates_are_skipped_on_insert() {
        let mut cut = RangeTree::with_range_limit(8);
        cut.bulk_insert(items(&[(27, 4), (99, 3), (152, 8), (199, 3)]));
        // (199, 3) already exists; the two fresh pairs extend the range
        cut.bulk_insert(items(&[(13, 4), (199, 3), (142, 8)]));
        assert_eq!(range_summary(&cut, true), "13:6;");
    }

    #[test]
    fn sort_iterator_emits_values_in_key_order() {
        let mut rt = RangeTree::with_range_limit(8);
        rt.bulk_insert(items(&SORT_SET));
        let values: Vec<u64> = SortIterator::new(&rt, true).collect();
        assert_eq!(values, vec![2, 4, 3, 9, 8, 5, 7]);
    }

    #[test]
    fn sort_iterator_descends_across_split_ranges() {
        let mut rt = RangeTree::with_range_limit(4);
        rt.bulk_insert(items(&WIDE_SET));
        let values: Vec<u64> = SortIterator::new(&rt, false).collect();
        assert_eq!(values, vec![12, 10, 7, 5, 8, 11, 9, 6, 3, 4, 2]);
    }

    #[test]
    fn sort_iterator_joins_with_a_full_text_iterator() {
        let mut rt = RangeTree::with_range_limit(8);
        rt.bulk_insert(items(&SORT_SET));

        // values carrying the probed tag, as a full-text index would emit them
        let ft_query = VecFtIterator::new(vec![4, 3, 8]);
        let values: Vec<u64> = SortIterator::joined(&rt, ft_query, true).collect();
        assert_eq!(values, vec![4, 3, 8]);
    }

    #[test]
    fn lower_bound_finds_the_covering_range() {
        let mut rt = RangeTree::with_range_limit(4);
        rt.bulk_insert(items(&WIDE_SET));

        let mut out = String::new();
        for key in [100, 150, 198, 199, 200, 300, 10000] {
            let it = rt.lower_bound(key, true);
            assert!(!it.is_end());
            out.push_str(&format!("{},", it.bounds().unwrap().0));
        }
        assert_eq!(out, "13,142,142,142,199,199,199,");
    }

    #[test]
    fn every_value_is_reachable_through_range_iterators() {
        let mut rt = RangeTree::with_range_limit(4);
        rt.bulk_insert(items(&WIDE_SET));

        let mut values = HashSet::new();
        let mut it_range = rt.begin_range(true);
        while !it_range.is_end() {
            let it = it_range.make_iterator().unwrap();
            for value in it {
                values.insert(value);
            }
            it_range.next();
        }
        let expected: HashSet<u64> = [12, 10, 7, 5, 8, 11, 9, 6, 3, 4, 2].into_iter().collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn inclusive_range_filter_selects_the_key_window() {
        let mut rt = RangeTree::with_range_limit(4);
        rt.bulk_insert(items(&WIDE_SET));

        let values: HashSet<u64> = RangeIterator::new(&rt, 100, true, 199, true).collect();
        let expected: HashSet<u64> = [7, 5, 8, 9, 11, 6].into_iter().collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn exclusive_endpoints_trim_the_window() {
        let mut rt = RangeTree::with_range_limit(4);
        rt.bulk_insert(items(&WIDE_SET));

        let values: HashSet<u64> = RangeIterator::new(&rt, 123, false, 199, false).collect();
        let expected: HashSet<u64> = [9, 11, 8].into_iter().collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn ft_compliant_range_filter_matches_the_plain_one() {
        let mut rt = RangeTree::with_range_limit(4);
        rt.bulk_insert(items(&WIDE_SET));

        let values: HashSet<u64> = FtRangeIterator::new(&rt, 100, true, 199, true).collect();
        let expected: HashSet<u64> = [7, 5, 8, 9, 11, 6].into_iter().collect();
        assert_eq!(values, expected);

        // and it emits in ascending value order, as the trait requires
        let ordered: Vec<u64> = FtRangeIterator::new(&rt, 100, true, 199, true).collect();
        assert_eq!(ordered, vec![5, 6, 7, 8, 9, 11]);
    }

    #[test]
    fn range_filter_over_unsplit_ranges() {
        let mut rt = RangeTree::with_range_limit(128);
        rt.bulk_insert(items(&[(666, 0), (22, 1), (99, 2), (888, 3), (444, 4)]));

        let values: HashSet<u64> = RangeIterator::new(&rt, 22, true, 444, true).collect();
        let expected: HashSet<u64> = [1, 2, 4].into_iter().collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn inclusive_lower_bound_on_the_lowest_key() {
        let mut rt = RangeTree::with_range_limit(128);
        rt.bulk_insert(items(&[(666, 0), (22, 1), (99, 2), (888, 3), (444, 4)]));
        assert!(!rt.lower_bound(22, true).is_end());
    }

    #[test]
    fn null_keyed_values_live_outside_the_ranges() {
        let mut rt: RangeTree<i32, u64> = RangeTree::with_range_limit(128);
        rt.bulk_insert_null([0u64, 1, 2, 3, 4]);
        assert_eq!(rt.size(), 5);
        assert!(!rt.has_any_non_null());
        assert_eq!(rt.range_count(), 0);
    }

    #[test]
    fn unbounded_iteration_visits_null_values_first() {
        let mut rt: RangeTree<i32, u64> = RangeTree::with_range_limit(128);
        rt.bulk_insert_null([0u64, 1, 2, 3, 4]);

        {
            let factory = RangeIteratorFactory::new(&rt);
            let values: HashSet<u64> = factory.create_base_iterator().collect();
            let expected: HashSet<u64> = [0, 1, 2, 3, 4].into_iter().collect();
            assert_eq!(values, expected);
        }

        // mixed tree: nulls come first, then keyed values in key order
        rt.bulk_insert(items(&[(7, 100), (3, 200)]));
        let factory = RangeIteratorFactory::new(&rt);
        let ordered: Vec<u64> = factory.create_base_iterator().collect();
        assert_eq!(ordered, vec![0, 1, 2, 3, 4, 200, 100]);
    }
}

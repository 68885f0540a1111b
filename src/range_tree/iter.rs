//! Iterators over a [`RangeTree`](super::RangeTree).

use std::collections::BTreeSet;

use super::{Item, RangeTree};

/// Full-text-style iterator: values in ascending value order. This is the
/// joint interface between the range tree and external tag indices.
pub trait FtIterator<V> {
    fn next_value(&mut self) -> Option<V>;
}

/// [`FtIterator`] over an owned set of values.
pub struct VecFtIterator<V> {
    values: Vec<V>,
    pos: usize,
}

impl<V: Ord> VecFtIterator<V> {
    pub fn new(mut values: Vec<V>) -> Self {
        values.sort_unstable();
        values.dedup();
        Self { values, pos: 0 }
    }
}

impl<V: Ord + Copy> FtIterator<V> for VecFtIterator<V> {
    fn next_value(&mut self) -> Option<V> {
        let value = self.values.get(self.pos).copied()?;
        self.pos += 1;
        Some(value)
    }
}

/// Cursor over the tree's ranges in key order.
pub struct RangeCursor<'a, K, V> {
    tree: &'a RangeTree<K, V>,
    pos: Option<usize>,
    ascending: bool,
}

impl<'a, K: Ord + Copy, V: Ord + Copy> RangeCursor<'a, K, V> {
    pub(crate) fn at(tree: &'a RangeTree<K, V>, pos: usize, ascending: bool) -> Self {
        Self {
            tree,
            pos: Some(pos),
            ascending,
        }
    }

    pub(crate) fn finished(tree: &'a RangeTree<K, V>) -> Self {
        Self {
            tree,
            pos: None,
            ascending: true,
        }
    }

    pub fn is_end(&self) -> bool {
        self.pos.is_none()
    }

    /// Advance to the next range in the cursor's direction.
    pub fn next(&mut self) {
        let Some(pos) = self.pos else {
            return;
        };
        self.pos = if self.ascending {
            (pos + 1 < self.tree.range_count()).then(|| pos + 1)
        } else {
            pos.checked_sub(1)
        };
    }

    /// Key interval `[lo, hi]` of the current range.
    pub fn bounds(&self) -> Option<(K, K)> {
        let range = self.tree.range(self.pos?);
        Some((range.lo(), range.hi()))
    }

    /// Item count of the current range.
    pub fn len(&self) -> usize {
        self.pos.map_or(0, |p| self.tree.range(p).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value iterator over the current range, ascending by value.
    pub fn make_iterator(&self) -> Option<RangeValues<V>> {
        let range = self.tree.range(self.pos?);
        Some(RangeValues::new(range.values().collect()))
    }
}

/// Values of one range in ascending value order.
pub struct RangeValues<V> {
    values: Vec<V>,
    pos: usize,
}

impl<V: Ord> RangeValues<V> {
    fn new(mut values: Vec<V>) -> Self {
        values.sort_unstable();
        Self { values, pos: 0 }
    }
}

impl<V: Copy> Iterator for RangeValues<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let value = self.values.get(self.pos).copied()?;
        self.pos += 1;
        Some(value)
    }
}

impl<V: Ord + Copy> FtIterator<V> for RangeValues<V> {
    fn next_value(&mut self) -> Option<V> {
        self.next()
    }
}

/// Values in global key order (equal keys in arrival order), optionally
/// joined with an external [`FtIterator`]: the join emits only values present
/// on both sides. Null-keyed values are not visited.
pub struct SortIterator<'a, K, V> {
    tree: &'a RangeTree<K, V>,
    ascending: bool,
    filter: Option<BTreeSet<V>>,
    pos: Option<usize>,
    buf: Vec<Item<K, V>>,
    buf_pos: usize,
}

impl<'a, K: Ord + Copy, V: Ord + Copy> SortIterator<'a, K, V> {
    pub fn new(tree: &'a RangeTree<K, V>, ascending: bool) -> Self {
        Self::build(tree, ascending, None)
    }

    /// Join with an external value iterator.
    pub fn joined<F: FtIterator<V>>(tree: &'a RangeTree<K, V>, mut ft: F, ascending: bool) -> Self {
        let mut filter = BTreeSet::new();
        while let Some(value) = ft.next_value() {
            filter.insert(value);
        }
        Self::build(tree, ascending, Some(filter))
    }

    fn build(tree: &'a RangeTree<K, V>, ascending: bool, filter: Option<BTreeSet<V>>) -> Self {
        let pos = if tree.range_count() == 0 {
            None
        } else if ascending {
            Some(0)
        } else {
            Some(tree.range_count() - 1)
        };
        let mut iter = Self {
            tree,
            ascending,
            filter,
            pos,
            buf: Vec::new(),
            buf_pos: 0,
        };
        iter.load();
        iter
    }

    fn load(&mut self) {
        self.buf.clear();
        self.buf_pos = 0;
        if let Some(pos) = self.pos {
            self.buf = self.tree.range(pos).key_sorted();
            if !self.ascending {
                self.buf.reverse();
            }
        }
    }

    fn advance_range(&mut self) {
        self.pos = match self.pos {
            Some(pos) if self.ascending => {
                (pos + 1 < self.tree.range_count()).then(|| pos + 1)
            }
            Some(pos) => pos.checked_sub(1),
            None => None,
        };
        self.load();
    }
}

impl<K: Ord + Copy, V: Ord + Copy> Iterator for SortIterator<'_, K, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        loop {
            self.pos?;
            if self.buf_pos >= self.buf.len() {
                self.advance_range();
                continue;
            }
            let value = self.buf[self.buf_pos].value;
            self.buf_pos += 1;
            if self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.contains(&value))
            {
                return Some(value);
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Bounds<K> {
    lo: K,
    lo_inclusive: bool,
    hi: K,
    hi_inclusive: bool,
}

impl<K: Ord + Copy> Bounds<K> {
    fn admits(&self, key: K) -> bool {
        let above = if self.lo_inclusive {
            key >= self.lo
        } else {
            key > self.lo
        };
        let below = if self.hi_inclusive {
            key <= self.hi
        } else {
            key < self.hi
        };
        above && below
    }
}

/// Values whose key falls inside `[lo, hi]` with per-endpoint inclusivity,
/// in key order. The unbounded variant visits null-keyed values first.
pub struct RangeIterator<'a, K, V> {
    tree: &'a RangeTree<K, V>,
    bounds: Option<Bounds<K>>,
    null_pos: Option<usize>,
    pos: Option<usize>,
    buf: Vec<V>,
    buf_pos: usize,
}

impl<'a, K: Ord + Copy, V: Ord + Copy> RangeIterator<'a, K, V> {
    pub fn new(tree: &'a RangeTree<K, V>, lo: K, lo_inclusive: bool, hi: K, hi_inclusive: bool) -> Self {
        let bounds = Bounds {
            lo,
            lo_inclusive,
            hi,
            hi_inclusive,
        };
        // first range whose interval reaches the lower bound
        let pos = (0..tree.range_count()).find(|&i| tree.range(i).hi() >= lo);
        let mut iter = Self {
            tree,
            bounds: Some(bounds),
            null_pos: None,
            pos,
            buf: Vec::new(),
            buf_pos: 0,
        };
        iter.load();
        iter
    }

    /// Every value in key order, null-keyed values first.
    pub fn unbounded(tree: &'a RangeTree<K, V>) -> Self {
        let pos = (tree.range_count() > 0).then_some(0);
        let mut iter = Self {
            tree,
            bounds: None,
            null_pos: Some(0),
            pos,
            buf: Vec::new(),
            buf_pos: 0,
        };
        iter.load();
        iter
    }

    fn load(&mut self) {
        self.buf.clear();
        self.buf_pos = 0;
        let Some(pos) = self.pos else {
            return;
        };
        let range = self.tree.range(pos);
        match &self.bounds {
            Some(bounds) => {
                if range.lo() > bounds.hi {
                    // past the window: no further range can match
                    self.pos = None;
                    return;
                }
                self.buf = range
                    .key_sorted()
                    .into_iter()
                    .filter(|item| bounds.admits(item.key))
                    .map(|item| item.value)
                    .collect();
            }
            None => {
                self.buf = range.key_sorted().into_iter().map(|item| item.value).collect();
            }
        }
    }

    fn advance_range(&mut self) {
        self.pos = self
            .pos
            .and_then(|pos| (pos + 1 < self.tree.range_count()).then(|| pos + 1));
        self.load();
    }
}

impl<K: Ord + Copy, V: Ord + Copy> Iterator for RangeIterator<'_, K, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if let Some(null_pos) = self.null_pos {
            if let Some(&value) = self.tree.null_values().get(null_pos) {
                self.null_pos = Some(null_pos + 1);
                return Some(value);
            }
            self.null_pos = None;
        }
        loop {
            self.pos?;
            if self.buf_pos < self.buf.len() {
                let value = self.buf[self.buf_pos];
                self.buf_pos += 1;
                return Some(value);
            }
            self.advance_range();
        }
    }
}

/// The bounded-range filter as an [`FtIterator`]: same value set as
/// [`RangeIterator`], emitted in ascending value order.
pub struct FtRangeIterator<V> {
    values: Vec<V>,
    pos: usize,
}

impl<V: Ord + Copy> FtRangeIterator<V> {
    pub fn new<K: Ord + Copy>(
        tree: &RangeTree<K, V>,
        lo: K,
        lo_inclusive: bool,
        hi: K,
        hi_inclusive: bool,
    ) -> Self {
        let mut values: Vec<V> = RangeIterator::new(tree, lo, lo_inclusive, hi, hi_inclusive).collect();
        values.sort_unstable();
        Self { values, pos: 0 }
    }

    /// Every stored value, nulls included, in ascending value order.
    pub fn unbounded<K: Ord + Copy>(tree: &RangeTree<K, V>) -> Self {
        let mut values: Vec<V> = RangeIterator::unbounded(tree).collect();
        values.sort_unstable();
        Self { values, pos: 0 }
    }
}

impl<V: Copy> Iterator for FtRangeIterator<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let value = self.values.get(self.pos).copied()?;
        self.pos += 1;
        Some(value)
    }
}

impl<V: Ord + Copy> FtIterator<V> for FtRangeIterator<V> {
    fn next_value(&mut self) -> Option<V> {
        self.next()
    }
}

/// Factory mirroring the iterator surface consumed by query planners.
pub struct RangeIteratorFactory<'a, K, V> {
    tree: &'a RangeTree<K, V>,
}

impl<'a, K: Ord + Copy, V: Ord + Copy> RangeIteratorFactory<'a, K, V> {
    pub fn new(tree: &'a RangeTree<K, V>) -> Self {
        Self { tree }
    }

    /// Unfiltered iterator over every value, null-keyed ones first.
    pub fn create_base_iterator(&self) -> RangeIterator<'a, K, V> {
        RangeIterator::unbounded(self.tree)
    }

    /// Bounded filter over the key window.
    pub fn create_range_iterator(
        &self,
        lo: K,
        lo_inclusive: bool,
        hi: K,
        hi_inclusive: bool,
    ) -> RangeIterator<'a, K, V> {
        RangeIterator::new(self.tree, lo, lo_inclusive, hi, hi_inclusive)
    }

    /// Ascending sort-merge iterator.
    pub fn create_sort_iterator(&self, ascending: bool) -> SortIterator<'a, K, V> {
        SortIterator::new(self.tree, ascending)
    }
}

//! Commutative slab allocator over a 32-bit address space.
//!
//! Bookkeeping lives in three ordered indices: `allocs` (allocation records
//! by address), `blanks` (free gaps by size, then address) and `stripes`
//! (partially filled allocations by stride, then address). Same-size
//! allocation streams are served from stripes and a tiny hot cache; fresh
//! stripes are carved from the smallest sufficient blank with a unit count
//! taken from [`SIZE_MAP`], and freed space coalesces with its neighbor
//! blanks immediately.

use std::cmp::Ordering;

use log::trace;

use crate::error::{Error, Result};
use crate::sgb::{Compare, NaturalOrder, SgbTree};

mod fill_map;

pub use fill_map::{FillMap, SIZE_MAP};

/// Slots in the per-stride hot cache.
pub const L0_CACHE_SIZE: usize = 4;

/// A contiguous managed region: base address, unit stride and occupancy.
#[derive(Clone, Copy, Debug)]
pub struct Alloc {
    address: u32,
    stride: u32,
    fill: FillMap,
}

impl Alloc {
    fn new(address: u32, stride: u32, unit_count: u32) -> Result<Self> {
        debug_assert!(stride > 0);
        Ok(Self {
            address,
            stride,
            fill: FillMap::new(unit_count)?,
        })
    }

    /// Lookup probe carrying only the address.
    fn probe(address: u32) -> Self {
        Self {
            address,
            stride: 0,
            fill: FillMap::default(),
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Reserved size in bytes.
    pub fn size(&self) -> u32 {
        self.stride * self.fill.size()
    }

    /// Reserved number of units.
    pub fn unit_count(&self) -> u32 {
        self.fill.size()
    }

    pub fn is_full(&self) -> bool {
        self.fill.all()
    }

    /// Address one past the reserved region.
    pub fn end_addr(&self) -> u32 {
        self.address + self.size()
    }

    /// Bytes up to and including the highest allocated unit.
    pub fn span(&self) -> u32 {
        self.fill.span() * self.stride
    }

    fn alloc_unit(&mut self) -> Result<u32> {
        Ok(self.address + self.stride * self.fill.alloc_unit()?)
    }

    /// Bounded unit allocation; reverts on a bound miss.
    fn try_alloc_unit(&mut self, addr_bound: Option<u32>) -> Option<u32> {
        let revert = self.fill;
        let Ok(index) = self.fill.alloc_unit() else {
            return None;
        };
        let result = self.address as u64 + self.stride as u64 * index as u64;
        if let Some(bound) = addr_bound {
            if result + self.stride as u64 > bound as u64 {
                self.fill = revert;
                return None;
            }
        }
        Some(result as u32)
    }

    fn try_alloc_unit_hinted(&mut self, addr_bound: Option<u32>, hint: &mut u32) -> Option<u32> {
        let revert = self.fill;
        let end = self.fill.size();
        if *hint > end {
            *hint = 0;
        }
        let Ok(index) = self.fill.alloc_unit_hinted(end, hint) else {
            return None;
        };
        let result = self.address as u64 + self.stride as u64 * index as u64;
        if let Some(bound) = addr_bound {
            if result + self.stride as u64 > bound as u64 {
                self.fill = revert;
                return None;
            }
        }
        Some(result as u32)
    }

    /// Free one unit; `Ok(false)` when the allocation became empty.
    fn dealloc_unit(&mut self, address: u32) -> Result<bool> {
        let index = self.unit_index(address)?;
        if !self.fill.get(index) {
            return Err(Error::InvalidAddress {
                address: address as u64,
            });
        }
        self.fill.reset(index);
        Ok(!self.fill.is_empty())
    }

    /// Validate the address and return the allocation stride.
    fn get_alloc_size(&self, address: u32) -> Result<u32> {
        let index = self.unit_index(address)?;
        if !self.fill.get(index) {
            return Err(Error::InvalidAddress {
                address: address as u64,
            });
        }
        Ok(self.stride)
    }

    fn unit_index(&self, address: u32) -> Result<u32> {
        if address >= self.address {
            let offset = address - self.address;
            if offset % self.stride == 0 && offset / self.stride < self.fill.size() {
                return Ok(offset / self.stride);
            }
        }
        Err(Error::InvalidAddress {
            address: address as u64,
        })
    }

    fn to_stripe(self) -> Stripe {
        Stripe {
            stride: self.stride,
            address: self.address,
        }
    }

    /// Downsize to reclaim at least `min_size` bytes; an empty blank means
    /// nothing could be reclaimed.
    fn reclaim_space(&mut self, min_size: u32) -> Blank {
        let old_size = self.size();
        let unit_count = (min_size - 1) / self.stride + 1;
        let resized = self.fill.try_downsize(unit_count);
        Blank {
            size: resized * self.stride,
            address: self.address + old_size - resized * self.stride,
        }
    }
}

/// Orders allocation records by their base address.
#[derive(Default, Clone, Copy, Debug)]
pub struct AllocByAddr;

impl Compare<Alloc> for AllocByAddr {
    #[inline]
    fn cmp(&self, a: &Alloc, b: &Alloc) -> Ordering {
        a.address.cmp(&b.address)
    }
}

/// A contiguous free gap, ordered by size then address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Blank {
    pub size: u32,
    pub address: u32,
}

/// A non-full allocation, ordered by stride then address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stripe {
    pub stride: u32,
    pub address: u32,
}

pub type AllocSet = SgbTree<Alloc, AllocByAddr>;
pub type BlankSet = SgbTree<Blank, NaturalOrder>;
pub type StripeSet = SgbTree<Stripe, NaturalOrder>;

#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    address: u32,
    stride: u32,
    hint: u32,
}

/// Commutative address-space allocator.
pub struct CrdtAllocator {
    allocs: AllocSet,
    blanks: BlankSet,
    stripes: StripeSet,
    /// Size of the managed address space.
    size: u32,
    bounds_fn: Option<Box<dyn Fn() -> u32 + Send>>,
    /// Highest reserved address.
    max_addr: u32,
    /// Cumulative allocated-minus-freed bytes since construction.
    alloc_delta: i64,
    /// Hot cache of recently used partial allocations.
    cache: [Option<CacheEntry>; L0_CACHE_SIZE],
}

impl CrdtAllocator {
    /// Fresh allocator managing `[0, size)`.
    pub fn new(size: u32) -> Self {
        let mut blanks = BlankSet::new();
        blanks.insert(Blank { size, address: 0 });
        Self::from_parts(AllocSet::default(), blanks, StripeSet::new(), size)
    }

    /// Reassemble from initialized indices.
    pub fn from_parts(allocs: AllocSet, blanks: BlankSet, stripes: StripeSet, size: u32) -> Self {
        let max_addr = allocs
            .find_max()
            .map_or(0, |cursor| allocs.get(cursor).end_addr());
        Self {
            allocs,
            blanks,
            stripes,
            size,
            bounds_fn: None,
            max_addr,
            alloc_delta: 0,
            cache: [None; L0_CACHE_SIZE],
        }
    }

    /// Address of the very first allocation in a fresh space.
    pub fn first_address() -> u64 {
        0
    }

    pub fn allocs(&self) -> &AllocSet {
        &self.allocs
    }

    pub fn blanks(&self) -> &BlankSet {
        &self.blanks
    }

    pub fn stripes(&self) -> &StripeSet {
        &self.stripes
    }

    pub fn max_addr(&self) -> u32 {
        self.max_addr
    }

    /// Cumulative size of allocations minus deallocations; may be negative.
    pub fn alloc_delta(&self) -> i64 {
        self.alloc_delta
    }

    /// Install a dynamic upper bound. The function is consulted on every
    /// allocation path; nothing is validated at installation time.
    pub fn set_dynamic_bound(&mut self, bounds_fn: impl Fn() -> u32 + Send + 'static) {
        self.bounds_fn = Some(Box::new(bounds_fn));
    }

    fn current_bound(&self) -> Option<u32> {
        self.bounds_fn.as_ref().map(|f| f())
    }

    /// Drop cached allocation state at a commit boundary.
    pub fn commit(&mut self) {
        self.cache = [None; L0_CACHE_SIZE];
    }

    fn cache_clear(&mut self) {
        self.cache = [None; L0_CACHE_SIZE];
    }

    fn cache_add(&mut self, mut entry: CacheEntry) {
        for slot in self.cache.iter_mut() {
            match slot {
                None => {
                    *slot = Some(entry);
                    return;
                }
                Some(existing) => std::mem::swap(existing, &mut entry),
            }
        }
        // the oldest entry was shifted out
    }

    /// Serve an exact-stride request from the hot cache. A miss returns
    /// `None`; so does a cached allocation blocked by the dynamic bound, in
    /// which case the entry is evicted.
    fn cache_try_alloc(&mut self, size: u32, bound: Option<u32>) -> Option<u32> {
        let (slot, entry) = self
            .cache
            .iter()
            .enumerate()
            .find_map(|(i, e)| e.filter(|e| e.stride == size).map(|e| (i, e)))?;
        let Some(cursor) = self.allocs.find_equal(&Alloc::probe(entry.address)) else {
            self.cache[slot] = None;
            return None;
        };
        let mut hint = entry.hint;
        let mut result = None;
        self.allocs
            .modify_at(cursor, |a| result = a.try_alloc_unit_hinted(bound, &mut hint));
        if result.is_none() || self.allocs.get(cursor).is_full() {
            self.cache[slot] = None;
        } else {
            self.cache[slot] = Some(CacheEntry { hint, ..entry });
        }
        result
    }

    /// Allocate `size` bytes, or fail with [`Error::OutOfMemory`].
    pub fn alloc(&mut self, size: usize) -> Result<u64> {
        self.try_alloc(size)?
            .ok_or(Error::OutOfMemory { size })
    }

    /// Allocate `size` bytes; `Ok(None)` when the space (or the dynamic
    /// bound) is exhausted.
    pub fn try_alloc(&mut self, size: usize) -> Result<Option<u64>> {
        if size == 0 {
            return Err(Error::Invalid("zero-size allocation"));
        }
        let Ok(size32) = u32::try_from(size) else {
            return Ok(None);
        };

        let mut last_stripe_units = 0u32;
        if let Some(address) = self.try_alloc_from_stripes(size32, &mut last_stripe_units)? {
            self.alloc_delta += size as i64;
            return Ok(Some(address as u64));
        }

        // fresh stripes start small and double down the size map as streams
        // of equal-size requests keep arriving
        let mut start_index = SIZE_MAP.len() - 1;
        while start_index > 0 && last_stripe_units >= SIZE_MAP[start_index] {
            start_index -= 1;
        }

        loop {
            if !self.blanks.is_empty() {
                let mut max_blank_size: Option<u32> = None;
                for index in start_index..SIZE_MAP.len() {
                    let needed = size32 as u64 * SIZE_MAP[index] as u64;
                    if let Some(max) = max_blank_size {
                        if (max as u64) < needed {
                            continue;
                        }
                    }
                    if let Some(address) = self.try_alloc_from_blanks(size32, SIZE_MAP[index])? {
                        self.alloc_delta += size as i64;
                        return Ok(Some(address as u64));
                    }
                    if max_blank_size.is_none() {
                        let cursor = self
                            .blanks
                            .find_max()
                            .ok_or(Error::Internal("blank index empty during scan"))?;
                        max_blank_size = Some(self.blanks.get(cursor).size);
                    }
                }
            }
            if !self.try_reclaim_space_from_stripes(size32)? {
                break;
            }
        }
        Ok(None)
    }

    /// Serve from an existing stripe of exactly the requested stride.
    /// `last_stripe_units` reports the unit count of a stripe that turned
    /// out full, steering the size of the next fresh stripe.
    fn try_alloc_from_stripes(
        &mut self,
        size: u32,
        last_stripe_units: &mut u32,
    ) -> Result<Option<u32>> {
        let bound = self.current_bound();
        if let Some(address) = self.cache_try_alloc(size, bound) {
            return Ok(Some(address));
        }

        let mut probe = Stripe {
            stride: size,
            address: 0,
        };
        loop {
            let Some(cursor) = self.stripes.upper_equal_bound(&probe) else {
                return Ok(None);
            };
            let stripe = *self.stripes.get(cursor);
            if stripe.stride != size {
                // no more stripes of this stride
                return Ok(None);
            }
            let alloc_cursor = self
                .allocs
                .find_equal(&Alloc::probe(stripe.address))
                .ok_or(Error::Internal("stripe without a matching allocation"))?;
            if self.allocs.get(alloc_cursor).is_full() {
                // lazily removed; its unit count seeds the next stripe size
                *last_stripe_units = self.allocs.get(alloc_cursor).unit_count();
                self.stripes.erase_at(cursor);
                return Ok(None);
            }

            let mut result = None;
            self.allocs
                .modify_at(alloc_cursor, |a| result = a.try_alloc_unit(bound));
            if let Some(address) = result {
                let alloc = *self.allocs.get(alloc_cursor);
                if !alloc.is_full() {
                    self.cache_add(CacheEntry {
                        address: alloc.address(),
                        stride: alloc.stride(),
                        hint: 0,
                    });
                }
                return Ok(Some(address));
            }

            // blocked by the dynamic bound; try the next same-stride stripe
            if stripe.address == u32::MAX {
                return Ok(None);
            }
            probe = Stripe {
                stride: size,
                address: stripe.address + 1,
            };
        }
    }

    /// Carve a fresh stripe of `count` units out of the smallest sufficient
    /// blank and take its first unit.
    fn try_alloc_from_blanks(&mut self, stride: u32, count: u32) -> Result<Option<u32>> {
        let min_size64 = stride as u64 * count as u64;
        let Ok(min_size) = u32::try_from(min_size64) else {
            return Ok(None);
        };
        let Some(first) = self.blanks.upper_equal_bound(&Blank {
            size: min_size,
            address: 0,
        }) else {
            return Ok(None);
        };

        let bound = self.current_bound();
        let in_bounds = |blank: &Blank| {
            bound.map_or(true, |b| blank.address as u64 + min_size64 <= b as u64)
        };

        let first_blank = *self.blanks.get(first);
        let blank = if in_bounds(&first_blank) {
            first_blank
        } else {
            // other registered blanks may still fall within the bound
            let mut chosen = None;
            for (_, candidate) in self.blanks.iter_from(first).skip(1) {
                if candidate.size >= min_size && in_bounds(&candidate) {
                    chosen = Some(candidate);
                    break;
                }
            }
            match chosen {
                Some(blank) => blank,
                None => return Ok(None),
            }
        };

        if !self.blanks.erase_equal(&blank) {
            return Err(Error::Internal("blank disappeared during allocation"));
        }
        self.cache_clear();

        let mut alloc = Alloc::new(blank.address, stride, count)?;
        let address = alloc.alloc_unit()?;
        self.max_addr = self.max_addr.max(alloc.end_addr());
        self.allocs.insert(alloc);
        if count > 1 {
            self.cache_add(CacheEntry {
                address: alloc.address(),
                stride,
                hint: 1,
            });
        }
        // registered even when the single unit filled it; removed lazily
        self.stripes.insert(alloc.to_stripe());

        if blank.size > min_size {
            // the remainder stays registered even if it currently falls
            // outside the dynamic bound, which may widen again later
            self.blanks.insert(Blank {
                size: blank.size - min_size,
                address: blank.address + min_size,
            });
        }
        trace!("new stripe: stride {stride}, units {count}, at {}", blank.address);
        Ok(Some(address))
    }

    /// Shrink partially-unused allocations, largest strides first, until at
    /// least `min_size` contiguous bytes come back.
    fn try_reclaim_space_from_stripes(&mut self, min_size: u32) -> Result<bool> {
        let mut cursor_stripe: Option<Stripe> = None;
        loop {
            let Some(stripe) = self.stripe_prev(cursor_stripe) else {
                return Ok(false);
            };
            cursor_stripe = Some(stripe);
            // pruning rule: smaller strides cannot reclaim enough
            if (stripe.stride as u64) * (SIZE_MAP[0] as u64 - 1) < min_size as u64 {
                return Ok(false);
            }

            let window = self
                .allocs
                .lower_equal_window(&Alloc::probe(stripe.address))
                .ok_or(Error::Internal("stripe without a matching allocation"))?;
            let center = window[1].ok_or(Error::Internal("empty allocation window"))?;
            let alloc_before = *self.allocs.get(center);
            if alloc_before.address() != stripe.address {
                return Err(Error::Internal("stripe without a matching allocation"));
            }
            let right = window[2].map(|c| *self.allocs.get(c));
            let old_size = alloc_before.size();

            let mut blank = Blank {
                size: 0,
                address: 0,
            };
            self.allocs
                .modify_at(center, |a| blank = a.reclaim_space(min_size));
            if blank.size == 0 {
                continue;
            }

            // the reclaimed tail may lower the highest reserved address
            self.max_addr = self
                .allocs
                .find_max()
                .map_or(0, |c| self.allocs.get(c).end_addr());

            // merge with the free gap to the right, if any
            let right_blank = match right {
                Some(r) => {
                    let gap = r.address() - alloc_before.address() - old_size;
                    (gap > 0).then(|| Blank {
                        size: gap,
                        address: r.address() - gap,
                    })
                }
                None => {
                    let end = alloc_before.address() + old_size;
                    (end < self.size).then(|| Blank {
                        size: self.size - end,
                        address: end,
                    })
                }
            };
            if let Some(b) = right_blank {
                if !self.blanks.erase_equal(&b) {
                    return Err(Error::Internal("neighboring blank not found"));
                }
                blank.size += b.size;
            }
            self.blanks.insert(blank);

            if self.allocs.get(center).is_full() {
                self.stripes.erase_equal(&stripe);
            }
            self.cache_clear();
            trace!("reclaimed {} bytes at {}", blank.size, blank.address);
            return Ok(true);
        }
    }

    /// Strict predecessor scan over stripes in descending (stride, address)
    /// order.
    fn stripe_prev(&self, before: Option<Stripe>) -> Option<Stripe> {
        let cursor = match before {
            None => self.stripes.find_max()?,
            Some(s) => {
                let probe = if s.address > 0 {
                    Stripe {
                        stride: s.stride,
                        address: s.address - 1,
                    }
                } else if s.stride > 0 {
                    Stripe {
                        stride: s.stride - 1,
                        address: u32::MAX,
                    }
                } else {
                    return None;
                };
                self.stripes.lower_equal_bound(&probe)?
            }
        };
        Some(*self.stripes.get(cursor))
    }

    /// Release one allocated unit. Freed allocations coalesce with their
    /// neighbor blanks into a single gap.
    pub fn free(&mut self, address: u64) -> Result<()> {
        let address32 = u32::try_from(address).map_err(|_| Error::InvalidAddress { address })?;
        let window = self
            .allocs
            .lower_equal_window(&Alloc::probe(address32))
            .ok_or(Error::InvalidAddress { address })?;
        let center = window[1].ok_or(Error::InvalidAddress { address })?;
        let alloc = *self.allocs.get(center);
        let left = window[0].map(|c| *self.allocs.get(c));
        let right = window[2].map(|c| *self.allocs.get(c));

        self.alloc_delta -= alloc.stride() as i64;
        let was_full = alloc.is_full();
        let mut dealloc_result: Result<bool> = Ok(true);
        self.allocs
            .modify_at(center, |a| dealloc_result = a.dealloc_unit(address32));
        if dealloc_result? {
            if was_full {
                // it can serve units again
                let stripe = alloc.to_stripe();
                if self.stripes.find_equal(&stripe).is_none() {
                    self.stripes.insert(stripe);
                }
            }
            return Ok(());
        }

        // the allocation is empty: drop it and coalesce the freed region
        if let Some(cursor) = self.stripes.find_equal(&alloc.to_stripe()) {
            self.stripes.erase_at(cursor);
        }

        let left_blank = match left {
            Some(l) => {
                let gap = alloc.address() - l.address() - l.size();
                (gap > 0).then(|| Blank {
                    size: gap,
                    address: l.address() + l.size(),
                })
            }
            None => (alloc.address() > 0).then(|| Blank {
                size: alloc.address(),
                address: 0,
            }),
        };
        let right_blank = match right {
            Some(r) => {
                let gap = r.address() - alloc.address() - alloc.size();
                (gap > 0).then(|| Blank {
                    size: gap,
                    address: r.address() - gap,
                })
            }
            None => {
                let end = alloc.address() + alloc.size();
                (end < self.size).then(|| Blank {
                    size: self.size - end,
                    address: end,
                })
            }
        };

        for blank in [&left_blank, &right_blank].into_iter().flatten() {
            if !self.blanks.erase_equal(blank) {
                return Err(Error::Internal("neighboring blank not found"));
            }
        }

        self.cache_clear();
        if !self.allocs.erase_equal(&alloc) {
            return Err(Error::Internal("allocation record not found"));
        }
        self.max_addr = self
            .allocs
            .find_max()
            .map_or(0, |c| self.allocs.get(c).end_addr());

        let merged_lo = left_blank.unwrap_or(Blank {
            size: alloc.size(),
            address: alloc.address(),
        });
        let merged_hi = right_blank.unwrap_or(Blank {
            size: alloc.size(),
            address: alloc.address(),
        });
        self.blanks.insert(Blank {
            size: merged_hi.address + merged_hi.size - merged_lo.address,
            address: merged_lo.address,
        });
        Ok(())
    }

    /// Allocation stride covering `address`.
    pub fn get_alloc_size(&self, address: u64) -> Result<usize> {
        let address32 = u32::try_from(address).map_err(|_| Error::InvalidAddress { address })?;
        let cursor = self
            .allocs
            .lower_equal_bound(&Alloc::probe(address32))
            .ok_or(Error::InvalidAddress { address })?;
        self.allocs
            .get(cursor)
            .get_alloc_size(address32)
            .map(|s| s as usize)
    }
}

impl std::fmt::Debug for CrdtAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtAllocator")
            .field("size", &self.size)
            .field("allocs", &self.allocs.len())
            .field("blanks", &self.blanks.len())
            .field("stripes", &self.stripes.len())
            .field("max_addr", &self.max_addr)
            .field("alloc_delta", &self.alloc_delta)
            .finish()
    }
}

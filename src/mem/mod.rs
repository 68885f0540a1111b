//! Memory space abstraction: copy-on-write mapped ranges over a page store.
//!
//! A [`Memspace`] owns one page store realm together with its address-space
//! allocator. Mapped ranges are materialized into private buffers
//! ([`MemLock`]); writes stay invisible to concurrent readers until
//! [`Memspace::commit`] flushes every released dirty buffer as the next
//! state.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};
use std::path::Path;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::debug;

use crate::addr;
use crate::alloc::CrdtAllocator;
use crate::diff::DiffRange;
use crate::error::{Error, Result};
use crate::store::PageStore;

pub(crate) mod lock;
pub(crate) mod rowo;

pub use lock::MemLock;
pub use rowo::{
    RowoCell, RESOURCE_AVAILABLE_FOR_READ, RESOURCE_AVAILABLE_FOR_RW, RESOURCE_AVAILABLE_FOR_WRITE,
    RESOURCE_LOCK,
};

use lock::AlignedBuf;

/// How a store or memspace was opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    ReadOnly,
    ReadWrite,
}

/// Per-mapping access flags.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessFlags(u8);

impl AccessFlags {
    pub const NONE: AccessFlags = AccessFlags(0);
    pub const READ: AccessFlags = AccessFlags(0b001);
    pub const WRITE: AccessFlags = AccessFlags(0b010);
    /// The range is being created: skip reading the backing store.
    pub const CREATE: AccessFlags = AccessFlags(0b100);

    #[inline]
    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: AccessFlags) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::READ) {
            parts.push("read");
        }
        if self.contains(Self::WRITE) {
            parts.push("write");
        }
        if self.contains(Self::CREATE) {
            parts.push("create");
        }
        write!(f, "AccessFlags({})", parts.join("|"))
    }
}

/// A released write buffer waiting for the next commit.
pub(crate) struct FlushEntry {
    /// Logical address of the buffer's first byte.
    pub address: u64,
    pub bytes: AlignedBuf,
    pub dirty: DiffRange,
}

pub(crate) struct MemspaceInner {
    store: RwLock<PageStore>,
    allocator: Mutex<CrdtAllocator>,
    /// Snapshot state served to readers; commits publish `state + 1`.
    state: AtomicU64,
    pending: Mutex<Vec<FlushEntry>>,
    next_instance: AtomicU16,
    page_size: usize,
    access: AccessType,
}

impl MemspaceInner {
    pub(crate) fn enqueue_flush(&self, entry: FlushEntry) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }
}

/// A realm of addresses backed by one page store and one allocator.
#[derive(Clone)]
pub struct Memspace {
    inner: Arc<MemspaceInner>,
}

/// Cheap handle binding an address to its memspace and requested access.
#[derive(Clone)]
pub struct Mptr {
    memspace: Memspace,
    address: u64,
    access: AccessFlags,
}

impl Mptr {
    pub fn memspace(&self) -> &Memspace {
        &self.memspace
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Map the pointed-to range.
    pub fn map_range(&self, size: usize) -> Result<MemLock> {
        self.memspace.map_range(self.address, size, self.access)
    }
}

impl Memspace {
    /// Create a fresh realm file and open it read-write.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        PageStore::create(&path, page_size)?;
        Self::open(path, AccessType::ReadWrite)
    }

    /// Open an existing realm.
    pub fn open<P: AsRef<Path>>(path: P, access: AccessType) -> Result<Self> {
        let store = PageStore::open(path, access)?;
        let page_size = store.page_size();
        let state = store.max_state_num();
        Ok(Self {
            inner: Arc::new(MemspaceInner {
                store: RwLock::new(store),
                allocator: Mutex::new(CrdtAllocator::new(u32::MAX)),
                state: AtomicU64::new(state),
                pending: Mutex::new(Vec::new()),
                next_instance: AtomicU16::new(1),
                page_size,
                access,
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn access_type(&self) -> AccessType {
        self.inner.access
    }

    /// The snapshot state served to reads.
    pub fn state(&self) -> u64 {
        self.inner.state.load(Ordering::Acquire)
    }

    /// The realm's address-space allocator. One writer per realm: callers
    /// must not hold this guard across commits.
    pub fn allocator(&self) -> MutexGuard<'_, CrdtAllocator> {
        self.inner.allocator.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn my_ptr(&self, address: u64, access: AccessFlags) -> Mptr {
        Mptr {
            memspace: self.clone(),
            address,
            access,
        }
    }

    /// Roll out the next instance id, skipping 0 and the reserved type-level
    /// value.
    pub(crate) fn next_instance_id(&self) -> u16 {
        loop {
            let id = self.inner.next_instance.fetch_add(1, Ordering::Relaxed) % addr::INSTANCE_ID_MAX;
            if id != 0 {
                return id;
            }
        }
    }

    /// Map `[address, address + size)` into a private buffer.
    ///
    /// The first writer of a region works on this private copy; readers keep
    /// seeing the committed image until the writer's buffer is flushed by
    /// [`commit`](Self::commit).
    pub fn map_range(&self, address: u64, size: usize, flags: AccessFlags) -> Result<MemLock> {
        let mut buf = AlignedBuf::zeroed(size);
        if !flags.contains(AccessFlags::CREATE) {
            self.read_span(addr::physical(address), buf.as_mut_slice(), flags)?;
        }
        Ok(MemLock::new(
            Arc::downgrade(&self.inner),
            address,
            flags,
            buf,
        ))
    }

    /// Read an arbitrary byte span at the current snapshot state.
    fn read_span(&self, physical: u64, out: &mut [u8], flags: AccessFlags) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let page_size = self.inner.page_size as u64;
        let start = physical & !(page_size - 1);
        let end = (physical + out.len() as u64).div_ceil(page_size) * page_size;
        let mut tmp = vec![0u8; (end - start) as usize];
        let store = self.inner.store.read().unwrap_or_else(|e| e.into_inner());
        store.read_with(start, self.state(), &mut tmp, flags)?;
        let begin = (physical - start) as usize;
        out.copy_from_slice(&tmp[begin..begin + out.len()]);
        Ok(())
    }

    /// Flush every released dirty buffer to the page store as the next state
    /// and publish it. Returns the committed state number.
    pub fn commit(&self) -> Result<u64> {
        if self.inner.access != AccessType::ReadWrite {
            return Err(Error::Invalid("commit on a read-only memspace"));
        }
        let entries: Vec<FlushEntry> = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        if entries.is_empty() {
            return Ok(self.state());
        }

        let next = self.state() + 1;
        let page_size = self.inner.page_size as u64;
        let mut store = self.inner.store.write().unwrap_or_else(|e| e.into_inner());

        // fold every released buffer into whole-page images, so overlapping
        // locks landing in the same commit produce a single record per page
        let mut pages: BTreeMap<u64, (Vec<u8>, DiffRange)> = BTreeMap::new();
        for mut entry in entries {
            let physical = addr::physical(entry.address);
            let len = entry.bytes.as_slice().len() as u64;
            let overflow = entry.dirty.is_overflow();
            let ranges: Vec<(u16, u16)> = if overflow {
                Vec::new()
            } else {
                let view = entry.dirty.view()?;
                (0..view.len()).filter_map(|i| view.get(i)).collect()
            };

            let first_page = physical / page_size;
            let last_page = (physical + len - 1) / page_size;
            for page in first_page..=last_page {
                let page_off = page * page_size;
                let slot = match pages.entry(page) {
                    Entry::Vacant(v) => {
                        let mut img = vec![0u8; page_size as usize];
                        store.read_with(page_off, next - 1, &mut img, AccessFlags::WRITE)?;
                        v.insert((img, DiffRange::new()))
                    }
                    Entry::Occupied(o) => o.into_mut(),
                };
                let lo = physical.max(page_off);
                let hi = (physical + len).min(page_off + page_size);
                slot.0[(lo - page_off) as usize..(hi - page_off) as usize]
                    .copy_from_slice(&entry.bytes.as_slice()[(lo - physical) as usize..(hi - physical) as usize]);
                if overflow {
                    let end = (hi - page_off).min(u16::MAX as u64) as u16;
                    slot.1.insert((lo - page_off) as u16, end, usize::MAX);
                } else {
                    for &(begin, end) in ranges.iter() {
                        let abs_begin = (physical + begin as u64).max(lo);
                        let abs_end = (physical + end as u64).min(hi);
                        if abs_begin < abs_end {
                            slot.1.insert(
                                (abs_begin - page_off) as u16,
                                (abs_end - page_off) as u16,
                                usize::MAX,
                            );
                        }
                    }
                }
            }
        }

        for (page, (img, mut forced)) in pages {
            let view = forced.view()?;
            store.write_ranged(page * page_size, next, &img, view)?;
        }
        store.flush()?;
        drop(store);

        self.inner.state.store(next, Ordering::Release);
        self.allocator().commit();
        debug!("committed state {next}");
        Ok(next)
    }

    /// Reader-side: pick up states flushed by a concurrent writer.
    pub fn refresh(&self) -> Result<()> {
        let mut store = self.inner.store.write().unwrap_or_else(|e| e.into_inner());
        store.refresh()?;
        self.inner
            .state
            .store(store.max_state_num(), Ordering::Release);
        Ok(())
    }

    /// Highest committed state of the underlying store.
    pub fn max_state_num(&self) -> u64 {
        self.inner
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .max_state_num()
    }

    /// Page number covering a logical address.
    pub fn page_num(&self, address: u64) -> u64 {
        addr::physical(address) / self.inner.page_size as u64
    }
}

impl std::fmt::Debug for Memspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memspace")
            .field("page_size", &self.inner.page_size)
            .field("access", &self.inner.access)
            .field("state", &self.state())
            .finish()
    }
}

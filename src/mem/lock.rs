//! Reference-counted locked views over mapped byte ranges.

use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex, Weak};

use crate::diff::DiffRange;
use crate::mem::{AccessFlags, FlushEntry, MemspaceInner};

/// Cap on raw dirty sub-ranges per lock before the whole range degrades to
/// "everything dirty".
const MAX_DIRTY_RANGES: usize = 64;

/// 8-byte aligned byte buffer, so mapped objects with natural alignment up
/// to `u64` can be referenced in place.
pub(crate) struct AlignedBuf {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(8)].into_boxed_slice();
        Self { words, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: the allocation holds at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }
}

struct LockInner {
    /// Logical address of the first mapped byte.
    address: u64,
    flags: AccessFlags,
    size: usize,
    /// Private copy of the mapped bytes. Mutable access is serialized by the
    /// owner's ROWO flag word, not by this cell.
    buf: UnsafeCell<AlignedBuf>,
    dirty: Mutex<DiffRange>,
    memspace: Weak<MemspaceInner>,
}

// The buffer is only written through `bytes_mut`, which the vspace layer
// gates behind an exclusive ROWO write acquisition.
unsafe impl Send for LockInner {}
unsafe impl Sync for LockInner {}

impl Drop for LockInner {
    fn drop(&mut self) {
        if !self.flags.contains(AccessFlags::WRITE) {
            return;
        }
        let dirty = std::mem::take(self.dirty.get_mut().unwrap_or_else(|e| e.into_inner()));
        if dirty.is_empty() && !dirty.is_overflow() {
            return;
        }
        if let Some(memspace) = self.memspace.upgrade() {
            let buf = std::mem::replace(self.buf.get_mut(), AlignedBuf::zeroed(0));
            memspace.enqueue_flush(FlushEntry {
                address: self.address,
                bytes: buf,
                dirty,
            });
        }
    }
}

/// A mapped, reference-counted byte range with access flags and a dirty-range
/// accumulator. Clones share the same buffer; when the last clone of a
/// write-flagged lock drops, the buffer and its dirty ranges are handed to
/// the owning memspace for the next commit.
#[derive(Clone)]
pub struct MemLock {
    inner: Arc<LockInner>,
}

impl MemLock {
    pub(crate) fn new(
        memspace: Weak<MemspaceInner>,
        address: u64,
        flags: AccessFlags,
        buf: AlignedBuf,
    ) -> Self {
        let size = buf.len;
        Self {
            inner: Arc::new(LockInner {
                address,
                flags,
                size,
                buf: UnsafeCell::new(buf),
                dirty: Mutex::new(DiffRange::new()),
                memspace,
            }),
        }
    }

    pub fn address(&self) -> u64 {
        self.inner.address
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn flags(&self) -> AccessFlags {
        self.inner.flags
    }

    /// Number of live clones of this lock.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// The mapped bytes.
    ///
    /// Callers observe a stable image as long as they hold the read side of
    /// the owner's ROWO flag word; a writer always maps a fresh lock instead
    /// of mutating one that readers may share.
    pub fn bytes(&self) -> &[u8] {
        unsafe { (*self.inner.buf.get()).as_slice() }
    }

    /// Mutable view of the mapped bytes.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive write side of the owning ROWO flag
    /// word, and no other clone of this lock may read concurrently.
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        (*self.inner.buf.get()).as_mut_slice()
    }

    /// Record `[begin, end)` (relative to the lock) as modified. The range is
    /// forced into the next commit's diff even if the bytes end up matching.
    pub fn mark_modified(&self, begin: usize, end: usize) {
        debug_assert!(begin <= end && end <= self.inner.size);
        let mut dirty = self
            .inner
            .dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if end > u16::MAX as usize {
            dirty.set_overflow();
            return;
        }
        dirty.insert(begin as u16, end as u16, MAX_DIRTY_RANGES);
    }

    /// Forget the accumulated dirty ranges so the final drop publishes
    /// nothing. Used when the mapped object is being destroyed.
    pub(crate) fn discard(&self) {
        self.inner
            .dirty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Drop this clone; the last clone of a modified write lock publishes
    /// its buffer to the memspace flush queue.
    pub fn release(self) {}
}

impl std::fmt::Debug for MemLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemLock")
            .field("address", &self.inner.address)
            .field("size", &self.inner.size)
            .field("flags", &self.inner.flags)
            .field("use_count", &self.use_count())
            .finish()
    }
}

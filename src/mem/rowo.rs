//! Read-or-write-only atomic flag word.
//!
//! Each mapped resource carries one 16-bit flag word. Readers spin until the
//! read-available bit is set, taking a short write-only critical section to
//! perform the mapping when it isn't. Writers do the same against the
//! write-available bit. This is not a general reader/writer lock: the flags
//! only gate the mapping transitions, the mapped bytes themselves are
//! protected by the copy-on-write discipline.

use std::sync::atomic::{AtomicU16, Ordering};

/// The resource is mapped and readable.
pub const RESOURCE_AVAILABLE_FOR_READ: u16 = 0b001;
/// The resource is mapped with a private writable copy.
pub const RESOURCE_AVAILABLE_FOR_WRITE: u16 = 0b010;
/// Both of the above.
pub const RESOURCE_AVAILABLE_FOR_RW: u16 = 0b011;
/// Transition guard bit; held only for the duration of a mapping change.
pub const RESOURCE_LOCK: u16 = 0b100;

#[derive(Default, Debug)]
pub struct RowoCell {
    flags: AtomicU16,
}

impl RowoCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once every bit of `mask` is published.
    #[inline]
    pub fn is_set(&self, mask: u16) -> bool {
        self.flags.load(Ordering::Acquire) & mask == mask
    }

    /// Try to enter the write-only critical section. Fails when another
    /// thread currently holds it.
    pub fn try_lock(&self) -> Option<RowoGuard<'_>> {
        let current = self.flags.load(Ordering::Relaxed);
        if current & RESOURCE_LOCK != 0 {
            return None;
        }
        match self.flags.compare_exchange(
            current,
            current | RESOURCE_LOCK,
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            Ok(_) => Some(RowoGuard {
                cell: self,
                committed: false,
            }),
            Err(_) => None,
        }
    }

    /// Set availability bits, spinning through any in-flight transition.
    pub(crate) fn publish(&self, mask: u16) {
        loop {
            if let Some(guard) = self.try_lock() {
                guard.commit_set(mask);
                return;
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Clear availability bits, spinning through any in-flight transition.
    pub fn clear(&self, mask: u16) {
        loop {
            if let Some(guard) = self.try_lock() {
                guard.commit_clear(mask);
                return;
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Spin until `mask` is published, entering the critical section to run
    /// `publish` when the resource is still unmapped. `publish` returns the
    /// bits to set; an error leaves the flags untouched.
    pub fn acquire<E>(&self, mask: u16, mut publish: impl FnMut() -> Result<u16, E>) -> Result<(), E> {
        while !self.is_set(mask) {
            if let Some(guard) = self.try_lock() {
                if self.flags.load(Ordering::Relaxed) & mask == mask {
                    // published by a competitor between the check and the lock
                    drop(guard);
                    continue;
                }
                let bits = publish()?;
                guard.commit_set(bits);
            } else {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
        Ok(())
    }
}

/// Write-only critical section over a [`RowoCell`]. Dropping without a
/// commit releases the lock bit and publishes nothing.
pub struct RowoGuard<'a> {
    cell: &'a RowoCell,
    committed: bool,
}

impl RowoGuard<'_> {
    /// Publish `mask` and leave the critical section.
    pub fn commit_set(mut self, mask: u16) {
        self.committed = true;
        let current = self.cell.flags.load(Ordering::Relaxed);
        self.cell
            .flags
            .store((current | mask) & !RESOURCE_LOCK, Ordering::Release);
    }

    /// Clear `mask` and leave the critical section.
    pub fn commit_clear(mut self, mask: u16) {
        self.committed = true;
        let current = self.cell.flags.load(Ordering::Relaxed);
        self.cell
            .flags
            .store(current & !mask & !RESOURCE_LOCK, Ordering::Release);
    }
}

impl Drop for RowoGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let current = self.cell.flags.load(Ordering::Relaxed);
            self.cell
                .flags
                .store(current & !RESOURCE_LOCK, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_publishes_once() {
        let cell = RowoCell::new();
        let mut calls = 0;
        cell.acquire::<()>(RESOURCE_AVAILABLE_FOR_READ, || {
            calls += 1;
            Ok(RESOURCE_AVAILABLE_FOR_READ)
        })
        .unwrap();
        cell.acquire::<()>(RESOURCE_AVAILABLE_FOR_READ, || {
            calls += 1;
            Ok(RESOURCE_AVAILABLE_FOR_READ)
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert!(cell.is_set(RESOURCE_AVAILABLE_FOR_READ));
        assert!(!cell.is_set(RESOURCE_AVAILABLE_FOR_WRITE));
    }

    #[test]
    fn failed_publish_leaves_flags_clear() {
        let cell = RowoCell::new();
        let result: Result<(), &str> =
            cell.acquire(RESOURCE_AVAILABLE_FOR_RW, || Err("mapping failed"));
        assert!(result.is_err());
        assert!(!cell.is_set(RESOURCE_AVAILABLE_FOR_READ));
        assert!(cell.try_lock().is_some());
    }

    #[test]
    fn clear_resets_rw_bits() {
        let cell = RowoCell::new();
        cell.acquire::<()>(RESOURCE_AVAILABLE_FOR_RW, || Ok(RESOURCE_AVAILABLE_FOR_RW))
            .unwrap();
        cell.clear(RESOURCE_AVAILABLE_FOR_RW);
        assert!(!cell.is_set(RESOURCE_AVAILABLE_FOR_READ));
        assert!(!cell.is_set(RESOURCE_AVAILABLE_FOR_WRITE));
    }
}

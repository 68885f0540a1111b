//! Typed handles over memspace-mapped ranges.
//!
//! A [`VPtr`] binds an address to a type and drives the per-instance state
//! machine `Untouched → R → RW → detached` through a read-or-write-only flag
//! word: the first read maps the range, the first write swaps in a private
//! writable copy, and a detach forces the next access to re-fetch the
//! just-committed image from storage.

use std::cell::UnsafeCell;
use std::marker::PhantomData;

use bytemuck::{AnyBitPattern, NoUninit};

use crate::addr;
use crate::error::{Error, Result};
use crate::mem::{
    AccessFlags, MemLock, Memspace, Mptr, RowoCell, RESOURCE_AVAILABLE_FOR_READ,
    RESOURCE_AVAILABLE_FOR_RW, RESOURCE_AVAILABLE_FOR_WRITE,
};

/// Fixed-size header at the front of a dynamically sized instance, carrying
/// the instance's total stored length.
pub trait FixedHeader: AnyBitPattern + NoUninit {
    /// Total stored size of the instance this header fronts, header
    /// included.
    fn stored_size(&self) -> usize;
}

/// How the stored size of a mapped instance is resolved.
pub enum SizeSource {
    /// The type has a constant size.
    Measured(usize),
    /// The first mapped bytes are a fixed header carrying the stored
    /// length: `header_len` bytes are mapped and decoded by `stored_size`.
    FixedHeader {
        header_len: usize,
        stored_size: fn(&[u8]) -> Result<usize>,
    },
    /// Ask the allocator for the allocation size (slowest).
    Allocator,
}

impl SizeSource {
    /// Resolution through a [`FixedHeader`] type stored at the front of the
    /// mapping.
    pub fn fixed_header<H: FixedHeader>() -> SizeSource {
        SizeSource::FixedHeader {
            header_len: std::mem::size_of::<H>(),
            stored_size: |bytes| {
                let bytes = bytes
                    .get(..std::mem::size_of::<H>())
                    .ok_or(Error::Invalid("mapped range smaller than its header"))?;
                let header: &H = bytemuck::from_bytes(bytes);
                Ok(header.stored_size())
            },
        }
    }
}

/// A type that can live in a memspace.
///
/// The stored representation is the type's in-memory bytes, so implementors
/// must be plain-old-data with alignment of at most 8 bytes.
pub trait Persistent: AnyBitPattern + NoUninit {
    /// Size resolution for instances of this type: constant by default,
    /// through a length-carrying [`FixedHeader`] for dynamically sized
    /// types, or from the allocator as the last resort.
    fn measure() -> SizeSource {
        SizeSource::Measured(std::mem::size_of::<Self>())
    }

    /// Hook run before the backing allocation is released.
    fn destroy(&self, _memspace: &Memspace) -> Result<()> {
        Ok(())
    }
}

/// Typed pointer into a memspace.
pub struct VPtr<T: Persistent> {
    memspace: Option<Memspace>,
    address: u64,
    access: AccessFlags,
    flags: RowoCell,
    /// Current mapping; only swapped inside the flag word's critical
    /// section.
    lock: UnsafeCell<Option<MemLock>>,
    _marker: PhantomData<T>,
}

impl<T: Persistent> Default for VPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Persistent> VPtr<T> {
    /// The null pointer: no memspace, no address.
    pub fn null() -> Self {
        Self {
            memspace: None,
            address: 0,
            access: AccessFlags::NONE,
            flags: RowoCell::new(),
            lock: UnsafeCell::new(None),
            _marker: PhantomData,
        }
    }

    /// Bind to an existing address.
    pub fn open(memspace: &Memspace, address: u64, access: AccessFlags) -> Self {
        Self {
            memspace: Some(memspace.clone()),
            address,
            access: access | AccessFlags::READ,
            flags: RowoCell::new(),
            lock: UnsafeCell::new(None),
            _marker: PhantomData,
        }
    }

    pub fn from_mptr(ptr: &Mptr) -> Self {
        Self::open(ptr.memspace(), ptr.address(), ptr.access())
    }

    /// Allocate backing storage and store `value` into it.
    pub fn make_new(memspace: &Memspace, value: &T) -> Result<Self> {
        let size = Self::static_size();
        let address = memspace.allocator().alloc(size)?;
        Self::place(memspace, address, size, value)
    }

    /// Allocate with a fresh instance id packed into the logical address.
    pub fn make_new_unique(memspace: &Memspace, value: &T) -> Result<(Self, u16)> {
        let size = Self::static_size();
        let physical = memspace.allocator().alloc(size)?;
        let instance_id = memspace.next_instance_id();
        let address = addr::pack(physical, instance_id);
        Ok((Self::place(memspace, address, size, value)?, instance_id))
    }

    fn place(memspace: &Memspace, address: u64, size: usize, value: &T) -> Result<Self> {
        debug_assert!(std::mem::align_of::<T>() <= 8);
        let lock = memspace.map_range(
            address,
            size,
            AccessFlags::READ | AccessFlags::WRITE | AccessFlags::CREATE,
        )?;
        // Safety: the lock was just created and has no other clone.
        unsafe {
            lock.bytes_mut()[..std::mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(value));
        }
        lock.mark_modified(0, size);
        let this = Self {
            memspace: Some(memspace.clone()),
            address,
            access: AccessFlags::READ | AccessFlags::WRITE,
            flags: RowoCell::new(),
            lock: UnsafeCell::new(Some(lock)),
            _marker: PhantomData,
        };
        this.flags.publish(RESOURCE_AVAILABLE_FOR_RW);
        Ok(this)
    }

    fn static_size() -> usize {
        match T::measure() {
            SizeSource::Measured(size) => size,
            _ => std::mem::size_of::<T>(),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn is_null(&self) -> bool {
        self.address == 0 || self.memspace.is_none()
    }

    pub fn memspace(&self) -> Option<&Memspace> {
        self.memspace.as_ref()
    }

    /// The resource is mapped in local memory.
    pub fn is_attached(&self) -> bool {
        self.flags.is_set(RESOURCE_AVAILABLE_FOR_READ)
            || self.flags.is_set(RESOURCE_AVAILABLE_FOR_WRITE)
    }

    /// The resource has been accessed for write since the last detach.
    pub fn is_modified(&self) -> bool {
        self.flags.is_set(RESOURCE_AVAILABLE_FOR_WRITE)
    }

    /// Live clones of the current mapping, 0 when unmapped.
    pub fn use_count(&self) -> usize {
        // Safety: shared read of the slot; swaps happen only inside the flag
        // word's critical section.
        unsafe { (*self.lock.get()).as_ref().map_or(0, MemLock::use_count) }
    }

    fn require_memspace(&self) -> Result<&Memspace> {
        self.memspace
            .as_ref()
            .filter(|_| self.address != 0)
            .ok_or(Error::Invalid("null v-pointer"))
    }

    /// Size of the mapped instance: statically measured, decoded from the
    /// leading fixed header, or the allocator's answer as the last resort.
    fn resolve_size(&self, memspace: &Memspace) -> Result<usize> {
        match T::measure() {
            SizeSource::Measured(size) => Ok(size),
            SizeSource::FixedHeader {
                header_len,
                stored_size,
            } => {
                let header = memspace.map_range(self.address, header_len, AccessFlags::READ)?;
                stored_size(header.bytes())
            }
            SizeSource::Allocator => memspace
                .allocator()
                .get_alloc_size(addr::physical(self.address)),
        }
    }

    fn ensure_read(&self) -> Result<()> {
        let memspace = self.require_memspace()?;
        self.flags.acquire(RESOURCE_AVAILABLE_FOR_READ, || {
            let size = self.resolve_size(memspace)?;
            let lock = memspace.map_range(self.address, size, self.access)?;
            // Safety: inside the critical section; no reader holds the slot.
            unsafe {
                *self.lock.get() = Some(lock);
            }
            Ok(RESOURCE_AVAILABLE_FOR_READ)
        })
    }

    fn current_lock(&self) -> Result<&MemLock> {
        // Safety: the slot is only swapped inside the critical section and
        // callers hold at least the read availability bit.
        unsafe { (*self.lock.get()).as_ref() }.ok_or(Error::Internal("resource flags set without a mapping"))
    }

    /// Read access to the mapped instance.
    pub fn get(&self) -> Result<&T> {
        debug_assert!(std::mem::align_of::<T>() <= 8);
        self.ensure_read()?;
        let lock = self.current_lock()?;
        let bytes = lock
            .bytes()
            .get(..std::mem::size_of::<T>())
            .ok_or(Error::Invalid("mapped range smaller than its type"))?;
        Ok(bytemuck::from_bytes(bytes))
    }

    /// Write access to the mapped instance. The first write swaps in a fresh
    /// private copy of the backing bytes and marks the whole range modified.
    pub fn modify(&mut self) -> Result<&mut T> {
        debug_assert!(std::mem::align_of::<T>() <= 8);
        let memspace = self
            .memspace
            .clone()
            .filter(|_| self.address != 0)
            .ok_or(Error::Invalid("null v-pointer"))?;
        let address = self.address;
        let access = self.access;
        let lock_slot = &self.lock;
        self.flags.acquire(RESOURCE_AVAILABLE_FOR_WRITE, || {
            let size = self.resolve_size(&memspace)?;
            let lock = memspace.map_range(address, size, access | AccessFlags::WRITE)?;
            // Safety: inside the critical section.
            unsafe {
                *lock_slot.get() = Some(lock);
            }
            Ok(RESOURCE_AVAILABLE_FOR_RW)
        })?;
        let lock = self.current_lock()?;
        lock.mark_modified(0, lock.size());
        // Safety: the write bit is held exclusively by this &mut borrow.
        let bytes = unsafe { lock.bytes_mut() };
        Ok(bytemuck::from_bytes_mut(
            &mut bytes[..std::mem::size_of::<T>()],
        ))
    }

    /// Force `[offset, offset + len)` into the next commit's diff even when
    /// the bytes end up unchanged.
    pub fn mark_modified(&mut self, offset: usize, len: usize) -> Result<()> {
        self.modify()?;
        self.current_lock()?.mark_modified(offset, offset + len);
        Ok(())
    }

    /// Drop the mapping and reset both availability bits; the next access
    /// re-fetches fresh bytes from storage.
    pub fn detach(&mut self) {
        self.flags.clear(RESOURCE_AVAILABLE_FOR_RW);
        // Safety: &mut self, no outstanding borrows of the slot.
        unsafe {
            *self.lock.get() = None;
        }
    }

    /// Mark the current write as final. The mapping is released (publishing
    /// the dirty buffer for the next memspace commit) and the next access
    /// re-reads from storage.
    pub fn commit(&mut self) {
        self.detach();
    }

    /// Run the type's destroy hook and free the allocation. Idempotent after
    /// the first call.
    pub fn destroy(&mut self) -> Result<()> {
        if self.is_null() {
            return Ok(());
        }
        let memspace = self.require_memspace()?.clone();
        let value = *self.get()?;
        value.destroy(&memspace)?;
        self.flags.clear(RESOURCE_AVAILABLE_FOR_RW);
        // Safety: &mut self, no outstanding borrows of the slot.
        unsafe {
            if let Some(lock) = (*self.lock.get()).take() {
                lock.discard();
            }
        }
        memspace.allocator().free(addr::physical(self.address))?;
        self.address = 0;
        self.memspace = None;
        Ok(())
    }
}

impl<T: Persistent> Clone for VPtr<T> {
    /// Clones share the address but start detached; each clone maps its own
    /// view on first access.
    fn clone(&self) -> Self {
        Self {
            memspace: self.memspace.clone(),
            address: self.address,
            access: self.access,
            flags: RowoCell::new(),
            lock: UnsafeCell::new(None),
            _marker: PhantomData,
        }
    }
}

impl<T: Persistent> PartialEq for VPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<T: Persistent> std::fmt::Debug for VPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VPtr")
            .field("address", &self.address)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Owning convenience wrapper over a [`VPtr`].
pub struct VObject<T: Persistent> {
    ptr: VPtr<T>,
}

impl<T: Persistent> VObject<T> {
    /// Allocate and initialize a new instance.
    pub fn new(memspace: &Memspace, value: T) -> Result<Self> {
        Ok(Self {
            ptr: VPtr::make_new(memspace, &value)?,
        })
    }

    /// Allocate with a unique logical address; returns the instance id.
    pub fn new_unique(memspace: &Memspace, value: T) -> Result<(Self, u16)> {
        let (ptr, instance_id) = VPtr::make_new_unique(memspace, &value)?;
        Ok((Self { ptr }, instance_id))
    }

    /// Open an instance stored at `address`.
    pub fn open(memspace: &Memspace, address: u64) -> Self {
        Self {
            ptr: VPtr::open(memspace, address, AccessFlags::READ),
        }
    }

    pub fn from_ptr(ptr: VPtr<T>) -> Self {
        Self { ptr }
    }

    pub fn get(&self) -> Result<&T> {
        self.ptr.get()
    }

    pub fn modify(&mut self) -> Result<&mut T> {
        self.ptr.modify()
    }

    pub fn mark_modified(&mut self, offset: usize, len: usize) -> Result<()> {
        self.ptr.mark_modified(offset, len)
    }

    /// Publish the current write and detach; the next access observes the
    /// committed image.
    pub fn commit(&mut self) {
        self.ptr.commit();
    }

    pub fn detach(&mut self) {
        self.ptr.detach();
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.ptr.destroy()
    }

    pub fn address(&self) -> u64 {
        self.ptr.address()
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn use_count(&self) -> usize {
        self.ptr.use_count()
    }

    pub fn v_ptr(&self) -> &VPtr<T> {
        &self.ptr
    }

    /// Number of pages spanned by this instance. Small objects usually span
    /// one, but an allocation crossing a page boundary spans more.
    pub fn span(&self) -> Result<u64> {
        let memspace = self
            .ptr
            .memspace()
            .ok_or(Error::Invalid("null v-pointer"))?
            .clone();
        let size = self.ptr.resolve_size(&memspace)? as u64;
        let first = memspace.page_num(self.ptr.address());
        let last = memspace.page_num(self.ptr.address() + size.saturating_sub(1));
        Ok(last - first + 1)
    }
}

impl<T: Persistent> std::fmt::Debug for VObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VObject")
            .field("address", &self.ptr.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};

    use super::*;

    fn realm_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dbzero-vspace-{name}-{}.db0", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    struct ChunkHeader {
        stored: u32,
        tag: u32,
    }

    impl FixedHeader for ChunkHeader {
        fn stored_size(&self) -> usize {
            self.stored as usize
        }
    }

    /// Dynamically sized on disk: the leading header carries the length.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    struct Chunk {
        header: ChunkHeader,
        data: [u8; 24],
    }

    impl Persistent for Chunk {
        fn measure() -> SizeSource {
            SizeSource::fixed_header::<ChunkHeader>()
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    struct Plain {
        id: u64,
    }

    impl Persistent for Plain {}

    #[test]
    fn null_pointers_refuse_access() {
        let mut ptr: VPtr<Plain> = VPtr::null();
        assert!(ptr.is_null());
        assert!(matches!(ptr.get(), Err(Error::Invalid(_))));
        assert!(matches!(ptr.modify(), Err(Error::Invalid(_))));
        ptr.destroy().unwrap();
    }

    #[test]
    fn size_source_decodes_the_header_bytes() {
        let SizeSource::FixedHeader {
            header_len,
            stored_size,
        } = Chunk::measure()
        else {
            panic!("chunk sizing must go through its header");
        };
        assert_eq!(header_len, std::mem::size_of::<ChunkHeader>());
        let header = ChunkHeader { stored: 32, tag: 0 };
        assert_eq!(stored_size(bytemuck::bytes_of(&header)).unwrap(), 32);
        assert!(stored_size(&[0u8; 4]).is_err());
    }

    #[test]
    fn fixed_header_carries_the_dynamic_length() {
        let path = realm_path("fixed-header");
        let memspace = Memspace::create(&path, 4096).unwrap();

        let chunk = Chunk {
            header: ChunkHeader {
                stored: std::mem::size_of::<Chunk>() as u32,
                tag: 7,
            },
            data: [9u8; 24],
        };
        let mut object = VObject::new(&memspace, chunk).unwrap();
        let address = object.address();
        object.commit();
        memspace.commit().unwrap();

        // reopening resolves the mapped size through the leading header
        let reopened: VObject<Chunk> = VObject::open(&memspace, address);
        let read = reopened.get().unwrap();
        assert_eq!(read.header.stored, 32);
        assert_eq!(read.header.tag, 7);
        assert_eq!(read.data, [9u8; 24]);
        assert_eq!(reopened.span().unwrap(), 1);

        let _ = std::fs::remove_file(&path);
    }
}

//! Versioned, page-addressed persistent byte store.
//!
//! The backing file is append-only: a fixed header, then variable-length
//! records, then the newest index checkpoint. Every flush appends the pending
//! records, appends a fresh checkpoint and only then publishes the header, so
//! a torn flush leaves the previous durable state fully readable. Page
//! versions are keyed by a monotonically increasing state number; a read
//! resolves the newest record at or below the query state.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use fs4::fs_std::FileExt as _;
use log::{debug, warn};
use memmap2::{Mmap, MmapOptions};
use xxhash_rust::xxh3::xxh3_64;

use crate::diff::{self, DiffRangeView};
use crate::error::{Error, Result};
use crate::mem::{AccessFlags, AccessType};

pub(crate) mod index;
pub(crate) mod record;

use index::{IndexEntry, SparseIndex};
use record::{RecordPrefix, RECORD_BASE, RECORD_DIFF, RECORD_PREFIX_LEN, RECORD_ZERO_DIFF};

/// Default page size used by [`PageStore::create_default`].
pub const DEFAULT_PAGE_SIZE: usize = 4096;

const MAGIC: [u8; 8] = *b"dbzero0\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = std::mem::size_of::<Header>();

#[derive(Clone, Copy, Debug, Zeroable, Pod)]
#[repr(C)]
struct Header {
    magic: [u8; 8],
    version: u32,
    page_size: u32,
    flags: u32,
    realm_count: u32,
    max_state: u64,
    data_end: u64,
    checkpoint_off: u64,
    checkpoint_len: u64,
    hash: u64,
}

impl Header {
    fn compute_hash(&self) -> u64 {
        let bytes = bytemuck::bytes_of(self);
        xxh3_64(&bytes[..HEADER_LEN - 8])
    }

    fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Corruption("file magic mismatch"));
        }
        if self.version != FORMAT_VERSION {
            return Err(Error::Invalid("unsupported format version"));
        }
        if self.hash != self.compute_hash() {
            return Err(Error::Corruption("header checksum mismatch"));
        }
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(Error::Corruption("invalid page size in header"));
        }
        Ok(())
    }
}

/// Versioned page store over a single file.
pub struct PageStore {
    file: std::fs::File,
    path: PathBuf,
    access: AccessType,
    /// Last published header; the durable part of the file ends at
    /// `header.data_end`.
    header: Header,
    /// Read view over `[0, header.data_end)`.
    map: Option<Mmap>,
    index: SparseIndex,
    /// Records written since the last flush, logically located at
    /// `header.data_end..`.
    pending: Vec<u8>,
    /// Highest state seen, including unflushed writes.
    max_state: u64,
}

impl PageStore {
    /// Initialize an empty store file with the given page size.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<()> {
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(Error::Invalid("page size must be a power of two in 512..=65536"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(Error::Open)?;
        let mut header = Header {
            magic: MAGIC,
            version: FORMAT_VERSION,
            page_size: page_size as u32,
            flags: 0,
            realm_count: 1,
            max_state: 0,
            data_end: HEADER_LEN as u64,
            checkpoint_off: HEADER_LEN as u64,
            checkpoint_len: 0,
            hash: 0,
        };
        header.hash = header.compute_hash();
        file.write_all_at(bytemuck::bytes_of(&header), 0)
            .map_err(Error::Io)?;
        file.sync_all().map_err(Error::Sync)?;
        Ok(())
    }

    /// Initialize an empty store file with the default 4 kiB page size.
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<()> {
        Self::create(path, DEFAULT_PAGE_SIZE)
    }

    /// Open an existing store. A read-write opener takes an exclusive
    /// advisory lock on the file; readers don't lock at all so they can run
    /// next to a live writer.
    pub fn open<P: AsRef<Path>>(path: P, access: AccessType) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(access == AccessType::ReadWrite)
            .open(&path)
            .map_err(Error::Open)?;
        if access == AccessType::ReadWrite {
            file.try_lock_exclusive().map_err(Error::Lock)?;
        }
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact_at(&mut buf, 0).map_err(Error::Io)?;
        let header: Header = bytemuck::pod_read_unaligned(&buf);
        header.validate()?;

        let mut store = Self {
            file,
            path,
            access,
            header,
            map: None,
            index: SparseIndex::new(),
            pending: Vec::new(),
            max_state: header.max_state,
        };
        store.remap()?;
        if header.checkpoint_len > 0 {
            let bytes = store.record_bytes(header.checkpoint_off, header.checkpoint_len as usize)?;
            let index = SparseIndex::deserialize(bytes)?;
            store.index = index;
        }
        debug!(
            "opened page store {:?} ({:?}, max state {})",
            store.path, access, store.max_state
        );
        Ok(store)
    }

    pub fn page_size(&self) -> usize {
        self.header.page_size as usize
    }

    pub fn access_type(&self) -> AccessType {
        self.access
    }

    /// Highest state number visible through this handle.
    pub fn max_state_num(&self) -> u64 {
        self.max_state
    }

    /// Write one or more full pages under the given state number.
    pub fn write(&mut self, offset: u64, state: u64, data: &[u8]) -> Result<()> {
        let page_size = self.page_size();
        self.check_span(offset, data.len())?;
        let pages = data.len() / page_size;
        for i in 0..pages {
            let chunk = &data[i * page_size..(i + 1) * page_size];
            self.write_page(offset + (i * page_size) as u64, state, chunk, DiffRangeView::default())?;
        }
        Ok(())
    }

    /// Write a single page, treating `forced` sub-ranges as modified even if
    /// their bytes match the previous version.
    pub fn write_ranged(
        &mut self,
        offset: u64,
        state: u64,
        page: &[u8],
        forced: DiffRangeView,
    ) -> Result<()> {
        self.check_span(offset, page.len())?;
        if page.len() != self.page_size() {
            return Err(Error::Invalid("ranged writes cover exactly one page"));
        }
        self.write_page(offset, state, page, forced)
    }

    fn write_page(
        &mut self,
        offset: u64,
        state: u64,
        page: &[u8],
        forced: DiffRangeView,
    ) -> Result<()> {
        if self.access != AccessType::ReadWrite {
            return Err(Error::Invalid("store is read-only"));
        }
        if state == 0 {
            return Err(Error::Invalid("state number 0 is reserved"));
        }
        let page_no = self.page_no(offset)?;
        let record_offset = self.header.data_end + self.pending.len() as u64;

        // diff against the newest version below this state, or against the
        // all-zero page if this page has never been stored
        let prev = self.read_page_image(page_no, state.saturating_sub(1))?;
        let kind = match prev {
            Some(prev_img) => {
                match diff::get_diffs(&prev_img, page, None, None, forced) {
                    Some(pattern) => {
                        let diff_bytes = diff::collect_diff_bytes(page, &pattern);
                        match record::diff_payload_len(&pattern, &diff_bytes) {
                            Some(payload_len) => {
                                record::append_diff(
                                    &mut self.pending,
                                    RECORD_DIFF,
                                    page_no,
                                    state,
                                    &pattern,
                                    &diff_bytes,
                                    payload_len,
                                );
                                RECORD_DIFF
                            }
                            None => self.append_base(page_no, state, page),
                        }
                    }
                    None => self.append_base(page_no, state, page),
                }
            }
            None => match diff::get_zero_diffs(page, None, None, forced) {
                Some(pattern) => {
                    // runs past the (0, 0) marker select the stored bytes
                    let diff_bytes = diff::collect_diff_bytes(page, &pattern[2..]);
                    match record::diff_payload_len(&pattern, &diff_bytes) {
                        Some(payload_len) => {
                            record::append_diff(
                                &mut self.pending,
                                RECORD_ZERO_DIFF,
                                page_no,
                                state,
                                &pattern,
                                &diff_bytes,
                                payload_len,
                            );
                            RECORD_ZERO_DIFF
                        }
                        None => self.append_base(page_no, state, page),
                    }
                }
                None => self.append_base(page_no, state, page),
            },
        };

        self.index.insert(
            page_no,
            IndexEntry {
                state,
                offset: record_offset,
                kind,
            },
        );
        self.max_state = self.max_state.max(state);
        Ok(())
    }

    fn append_base(&mut self, page_no: u32, state: u64, page: &[u8]) -> u8 {
        record::append_base(&mut self.pending, page_no, state, page);
        RECORD_BASE
    }

    /// Read one or more full pages as of the given state.
    ///
    /// Pages with no covering record fail with [`Error::NotFound`]; use
    /// [`read_with`](Self::read_with) and a write-only access to zero-fill
    /// them instead.
    pub fn read(&self, offset: u64, state: u64, buf: &mut [u8]) -> Result<()> {
        self.read_with(offset, state, buf, AccessFlags::READ)
    }

    /// Read with explicit access flags. Write-access reads of pages that
    /// were never stored yield zero-filled buffers.
    pub fn read_with(
        &self,
        offset: u64,
        state: u64,
        buf: &mut [u8],
        access: AccessFlags,
    ) -> Result<()> {
        let page_size = self.page_size();
        self.check_span(offset, buf.len())?;
        let pages = buf.len() / page_size;
        for i in 0..pages {
            let page_no = self.page_no(offset + (i * page_size) as u64)?;
            let out = &mut buf[i * page_size..(i + 1) * page_size];
            match self.read_page_image(page_no, state)? {
                Some(img) => out.copy_from_slice(&img),
                None if access.contains(AccessFlags::WRITE) => out.fill(0),
                None => {
                    return Err(Error::NotFound {
                        page: page_no as u64,
                        state,
                    })
                }
            }
        }
        Ok(())
    }

    /// Reconstruct the image of a page at the given state, or `None` if the
    /// page has no record at or below it.
    fn read_page_image(&self, page_no: u32, state: u64) -> Result<Option<Vec<u8>>> {
        let page_size = self.page_size();
        let Some((entries, at)) = self.index.lookup(page_no, state) else {
            return Ok(None);
        };
        let base_at = SparseIndex::base_position(entries, at)?;
        let mut img = vec![0u8; page_size];
        for entry in &entries[base_at..=at] {
            let prefix_bytes = self.record_bytes(entry.offset, RECORD_PREFIX_LEN)?;
            let prefix = RecordPrefix::parse(prefix_bytes)?;
            if prefix.page_no != page_no || prefix.state != entry.state || prefix.kind != entry.kind
            {
                return Err(Error::Corruption("index entry does not match its record"));
            }
            let payload = self.record_bytes(
                entry.offset + RECORD_PREFIX_LEN as u64,
                prefix.payload_size(page_size),
            )?;
            match prefix.kind {
                RECORD_BASE => img.copy_from_slice(payload),
                RECORD_ZERO_DIFF => {
                    let (pattern, diff_bytes) = record::parse_diff_payload(payload)?;
                    diff::apply_zero_diffs(&pattern, diff_bytes, &mut img)?;
                }
                RECORD_DIFF => {
                    let (pattern, diff_bytes) = record::parse_diff_payload(payload)?;
                    diff::overlay_diffs(&pattern, diff_bytes, &mut img)?;
                }
                _ => return Err(Error::Corruption("unknown record kind")),
            }
        }
        Ok(Some(img))
    }

    /// Resolve record bytes from either the mapped durable area or the
    /// not-yet-flushed tail.
    fn record_bytes(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let data_end = self.header.data_end;
        if offset >= data_end {
            let start = (offset - data_end) as usize;
            return self
                .pending
                .get(start..start + len)
                .ok_or(Error::Corruption("record offset beyond pending tail"));
        }
        if offset + len as u64 > data_end {
            return Err(Error::Corruption("record straddles the durable boundary"));
        }
        let map = self
            .map
            .as_ref()
            .ok_or(Error::Internal("page store has no mapping"))?;
        map.get(offset as usize..offset as usize + len)
            .ok_or(Error::Corruption("record offset beyond mapped area"))
    }

    /// Persist pending records and publish a new checkpoint. On failure the
    /// previously published state remains the effective current state.
    pub fn flush(&mut self) -> Result<()> {
        if self.access != AccessType::ReadWrite {
            return Err(Error::Invalid("flush on a read-only store"));
        }
        if self.pending.is_empty() && self.header.max_state == self.max_state {
            return Ok(());
        }
        let records_at = self.header.data_end;
        self.file
            .write_all_at(&self.pending, records_at)
            .map_err(Error::Io)?;
        self.file.sync_data().map_err(Error::Sync)?;
        let records_end = records_at + self.pending.len() as u64;

        let checkpoint = self.index.serialize();
        self.file
            .write_all_at(&checkpoint, records_end)
            .map_err(Error::Io)?;
        self.file.sync_data().map_err(Error::Sync)?;

        let mut header = self.header;
        header.max_state = self.max_state;
        header.checkpoint_off = records_end;
        header.checkpoint_len = checkpoint.len() as u64;
        header.data_end = records_end + checkpoint.len() as u64;
        header.hash = header.compute_hash();
        self.file
            .write_all_at(bytemuck::bytes_of(&header), 0)
            .map_err(Error::Io)?;
        self.file.sync_data().map_err(Error::Sync)?;

        debug!(
            "flushed {} record bytes, max state {}",
            self.pending.len(),
            header.max_state
        );
        self.header = header;
        self.pending.clear();
        self.remap()
    }

    /// Reader-side: pick up states flushed by a concurrent writer. A torn or
    /// not-yet-durable header is skipped silently; the previous view stays
    /// in effect.
    pub fn refresh(&mut self) -> Result<()> {
        if self.access == AccessType::ReadWrite {
            return Ok(());
        }
        let mut buf = [0u8; HEADER_LEN];
        self.file.read_exact_at(&mut buf, 0).map_err(Error::Io)?;
        let header: Header = bytemuck::pod_read_unaligned(&buf);
        if header.validate().is_err() {
            return Ok(());
        }
        if header.data_end == self.header.data_end && header.max_state == self.header.max_state {
            return Ok(());
        }
        let old_header = self.header;
        self.header = header;
        if let Err(err) = self.remap() {
            self.header = old_header;
            return Err(err);
        }
        if header.checkpoint_len > 0 {
            let bytes = self.record_bytes(header.checkpoint_off, header.checkpoint_len as usize)?;
            match SparseIndex::deserialize(bytes) {
                Ok(index) => self.index = index,
                Err(_) => {
                    // concurrent flush in progress; keep the previous view
                    self.header = old_header;
                    return Ok(());
                }
            }
        }
        self.max_state = header.max_state;
        debug!("refreshed to max state {}", self.max_state);
        Ok(())
    }

    /// Newest state at or below `state` in which the page at `offset` was
    /// modified.
    pub fn find_mutation(&self, offset: u64, state: u64) -> Result<u64> {
        self.try_find_mutation(offset, state)?
            .ok_or(Error::NotFound {
                page: offset / self.page_size() as u64,
                state,
            })
    }

    /// Non-erroring variant of [`find_mutation`](Self::find_mutation).
    pub fn try_find_mutation(&self, offset: u64, state: u64) -> Result<Option<u64>> {
        let page_no = self.page_no(offset & !(self.page_size() as u64 - 1))?;
        Ok(self.index.find_mutation(page_no, state))
    }

    /// Enumerate committed change logs: for each state in `[from, to]` the
    /// sorted page numbers mutated in it.
    pub fn fetch_change_logs<F: FnMut(u64, &[u32])>(&self, from: u64, to: u64, mut cb: F) {
        for (state, pages) in self.index.change_logs(from, to) {
            cb(state, &pages);
        }
    }

    /// Flush (when writable) and drop the handle.
    pub fn close(mut self) -> Result<()> {
        if self.access == AccessType::ReadWrite {
            self.flush()?;
        }
        Ok(())
    }

    fn remap(&mut self) -> Result<()> {
        let len = self.header.data_end as usize;
        let map = unsafe {
            MmapOptions::new()
                .len(len)
                .map(&self.file)
                .map_err(Error::Io)?
        };
        self.map = Some(map);
        Ok(())
    }

    fn page_no(&self, offset: u64) -> Result<u32> {
        let page = offset / self.page_size() as u64;
        u32::try_from(page).map_err(|_| Error::Invalid("page number out of range"))
    }

    fn check_span(&self, offset: u64, len: usize) -> Result<()> {
        let page_size = self.header.page_size;
        if offset % page_size as u64 != 0 {
            return Err(Error::Misaligned { offset, page_size });
        }
        if len == 0 || len % page_size as usize != 0 {
            return Err(Error::Invalid("length is not a positive page multiple"));
        }
        Ok(())
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        if self.access == AccessType::ReadWrite && !self.pending.is_empty() {
            if let Err(err) = self.flush() {
                warn!("page store flush on drop failed: {err}");
            }
        }
    }
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("path", &self.path)
            .field("access", &self.access)
            .field("page_size", &self.header.page_size)
            .field("max_state", &self.max_state)
            .field("pending_bytes", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    use super::*;

    const RAND_SEED: u64 = 9142424;

    fn store_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dbzero-store-{name}-{}.db0", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn random_page(rng: &mut StdRng, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        rng.fill_bytes(&mut page);
        page
    }

    #[test]
    fn creates_an_empty_file_with_default_configuration() {
        let path = store_path("create-default");
        PageStore::create_default(&path).unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn opens_an_empty_file_read_only() {
        let path = store_path("open-empty");
        PageStore::create_default(&path).unwrap();
        let store = PageStore::open(&path, AccessType::ReadOnly).unwrap();
        assert_eq!(store.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(store.max_state_num(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn second_writer_is_locked_out() {
        let path = store_path("writer-lock");
        PageStore::create_default(&path).unwrap();
        let _writer = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        match PageStore::open(&path, AccessType::ReadWrite) {
            Err(Error::Lock(_)) => {}
            other => panic!("expected a lock error, got {other:?}"),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn writes_then_reads_full_pages_from_one_state() {
        let path = store_path("one-state");
        let mut rng = StdRng::seed_from_u64(RAND_SEED);
        PageStore::create_default(&path).unwrap();
        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let page_size = store.page_size();
        let state_num = 1;

        let mut pages: HashMap<u64, Vec<u8>> = HashMap::new();
        for _ in 0..100 {
            let page_num = rng.gen_range(0..10000u64);
            if pages.contains_key(&page_num) {
                continue;
            }
            let page = random_page(&mut rng, page_size);
            store
                .write(page_num * page_size as u64, state_num, &page)
                .unwrap();
            pages.insert(page_num, page);
        }

        for (page_num, page) in pages.iter() {
            let mut read_buffer = vec![0u8; page_size];
            store
                .read(page_num * page_size as u64, state_num, &mut read_buffer)
                .unwrap();
            assert_eq!(&read_buffer, page);
        }
        store.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    /// Write the same page under states 1, 6, 11, …, 46 and resolve reads at
    /// arbitrary states to the newest version at or below them.
    #[test]
    fn reads_pages_from_different_states() {
        let path = store_path("multi-state");
        let mut rng = StdRng::seed_from_u64(RAND_SEED);
        PageStore::create_default(&path).unwrap();
        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let page_size = store.page_size();

        let mut pages = Vec::new();
        for i in 0..10u64 {
            let state_num = 1 + i * 5;
            let page = random_page(&mut rng, page_size);
            store.write(0, state_num, &page).unwrap();
            pages.push(page);
        }

        // (query state, expected written state)
        let states = [
            (1u64, 1u64),
            (4, 1),
            (12, 11),
            (34, 31),
            (35, 31),
            (52, 46),
            (100, 46),
            (13, 11),
        ];
        for (query, expected) in states {
            let mut read_buffer = vec![0u8; page_size];
            store.read(0, query, &mut read_buffer).unwrap();
            assert_eq!(read_buffer, pages[(expected as usize - 1) / 5], "state {query}");
        }
        store.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sparse_index_is_serialized_on_close() {
        let path = store_path("index-close");
        let mut rng = StdRng::seed_from_u64(RAND_SEED);
        PageStore::create_default(&path).unwrap();
        let mut pages = Vec::new();
        {
            let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
            let page_size = store.page_size();
            for i in 0..10u64 {
                let page = random_page(&mut rng, page_size);
                store.write(0, 1 + i * 5, &page).unwrap();
                pages.push(page);
            }
            store.close().unwrap();
        }

        let store = PageStore::open(&path, AccessType::ReadOnly).unwrap();
        let states = [
            (1u64, 1u64),
            (4, 1),
            (12, 11),
            (34, 31),
            (35, 31),
            (52, 46),
            (100, 46),
            (13, 11),
        ];
        for (query, expected) in states {
            let mut read_buffer = vec![0u8; store.page_size()];
            store.read(0, query, &mut read_buffer).unwrap();
            assert_eq!(read_buffer, pages[(expected as usize - 1) / 5], "state {query}");
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reading_uninitialized_space_fails() {
        let path = store_path("uninitialized");
        PageStore::create_default(&path).unwrap();
        let store = PageStore::open(&path, AccessType::ReadOnly).unwrap();
        let mut buffer = vec![0u8; store.page_size()];
        match store.read_with(0, 1, &mut buffer, AccessFlags::READ) {
            Err(Error::NotFound { page: 0, state: 1 }) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn write_only_access_zero_initializes_new_pages() {
        let path = store_path("zero-init");
        PageStore::create_default(&path).unwrap();
        let store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let mut buffer = vec![0xffu8; store.page_size()];
        store
            .read_with(0, 1, &mut buffer, AccessFlags::WRITE)
            .unwrap();
        assert!(buffer.iter().all(|&b| b == 0));
        store.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn finds_the_newest_mutation_at_or_below_a_state() {
        let path = store_path("find-mutation");
        let mut rng = StdRng::seed_from_u64(RAND_SEED);
        PageStore::create_default(&path).unwrap();
        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let page_size = store.page_size() as u64;
        for i in 0..10u64 {
            let page = random_page(&mut rng, page_size as usize);
            store.write(i * page_size, 1 + i * 5, &page).unwrap();
        }

        assert_eq!(store.find_mutation(0, 4).unwrap(), 1);
        // page #1 first appears at state 6
        assert_eq!(store.try_find_mutation(page_size, 1).unwrap(), None);
        assert_eq!(store.try_find_mutation(page_size, 6).unwrap(), Some(6));
        store.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sparse_index_survives_updates_across_sessions() {
        let path = store_path("index-updates");
        let mut rng = StdRng::seed_from_u64(RAND_SEED);
        PageStore::create_default(&path).unwrap();

        let mut pages_v1 = Vec::new();
        {
            let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
            let page_size = store.page_size();
            for i in 0..10u64 {
                let page = random_page(&mut rng, page_size);
                store.write(i * page_size as u64, 1, &page).unwrap();
                pages_v1.push(page);
            }
            store.close().unwrap();
        }
        let mut pages_v2 = Vec::new();
        {
            let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
            let page_size = store.page_size();
            for i in 0..10u64 {
                let page = random_page(&mut rng, page_size);
                store.write(i * page_size as u64, 2, &page).unwrap();
                pages_v2.push(page);
            }
            store.close().unwrap();
        }

        let store = PageStore::open(&path, AccessType::ReadOnly).unwrap();
        let page_size = store.page_size();
        for i in 0..10usize {
            let mut read_buffer = vec![0u8; page_size];
            store
                .read((i * page_size) as u64, 1, &mut read_buffer)
                .unwrap();
            assert_eq!(read_buffer, pages_v1[i]);
            store
                .read((i * page_size) as u64, 2, &mut read_buffer)
                .unwrap();
            assert_eq!(read_buffer, pages_v2[i]);
        }
        let _ = std::fs::remove_file(&path);
    }

    /// Multi-page writes, one state each, flushed after every write.
    const WRITE_OPS: [(u64, usize, u8); 8] = [
        (1, 1, b'a'),
        (2, 1, b'b'),
        (3, 1, b'c'),
        (4, 3, b'a'),
        (17, 4, b'c'),
        (1, 3, b'a'),
        (7, 3, b'z'),
        (2, 8, b'x'),
    ];

    #[test]
    fn state_wise_write_then_read() {
        let path = store_path("state-wise");
        let page_size = 4096usize;
        PageStore::create(&path, page_size).unwrap();

        {
            let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
            let mut state_num = 1u64;
            for (page, span, fill) in WRITE_OPS {
                let data = vec![fill; span * page_size];
                store.write(page * page_size as u64, state_num, &data).unwrap();
                store.flush().unwrap();
                state_num += 1;
            }
            store.close().unwrap();
        }

        let store = PageStore::open(&path, AccessType::ReadOnly).unwrap();
        let mut state_num = 1u64;
        for (page, span, fill) in WRITE_OPS {
            let mut buffer = vec![0u8; span * page_size];
            store
                .read_with(page * page_size as u64, state_num, &mut buffer, AccessFlags::READ)
                .unwrap();
            assert!(buffer.iter().all(|&b| b == fill), "state {state_num}");
            state_num += 1;
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reads_follow_flushes_without_close() {
        let path = store_path("flush-no-close");
        let page_size = 4096usize;
        PageStore::create(&path, page_size).unwrap();

        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let mut state_num = 1u64;
        for (page, span, fill) in WRITE_OPS {
            let data = vec![fill; span * page_size];
            store.write(page * page_size as u64, state_num, &data).unwrap();
            store.flush().unwrap();

            let reader = PageStore::open(&path, AccessType::ReadOnly).unwrap();
            let mut buffer = vec![0u8; span * page_size];
            reader
                .read_with(page * page_size as u64, state_num, &mut buffer, AccessFlags::READ)
                .unwrap();
            assert!(buffer.iter().all(|&b| b == fill), "state {state_num}");
            reader.close().unwrap();

            state_num += 1;
        }
        store.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn concurrent_writer_and_polling_reader() {
        let path = store_path("concurrent-reopen");
        let page_size = 4096usize;
        PageStore::create(&path, page_size).unwrap();

        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            let mut state_num = 1u64;
            for (page, span, fill) in WRITE_OPS {
                loop {
                    // a torn header read can race the writer's flush; retry
                    let Ok(store) = PageStore::open(&reader_path, AccessType::ReadOnly) else {
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    };
                    if store.max_state_num() >= state_num {
                        let mut buffer = vec![0u8; span * page_size];
                        store
                            .read_with(
                                page * page_size as u64,
                                state_num,
                                &mut buffer,
                                AccessFlags::READ,
                            )
                            .unwrap();
                        assert!(buffer.iter().all(|&b| b == fill), "state {state_num}");
                        break;
                    }
                    drop(store);
                    thread::sleep(Duration::from_millis(5));
                }
                state_num += 1;
            }
        });

        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let mut state_num = 1u64;
        for (page, span, fill) in WRITE_OPS {
            let data = vec![fill; span * page_size];
            store.write(page * page_size as u64, state_num, &data).unwrap();
            store.flush().unwrap();
            state_num += 1;
            thread::sleep(Duration::from_millis(10));
        }
        store.close().unwrap();
        reader.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn concurrent_writer_and_refreshing_reader() {
        let path = store_path("concurrent-refresh");
        let page_size = 4096usize;
        PageStore::create(&path, page_size).unwrap();

        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            let mut store = loop {
                // a torn header read can race the writer's flush; retry
                match PageStore::open(&reader_path, AccessType::ReadOnly) {
                    Ok(store) => break store,
                    Err(_) => thread::sleep(Duration::from_millis(5)),
                }
            };
            let mut state_num = 1u64;
            for (page, span, fill) in WRITE_OPS {
                loop {
                    store.refresh().unwrap();
                    if store.max_state_num() >= state_num {
                        let mut buffer = vec![0u8; span * page_size];
                        store
                            .read_with(
                                page * page_size as u64,
                                state_num,
                                &mut buffer,
                                AccessFlags::READ,
                            )
                            .unwrap();
                        assert!(buffer.iter().all(|&b| b == fill), "state {state_num}");
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                state_num += 1;
            }
            store.close().unwrap();
        });

        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let mut state_num = 1u64;
        for (page, span, fill) in WRITE_OPS {
            let data = vec![fill; span * page_size];
            store.write(page * page_size as u64, state_num, &data).unwrap();
            store.flush().unwrap();
            state_num += 1;
            thread::sleep(Duration::from_millis(10));
        }
        store.close().unwrap();
        reader.join().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn change_logs_enumerate_mutated_pages_per_state() {
        let path = store_path("change-logs");
        let page_size = 4096usize;
        PageStore::create(&path, page_size).unwrap();
        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();

        let data = vec![1u8; page_size];
        store.write(0, 1, &data).unwrap();
        store.write(page_size as u64, 1, &data).unwrap();
        store.write(0, 3, &data).unwrap();
        store.write(3 * page_size as u64, 7, &data).unwrap();

        let mut logs = Vec::new();
        store.fetch_change_logs(1, 5, |state, pages| {
            logs.push((state, pages.to_vec()));
        });
        assert_eq!(logs, vec![(1, vec![0, 1]), (3, vec![0])]);
        store.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn misaligned_offsets_are_rejected() {
        let path = store_path("misaligned");
        PageStore::create_default(&path).unwrap();
        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let data = vec![0u8; DEFAULT_PAGE_SIZE];
        match store.write(17, 1, &data) {
            Err(Error::Misaligned { offset: 17, .. }) => {}
            other => panic!("expected Misaligned, got {other:?}"),
        }
        match store.write(0, 0, &data) {
            Err(Error::Invalid(_)) => {}
            other => panic!("expected Invalid for the reserved state, got {other:?}"),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn small_updates_are_stored_as_diffs() {
        let path = store_path("diff-compression");
        let mut rng = StdRng::seed_from_u64(RAND_SEED);
        PageStore::create_default(&path).unwrap();
        let mut store = PageStore::open(&path, AccessType::ReadWrite).unwrap();
        let page_size = store.page_size();

        let base = random_page(&mut rng, page_size);
        store.write(0, 1, &base).unwrap();
        store.flush().unwrap();
        let after_base = std::fs::metadata(&path).unwrap().len();

        // a 16-byte change across 50 states should cost far less than 50 pages
        let mut update = base.clone();
        for state in 2..52u64 {
            let at = rng.gen_range(0..page_size - 16);
            rng.fill_bytes(&mut update[at..at + 16]);
            store.write(0, state, &update).unwrap();
        }
        store.flush().unwrap();
        let after_diffs = std::fs::metadata(&path).unwrap().len();
        assert!(
            after_diffs - after_base < (50 * page_size / 2) as u64,
            "diff records should stay well below full pages ({after_base} -> {after_diffs})"
        );

        // and every intermediate version must still reconstruct
        let mut read_buffer = vec![0u8; page_size];
        store.read(0, 1, &mut read_buffer).unwrap();
        assert_eq!(read_buffer, base);
        store.read(0, 51, &mut read_buffer).unwrap();
        assert_eq!(read_buffer, update);
        store.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}

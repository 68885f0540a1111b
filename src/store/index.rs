//! Sparse per-page version index.
//!
//! For every page the index keeps an ordered history of `(state, record
//! offset, kind)` entries. A read resolves the newest entry at or below the
//! query state and walks back to the nearest base record. The whole index is
//! serialized as an xxh3-checksummed checkpoint at the tail of each flush.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::store::record::RECORD_DIFF;

const CHECKPOINT_MAGIC: &[u8; 8] = b"db0chkpt";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub state: u64,
    pub offset: u64,
    pub kind: u8,
}

/// Per-page history table. Entries for one page are ordered by state; at
/// equal state the write order is preserved so that a base record precedes
/// the diffs layered on top of it.
#[derive(Default, Clone, Debug)]
pub struct SparseIndex {
    pages: BTreeMap<u32, Vec<IndexEntry>>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, page_no: u32, entry: IndexEntry) {
        let entries = self.pages.entry(page_no).or_default();
        // writes arrive in non-decreasing state order per page; fall back to
        // an ordered insert if they don't
        let at = entries.partition_point(|e| e.state <= entry.state);
        entries.insert(at, entry);
    }

    /// Index of the newest entry with `state <= query`, together with the
    /// page's entry list.
    pub fn lookup(&self, page_no: u32, state: u64) -> Option<(&[IndexEntry], usize)> {
        let entries = self.pages.get(&page_no)?;
        let upper = entries.partition_point(|e| e.state <= state);
        if upper == 0 {
            return None;
        }
        Some((entries.as_slice(), upper - 1))
    }

    /// Position of the nearest non-diff entry at or before `upto`.
    pub fn base_position(entries: &[IndexEntry], upto: usize) -> Result<usize> {
        entries[..=upto]
            .iter()
            .rposition(|e| e.kind != RECORD_DIFF)
            .ok_or(Error::Corruption("diff chain has no base record"))
    }

    /// Newest mutation state at or below `state` for the given page.
    pub fn find_mutation(&self, page_no: u32, state: u64) -> Option<u64> {
        self.lookup(page_no, state)
            .map(|(entries, at)| entries[at].state)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Collect the per-state change logs in `[from, to]`: the sorted sets of
    /// mutated page numbers.
    pub fn change_logs(&self, from: u64, to: u64) -> BTreeMap<u64, Vec<u32>> {
        let mut logs: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for (&page_no, entries) in self.pages.iter() {
            let mut last: Option<u64> = None;
            for entry in entries.iter() {
                if entry.state < from || entry.state > to {
                    continue;
                }
                // multiple records of one page within one state are a single
                // mutation
                if last == Some(entry.state) {
                    continue;
                }
                logs.entry(entry.state).or_default().push(page_no);
                last = Some(entry.state);
            }
        }
        logs
    }

    /// Serialize into a checksummed checkpoint blob.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(CHECKPOINT_MAGIC);
        out.write_u32::<LittleEndian>(self.pages.len() as u32).unwrap();
        for (&page_no, entries) in self.pages.iter() {
            out.write_u32::<LittleEndian>(page_no).unwrap();
            out.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
            for entry in entries.iter() {
                out.write_u64::<LittleEndian>(entry.state).unwrap();
                out.write_u64::<LittleEndian>(entry.offset).unwrap();
                out.push(entry.kind);
            }
        }
        let hash = xxh3_64(&out);
        out.write_u64::<LittleEndian>(hash).unwrap();
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHECKPOINT_MAGIC.len() + 4 + 8 {
            return Err(Error::Corruption("checkpoint truncated"));
        }
        let (body, hash_bytes) = bytes.split_at(bytes.len() - 8);
        if xxh3_64(body) != LittleEndian::read_u64(hash_bytes) {
            return Err(Error::Corruption("checkpoint checksum mismatch"));
        }
        if &body[..8] != CHECKPOINT_MAGIC {
            return Err(Error::Corruption("checkpoint magic mismatch"));
        }
        let mut pages = BTreeMap::new();
        let mut pos = 8usize;
        let page_count = read_u32(body, &mut pos)?;
        for _ in 0..page_count {
            let page_no = read_u32(body, &mut pos)?;
            let entry_count = read_u32(body, &mut pos)?;
            let mut entries = Vec::with_capacity(entry_count as usize);
            for _ in 0..entry_count {
                let state = read_u64(body, &mut pos)?;
                let offset = read_u64(body, &mut pos)?;
                let kind = *body
                    .get(pos)
                    .ok_or(Error::Corruption("checkpoint truncated"))?;
                pos += 1;
                entries.push(IndexEntry {
                    state,
                    offset,
                    kind,
                });
            }
            pages.insert(page_no, entries);
        }
        Ok(Self { pages })
    }
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let slice = bytes
        .get(*pos..*pos + 4)
        .ok_or(Error::Corruption("checkpoint truncated"))?;
    *pos += 4;
    Ok(LittleEndian::read_u32(slice))
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let slice = bytes
        .get(*pos..*pos + 8)
        .ok_or(Error::Corruption("checkpoint truncated"))?;
    *pos += 8;
    Ok(LittleEndian::read_u64(slice))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::{RECORD_BASE, RECORD_ZERO_DIFF};

    fn entry(state: u64, offset: u64, kind: u8) -> IndexEntry {
        IndexEntry {
            state,
            offset,
            kind,
        }
    }

    #[test]
    fn lookup_resolves_largest_state_below_query() {
        let mut index = SparseIndex::new();
        index.insert(0, entry(1, 100, RECORD_BASE));
        index.insert(0, entry(6, 200, RECORD_DIFF));
        index.insert(0, entry(11, 300, RECORD_DIFF));

        let (entries, at) = index.lookup(0, 7).unwrap();
        assert_eq!(entries[at].state, 6);
        assert!(index.lookup(0, 0).is_none());
        assert!(index.lookup(1, 7).is_none());
        assert_eq!(index.find_mutation(0, 100), Some(11));
    }

    #[test]
    fn base_position_walks_past_diffs() {
        let entries = vec![
            entry(1, 0, RECORD_ZERO_DIFF),
            entry(2, 10, RECORD_DIFF),
            entry(3, 20, RECORD_BASE),
            entry(4, 30, RECORD_DIFF),
        ];
        assert_eq!(SparseIndex::base_position(&entries, 3).unwrap(), 2);
        assert_eq!(SparseIndex::base_position(&entries, 1).unwrap(), 0);
        assert!(SparseIndex::base_position(&entries[1..2], 0).is_err());
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut index = SparseIndex::new();
        index.insert(3, entry(1, 64, RECORD_BASE));
        index.insert(3, entry(9, 4300, RECORD_DIFF));
        index.insert(17, entry(2, 180, RECORD_ZERO_DIFF));
        let bytes = index.serialize();
        let loaded = SparseIndex::deserialize(&bytes).unwrap();
        assert_eq!(loaded.lookup(3, 9).unwrap().0.len(), 2);
        assert_eq!(loaded.find_mutation(17, 5), Some(2));
    }

    #[test]
    fn checkpoint_detects_corruption() {
        let mut index = SparseIndex::new();
        index.insert(0, entry(1, 64, RECORD_BASE));
        let mut bytes = index.serialize();
        bytes[10] ^= 0xff;
        assert!(SparseIndex::deserialize(&bytes).is_err());
    }

    #[test]
    fn change_logs_group_pages_by_state() {
        let mut index = SparseIndex::new();
        index.insert(0, entry(1, 64, RECORD_BASE));
        index.insert(2, entry(1, 128, RECORD_BASE));
        index.insert(2, entry(5, 256, RECORD_DIFF));
        index.insert(9, entry(7, 512, RECORD_BASE));
        let logs = index.change_logs(1, 5);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[&1], vec![0, 2]);
        assert_eq!(logs[&5], vec![2]);
    }
}

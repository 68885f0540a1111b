//! On-disk record encoding for the page store data area.
//!
//! Every record is a 16-byte little-endian prefix followed by its payload. A
//! base record carries the raw page bytes; diff records carry a run count,
//! the alternating run lengths and the differing bytes only.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// Full page image.
pub const RECORD_BASE: u8 = 0;
/// Runs against the previous stored version of the page.
pub const RECORD_DIFF: u8 = 1;
/// Runs against the all-zero page.
pub const RECORD_ZERO_DIFF: u8 = 2;

/// Byte length of the fixed record prefix.
pub const RECORD_PREFIX_LEN: usize = 16;

#[derive(Clone, Copy, Debug)]
pub struct RecordPrefix {
    pub kind: u8,
    pub payload_len: u16,
    pub page_no: u32,
    pub state: u64,
}

impl RecordPrefix {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_PREFIX_LEN {
            return Err(Error::Corruption("record prefix truncated"));
        }
        let kind = bytes[0];
        if kind > RECORD_ZERO_DIFF {
            return Err(Error::Corruption("unknown record kind"));
        }
        Ok(Self {
            kind,
            payload_len: LittleEndian::read_u16(&bytes[2..4]),
            page_no: LittleEndian::read_u32(&bytes[4..8]),
            state: LittleEndian::read_u64(&bytes[8..16]),
        })
    }

    /// Payload length in bytes; base records always span a full page.
    pub fn payload_size(&self, page_size: usize) -> usize {
        if self.kind == RECORD_BASE {
            page_size
        } else {
            self.payload_len as usize
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.kind);
        out.push(0);
        out.write_u16::<LittleEndian>(self.payload_len).unwrap();
        out.write_u32::<LittleEndian>(self.page_no).unwrap();
        out.write_u64::<LittleEndian>(self.state).unwrap();
    }
}

/// Append a base record; returns the record's total encoded length.
pub fn append_base(out: &mut Vec<u8>, page_no: u32, state: u64, page: &[u8]) -> usize {
    let prefix = RecordPrefix {
        kind: RECORD_BASE,
        payload_len: 0,
        page_no,
        state,
    };
    prefix.write_to(out);
    out.extend_from_slice(page);
    RECORD_PREFIX_LEN + page.len()
}

/// Encoded payload length of a diff record, if it fits the u16 length field.
pub fn diff_payload_len(pattern: &[u16], diff_bytes: &[u8]) -> Option<u16> {
    let len = 2 + pattern.len() * 2 + diff_bytes.len();
    u16::try_from(len).ok()
}

/// Append a diff or zero-diff record; returns the record's encoded length.
///
/// The zero-base `(0, 0)` marker pair is carried by the record kind, not by
/// the stored runs.
pub fn append_diff(
    out: &mut Vec<u8>,
    kind: u8,
    page_no: u32,
    state: u64,
    pattern: &[u16],
    diff_bytes: &[u8],
    payload_len: u16,
) -> usize {
    debug_assert!(kind == RECORD_DIFF || kind == RECORD_ZERO_DIFF);
    let prefix = RecordPrefix {
        kind,
        payload_len,
        page_no,
        state,
    };
    prefix.write_to(out);
    out.write_u16::<LittleEndian>(pattern.len() as u16).unwrap();
    for &run in pattern {
        out.write_u16::<LittleEndian>(run).unwrap();
    }
    out.extend_from_slice(diff_bytes);
    RECORD_PREFIX_LEN + payload_len as usize
}

/// Split a diff payload into its run pattern and differing bytes.
pub fn parse_diff_payload(payload: &[u8]) -> Result<(Vec<u16>, &[u8])> {
    if payload.len() < 2 {
        return Err(Error::Corruption("diff payload truncated"));
    }
    let count = LittleEndian::read_u16(payload) as usize;
    let runs_end = 2 + count * 2;
    if payload.len() < runs_end {
        return Err(Error::Corruption("diff payload truncated"));
    }
    let mut pattern = Vec::with_capacity(count);
    for i in 0..count {
        pattern.push(LittleEndian::read_u16(&payload[2 + i * 2..]));
    }
    Ok((pattern, &payload[runs_end..]))
}

//! Byte-run diff codec used by the page store.
//!
//! A diff pattern is a sequence of u16 run lengths alternating between
//! differing and similar bytes, always starting with a differing run and
//! omitting the trailing similar run. Patterns computed against the all-zero
//! page lead with a `(0, 0)` marker pair.

use crate::error::{Error, Result};

/// Default cap on the number of runs in a single pattern.
pub const DEFAULT_MAX_RUNS: usize = u16::MAX as usize;

/// A normalized set of `[begin, end)` sub-ranges inside one page, used to
/// force byte ranges to be treated as modified even when their contents
/// happen to match the pre-image.
#[derive(Default, Clone, Debug)]
pub struct DiffRange {
    data: Vec<(u16, u16)>,
    overflow: bool,
    normalized: bool,
}

impl DiffRange {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            overflow: false,
            normalized: true,
        }
    }

    /// Record `[begin, end)` as modified. Once more than `max_len` raw ranges
    /// accumulate the whole range degrades to the overflow state.
    pub fn insert(&mut self, begin: u16, end: u16, max_len: usize) {
        if self.overflow {
            return;
        }
        if self.data.len() >= max_len {
            self.set_overflow();
            return;
        }
        self.data.push((begin, end));
        self.normalized = false;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.overflow = false;
        self.normalized = true;
    }

    /// Mark the entire range as modified.
    pub fn set_overflow(&mut self) {
        self.overflow = true;
        self.data.clear();
    }

    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    pub fn is_empty(&self) -> bool {
        !self.overflow && self.data.is_empty()
    }

    /// Borrow the normalized ranges. An overflowed range has no per-range
    /// representation; callers must check [`is_overflow`](Self::is_overflow)
    /// first.
    pub fn view(&mut self) -> Result<DiffRangeView<'_>> {
        if self.overflow {
            return Err(Error::Internal("diff range overflow"));
        }
        if !self.normalized {
            self.normalize();
        }
        Ok(DiffRangeView {
            ranges: Some(&self.data),
        })
    }

    /// Sort, de-duplicate and merge the collected ranges.
    fn normalize(&mut self) {
        self.data.sort_unstable();
        let mut merged: Vec<(u16, u16)> = Vec::with_capacity(self.data.len());
        for &(begin, end) in self.data.iter() {
            match merged.last_mut() {
                Some(last) if last.1 >= begin => last.1 = last.1.max(end),
                _ => merged.push((begin, end)),
            }
        }
        self.data = merged;
        self.normalized = true;
    }
}

/// Read-side borrow of a normalized [`DiffRange`]; an empty view forces
/// nothing.
#[derive(Default, Clone, Copy, Debug)]
pub struct DiffRangeView<'a> {
    ranges: Option<&'a [(u16, u16)]>,
}

impl<'a> DiffRangeView<'a> {
    pub fn len(&self) -> usize {
        self.ranges.map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<(u16, u16)> {
        self.ranges.and_then(|r| r.get(index)).copied()
    }

    /// Size in bytes of the range at `index`.
    pub fn size_of(&self, index: usize) -> u16 {
        self.get(index).map_or(0, |(begin, end)| end - begin)
    }
}

/// Compute the diff pattern between two equally sized buffers.
///
/// Returns `None` when the estimated diff volume exceeds `max_diff` (default:
/// 75 % of the buffer size) or the number of runs exceeds `max_runs`. An
/// update identical to the base yields an empty pattern.
pub fn get_diffs(
    base: &[u8],
    update: &[u8],
    max_diff: Option<usize>,
    max_runs: Option<usize>,
    forced: DiffRangeView,
) -> Option<Vec<u16>> {
    let size = base.len();
    debug_assert_eq!(size, update.len());
    debug_assert!(size <= u16::MAX as usize + 1);
    let max_diff = max_diff.unwrap_or((size * 3) >> 2);
    let max_runs = max_runs.unwrap_or(DEFAULT_MAX_RUNS);

    let mut result = Vec::new();
    let mut i = 0usize;
    // exact number of bytes that differ
    let mut diff_bytes = 0usize;
    // estimated space occupied by the encoded diff
    let mut diff_total = 0usize;
    let mut forced_idx = 0usize;
    let mut forced_start = forced.get(forced_idx).map(|(begin, _)| begin as usize);

    loop {
        if result.len() >= max_runs {
            return None;
        }
        let mut diff_len: u16 = 0;
        while i < size {
            if Some(i) == forced_start {
                let skip = forced.size_of(forced_idx) as usize;
                i += skip;
                diff_len += skip as u16;
                forced_idx += 1;
                forced_start = forced.get(forced_idx).map(|(begin, _)| begin as usize);
                continue;
            }
            if base[i] == update[i] {
                break;
            }
            i += 1;
            diff_len += 1;
        }

        // account for the administrative overhead of the run length
        diff_bytes += diff_len as usize;
        diff_total += diff_len as usize + 2;
        if diff_total > max_diff {
            return None;
        }
        if diff_len != 0 || i != size {
            result.push(diff_len);
        }
        if i == size {
            break;
        }
        let mut sim_len: u16 = 0;
        while i < size && base[i] == update[i] {
            if Some(i) == forced_start {
                break;
            }
            i += 1;
            sim_len += 1;
        }
        // the trailing similarity run is not included
        if i == size {
            break;
        }
        debug_assert!(sim_len > 0);
        result.push(sim_len);
    }
    if diff_bytes == 0 {
        result.clear();
    }
    Some(result)
}

/// Compute the diff pattern of `update` against the all-zero buffer. The
/// pattern leads with the `(0, 0)` zero-base marker.
pub fn get_zero_diffs(
    update: &[u8],
    max_diff: Option<usize>,
    max_runs: Option<usize>,
    forced: DiffRangeView,
) -> Option<Vec<u16>> {
    let size = update.len();
    debug_assert!(size <= u16::MAX as usize + 1);
    let max_diff = max_diff.unwrap_or((size * 3) >> 2);
    let max_runs = max_runs.unwrap_or(DEFAULT_MAX_RUNS);

    let mut result = vec![0u16, 0u16];
    let mut i = 0usize;
    let mut diff_total = 0usize;
    let mut forced_idx = 0usize;
    let mut forced_start = forced.get(forced_idx).map(|(begin, _)| begin as usize);

    loop {
        if result.len() >= max_runs {
            return None;
        }
        let mut diff_len: u16 = 0;
        // identify non-zero bytes or forced ranges
        while i < size {
            if Some(i) == forced_start {
                let skip = forced.size_of(forced_idx) as usize;
                i += skip;
                diff_len += skip as u16;
                forced_idx += 1;
                forced_start = forced.get(forced_idx).map(|(begin, _)| begin as usize);
                continue;
            }
            if update[i] == 0 {
                break;
            }
            i += 1;
            diff_len += 1;
        }

        diff_total += diff_len as usize + 2;
        if diff_total > max_diff {
            return None;
        }
        if diff_len != 0 || i != size {
            result.push(diff_len);
        }
        if i == size {
            break;
        }
        let mut sim_len: u16 = 0;
        while i < size && update[i] == 0 {
            if Some(i) == forced_start {
                break;
            }
            i += 1;
            sim_len += 1;
        }
        if i == size {
            break;
        }
        debug_assert!(sim_len > 0);
        result.push(sim_len);
    }
    Some(result)
}

/// Collect the differing bytes selected by `pattern` out of `update`.
pub fn collect_diff_bytes(update: &[u8], pattern: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    for (index, &run) in pattern.iter().enumerate() {
        let run = run as usize;
        if index % 2 == 0 {
            out.extend_from_slice(&update[pos..pos + run]);
        }
        pos += run;
    }
    out
}

/// Reconstruct an update by applying `pattern` + `diff_bytes` over `base`
/// into `out`. Run lengths that disagree with the buffer size are reported as
/// corruption.
pub fn apply_diffs(base: &[u8], pattern: &[u16], diff_bytes: &[u8], out: &mut [u8]) -> Result<()> {
    if base.len() != out.len() {
        return Err(Error::Corruption("diff base size mismatch"));
    }
    out.copy_from_slice(base);
    overlay_diffs(pattern, diff_bytes, out)
}

/// Reconstruct an update recorded against the all-zero page. The pattern must
/// carry the leading `(0, 0)` marker.
pub fn apply_zero_diffs(pattern: &[u16], diff_bytes: &[u8], out: &mut [u8]) -> Result<()> {
    let marker = pattern.get(..2).ok_or(Error::Corruption("zero-diff marker missing"))?;
    if marker != [0, 0] {
        return Err(Error::Corruption("zero-diff marker missing"));
    }
    out.fill(0);
    overlay_diffs(&pattern[2..], diff_bytes, out)
}

/// Overlay the differing runs of `pattern` onto `out` in place, treating the
/// current contents of `out` as the base image.
pub(crate) fn overlay_diffs(pattern: &[u16], diff_bytes: &[u8], out: &mut [u8]) -> Result<()> {
    let mut pos = 0usize;
    let mut src = 0usize;
    for (index, &run) in pattern.iter().enumerate() {
        let run = run as usize;
        if pos + run > out.len() {
            return Err(Error::Corruption("diff runs exceed page size"));
        }
        if index % 2 == 0 {
            if src + run > diff_bytes.len() {
                return Err(Error::Corruption("diff data shorter than its runs"));
            }
            out[pos..pos + run].copy_from_slice(&diff_bytes[src..src + run]);
            src += run;
        }
        pos += run;
    }
    if src != diff_bytes.len() {
        return Err(Error::Corruption("diff data longer than its runs"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(base: &[u8], update: &[u8]) -> Vec<u16> {
        let pattern =
            get_diffs(base, update, None, None, DiffRangeView::default()).expect("within the diff volume cap");
        let diff_bytes = collect_diff_bytes(update, &pattern);
        let mut out = vec![0u8; base.len()];
        apply_diffs(base, &pattern, &diff_bytes, &mut out).unwrap();
        assert_eq!(out, update);
        pattern
    }

    #[test]
    fn identical_buffers_have_empty_pattern() {
        let buf = [7u8; 256];
        let pattern = round_trip(&buf, &buf);
        assert!(pattern.is_empty());
    }

    #[test]
    fn single_span_produces_short_pattern() {
        let base = [0x11u8; 4096];
        let mut update = base;
        update[100..116].fill(0x22);
        let pattern = round_trip(&base, &update);
        // one leading zero-diff run, one similarity run, one 16-byte diff run
        assert_eq!(pattern, vec![0, 100, 16]);
        let total: usize = pattern.iter().map(|&r| r as usize).sum();
        assert!(total < 4096);
    }

    #[test]
    fn leading_diff_has_no_zero_run() {
        let base = [0u8; 64];
        let mut update = base;
        update[0] = 1;
        update[1] = 2;
        let pattern = round_trip(&base, &update);
        assert_eq!(pattern, vec![2]);
    }

    #[test]
    fn too_large_diff_is_rejected() {
        let base = [0u8; 4096];
        let update = [0xffu8; 4096];
        assert!(get_diffs(&base, &update, None, None, DiffRangeView::default()).is_none());
    }

    #[test]
    fn forced_ranges_are_always_diffed() {
        let base = [5u8; 128];
        let update = base;
        let mut ranges = DiffRange::new();
        ranges.insert(10, 20, 16);
        ranges.insert(15, 30, 16);
        let view = ranges.view().unwrap();
        let pattern = get_diffs(&base, &update, None, None, view).unwrap();
        // identical contents, but the merged [10, 30) range is forced out
        assert_eq!(pattern, vec![0, 10, 20]);
    }

    #[test]
    fn zero_base_round_trip() {
        let mut update = [0u8; 512];
        update[30..40].fill(9);
        update[100] = 1;
        let pattern =
            get_zero_diffs(&update, None, None, DiffRangeView::default()).expect("within the diff volume cap");
        assert_eq!(&pattern[..2], &[0, 0]);
        let diff_bytes = collect_diff_bytes(&update[..], &pattern[2..]);
        let mut out = [0xau8; 512];
        apply_zero_diffs(&pattern, &diff_bytes, &mut out).unwrap();
        assert_eq!(out, update);
    }

    #[test]
    fn corrupt_runs_are_detected() {
        let base = [0u8; 32];
        let mut out = [0u8; 32];
        let err = apply_diffs(&base, &[40], &[0; 40], &mut out).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        let err = apply_diffs(&base, &[4], &[0; 8], &mut out).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn diff_range_normalizes_overlaps() {
        let mut ranges = DiffRange::new();
        ranges.insert(50, 60, 8);
        ranges.insert(10, 20, 8);
        ranges.insert(18, 25, 8);
        let view = ranges.view().unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.get(0), Some((10, 25)));
        assert_eq!(view.get(1), Some((50, 60)));
    }

    #[test]
    fn diff_range_overflow_swallows_inserts() {
        let mut ranges = DiffRange::new();
        ranges.insert(0, 1, 1);
        ranges.insert(2, 3, 1);
        assert!(ranges.is_overflow());
        assert!(ranges.view().is_err());
    }
}

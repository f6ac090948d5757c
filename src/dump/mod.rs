
use arrayvec::ArrayVec;

use crate::error::{Error, Result};
use crate::gpu::{COUNTER_BYTES, MAX_CLOCK_DOMAINS, V5_PRFCNT_EN_HEADER};
use crate::map::{block_map_to_physical, EnableMap};
use crate::metadata::Metadata;

/// Structured counter values, one slot per metadata value.
///
/// Contents are whatever the caller last left there: [`dump_get`] only writes
/// enabled values, so zero the buffer first if a clean copy is needed.
#[derive(Clone, Debug)]
pub struct DumpBuffer<'m> {
    metadata: &'m Metadata,
    values: Vec<u64>,
    clk_cnt_buf: ArrayVec<u64, MAX_CLOCK_DOMAINS>,
}

impl<'m> DumpBuffer<'m> {
    /// Creates a zeroed buffer.
    pub fn new(metadata: &'m Metadata) -> Self {
        let mut clk_cnt_buf = ArrayVec::new();
        // `Metadata::create` caps the domain count at MAX_CLOCK_DOMAINS.
        for _ in 0..metadata.clk_cnt() {
            clk_cnt_buf.push(0);
        }
        Self {
            metadata,
            values: vec![0; metadata.value_cnt()],
            clk_cnt_buf,
        }
    }

    pub fn metadata(&self) -> &'m Metadata {
        self.metadata
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [u64] {
        &mut self.values
    }

    /// Value at logical `offset`.
    pub fn value(&self, offset: usize) -> Option<u64> {
        self.values.get(offset).copied()
    }

    /// Elapsed cycles per clock domain.
    pub fn clk_cnt(&self) -> &[u64] {
        &self.clk_cnt_buf
    }

    pub fn clk_cnt_mut(&mut self) -> &mut [u64] {
        &mut self.clk_cnt_buf
    }

    pub fn zero(&mut self) {
        self.values.fill(0);
        self.clk_cnt_buf.fill(0);
    }

    /// Zeroes every value and clock slot that `map` does not enable.
    pub fn zero_non_enabled(&mut self, map: &EnableMap<'_>) -> Result<()> {
        self.check_map(map)?;
        for (offset, value) in self.values.iter_mut().enumerate() {
            if !map.is_enabled(offset) {
                *value = 0;
            }
        }
        for (clk, cnt) in self.clk_cnt_buf.iter_mut().enumerate() {
            if !map.clk_enabled(clk) {
                *cnt = 0;
            }
        }
        Ok(())
    }

    fn check_map(&self, map: &EnableMap<'_>) -> Result<()> {
        if !map.is_for(self.metadata) {
            return Err(Error::MetadataMismatch);
        }
        Ok(())
    }
}

/// Reads counter `index` from a raw little-endian dump.
#[inline]
pub(crate) fn raw_counter(src: &[u8], index: usize) -> u32 {
    let at = index * COUNTER_BYTES;
    let mut bytes = [0; COUNTER_BYTES];
    bytes.copy_from_slice(&src[at..at + COUNTER_BYTES]);
    u32::from_le_bytes(bytes)
}

/// Writes counter `index` of a raw little-endian dump.
#[inline]
pub(crate) fn set_raw_counter(dst: &mut [u8], index: usize, value: u32) {
    let at = index * COUNTER_BYTES;
    dst[at..at + COUNTER_BYTES].copy_from_slice(&value.to_le_bytes());
}

/// Copies or accumulates the enabled values of a raw dump into `dst`.
///
/// `src` must be laid out by the metadata `dst` and `map` share, and be
/// exactly [`Metadata::dump_bytes`] long. Values that `map` does not enable
/// are left untouched.
///
/// With `accumulate`, counters are added with saturation at `u64::MAX`; header
/// values are state rather than counts and are always overwritten.
///
/// `pm_core_mask` is the shader core mask that was powered for this dump. A
/// shader core instance whose core is absent from it is skipped entirely, so
/// values accumulated while the core was up are preserved. `None` reads every
/// instance.
pub fn dump_get(
    dst: &mut DumpBuffer<'_>,
    src: &[u8],
    map: &EnableMap<'_>,
    pm_core_mask: Option<u64>,
    accumulate: bool,
) -> Result<()> {
    dst.check_map(map)?;
    let metadata = dst.metadata;
    let expected = metadata.dump_bytes();
    if src.len() != expected {
        return Err(Error::SizeMismatch {
            expected,
            actual: src.len(),
        });
    }

    for block in metadata.blocks() {
        let enabled = map.block(&block);
        if enabled == 0 {
            continue;
        }
        if let (Some(core), Some(mask)) = (block.core, pm_core_mask) {
            if mask & (1 << core) == 0 {
                continue;
            }
        }

        for val in 0..block.value_cnt() {
            if enabled & (1 << val) == 0 {
                continue;
            }
            let offset = block.value_offset + val;
            let raw = raw_counter(src, offset) as u64;
            let slot = &mut dst.values[offset];
            *slot = if accumulate && val >= block.hdr_cnt {
                slot.saturating_add(raw)
            } else {
                raw
            };
        }
    }

    Ok(())
}

/// Overwrites the PRFCNT_EN header of every block with the physical enable
/// mask `map` produces for that block.
///
/// A buffer handed on to other readers then describes the selection actually
/// used, whatever hardware wrote there.
pub fn patch_dump_headers(buf: &mut DumpBuffer<'_>, map: &EnableMap<'_>) -> Result<()> {
    buf.check_map(map)?;
    let metadata = buf.metadata;
    for block in metadata.blocks() {
        let prfcnt_en = block_map_to_physical(map.block(&block), 0);
        buf.values[block.value_offset + V5_PRFCNT_EN_HEADER] = prfcnt_en as u64;
    }
    Ok(())
}

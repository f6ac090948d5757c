//! Interface to the firmware sampling engine.
//!
//! The backend never touches registers or GPU memory directly. Everything goes
//! through a [`CsfInterface`], so the same backend drives real hardware or the
//! software engine in [`sim`].

use std::ptr::NonNull;

use crate::error::Result;
use crate::gpu::{GpuInfo, PhysicalSet};
use crate::map::PhysicalEnableMap;

pub mod sim;

/// GPU properties reported by the sampling engine.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CsfGpuInfo {
    /// Bytes of one counter sample.
    pub dump_size: usize,
    pub l2_count: usize,
    pub core_mask: u64,
    pub clk_cnt: u8,
}

impl CsfGpuInfo {
    pub fn topology(&self) -> GpuInfo {
        GpuInfo {
            l2_count: self.l2_count,
            core_mask: self.core_mask,
            clk_cnt: self.clk_cnt,
        }
    }
}

/// Counter collection settings handed to the engine on enable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsfEnable {
    pub fe_bm: u32,
    pub shader_bm: u32,
    pub tiler_bm: u32,
    pub mmu_l2_bm: u32,
    pub counter_set: PhysicalSet,
    /// Bit `n` enables the cycle counter of clock domain `n`.
    pub clk_enable_map: u64,
}

impl CsfEnable {
    /// Hardware settings for `phys`.
    ///
    /// Hardware only emits a block's headers when their group is selected, so
    /// any block kind with a counter enabled also gets the header group (bit 0).
    pub fn new(phys: &PhysicalEnableMap, counter_set: PhysicalSet) -> Self {
        let with_header = |bm: u32| if bm != 0 { bm | 1 } else { 0 };
        Self {
            fe_bm: with_header(phys.fe_bm),
            shader_bm: with_header(phys.shader_bm),
            tiler_bm: with_header(phys.tiler_bm),
            mmu_l2_bm: with_header(phys.mmu_l2_bm),
            counter_set,
            clk_enable_map: phys.clk_enable_map,
        }
    }
}

/// Capabilities the backend needs from the sampling engine.
///
/// Methods documented as needing the backend lock are only called by the
/// backend while it holds its state lock; implementations may rely on that to
/// serialise hardware state changes.
///
/// # Safety
///
/// The pointer returned by [`ring_buf_alloc`][Self::ring_buf_alloc] must be
/// valid for reads and writes of `buf_count * dump_size` bytes, and stay valid
/// and not be written by the CPU through other paths until the ring buffer is
/// passed to [`ring_buf_free`][Self::ring_buf_free]. The engine may only write
/// slots between the extract index plus the ring size and the insert index.
pub unsafe trait CsfInterface: Send + Sync {
    /// Opaque ring buffer handle.
    type RingBuf: Send;

    fn get_gpu_info(&self) -> CsfGpuInfo;

    /// Allocates a ring of `buf_count` samples. `buf_count` is a power of two.
    fn ring_buf_alloc(&self, buf_count: u32) -> Result<(NonNull<u8>, Self::RingBuf)>;

    /// Synchronises samples `first..last` (indices wrap) between GPU and CPU.
    ///
    /// With `for_cpu` the CPU cache is invalidated before reading, otherwise
    /// it is flushed after the CPU wrote to the samples.
    fn ring_buf_sync(&self, ring_buf: &Self::RingBuf, first: u32, last: u32, for_cpu: bool);

    fn ring_buf_free(&self, ring_buf: Self::RingBuf);

    fn timestamp_ns(&self) -> u64;

    /// Programs counter selection and starts sampling into `ring_buf`.
    ///
    /// Takes whatever serialisation the engine needs on its own.
    fn dump_enable(&self, ring_buf: &Self::RingBuf, enable: &CsfEnable) {
        self.dump_enable_nolock(ring_buf, enable)
    }

    /// Same as [`dump_enable`][Self::dump_enable], with the backend lock held.
    fn dump_enable_nolock(&self, ring_buf: &Self::RingBuf, enable: &CsfEnable);

    /// Stops sampling. Needs the backend lock.
    fn dump_disable(&self);

    /// Asks for one sample at the insert index. Needs the backend lock.
    ///
    /// Completion is reported later through the sample event.
    fn dump_request(&self);

    /// Returns `(extract, insert)`. Needs the backend lock.
    fn get_indexes(&self) -> (u32, u32);

    /// Needs the backend lock.
    fn set_extract_index(&self, extract_index: u32);

    /// Fills `cycle_counts[n]` for each domain `n` set in `clk_enable_map`.
    fn get_gpu_cycle_count(&self, cycle_counts: &mut [u64], clk_enable_map: u64);
}

//! Software sampling engine.
//!
//! Behaves like CSF firmware from the backend's point of view: samples land in
//! the ring at the insert index, with counter values masked by the programmed
//! selection and cleared after every sample. Events are not raised on their
//! own; whoever drives the simulation forwards them to the backend.
//!
//! ```rust
//! use gpu_hwcnt::csf_if::sim::SimInterface;
//! use gpu_hwcnt::csf_if::CsfInterface;
//! use gpu_hwcnt::gpu::GpuInfo;
//!
//! let info = GpuInfo { l2_count: 1, core_mask: 0b11, clk_cnt: 1 };
//! let sim = SimInterface::new(&info).unwrap();
//! assert_eq!(sim.get_gpu_info().dump_size, 5 * 64 * 4);
//! ```


mod arena;

use std::collections::HashMap;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use arena::Arena;
use parking_lot::Mutex;

use super::{CsfEnable, CsfGpuInfo, CsfInterface};
use crate::dump::set_raw_counter;
use crate::error::{Error, Result};
use crate::gpu::{CounterSet, GpuInfo, V5_PRFCNT_EN_HEADER};
use crate::map::{block_map_from_physical, PhysicalEnableMap};
use crate::metadata::{BlockInstance, Metadata};
use crate::ring::{fill, next_index};

/// Handle to a simulated ring buffer.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SimRingBuf(u32);

/// A recorded [`CsfInterface::ring_buf_sync`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOp {
    pub first: u32,
    pub last: u32,
    pub for_cpu: bool,
}

pub struct SimInterface {
    info: CsfGpuInfo,
    blocks: Vec<BlockInstance>,
    start: Instant,
    extract: AtomicU32,
    insert: AtomicU32,
    cycles: AtomicU64,
    engine: Mutex<Engine>,
}

#[derive(Default)]
struct Engine {
    next_id: u32,
    arenas: HashMap<u32, (Arena, u32)>,
    // Ring being sampled into and the selection it was enabled with.
    active: Option<(u32, CsfEnable)>,
    pending: Vec<u32>,
    lost: u32,
    syncs: Vec<SyncOp>,
}

impl SimInterface {
    pub fn new(info: &GpuInfo) -> Result<Self> {
        // The raw layout has the same shape for every counter set.
        let (metadata, dump_size) = Metadata::create(info, CounterSet::Primary)?;
        let blocks = metadata.blocks().collect();
        Ok(Self {
            info: CsfGpuInfo {
                dump_size,
                l2_count: info.l2_count,
                core_mask: info.core_mask,
                clk_cnt: info.clk_cnt,
            },
            blocks,
            start: Instant::now(),
            extract: AtomicU32::new(0),
            insert: AtomicU32::new(0),
            cycles: AtomicU64::new(0),
            engine: Mutex::new(Engine {
                pending: vec![0; metadata.value_cnt()],
                ..Default::default()
            }),
        })
    }

    /// Adds `delta` to the live counter at logical `offset`.
    pub fn add_counter(&self, offset: usize, delta: u32) {
        let mut engine = self.engine.lock();
        if let Some(value) = engine.pending.get_mut(offset) {
            *value = value.saturating_add(delta);
        }
    }

    pub fn advance_cycles(&self, cycles: u64) {
        self.cycles.fetch_add(cycles, Ordering::Relaxed);
    }

    /// Takes one sample as the firmware's periodic sampling would.
    ///
    /// Returns whether a slot was written. With the ring full the sample is
    /// dropped and counted as lost, as is a sample taken while disabled.
    pub fn sample(&self) -> bool {
        let mut engine = self.engine.lock();
        let Some((id, enable)) = engine.active.clone() else {
            return false;
        };
        let Some(buf_count) = engine.arenas.get(&id).map(|(_, n)| *n) else {
            return false;
        };

        let extract = self.extract.load(Ordering::Acquire);
        let insert = self.insert.load(Ordering::Relaxed);
        if fill(extract, insert, buf_count) >= buf_count {
            engine.lost += 1;
            log::trace!("simulated sample dropped, ring full at insert {}", insert);
            return false;
        }

        let slot = self.write_sample(&engine, id, insert, &enable);
        if let Some(slot) = slot {
            log::trace!("simulated sample written to slot {}", slot);
        }
        engine.pending.fill(0);
        self.insert
            .store(next_index(insert, buf_count), Ordering::Release);
        true
    }

    /// Samples dropped for lack of space or while disabled.
    pub fn lost_samples(&self) -> u32 {
        self.engine.lock().lost
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.lock().active.is_some()
    }

    /// Selection the engine is currently sampling with.
    pub fn enable_settings(&self) -> Option<CsfEnable> {
        self.engine.lock().active.as_ref().map(|(_, e)| e.clone())
    }

    /// Every sync call so far, oldest first.
    pub fn syncs(&self) -> Vec<SyncOp> {
        self.engine.lock().syncs.clone()
    }

    /// Number of ring buffers currently allocated.
    pub fn live_ring_bufs(&self) -> usize {
        self.engine.lock().arenas.len()
    }

    fn write_sample(
        &self,
        engine: &Engine,
        id: u32,
        insert: u32,
        enable: &CsfEnable,
    ) -> Option<u32> {
        let dump_size = self.info.dump_size;
        let (arena, buf_count) = engine.arenas.get(&id)?;
        let slot = insert & (buf_count - 1);
        let at = slot as usize * dump_size;
        // Slots past the extract index belong to the engine.
        let dst =
            unsafe { slice::from_raw_parts_mut(arena.as_ptr().as_ptr().add(at), dump_size) };

        let selection = physical_selection(enable);
        for block in &self.blocks {
            let bm = selection.mask_for(block.ty).unwrap_or(0);
            let (enabled, _) = block_map_from_physical(bm);
            for val in 0..block.value_cnt() {
                let offset = block.value_offset + val;
                let value = if bm == 0 {
                    0
                } else if val == V5_PRFCNT_EN_HEADER {
                    bm
                } else if val < block.hdr_cnt {
                    0
                } else if enabled & (1 << val) != 0 {
                    engine.pending[offset]
                } else {
                    0
                };
                set_raw_counter(dst, offset, value);
            }
        }
        Some(slot)
    }
}

fn physical_selection(enable: &CsfEnable) -> PhysicalEnableMap {
    PhysicalEnableMap {
        fe_bm: enable.fe_bm,
        shader_bm: enable.shader_bm,
        tiler_bm: enable.tiler_bm,
        mmu_l2_bm: enable.mmu_l2_bm,
        clk_enable_map: enable.clk_enable_map,
    }
}

unsafe impl CsfInterface for SimInterface {
    type RingBuf = SimRingBuf;

    fn get_gpu_info(&self) -> CsfGpuInfo {
        self.info.clone()
    }

    fn ring_buf_alloc(&self, buf_count: u32) -> Result<(NonNull<u8>, SimRingBuf)> {
        if !buf_count.is_power_of_two() {
            return Err(Error::NotPowerOfTwo(buf_count));
        }
        let len = (buf_count as usize)
            .checked_mul(self.info.dump_size)
            .ok_or(Error::Alloc("ring buffer size overflow"))?;
        let arena = Arena::new(len)?;
        let base = arena.as_ptr();
        log::trace!("simulated ring buffer mapped, {} bytes", arena.len());

        let mut engine = self.engine.lock();
        let id = engine.next_id;
        engine.next_id += 1;
        engine.arenas.insert(id, (arena, buf_count));
        self.extract.store(0, Ordering::Relaxed);
        self.insert.store(0, Ordering::Relaxed);
        Ok((base, SimRingBuf(id)))
    }

    fn ring_buf_sync(&self, _ring_buf: &SimRingBuf, first: u32, last: u32, for_cpu: bool) {
        // Host memory is coherent, only record the call.
        self.engine.lock().syncs.push(SyncOp {
            first,
            last,
            for_cpu,
        });
    }

    fn ring_buf_free(&self, ring_buf: SimRingBuf) {
        let mut engine = self.engine.lock();
        if engine.active.as_ref().is_some_and(|(id, _)| *id == ring_buf.0) {
            engine.active = None;
        }
        engine.arenas.remove(&ring_buf.0);
    }

    fn timestamp_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn dump_enable_nolock(&self, ring_buf: &SimRingBuf, enable: &CsfEnable) {
        let mut engine = self.engine.lock();
        engine.pending.fill(0);
        engine.active = Some((ring_buf.0, enable.clone()));
    }

    fn dump_disable(&self) {
        self.engine.lock().active = None;
    }

    fn dump_request(&self) {
        if !self.sample() {
            log::warn!("simulated dump request could not be served");
        }
    }

    fn get_indexes(&self) -> (u32, u32) {
        let extract = self.extract.load(Ordering::Relaxed);
        let insert = self.insert.load(Ordering::Acquire);
        (extract, insert)
    }

    fn set_extract_index(&self, extract_index: u32) {
        self.extract.store(extract_index, Ordering::Release);
    }

    fn get_gpu_cycle_count(&self, cycle_counts: &mut [u64], clk_enable_map: u64) {
        let cycles = self.cycles.load(Ordering::Relaxed);
        for (clk, count) in cycle_counts.iter_mut().enumerate() {
            if clk < 64 && clk_enable_map & (1 << clk) != 0 {
                *count = cycles;
            }
        }
    }
}

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio_test::task;
use tokio_test::{assert_pending, assert_ready, assert_ready_err};

use super::{Backend, DumpState, EnableState};
use crate::config::Opts;
use crate::csf_if::sim::{SimInterface, SimRingBuf};
use crate::csf_if::{CsfEnable, CsfGpuInfo, CsfInterface};
use crate::dump::DumpBuffer;
use crate::error::{Error, Result};
use crate::gpu::{CounterSet, GpuInfo};
use crate::map::EnableMap;
use crate::metadata::Metadata;

// Delegates to a shared simulator, with knobs to misreport.
struct Relay {
    sim: Arc<SimInterface>,
    dump_size_delta: usize,
    bad_indexes: AtomicBool,
    // Added to reported indexes, like an engine with free-running counters.
    index_offset: AtomicU32,
    cycle_reads: AtomicU32,
}

impl Relay {
    fn new(sim: &Arc<SimInterface>, dump_size_delta: usize) -> Self {
        Self {
            sim: sim.clone(),
            dump_size_delta,
            bad_indexes: AtomicBool::new(false),
            index_offset: AtomicU32::new(0),
            cycle_reads: AtomicU32::new(0),
        }
    }
}

unsafe impl CsfInterface for Relay {
    type RingBuf = SimRingBuf;

    fn get_gpu_info(&self) -> CsfGpuInfo {
        let mut info = self.sim.get_gpu_info();
        info.dump_size += self.dump_size_delta;
        info
    }

    fn ring_buf_alloc(&self, buf_count: u32) -> Result<(NonNull<u8>, SimRingBuf)> {
        self.sim.ring_buf_alloc(buf_count)
    }

    fn ring_buf_sync(&self, ring_buf: &SimRingBuf, first: u32, last: u32, for_cpu: bool) {
        self.sim.ring_buf_sync(ring_buf, first, last, for_cpu)
    }

    fn ring_buf_free(&self, ring_buf: SimRingBuf) {
        self.sim.ring_buf_free(ring_buf)
    }

    fn timestamp_ns(&self) -> u64 {
        self.sim.timestamp_ns()
    }

    fn dump_enable_nolock(&self, ring_buf: &SimRingBuf, enable: &CsfEnable) {
        self.sim.dump_enable_nolock(ring_buf, enable)
    }

    fn dump_disable(&self) {
        self.sim.dump_disable()
    }

    fn dump_request(&self) {
        self.sim.dump_request()
    }

    fn get_indexes(&self) -> (u32, u32) {
        if self.bad_indexes.load(Ordering::Relaxed) {
            // More filled slots than the ring holds.
            return (0, 7);
        }
        let offset = self.index_offset.load(Ordering::Relaxed);
        let (extract, insert) = self.sim.get_indexes();
        (extract.wrapping_add(offset), insert.wrapping_add(offset))
    }

    fn set_extract_index(&self, extract_index: u32) {
        let offset = self.index_offset.load(Ordering::Relaxed);
        self.sim.set_extract_index(extract_index.wrapping_sub(offset))
    }

    fn get_gpu_cycle_count(&self, cycle_counts: &mut [u64], clk_enable_map: u64) {
        self.cycle_reads.fetch_add(1, Ordering::Relaxed);
        self.sim.get_gpu_cycle_count(cycle_counts, clk_enable_map)
    }
}

fn sim() -> Arc<SimInterface> {
    let info = GpuInfo {
        l2_count: 1,
        core_mask: 0b101,
        clk_cnt: 1,
    };
    Arc::new(SimInterface::new(&info).unwrap())
}

fn backend(sim: &Arc<SimInterface>) -> Backend<Relay> {
    let relay = Relay::new(sim, 0);
    let opts = Opts {
        ring_buf_cnt: 4,
        ..Default::default()
    };
    let mut backend = Backend::create(relay, opts).unwrap();
    backend.metadata_init().unwrap();
    backend
}

fn all(metadata: &Metadata) -> EnableMap<'_> {
    let mut map = EnableMap::new(metadata);
    map.enable_all();
    map
}

fn enabled(backend: &Backend<Relay>) -> EnableMap<'_> {
    let map = all(backend.metadata().unwrap());
    backend.dump_enable(&map).unwrap();
    backend.on_prfcnt_enable();
    map
}

fn dump(backend: &Backend<Relay>) {
    backend.dump_request().unwrap();
    backend.on_prfcnt_sample();
    tokio_test::block_on(backend.dump_wait()).unwrap();
}

#[test]
fn test_create_validates_opts() {
    let relay = Relay::new(&sim(), 0);
    let opts = Opts {
        ring_buf_cnt: 6,
        ..Default::default()
    };
    assert!(matches!(
        Backend::create(relay, opts),
        Err(Error::NotPowerOfTwo(6))
    ));
}

#[test]
fn test_metadata_lifecycle() {
    let sim = sim();
    let relay = Relay::new(&sim, 0);
    let opts = Opts {
        counter_set: CounterSet::Secondary,
        ..Default::default()
    };
    let mut backend = Backend::create(relay, opts).unwrap();
    assert!(matches!(backend.metadata(), Err(Error::NoMetadata)));
    assert!(matches!(backend.dump_request(), Err(Error::NoMetadata)));

    backend.metadata_init().unwrap();
    let metadata = backend.metadata().unwrap();
    assert_eq!(metadata.counter_set(), CounterSet::Secondary);
    assert_eq!(metadata.dump_bytes(), sim.get_gpu_info().dump_size);

    backend.metadata_term().unwrap();
    assert!(backend.metadata().is_err());
}

#[test]
fn test_metadata_init_size_mismatch() {
    let relay = Relay::new(&sim(), 4);
    let mut backend = Backend::create(relay, Opts::default()).unwrap();
    let err = backend.metadata_init().unwrap_err();
    assert!(matches!(
        err,
        Error::SizeMismatch { expected, actual } if actual == expected + 4
    ));
    assert!(backend.metadata().is_err());
}

#[test]
fn test_enable_handshake() {
    let sim = sim();
    let backend = backend(&sim);
    let map = all(backend.metadata().unwrap());

    backend.dump_enable(&map).unwrap();
    assert_eq!(backend.enable_state(), EnableState::TransitioningToEnabled);
    assert!(sim.is_enabled());
    assert_eq!(sim.live_ring_bufs(), 1);
    assert!(matches!(
        backend.dump_request(),
        Err(Error::InvalidState { op: "dump_request", .. })
    ));
    assert!(matches!(
        backend.dump_enable(&map),
        Err(Error::InvalidState { op: "dump_enable", .. })
    ));

    backend.on_prfcnt_enable();
    assert_eq!(backend.enable_state(), EnableState::Enabled);

    backend.dump_disable().unwrap();
    assert_eq!(backend.enable_state(), EnableState::TransitioningToDisabled);
    assert!(!sim.is_enabled());
    assert_eq!(sim.live_ring_bufs(), 1);

    backend.on_prfcnt_disable();
    assert_eq!(backend.enable_state(), EnableState::Disabled);
    assert_eq!(sim.live_ring_bufs(), 0);
    backend.dump_disable().unwrap();
}

#[test]
fn test_enable_nolock_with_held_lock() {
    let sim = sim();
    let backend = backend(&sim);
    let map = all(backend.metadata().unwrap());

    let mut guard = backend.lock();
    backend.dump_enable_nolock(&mut guard, &map).unwrap();
    assert_eq!(guard.enable_state(), EnableState::TransitioningToEnabled);
    assert_eq!(guard.dump_state(), DumpState::Idle);
    drop(guard);

    let enable = sim.enable_settings().unwrap();
    assert_eq!(enable.fe_bm, 0xffff);
    assert_eq!(enable.clk_enable_map, 1);
}

#[test]
fn test_enable_programs_header_group() {
    let sim = sim();
    let backend = backend(&sim);
    let metadata = backend.metadata().unwrap();
    let mut map = EnableMap::new(metadata);
    // A tiler counter in the second group of four.
    map.enable(64 + 5);
    backend.dump_enable(&map).unwrap();

    let enable = sim.enable_settings().unwrap();
    assert_eq!(enable.tiler_bm, 0b11);
    assert_eq!(enable.fe_bm, 0);
    assert_eq!(enable.shader_bm, 0);
    assert_eq!(enable.clk_enable_map, 0);
}

#[test]
fn test_enable_rejects_foreign_map() {
    let sim = sim();
    let backend = backend(&sim);
    let info = sim.get_gpu_info().topology();
    let (other, _) = Metadata::create(&info, CounterSet::Primary).unwrap();
    let map = all(&other);
    assert!(matches!(
        backend.dump_enable(&map),
        Err(Error::MetadataMismatch)
    ));
    assert_eq!(sim.live_ring_bufs(), 0);
}

#[test]
fn test_dump_values_and_cycles() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);
    let metadata = backend.metadata().unwrap();

    sim.add_counter(4, 10);
    sim.add_counter(2 * 64 + 20, 3);
    sim.advance_cycles(500);
    let requested = backend.dump_request().unwrap();
    assert_eq!(backend.dump_state(), DumpState::Requested);
    backend.on_prfcnt_sample();
    assert_eq!(backend.dump_state(), DumpState::Completed);
    tokio_test::block_on(backend.dump_wait()).unwrap();
    assert!(backend.timestamp_ns() >= requested);

    let mut buf = DumpBuffer::new(metadata);
    backend.dump_get(&mut buf, &map, false).unwrap();
    assert_eq!(buf.value(4), Some(10));
    assert_eq!(buf.value(2 * 64 + 20), Some(3));
    assert_eq!(buf.value(5), Some(0));
    assert_eq!(buf.clk_cnt(), &[500]);
    // The sample header reports what was programmed.
    assert_eq!(buf.value(2), Some(0xffff));
}

#[test]
fn test_dumps_cover_consecutive_intervals() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);
    let metadata = backend.metadata().unwrap();

    // Periodic samples between requests are folded into the next dump.
    sim.add_counter(4, 1);
    sim.sample();
    sim.add_counter(4, 2);
    sim.sample();
    backend.on_prfcnt_sample();
    sim.add_counter(4, 4);
    dump(&backend);

    let mut buf = DumpBuffer::new(metadata);
    backend.dump_get(&mut buf, &map, false).unwrap();
    assert_eq!(buf.value(4), Some(7));

    sim.add_counter(4, 8);
    sim.advance_cycles(20);
    dump(&backend);
    backend.dump_get(&mut buf, &map, true).unwrap();
    assert_eq!(buf.value(4), Some(15));
    assert_eq!(buf.clk_cnt(), &[20]);

    let mut fresh = DumpBuffer::new(metadata);
    backend.dump_get(&mut fresh, &map, false).unwrap();
    assert_eq!(fresh.value(4), Some(8));
}

#[test]
fn test_disabled_counters_not_reported() {
    let sim = sim();
    let backend = backend(&sim);
    let metadata = backend.metadata().unwrap();
    let mut map = EnableMap::new(metadata);
    map.enable(64 + 4);
    backend.dump_enable(&map).unwrap();
    backend.on_prfcnt_enable();

    sim.add_counter(4, 9);
    sim.add_counter(64 + 4, 5);
    sim.add_counter(64 + 8, 6);
    dump(&backend);

    let mut all_values = all(metadata);
    all_values.set_clk(0);
    let mut buf = DumpBuffer::new(metadata);
    backend.dump_get(&mut buf, &all_values, false).unwrap();
    assert_eq!(buf.value(4), Some(0));
    assert_eq!(buf.value(64 + 4), Some(5));
    assert_eq!(buf.value(64 + 8), Some(0));
}

#[test]
fn test_single_outstanding_request() {
    let sim = sim();
    let backend = backend(&sim);
    enabled(&backend);

    backend.dump_request().unwrap();
    assert!(matches!(
        backend.dump_request(),
        Err(Error::InvalidState {
            op: "dump_request",
            state: "Requested"
        })
    ));

    let mut wait = task::spawn(backend.dump_wait());
    assert_pending!(wait.poll());
    backend.on_prfcnt_sample();
    assert!(wait.is_woken());
    assert_ready!(wait.poll()).unwrap();
}

#[test]
fn test_dump_get_before_completion() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);
    let mut buf = DumpBuffer::new(backend.metadata().unwrap());

    assert!(matches!(
        backend.dump_get(&mut buf, &map, false),
        Err(Error::DumpNotReady)
    ));
    assert!(matches!(
        tokio_test::block_on(backend.dump_wait()),
        Err(Error::DumpNotReady)
    ));
    backend.dump_request().unwrap();
    assert!(matches!(
        backend.dump_get(&mut buf, &map, false),
        Err(Error::DumpNotReady)
    ));
}

#[test]
fn test_protected_mode_defers_request() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);

    backend.protm_entered();
    sim.add_counter(4, 6);
    sim.sample();
    backend.on_prfcnt_sample();
    // Nothing is read while in protected mode.
    assert_eq!(sim.get_indexes(), (0, 1));

    backend.dump_request().unwrap();
    assert_eq!(backend.dump_state(), DumpState::Deferred);
    assert_eq!(sim.get_indexes(), (0, 1));
    let mut wait = task::spawn(backend.dump_wait());
    assert_pending!(wait.poll());

    sim.add_counter(4, 1);
    backend.protm_exited();
    assert_eq!(backend.dump_state(), DumpState::Requested);
    assert_eq!(sim.get_indexes(), (1, 2));

    backend.on_prfcnt_sample();
    assert!(wait.is_woken());
    assert_ready!(wait.poll()).unwrap();

    let mut buf = DumpBuffer::new(backend.metadata().unwrap());
    backend.dump_get(&mut buf, &map, false).unwrap();
    assert_eq!(buf.value(4), Some(7));
}

#[test]
fn test_threshold_extracts() {
    let sim = sim();
    let backend = backend(&sim);
    enabled(&backend);

    for _ in 0..3 {
        sim.sample();
    }
    assert_eq!(sim.get_indexes(), (0, 3));
    backend.on_prfcnt_threshold();
    assert_eq!(sim.get_indexes(), (3, 3));
    assert_eq!(backend.dump_state(), DumpState::Idle);

    let syncs = sim.syncs();
    assert_eq!(syncs.len(), 2);
    assert!(syncs[0].for_cpu);
    assert!(!syncs[1].for_cpu);
    assert_eq!((syncs[0].first, syncs[0].last), (0, 3));
}

#[test]
fn test_free_running_indexes() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);
    // Reported indexes cross the top of the u32 range.
    backend
        .iface()
        .index_offset
        .store(0u32.wrapping_sub(4), Ordering::Relaxed);

    for _ in 0..3 {
        sim.add_counter(4, 1);
        sim.sample();
    }
    backend.on_prfcnt_threshold();
    assert_eq!(sim.get_indexes(), (3, 3));

    for _ in 0..2 {
        sim.add_counter(4, 1);
        sim.sample();
    }
    assert_eq!(backend.iface().get_indexes(), (u32::MAX, 1));
    backend.on_prfcnt_threshold();
    assert_eq!(sim.get_indexes(), (5, 5));

    dump(&backend);
    let mut buf = DumpBuffer::new(backend.metadata().unwrap());
    backend.dump_get(&mut buf, &map, false).unwrap();
    assert_eq!(buf.value(4), Some(5));
}

#[test]
fn test_request_with_full_ring() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);

    for _ in 0..4 {
        sim.add_counter(4, 1);
        sim.sample();
    }
    assert!(!sim.sample());
    dump(&backend);
    assert_eq!(sim.get_indexes(), (5, 5));

    let mut buf = DumpBuffer::new(backend.metadata().unwrap());
    backend.dump_get(&mut buf, &map, false).unwrap();
    assert_eq!(buf.value(4), Some(4));
}

#[test]
fn test_overflow_reported_until_cleared() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);
    let mut buf = DumpBuffer::new(backend.metadata().unwrap());

    dump(&backend);
    backend.dump_get(&mut buf, &map, false).unwrap();

    backend.on_prfcnt_overflow();
    backend.on_prfcnt_overflow();
    let err = backend.dump_get(&mut buf, &map, false).unwrap_err();
    assert!(matches!(
        err,
        Error::SamplesLost {
            extract: 1,
            insert: 1,
            overflows: 2
        }
    ));
    dump(&backend);
    assert!(matches!(
        backend.dump_get(&mut buf, &map, false),
        Err(Error::SamplesLost { .. })
    ));

    backend.dump_clear().unwrap();
    assert_eq!(backend.dump_state(), DumpState::Idle);
    sim.add_counter(4, 2);
    dump(&backend);
    backend.dump_get(&mut buf, &map, false).unwrap();
    assert_eq!(buf.value(4), Some(2));
}

#[test]
fn test_clear_discards_pending_samples() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);

    sim.add_counter(4, 100);
    sim.sample();
    backend.dump_clear().unwrap();
    assert_eq!(sim.get_indexes(), (1, 1));

    sim.add_counter(4, 1);
    dump(&backend);
    let mut buf = DumpBuffer::new(backend.metadata().unwrap());
    backend.dump_get(&mut buf, &map, false).unwrap();
    assert_eq!(buf.value(4), Some(1));
}

#[test]
fn test_disable_abandons_request_and_drains() {
    let sim = sim();
    let backend = backend(&sim);
    enabled(&backend);

    backend.dump_request().unwrap();
    let mut wait = task::spawn(backend.dump_wait());
    assert_pending!(wait.poll());

    backend.dump_disable().unwrap();
    assert!(wait.is_woken());
    assert!(matches!(
        assert_ready!(wait.poll()),
        Err(Error::DumpNotReady)
    ));

    backend.on_prfcnt_disable();
    assert_eq!(sim.get_indexes(), (1, 1));
    assert_eq!(sim.live_ring_bufs(), 0);
}

#[test]
fn test_disable_in_protected_mode_waits_for_exit() {
    let sim = sim();
    let backend = backend(&sim);
    enabled(&backend);

    sim.add_counter(4, 2);
    sim.sample();
    backend.dump_disable().unwrap();
    backend.protm_entered();
    backend.on_prfcnt_disable();
    assert_eq!(backend.enable_state(), EnableState::TransitioningToDisabled);
    assert_eq!(sim.get_indexes(), (0, 1));
    assert_eq!(sim.live_ring_bufs(), 1);

    backend.protm_exited();
    assert_eq!(backend.enable_state(), EnableState::Disabled);
    assert_eq!(sim.get_indexes(), (1, 1));
    assert_eq!(sim.live_ring_bufs(), 0);
}

#[test]
fn test_unrecoverable_then_reset() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);
    let mut buf = DumpBuffer::new(backend.metadata().unwrap());

    backend.dump_request().unwrap();
    let mut wait = task::spawn(backend.dump_wait());
    assert_pending!(wait.poll());

    backend.on_unrecoverable_error();
    assert_eq!(backend.enable_state(), EnableState::UnrecoverableError);
    assert!(wait.is_woken());
    assert_ready_err!(wait.poll());

    assert!(matches!(backend.dump_request(), Err(Error::Unrecoverable)));
    assert!(matches!(
        backend.dump_get(&mut buf, &map, false),
        Err(Error::Unrecoverable)
    ));
    assert!(matches!(backend.dump_clear(), Err(Error::Unrecoverable)));
    assert!(matches!(backend.dump_disable(), Err(Error::Unrecoverable)));
    assert!(matches!(backend.dump_enable(&map), Err(Error::Unrecoverable)));
    // Events are ignored too.
    let indexes = sim.get_indexes();
    backend.on_prfcnt_sample();
    assert_eq!(sim.get_indexes(), indexes);

    backend.on_before_reset();
    assert_eq!(backend.enable_state(), EnableState::Disabled);
    assert_eq!(sim.live_ring_bufs(), 0);
    backend.dump_clear().unwrap();

    backend.dump_enable(&map).unwrap();
    backend.on_prfcnt_enable();
    dump(&backend);
    backend.dump_get(&mut buf, &map, false).unwrap();
}

#[test]
fn test_index_race_is_unrecoverable() {
    let sim = sim();
    let backend = backend(&sim);
    enabled(&backend);

    sim.sample();
    backend.iface().bad_indexes.store(true, Ordering::Relaxed);
    backend.on_prfcnt_sample();
    assert_eq!(backend.enable_state(), EnableState::UnrecoverableError);

    backend.iface().bad_indexes.store(false, Ordering::Relaxed);
    backend.on_before_reset();
    assert_eq!(backend.enable_state(), EnableState::Disabled);
}

#[test]
fn test_failed_request_keeps_cycle_window() {
    let sim = sim();
    let backend = backend(&sim);
    let map = enabled(&backend);
    let reads = &backend.iface().cycle_reads;

    backend.iface().bad_indexes.store(true, Ordering::Relaxed);
    let before = reads.load(Ordering::Relaxed);
    assert!(matches!(backend.dump_request(), Err(Error::Unrecoverable)));
    assert_eq!(reads.load(Ordering::Relaxed), before);

    backend.iface().bad_indexes.store(false, Ordering::Relaxed);
    backend.on_before_reset();
    backend.dump_enable(&map).unwrap();
    backend.on_prfcnt_enable();
    let before = reads.load(Ordering::Relaxed);
    backend.dump_request().unwrap();
    assert_eq!(reads.load(Ordering::Relaxed), before + 1);
}

#[test]
fn test_drop_releases_ring() {
    let sim = sim();
    let backend = backend(&sim);
    enabled(&backend);
    assert!(sim.is_enabled());

    backend.destroy();
    assert!(!sim.is_enabled());
    assert_eq!(sim.live_ring_bufs(), 0);
}

#[test]
fn test_metadata_term_requires_disabled() {
    let sim = sim();
    let mut backend = backend(&sim);
    {
        let map = all(backend.metadata().unwrap());
        backend.dump_enable(&map).unwrap();
    }
    assert!(matches!(
        backend.metadata_term(),
        Err(Error::InvalidState { op: "metadata_term", .. })
    ));
}

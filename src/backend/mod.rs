//! Counter collection backend.
//!
//! Drives the ring buffer protocol from two sides: control calls
//! ([`Backend::dump_enable`], [`Backend::dump_request`], ...) and event
//! notifications delivered by whoever handles firmware interrupts
//! (`on_prfcnt_*`, `protm_*`, ...). Both sides serialise on one lock.
//!
//! Samples are folded into a raw accumulator as they are extracted from the
//! ring. Completing a dump request moves the accumulated values into the dump
//! read by [`Backend::dump_get`] and restarts accumulation, so every dump
//! covers the interval since the previous one.
//!
//! ```rust
//! use gpu_hwcnt::backend::Backend;
//! use gpu_hwcnt::config::Opts;
//! use gpu_hwcnt::csf_if::sim::SimInterface;
//! use gpu_hwcnt::dump::DumpBuffer;
//! use gpu_hwcnt::gpu::GpuInfo;
//! use gpu_hwcnt::map::EnableMap;
//!
//! let info = GpuInfo { l2_count: 1, core_mask: 0b1, clk_cnt: 1 };
//! let sim = SimInterface::new(&info).unwrap();
//! let mut backend = Backend::create(sim, Opts::default()).unwrap();
//! backend.metadata_init().unwrap();
//!
//! let metadata = backend.metadata().unwrap();
//! let mut map = EnableMap::new(metadata);
//! map.enable_all();
//! backend.dump_enable(&map).unwrap();
//! backend.on_prfcnt_enable();
//!
//! backend.iface().add_counter(4, 42);
//! backend.dump_request().unwrap();
//! backend.on_prfcnt_sample();
//! tokio_test::block_on(backend.dump_wait()).unwrap();
//!
//! let mut dump = DumpBuffer::new(metadata);
//! backend.dump_get(&mut dump, &map, false).unwrap();
//! assert_eq!(dump.value(4), Some(42));
//! ```

#[cfg(test)]
mod test;

mod wait;

pub use wait::DumpWait;

use std::ptr;
use std::task::Poll;

use arrayvec::ArrayVec;
use futures::task::AtomicWaker;
use parking_lot::{Mutex, MutexGuard};

use crate::config::Opts;
use crate::csf_if::{CsfEnable, CsfInterface};
use crate::dump::{dump_get, raw_counter, set_raw_counter, DumpBuffer};
use crate::error::{Error, ErrorKind, Result};
use crate::gpu::{MAX_CLOCK_DOMAINS, V5_PRFCNT_EN_HEADER};
use crate::map::EnableMap;
use crate::metadata::Metadata;
use crate::ring::{fill, RingBuffer};

/// Enable state of the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnableState {
    Disabled,
    /// Enable was programmed, waiting for the firmware acknowledgement.
    TransitioningToEnabled,
    Enabled,
    /// Disable was programmed, waiting for the firmware acknowledgement.
    TransitioningToDisabled,
    /// Sticky until [`Backend::on_before_reset`].
    UnrecoverableError,
}

impl EnableState {
    pub fn name(self) -> &'static str {
        match self {
            EnableState::Disabled => "Disabled",
            EnableState::TransitioningToEnabled => "TransitioningToEnabled",
            EnableState::Enabled => "Enabled",
            EnableState::TransitioningToDisabled => "TransitioningToDisabled",
            EnableState::UnrecoverableError => "UnrecoverableError",
        }
    }
}

/// Progress of the current dump request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpState {
    Idle,
    /// Sent to the engine, waiting for its sample.
    Requested,
    /// Held back while in protected mode.
    Deferred,
    /// A dump is ready to be read.
    Completed,
}

impl DumpState {
    pub fn name(self) -> &'static str {
        match self {
            DumpState::Idle => "Idle",
            DumpState::Requested => "Requested",
            DumpState::Deferred => "Deferred",
            DumpState::Completed => "Completed",
        }
    }
}

pub struct Backend<I: CsfInterface> {
    iface: I,
    opts: Opts,
    metadata: Option<Metadata>,
    state: Mutex<State<I::RingBuf>>,
    waker: AtomicWaker,
}

/// The backend lock, as returned by [`Backend::lock`].
///
/// Holding it is what the `_nolock` entry points require.
pub struct BackendGuard<'a, R> {
    state: MutexGuard<'a, State<R>>,
}

impl<R> BackendGuard<'_, R> {
    pub fn enable_state(&self) -> EnableState {
        self.state.enable_state
    }

    pub fn dump_state(&self) -> DumpState {
        self.state.dump_state
    }
}

#[derive(Clone, Copy, Debug)]
struct Overflow {
    extract: u32,
    insert: u32,
    overflows: u32,
}

struct State<R> {
    enable_state: EnableState,
    dump_state: DumpState,
    ring: Option<RingBuffer<R>>,
    clk_enable_map: u64,
    protm: bool,
    // A sample or threshold event arrived in protected mode.
    sample_deferred: bool,
    // Disable was acknowledged in protected mode, the ring is freed on exit.
    disable_deferred: bool,
    // Last indexes read from the engine.
    indexes: (u32, u32),
    overflow: Option<Overflow>,
    // Raw layout, one saturating u32 per value.
    accum: Vec<u8>,
    accum_clk: ArrayVec<u64, MAX_CLOCK_DOMAINS>,
    dump: Vec<u8>,
    dump_clk: ArrayVec<u64, MAX_CLOCK_DOMAINS>,
    cycle_base: ArrayVec<u64, MAX_CLOCK_DOMAINS>,
}

impl<R> State<R> {
    fn new() -> Self {
        Self {
            enable_state: EnableState::Disabled,
            dump_state: DumpState::Idle,
            ring: None,
            clk_enable_map: 0,
            protm: false,
            sample_deferred: false,
            disable_deferred: false,
            indexes: (0, 0),
            overflow: None,
            accum: Vec::new(),
            accum_clk: ArrayVec::new(),
            dump: Vec::new(),
            dump_clk: ArrayVec::new(),
            cycle_base: ArrayVec::new(),
        }
    }

    fn check_state(&self, op: &'static str, allowed: &[EnableState]) -> Result<()> {
        if allowed.contains(&self.enable_state) {
            return Ok(());
        }
        if self.enable_state == EnableState::UnrecoverableError {
            return Err(Error::Unrecoverable);
        }
        Err(Error::InvalidState {
            op,
            state: self.enable_state.name(),
        })
    }

    // Whether the engine may still be producing samples into the ring.
    fn is_sampling(&self) -> bool {
        matches!(
            self.enable_state,
            EnableState::TransitioningToEnabled
                | EnableState::Enabled
                | EnableState::TransitioningToDisabled
        )
    }

    fn size_buffers(&mut self, metadata: &Metadata) {
        let bytes = metadata.dump_bytes();
        self.accum = vec![0; bytes];
        self.dump = vec![0; bytes];
        let clks = metadata.clk_cnt() as usize;
        for buf in [&mut self.accum_clk, &mut self.dump_clk, &mut self.cycle_base] {
            buf.clear();
            buf.extend((0..clks).map(|_| 0));
        }
    }

    fn reset_values(&mut self) {
        self.accum.fill(0);
        self.accum_clk.fill(0);
        self.dump.fill(0);
        self.dump_clk.fill(0);
        self.overflow = None;
        if self.dump_state == DumpState::Completed {
            self.dump_state = DumpState::Idle;
        }
    }

    /// Folds every sample between the extract and insert indexes into the
    /// accumulator and hands the slots back to the engine.
    fn accumulate<I>(&mut self, iface: &I, metadata: &Metadata) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        let Some(ring) = self.ring.as_mut() else {
            return Ok(());
        };
        let (extract, insert) = ring.get_indexes(iface)?;
        self.indexes = (extract, insert);
        if extract == insert {
            return Ok(());
        }

        ring.sync(iface, extract, insert, true)?;
        let buf_count = ring.buf_count();
        let count = fill(extract, insert, buf_count);
        // Engines may report free-running indexes, slot lookup masks them.
        for n in 0..count {
            let index = extract.wrapping_add(n);
            accumulate_sample(&mut self.accum, ring.slot_mut(index), metadata);
        }
        ring.sync(iface, extract, insert, false)?;
        ring.set_extract_index(iface, insert)?;
        self.indexes = (insert, insert);

        log::trace!(
            "hwcnt accumulated {} samples, extract index now {}",
            count,
            insert
        );
        Ok(())
    }

    /// Sends a dump request, making room in the ring first if it is full.
    fn issue_request<I>(&mut self, iface: &I, metadata: &Metadata) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        let res = match &self.ring {
            Some(ring) => ring.dump_request(iface),
            None => return Err(Error::Unrecoverable),
        };
        match res {
            Err(Error::RingFull) => {
                log::debug!("hwcnt ring full on dump request, extracting first");
                self.accumulate(iface, metadata)?;
                match &self.ring {
                    Some(ring) => ring.dump_request(iface),
                    None => Err(Error::Unrecoverable),
                }
            }
            res => res,
        }
    }

    /// Adds the cycles elapsed since the last call to the accumulator.
    fn sample_cycles<I>(&mut self, iface: &I)
    where
        I: CsfInterface<RingBuf = R>,
    {
        let mut now = self.cycle_base.clone();
        iface.get_gpu_cycle_count(&mut now, self.clk_enable_map);
        let clk_enable_map = self.clk_enable_map;
        let slots = self.accum_clk.iter_mut().zip(self.cycle_base.iter_mut());
        for (clk, ((acc, base), now)) in slots.zip(now).enumerate() {
            if clk_enable_map & (1 << clk) != 0 {
                *acc = acc.saturating_add(now.wrapping_sub(*base));
                *base = now;
            }
        }
    }

    fn complete_dump(&mut self) {
        self.dump.copy_from_slice(&self.accum);
        self.accum.fill(0);
        self.dump_clk.clone_from(&self.accum_clk);
        self.accum_clk.fill(0);
        self.dump_state = DumpState::Completed;
    }
}

/// Adds one raw sample into the raw accumulator.
///
/// Blocks the sample did not cover (PRFCNT_EN header of 0) are skipped, and
/// the header is cleared so a stale slot is never counted twice.
fn accumulate_sample(accum: &mut [u8], sample: &mut [u8], metadata: &Metadata) {
    for block in metadata.blocks() {
        let prfcnt_en = block.value_offset + V5_PRFCNT_EN_HEADER;
        if raw_counter(sample, prfcnt_en) == 0 {
            continue;
        }
        for (val, offset) in block.values().enumerate() {
            let raw = raw_counter(sample, offset);
            let value = if val < block.hdr_cnt {
                raw
            } else {
                raw_counter(accum, offset).saturating_add(raw)
            };
            set_raw_counter(accum, offset, value);
        }
        set_raw_counter(sample, prfcnt_en, 0);
    }
}

impl<I: CsfInterface> Backend<I> {
    /// Creates a disabled backend on top of `iface`.
    pub fn create(iface: I, opts: Opts) -> Result<Self> {
        opts.validate()?;
        log::debug!(
            "hwcnt backend created, {} ring slots, {:?} counter set",
            opts.ring_buf_cnt,
            opts.counter_set
        );
        Ok(Self {
            iface,
            opts,
            metadata: None,
            state: Mutex::new(State::new()),
            waker: AtomicWaker::new(),
        })
    }

    pub fn iface(&self) -> &I {
        &self.iface
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    /// Builds the counter metadata from what the engine reports.
    ///
    /// The engine's sample size must match the layout the metadata describes.
    pub fn metadata_init(&mut self) -> Result<()> {
        let state = self.state.get_mut();
        state.check_state("metadata_init", &[EnableState::Disabled])?;

        let info = self.iface.get_gpu_info();
        let (metadata, dump_bytes) = Metadata::create(&info.topology(), self.opts.counter_set)?;
        if dump_bytes != info.dump_size {
            return Err(Error::SizeMismatch {
                expected: dump_bytes,
                actual: info.dump_size,
            });
        }
        state.size_buffers(&metadata);
        self.metadata = Some(metadata);
        Ok(())
    }

    pub fn metadata_term(&mut self) -> Result<()> {
        let state = self.state.get_mut();
        state.check_state("metadata_term", &[EnableState::Disabled])?;
        self.metadata = None;
        *state = State::new();
        Ok(())
    }

    pub fn metadata(&self) -> Result<&Metadata> {
        self.metadata.as_ref().ok_or(Error::NoMetadata)
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.iface.timestamp_ns()
    }

    pub fn enable_state(&self) -> EnableState {
        self.state.lock().enable_state
    }

    pub fn dump_state(&self) -> DumpState {
        self.state.lock().dump_state
    }

    /// Takes the backend lock.
    pub fn lock(&self) -> BackendGuard<'_, I::RingBuf> {
        BackendGuard {
            state: self.state.lock(),
        }
    }

    /// Allocates the ring buffer and starts collecting the counters `map`
    /// selects.
    ///
    /// The backend stays in [`EnableState::TransitioningToEnabled`] until
    /// [`on_prfcnt_enable`][Self::on_prfcnt_enable].
    pub fn dump_enable(&self, map: &EnableMap<'_>) -> Result<()> {
        let mut guard = self.lock();
        self.dump_enable_nolock(&mut guard, map)
    }

    /// [`dump_enable`][Self::dump_enable] with the lock from
    /// [`lock`][Self::lock] already held.
    pub fn dump_enable_nolock(
        &self,
        guard: &mut BackendGuard<'_, I::RingBuf>,
        map: &EnableMap<'_>,
    ) -> Result<()> {
        if !ptr::eq(MutexGuard::mutex(&guard.state), &self.state) {
            return Err(Error::InvalidState {
                op: "dump_enable_nolock",
                state: "lock of another backend",
            });
        }
        let metadata = self.metadata()?;
        if !map.is_for(metadata) {
            return Err(Error::MetadataMismatch);
        }
        let state = &mut *guard.state;
        state.check_state("dump_enable", &[EnableState::Disabled])?;

        let enable = CsfEnable::new(&map.to_physical(), metadata.counter_set().to_physical());
        let mut ring =
            RingBuffer::allocate(&self.iface, self.opts.ring_buf_cnt, metadata.dump_bytes())?;
        ring.dump_enable_nolock(&self.iface, &enable)?;

        state.ring = Some(ring);
        state.clk_enable_map = enable.clk_enable_map;
        state.reset_values();
        state.dump_state = DumpState::Idle;
        state.indexes = (0, 0);
        state.sample_deferred = false;
        state.disable_deferred = false;
        self.iface
            .get_gpu_cycle_count(&mut state.cycle_base, state.clk_enable_map);
        state.enable_state = EnableState::TransitioningToEnabled;
        log::debug!("hwcnt backend enabling with {:?}", enable);
        Ok(())
    }

    /// Stops sampling. Samples already in the ring are collected once the
    /// firmware acknowledges through [`on_prfcnt_disable`][Self::on_prfcnt_disable].
    ///
    /// An outstanding dump request is abandoned.
    pub fn dump_disable(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.enable_state {
            EnableState::Disabled | EnableState::TransitioningToDisabled => return Ok(()),
            EnableState::UnrecoverableError => return Err(Error::Unrecoverable),
            EnableState::TransitioningToEnabled | EnableState::Enabled => {}
        }
        if let Some(ring) = state.ring.as_mut() {
            ring.dump_disable(&self.iface)?;
        }
        state.enable_state = EnableState::TransitioningToDisabled;
        if matches!(state.dump_state, DumpState::Requested | DumpState::Deferred) {
            state.dump_state = DumpState::Idle;
            self.waker.wake();
        }
        log::debug!("hwcnt backend disabling");
        Ok(())
    }

    /// Requests a dump and returns the time it was requested at.
    ///
    /// Only one request may be outstanding. In protected mode the request is
    /// held back and sent on [`protm_exited`][Self::protm_exited].
    pub fn dump_request(&self) -> Result<u64> {
        let metadata = self.metadata()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.check_state("dump_request", &[EnableState::Enabled])?;
        if matches!(state.dump_state, DumpState::Requested | DumpState::Deferred) {
            return Err(Error::InvalidState {
                op: "dump_request",
                state: state.dump_state.name(),
            });
        }

        let dump_time_ns = self.iface.timestamp_ns();
        if state.protm {
            log::warn!("hwcnt dump requested in protected mode, deferred");
            state.dump_state = DumpState::Deferred;
        } else if let Err(e) = state.issue_request(&self.iface, metadata) {
            self.handle_error(state, &e);
            return Err(e);
        } else {
            state.dump_state = DumpState::Requested;
        }
        // The cycle window only moves once the request went through.
        state.sample_cycles(&self.iface);
        Ok(dump_time_ns)
    }

    /// Waits for the outstanding dump request to complete.
    ///
    /// Supports a single waiter at a time.
    pub fn dump_wait(&self) -> DumpWait<'_, I> {
        DumpWait::new(self)
    }

    /// Discards every value collected so far, including a completed dump and
    /// a recorded overflow.
    pub fn dump_clear(&self) -> Result<()> {
        let metadata = self.metadata()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.enable_state == EnableState::UnrecoverableError {
            return Err(Error::Unrecoverable);
        }
        if state.is_sampling() && !state.protm {
            if let Err(e) = state.accumulate(&self.iface, metadata) {
                self.handle_error(state, &e);
                return Err(e);
            }
            state.sample_cycles(&self.iface);
        }
        state.reset_values();
        log::trace!("hwcnt dump cleared");
        Ok(())
    }

    /// Copies or accumulates the completed dump into `dst`.
    ///
    /// Fails with [`Error::SamplesLost`] when the ring overflowed since the
    /// last [`dump_clear`][Self::dump_clear] or enable, whatever the dump.
    pub fn dump_get(
        &self,
        dst: &mut DumpBuffer<'_>,
        map: &EnableMap<'_>,
        accumulate: bool,
    ) -> Result<()> {
        let metadata = self.metadata()?;
        if !ptr::eq(dst.metadata(), metadata) || !map.is_for(metadata) {
            return Err(Error::MetadataMismatch);
        }
        let guard = self.state.lock();
        if guard.enable_state == EnableState::UnrecoverableError {
            return Err(Error::Unrecoverable);
        }
        if let Some(Overflow {
            extract,
            insert,
            overflows,
        }) = guard.overflow
        {
            return Err(Error::SamplesLost {
                extract,
                insert,
                overflows,
            });
        }
        if guard.dump_state != DumpState::Completed {
            return Err(Error::DumpNotReady);
        }

        dump_get(dst, &guard.dump, map, None, accumulate)?;
        let clks = dst.clk_cnt_mut().iter_mut().zip(&guard.dump_clk);
        for (clk, (cnt, elapsed)) in clks.enumerate() {
            if !map.clk_enabled(clk) {
                continue;
            }
            *cnt = if accumulate {
                cnt.saturating_add(*elapsed)
            } else {
                *elapsed
            };
        }
        Ok(())
    }

    pub fn protm_entered(&self) {
        let mut guard = self.state.lock();
        guard.protm = true;
        log::debug!("hwcnt backend entered protected mode");
    }

    /// Leaves protected mode, handling the events and the dump request held
    /// back in the meantime.
    pub fn protm_exited(&self) {
        let Ok(metadata) = self.metadata() else {
            return;
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.protm = false;
        log::debug!("hwcnt backend exited protected mode");
        if !state.is_sampling() {
            return;
        }
        if std::mem::take(&mut state.disable_deferred) {
            state.sample_deferred = false;
            self.finish_disable(state, Some(metadata));
            return;
        }

        if std::mem::take(&mut state.sample_deferred) {
            self.consume_samples(state, metadata);
        }
        if state.dump_state == DumpState::Deferred {
            match state.issue_request(&self.iface, metadata) {
                Ok(()) => state.dump_state = DumpState::Requested,
                Err(e) => self.handle_error(state, &e),
            }
        }
    }

    /// A sample was written. Collects it and completes a pending request.
    pub fn on_prfcnt_sample(&self) {
        let Ok(metadata) = self.metadata() else {
            return;
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.is_sampling() {
            return;
        }
        if state.protm {
            state.sample_deferred = true;
            return;
        }
        self.consume_samples(state, metadata);
    }

    /// The ring is filling up. Collects what is there to free slots.
    pub fn on_prfcnt_threshold(&self) {
        let Ok(metadata) = self.metadata() else {
            return;
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.is_sampling() {
            return;
        }
        log::debug!("hwcnt ring buffer reached threshold");
        if state.protm {
            state.sample_deferred = true;
            return;
        }
        if let Err(e) = state.accumulate(&self.iface, metadata) {
            self.handle_error(state, &e);
        }
    }

    /// The engine dropped samples. Recorded and reported by the next
    /// [`dump_get`][Self::dump_get].
    pub fn on_prfcnt_overflow(&self) {
        let Ok(metadata) = self.metadata() else {
            return;
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.is_sampling() {
            return;
        }
        if !state.protm {
            let indexes = state.ring.as_ref().map(|ring| ring.get_indexes(&self.iface));
            if let Some(Ok(indexes)) = indexes {
                state.indexes = indexes;
            }
        }

        let (extract, insert) = state.indexes;
        let overflows = state.overflow.map_or(0, |o| o.overflows) + 1;
        state.overflow = Some(Overflow {
            extract,
            insert,
            overflows,
        });
        log::warn!(
            "hwcnt ring buffer overflow, samples lost (extract {}, insert {})",
            extract,
            insert
        );

        if state.protm {
            state.sample_deferred = true;
        } else if let Err(e) = state.accumulate(&self.iface, metadata) {
            self.handle_error(state, &e);
        }
    }

    pub fn on_prfcnt_enable(&self) {
        let mut guard = self.state.lock();
        if guard.enable_state == EnableState::TransitioningToEnabled {
            guard.enable_state = EnableState::Enabled;
            log::debug!("hwcnt backend enabled");
        }
    }

    /// The engine stopped sampling. Collects the remaining samples and frees
    /// the ring buffer.
    ///
    /// In protected mode the ring cannot be read, so both wait for
    /// [`protm_exited`][Self::protm_exited].
    pub fn on_prfcnt_disable(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.enable_state != EnableState::TransitioningToDisabled {
            return;
        }
        if state.protm {
            log::debug!("hwcnt disable acknowledged in protected mode, ring kept until exit");
            state.disable_deferred = true;
            return;
        }
        self.finish_disable(state, self.metadata().ok());
    }

    fn finish_disable(&self, state: &mut State<I::RingBuf>, metadata: Option<&Metadata>) {
        if let Some(metadata) = metadata {
            if let Err(e) = state.accumulate(&self.iface, metadata) {
                log::warn!("hwcnt samples dropped on disable: {}", e);
            }
        }
        if let Some(mut ring) = state.ring.take() {
            if let Err(e) = ring.free(&self.iface) {
                log::error!("hwcnt ring buffer free failed: {}", e);
            }
        }
        state.enable_state = EnableState::Disabled;
        log::debug!("hwcnt backend disabled");
    }

    /// Firmware or bus failure. Every dump operation fails until
    /// [`on_before_reset`][Self::on_before_reset].
    pub fn on_unrecoverable_error(&self) {
        let mut guard = self.state.lock();
        self.enter_unrecoverable(&mut guard);
    }

    /// Clears the unrecoverable state ahead of a device reset, dropping the
    /// ring buffer and everything collected.
    pub fn on_before_reset(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.enable_state != EnableState::UnrecoverableError {
            return;
        }
        if let Some(mut ring) = state.ring.take() {
            ring.reset();
            if let Err(e) = ring.free(&self.iface) {
                log::error!("hwcnt ring buffer free failed: {}", e);
            }
        }
        state.reset_values();
        state.dump_state = DumpState::Idle;
        state.protm = false;
        state.sample_deferred = false;
        state.disable_deferred = false;
        state.enable_state = EnableState::Disabled;
        log::debug!("hwcnt backend reset to disabled");
    }

    /// Disables sampling if needed and releases the ring buffer.
    pub fn destroy(self) {
        drop(self)
    }

    pub(crate) fn poll_dump(&self) -> Poll<Result<()>> {
        let guard = self.state.lock();
        if guard.enable_state == EnableState::UnrecoverableError {
            return Poll::Ready(Err(Error::Unrecoverable));
        }
        match guard.dump_state {
            DumpState::Completed => Poll::Ready(Ok(())),
            DumpState::Requested | DumpState::Deferred => Poll::Pending,
            DumpState::Idle => Poll::Ready(Err(Error::DumpNotReady)),
        }
    }

    pub(crate) fn waker(&self) -> &AtomicWaker {
        &self.waker
    }

    fn consume_samples(&self, state: &mut State<I::RingBuf>, metadata: &Metadata) {
        if let Err(e) = state.accumulate(&self.iface, metadata) {
            self.handle_error(state, &e);
            return;
        }
        if state.dump_state == DumpState::Requested {
            state.complete_dump();
            self.waker.wake();
        }
    }

    fn handle_error(&self, state: &mut State<I::RingBuf>, e: &Error) {
        if e.kind() == ErrorKind::Unrecoverable {
            self.enter_unrecoverable(state);
        } else {
            log::warn!("hwcnt backend: {}", e);
        }
    }

    fn enter_unrecoverable(&self, state: &mut State<I::RingBuf>) {
        if state.enable_state == EnableState::UnrecoverableError {
            return;
        }
        log::error!(
            "hwcnt backend unrecoverable error in state {}",
            state.enable_state.name()
        );
        if let Some(ring) = state.ring.as_mut() {
            ring.set_unrecoverable();
        }
        state.enable_state = EnableState::UnrecoverableError;
        self.waker.wake();
    }
}

impl<I: CsfInterface> Drop for Backend<I> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(mut ring) = state.ring.take() {
            if ring.state() == crate::ring::RingState::Enabled {
                if let Err(e) = ring.dump_disable(&self.iface) {
                    log::error!("hwcnt ring buffer disable failed: {}", e);
                }
            }
            if let Err(e) = ring.free(&self.iface) {
                log::error!("hwcnt ring buffer free failed: {}", e);
            }
        }
        log::debug!("hwcnt backend destroyed");
    }
}

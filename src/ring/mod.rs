
use std::ptr::NonNull;
use std::slice;

use crate::csf_if::{CsfEnable, CsfInterface};
use crate::error::{Error, Result};

/// Lifecycle of a ring buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingState {
    Uninitialized,
    Allocated,
    Enabled,
    Disabled,
    Destroyed,
    UnrecoverableError,
}

impl RingState {
    pub fn name(self) -> &'static str {
        match self {
            RingState::Uninitialized => "Uninitialized",
            RingState::Allocated => "Allocated",
            RingState::Enabled => "Enabled",
            RingState::Disabled => "Disabled",
            RingState::Destroyed => "Destroyed",
            RingState::UnrecoverableError => "UnrecoverableError",
        }
    }
}

/// Number of filled slots between `extract` and `insert`.
///
/// Indices run modulo `2 * buf_count`, which keeps a full ring (`buf_count`)
/// apart from an empty one (`0`). Free-running `u32` indices give the same
/// result since `2 * buf_count` divides `2^32`.
#[inline]
pub fn fill(extract: u32, insert: u32, buf_count: u32) -> u32 {
    insert.wrapping_sub(extract) & index_mask(buf_count)
}

/// Index following `index` on a ring of `buf_count` slots.
#[inline]
pub fn next_index(index: u32, buf_count: u32) -> u32 {
    index.wrapping_add(1) & index_mask(buf_count)
}

#[inline]
fn index_mask(buf_count: u32) -> u32 {
    // `buf_count` is a power of two, so for 2^31 this wraps to u32::MAX.
    buf_count.wrapping_mul(2).wrapping_sub(1)
}

// Index races are transient, a few re-reads always settle.
const INDEX_READ_RETRIES: usize = 4;

/// Circular sequence of sample slots shared with the sampling engine.
///
/// Software owns the slots in `extract..insert` until it advances the extract
/// index past them; the engine owns the others. The extract index is only
/// written by software and the insert index only by the engine.
pub struct RingBuffer<R> {
    handle: Option<R>,
    base: NonNull<u8>,
    buf_count: u32,
    slot_bytes: usize,
    state: RingState,
}

// `base` is only dereferenced while `handle` keeps the mapping alive.
unsafe impl<R: Send> Send for RingBuffer<R> {}

impl<R> RingBuffer<R> {
    /// Allocates `buf_count` slots of `slot_bytes` each.
    pub fn allocate<I>(iface: &I, buf_count: u32, slot_bytes: usize) -> Result<Self>
    where
        I: CsfInterface<RingBuf = R>,
    {
        if !buf_count.is_power_of_two() {
            return Err(Error::NotPowerOfTwo(buf_count));
        }
        let (base, handle) = iface.ring_buf_alloc(buf_count)?;
        log::debug!(
            "hwcnt ring buffer allocated: {} slots of {} bytes",
            buf_count,
            slot_bytes
        );
        Ok(Self {
            handle: Some(handle),
            base,
            buf_count,
            slot_bytes,
            state: RingState::Allocated,
        })
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn buf_count(&self) -> u32 {
        self.buf_count
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Starts sampling into this ring, the engine serialising on its own.
    pub fn dump_enable<I>(&mut self, iface: &I, enable: &CsfEnable) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        self.enable_with(|rb| iface.dump_enable(rb, enable))
    }

    /// Starts sampling into this ring with the backend lock already held.
    pub fn dump_enable_nolock<I>(&mut self, iface: &I, enable: &CsfEnable) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        self.enable_with(|rb| iface.dump_enable_nolock(rb, enable))
    }

    fn enable_with(&mut self, f: impl FnOnce(&R)) -> Result<()> {
        self.expect_state("dump_enable", &[RingState::Allocated, RingState::Disabled])?;
        let handle = self.handle()?;
        f(handle);
        self.state = RingState::Enabled;
        Ok(())
    }

    /// Stops further inserts. Samples already inserted stay readable.
    pub fn dump_disable<I>(&mut self, iface: &I) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        self.expect_state("dump_disable", &[RingState::Enabled])?;
        iface.dump_disable();
        self.state = RingState::Disabled;
        Ok(())
    }

    /// Asks the engine for a sample in the next free slot.
    ///
    /// Fails with [`Error::RingFull`] rather than let the engine overwrite
    /// slots software has not consumed.
    pub fn dump_request<I>(&self, iface: &I) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        self.expect_state("dump_request", &[RingState::Enabled])?;
        let (extract, insert) = self.get_indexes(iface)?;
        if fill(extract, insert, self.buf_count) >= self.buf_count {
            return Err(Error::RingFull);
        }
        iface.dump_request();
        Ok(())
    }

    /// Returns a consistent `(extract, insert)` pair.
    pub fn get_indexes<I>(&self, iface: &I) -> Result<(u32, u32)>
    where
        I: CsfInterface<RingBuf = R>,
    {
        self.expect_live("get_indexes")?;
        for _ in 0..INDEX_READ_RETRIES {
            let (extract, insert) = iface.get_indexes();
            if fill(extract, insert, self.buf_count) <= self.buf_count {
                return Ok((extract, insert));
            }
        }
        log::error!("hwcnt ring buffer indexes never settled");
        Err(Error::Unrecoverable)
    }

    /// Retires every slot before `extract`.
    pub fn set_extract_index<I>(&self, iface: &I, extract: u32) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        let (old, insert) = self.get_indexes(iface)?;
        let n = self.buf_count;
        if fill(old, extract, n) > fill(old, insert, n) {
            return Err(Error::ExtractBeyondInsert { extract, insert });
        }
        iface.set_extract_index(extract);
        Ok(())
    }

    /// Synchronises slots `first..last` for CPU reads (`for_cpu`) or after
    /// CPU writes.
    pub fn sync<I>(&self, iface: &I, first: u32, last: u32, for_cpu: bool) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        self.expect_live("sync")?;
        iface.ring_buf_sync(self.handle()?, first, last, for_cpu);
        Ok(())
    }

    /// Bytes of the slot `index` maps to.
    ///
    /// Only meaningful for slots software owns, after a CPU sync.
    pub fn slot(&self, index: u32) -> &[u8] {
        let at = self.slot_at(index);
        // The interface keeps `buf_count * slot_bytes` bytes mapped while we
        // hold the handle, and slots software owns are not written by the engine.
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(at), self.slot_bytes) }
    }

    pub fn slot_mut(&mut self, index: u32) -> &mut [u8] {
        let at = self.slot_at(index);
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr().add(at), self.slot_bytes) }
    }

    fn slot_at(&self, index: u32) -> usize {
        (index & (self.buf_count - 1)) as usize * self.slot_bytes
    }

    /// Releases the ring memory. Not allowed while sampling is enabled.
    pub fn free<I>(&mut self, iface: &I) -> Result<()>
    where
        I: CsfInterface<RingBuf = R>,
    {
        self.expect_state(
            "free",
            &[
                RingState::Allocated,
                RingState::Disabled,
                RingState::UnrecoverableError,
            ],
        )?;
        if let Some(handle) = self.handle.take() {
            iface.ring_buf_free(handle);
            log::debug!("hwcnt ring buffer freed");
        }
        self.state = RingState::Destroyed;
        Ok(())
    }

    /// Marks the ring unusable after a firmware failure.
    pub fn set_unrecoverable(&mut self) {
        if matches!(self.state, RingState::Enabled | RingState::Disabled) {
            self.state = RingState::UnrecoverableError;
        }
    }

    /// Clears an unrecoverable error ahead of a device reset.
    pub fn reset(&mut self) {
        if self.state == RingState::UnrecoverableError {
            self.state = RingState::Disabled;
        }
    }

    fn handle(&self) -> Result<&R> {
        self.handle.as_ref().ok_or(Error::InvalidState {
            op: "ring access",
            state: RingState::Destroyed.name(),
        })
    }

    fn expect_live(&self, op: &'static str) -> Result<()> {
        self.expect_state(
            op,
            &[RingState::Allocated, RingState::Enabled, RingState::Disabled],
        )
    }

    fn expect_state(&self, op: &'static str, allowed: &[RingState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        if self.state == RingState::UnrecoverableError {
            return Err(Error::Unrecoverable);
        }
        Err(Error::InvalidState {
            op,
            state: self.state.name(),
        })
    }
}

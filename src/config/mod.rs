use crate::error::{Error, Result};
use crate::gpu::CounterSet;


/// Backend options.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Opts {
    /// Number of sample slots in the ring buffer, must be a power of two.
    ///
    /// Defaults to 128.
    pub ring_buf_cnt: u32,

    /// Counter set to collect.
    pub counter_set: CounterSet,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            ring_buf_cnt: 128,
            counter_set: CounterSet::default(),
        }
    }
}

impl Opts {
    /// Checks the options before anything is allocated.
    pub fn validate(&self) -> Result<()> {
        if !self.ring_buf_cnt.is_power_of_two() {
            return Err(Error::NotPowerOfTwo(self.ring_buf_cnt));
        }
        Ok(())
    }
}

//! GPU topology and the V5 counter block layout.

/// Number of hardware block kinds in a V5 dump (front-end, tiler, shader core, memsys).
pub const V5_BLOCK_TYPE_COUNT: usize = 4;
/// Header slots at the start of every block.
pub const V5_HEADERS_PER_BLOCK: usize = 4;
/// Counter slots following the headers.
pub const V5_COUNTERS_PER_BLOCK: usize = 60;
/// Values per block instance, headers included.
pub const V5_VALUES_PER_BLOCK: usize = V5_HEADERS_PER_BLOCK + V5_COUNTERS_PER_BLOCK;
/// Index of the PRFCNT_EN header inside a block.
pub const V5_PRFCNT_EN_HEADER: usize = 2;
/// Size of one raw hardware counter.
pub const COUNTER_BYTES: usize = size_of::<u32>();
/// Upper bound on clock domains tracked per dump.
pub const MAX_CLOCK_DOMAINS: usize = 4;

/// Counter-related GPU properties, as reported by the sampling engine.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GpuInfo {
    /// Number of L2 cache slices, one memsys block each.
    pub l2_count: usize,
    /// Shader core mask. May be sparse.
    pub core_mask: u64,
    /// Number of clock domains.
    pub clk_cnt: u8,
}

/// Counter set selected for collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CounterSet {
    #[default]
    Primary,
    Secondary,
    Tertiary,
}

/// Counter set encoding consumed by hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PhysicalSet {
    Primary = 0,
    Secondary = 1,
    Tertiary = 2,
}

impl CounterSet {
    pub fn to_physical(self) -> PhysicalSet {
        match self {
            CounterSet::Primary => PhysicalSet::Primary,
            CounterSet::Secondary => PhysicalSet::Secondary,
            CounterSet::Tertiary => PhysicalSet::Tertiary,
        }
    }
}

/// Metadata group kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GroupType {
    V5,
}

/// Hardware block kinds.
///
/// The numbered variants are the same unit read through the secondary or
/// tertiary counter set. `Undefined` marks a block that the selected counter
/// set does not cover: it still occupies its place in the dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockType {
    Undefined,
    Fe,
    Fe2,
    Fe3,
    Tiler,
    Sc,
    Sc2,
    Sc3,
    Memsys,
    Memsys2,
}

impl BlockType {
    pub(crate) fn front_end(set: CounterSet) -> Self {
        match set {
            CounterSet::Primary => BlockType::Fe,
            CounterSet::Secondary => BlockType::Fe2,
            CounterSet::Tertiary => BlockType::Fe3,
        }
    }

    pub(crate) fn tiler(set: CounterSet) -> Self {
        match set {
            CounterSet::Primary => BlockType::Tiler,
            CounterSet::Secondary | CounterSet::Tertiary => BlockType::Undefined,
        }
    }

    pub(crate) fn shader_core(set: CounterSet) -> Self {
        match set {
            CounterSet::Primary => BlockType::Sc,
            CounterSet::Secondary => BlockType::Sc2,
            CounterSet::Tertiary => BlockType::Sc3,
        }
    }

    pub(crate) fn memsys(set: CounterSet) -> Self {
        match set {
            CounterSet::Primary => BlockType::Memsys,
            CounterSet::Secondary => BlockType::Memsys2,
            CounterSet::Tertiary => BlockType::Undefined,
        }
    }

    pub fn is_shader_core(self) -> bool {
        matches!(self, BlockType::Sc | BlockType::Sc2 | BlockType::Sc3)
    }
}

use super::EnableMap;
use crate::gpu::BlockType;
use crate::metadata::Metadata;

/// Counter selection in the form hardware consumes.
///
/// One bitmask per block kind, shared by every instance of that kind. Bit `n`
/// enables physical counters `4n..4n + 4`, so a 32-bit mask spans 128 counters
/// of which only the first 64 exist in a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhysicalEnableMap {
    /// Front-end counters.
    pub fe_bm: u32,
    /// Shader core counters.
    pub shader_bm: u32,
    /// Tiler counters.
    pub tiler_bm: u32,
    /// MMU and L2 counters.
    pub mmu_l2_bm: u32,
    /// Clock domains, bit `n` enabling cycle counting for domain `n`.
    pub clk_enable_map: u64,
}

const COUNTERS_PER_BIT: u32 = 4;

impl PhysicalEnableMap {
    /// Whether no counter of any block is selected. Clock domains are ignored.
    pub fn counters_empty(&self) -> bool {
        self.fe_bm == 0 && self.shader_bm == 0 && self.tiler_bm == 0 && self.mmu_l2_bm == 0
    }

    pub(crate) fn mask_for(&self, ty: BlockType) -> Option<u32> {
        match ty {
            BlockType::Fe | BlockType::Fe2 | BlockType::Fe3 => Some(self.fe_bm),
            BlockType::Tiler => Some(self.tiler_bm),
            BlockType::Sc | BlockType::Sc2 | BlockType::Sc3 => Some(self.shader_bm),
            BlockType::Memsys | BlockType::Memsys2 => Some(self.mmu_l2_bm),
            BlockType::Undefined => None,
        }
    }

    fn mask_for_mut(&mut self, ty: BlockType) -> Option<&mut u32> {
        match ty {
            BlockType::Fe | BlockType::Fe2 | BlockType::Fe3 => Some(&mut self.fe_bm),
            BlockType::Tiler => Some(&mut self.tiler_bm),
            BlockType::Sc | BlockType::Sc2 | BlockType::Sc3 => Some(&mut self.shader_bm),
            BlockType::Memsys | BlockType::Memsys2 => Some(&mut self.mmu_l2_bm),
            BlockType::Undefined => None,
        }
    }
}

/// Reduces the 128 per-counter bits of a block (`lo` holding counters 0..64,
/// `hi` counters 64..128) to a physical mask. A physical bit is set if any of
/// its four counters is.
pub fn block_map_to_physical(lo: u64, hi: u64) -> u32 {
    let mut phys = 0;
    for (half, bits) in [lo, hi].into_iter().enumerate() {
        for group in 0..u64::BITS / COUNTERS_PER_BIT {
            if (bits >> (group * COUNTERS_PER_BIT)) & 0xf != 0 {
                phys |= 1 << (half as u32 * 16 + group);
            }
        }
    }
    phys
}

/// Expands a physical mask into per-counter bits, returned as `(lo, hi)`.
/// Every physical bit turns on all four of its counters.
pub fn block_map_from_physical(phys: u32) -> (u64, u64) {
    let mut halves = [0_u64; 2];
    for bit in 0..u32::BITS {
        if phys & (1 << bit) != 0 {
            let group = (bit % 16) * COUNTERS_PER_BIT;
            halves[(bit / 16) as usize] |= 0xf << group;
        }
    }
    (halves[0], halves[1])
}

impl<'m> EnableMap<'m> {
    /// Converts to the coarse hardware representation.
    ///
    /// This loses information: a physical bit covers four values. Undefined
    /// blocks do not contribute.
    pub fn to_physical(&self) -> PhysicalEnableMap {
        let mut phys = PhysicalEnableMap {
            clk_enable_map: self.clk(),
            ..Default::default()
        };
        for block in self.metadata().blocks() {
            if let Some(mask) = phys.mask_for_mut(block.ty) {
                *mask |= block_map_to_physical(self.block(&block), 0);
            }
        }
        phys
    }

    /// Builds the enable map hardware would honour for `phys`.
    ///
    /// Bits selecting counters 64 and up have no value to land in and are
    /// dropped. Undefined blocks stay disabled.
    pub fn from_physical(metadata: &'m Metadata, phys: &PhysicalEnableMap) -> Self {
        let mut map = EnableMap::new(metadata);
        for block in metadata.blocks() {
            if let Some(mask) = phys.mask_for(block.ty) {
                let (lo, _) = block_map_from_physical(mask);
                map.set_block(&block, lo);
            }
        }
        map.set_clk(phys.clk_enable_map);
        map
    }
}

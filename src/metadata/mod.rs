
use crate::error::{Error, Result};
use crate::gpu::{
    BlockType, CounterSet, GpuInfo, GroupType, COUNTER_BYTES, MAX_CLOCK_DOMAINS,
    V5_COUNTERS_PER_BLOCK, V5_HEADERS_PER_BLOCK,
};

/// Immutable description of the counter layout of a GPU.
///
/// The hierarchy is group → block type → block instance → value. Every value
/// has a logical offset shared by [`EnableMap`][crate::map::EnableMap] and
/// [`DumpBuffer`][crate::dump::DumpBuffer], and the raw hardware dump stores
/// the same values in the same order, one [`COUNTER_BYTES`] counter each.
///
/// Enable maps and dump buffers borrow the metadata they were created from and
/// can only be combined with maps and buffers borrowing the same instance.
#[derive(Debug)]
pub struct Metadata {
    groups: Vec<GroupMetadata>,
    instance_cnt: usize,
    value_cnt: usize,
    clk_cnt: u8,
    core_mask: u64,
    counter_set: CounterSet,
}

#[derive(Debug)]
pub struct GroupMetadata {
    ty: GroupType,
    blocks: Vec<BlockMetadata>,
}

#[derive(Debug)]
pub struct BlockMetadata {
    ty: BlockType,
    inst_cnt: usize,
    hdr_cnt: usize,
    ctr_cnt: usize,
    // Global index of instance 0, one enable map word per instance.
    first_inst: usize,
    // Logical offset of value 0 of instance 0.
    value_index: usize,
}

/// A single block instance, as produced by [`Metadata::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInstance {
    pub grp: usize,
    pub blk: usize,
    pub inst: usize,
    pub ty: BlockType,
    pub hdr_cnt: usize,
    pub ctr_cnt: usize,
    /// Global instance index, also the enable map word of this instance.
    pub index: usize,
    /// Logical offset of the first value of this instance.
    pub value_offset: usize,
    /// Physical shader core backing this instance, for shader core blocks.
    pub core: Option<u32>,
}

impl BlockInstance {
    pub fn value_cnt(&self) -> usize {
        self.hdr_cnt + self.ctr_cnt
    }

    pub fn values(&self) -> std::ops::Range<usize> {
        self.value_offset..self.value_offset + self.value_cnt()
    }
}

impl Metadata {
    /// Builds the metadata for `info` and returns it with the size in bytes of
    /// the raw dump it describes.
    ///
    /// Blocks are laid out front-end, tiler, one shader core per bit set in
    /// `core_mask`, then one memsys per L2 slice. `counter_set` only selects
    /// block types, the shape is the same for every set.
    pub fn create(info: &GpuInfo, counter_set: CounterSet) -> Result<(Self, usize)> {
        if info.clk_cnt as usize > MAX_CLOCK_DOMAINS {
            return Err(Error::TooManyClockDomains(info.clk_cnt));
        }

        let sc_cnt = info.core_mask.count_ones() as usize;
        let layout = [
            (BlockType::front_end(counter_set), 1),
            (BlockType::tiler(counter_set), 1),
            (BlockType::shader_core(counter_set), sc_cnt),
            (BlockType::memsys(counter_set), info.l2_count),
        ];

        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(layout.len())
            .map_err(|_| Error::Alloc("metadata blocks"))?;

        let mut instance_cnt = 0_usize;
        let mut value_cnt = 0_usize;
        for (ty, inst_cnt) in layout {
            let block = BlockMetadata {
                ty,
                inst_cnt,
                hdr_cnt: V5_HEADERS_PER_BLOCK,
                ctr_cnt: V5_COUNTERS_PER_BLOCK,
                first_inst: instance_cnt,
                value_index: value_cnt,
            };
            let Some(values) = inst_cnt.checked_mul(block.hdr_cnt + block.ctr_cnt) else {
                return Err(Error::Alloc("metadata sizing overflow"));
            };
            instance_cnt = instance_cnt
                .checked_add(inst_cnt)
                .ok_or(Error::Alloc("metadata sizing overflow"))?;
            value_cnt = value_cnt
                .checked_add(values)
                .ok_or(Error::Alloc("metadata sizing overflow"))?;
            blocks.push(block);
        }

        let dump_bytes = value_cnt
            .checked_mul(COUNTER_BYTES)
            .ok_or(Error::Alloc("metadata sizing overflow"))?;

        let mut groups = Vec::new();
        groups
            .try_reserve_exact(1)
            .map_err(|_| Error::Alloc("metadata groups"))?;
        groups.push(GroupMetadata {
            ty: GroupType::V5,
            blocks,
        });

        log::debug!(
            "hwcnt metadata: {} block instances, {} values, {} bytes per dump",
            instance_cnt,
            value_cnt,
            dump_bytes
        );

        let metadata = Metadata {
            groups,
            instance_cnt,
            value_cnt,
            clk_cnt: info.clk_cnt,
            core_mask: info.core_mask,
            counter_set,
        };
        Ok((metadata, dump_bytes))
    }

    pub fn groups(&self) -> &[GroupMetadata] {
        &self.groups
    }

    /// Total number of values, the length of dump buffers.
    pub fn value_cnt(&self) -> usize {
        self.value_cnt
    }

    /// Total number of block instances, the word count of enable maps.
    pub fn instance_cnt(&self) -> usize {
        self.instance_cnt
    }

    pub fn clk_cnt(&self) -> u8 {
        self.clk_cnt
    }

    pub fn core_mask(&self) -> u64 {
        self.core_mask
    }

    pub fn counter_set(&self) -> CounterSet {
        self.counter_set
    }

    /// Size in bytes of a raw dump laid out by this metadata.
    pub fn dump_bytes(&self) -> usize {
        self.value_cnt * COUNTER_BYTES
    }

    /// Iterates every block instance in raw dump order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInstance> + '_ {
        self.groups.iter().enumerate().flat_map(move |(grp, group)| {
            // Shader core instances take the set bits of the core mask in order.
            let mut cores = CoreBits(self.core_mask);
            group.blocks.iter().enumerate().flat_map(move |(blk, block)| {
                let inst_cores: Vec<Option<u32>> = (0..block.inst_cnt)
                    .map(|_| block.ty.is_shader_core().then(|| cores.next()).flatten())
                    .collect();
                inst_cores
                    .into_iter()
                    .enumerate()
                    .map(move |(inst, core)| block.instance(grp, blk, inst, core))
            })
        })
    }

    /// Looks up one block instance.
    pub fn block(&self, grp: usize, blk: usize, inst: usize) -> Option<BlockInstance> {
        let block = self.groups.get(grp)?.blocks.get(blk)?;
        if inst >= block.inst_cnt {
            return None;
        }
        let core = if block.ty.is_shader_core() {
            CoreBits(self.core_mask).nth(inst)
        } else {
            None
        };
        Some(block.instance(grp, blk, inst, core))
    }

    /// Logical offset of value `val` of a block instance.
    pub fn value_offset(&self, grp: usize, blk: usize, inst: usize, val: usize) -> Option<usize> {
        let block = self.block(grp, blk, inst)?;
        (val < block.value_cnt()).then_some(block.value_offset + val)
    }
}

impl GroupMetadata {
    pub fn ty(&self) -> GroupType {
        self.ty
    }

    pub fn blocks(&self) -> &[BlockMetadata] {
        &self.blocks
    }
}

impl BlockMetadata {
    pub fn ty(&self) -> BlockType {
        self.ty
    }

    pub fn inst_cnt(&self) -> usize {
        self.inst_cnt
    }

    pub fn hdr_cnt(&self) -> usize {
        self.hdr_cnt
    }

    pub fn ctr_cnt(&self) -> usize {
        self.ctr_cnt
    }

    fn instance(&self, grp: usize, blk: usize, inst: usize, core: Option<u32>) -> BlockInstance {
        let stride = self.hdr_cnt + self.ctr_cnt;
        BlockInstance {
            grp,
            blk,
            inst,
            ty: self.ty,
            hdr_cnt: self.hdr_cnt,
            ctr_cnt: self.ctr_cnt,
            index: self.first_inst + inst,
            value_offset: self.value_index + inst * stride,
            core,
        }
    }
}

// Yields the indices of set bits, lowest first.
struct CoreBits(u64);

impl Iterator for CoreBits {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(bit)
    }
}

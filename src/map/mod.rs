
mod physical;

pub use physical::*;

use crate::metadata::{BlockInstance, Metadata};

/// Per-value counter selection.
///
/// One bit per metadata value, stored as one `u64` word per block instance
/// (a V5 block has exactly 64 values), plus one bit per clock domain.
#[derive(Clone, Debug)]
pub struct EnableMap<'m> {
    metadata: &'m Metadata,
    words: Vec<u64>,
    clk: u64,
}

impl<'m> EnableMap<'m> {
    /// Creates a map with everything disabled.
    pub fn new(metadata: &'m Metadata) -> Self {
        Self {
            metadata,
            words: vec![0; metadata.instance_cnt()],
            clk: 0,
        }
    }

    pub fn metadata(&self) -> &'m Metadata {
        self.metadata
    }

    /// Whether `self` and `metadata` refer to the same metadata instance.
    pub fn is_for(&self, metadata: &Metadata) -> bool {
        std::ptr::eq(self.metadata, metadata)
    }

    pub fn enable_all(&mut self) {
        for block in self.metadata.blocks() {
            self.words[block.index] = block_mask(&block);
        }
        self.clk = clk_mask(self.metadata.clk_cnt());
    }

    pub fn disable_all(&mut self) {
        self.words.fill(0);
        self.clk = 0;
    }

    /// Enables the value at logical `offset`.
    ///
    /// Offsets past the end of the metadata are ignored.
    pub fn enable(&mut self, offset: usize) {
        if let Some((word, bit)) = self.locate(offset) {
            self.words[word] |= 1 << bit;
        }
    }

    pub fn disable(&mut self, offset: usize) {
        if let Some((word, bit)) = self.locate(offset) {
            self.words[word] &= !(1 << bit);
        }
    }

    pub fn is_enabled(&self, offset: usize) -> bool {
        self.locate(offset)
            .is_some_and(|(word, bit)| self.words[word] & (1 << bit) != 0)
    }

    /// Enable bits of a block instance, bit `n` selecting value `n`.
    pub fn block(&self, block: &BlockInstance) -> u64 {
        self.words[block.index]
    }

    /// Replaces the enable bits of a block instance.
    ///
    /// Bits beyond the block's value count are dropped.
    pub fn set_block(&mut self, block: &BlockInstance, bits: u64) {
        self.words[block.index] = bits & block_mask(block);
    }

    /// Whether any value of the block instance is enabled.
    pub fn block_enabled(&self, block: &BlockInstance) -> bool {
        self.block(block) != 0
    }

    /// Whether any value or clock domain is enabled.
    pub fn any_enabled(&self) -> bool {
        self.clk != 0 || self.words.iter().any(|&w| w != 0)
    }

    /// Clock domain selection, bit `n` selecting domain `n`.
    pub fn clk(&self) -> u64 {
        self.clk
    }

    /// Replaces the clock domain selection.
    ///
    /// Domains the metadata does not have are dropped.
    pub fn set_clk(&mut self, clk: u64) {
        self.clk = clk & clk_mask(self.metadata.clk_cnt());
    }

    pub fn clk_enabled(&self, clk: usize) -> bool {
        clk < 64 && self.clk & (1 << clk) != 0
    }

    fn locate(&self, offset: usize) -> Option<(usize, usize)> {
        if offset >= self.metadata.value_cnt() {
            return None;
        }
        // Every instance has 64 values, so the offset splits directly.
        Some((offset / u64::BITS as usize, offset % u64::BITS as usize))
    }
}

impl PartialEq for EnableMap<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.metadata, other.metadata)
            && self.words == other.words
            && self.clk == other.clk
    }
}

impl Eq for EnableMap<'_> {}

pub(crate) fn block_mask(block: &BlockInstance) -> u64 {
    match block.value_cnt() {
        n if n >= 64 => u64::MAX,
        n => (1 << n) - 1,
    }
}

fn clk_mask(clk_cnt: u8) -> u64 {
    match clk_cnt {
        n if n >= 64 => u64::MAX,
        n => (1 << n) - 1,
    }
}

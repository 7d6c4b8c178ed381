//! Shadow instruction cache.
//!
//! One byte per guest instruction word for each memory region, telling whether the word has been translated. This gives
//! an O(1) "is this compiled" check without touching the block table, in the spirit of the per-instruction look-up
//! table of a cached interpreter. It never holds instruction bytes.

use crate::config::CacheConfig;

/// Marks a word that is not translated, or whose translation has been invalidated.
/// It corresponds to opcode 5, which is an invalid PowerPC instruction.
pub const ICACHE_INVALID_BYTE: u8 = 0x80;
/// Marks a word covered by a live block.
pub const ICACHE_COMPILED_BYTE: u8 = 0x01;

/// Memory regions with their own shadow cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ICacheRegion {
    Ram,
    ExRam,
    Vmem,
}

pub struct ShadowICache {
    ram: Box<[u8]>,
    exram: Box<[u8]>,
    vmem: Box<[u8]>,
    exram_bit: u32,
    vmem_bit: u32,
}

/// Converts a byte size into a shadow cache length.
const fn words(size: u32) -> usize {
    (size >> 2) as usize
}

impl ShadowICache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ram: vec![ICACHE_INVALID_BYTE; words(config.icache_size)].into_boxed_slice(),
            exram: vec![ICACHE_INVALID_BYTE; words(config.icache_ex_size)].into_boxed_slice(),
            vmem: vec![ICACHE_INVALID_BYTE; words(config.icache_vmem_size)].into_boxed_slice(),
            exram_bit: config.exram_bit,
            vmem_bit: config.vmem_bit,
        }
    }

    pub fn region(&self, address: u32) -> ICacheRegion {
        if address & self.vmem_bit != 0 {
            ICacheRegion::Vmem
        } else if address & self.exram_bit != 0 {
            ICacheRegion::ExRam
        } else {
            ICacheRegion::Ram
        }
    }

    fn slots(&self, region: ICacheRegion) -> &[u8] {
        match region {
            ICacheRegion::Ram => &self.ram,
            ICacheRegion::ExRam => &self.exram,
            ICacheRegion::Vmem => &self.vmem,
        }
    }

    fn slots_mut(&mut self, region: ICacheRegion) -> &mut [u8] {
        match region {
            ICacheRegion::Ram => &mut self.ram,
            ICacheRegion::ExRam => &mut self.exram,
            ICacheRegion::Vmem => &mut self.vmem,
        }
    }

    /// Returns the shadow byte of the word containing `address`.
    pub fn get(&self, address: u32) -> u8 {
        let slots = self.slots(self.region(address));
        slots[(address >> 2) as usize & (slots.len() - 1)]
    }

    pub fn is_compiled(&self, address: u32) -> bool {
        self.get(address) == ICACHE_COMPILED_BYTE
    }

    pub fn mark_compiled(&mut self, address: u32, length: u32) {
        self.fill(address, length, ICACHE_COMPILED_BYTE);
    }

    pub fn invalidate(&mut self, address: u32, length: u32) {
        self.fill(address, length, ICACHE_INVALID_BYTE);
    }

    /// Resets every region to [ICACHE_INVALID_BYTE].
    pub fn reset(&mut self) {
        self.ram.fill(ICACHE_INVALID_BYTE);
        self.exram.fill(ICACHE_INVALID_BYTE);
        self.vmem.fill(ICACHE_INVALID_BYTE);
    }

    /// Fills every word touched by `[address, address + length)`. The region is chosen from `address` and the window
    /// wraps around the region like the guest mirrors do.
    fn fill(&mut self, address: u32, length: u32, value: u8) {
        if length == 0 {
            return;
        }

        let region = self.region(address);
        let slots = self.slots_mut(region);
        let mask = slots.len() - 1;

        let first = address as u64 >> 2;
        let last = (address as u64 + length as u64 - 1) >> 2;
        let mut remaining = ((last - first + 1) as usize).min(slots.len());
        let mut index = first as usize & mask;

        while remaining > 0 {
            let n = remaining.min(slots.len() - index);
            slots[index..index + n].fill(value);
            remaining -= n;
            index = 0;
        }
    }
}

//! Address validity index.
//!
//! One bit per fixed-size chunk of physical address space, set when a compiled block covers the chunk. Invalidation
//! checks it before walking the range index, so stores to plain data stay cheap. Bits are only cleared by a full reset.
//!
//! Pages of bits are allocated on first use, so a guest touching a few megabytes of code only pays for those.

const PAGE_SHIFT: u32 = 12;
const CHUNKS_PER_PAGE: usize = 1 << PAGE_SHIFT;
const WORDS_PER_PAGE: usize = CHUNKS_PER_PAGE / 64;

type Page = Box<[u64; WORDS_PER_PAGE]>;

pub struct ValidBlockMap {
    pages: Vec<Option<Page>>,
    chunk_shift: u32,
    mask: u32,
}

impl ValidBlockMap {
    /// Creates an empty map over `[0, mask]`, with `1 << chunk_shift` bytes per bit.
    pub fn new(mask: u32, chunk_shift: u32) -> Self {
        let chunks = (mask as u64 + 1) >> chunk_shift;
        let pages = chunks.div_ceil(CHUNKS_PER_PAGE as u64).max(1) as usize;

        Self {
            pages: std::iter::repeat_with(|| None).take(pages).collect(),
            chunk_shift,
            mask,
        }
    }

    /// Range of chunk numbers touched by `[address, address + length)`. The window is clamped to the address space.
    fn chunks(&self, address: u32, length: u32) -> std::ops::RangeInclusive<u64> {
        let start = (address & self.mask) as u64;
        let end = (start + length as u64 - 1).min(self.mask as u64);
        (start >> self.chunk_shift)..=(end >> self.chunk_shift)
    }

    pub fn set_range(&mut self, address: u32, length: u32) {
        if length == 0 {
            return;
        }

        for chunk in self.chunks(address, length) {
            let chunk = chunk as usize;
            let page = self.pages[chunk >> PAGE_SHIFT].get_or_insert_with(|| Box::new([0; WORDS_PER_PAGE]));
            let bit = chunk & (CHUNKS_PER_PAGE - 1);
            page[bit / 64] |= 1 << (bit % 64);
        }
    }

    pub fn test(&self, address: u32) -> bool {
        let chunk = ((address & self.mask) >> self.chunk_shift) as usize;
        self.test_chunk(chunk)
    }

    fn test_chunk(&self, chunk: usize) -> bool {
        match &self.pages[chunk >> PAGE_SHIFT] {
            Some(page) => {
                let bit = chunk & (CHUNKS_PER_PAGE - 1);
                page[bit / 64] & (1 << (bit % 64)) != 0
            },
            None => false,
        }
    }

    /// Returns true if any chunk touched by `[address, address + length)` may contain compiled code.
    pub fn any_in_range(&self, address: u32, length: u32) -> bool {
        if length == 0 {
            return false;
        }

        let chunks = self.chunks(address, length);
        let mut chunk = *chunks.start() as usize;
        let last = *chunks.end() as usize;
        while chunk <= last {
            if self.pages[chunk >> PAGE_SHIFT].is_none() {
                // Skip the whole unallocated page.
                chunk = (chunk | (CHUNKS_PER_PAGE - 1)) + 1;
                continue;
            }

            if self.test_chunk(chunk) {
                return true;
            }
            chunk += 1;
        }

        false
    }

    pub fn clear(&mut self) {
        self.pages.iter_mut().for_each(|page| *page = None);
    }

    /// Number of allocated pages.
    #[cfg(test)]
    pub(crate) fn allocated_pages(&self) -> usize {
        self.pages.iter().filter(|page| page.is_some()).count()
    }
}

//! Cache controller: block allocation, finalization, invalidation and teardown.

use crate::arena::{CodeArena, CodePtr};
use crate::block::{BlockCode, BlockExit, BlockId, JitBlock};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::icache::ShadowICache;
use crate::links::PendingLinks;
use crate::patcher::{host_patcher, CodePatcher};
use crate::range_index::RangeIndex;
use crate::valid_blocks::ValidBlockMap;
use crate::CacheCommand;

use kanal::{unbounded, Receiver, Sender};

use std::collections::HashMap;

/// Counters for diagnostics. They never influence the cache behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub blocks_allocated: u64,
    pub blocks_finalized: u64,
    pub blocks_destroyed: u64,
    /// Blocks destroyed because a write overlapped them.
    pub blocks_invalidated: u64,
    pub allocation_failures: u64,
    pub links_made: u64,
    pub links_broken: u64,
    pub invalidations: u64,
    pub clears: u64,
}

/// The block cache.
///
/// One instance per emulated CPU, owned by the emulation session and lent to the translator, the dispatcher and the
/// memory write hooks. All mutation happens on the thread driving guest execution; other threads post
/// [CacheCommand]s instead.
pub struct BlockCache {
    pub(crate) config: CacheConfig,

    pub(crate) blocks: Vec<JitBlock>,
    /// Normal entry of each live block, indexed by block number.
    pub(crate) code_pointers: Vec<Option<CodePtr>>,
    pub(crate) by_start: HashMap<u32, BlockId>,
    /// Slots destroyed since the last allocation pass.
    pub(crate) retired: Vec<BlockId>,
    /// Slots available to the next allocation.
    pub(crate) free: Vec<BlockId>,

    pub(crate) range_index: RangeIndex,
    pub(crate) links: PendingLinks,
    pub(crate) valid_blocks: ValidBlockMap,
    pub(crate) icache: ShadowICache,

    pub(crate) code: CodeArena,
    pub(crate) patcher: Box<dyn CodePatcher>,

    /// The block the dispatcher last jumped into.
    pub(crate) executing: Option<BlockId>,
    /// True between [BlockCache::enter_block] and [BlockCache::return_to_dispatcher].
    pub(crate) in_generated_code: bool,
    /// Blocks destroyed while executing, whose own code is patched on return to the dispatcher.
    pub(crate) deferred: Vec<BlockId>,
    /// Arena length at the last safe clear, reclaimed on return to the dispatcher.
    pub(crate) reclaim_watermark: Option<usize>,

    pub(crate) commands_in: Receiver<CacheCommand>,
    pub(crate) commands_out: Sender<CacheCommand>,

    pub(crate) stats: CacheStats,
}

impl BlockCache {
    /// Creates an empty cache patching code with `patcher`.
    pub fn new(config: CacheConfig, patcher: Box<dyn CodePatcher>) -> Result<Self, CacheError> {
        config.validate()?;

        let mut code = if patcher.needs_executable_memory() {
            CodeArena::executable(config.code_size)?
        } else {
            CodeArena::new(config.code_size)
        };
        let dispatcher = patcher.emit_dispatcher_stub(&mut code)?;
        code.finish_prelude(dispatcher);

        let (commands_out, commands_in) = unbounded();

        log::debug!("New block cache: {} blocks, {:#X} bytes of code, {} patcher", config.max_blocks, config.code_size, patcher.name());

        Ok(Self {
            blocks: Vec::new(),
            code_pointers: Vec::new(),
            by_start: HashMap::new(),
            retired: Vec::new(),
            free: Vec::new(),

            range_index: RangeIndex::new(),
            links: PendingLinks::new(),
            valid_blocks: ValidBlockMap::new(config.physical_mask, config.valid_chunk_shift),
            icache: ShadowICache::new(&config),

            code,
            patcher,

            executing: None,
            in_generated_code: false,
            deferred: Vec::new(),
            reclaim_watermark: None,

            commands_in,
            commands_out,

            stats: CacheStats::default(),
            config,
        })
    }

    /// Creates an empty cache using the patcher of the host.
    pub fn with_host_patcher(config: CacheConfig) -> Result<Self, CacheError> {
        Self::new(config, host_patcher())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn patcher(&self) -> &dyn CodePatcher {
        self.patcher.as_ref()
    }

    pub fn patcher_name(&self) -> &'static str {
        self.patcher.name()
    }

    /// The generated code arena.
    pub fn code(&self) -> &CodeArena {
        &self.code
    }

    /// The generated code arena, for the translator to emit blocks into.
    pub fn code_mut(&mut self) -> &mut CodeArena {
        &mut self.code
    }

    pub fn icache(&self) -> &ShadowICache {
        &self.icache
    }

    pub fn block(&self, id: BlockId) -> Option<&JitBlock> {
        self.blocks.get(id.0)
    }

    /// Number of slots in use in the block table, destroyed ones included.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Normal entry of every live block, indexed by block number.
    pub fn code_pointers(&self) -> &[Option<CodePtr>] {
        &self.code_pointers
    }

    /// Where the dispatcher jumps to run `id`.
    pub fn compiled_code(&self, id: BlockId) -> Option<CodePtr> {
        self.code_pointers.get(id.0).copied().flatten()
    }

    /// Iterates over the live blocks.
    pub fn live_blocks(&self) -> impl Iterator<Item = (BlockId, &JitBlock)> {
        self.blocks.iter().enumerate().filter(|(_, b)| b.is_live()).map(|(i, b)| (BlockId(i), b))
    }

    pub(crate) fn physical(&self, address: u32) -> u32 {
        address & self.config.physical_mask
    }

    /// Returns true if the next [BlockCache::allocate_block] would fail.
    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.config.max_blocks && self.free.is_empty() && self.retired.is_empty()
    }

    /// Reserves a block starting at guest address `start`.
    ///
    /// Slots of blocks destroyed since the previous call become reusable here, the one that last held a block at
    /// `start` first. Returns [CacheError::Full] when no slot is left; the caller should clear the cache and retry.
    pub fn allocate_block(&mut self, start: u32) -> Result<BlockId, CacheError> {
        self.free.append(&mut self.retired);

        let id = if let Some(pos) = self.free.iter().rposition(|id| self.blocks[id.0].original_address == start) {
            self.free.swap_remove(pos)
        } else if self.blocks.len() < self.config.max_blocks {
            self.blocks.push(JitBlock::new(start));
            self.code_pointers.push(None);
            BlockId(self.blocks.len() - 1)
        } else if let Some(id) = self.free.pop() {
            id
        } else {
            log::warn!("Block cache full ({} blocks), cannot allocate at {:#010X}", self.config.max_blocks, start);
            self.stats.allocation_failures += 1;
            return Err(CacheError::Full { capacity: self.config.max_blocks });
        };

        self.blocks[id.0] = JitBlock::new(start);
        self.code_pointers[id.0] = None;
        self.stats.blocks_allocated += 1;
        log::trace!("Allocated {id} at {start:#010X}");

        Ok(id)
    }

    /// Completes a block once its code has been emitted, registers it and links it if `should_link`.
    ///
    /// A live block already starting at the same address is destroyed first.
    pub fn finalize_block(&mut self, id: BlockId, should_link: bool, code: BlockCode) -> Result<(), CacheError> {
        let block = self.blocks.get(id.0).ok_or(CacheError::UnknownBlock(id))?;
        if block.invalid {
            return Err(CacheError::InvalidBlock(id));
        }
        if block.finalized {
            return Err(CacheError::AlreadyFinalized(id));
        }
        if code.original_size == 0 {
            return Err(CacheError::EmptyBlock(id));
        }

        let start = block.original_address;
        if start as u64 + code.original_size as u64 > 1 << 32 {
            return Err(CacheError::RangeOverflow { start, size: code.original_size });
        }

        self.check_code(code.checked_entry, code.code_size.max(self.patcher.entry_patch_size()))?;
        self.check_code(code.normal_entry, 1)?;
        for site in code.exits.iter().flatten() {
            self.check_code(site.patch, self.patcher.exit_patch_size())?;
        }

        if let Some(&old) = self.by_start.get(&start) {
            if old != id {
                log::debug!("{id} replaces {old} at {start:#010X}");
                self.destroy_block(old, false);
            }
        }

        let block = &mut self.blocks[id.0];
        block.original_size = code.original_size;
        block.code_size = code.code_size;
        block.checked_entry = code.checked_entry;
        block.normal_entry = code.normal_entry;
        block.flags = code.flags;
        block.exits = code.exits.map(|site| match site {
            Some(site) => BlockExit { patch: Some(site.patch), target: site.target, linked: false },
            None => BlockExit::default(),
        });
        block.finalized = true;

        let phys = self.physical(start);
        self.code_pointers[id.0] = Some(code.normal_entry);
        self.by_start.insert(start, id);
        self.range_index.insert(phys, code.original_size, id);
        self.icache.mark_compiled(start, code.original_size);
        self.valid_blocks.set_range(phys, code.original_size);
        self.stats.blocks_finalized += 1;
        log::trace!("Finalized {id}: {start:#010X}+{:#X} -> {}+{:#X}", code.original_size, code.checked_entry, code.code_size);

        if should_link {
            self.link_block(id);
        }
        self.seal_code();

        Ok(())
    }

    fn check_code(&self, ptr: CodePtr, len: usize) -> Result<(), CacheError> {
        if self.code.contains(ptr, len) {
            Ok(())
        } else {
            Err(CacheError::CodeOutOfBounds { ptr, len })
        }
    }

    /// Returns the live block whose first instruction is at `address`.
    ///
    /// Addresses inside a block never match: jumping into the middle of a block requires a new translation.
    pub fn block_number_from_start_address(&self, address: u32) -> Option<BlockId> {
        if !self.icache.is_compiled(address) {
            return None;
        }

        let id = *self.by_start.get(&address)?;
        self.blocks[id.0].is_live().then_some(id)
    }

    /// Discards every translation overlapping `[address, address + length)`.
    ///
    /// Called for the guest's instruction cache invalidation instruction and for stores that hit compiled code.
    pub fn invalidate_icache(&mut self, address: u32, length: u32) {
        if length == 0 {
            return;
        }

        self.stats.invalidations += 1;
        self.icache.invalidate(address, length);

        let phys = self.physical(address);
        if !self.valid_blocks.any_in_range(phys, length) {
            return;
        }

        let hits = self.range_index.intersecting(phys, length);
        if !hits.is_empty() {
            log::debug!("Write to {address:#010X}+{length:#X} invalidates {} block(s)", hits.len());
        }

        for id in hits {
            self.destroy_block(id, true);
            self.stats.blocks_invalidated += 1;
        }
    }

    /// Destroys a block, sending every exit linked to it back to the dispatcher first.
    ///
    /// If `invalidate_icache`, its guest range is also marked as not compiled in the shadow cache. When `id` is the
    /// executing block, patching its own code waits for [BlockCache::return_to_dispatcher]. The slot becomes reusable
    /// at the next allocation.
    pub fn destroy_block(&mut self, id: BlockId, invalidate_icache: bool) {
        let Some(block) = self.blocks.get_mut(id.0) else {
            log::warn!("Destroying {id}, which does not exist");
            return;
        };

        if block.invalid {
            if invalidate_icache {
                log::warn!("Invalidating {id}, which is already destroyed");
            }
            return;
        }

        block.invalid = true;
        let block = block.clone();
        self.code_pointers[id.0] = None;
        self.stats.blocks_destroyed += 1;

        if !block.finalized {
            log::trace!("Destroyed unfinalized {id}");
            self.retired.push(id);
            return;
        }

        let start = block.original_address;
        if self.by_start.get(&start) == Some(&id) {
            self.by_start.remove(&start);
        }
        let phys = self.physical(start);
        self.range_index.remove(phys, block.original_size, id);

        // Exits looping back to this block count as inbound, so they are unlinked even while it executes.
        self.unlink_inbound(id);
        for (slot, exit) in block.exits.iter().enumerate() {
            if let Some(target) = exit.target {
                self.links.remove(target, (id, slot));
            }
        }

        if invalidate_icache {
            self.icache.invalidate(start, block.original_size);
            // Live blocks sharing part of the range keep their marks.
            for other in self.range_index.intersecting(phys, block.original_size) {
                let other = &self.blocks[other.0];
                self.icache.mark_compiled(other.original_address, other.original_size);
            }
        }

        if self.in_generated_code && self.executing == Some(id) {
            log::debug!("{id} destroyed while executing, patching deferred");
            self.deferred.push(id);
        } else {
            self.retire_code(id);
        }
        self.seal_code();

        log::trace!("Destroyed {id} at {start:#010X}");
    }

    /// Physical phase of a destruction: unlinks the block's own exits, redirects its checked entry to the dispatcher,
    /// and hands the slot to the next allocation pass.
    pub(crate) fn retire_code(&mut self, id: BlockId) {
        self.unlink_block(id);

        let block = &self.blocks[id.0];
        if let Err(e) = self.patcher.write_destroy_stub(&mut self.code, block.checked_entry, block.original_address) {
            log::warn!("Cannot write destroy stub of {id}: {e}");
        }

        self.retired.push(id);
    }

    fn clear_tables(&mut self) {
        self.blocks.clear();
        self.code_pointers.clear();
        self.by_start.clear();
        self.retired.clear();
        self.free.clear();
        self.deferred.clear();
        self.executing = None;

        self.range_index.clear();
        self.links.clear();
        self.valid_blocks.clear();
        self.icache.reset();
    }

    /// Drops every block and all generated code.
    ///
    /// Must be called from the dispatcher. Called from generated code, it logs a warning and behaves as
    /// [BlockCache::clear_safe].
    pub fn clear(&mut self) {
        if self.in_generated_code {
            log::warn!("Full clear requested from generated code, deferring reclamation");
            self.clear_safe();
            return;
        }

        if self.is_full() {
            log::info!("Block cache full ({} blocks), clearing", self.blocks.len());
        } else {
            log::info!("Clearing code cache ({} blocks)", self.blocks.len());
        }

        self.clear_tables();
        self.code.reset();
        self.reclaim_watermark = None;
        self.stats.clears += 1;
    }

    /// Drops every block, but leaves the generated code in place until the next
    /// [BlockCache::return_to_dispatcher].
    ///
    /// The executing block's code is not touched. Every other block gets its destroy stub, so chained jumps still
    /// in flight end up in the dispatcher instead of in stale code.
    pub fn clear_safe(&mut self) {
        log::info!("Safely clearing code cache ({} blocks)", self.blocks.len());

        let executing = if self.in_generated_code { self.executing } else { None };
        for (index, block) in self.blocks.iter().enumerate() {
            if block.is_live() && executing != Some(BlockId(index)) {
                if let Err(e) = self.patcher.write_destroy_stub(&mut self.code, block.checked_entry, block.original_address) {
                    log::warn!("Cannot write destroy stub of block #{index}: {e}");
                }
            }
        }

        self.clear_tables();
        self.reclaim_watermark = Some(self.code.len());
        self.stats.clears += 1;
        self.seal_code();
    }

    /// Clears the cache and its statistics.
    pub fn reset(&mut self) {
        self.clear();
        self.stats = CacheStats::default();
    }
}

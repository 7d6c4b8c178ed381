//! Direct block-to-block linking.
//!
//! An exit is linked when its jump goes straight to the checked entry of the block at its target address instead of
//! back through the dispatcher. Every exit with a known target is recorded in the pending links table, linked or
//! not, so a block compiled later at that address can find and patch it.

use crate::arena::CodePtr;
use crate::block::BlockId;
use crate::cache::BlockCache;

impl BlockCache {
    /// Links the exits of `id` to already compiled blocks, then links to `id` every exit waiting for its address.
    pub fn link_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get(id.0).filter(|b| b.is_live()) else {
            return;
        };
        let start = block.original_address;

        self.link_block_exits(id);

        let sources = self.links.sources(start).to_vec();
        for (source, _) in sources {
            if source != id {
                self.link_block_exits(source);
            }
        }
    }

    /// Registers the exits of `id` and patches those whose target is compiled.
    ///
    /// Already linked exits are left untouched, so linking twice is the same as linking once.
    pub fn link_block_exits(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get(id.0).filter(|b| b.is_live()) else {
            return;
        };
        let exits = block.exits;

        for (slot, exit) in exits.iter().enumerate() {
            let (Some(patch), Some(target)) = (exit.patch, exit.target) else {
                continue;
            };

            self.links.insert(target, (id, slot));
            if exit.linked {
                continue;
            }

            let Some(dest) = self.block_number_from_start_address(target) else {
                continue;
            };
            let entry = self.blocks[dest.0].checked_entry;

            match self.patcher.patch_direct_jump(&mut self.code, patch, entry) {
                Ok(()) => {
                    self.blocks[id.0].exits[slot].linked = true;
                    self.stats.links_made += 1;
                    log::trace!("Linked exit {slot} of {id} to {dest}");
                },
                Err(e) => log::warn!("Cannot link exit {slot} of {id} to {dest}: {e}"),
            }
        }

        self.seal_code();
    }

    /// Sends every linked exit of `id` back to the dispatcher. The exits stay registered.
    pub fn unlink_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get(id.0) else {
            return;
        };
        let exits = block.exits;

        for (slot, exit) in exits.iter().enumerate() {
            if let (true, Some(patch)) = (exit.linked, exit.patch) {
                self.unlink_exit(id, slot, patch);
            }
        }

        self.seal_code();
    }

    /// Sends every exit linked to `id` back to the dispatcher.
    pub(crate) fn unlink_inbound(&mut self, id: BlockId) {
        let start = self.blocks[id.0].original_address;

        for (source, slot) in self.links.sources(start).to_vec() {
            let exit = self.blocks[source.0].exits[slot];
            if let (true, Some(patch)) = (exit.linked, exit.patch) {
                self.unlink_exit(source, slot, patch);
            }
        }
    }

    fn unlink_exit(&mut self, id: BlockId, slot: usize, patch: CodePtr) {
        match self.patcher.patch_return_to_dispatcher(&mut self.code, patch) {
            Ok(()) => {
                self.blocks[id.0].exits[slot].linked = false;
                self.stats.links_broken += 1;
            },
            Err(e) => log::warn!("Cannot unlink exit {slot} of {id}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::CodePtr;
    use crate::block::{BlockCode, BlockId, ExitSite};
    use crate::cache::BlockCache;
    use crate::config::CacheConfig;
    use crate::patcher::CodePatcher;
    use crate::threaded::{Record, ThreadedPatcher, RECORD_SIZE};

    fn cache() -> BlockCache {
        let config = CacheConfig {
            max_blocks: 16,
            icache_size: 0x10_0000,
            icache_ex_size: 0x10_0000,
            icache_vmem_size: 0x10_0000,
            code_size: 0x1000,
            ..CacheConfig::default()
        };
        BlockCache::new(config, Box::new(ThreadedPatcher)).unwrap()
    }

    /// Emits a block whose exits start as returns to the dispatcher.
    fn compile(cache: &mut BlockCache, start: u32, size: u32, targets: [Option<u32>; 2], link: bool) -> BlockId {
        let id = cache.allocate_block(start).unwrap();
        let code = cache.code_mut();
        let entry = code.emit(&[0; RECORD_SIZE]).unwrap();
        let exits = targets.map(|target| {
            target.map(|target| {
                let patch = code.reserve(RECORD_SIZE).unwrap();
                ExitSite { patch, target: Some(target) }
            })
        });
        let code_size = code.len() - entry.offset();

        let dispatcher = code.dispatcher();
        for site in exits.iter().flatten() {
            ThreadedPatcher.patch_direct_jump(code, site.patch, dispatcher).unwrap();
        }

        let code = BlockCode { original_size: size, normal_entry: entry, checked_entry: entry, code_size, exits, flags: 0 };
        cache.finalize_block(id, link, code).unwrap();
        id
    }

    fn exit_target(cache: &BlockCache, id: BlockId, slot: usize) -> Option<Record> {
        let patch: CodePtr = cache.block(id).unwrap().exits[slot].patch.unwrap();
        ThreadedPatcher::decode(cache.code(), patch)
    }

    #[test]
    fn later_block_links_waiting_exit() {
        let mut cache = cache();
        let a = compile(&mut cache, 0x8000_1000, 0x40, [Some(0x8000_1040), None], true);
        assert!(!cache.block(a).unwrap().exits[0].linked);
        assert!(cache.links.contains(0x8000_1040, (a, 0)));

        let b = compile(&mut cache, 0x8000_1040, 0x40, [None, None], true);
        assert!(cache.block(a).unwrap().exits[0].linked);
        assert_eq!(exit_target(&cache, a, 0), Some(Record::Jump(cache.block(b).unwrap().checked_entry)));
        assert_eq!(cache.stats().links_made, 1);
    }

    #[test]
    fn linking_twice_changes_nothing() {
        let mut cache = cache();
        let b = compile(&mut cache, 0x8000_1040, 0x40, [None, None], true);
        let a = compile(&mut cache, 0x8000_1000, 0x40, [Some(0x8000_1040), Some(0x8000_1040)], true);

        let links = cache.links.len();
        cache.link_block(a);
        cache.link_block(b);
        cache.link_block_exits(a);

        assert_eq!(cache.links.len(), links);
        assert_eq!(cache.stats().links_made, 2);
        assert!(cache.block(a).unwrap().exits.iter().all(|e| e.linked));
    }

    #[test]
    fn unlinked_finalize_leaves_exits_pending() {
        let mut cache = cache();
        compile(&mut cache, 0x8000_1040, 0x40, [None, None], true);
        let a = compile(&mut cache, 0x8000_1000, 0x40, [Some(0x8000_1040), None], false);

        assert!(!cache.block(a).unwrap().exits[0].linked);
        assert!(!cache.links.contains(0x8000_1040, (a, 0)));

        cache.link_block(a);
        assert!(cache.block(a).unwrap().exits[0].linked);
    }

    #[test]
    fn unlink_then_relink() {
        let mut cache = cache();
        let b = compile(&mut cache, 0x8000_1040, 0x40, [None, None], true);
        let a = compile(&mut cache, 0x8000_1000, 0x40, [Some(0x8000_1040), None], true);

        cache.unlink_block(a);
        assert!(!cache.block(a).unwrap().exits[0].linked);
        assert_eq!(cache.patcher().jump_target(cache.code(), cache.block(a).unwrap().exits[0].patch.unwrap()), Some(cache.code().dispatcher()));
        assert!(cache.links.contains(0x8000_1040, (a, 0)));

        cache.link_block(b);
        assert!(cache.block(a).unwrap().exits[0].linked);
    }

    #[test]
    fn self_loop_links_to_itself() {
        let mut cache = cache();
        let a = compile(&mut cache, 0x8000_2000, 0x20, [Some(0x8000_2000), None], true);
        assert_eq!(exit_target(&cache, a, 0), Some(Record::Jump(cache.block(a).unwrap().checked_entry)));

        cache.destroy_block(a, true);
        assert!(cache.links.is_empty());
        assert_eq!(cache.patcher().jump_target(cache.code(), cache.block(a).unwrap().exits[0].patch.unwrap()), Some(cache.code().dispatcher()));
    }

    #[test]
    fn exits_to_mid_block_addresses_stay_unlinked() {
        let mut cache = cache();
        compile(&mut cache, 0x8000_1000, 0x40, [None, None], true);
        let a = compile(&mut cache, 0x8000_3000, 0x40, [Some(0x8000_1020), None], true);
        assert!(!cache.block(a).unwrap().exits[0].linked);
    }
}

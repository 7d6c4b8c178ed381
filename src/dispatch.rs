//! Dispatcher hand-off.
//!
//! The cache never runs generated code itself. The dispatcher tells it when control enters a block and when it comes
//! back, which are the only points where code that may be on the host stack can safely be rewritten or reclaimed.

use crate::arena::CodePtr;
use crate::block::BlockId;
use crate::cache::BlockCache;
use crate::error::CacheError;
use crate::CacheCommand;

use kanal::Sender;

impl BlockCache {
    /// Marks `id` as executing, makes the generated code runnable and returns where the dispatcher has to jump.
    ///
    /// Fails if the block is not live, in which case the dispatcher must look it up again.
    pub fn enter_block(&mut self, id: BlockId) -> Result<CodePtr, CacheError> {
        let block = self.blocks.get(id.0).ok_or(CacheError::UnknownBlock(id))?;
        if !block.is_live() {
            return Err(CacheError::InvalidBlock(id));
        }
        let entry = block.normal_entry;

        self.code.make_executable()?;
        self.blocks[id.0].run_count += 1;
        self.executing = Some(id);
        self.in_generated_code = true;

        Ok(entry)
    }

    /// The block last entered, while control has not come back to the dispatcher.
    pub fn executing(&self) -> Option<BlockId> {
        if self.in_generated_code {
            self.executing
        } else {
            None
        }
    }

    /// Returns true between [BlockCache::enter_block] and [BlockCache::return_to_dispatcher].
    pub fn in_generated_code(&self) -> bool {
        self.in_generated_code
    }

    /// Makes patched code runnable again when the host may still be running it.
    pub(crate) fn seal_code(&mut self) {
        if self.in_generated_code {
            if let Err(e) = self.code.make_executable() {
                log::error!("Generated code left writable: {e}");
            }
        }
    }

    /// Called by the dispatcher each time generated code gives control back.
    ///
    /// Finishes the destruction of blocks destroyed while they were executing, reclaims the code arena after a safe
    /// clear, then handles the commands posted through [BlockCache::command_sender].
    pub fn return_to_dispatcher(&mut self) {
        self.executing = None;
        self.in_generated_code = false;

        for id in std::mem::take(&mut self.deferred) {
            self.retire_code(id);
        }

        if let Some(watermark) = self.reclaim_watermark.take() {
            // Blocks compiled since the safe clear live above the watermark.
            if self.code.len() == watermark {
                log::debug!("Reclaiming {:#X} bytes of code after safe clear", watermark);
                self.code.reset();
            } else {
                log::debug!("Code emitted since safe clear, reclamation postponed to the next full clear");
            }
        }

        self.handle_commands();
    }

    /// Returns a handle other threads can use to request invalidations and clears.
    ///
    /// Requests are applied the next time control returns to the dispatcher.
    pub fn command_sender(&self) -> Sender<CacheCommand> {
        self.commands_out.clone()
    }

    /// Applies the pending commands. Returns the number of commands handled.
    pub fn handle_commands(&mut self) -> usize {
        let mut handled = 0;

        while !self.commands_in.is_empty() {
            let Ok(cmd) = self.commands_in.recv() else {
                break;
            };

            match cmd {
                CacheCommand::Invalidate { address, length } => self.invalidate_icache(address, length),
                CacheCommand::Clear => self.clear(),
            }

            handled += 1;
        }

        handled
    }
}

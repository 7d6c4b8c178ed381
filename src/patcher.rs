//! Host code patching.
//!
//! Linking rewrites jumps inside generated code, which is the only part of the cache that depends on the host
//! instruction set. Each host provides a [CodePatcher], picked once at startup by [host_patcher].

use crate::arena::{CodeArena, CodePtr};
use crate::error::CacheError;

/// Host specific encoding of the jumps the cache rewrites.
pub trait CodePatcher {
    fn name(&self) -> &'static str;

    /// Returns true if the code is run by the host CPU, so the arena has to live in executable memory.
    fn needs_executable_memory(&self) -> bool {
        false
    }

    /// Bytes the translator must reserve at each exit site.
    fn exit_patch_size(&self) -> usize;

    /// Bytes the translator must reserve at each checked entry, for [CodePatcher::write_destroy_stub].
    fn entry_patch_size(&self) -> usize;

    /// Emits the shared stub that gives control back to the dispatcher, and returns where it starts.
    fn emit_dispatcher_stub(&self, code: &mut CodeArena) -> Result<CodePtr, CacheError>;

    /// Rewrites the exit jump at `location` to go straight to `target`.
    fn patch_direct_jump(&self, code: &mut CodeArena, location: CodePtr, target: CodePtr) -> Result<(), CacheError>;

    /// Rewrites the exit jump at `location` to go back to the dispatcher.
    fn patch_return_to_dispatcher(&self, code: &mut CodeArena, location: CodePtr) -> Result<(), CacheError> {
        let dispatcher = code.dispatcher();
        self.patch_direct_jump(code, location, dispatcher)
    }

    /// Overwrites the checked entry of a destroyed block so that anything still jumping there sets the guest PC to
    /// `guest_address` and returns to the dispatcher.
    fn write_destroy_stub(&self, code: &mut CodeArena, location: CodePtr, guest_address: u32) -> Result<(), CacheError>;

    /// Decodes where the jump at `location` goes, if it is a jump this patcher wrote.
    fn jump_target(&self, code: &CodeArena, location: CodePtr) -> Option<CodePtr>;
}

/// Byte sink used to encode patches.
pub trait CodeSink {
    fn push_8(&mut self, _: u8);
    /// Little-endian
    fn push_32(&mut self, _: u32);
    /// Little-endian
    fn push_64(&mut self, _: u64);
}

impl CodeSink for Vec<u8> {
    fn push_8(&mut self, byte: u8) {
        self.push(byte);
    }

    fn push_32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_le_bytes());
    }

    fn push_64(&mut self, value: u64) {
        self.extend_from_slice(&value.to_le_bytes());
    }
}

/// Returns the native patcher of the host, or the threaded-code one when there is none.
pub fn host_patcher() -> Box<dyn CodePatcher> {
    #[cfg(target_arch = "x86_64")]
    {
        Box::new(crate::x64::X64Patcher)
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        Box::new(crate::threaded::ThreadedPatcher)
    }
}

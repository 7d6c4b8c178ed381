//! Threaded-code patcher.
//!
//! Used on hosts without a native backend, and by cached interpreters whose "generated code" is a stream of records
//! walked by the dispatcher. Every patchable site is one fixed-size record: an opcode byte followed by a little-endian
//! 64-bit payload.

use crate::arena::{CodeArena, CodePtr};
use crate::error::CacheError;
use crate::patcher::{CodePatcher, CodeSink};

/// Continue at the arena offset in the payload.
pub const OP_JUMP: u8 = 0xE9;
/// Set the guest PC to the payload and return to the dispatcher.
pub const OP_EXIT: u8 = 0xEA;
/// Return to the dispatcher, the guest PC is already set.
pub const OP_RETURN: u8 = 0xC3;

pub const RECORD_SIZE: usize = 9;

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadedPatcher;

/// A decoded threaded-code record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Record {
    Jump(CodePtr),
    Exit(u32),
    Return,
}

impl ThreadedPatcher {
    fn record(op: u8, payload: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RECORD_SIZE);
        bytes.push_8(op);
        bytes.push_64(payload);
        bytes
    }

    /// Decodes the record at `location`.
    pub fn decode(code: &CodeArena, location: CodePtr) -> Option<Record> {
        let bytes = code.bytes(location, RECORD_SIZE)?;
        let mut payload = [0; 8];
        payload.copy_from_slice(&bytes[1..]);
        let payload = u64::from_le_bytes(payload);

        match bytes[0] {
            OP_JUMP => Some(Record::Jump(CodePtr(payload as usize))),
            OP_EXIT => Some(Record::Exit(payload as u32)),
            OP_RETURN => Some(Record::Return),
            _ => None,
        }
    }
}

impl CodePatcher for ThreadedPatcher {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn exit_patch_size(&self) -> usize {
        RECORD_SIZE
    }

    fn entry_patch_size(&self) -> usize {
        RECORD_SIZE
    }

    fn emit_dispatcher_stub(&self, code: &mut CodeArena) -> Result<CodePtr, CacheError> {
        code.emit(&Self::record(OP_RETURN, 0))
    }

    fn patch_direct_jump(&self, code: &mut CodeArena, location: CodePtr, target: CodePtr) -> Result<(), CacheError> {
        code.write(location, &Self::record(OP_JUMP, target.0 as u64))
    }

    fn write_destroy_stub(&self, code: &mut CodeArena, location: CodePtr, guest_address: u32) -> Result<(), CacheError> {
        code.write(location, &Self::record(OP_EXIT, guest_address as u64))
    }

    fn jump_target(&self, code: &CodeArena, location: CodePtr) -> Option<CodePtr> {
        match Self::decode(code, location)? {
            Record::Jump(target) => Some(target),
            Record::Exit(_) => Some(code.dispatcher()),
            Record::Return => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_decode() {
        let mut code = CodeArena::new(0x40);
        let stub = ThreadedPatcher.emit_dispatcher_stub(&mut code).unwrap();
        code.finish_prelude(stub);
        assert_eq!(ThreadedPatcher::decode(&code, stub), Some(Record::Return));

        let site = code.reserve(RECORD_SIZE).unwrap();
        assert_eq!(ThreadedPatcher::decode(&code, site), None);

        ThreadedPatcher.patch_direct_jump(&mut code, site, CodePtr(0x24)).unwrap();
        assert_eq!(ThreadedPatcher::decode(&code, site), Some(Record::Jump(CodePtr(0x24))));

        ThreadedPatcher.write_destroy_stub(&mut code, site, 0x8000_1040).unwrap();
        assert_eq!(ThreadedPatcher::decode(&code, site), Some(Record::Exit(0x8000_1040)));
        assert_eq!(ThreadedPatcher.jump_target(&code, site), Some(stub));
    }

    #[test]
    fn patches_outside_emitted_code_fail() {
        let mut code = CodeArena::new(0x40);
        code.emit(&[0; 4]).unwrap();
        assert!(ThreadedPatcher.patch_direct_jump(&mut code, CodePtr(0), CodePtr(0)).is_err());
    }
}

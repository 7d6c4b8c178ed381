//! x86-64 patcher.
//!
//! Exits are `mov rax, imm64; jmp rax` so a link can reach anywhere in the address space. RAX is scratch at every exit,
//! and EAX carries the guest PC back to the dispatcher like every other block return.

use crate::arena::{CodeArena, CodePtr};
use crate::error::CacheError;
use crate::patcher::CodePatcher;

use dynasmrt::{dynasm, DynasmApi, VecAssembler};
use dynasmrt::x64::X64Relocation;

/// `mov rax, imm64` (10) + `jmp rax` (2).
pub const EXIT_PATCH_SIZE: usize = 12;
/// `mov eax, imm32` (5) + `mov rcx, imm64` (10) + `jmp rcx` (2).
pub const ENTRY_PATCH_SIZE: usize = 17;

#[derive(Clone, Copy, Debug, Default)]
pub struct X64Patcher;

type Ops = VecAssembler<X64Relocation>;

fn assemble(at: usize, emit: impl FnOnce(&mut Ops)) -> Result<Vec<u8>, CacheError> {
    let mut ops = Ops::new(at);
    emit(&mut ops);
    ops.finalize().map_err(|e| CacheError::Assembler(format!("{e:?}")))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut value = [0; 8];
    value.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(value)
}

impl CodePatcher for X64Patcher {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn needs_executable_memory(&self) -> bool {
        true
    }

    fn exit_patch_size(&self) -> usize {
        EXIT_PATCH_SIZE
    }

    fn entry_patch_size(&self) -> usize {
        ENTRY_PATCH_SIZE
    }

    fn emit_dispatcher_stub(&self, code: &mut CodeArena) -> Result<CodePtr, CacheError> {
        let at = code.host_address(code.code_ptr());
        let stub = assemble(at, |ops| {
            dynasm!(ops
                ; .arch x64
                ; ret
            );
        })?;
        code.emit(&stub)
    }

    fn patch_direct_jump(&self, code: &mut CodeArena, location: CodePtr, target: CodePtr) -> Result<(), CacheError> {
        let target = code.host_address(target);
        let jump = assemble(code.host_address(location), |ops| {
            dynasm!(ops
                ; .arch x64
                ; mov rax, QWORD target as i64
                ; jmp rax
            );
        })?;
        code.write(location, &jump)
    }

    fn write_destroy_stub(&self, code: &mut CodeArena, location: CodePtr, guest_address: u32) -> Result<(), CacheError> {
        let dispatcher = code.host_address(code.dispatcher());
        let stub = assemble(code.host_address(location), |ops| {
            dynasm!(ops
                ; .arch x64
                ; mov eax, DWORD guest_address as i32
                ; mov rcx, QWORD dispatcher as i64
                ; jmp rcx
            );
        })?;
        code.write(location, &stub)
    }

    fn jump_target(&self, code: &CodeArena, location: CodePtr) -> Option<CodePtr> {
        let bytes = code.bytes(location, EXIT_PATCH_SIZE)?;
        if bytes[..2] == [0x48, 0xB8] && bytes[10..12] == [0xFF, 0xE0] {
            return code.from_host_address(read_u64(&bytes[2..]) as usize);
        }

        let bytes = code.bytes(location, ENTRY_PATCH_SIZE)?;
        if bytes[0] == 0xB8 && bytes[5..7] == [0x48, 0xB9] && bytes[15..17] == [0xFF, 0xE1] {
            return code.from_host_address(read_u64(&bytes[7..]) as usize);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_jump_encoding() {
        let mut code = CodeArena::new(0x100);
        let stub = X64Patcher.emit_dispatcher_stub(&mut code).unwrap();
        code.finish_prelude(stub);
        assert_eq!(code.bytes(stub, 1), Some(&[0xC3][..]));

        let site = code.reserve(EXIT_PATCH_SIZE).unwrap();
        X64Patcher.patch_direct_jump(&mut code, site, stub).unwrap();

        let bytes = code.bytes(site, EXIT_PATCH_SIZE).unwrap();
        assert_eq!(bytes[..2], [0x48, 0xB8]);
        assert_eq!(read_u64(&bytes[2..]) as usize, code.host_address(stub));
        assert_eq!(bytes[10..], [0xFF, 0xE0]);
    }

    #[test]
    fn destroy_stub_encoding() {
        let mut code = CodeArena::new(0x100);
        let stub = X64Patcher.emit_dispatcher_stub(&mut code).unwrap();
        code.finish_prelude(stub);

        let entry = code.emit(&[0x90; 0x20]).unwrap();
        X64Patcher.write_destroy_stub(&mut code, entry, 0x8000_1040).unwrap();

        let bytes = code.bytes(entry, ENTRY_PATCH_SIZE).unwrap();
        assert_eq!(bytes[..5], [0xB8, 0x40, 0x10, 0x00, 0x80]);
        assert_eq!(X64Patcher.jump_target(&code, entry), Some(stub));
        // The rest of the block is left alone.
        assert_eq!(code.bytes(entry.add(ENTRY_PATCH_SIZE), 1), Some(&[0x90][..]));
    }

    #[test]
    fn patched_code_runs() {
        let mut code = CodeArena::executable(0x1000).unwrap();
        let stub = X64Patcher.emit_dispatcher_stub(&mut code).unwrap();
        code.finish_prelude(stub);

        // mov eax, 42; ret; padded up to the destroy stub size.
        let mut target = vec![0xB8, 42, 0, 0, 0, 0xC3];
        target.resize(ENTRY_PATCH_SIZE, 0x90);
        let target = code.emit(&target).unwrap();
        let site = code.reserve(EXIT_PATCH_SIZE).unwrap();
        X64Patcher.patch_direct_jump(&mut code, site, target).unwrap();

        let run = |code: &mut CodeArena| {
            code.make_executable().unwrap();
            let at = code.host_address(site) as *const u8;
            unsafe { std::mem::transmute::<*const u8, extern "sysv64" fn() -> u32>(at)() }
        };

        assert_eq!(run(&mut code), 42);

        X64Patcher.write_destroy_stub(&mut code, target, 0x1234).unwrap();
        assert!(!code.is_executable());
        assert_eq!(run(&mut code), 0x1234);
    }
}

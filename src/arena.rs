//! Generated code arena.
//!
//! Every translated block lives in one bump-allocated buffer. Bytes are never reclaimed one block at a time: destroyed
//! blocks leave holes until the whole arena is reset back to its prelude, which holds the shared dispatcher-return stub.
//!
//! Native code goes into an anonymous mapping that is writable or executable, never both. Writing flips it to
//! writable, [CodeArena::make_executable] flips it back before the dispatcher jumps in. The mapping never moves, so
//! host addresses embedded in patches stay valid. Threaded code only needs plain memory.

use crate::error::CacheError;

#[cfg(target_arch = "x86_64")]
use dynasmrt::mmap::{ExecutableBuffer, MutableBuffer};

use std::fmt;

/// Offset of generated code inside the [CodeArena].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodePtr(pub usize);

impl CodePtr {
    pub const fn offset(self) -> usize {
        self.0
    }

    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code+{:#X}", self.0)
    }
}

/// Backing memory of a [CodeArena].
enum Memory {
    Heap(Box<[u8]>),
    #[cfg(target_arch = "x86_64")]
    Writable(MutableBuffer),
    #[cfg(target_arch = "x86_64")]
    Executable(ExecutableBuffer),
}

#[cfg(target_arch = "x86_64")]
fn map_error(e: std::io::Error) -> CacheError {
    CacheError::CodeMemory(e.to_string())
}

impl Memory {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(buffer) => &buffer[..],
            #[cfg(target_arch = "x86_64")]
            Self::Writable(buffer) => &buffer[..],
            #[cfg(target_arch = "x86_64")]
            Self::Executable(buffer) => &buffer[..],
        }
    }

    fn writable(&mut self) -> Result<&mut [u8], CacheError> {
        #[cfg(target_arch = "x86_64")]
        if let Self::Executable(buffer) = self {
            let buffer = std::mem::take(buffer).make_mut().map_err(map_error)?;
            *self = Self::Writable(buffer);
        }

        match self {
            Self::Heap(buffer) => Ok(&mut buffer[..]),
            #[cfg(target_arch = "x86_64")]
            Self::Writable(buffer) => Ok(&mut buffer[..]),
            #[cfg(target_arch = "x86_64")]
            Self::Executable(_) => Err(CacheError::CodeMemory("code buffer is not writable".to_owned())),
        }
    }
}

/// Fixed-capacity buffer holding all generated code.
pub struct CodeArena {
    memory: Memory,
    len: usize,
    prelude_end: usize,
    dispatcher: CodePtr,
}

impl CodeArena {
    /// Creates an empty arena in plain memory, able to hold `capacity` bytes of threaded code.
    pub fn new(capacity: usize) -> Self {
        Self::with_memory(Memory::Heap(vec![0; capacity].into_boxed_slice()))
    }

    /// Creates an empty arena in an anonymous mapping that can be made executable.
    #[cfg(target_arch = "x86_64")]
    pub fn executable(capacity: usize) -> Result<Self, CacheError> {
        let mut buffer = MutableBuffer::new(capacity).map_err(map_error)?;
        buffer.set_len(capacity);
        Ok(Self::with_memory(Memory::Writable(buffer)))
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn executable(_capacity: usize) -> Result<Self, CacheError> {
        Err(CacheError::CodeMemory("no executable memory support on this host".to_owned()))
    }

    fn with_memory(memory: Memory) -> Self {
        Self {
            memory,
            len: 0,
            prelude_end: 0,
            dispatcher: CodePtr(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.as_slice().len()
    }

    /// Number of bytes in use, prelude included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no block code has been emitted since the last reset.
    pub fn is_empty(&self) -> bool {
        self.len == self.prelude_end
    }

    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.len)
    }

    /// Where the next emitted byte will land.
    pub fn code_ptr(&self) -> CodePtr {
        CodePtr(self.len)
    }

    /// The shared stub that returns control to the dispatcher.
    pub fn dispatcher(&self) -> CodePtr {
        self.dispatcher
    }

    /// Returns true if the host can run the code right now.
    pub fn is_executable(&self) -> bool {
        match self.memory {
            #[cfg(target_arch = "x86_64")]
            Memory::Executable(_) => true,
            _ => false,
        }
    }

    /// Makes the code runnable. Does nothing for plain memory or when already executable.
    pub fn make_executable(&mut self) -> Result<(), CacheError> {
        #[cfg(target_arch = "x86_64")]
        if let Memory::Writable(buffer) = &mut self.memory {
            let buffer = std::mem::take(buffer).make_exec().map_err(map_error)?;
            self.memory = Memory::Executable(buffer);
        }

        Ok(())
    }

    /// Appends `bytes` to the arena and returns where they start.
    pub fn emit(&mut self, bytes: &[u8]) -> Result<CodePtr, CacheError> {
        let ptr = self.reserve(bytes.len())?;
        self.write(ptr, bytes)?;
        Ok(ptr)
    }

    /// Reserves `len` zeroed bytes, to be filled later with [CodeArena::write].
    pub fn reserve(&mut self, len: usize) -> Result<CodePtr, CacheError> {
        if len > self.available() {
            return Err(CacheError::CodeSpaceExhausted {
                requested: len,
                available: self.available(),
            });
        }

        let ptr = CodePtr(self.len);
        let Some(bytes) = self.memory.writable()?.get_mut(ptr.0..ptr.0 + len) else {
            return Err(CacheError::CodeOutOfBounds { ptr, len });
        };
        bytes.fill(0);
        self.len += len;
        Ok(ptr)
    }

    /// Returns true if `[ptr, ptr + len)` lies inside emitted code.
    pub fn contains(&self, ptr: CodePtr, len: usize) -> bool {
        ptr.0.checked_add(len).is_some_and(|end| end <= self.len)
    }

    pub fn bytes(&self, ptr: CodePtr, len: usize) -> Option<&[u8]> {
        self.memory.as_slice().get(..self.len)?.get(ptr.0..ptr.0.checked_add(len)?)
    }

    /// Overwrites already emitted code.
    pub fn write(&mut self, ptr: CodePtr, bytes: &[u8]) -> Result<(), CacheError> {
        let out_of_bounds = CacheError::CodeOutOfBounds { ptr, len: bytes.len() };
        let Some(end) = ptr.0.checked_add(bytes.len()).filter(|&end| end <= self.len) else {
            return Err(out_of_bounds);
        };

        let Some(dest) = self.memory.writable()?.get_mut(ptr.0..end) else {
            return Err(out_of_bounds);
        };
        dest.copy_from_slice(bytes);
        Ok(())
    }

    /// Absolute host address of `ptr`. The memory never moves, so it is stable for the arena's lifetime.
    pub fn host_address(&self, ptr: CodePtr) -> usize {
        self.memory.as_slice().as_ptr() as usize + ptr.0
    }

    /// Converts an absolute host address back into a [CodePtr], if it points inside the arena.
    pub fn from_host_address(&self, address: usize) -> Option<CodePtr> {
        let base = self.memory.as_slice().as_ptr() as usize;
        let offset = address.checked_sub(base)?;
        (offset < self.capacity()).then_some(CodePtr(offset))
    }

    /// Freezes everything emitted so far as the prelude and records the dispatcher-return stub.
    pub(crate) fn finish_prelude(&mut self, dispatcher: CodePtr) {
        self.dispatcher = dispatcher;
        self.prelude_end = self.len;
    }

    /// Drops every block's code. The prelude survives.
    pub(crate) fn reset(&mut self) {
        self.len = self.prelude_end;
    }
}

impl fmt::Debug for CodeArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeArena")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("prelude_end", &self.prelude_end)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_reset_keep_prelude() {
        let mut arena = CodeArena::new(64);
        let stub = arena.emit(&[0xC3]).unwrap();
        arena.finish_prelude(stub);
        assert!(arena.is_empty());

        let block = arena.emit(&[1, 2, 3, 4]).unwrap();
        assert_eq!(block, CodePtr(1));
        assert_eq!(arena.bytes(block, 4), Some(&[1, 2, 3, 4][..]));
        assert!(!arena.is_empty());

        arena.reset();
        assert!(arena.is_empty());
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.dispatcher(), stub);
        assert_eq!(arena.bytes(stub, 1), Some(&[0xC3][..]));
    }

    #[test]
    fn out_of_space_and_out_of_bounds() {
        let mut arena = CodeArena::new(8);
        arena.emit(&[0; 6]).unwrap();
        assert_eq!(arena.emit(&[0; 4]), Err(CacheError::CodeSpaceExhausted { requested: 4, available: 2 }));
        assert!(arena.write(CodePtr(4), &[0; 4]).is_err());
        assert!(arena.write(CodePtr(2), &[9; 4]).is_ok());
        assert!(!arena.contains(CodePtr(usize::MAX), 2));
    }

    #[test]
    fn host_addresses_round_trip() {
        let mut arena = CodeArena::new(16);
        let ptr = arena.emit(&[0; 8]).unwrap().add(3);
        let host = arena.host_address(ptr);
        assert_eq!(arena.from_host_address(host), Some(ptr));
        assert_eq!(arena.from_host_address(host + 64), None);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn mapped_memory_flips_between_writable_and_executable() {
        let mut arena = CodeArena::executable(0x1000).unwrap();
        assert_eq!(arena.capacity(), 0x1000);
        let stub = arena.emit(&[0xC3]).unwrap();
        arena.finish_prelude(stub);
        let base = arena.host_address(stub);

        arena.make_executable().unwrap();
        assert!(arena.is_executable());
        assert_eq!(arena.bytes(stub, 1), Some(&[0xC3][..]));

        let block = arena.emit(&[0x90, 0xC3]).unwrap();
        assert!(!arena.is_executable());
        assert_eq!(arena.host_address(stub), base);
        assert_eq!(arena.bytes(block, 2), Some(&[0x90, 0xC3][..]));

        arena.make_executable().unwrap();
        arena.make_executable().unwrap();
        assert!(arena.is_executable());
    }

    #[test]
    fn heap_memory_is_never_executable() {
        let mut arena = CodeArena::new(16);
        arena.make_executable().unwrap();
        assert!(!arena.is_executable());
        assert!(arena.emit(&[1]).is_ok());
    }
}

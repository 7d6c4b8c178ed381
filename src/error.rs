use crate::arena::CodePtr;
use crate::block::BlockId;

use thiserror::Error;

/// Errors returned by the block cache.
///
/// Only [CacheError::Full] is expected during normal operation: the dispatcher answers it by clearing the cache and
/// translating again. Every other variant is a contract violation by the translator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("block cache is full ({capacity} blocks)")]
    Full { capacity: usize },
    #[error("{0} does not exist")]
    UnknownBlock(BlockId),
    #[error("{0} has been destroyed")]
    InvalidBlock(BlockId),
    #[error("{0} is already finalized")]
    AlreadyFinalized(BlockId),
    #[error("{0} covers no guest bytes")]
    EmptyBlock(BlockId),
    #[error("guest range {start:#010X}+{size:#X} wraps around the address space")]
    RangeOverflow { start: u32, size: u32 },
    #[error("code span {ptr}+{len:#X} lies outside the code arena")]
    CodeOutOfBounds { ptr: CodePtr, len: usize },
    #[error("code arena exhausted: {requested} bytes requested, {available} available")]
    CodeSpaceExhausted { requested: usize, available: usize },
    #[error("code memory: {0}")]
    CodeMemory(String),
    #[error("failed to assemble patch: {0}")]
    Assembler(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

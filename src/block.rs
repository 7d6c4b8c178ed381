use crate::arena::CodePtr;

use std::fmt;

/// Index of a block in the block table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block #{}", self.0)
    }
}

/// One of the two successor edges of a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockExit {
    /// The jump in generated code that linking rewrites.
    pub patch: Option<CodePtr>,
    /// Guest address this exit continues at, if statically known.
    pub target: Option<u32>,
    /// True while `patch` jumps directly into the block at `target`.
    pub linked: bool,
}

impl BlockExit {
    /// Returns true if this exit can ever be linked.
    pub const fn is_linkable(&self) -> bool {
        self.patch.is_some() && self.target.is_some()
    }
}

/// A translated unit of guest code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitBlock {
    /// Guest address of the first instruction.
    pub original_address: u32,
    /// Number of guest bytes covered.
    pub original_size: u32,
    /// Number of generated bytes, starting at `checked_entry`.
    pub code_size: usize,
    /// Entry used when arriving from an unverified source. Linked exits jump here.
    pub checked_entry: CodePtr,
    /// Entry used when the guest state is already known to match.
    pub normal_entry: CodePtr,
    /// Taken and fall-through successors. Unused slots have neither patch nor target.
    pub exits: [BlockExit; 2],
    /// Number of times the dispatcher entered the block.
    pub run_count: u64,
    /// Translator defined, stored as given to [BlockCache::finalize_block](crate::BlockCache::finalize_block).
    pub flags: u32,
    /// Set once the translator has handed over the code.
    pub finalized: bool,
    /// Set when the block is destroyed. The slot may be reused by a later allocation.
    pub invalid: bool,
}

impl JitBlock {
    pub(crate) fn new(original_address: u32) -> Self {
        Self {
            original_address,
            original_size: 0,
            code_size: 0,
            checked_entry: CodePtr(0),
            normal_entry: CodePtr(0),
            exits: [BlockExit::default(); 2],
            run_count: 0,
            flags: 0,
            finalized: false,
            invalid: false,
        }
    }

    /// Exclusive end of the guest range. Only meaningful once finalized.
    pub fn original_end(&self) -> u64 {
        self.original_address as u64 + self.original_size as u64
    }

    /// Returns true if the block is finalized and has not been destroyed.
    pub fn is_live(&self) -> bool {
        self.finalized && !self.invalid
    }
}

/// A jump site emitted by the translator at the end of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitSite {
    /// Start of the patchable jump, [CodePatcher::exit_patch_size](crate::CodePatcher::exit_patch_size) bytes long.
    pub patch: CodePtr,
    /// Guest address the exit continues at, if statically known.
    pub target: Option<u32>,
}

/// Everything the translator knows about a block once its code is emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockCode {
    /// Number of guest bytes translated.
    pub original_size: u32,
    /// The code pointer the dispatcher jumps to.
    pub normal_entry: CodePtr,
    pub checked_entry: CodePtr,
    /// Generated bytes, starting at `checked_entry`.
    pub code_size: usize,
    pub exits: [Option<ExitSite>; 2],
    pub flags: u32,
}

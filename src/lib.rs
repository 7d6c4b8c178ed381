//! Block cache for dynamic recompilers.
//!
//! Keeps track of translated blocks of guest code: where their host code lives, which guest bytes they cover and how
//! their exits are chained together. When the guest writes over code it has already run, the overlapping blocks are
//! destroyed and every direct jump into them is sent back to the dispatcher.
//!
//! The typical dispatcher loop looks like this:
//! - look the guest PC up with [BlockCache::block_number_from_start_address];
//! - on a miss, [BlockCache::allocate_block], emit code into [BlockCache::code_mut], then [BlockCache::finalize_block];
//!   on [CacheError::Full], [BlockCache::clear] and try again;
//! - bracket the execution of generated code with [BlockCache::enter_block] and [BlockCache::return_to_dispatcher];
//! - forward guest instruction cache invalidations and stores to code to [BlockCache::invalidate_icache].

pub use kanal::{Receiver, Sender};

mod arena;
mod block;
mod cache;
mod config;
mod dispatch;
mod error;
mod icache;
mod linker;
mod links;
mod patcher;
mod range_index;
mod threaded;
mod valid_blocks;
#[cfg(target_arch = "x86_64")]
mod x64;

pub use arena::{CodeArena, CodePtr};
pub use block::{BlockCode, BlockExit, BlockId, ExitSite, JitBlock};
pub use cache::{BlockCache, CacheStats};
pub use config::CacheConfig;
pub use error::CacheError;
pub use icache::{ICacheRegion, ShadowICache, ICACHE_COMPILED_BYTE, ICACHE_INVALID_BYTE};
pub use links::ExitRef;
pub use patcher::{host_patcher, CodePatcher, CodeSink};
pub use range_index::range_intersect;
pub use threaded::{Record, ThreadedPatcher};
#[cfg(target_arch = "x86_64")]
pub use x64::X64Patcher;

/// Requests other threads can post to the cache through [BlockCache::command_sender].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheCommand {
    /// Same as [BlockCache::invalidate_icache].
    Invalidate { address: u32, length: u32 },
    /// Same as [BlockCache::clear].
    Clear,
}

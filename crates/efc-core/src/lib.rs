//! # efc-core
//!
//! Core types shared by every EFC crate.
//!
//! This crate is platform-agnostic apart from errno capture; all
//! thread, I/O and codec machinery lives in the crates built on top of it.
//!
//! ## Modules
//!
//! - `atomic` - Ordered loads/stores, fences and compare-and-swap per scalar width
//! - `spinlock` - Short-critical-section spin lock used by global registries
//! - `error` - Error taxonomy shared by all crates
//! - `config` - Process configuration with environment overrides
//! - `env` - Environment variable utilities

pub mod atomic;
pub mod spinlock;
pub mod error;
pub mod config;
pub mod env;

// Re-exports for convenience
pub use atomic::{fence, OrderedAtomic};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use error::{Error, Result};
pub use config::FoundationConfig;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Constants shared across crates
pub mod constants {
    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Thread id meaning "no thread" (lock owner, task runner)
    pub const NO_THREAD: u64 = 0;

    /// Largest byte count a single buffer operation may address
    pub const MAX_BUFFER_SPAN: usize = i32::MAX as usize;
}

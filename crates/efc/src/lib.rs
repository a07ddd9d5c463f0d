//! # efc
//!
//! One import for the whole foundation: atomics and errors from
//! `efc-core`, threads and executors from `efc-concurrent`, buffers,
//! selectors and channels from `efc-nio`, and BSON from `efc-bson`.
//!
//! ## Modules
//!
//! - `core` re-exports - [`Error`], [`Result`], [`FoundationConfig`], atomics
//! - [`concurrent`] - Parker, Thread, ReentrantLock, ThreadPoolExecutor
//! - [`nio`] - IoByteBuffer, Selector, socket/pipe/file channels
//! - [`bson`] - BsonDocument, codec and BsonParser
//!
//! ## Startup
//!
//! Global state is brought up in a fixed order by [`init`] (or
//! [`init_with`] to install a configuration first):
//!
//! 1. configuration is resolved
//! 2. the parker pool
//! 3. root thread groups and the calling thread
//! 4. the interrupt signal and the dispatcher's pre-close descriptor
//!
//! The returned [`Runtime`] guard undoes this in reverse when the last
//! live guard is dropped.
//!
//! ```no_run
//! let _rt = efc::init().unwrap();
//! let pool = efc::concurrent::Executors::new_fixed_thread_pool(2).unwrap();
//! ```

use std::sync::{Mutex, PoisonError};

pub use efc_bson as bson;
pub use efc_concurrent as concurrent;
pub use efc_nio as nio;

pub use efc_core::{
    atomic, config, constants, fence, Error, FoundationConfig, OrderedAtomic, Result, SpinLock,
};

/// Number of live [`Runtime`] guards.
static RUNTIMES: Mutex<usize> = Mutex::new(0);

/// Keeps the global state up. See [`init`].
#[must_use = "dropping the last Runtime tears down global state"]
#[derive(Debug)]
pub struct Runtime {
    _private: (),
}

/// Bring up global state if no other [`Runtime`] is live.
pub fn init() -> Result<Runtime> {
    let mut live = RUNTIMES.lock().unwrap_or_else(PoisonError::into_inner);
    if *live == 0 {
        setup()?;
    }
    *live += 1;
    Ok(Runtime { _private: () })
}

/// Install `config`, then [`init`].
///
/// Fails with `IllegalState` if a configuration is already in effect.
pub fn init_with(config: FoundationConfig) -> Result<Runtime> {
    config::install(config)?;
    init()
}

fn setup() -> Result<()> {
    let cfg = config::global();
    log::debug!("efc: starting with {:?}", cfg);
    efc_concurrent::init();
    if let Err(e) = efc_nio::init() {
        log::warn!("efc: i/o layer setup failed: {}", e);
        efc_concurrent::teardown();
        return Err(e);
    }
    log::info!("efc: initialized");
    Ok(())
}

fn teardown() {
    efc_nio::teardown();
    efc_concurrent::teardown();
    log::info!("efc: torn down");
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let mut live = RUNTIMES.lock().unwrap_or_else(PoisonError::into_inner);
        *live = live.saturating_sub(1);
        if *live == 0 {
            teardown();
        }
    }
}

/// Number of live runtime guards.
pub fn runtime_count() -> usize {
    *RUNTIMES.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_guards() {
        let a = init().unwrap();
        assert!(runtime_count() >= 1);
        let b = init().unwrap();
        assert!(runtime_count() >= 2);
        drop(b);
        assert!(runtime_count() >= 1);
        drop(a);
    }

    #[test]
    fn test_install_after_use_fails() {
        let _rt = init().unwrap();
        assert!(matches!(
            init_with(FoundationConfig::new()),
            Err(Error::IllegalState(_))
        ));
    }
}

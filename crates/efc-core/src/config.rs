//! Process configuration
//!
//! Library defaults with runtime environment overrides. The first call to
//! [`global()`] freezes the configuration for the life of the process;
//! `efc::init_with` may [`install`] an explicit one before that.
//!
//! ```rust,ignore
//! use efc_core::config::FoundationConfig;
//!
//! let config = FoundationConfig::from_env()
//!     .selector_max_events(256)
//!     .transfer_chunk(64 * 1024);
//! config.validate()?;
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use crate::env::env_get;
use crate::error::{Error, Result};

/// Compiled defaults
pub mod defaults {
    pub const PARKER_FREE_LIST_MAX: usize = 1024;
    pub const THREAD_LOCAL_CAPACITY: usize = 16;
    pub const POOL_KEEP_ALIVE_MS: u64 = 60_000;
    pub const SELECTOR_MAX_EVENTS: usize = 1024;
    pub const TRANSFER_CHUNK: usize = 8192;
    pub const MAPPED_TRANSFER_MAX: usize = 8 * 1024 * 1024;
    pub const BSON_MAX_PAYLOAD: usize = 64 * 1024 * 1024;
    pub const BSON_READ_CHUNK: usize = 4096;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundationConfig {
    /// Parkers kept for reuse after their thread exits
    pub parker_free_list_max: usize,
    /// Initial per-thread thread-local table capacity (power of two)
    pub thread_local_capacity: usize,
    /// Idle time before a cached-pool worker retires
    pub pool_keep_alive: Duration,
    /// Kernel events drained per select call
    pub selector_max_events: usize,
    /// Buffer size of the read/write transfer fallback
    pub transfer_chunk: usize,
    /// Largest region mapped per step of a mapped transfer
    pub mapped_transfer_max: usize,
    /// Largest BSON payload the decoder accepts
    pub bson_max_payload: usize,
    /// Bytes requested per read by the streaming BSON parser
    pub bson_read_chunk: usize,
}

impl Default for FoundationConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl FoundationConfig {
    /// Defaults overridden by any of:
    ///
    /// - `EFC_PARKER_FREE_LIST_MAX`
    /// - `EFC_THREAD_LOCAL_CAPACITY`
    /// - `EFC_POOL_KEEP_ALIVE_MS`
    /// - `EFC_SELECTOR_MAX_EVENTS`
    /// - `EFC_TRANSFER_CHUNK`
    /// - `EFC_MAPPED_TRANSFER_MAX`
    /// - `EFC_BSON_MAX_PAYLOAD`
    /// - `EFC_BSON_READ_CHUNK`
    pub fn from_env() -> Self {
        Self {
            parker_free_list_max: env_get(
                "EFC_PARKER_FREE_LIST_MAX",
                defaults::PARKER_FREE_LIST_MAX,
            ),
            thread_local_capacity: env_get(
                "EFC_THREAD_LOCAL_CAPACITY",
                defaults::THREAD_LOCAL_CAPACITY,
            ),
            pool_keep_alive: Duration::from_millis(env_get(
                "EFC_POOL_KEEP_ALIVE_MS",
                defaults::POOL_KEEP_ALIVE_MS,
            )),
            selector_max_events: env_get(
                "EFC_SELECTOR_MAX_EVENTS",
                defaults::SELECTOR_MAX_EVENTS,
            ),
            transfer_chunk: env_get("EFC_TRANSFER_CHUNK", defaults::TRANSFER_CHUNK),
            mapped_transfer_max: env_get(
                "EFC_MAPPED_TRANSFER_MAX",
                defaults::MAPPED_TRANSFER_MAX,
            ),
            bson_max_payload: env_get("EFC_BSON_MAX_PAYLOAD", defaults::BSON_MAX_PAYLOAD),
            bson_read_chunk: env_get("EFC_BSON_READ_CHUNK", defaults::BSON_READ_CHUNK),
        }
    }

    /// Compiled defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            parker_free_list_max: defaults::PARKER_FREE_LIST_MAX,
            thread_local_capacity: defaults::THREAD_LOCAL_CAPACITY,
            pool_keep_alive: Duration::from_millis(defaults::POOL_KEEP_ALIVE_MS),
            selector_max_events: defaults::SELECTOR_MAX_EVENTS,
            transfer_chunk: defaults::TRANSFER_CHUNK,
            mapped_transfer_max: defaults::MAPPED_TRANSFER_MAX,
            bson_max_payload: defaults::BSON_MAX_PAYLOAD,
            bson_read_chunk: defaults::BSON_READ_CHUNK,
        }
    }

    // Builder methods

    pub fn parker_free_list_max(mut self, n: usize) -> Self {
        self.parker_free_list_max = n;
        self
    }

    pub fn thread_local_capacity(mut self, n: usize) -> Self {
        self.thread_local_capacity = n;
        self
    }

    pub fn pool_keep_alive(mut self, d: Duration) -> Self {
        self.pool_keep_alive = d;
        self
    }

    pub fn selector_max_events(mut self, n: usize) -> Self {
        self.selector_max_events = n;
        self
    }

    pub fn transfer_chunk(mut self, n: usize) -> Self {
        self.transfer_chunk = n;
        self
    }

    pub fn mapped_transfer_max(mut self, n: usize) -> Self {
        self.mapped_transfer_max = n;
        self
    }

    pub fn bson_max_payload(mut self, n: usize) -> Self {
        self.bson_max_payload = n;
        self
    }

    pub fn bson_read_chunk(mut self, n: usize) -> Self {
        self.bson_read_chunk = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_local_capacity < 2 || !self.thread_local_capacity.is_power_of_two() {
            return Err(Error::illegal_argument(
                "thread_local_capacity must be a power of two >= 2",
            ));
        }
        if self.selector_max_events == 0 {
            return Err(Error::illegal_argument("selector_max_events must be at least 1"));
        }
        if self.transfer_chunk == 0 {
            return Err(Error::illegal_argument("transfer_chunk must be at least 1"));
        }
        if self.mapped_transfer_max == 0 {
            return Err(Error::illegal_argument("mapped_transfer_max must be at least 1"));
        }
        if self.bson_read_chunk == 0 {
            return Err(Error::illegal_argument("bson_read_chunk must be at least 1"));
        }
        if self.bson_max_payload == 0 {
            return Err(Error::illegal_argument("bson_max_payload must be at least 1"));
        }
        Ok(())
    }
}

static GLOBAL: OnceLock<FoundationConfig> = OnceLock::new();

/// The process configuration; `from_env()` unless one was installed first.
pub fn global() -> &'static FoundationConfig {
    GLOBAL.get_or_init(|| {
        let config = FoundationConfig::from_env();
        log::debug!("efc configuration: {:?}", config);
        config
    })
}

/// Install `config` as the process configuration.
///
/// Fails with `IllegalState` once [`global()`] has been read or another
/// configuration was installed.
pub fn install(config: FoundationConfig) -> Result<()> {
    config.validate()?;
    GLOBAL
        .set(config)
        .map_err(|_| Error::illegal_state("configuration already in use"))
}

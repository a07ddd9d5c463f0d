//! # efc-concurrent
//!
//! Thread and task machinery built on `efc-core`.
//!
//! ## Modules
//!
//! - `park` - Per-thread permits (Parker, ParkEvent) and park/unpark
//! - `thread` - Threads, thread groups, thread-local values
//! - `lock` - Reentrant lock and its conditions
//! - `executor` - Futures, blocking queue, thread pool, completion service
//!
//! ## Platform Support
//!
//! | Platform | Park primitive |
//! |----------|----------------|
//! | Linux    | futex (`FUTEX_WAIT_BITSET` for absolute deadlines) |
//! | Other Unix | mutex + condvar |

pub mod park;
pub mod thread;
pub mod lock;
pub mod executor;

pub use park::{ParkEvent, ParkTimeout, Parker};
pub use thread::{Builder, InheritableThreadLocal, Thread, ThreadGroup, ThreadLocal, ThreadState};
pub use lock::{Condition, ReentrantLock, ReentrantLockGuard};
pub use executor::{
    runnable, Executor, ExecutorCompletionService, ExecutorService, Executors, Future,
    FutureState, FutureTask, LinkedBlockingQueue, Runnable, ThreadPoolExecutor,
};

/// Set up the parker pool, root thread groups and the calling thread's
/// record. Idempotent.
pub fn init() {
    park::init();
    thread::init();
}

/// Undo [`init`] in reverse order.
pub fn teardown() {
    thread::teardown();
    park::teardown();
}

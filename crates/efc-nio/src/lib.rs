//! # efc-nio
//!
//! Byte buffers, descriptor dispatch, selectors and channels.
//!
//! ## Modules
//!
//! - `buffer` - Position/limit/capacity cursor over owned, mapped or borrowed bytes
//! - `dispatch` - Sentinel-returning read/write/pread/pwrite/lock/transfer on raw fds
//! - `native_thread` - Tracks OS threads blocked in a syscall so close can signal them
//! - `channel` - Channel traits and the shared open/close/interrupt core
//! - `selector` - Readiness multiplexing over selectable channels
//! - `net` - Server, stream, datagram and pipe channels
//! - `file` - FileChannel, file locks and memory maps
//!
//! ## Platform Support
//!
//! | Platform | Selector | Transfer | Range locks |
//! |----------|----------|----------|-------------|
//! | Linux    | epoll    | sendfile | OFD fcntl   |
//! | macOS    | poll     | sendfile (to sockets) | fcntl |
//! | Other Unix | poll   | copy     | fcntl       |

#[cfg(not(unix))]
compile_error!("efc-nio supports Unix-family targets only");

pub mod buffer;
pub mod dispatch;
pub mod native_thread;
pub mod channel;
pub mod selector;
pub mod net;
pub mod file;

pub use buffer::{ByteOrder, IoByteBuffer};
pub use channel::{
    Channel, GatheringByteChannel, ReadableByteChannel, ScatteringByteChannel,
    SelectableChannel, WritableByteChannel,
};
pub use dispatch::{FdKind, LockResult};
pub use file::{FileChannel, FileLock, MapMode, MappedByteBuffer, OpenOptions};
pub use native_thread::NativeThreadSet;
pub use net::{DatagramChannel, Pipe, ServerSocketChannel, SinkChannel, SocketChannel, SourceChannel};
pub use selector::{Attachment, SelectionKey, Selector};

/// Global setup for the dispatcher and the native-thread signal.
///
/// Idempotent. `efc::init` calls this after the thread layer is up.
pub fn init() -> efc_core::Result<()> {
    native_thread::init()?;
    dispatch::init()
}

/// Release what [`init`] acquired.
pub fn teardown() {
    dispatch::teardown();
}

use std::any::Any;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use efc_core::{Error, Result};

use crate::buffer::IoByteBuffer;
use crate::channel::{
    bracket, Channel, ChannelCore, GatheringByteChannel, ReadableByteChannel, Role,
    ScatteringByteChannel, SelectableChannel, WritableByteChannel,
};
use crate::dispatch::{self, normalize, FdKind};
use crate::selector::{OP_READ, OP_WRITE};

/// A unidirectional in-process pipe: bytes written to the sink are read
/// from the source.
pub struct Pipe {
    source: Arc<SourceChannel>,
    sink: Arc<SinkChannel>,
}

impl Pipe {
    pub fn open() -> Result<Pipe> {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: fds has room for both ends
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(Error::last_os_error());
        }
        let source = SourceChannel {
            core: ChannelCore::new(fds[0], FdKind::File, Role::PipeSource),
        };
        let sink = SinkChannel {
            core: ChannelCore::new(fds[1], FdKind::File, Role::PipeSink),
        };
        dispatch::set_cloexec(fds[0])?;
        dispatch::set_cloexec(fds[1])?;
        Ok(Pipe {
            source: Arc::new(source),
            sink: Arc::new(sink),
        })
    }

    pub fn source(&self) -> Arc<SourceChannel> {
        Arc::clone(&self.source)
    }

    pub fn sink(&self) -> Arc<SinkChannel> {
        Arc::clone(&self.sink)
    }
}

/// Readable end of a [`Pipe`].
pub struct SourceChannel {
    core: Arc<ChannelCore>,
}

/// Writable end of a [`Pipe`].
pub struct SinkChannel {
    core: Arc<ChannelCore>,
}

macro_rules! pipe_end {
    ($ty:ident, $ops:expr) => {
        impl Channel for $ty {
            fn is_open(&self) -> bool {
                self.core.is_open()
            }

            fn close(&self) -> Result<()> {
                self.core.close()
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        impl SelectableChannel for $ty {
            fn core(&self) -> &Arc<ChannelCore> {
                &self.core
            }

            fn valid_ops(&self) -> u32 {
                $ops
            }
        }

        impl AsRawFd for $ty {
            fn as_raw_fd(&self) -> RawFd {
                self.core.fd()
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($ty)).field("core", &self.core).finish()
            }
        }
    };
}

pipe_end!(SourceChannel, OP_READ);
pipe_end!(SinkChannel, OP_WRITE);

impl ReadableByteChannel for SourceChannel {
    fn read(&self, dst: &mut IoByteBuffer) -> Result<isize> {
        let _g = self.core.read_guard();
        self.core.ensure_open()?;
        let n = bracket(&self.core, |fd| dispatch::read(fd, FdKind::File, dst))?;
        Ok(normalize(n))
    }
}

impl ScatteringByteChannel for SourceChannel {
    fn read_vectored(&self, dsts: &mut [IoByteBuffer]) -> Result<isize> {
        let _g = self.core.read_guard();
        self.core.ensure_open()?;
        let n = bracket(&self.core, |fd| dispatch::read_vectored(fd, FdKind::File, dsts))?;
        Ok(normalize(n))
    }
}

impl WritableByteChannel for SinkChannel {
    fn write(&self, src: &mut IoByteBuffer) -> Result<usize> {
        let _g = self.core.write_guard();
        self.core.ensure_open()?;
        let n = bracket(&self.core, |fd| dispatch::write(fd, FdKind::File, src))?;
        Ok(normalize(n).max(0) as usize)
    }
}

impl GatheringByteChannel for SinkChannel {
    fn write_vectored(&self, srcs: &mut [IoByteBuffer]) -> Result<usize> {
        let _g = self.core.write_guard();
        self.core.ensure_open()?;
        let n = bracket(&self.core, |fd| dispatch::write_vectored(fd, FdKind::File, srcs))?;
        Ok(normalize(n).max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EOF;

    #[test]
    fn test_round_trip_and_eof() {
        crate::init().unwrap();
        let pipe = Pipe::open().unwrap();
        let (source, sink) = (pipe.source(), pipe.sink());
        let mut src = IoByteBuffer::wrap(b"through".to_vec());
        assert_eq!(sink.write(&mut src).unwrap(), 7);
        let mut dst = IoByteBuffer::allocate(16).unwrap();
        assert_eq!(source.read(&mut dst).unwrap(), 7);
        dst.flip();
        assert_eq!(dst.as_slice(), b"through");

        sink.close().unwrap();
        dst.clear();
        assert_eq!(source.read(&mut dst).unwrap(), EOF);
    }

    #[test]
    fn test_non_blocking_empty_read() {
        crate::init().unwrap();
        let pipe = Pipe::open().unwrap();
        let source = pipe.source();
        source.configure_blocking(false).unwrap();
        let mut dst = IoByteBuffer::allocate(4).unwrap();
        assert_eq!(source.read(&mut dst).unwrap(), 0);
        source.close().unwrap();
        assert!(matches!(source.read(&mut dst), Err(Error::ClosedChannel)));
    }
}

//! epoll backend

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{timeout_millis, PollReady, Poller};

pub(crate) struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    registered: HashMap<u64, RawFd>,
}

impl EpollPoller {
    pub(crate) fn new(max_events: usize) -> io::Result<Self> {
        // Safety: epoll_create1 has no memory effects
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
            registered: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, readable: bool, writable: bool) -> io::Result<()> {
        let mut bits = 0u32;
        if readable {
            bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if writable {
            bits |= libc::EPOLLOUT as u32;
        }
        let mut event = libc::epoll_event {
            events: bits,
            u64: token,
        };
        // Safety: event outlives the call
        let r = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn update(&mut self, token: u64, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        if !readable && !writable {
            return self.remove(token);
        }
        if self.registered.contains_key(&token) {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, readable, writable)
        } else {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, readable, writable)?;
            self.registered.insert(token, fd);
            Ok(())
        }
    }

    fn remove(&mut self, token: u64) -> io::Result<()> {
        let Some(fd) = self.registered.remove(&token) else {
            return Ok(());
        };
        // Safety: DEL ignores the event argument
        let r = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if r < 0 {
            let err = io::Error::last_os_error();
            // A preclosed or closed descriptor already left the set
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => return Ok(()),
                _ => return Err(err),
            }
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<(u64, PollReady)>) -> io::Result<()> {
        // Safety: events has room for the requested count
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for ev in &self.events[..n as usize] {
            let bits = ev.events;
            let token = ev.u64;
            out.push((
                token,
                PollReady {
                    readable: bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
                    writable: bits & libc::EPOLLOUT as u32 != 0,
                    error: bits & libc::EPOLLERR as u32 != 0,
                    hup: bits & libc::EPOLLHUP as u32 != 0,
                },
            ));
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        // Safety: the epoll descriptor is owned here
        unsafe { libc::close(self.epoll_fd) };
    }
}

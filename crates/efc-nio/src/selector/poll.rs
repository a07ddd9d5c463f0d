//! poll(2) backend for targets without epoll

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{timeout_millis, PollReady, Poller};

pub(crate) struct PollPoller {
    entries: Vec<(u64, libc::pollfd)>,
    index: HashMap<u64, usize>,
}

impl PollPoller {
    pub(crate) fn new(_max_events: usize) -> io::Result<Self> {
        Ok(PollPoller {
            entries: Vec::new(),
            index: HashMap::new(),
        })
    }
}

impl Poller for PollPoller {
    fn update(&mut self, token: u64, fd: RawFd, readable: bool, writable: bool) -> io::Result<()> {
        if !readable && !writable {
            return self.remove(token);
        }
        let mut events = 0;
        if readable {
            events |= libc::POLLIN;
        }
        if writable {
            events |= libc::POLLOUT;
        }
        let pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        match self.index.get(&token) {
            Some(&i) => self.entries[i].1 = pfd,
            None => {
                self.index.insert(token, self.entries.len());
                self.entries.push((token, pfd));
            }
        }
        Ok(())
    }

    fn remove(&mut self, token: u64) -> io::Result<()> {
        if let Some(i) = self.index.remove(&token) {
            self.entries.swap_remove(i);
            if let Some((moved, _)) = self.entries.get(i) {
                self.index.insert(*moved, i);
            }
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<(u64, PollReady)>) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = self.entries.iter().map(|(_, p)| *p).collect();
        // Safety: fds is a valid array of the given length
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_millis(timeout)) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for (pfd, (token, _)) in fds.iter().zip(&self.entries) {
            let r = pfd.revents;
            if r == 0 {
                continue;
            }
            out.push((
                *token,
                PollReady {
                    readable: r & libc::POLLIN != 0,
                    writable: r & libc::POLLOUT != 0,
                    error: r & (libc::POLLERR | libc::POLLNVAL) != 0,
                    hup: r & libc::POLLHUP != 0,
                },
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_remove_keeps_index() {
        let mut p = PollPoller::new(0).unwrap();
        p.update(1, 10, true, false).unwrap();
        p.update(2, 11, true, false).unwrap();
        p.update(3, 12, false, true).unwrap();
        p.remove(1).unwrap();
        assert_eq!(p.index[&3], 0);
        assert_eq!(p.entries[0].1.fd, 12);
        p.update(3, 12, false, false).unwrap();
        assert_eq!(p.entries.len(), 1);
    }

    #[test]
    fn test_pipe_readiness() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut p = PollPoller::new(0).unwrap();
        p.update(5, fds[0], true, false).unwrap();
        p.update(6, fds[1], false, true).unwrap();
        let mut out = Vec::new();
        p.poll(Some(Duration::from_millis(50)), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 6);
        assert!(out[0].1.writable);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}

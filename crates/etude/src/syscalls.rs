// src/syscalls.rs
use crate::error::EtudeResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, TcpListener};
use std::os::fd::FromRawFd;
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking IPv4 listening socket with SO_REUSEADDR.
pub fn create_listen_socket(addr: Ipv4Addr, port: u16, backlog: c_int) -> EtudeResult<TcpListener> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if let Err(err) = set_reuse_addr(fd) {
            libc::close(fd);
            return Err(err.into());
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

pub fn set_reuse_addr(fd: c_int) -> io::Result<()> {
    let optval: c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const c_void,
            mem::size_of_val(&optval) as socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Ignore SIGPIPE so a write to a reset peer surfaces as EPIPE instead of killing the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Epoll Operations ----

pub use libc::epoll_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        }
    }
}

const ONESHOT_FLAGS: u32 = (libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;

pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    /// Register the listening socket: edge-triggered, stays armed.
    pub fn add_listener(&self, fd: c_int, token: u64) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            token,
            Interest::Read.bits() | libc::EPOLLET as u32,
        )
    }

    /// Register a connection for a single edge-triggered notification.
    pub fn add_oneshot(&self, fd: c_int, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest.bits() | ONESHOT_FLAGS)
    }

    /// Re-arm a one-shot registration. This hands the connection back to the reactor.
    pub fn rearm(&self, fd: c_int, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest.bits() | ONESHOT_FLAGS)
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Wait for events. An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: c_int) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(res as usize)
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, events: u32) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub fn empty_events(len: usize) -> Vec<epoll_event> {
    vec![epoll_event { events: 0, u64: 0 }; len]
}

pub fn is_hangup(events: u32) -> bool {
    events & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
}

pub fn is_readable(events: u32) -> bool {
    events & libc::EPOLLIN as u32 != 0
}

pub fn is_writable(events: u32) -> bool {
    events & libc::EPOLLOUT as u32 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener = create_listen_socket(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        // Non-blocking: no pending connection means WouldBlock.
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn oneshot_fires_once_until_rearmed() {
        let listener = create_listen_socket(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("{e}"),
            }
        };

        let epoll = Epoll::new().unwrap();
        epoll.add_oneshot(server.as_raw_fd(), 7, Interest::Read).unwrap();
        client.write_all(b"x").unwrap();

        let mut events = empty_events(4);
        let n = epoll.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let token = events[0].u64;
        assert_eq!(token, 7);
        assert!(is_readable(events[0].events));

        client.write_all(b"y").unwrap();
        assert_eq!(epoll.wait(&mut events, 50).unwrap(), 0);

        epoll.rearm(server.as_raw_fd(), 7, Interest::Read).unwrap();
        assert_eq!(epoll.wait(&mut events, 1000).unwrap(), 1);

        epoll.delete(server.as_raw_fd()).unwrap();
        // Deleting twice is not an error.
        epoll.delete(server.as_raw_fd()).unwrap();
    }
}

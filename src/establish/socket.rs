//! Blocking-with-deadline stream I/O over raw descriptors.
//!
//! The descriptor stays non-blocking while we own it; every phase waits for
//! readiness with `poll` and a fixed ceiling. An interrupted wait is retried
//! with a fresh ceiling.

use crate::endpoint::socket_addr_to_raw;
use crate::error::RouteError;
use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Interest {
    Readable,
    Writable,
}

#[derive(Debug)]
pub struct StreamSocket {
    fd: OwnedFd,
    timeout: Duration,
}

impl StreamSocket {
    /// Opens a non-blocking TCP socket of the family matching `target`.
    pub fn open(target: &SocketAddr, timeout: Duration) -> io::Result<Self> {
        let domain = match target {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        set_nonblocking(fd.as_raw_fd(), true)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        set_int_option(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
        Ok(Self { fd, timeout })
    }

    pub fn connect(&self, target: &SocketAddr) -> Result<(), RouteError> {
        let (storage, len) = socket_addr_to_raw(target);
        let status = unsafe {
            libc::connect(
                self.fd.as_raw_fd(),
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if status == 0 {
            return Ok(());
        }
        let error = io::Error::last_os_error();
        match error.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EINTR) => self.wait(Interest::Writable),
            _ => Err(RouteError::from_os(error)),
        }
    }

    pub fn send_all(&self, bytes: &[u8]) -> Result<(), RouteError> {
        let mut total = 0;
        while total < bytes.len() {
            let remaining = &bytes[total..];
            let sent = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                    SEND_FLAGS,
                )
            };
            if sent > 0 {
                total += sent as usize;
                continue;
            }
            if sent == 0 {
                return Err(RouteError::PeerClosed);
            }
            let error = io::Error::last_os_error();
            match error.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => self.wait(Interest::Writable)?,
                _ => return Err(RouteError::from_os(error)),
            }
        }
        Ok(())
    }

    /// Fills `buffer` completely; the peer closing early is an error.
    pub fn recv_exact(&self, buffer: &mut [u8]) -> Result<(), RouteError> {
        let mut total = 0;
        while total < buffer.len() {
            self.wait(Interest::Readable)?;
            let remaining = &mut buffer[total..];
            let received = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    remaining.as_mut_ptr() as *mut libc::c_void,
                    remaining.len(),
                    0,
                )
            };
            if received > 0 {
                total += received as usize;
                continue;
            }
            if received == 0 {
                return Err(RouteError::PeerClosed);
            }
            let error = io::Error::last_os_error();
            match error.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(RouteError::from_os(error)),
            }
        }
        Ok(())
    }

    /// Hands the descriptor over in blocking mode.
    pub fn into_fd(self) -> io::Result<OwnedFd> {
        set_nonblocking(self.fd.as_raw_fd(), false)?;
        Ok(self.fd)
    }

    fn wait(&self, interest: Interest) -> Result<(), RouteError> {
        let events = match interest {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        };
        let timeout_ms = self.timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        loop {
            let mut pollfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if ready > 0 {
                return match pending_error(self.fd.as_raw_fd())? {
                    0 => Ok(()),
                    code => Err(RouteError::from_os(io::Error::from_raw_os_error(code))),
                };
            }
            if ready == 0 {
                return Err(RouteError::DialTimeout);
            }
            let error = io::Error::last_os_error();
            if error.kind() != io::ErrorKind::Interrupted {
                return Err(RouteError::from_os(error));
            }
        }
    }
}

impl AsRawFd for StreamSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn pending_error(fd: RawFd) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let status = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if status < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_int_option(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let status = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if status < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

pub fn set_nonblocking(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let updated = if enabled {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if updated != flags && unsafe { libc::fcntl(fd, libc::F_SETFL, updated) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// True for valid descriptors of type `SOCK_STREAM`.
pub fn is_stream_socket(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut kind: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let status = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut kind as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    status == 0 && kind == libc::SOCK_STREAM
}

/// Makes `original` refer to the connection held by `replacement`.
///
/// The caller's descriptor number survives; its non-blocking flag is carried
/// over to the new connection. Returns whether the descriptor is non-blocking.
pub fn replace_descriptor(original: RawFd, replacement: OwnedFd) -> io::Result<bool> {
    let nonblocking = is_nonblocking(original)?;
    if unsafe { libc::dup2(replacement.as_raw_fd(), original) } < 0 {
        return Err(io::Error::last_os_error());
    }
    drop(replacement);
    if nonblocking {
        set_nonblocking(original, true)?;
    }
    Ok(nonblocking)
}

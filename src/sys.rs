//! Thin layer over Linux `epoll`, the assumed readiness primitive.
//!
//! This mirrors the raw `epoll_create`/`epoll_ctl`/`epoll_wait` trio a
//! reimplementation is expected to sit on, reached through `libc` rather
//! than hand-written `extern "C"` declarations.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{ReactorError, Result};

/// A single readiness notification: the opaque token the caller supplied
/// at registration time, and the observed kernel event bits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEvent {
    pub token: u64,
    pub bits: u32,
}

pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: epoll_create1 takes no pointer arguments; a negative
        // return is the only failure signal and is checked below.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::Create(io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    /// Registers `fd` for `bits`, stamping `token` into the opaque data
    /// slot so the caller can recover its handler record without a
    /// search.
    pub(crate) fn add(&self, fd: RawFd, bits: u32, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, bits, token)
    }

    pub(crate) fn modify(&self, fd: RawFd, bits: u32, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, bits, token)
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn delete(&self, fd: RawFd) -> Result<()> {
        // SAFETY: EPOLL_CTL_DEL ignores the event argument; passing null
        // is explicitly permitted since Linux 2.6.9.
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if res < 0 {
            return Err(ReactorError::Ctl { fd, source: io::Error::last_os_error() });
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, bits: u32, token: u64) -> Result<()> {
        let mut event = libc::epoll_event { events: bits, u64: token };
        // SAFETY: `event` is a valid, live epoll_event for the duration
        // of the call; `self.fd` is a valid epoll descriptor owned by
        // this struct.
        let res = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if res < 0 {
            let err = io::Error::last_os_error();
            return Err(ReactorError::Ctl { fd, source: err });
        }
        Ok(())
    }

    /// Blocks for up to `timeout` (or indefinitely if `None`) waiting for
    /// at least one event. Returns the events delivered this call,
    /// retrying internally on `EINTR` per spec.
    pub(crate) fn wait(&self, buf: &mut Vec<libc::epoll_event>, timeout: Option<Duration>) -> Result<Vec<RawEvent>> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };

        loop {
            // SAFETY: buf.as_mut_ptr() is valid for buf.capacity() writes
            // of epoll_event; the OS only ever writes up to that count
            // and we set the resulting length below.
            let n = unsafe {
                libc::epoll_wait(self.fd, buf.as_mut_ptr(), buf.capacity() as i32, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ReactorError::Wait(err));
            }
            // SAFETY: the kernel just initialized the first `n` slots.
            unsafe { buf.set_len(n as usize) };
            return Ok(buf
                .iter()
                .map(|e| RawEvent { token: e.u64, bits: e.events })
                .collect());
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // SAFETY: self.fd is open for the lifetime of this struct and
        // closed exactly once here.
        let res = unsafe { libc::close(self.fd) };
        if res < 0 {
            log::warn!("failed to close epoll fd {}: {}", self.fd, io::Error::last_os_error());
        }
    }
}

/// A self-signaling `eventfd`, pre-written with a non-zero counter value
/// at creation so that arming it for one-shot readable delivery makes the
/// next `epoll_wait` return immediately.
pub(crate) struct Wakeup {
    fd: RawFd,
}

impl Wakeup {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: no pointer arguments; failure is signaled by a
        // negative return.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::Wakeup(io::Error::last_os_error()));
        }
        let wakeup = Self { fd };
        wakeup.prime()?;
        Ok(wakeup)
    }

    fn prime(&self) -> Result<()> {
        let value: u64 = 1;
        // SAFETY: writing 8 bytes from a live local into a valid eventfd.
        let res = unsafe {
            libc::write(self.fd, &value as *const u64 as *const libc::c_void, std::mem::size_of::<u64>())
        };
        if res < 0 {
            return Err(ReactorError::Wakeup(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        // SAFETY: self.fd is open for the lifetime of this struct.
        let res = unsafe { libc::close(self.fd) };
        if res < 0 {
            log::warn!("failed to close wakeup fd {}: {}", self.fd, io::Error::last_os_error());
        }
    }
}

//! Error taxonomy for the reactor.
//!
//! Sub-conditions that callers need to branch on (already-registered,
//! not-found) are distinguished from plain I/O failures. Signal
//! interruption of `epoll_wait` never reaches here: the dispatcher retries
//! it transparently.

use std::io;
use std::os::unix::io::RawFd;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("failed to create epoll instance: {0}")]
    Create(#[source] io::Error),

    #[error("failed to create wakeup eventfd: {0}")]
    Wakeup(#[source] io::Error),

    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("descriptor {0} is not registered")]
    NotFound(RawFd),

    #[error("epoll_ctl failed for fd {fd}: {source}")]
    Ctl { fd: RawFd, #[source] source: io::Error },

    #[error("epoll_wait failed: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;

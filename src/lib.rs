//! A single-threaded, readiness-based event loop.
//!
//! This is the reactor a connection-oriented messaging library drives
//! its state machines with: it multiplexes kernel I/O readiness
//! (Linux `epoll`) with in-process deferred work, without spawning any
//! threads of its own. The one sanctioned cross-thread operation is
//! [`Reactor::stop`].
//!
//! ```no_run
//! use reactor_core::{Interest, Reactor};
//!
//! let mut reactor = Reactor::new().expect("epoll/eventfd available");
//! reactor.register(0, Interest::READABLE, |fd, events| {
//!     println!("fd {fd} ready: {events:?}");
//! }).unwrap();
//! reactor.run_timeout(Some(std::time::Duration::from_millis(100))).unwrap();
//! ```

mod deferred;
mod deletion;
mod error;
mod interest;
mod reactor;
mod registry;
mod sys;

pub use deferred::DeferredHandle;
pub use error::{ReactorError, Result};
pub use interest::Interest;
pub use reactor::{PollParams, Reactor, ReactorConfig, Stopper};

//! Abstract event mask and its translation to the kernel's `epoll` bits.

use bitflags::bitflags;

bitflags! {
    /// Watched-event mask, independent of the underlying kernel primitive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u32 {
        /// Data available to read, or EOF.
        const READABLE       = 0b0000_0001;
        /// Send buffer has space.
        const WRITABLE       = 0b0000_0010;
        /// Read half closed by the peer.
        const PEER_CLOSED    = 0b0000_0100;
        /// Notify only on state transitions; consumers must fully drain.
        const EDGE_TRIGGERED = 0b0000_1000;
        /// Auto-disarm after one delivery.
        const ONE_SHOT       = 0b0001_0000;
    }
}

impl Interest {
    /// Translates the abstract mask into the bits `epoll_ctl` expects.
    pub(crate) fn to_epoll_bits(self) -> u32 {
        let mut bits = 0u32;
        if self.contains(Interest::READABLE) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Interest::WRITABLE) {
            bits |= libc::EPOLLOUT as u32;
        }
        if self.contains(Interest::PEER_CLOSED) {
            bits |= libc::EPOLLRDHUP as u32;
        }
        if self.contains(Interest::EDGE_TRIGGERED) {
            bits |= libc::EPOLLET as u32;
        }
        if self.contains(Interest::ONE_SHOT) {
            bits |= libc::EPOLLONESHOT as u32;
        }
        bits
    }

    /// Translates observed `epoll` bits back into the abstract mask, for
    /// the events handed to a callback.
    pub(crate) fn from_epoll_bits(bits: u32) -> Interest {
        let mut interest = Interest::empty();
        if bits & libc::EPOLLIN as u32 != 0 {
            interest |= Interest::READABLE;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            interest |= Interest::WRITABLE;
        }
        if bits & libc::EPOLLRDHUP as u32 != 0 {
            interest |= Interest::PEER_CLOSED;
        }
        if bits & libc::EPOLLET as u32 != 0 {
            interest |= Interest::EDGE_TRIGGERED;
        }
        if bits & libc::EPOLLONESHOT as u32 != 0 {
            interest |= Interest::ONE_SHOT;
        }
        interest
    }
}

//! Bounded staging area for handler records whose descriptor has been
//! unregistered but whose last kernel event may still be in the batch
//! that dispatch is currently processing or about to receive.
//!
//! Freeing a record here one dispatch cycle too early is a
//! use-after-free: the kernel's opaque per-event token is this record's
//! heap address, and a pending `epoll_wait` result may still carry it.

use crate::registry::HandlerRecord;

const DEFAULT_CAPACITY: usize = 1024;

pub(crate) struct DeletionBuffer {
    capacity: usize,
    pending: Vec<Box<HandlerRecord>>,
}

impl DeletionBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity, pending: Vec::new() }
    }

    /// Stages `record` for a later free. If the buffer is full the record
    /// is leaked with a warning — an intentional safety-over-liveness
    /// choice: blocking or reusing the slot unsafely are both worse.
    pub(crate) fn stage(&mut self, record: Box<HandlerRecord>) {
        if self.pending.len() >= self.capacity {
            log::warn!(
                "deletion-deferral buffer full (capacity {}); leaking handler record for fd {}",
                self.capacity,
                record.fd
            );
            std::mem::forget(record);
            return;
        }
        self.pending.push(record);
    }

    /// True if `token` (a handler record's address) is currently staged
    /// for deletion — meaning any in-flight kernel event naming it must
    /// be skipped rather than dispatched.
    pub(crate) fn contains_token(&self, token: u64) -> bool {
        self.pending.iter().any(|r| r.token() == token)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Frees every staged record. Safe to call only after the batch that
    /// might reference these records has already been fully dispatched.
    pub(crate) fn free_all(&mut self) {
        self.pending.clear();
    }
}

impl Default for DeletionBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::Interest;
    use crate::registry::Registry;

    #[test]
    fn overflow_leaks_instead_of_panicking() {
        let mut buffer = DeletionBuffer::new(1);
        let mut registry = Registry::default();

        registry.insert(1, Interest::READABLE, Box::new(|_, _| {}));
        let first = registry.remove(1).unwrap();
        buffer.stage(first);
        assert!(!buffer.is_empty());

        registry.insert(2, Interest::READABLE, Box::new(|_, _| {}));
        let second = registry.remove(2).unwrap();
        buffer.stage(second); // over capacity, leaked rather than panicking
        assert_eq!(buffer.pending.len(), 1);
    }

    #[test]
    fn contains_token_then_free_all_clears() {
        let mut buffer = DeletionBuffer::default();
        let mut registry = Registry::default();
        registry.insert(9, Interest::READABLE, Box::new(|_, _| {}));
        let token = registry.get_mut(9).unwrap().token();
        let record = registry.remove(9).unwrap();
        buffer.stage(record);

        assert!(buffer.contains_token(token));
        buffer.free_all();
        assert!(buffer.is_empty());
    }
}

//! Deferred in-process work: items scheduled to run at a dispatch
//! boundary rather than via kernel readiness.
//!
//! The C original threads an intrusive `list_head` through a
//! caller-allocated struct, so the reactor only ever touches a link and
//! a flag while the caller keeps owning the memory. Safe Rust has no
//! equivalent to an unpinned intrusive list, so the item lives behind a
//! `Rc<RefCell<_>>`: the caller holds a [`DeferredHandle`] (a clone of
//! that `Rc`), the queue holds another clone. This preserves the
//! contract spec.md cares about — idempotent enqueue, caller-triggered
//! dequeue, exactly-one-generation drains — without requiring unsafe
//! pinning.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct DeferredItem {
    // `None` only while `invoke` has taken it out to call it.
    callback: Option<Box<dyn FnMut()>>,
    scheduled: bool,
}

/// A handle to a deferred-work item. Clone and hold onto this to
/// `enqueue`/`dequeue` it later; dropping every handle and letting the
/// queue's own reference go out of scope frees the callback.
#[derive(Clone)]
pub struct DeferredHandle(Rc<RefCell<DeferredItem>>);

impl DeferredHandle {
    pub(crate) fn new(callback: Box<dyn FnMut()>) -> Self {
        Self(Rc::new(RefCell::new(DeferredItem { callback: Some(callback), scheduled: false })))
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.0.borrow().scheduled
    }

    fn set_scheduled(&self, value: bool) {
        self.0.borrow_mut().scheduled = value;
    }

    /// Clears the scheduled flag without unlinking from any queue —
    /// used right before invoking, so a handler that re-enqueues itself
    /// observes a clean slate.
    pub(crate) fn mark_run(&self) {
        self.set_scheduled(false);
    }

    /// Invokes the callback without holding a borrow across the call, so
    /// a handler that re-enqueues or dequeues *itself* — touching this
    /// same cell's `scheduled` flag via `is_scheduled`/`set_scheduled` —
    /// doesn't panic with "already mutably borrowed".
    pub(crate) fn invoke(&self) {
        let mut callback =
            self.0.borrow_mut().callback.take().expect("invoke called while already running");
        callback();
        self.0.borrow_mut().callback = Some(callback);
    }

    fn ptr_eq(&self, other: &DeferredHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Ordered sequence of scheduled deferred-work items.
#[derive(Default)]
pub(crate) struct DeferredQueue {
    items: VecDeque<DeferredHandle>,
}

impl DeferredQueue {
    /// If `item` is not already scheduled, marks it scheduled and appends
    /// it to the tail. A second enqueue while already scheduled is a
    /// no-op, keeping the item present exactly once.
    pub(crate) fn enqueue(&mut self, item: &DeferredHandle) {
        if item.is_scheduled() {
            return;
        }
        item.set_scheduled(true);
        self.items.push_back(item.clone());
    }

    /// Clears the `scheduled` flag and unlinks `item`, if it's currently
    /// queued.
    pub(crate) fn dequeue(&mut self, item: &DeferredHandle) {
        if !item.is_scheduled() {
            return;
        }
        item.set_scheduled(false);
        if let Some(pos) = self.items.iter().position(|i| i.ptr_eq(item)) {
            self.items.remove(pos);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pops out everything queued at this instant, without invoking or
    /// touching any `scheduled` flag. The caller invokes each item with
    /// no queue borrow held, so a handler can reentrantly enqueue or
    /// dequeue a peer (or itself) without re-entering this method.
    pub(crate) fn take_generation(&mut self) -> Vec<DeferredHandle> {
        let generation = self.items.len();
        let mut batch = Vec::with_capacity(generation);
        for _ in 0..generation {
            match self.items.pop_front() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Exercises the queue exactly the way `Reactor::run_timeout` does:
    /// pop the generation out under no held borrow, then invoke each
    /// item still scheduled. Kept here rather than as a `DeferredQueue`
    /// method so tests can wrap `queue` in whatever interior-mutability
    /// shape a given scenario needs (plain `&mut`, or `Rc<RefCell<_>>`
    /// for a handler that reaches back into the queue that's running
    /// it), matching how `reactor.rs` itself never owns the queue
    /// through anything but its own `RefCell` field.
    fn run_generation(queue: &mut DeferredQueue) -> bool {
        for item in queue.take_generation() {
            if item.is_scheduled() {
                item.mark_run();
                item.invoke();
            }
        }
        !queue.is_empty()
    }

    #[test]
    fn enqueue_is_idempotent() {
        let mut queue = DeferredQueue::default();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let item = DeferredHandle::new(Box::new(move || c.set(c.get() + 1)));

        for _ in 0..5 {
            queue.enqueue(&item);
        }
        assert_eq!(queue.items.len(), 1);

        run_generation(&mut queue);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn dequeue_between_schedule_and_turn_is_honoured() {
        let mut queue = DeferredQueue::default();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let item = DeferredHandle::new(Box::new(move || r.set(true)));

        queue.enqueue(&item);
        queue.dequeue(&item);
        run_generation(&mut queue);

        assert!(!ran.get());
    }

    #[test]
    fn follow_up_work_runs_in_a_later_generation() {
        let mut queue = DeferredQueue::default();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let z = DeferredHandle::new(Box::new(move || o.borrow_mut().push("z")));

        let zc = z.clone();
        let o2 = order.clone();
        let x = DeferredHandle::new(Box::new(move || {
            o2.borrow_mut().push("x");
        }));
        let o3 = order.clone();
        let y = DeferredHandle::new(Box::new(move || o3.borrow_mut().push("y")));

        queue.enqueue(&x);
        queue.enqueue(&y);
        let work_remains = run_generation(&mut queue);
        assert_eq!(*order.borrow(), vec!["x", "y"]);
        assert!(!work_remains);

        queue.enqueue(&zc);
        run_generation(&mut queue);
        assert_eq!(*order.borrow(), vec!["x", "y", "z"]);
    }

    #[test]
    fn drain_reports_work_remaining_when_handler_reschedules_self() {
        // The queue itself is reachable from the handler here, the way
        // `Reactor` makes `self.deferred` reachable from a dispatching
        // handler via `enqueue`/`dequeue` taking `&self`. This is the
        // genuine re-enqueue-itself path from spec.md's "handler may
        // dequeue or re-enqueue itself or peers" — it relies on
        // `DeferredHandle::invoke` not holding a borrow across the call.
        let queue = Rc::new(RefCell::new(DeferredQueue::default()));
        let runs = Rc::new(Cell::new(0));

        let item_cell: Rc<RefCell<Option<DeferredHandle>>> = Rc::new(RefCell::new(None));
        let ic = item_cell.clone();
        let q = queue.clone();
        let r = runs.clone();
        let item = DeferredHandle::new(Box::new(move || {
            let count = r.get() + 1;
            r.set(count);
            if count == 1 {
                let handle = ic.borrow().clone().expect("set below before first run");
                q.borrow_mut().enqueue(&handle);
            }
        }));
        *item_cell.borrow_mut() = Some(item.clone());

        queue.borrow_mut().enqueue(&item);

        // Inlined rather than routed through `run_generation`: the
        // generation must be popped out under a short-lived borrow and
        // invoked with none held, exactly as `Reactor::run_timeout` does
        // with its own `RefCell<DeferredQueue>` field, so the handler's
        // reentrant `q.borrow_mut().enqueue(...)` call above doesn't hit
        // an already-held borrow on this very `queue`.
        let batch = queue.borrow_mut().take_generation();
        for item in &batch {
            if item.is_scheduled() {
                item.mark_run();
                item.invoke();
            }
        }
        let work_remains = !queue.borrow().is_empty();
        assert_eq!(runs.get(), 1);
        // Re-enqueuing itself during this generation's invoke must not
        // panic, and must be observed only in the *next* generation.
        assert!(work_remains);

        let batch = queue.borrow_mut().take_generation();
        for item in &batch {
            if item.is_scheduled() {
                item.mark_run();
                item.invoke();
            }
        }
        let work_remains = !queue.borrow().is_empty();
        assert_eq!(runs.get(), 2);
        assert!(!work_remains);
    }
}

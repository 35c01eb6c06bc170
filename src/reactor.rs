//! The dispatcher: ties the registry, deferred-work queue and
//! deletion-deferral buffer to the kernel `epoll` primitive and
//! implements the run loop and the stop/wakeup protocol.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::deferred::{DeferredHandle, DeferredQueue};
use crate::deletion::DeletionBuffer;
use crate::error::{ReactorError, Result};
use crate::interest::Interest;
use crate::registry::{HandlerRecord, Registry};
use crate::sys::{Epoll, Wakeup};

/// Batch size passed to each `epoll_wait` call.
const DEFAULT_BATCH_CAPACITY: usize = 1024;
/// Capacity of the deletion-deferral buffer.
const DEFAULT_DELETION_CAPACITY: usize = 1024;

/// Construction parameters for a [`Reactor`].
///
/// There is no external configuration source for a reactor embedded in a
/// messaging library — these are compile-time-ish tuning knobs, not
/// values loaded from a file or environment, so they're a plain struct
/// rather than routed through a config-file crate.
#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    pub batch_capacity: usize,
    pub deletion_buffer_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            deletion_buffer_capacity: DEFAULT_DELETION_CAPACITY,
        }
    }
}

/// Parameters an outer reactor needs to embed this one, via
/// [`Reactor::poll_params`]. When `fd` fires in the outer reactor, it
/// should call [`Reactor::trampoline`] on this reactor.
pub struct PollParams {
    /// The kernel readiness handle, so the outer loop can watch it too.
    pub fd: RawFd,
    /// Always `Interest::READABLE`: the inner reactor only ever needs a
    /// single readable notification to know it has work to drain.
    pub interest: Interest,
}

/// Shared, atomics-only state touched by [`Reactor::stop`], which must be
/// callable from any thread or signal handler without a lock.
struct StopState {
    stop_loop: AtomicBool,
    in_dispatch: AtomicBool,
    wakeup_armed: AtomicBool,
}

impl StopState {
    fn new() -> Self {
        Self {
            stop_loop: AtomicBool::new(false),
            in_dispatch: AtomicBool::new(false),
            wakeup_armed: AtomicBool::new(false),
        }
    }
}

/// A cloneable, `Send + Sync` handle that can request the reactor it was
/// obtained from to stop, from any thread or a signal handler.
///
/// [`Reactor`] itself holds non-`Send` handler-record closures, so it
/// cannot be shared across threads directly — `Stopper` carries only the
/// atomics and the raw `epoll` fd that arming the wakeup needs.
#[derive(Clone)]
pub struct Stopper {
    state: Arc<StopState>,
    epoll: Arc<Epoll>,
    wakeup_fd: RawFd,
}

impl Stopper {
    /// Requests the nearest enclosing `run` to terminate. See
    /// [`Reactor::stop`] for the full algorithm.
    pub fn stop(&self) {
        if self.state.stop_loop.swap(true, Ordering::SeqCst) {
            return; // already stopping
        }

        if self.state.in_dispatch.load(Ordering::SeqCst)
            || self.state.wakeup_armed.load(Ordering::SeqCst)
        {
            // The run loop will observe stop_loop at the top of its next
            // iteration; no need to interrupt a blocking wait that isn't
            // happening (we're either mid-batch, or already armed from a
            // previous stop that hasn't been consumed yet).
            return;
        }

        self.state.wakeup_armed.store(true, Ordering::SeqCst);
        let bits = (Interest::READABLE | Interest::ONE_SHOT).to_epoll_bits();
        if let Err(err) = self.epoll.modify(self.wakeup_fd, bits, 0) {
            log::error!("stop: failed to arm wakeup descriptor: {}", err);
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.state.stop_loop.load(Ordering::SeqCst)
    }
}

/// A single-threaded, readiness-based event loop.
///
/// `register`/`modify`/`unregister`/`enqueue`/`dequeue` take `&self` (not
/// `&mut self`): they use interior mutability so a handler invoked from
/// inside [`Reactor::run`] can call back into the reactor that is
/// currently dispatching it, the way the teacher's own `Reactor::register`
/// does. `run`/`run_timeout` keep `&mut self`, since only one dispatch
/// loop may be active on a given reactor at a time.
pub struct Reactor {
    epoll: Arc<Epoll>,
    wakeup: Wakeup,
    state: Arc<StopState>,
    registry: RefCell<Registry>,
    deferred: RefCell<DeferredQueue>,
    deletions: RefCell<DeletionBuffer>,
    event_buf: Vec<libc::epoll_event>,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    pub fn with_config(config: ReactorConfig) -> Result<Self> {
        let epoll = Arc::new(Epoll::new()?);
        let wakeup = Wakeup::new()?;
        // Registered with an empty mask up front; `stop()` flips it to
        // one-shot readable to arm it. The opaque token for this
        // descriptor is `0`, the null sentinel distinguishing it from
        // any application handler record's (non-zero) heap address.
        epoll.add(wakeup.fd(), 0, 0)?;

        Ok(Self {
            epoll,
            wakeup,
            state: Arc::new(StopState::new()),
            registry: RefCell::new(Registry::default()),
            deferred: RefCell::new(DeferredQueue::default()),
            deletions: RefCell::new(DeletionBuffer::new(config.deletion_buffer_capacity)),
            event_buf: Vec::with_capacity(config.batch_capacity),
        })
    }

    /// Registers `fd` for `interest`; `callback` runs once per qualifying
    /// readiness event until the descriptor is unregistered.
    pub fn register<F>(&self, fd: RawFd, interest: Interest, callback: F) -> Result<()>
    where
        F: FnMut(RawFd, Interest) + 'static,
    {
        let mut registry = self.registry.borrow_mut();
        if registry.contains(fd) {
            log::debug!("register: fd {} already present", fd);
            return Err(ReactorError::AlreadyRegistered(fd));
        }

        let record = registry.insert(fd, interest, Box::new(callback));
        let token = record.token();

        if let Err(err) = self.epoll.add(fd, interest.to_epoll_bits(), token) {
            // Kernel rejected it: unlink and free, call fails.
            registry.remove(fd);
            log::error!("register: epoll_ctl(ADD) failed for fd {}: {}", fd, err);
            return Err(err);
        }
        Ok(())
    }

    /// Re-arms the kernel watch for `fd` with a new mask. Fails with
    /// [`ReactorError::NotFound`] if `fd` was never registered.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut registry = self.registry.borrow_mut();
        let record = registry.get_mut(fd).ok_or(ReactorError::NotFound(fd))?;
        let token = record.token();
        record.mask = interest;
        self.epoll.modify(fd, interest.to_epoll_bits(), token)
    }

    /// Unregisters `fd`. The handler record is staged in the
    /// deletion-deferral buffer rather than freed immediately: a pending
    /// kernel event returned by an already-issued `epoll_wait` may still
    /// carry this record's address, and freeing now would be a
    /// use-after-free on the next dispatch.
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        let record = self.registry.borrow_mut().remove(fd).ok_or(ReactorError::NotFound(fd))?;
        self.deletions.borrow_mut().stage(record);
        self.epoll.delete(fd)
    }

    /// Creates a new deferred-work item. Hold onto the returned handle to
    /// `enqueue`/`dequeue` it.
    pub fn new_deferred<F>(&self, callback: F) -> DeferredHandle
    where
        F: FnMut() + 'static,
    {
        DeferredHandle::new(Box::new(callback))
    }

    /// Schedules `item` to run at the next dispatch boundary. A no-op if
    /// `item` is already scheduled.
    pub fn enqueue(&self, item: &DeferredHandle) {
        self.deferred.borrow_mut().enqueue(item);
    }

    /// Unschedules `item`, if currently queued.
    pub fn dequeue(&self, item: &DeferredHandle) {
        self.deferred.borrow_mut().dequeue(item);
    }

    /// Runs until [`Reactor::stop`] is called, blocking indefinitely
    /// between batches when there's nothing else to do.
    pub fn run(&mut self) -> Result<()> {
        self.run_timeout(None)
    }

    /// Runs until stopped or `timeout` elapses, whichever comes first.
    /// `None` blocks indefinitely between batches.
    pub fn run_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Step 1: drain one generation of deferred work. Items are
            // popped out of the queue under a short-lived borrow, then
            // invoked with no borrow held — a handler that reentrantly
            // enqueues/dequeues a peer must be able to re-borrow
            // `self.deferred`.
            let batch = self.deferred.borrow_mut().take_generation();
            for item in &batch {
                // A peer handler earlier in this same generation may
                // already have dequeued `item`; honour that.
                if item.is_scheduled() {
                    item.mark_run();
                    item.invoke();
                }
            }
            let work_remains = !self.deferred.borrow().is_empty();

            // Step 2: free anything staged for deletion by the previous
            // iteration's handlers — safe now, since that iteration's
            // kernel batch has already been fully dispatched.
            self.deletions.borrow_mut().free_all();

            // Step 3: compute this wait's timeout.
            let wait_for = if work_remains {
                Some(Duration::ZERO)
            } else {
                match deadline {
                    None => None,
                    Some(d) => Some(d.saturating_duration_since(Instant::now())),
                }
            };

            // Step 4: wait for kernel readiness.
            let events = self.epoll.wait(&mut self.event_buf, wait_for)?;

            // Step 5: dispatch the batch.
            if !events.is_empty() {
                self.state.in_dispatch.store(true, Ordering::SeqCst);
                for event in &events {
                    if event.token == 0 {
                        // Wakeup descriptor: auto-disarmed by ONESHOT.
                        if self.state.wakeup_armed.swap(false, Ordering::SeqCst) {
                            self.state.stop_loop.store(true, Ordering::SeqCst);
                        }
                        continue;
                    }
                    if self.deletions.borrow().contains_token(event.token) {
                        // Unregistered between wait issue and dispatch.
                        continue;
                    }
                    // SAFETY: `event.token` is the heap address of a
                    // HandlerRecord that is still owned by either the
                    // registry or the deletion-deferral buffer (we just
                    // checked it isn't staged there), so it has not been
                    // freed. Dispatch doesn't hold any RefCell borrow
                    // across this call, so a handler may reentrantly
                    // register/modify/unregister any descriptor,
                    // including this one, without a double-borrow panic.
                    let record = unsafe { &mut *(event.token as *mut HandlerRecord) };
                    record.invoke(Interest::from_epoll_bits(event.bits));
                }
                self.state.in_dispatch.store(false, Ordering::SeqCst);
            } else if !work_remains && timeout == Some(Duration::ZERO) {
                // Caller asked for a single non-blocking pass and this
                // empty poll was it — stop. A zero-poll driven by
                // work_remains must NOT stop the loop here; it's just
                // this generation's deferred work finding nothing on the
                // kernel side, and the next iteration runs the following
                // generation. Finite-timeout expiry is handled by the
                // deadline check below, not here.
                self.state.stop_loop.store(true, Ordering::SeqCst);
            }

            // Step 7: timeout bookkeeping.
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    self.state.stop_loop.store(true, Ordering::SeqCst);
                }
            }

            // Step 8.
            if self.state.stop_loop.load(Ordering::SeqCst) {
                break;
            }
        }

        // Step 9: shutdown drain.
        while !self.deferred.borrow().is_empty() {
            let batch = self.deferred.borrow_mut().take_generation();
            for item in &batch {
                if item.is_scheduled() {
                    item.mark_run();
                    item.invoke();
                }
            }
        }
        self.deletions.borrow_mut().free_all();
        self.state.stop_loop.store(false, Ordering::SeqCst);
        self.state.wakeup_armed.store(false, Ordering::SeqCst);

        Ok(())
    }

    /// Requests the nearest enclosing `run` to terminate. Safe to call
    /// from any thread or a signal handler — it touches only two
    /// booleans and, at most, issues one `epoll_ctl` syscall. Equivalent
    /// to `self.stopper().stop()`.
    pub fn stop(&self) {
        self.stopper().stop();
    }

    pub fn is_stopping(&self) -> bool {
        self.state.stop_loop.load(Ordering::SeqCst)
    }

    /// Returns a cloneable, `Send + Sync` handle that can stop this
    /// reactor from another thread or a signal handler.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            state: self.state.clone(),
            epoll: self.epoll.clone(),
            wakeup_fd: self.wakeup.fd(),
        }
    }

    /// Exposes the kernel handle so this reactor can itself be nested
    /// inside a larger outer reactor. The outer reactor should invoke
    /// [`Reactor::trampoline`] on this reactor when its own trampoline
    /// fires.
    pub fn poll_params(&self) -> PollParams {
        PollParams { fd: self.epoll.as_raw_fd(), interest: Interest::READABLE }
    }

    /// The trampoline an outer reactor should invoke when the descriptor
    /// from [`Reactor::poll_params`] fires: sets `stop_loop` and runs a
    /// single non-blocking drain-and-return cycle, letting this inner
    /// reactor be driven one batch at a time by an outer driver.
    pub fn trampoline(&mut self) -> Result<()> {
        self.state.stop_loop.store(true, Ordering::SeqCst);
        self.run_timeout(Some(Duration::ZERO))
    }
}

impl Drop for Reactor {
    /// Unregisters everything left in the registry and frees any
    /// handler records still staged for deletion.
    fn drop(&mut self) {
        for record in self.registry.get_mut().drain() {
            if let Err(err) = self.epoll.delete(record.fd) {
                log::warn!("drop: failed to deregister fd {}: {}", record.fd, err);
            }
            self.deletions.get_mut().stage(record);
        }
        self.deletions.get_mut().free_all();
    }
}

//! Safepoints and handshakes
//!
//! ## Design
//!
//! - Every attached thread is either *running* or *safe* (blocked, parked,
//!   waiting). Only safe threads may have their lock records inspected or
//!   rewritten by another thread.
//! - Running threads reach [`VmThread::poll`] at every synchronizer entry
//!   point; blocking work is wrapped in [`VmThread::blocking`].
//! - [`Safepoint::run`] stops all threads. [`handshake`] stops exactly one,
//!   either by queueing the operation for the target's next poll or, when
//!   the target is already safe, by running it on the target's behalf while
//!   holding the target suspended.
//! - Safepoints and handshakes are serialized by one VM-operation lock.

use crate::mark_word::ThreadId;
use crate::thread::{ThreadRegistry, VmThread};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Operation queued for a thread's next poll
pub(crate) type HandshakeOp = Box<dyn FnOnce(&VmThread) + Send>;

/// Shared coordinator state
pub struct SafepointSync {
    /// Guards every safe/suspended/exited transition
    pub(crate) state: Mutex<()>,
    changed: Condvar,
    active: AtomicBool,
    vm_op: Mutex<()>,
    stats: Mutex<SafepointStats>,
}

/// Coordinator counters
#[derive(Debug, Default, Clone)]
pub struct SafepointStats {
    /// Completed safepoints
    pub safepoints: u64,
    /// Total time spent inside safepoint operations (nanoseconds)
    pub safepoint_time_ns: u64,
    /// Completed handshakes
    pub handshakes: u64,
    /// Handshakes executed by the requester on a safe target's behalf
    pub handshakes_on_behalf: u64,
}

impl SafepointSync {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(()),
            changed: Condvar::new(),
            active: AtomicBool::new(false),
            vm_op: Mutex::new(()),
            stats: Mutex::new(SafepointStats::default()),
        }
    }

    /// A safepoint is in progress
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Counter snapshot
    pub fn stats(&self) -> SafepointStats {
        self.stats.lock().clone()
    }

    /// Drain queued handshakes, then mark `thread` safe
    fn enter_safe(&self, thread: &VmThread) {
        loop {
            let ops: Vec<HandshakeOp> = {
                let _state = self.state.lock();
                let ops: Vec<_> = thread.pending.lock().drain(..).collect();
                if ops.is_empty() {
                    thread.safe.store(true, Ordering::Release);
                    self.changed.notify_all();
                    return;
                }
                ops
            };
            for op in ops {
                op(thread);
            }
        }
    }

    /// Wait out any safepoint or handshake holding `thread`, then mark it running
    pub(crate) fn leave_safe(&self, thread: &VmThread) {
        let mut state = self.state.lock();
        while self.active.load(Ordering::Acquire) || thread.suspended.load(Ordering::Acquire) {
            self.changed.wait(&mut state);
        }
        thread.safe.store(false, Ordering::Release);
    }

    fn run_pending(&self, thread: &VmThread) {
        let ops: Vec<HandshakeOp> = thread.pending.lock().drain(..).collect();
        for op in ops {
            op(thread);
        }
    }

    /// Final transition of a detaching thread
    pub(crate) fn mark_exited(&self, thread: &VmThread) {
        loop {
            let ops: Vec<HandshakeOp> = {
                let _state = self.state.lock();
                let ops: Vec<_> = thread.pending.lock().drain(..).collect();
                if ops.is_empty() {
                    thread.exited.store(true, Ordering::Release);
                    thread.safe.store(true, Ordering::Release);
                    self.changed.notify_all();
                    return;
                }
                ops
            };
            for op in ops {
                op(thread);
            }
        }
    }

    fn notify(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }
}

impl ThreadRegistry {
    /// Safepoint and handshake counters
    pub fn safepoint_stats(&self) -> SafepointStats {
        self.sync.stats()
    }
}

impl VmThread {
    /// Safepoint poll: run queued handshakes and stop for an active safepoint
    #[inline]
    pub fn poll(&self) {
        if !self.poll_requested.load(Ordering::Acquire) && !self.sync.is_active() {
            return;
        }
        self.poll_slow();
    }

    #[cold]
    fn poll_slow(&self) {
        self.poll_requested.store(false, Ordering::Release);
        self.sync.run_pending(self);
        if self.sync.is_active() {
            self.sync.enter_safe(self);
            self.sync.leave_safe(self);
        }
    }

    /// Run `f` in a safe region.
    ///
    /// `f` must not touch this thread's lock records. On return the thread
    /// waits until no safepoint or handshake holds it.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.sync.enter_safe(self);
        let result = f();
        self.sync.leave_safe(self);
        result
    }
}

/// Capability proving every attached thread is stopped.
///
/// Only [`Safepoint::run`] creates one; operations that rewrite other
/// threads' lock records or move monitors between lists require it.
pub struct SafepointScope<'a> {
    threads: &'a [Arc<VmThread>],
}

impl<'a> SafepointScope<'a> {
    /// Threads that were attached when the safepoint began
    pub fn threads(&self) -> &'a [Arc<VmThread>] {
        self.threads
    }

    /// Look up a stopped thread
    pub fn thread(&self, id: ThreadId) -> Option<&'a Arc<VmThread>> {
        self.threads.iter().find(|t| t.id() == id)
    }
}

/// Global stop-the-world operations
pub struct Safepoint;

impl Safepoint {
    /// Stop every attached thread, run `op`, resume.
    ///
    /// `requester` is the calling thread when it is attached; it is not
    /// waited for. An attached caller that passes `None` deadlocks.
    pub fn run<R>(
        registry: &ThreadRegistry,
        requester: Option<&VmThread>,
        op: impl FnOnce(&SafepointScope<'_>) -> R,
    ) -> R {
        let sync = &registry.sync;
        let _vm_op = match requester {
            Some(thread) => thread.blocking(|| sync.vm_op.lock()),
            None => sync.vm_op.lock(),
        };

        let begin = Instant::now();
        let threads = {
            let mut state = sync.state.lock();
            sync.active.store(true, Ordering::Release);
            let threads = registry.snapshot();
            for thread in &threads {
                thread.poll_requested.store(true, Ordering::Release);
            }
            let requester_id = requester.map(|t| t.id());
            while !threads.iter().all(|t| {
                Some(t.id()) == requester_id
                    || t.safe.load(Ordering::Acquire)
                    || t.exited.load(Ordering::Acquire)
            }) {
                sync.changed.wait(&mut state);
            }
            threads
        };
        tracing::trace!(target: "otter_vm_sync", threads = threads.len(), "safepoint begin");

        let result = op(&SafepointScope { threads: &threads });

        {
            let _state = sync.state.lock();
            sync.active.store(false, Ordering::Release);
            sync.changed.notify_all();
        }
        let elapsed = begin.elapsed().as_nanos() as u64;
        {
            let mut stats = sync.stats.lock();
            stats.safepoints += 1;
            stats.safepoint_time_ns += elapsed;
        }
        tracing::trace!(target: "otter_vm_sync", elapsed_ns = elapsed, "safepoint end");
        result
    }
}

/// Run `op` against `target` with only `target` stopped.
///
/// The target runs `op` itself at its next poll, or the requester runs it on
/// the target's behalf if the target is already safe. The requester is safe
/// while it waits.
pub fn handshake<R>(
    registry: &ThreadRegistry,
    requester: &VmThread,
    target: &Arc<VmThread>,
    op: impl FnOnce(&VmThread) -> R + Send + 'static,
) -> R
where
    R: Send + 'static,
{
    if requester.id() == target.id() {
        return op(target);
    }
    let sync = &registry.sync;
    let _vm_op = requester.blocking(|| sync.vm_op.lock());
    tracing::trace!(target: "otter_vm_sync", requester = %requester.id(), target = %target.id(), "handshake begin");

    let state = sync.state.lock();
    if target.exited.load(Ordering::Acquire) || target.safe.load(Ordering::Acquire) {
        target.suspended.store(true, Ordering::Release);
        drop(state);
        let result = op(target);
        {
            let _state = sync.state.lock();
            target.suspended.store(false, Ordering::Release);
            sync.changed.notify_all();
        }
        let mut stats = sync.stats.lock();
        stats.handshakes += 1;
        stats.handshakes_on_behalf += 1;
        return result;
    }

    let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
    let completion = slot.clone();
    let notifier = sync.clone();
    target.pending.lock().push_back(Box::new(move |thread| {
        let result = op(thread);
        *completion.lock() = Some(result);
        notifier.notify();
    }));
    target.poll_requested.store(true, Ordering::Release);
    drop(state);

    let result = requester.blocking(|| {
        let mut state = sync.state.lock();
        loop {
            if let Some(result) = slot.lock().take() {
                return result;
            }
            sync.changed.wait(&mut state);
        }
    });
    sync.stats.lock().handshakes += 1;
    tracing::trace!(target: "otter_vm_sync", target = %target.id(), "handshake end");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_safepoint_waits_for_running_thread() {
        let registry = Arc::new(ThreadRegistry::new());
        let stop = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicUsize::new(0));

        let worker = {
            let registry = registry.clone();
            let stop = stop.clone();
            let polls = polls.clone();
            thread::spawn(move || {
                let me = registry.attach("worker");
                while !stop.load(Ordering::Acquire) {
                    me.poll();
                    polls.fetch_add(1, Ordering::Relaxed);
                }
                registry.remove(&me);
            })
        };

        while polls.load(Ordering::Relaxed) == 0 {
            thread::yield_now();
        }
        let seen = Safepoint::run(&registry, None, |scope| {
            // Every stopped thread is safe while the operation runs
            assert!(scope.threads().iter().all(|t| t.is_safe()));
            let before = polls.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(10));
            assert_eq!(polls.load(Ordering::Relaxed), before);
            scope.threads().len()
        });
        assert_eq!(seen, 1);
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
        assert_eq!(registry.sync.stats().safepoints, 1);
    }

    #[test]
    fn test_handshake_on_safe_target_runs_on_behalf() {
        let registry = Arc::new(ThreadRegistry::new());
        let requester = registry.attach("requester");
        let target = registry.attach("target");
        // Target is parked in a safe region
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = {
            let target = target.clone();
            thread::spawn(move || target.blocking(|| rx.recv().unwrap()))
        };
        while !target.is_safe() {
            thread::yield_now();
        }
        let id = handshake(&registry, &requester, &target, |t| t.id());
        assert_eq!(id, target.id());
        assert_eq!(registry.sync.stats().handshakes_on_behalf, 1);
        tx.send(()).unwrap();
        handle.join().unwrap();
        registry.remove(&target);
        registry.remove(&requester);
    }

    #[test]
    fn test_handshake_on_running_target_runs_at_poll() {
        let registry = Arc::new(ThreadRegistry::new());
        let requester = registry.attach("requester");
        let target = registry.attach("target");
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let target = target.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    target.poll();
                }
            })
        };
        let ran_on = handshake(&registry, &requester, &target, |_| thread::current().id());
        assert_eq!(ran_on, handle.thread().id());
        stop.store(true, Ordering::Release);
        handle.join().unwrap();
        registry.remove(&target);
        registry.remove(&requester);
    }
}

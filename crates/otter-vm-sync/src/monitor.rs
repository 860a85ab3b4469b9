//! Heavyweight object monitor
//!
//! Owner plus recursion count, an entry queue of contended enterers and a
//! wait set. Monitors live in the [`crate::monitor_pool`] arena and are
//! recycled across objects after deflation.

use crate::error::{SyncError, SyncResult};
use crate::mark_word::{MarkWord, MonitorId, ThreadId};
use crate::object::ObjectRef;
use crate::thread::{ParkEvent, VmThread};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Why a monitor was inflated
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InflateCause {
    /// Runtime-internal locking
    VmInternal = 0,
    /// Contended `monitorenter`
    MonitorEnter = 1,
    /// `wait`
    Wait = 2,
    /// `notify` / `notifyAll`
    Notify = 3,
    /// Identity hash on a locked object
    HashCode = 4,
    /// Native-interface enter
    JniEnter = 5,
    /// Native-interface exit
    JniExit = 6,
}

impl InflateCause {
    /// Number of causes
    pub const COUNT: usize = 7;

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            InflateCause::VmInternal => "VM Internal",
            InflateCause::MonitorEnter => "Monitor Enter",
            InflateCause::Wait => "Monitor Wait",
            InflateCause::Notify => "Monitor Notify",
            InflateCause::HashCode => "Monitor Hash Code",
            InflateCause::JniEnter => "JNI Monitor Enter",
            InflateCause::JniExit => "JNI Monitor Exit",
        }
    }
}

impl From<u8> for InflateCause {
    fn from(v: u8) -> Self {
        match v {
            1 => InflateCause::MonitorEnter,
            2 => InflateCause::Wait,
            3 => InflateCause::Notify,
            4 => InflateCause::HashCode,
            5 => InflateCause::JniEnter,
            6 => InflateCause::JniExit,
            _ => InflateCause::VmInternal,
        }
    }
}

/// A thread in a monitor's wait set
struct Waiter {
    thread: ThreadId,
    park: Arc<ParkEvent>,
    notified: AtomicBool,
}

/// Heavyweight lock
pub struct ObjectMonitor {
    id: MonitorId,
    /// Displaced lock word of the served object (carries the identity hash)
    header: AtomicU64,
    object: Mutex<Option<ObjectRef>>,
    owner: AtomicU32,
    recursions: AtomicU32,
    /// Contending enterers plus waiters, for the whole duration of each
    contentions: AtomicI32,
    /// Threads blocked on the entry queue
    waiters: AtomicU32,
    entry: Mutex<()>,
    entry_cv: Condvar,
    wait_set: Mutex<VecDeque<Arc<Waiter>>>,
    /// Intrusive free/in-use list link (raw [`MonitorId`], 0 = end)
    pub(crate) next_om: AtomicU32,
    cause: AtomicU8,
}

impl ObjectMonitor {
    pub(crate) fn new(id: MonitorId) -> Self {
        Self {
            id,
            header: AtomicU64::new(0),
            object: Mutex::new(None),
            owner: AtomicU32::new(0),
            recursions: AtomicU32::new(0),
            contentions: AtomicI32::new(0),
            waiters: AtomicU32::new(0),
            entry: Mutex::new(()),
            entry_cv: Condvar::new(),
            wait_set: Mutex::new(VecDeque::new()),
            next_om: AtomicU32::new(0),
            cause: AtomicU8::new(InflateCause::VmInternal as u8),
        }
    }

    /// Arena index
    pub fn id(&self) -> MonitorId {
        self.id
    }

    /// Displaced lock word
    pub fn header(&self) -> MarkWord {
        MarkWord::from_raw(self.header.load(Ordering::Acquire))
    }

    pub(crate) fn set_header(&self, mark: MarkWord) {
        self.header.store(mark.raw(), Ordering::Release);
    }

    /// Install `new` as displaced word if it still equals `expected`
    pub(crate) fn cas_header(&self, expected: MarkWord, new: MarkWord) -> Result<(), MarkWord> {
        self.header
            .compare_exchange(expected.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(MarkWord::from_raw)
    }

    /// Object currently served
    pub fn object(&self) -> Option<ObjectRef> {
        self.object.lock().clone()
    }

    /// Serves `obj`
    pub fn serves(&self, obj: &ObjectRef) -> bool {
        self.object.lock().as_ref() == Some(obj)
    }

    /// Apply `f` to the back-reference (root scanning may replace it)
    pub(crate) fn with_object_mut<R>(&self, f: impl FnOnce(&mut Option<ObjectRef>) -> R) -> R {
        f(&mut self.object.lock())
    }

    /// Owning thread
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::new(self.owner.load(Ordering::Acquire))
    }

    /// Owned by `thread`
    pub fn is_owned_by(&self, thread: &VmThread) -> bool {
        self.owner.load(Ordering::Acquire) == thread.id().get()
    }

    /// Recursion count beyond the first acquisition
    pub fn recursions(&self) -> u32 {
        self.recursions.load(Ordering::Relaxed)
    }

    /// Contention reference count
    pub fn contentions(&self) -> i32 {
        self.contentions.load(Ordering::SeqCst)
    }

    /// Threads blocked on the entry queue
    pub fn entry_waiters(&self) -> u32 {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Threads in the wait set
    pub fn waiting(&self) -> usize {
        self.wait_set.lock().len()
    }

    /// Ids of threads in the wait set
    pub fn waiting_threads(&self) -> Vec<ThreadId> {
        self.wait_set.lock().iter().map(|w| w.thread).collect()
    }

    /// Last inflation cause
    pub fn cause(&self) -> InflateCause {
        InflateCause::from(self.cause.load(Ordering::Relaxed))
    }

    /// Owned, contended, or waited on
    pub fn is_busy(&self) -> bool {
        self.owner.load(Ordering::SeqCst) != 0
            || self.contentions.load(Ordering::SeqCst) > 0
            || self.waiters.load(Ordering::SeqCst) > 0
            || !self.wait_set.lock().is_empty()
    }

    /// Bind a freshly allocated monitor to `obj`
    pub(crate) fn bind(
        &self,
        obj: &ObjectRef,
        header: MarkWord,
        owner: Option<ThreadId>,
        recursions: u32,
        cause: InflateCause,
    ) {
        self.set_header(header);
        *self.object.lock() = Some(obj.clone());
        self.recursions.store(recursions, Ordering::Relaxed);
        self.owner.store(owner.map_or(0, ThreadId::get), Ordering::Release);
        self.cause.store(cause as u8, Ordering::Relaxed);
    }

    /// Return to the pristine free state
    pub(crate) fn recycle(&self) {
        self.header.store(0, Ordering::Release);
        *self.object.lock() = None;
        self.owner.store(0, Ordering::Release);
        self.recursions.store(0, Ordering::Relaxed);
        self.cause.store(InflateCause::VmInternal as u8, Ordering::Relaxed);
    }

    fn describe(&self) -> String {
        match self.object() {
            Some(obj) => obj.to_string(),
            None => format!("{}<unbound>", self.id),
        }
    }

    /// Fails with `IllegalMonitorState` unless `thread` owns the monitor
    pub fn check_owner(&self, thread: &VmThread, op: &'static str) -> SyncResult<()> {
        if self.is_owned_by(thread) {
            Ok(())
        } else {
            Err(SyncError::IllegalMonitorState {
                op,
                object: self.describe(),
            })
        }
    }

    #[inline]
    fn try_acquire(&self, me: u32) -> bool {
        self.owner
            .compare_exchange(0, me, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire without blocking. Reentry bumps the recursion count.
    pub fn try_enter(&self, thread: &VmThread) -> bool {
        let me = thread.id().get();
        if self.owner.load(Ordering::Relaxed) == me {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        self.try_acquire(me)
    }

    /// Acquire, parking on the entry queue while contended
    pub fn enter(&self, thread: &VmThread) {
        if self.try_enter(thread) {
            return;
        }
        self.contentions.fetch_add(1, Ordering::SeqCst);
        self.enter_contended(thread);
        self.contentions.fetch_sub(1, Ordering::SeqCst);
    }

    fn enter_contended(&self, thread: &VmThread) {
        let me = thread.id().get();
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.try_acquire(me) {
                return;
            }
            backoff.snooze();
        }
        thread.blocking(|| {
            let mut entry = self.entry.lock();
            loop {
                if self.try_acquire(me) {
                    return;
                }
                self.waiters.fetch_add(1, Ordering::SeqCst);
                if self.owner.load(Ordering::SeqCst) != 0 {
                    self.entry_cv.wait(&mut entry);
                }
                self.waiters.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }

    fn release(&self) {
        self.owner.store(0, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _entry = self.entry.lock();
            self.entry_cv.notify_one();
        }
    }

    /// Release one level
    pub fn exit(&self, thread: &VmThread) -> SyncResult<()> {
        self.check_owner(thread, "exit")?;
        if self.recursions.load(Ordering::Relaxed) > 0 {
            self.recursions.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }
        self.release();
        Ok(())
    }

    /// Release every level at once, returning the recursion count
    pub fn complete_exit(&self, thread: &VmThread) -> SyncResult<u32> {
        self.check_owner(thread, "complete_exit")?;
        let recursions = self.recursions.swap(0, Ordering::Relaxed);
        self.release();
        Ok(recursions)
    }

    /// Reacquire after [`complete_exit`](Self::complete_exit) with the saved count
    pub fn reenter(&self, thread: &VmThread, recursions: u32) {
        self.enter(thread);
        self.recursions.store(recursions, Ordering::Relaxed);
    }

    /// Release fully, block until notified, interrupted or timed out, reacquire.
    ///
    /// `millis == 0` waits forever. Uninterruptible waits leave a pending
    /// interrupt set for the caller to observe later.
    pub fn wait(&self, thread: &VmThread, millis: u64, interruptible: bool) -> SyncResult<()> {
        self.check_owner(thread, "wait")?;
        if interruptible && thread.take_interrupt() {
            return Err(SyncError::Interrupted);
        }
        let deadline = (millis > 0).then(|| Instant::now() + Duration::from_millis(millis));

        self.contentions.fetch_add(1, Ordering::SeqCst);
        let waiter = Arc::new(Waiter {
            thread: thread.id(),
            park: thread.park_event().clone(),
            notified: AtomicBool::new(false),
        });
        self.wait_set.lock().push_back(waiter.clone());
        let saved = self.recursions.swap(0, Ordering::Relaxed);
        self.release();

        thread.blocking(|| {
            loop {
                if waiter.notified.load(Ordering::Acquire) {
                    break;
                }
                if interruptible && thread.is_interrupted() {
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
                waiter.park.park(deadline);
            }
        });

        let notified = {
            let mut wait_set = self.wait_set.lock();
            if let Some(pos) = wait_set.iter().position(|w| Arc::ptr_eq(w, &waiter)) {
                wait_set.remove(pos);
            }
            waiter.notified.load(Ordering::Acquire)
        };

        self.enter_contended(thread);
        self.recursions.store(saved, Ordering::Relaxed);
        self.contentions.fetch_sub(1, Ordering::SeqCst);

        if interruptible && !notified && thread.take_interrupt() {
            return Err(SyncError::Interrupted);
        }
        Ok(())
    }

    fn wake(waiter: &Waiter) {
        waiter.notified.store(true, Ordering::Release);
        waiter.park.unpark();
    }

    /// Wake one waiter
    pub fn notify(&self, thread: &VmThread) -> SyncResult<()> {
        self.check_owner(thread, "notify")?;
        if let Some(waiter) = self.wait_set.lock().pop_front() {
            Self::wake(&waiter);
        }
        Ok(())
    }

    /// Wake every waiter
    pub fn notify_all(&self, thread: &VmThread) -> SyncResult<()> {
        self.check_owner(thread, "notifyAll")?;
        let mut wait_set = self.wait_set.lock();
        for waiter in wait_set.drain(..) {
            Self::wake(&waiter);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("id", &self.id)
            .field("owner", &self.owner())
            .field("recursions", &self.recursions())
            .field("contentions", &self.contentions())
            .field("waiting", &self.waiting())
            .field("cause", &self.cause())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadRegistry;

    fn monitor() -> ObjectMonitor {
        ObjectMonitor::new(MonitorId::new(1).unwrap())
    }

    #[test]
    fn test_recursive_enter_exit() {
        let registry = ThreadRegistry::new();
        let t = registry.attach("t");
        let m = monitor();
        m.enter(&t);
        m.enter(&t);
        assert_eq!(m.recursions(), 1);
        m.exit(&t).unwrap();
        assert!(m.is_owned_by(&t));
        m.exit(&t).unwrap();
        assert_eq!(m.owner(), None);
        assert!(!m.is_busy());
        registry.remove(&t);
    }

    #[test]
    fn test_non_owner_is_illegal() {
        let registry = ThreadRegistry::new();
        let a = registry.attach("a");
        let b = registry.attach("b");
        let m = monitor();
        m.enter(&a);
        assert!(matches!(m.notify(&b), Err(SyncError::IllegalMonitorState { op: "notify", .. })));
        assert!(matches!(m.wait(&b, 1, true), Err(SyncError::IllegalMonitorState { .. })));
        assert!(m.exit(&b).is_err());
        m.exit(&a).unwrap();
        registry.remove(&a);
        registry.remove(&b);
    }

    #[test]
    fn test_timed_wait_restores_recursions() {
        let registry = ThreadRegistry::new();
        let t = registry.attach("t");
        let m = monitor();
        m.enter(&t);
        m.enter(&t);
        m.wait(&t, 10, true).unwrap();
        assert!(m.is_owned_by(&t));
        assert_eq!(m.recursions(), 1);
        assert_eq!(m.contentions(), 0);
        assert_eq!(m.waiting(), 0);
        registry.remove(&t);
    }

    #[test]
    fn test_pending_interrupt_fails_fast() {
        let registry = ThreadRegistry::new();
        let t = registry.attach("t");
        let m = monitor();
        m.enter(&t);
        t.interrupt();
        assert_eq!(m.wait(&t, 0, true), Err(SyncError::Interrupted));
        assert!(!t.is_interrupted());
        // Uninterruptible wait keeps the flag
        t.interrupt();
        m.wait(&t, 5, false).unwrap();
        assert!(t.is_interrupted());
        registry.remove(&t);
    }

    #[test]
    fn test_complete_exit_reenter() {
        let registry = ThreadRegistry::new();
        let t = registry.attach("t");
        let m = monitor();
        for _ in 0..3 {
            m.enter(&t);
        }
        let saved = m.complete_exit(&t).unwrap();
        assert_eq!(saved, 2);
        assert_eq!(m.owner(), None);
        m.reenter(&t, saved);
        assert_eq!(m.recursions(), 2);
        assert!(m.is_owned_by(&t));
        registry.remove(&t);
    }

    #[test]
    fn test_inflate_cause_names() {
        assert_eq!(InflateCause::from(InflateCause::HashCode as u8), InflateCause::HashCode);
        assert_eq!(InflateCause::JniExit.name(), "JNI Monitor Exit");
    }
}

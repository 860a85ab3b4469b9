//! Object synchronizer
//!
//! Public enter/exit/wait/notify/hash API. Entry tries the bias first, then a
//! lightweight lock record, and inflates to a monitor on contention, `wait`,
//! identity hashing of a locked object, or native-interface locking.
//!
//! Inflation of a lightweight lock parks the lock word at `INFLATING` while
//! the owner's records are read; the owner cannot release in that window.
//! All of the owner's records for the object become heavyweight records and
//! the monitor's recursion count is the record count minus one.

use crate::biased::RevocationController;
use crate::error::{SyncError, SyncResult};
use crate::mark_word::{LockRecordRef, MarkWord, MonitorId, ThreadId};
use crate::monitor::{InflateCause, ObjectMonitor};
use crate::monitor_pool::MonitorPool;
use crate::object::ObjectRef;
use crate::thread::{DisplacedHeader, LockRecord, ThreadRegistry, VmThread};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Who holds an object's lock, from the asking thread's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwnership {
    /// The asking thread
    OwnerSelf,
    /// Nobody
    OwnerNone,
    /// Some other thread
    OwnerOther,
}

/// Enter/exit/wait/notify/hash over lightweight and heavyweight locks
pub struct ObjectSynchronizer {
    pool: Arc<MonitorPool>,
    threads: Arc<ThreadRegistry>,
    bias: Arc<dyn RevocationController>,
    use_biased_locking: bool,
    pub(crate) deflation_threshold: u32,
    inflations: [AtomicU64; InflateCause::COUNT],
    pub(crate) last_deflation: Mutex<Option<crate::deflation::DeflateMonitorCounters>>,
}

impl ObjectSynchronizer {
    /// Wire the synchronizer to its collaborators
    pub fn new(
        pool: Arc<MonitorPool>,
        threads: Arc<ThreadRegistry>,
        bias: Arc<dyn RevocationController>,
        use_biased_locking: bool,
        deflation_threshold: u32,
    ) -> Self {
        Self {
            pool,
            threads,
            bias,
            use_biased_locking,
            deflation_threshold,
            inflations: Default::default(),
            last_deflation: Mutex::new(None),
        }
    }

    /// Monitor storage
    pub fn pool(&self) -> &Arc<MonitorPool> {
        &self.pool
    }

    pub(crate) fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// Inflations so far, per cause
    pub fn inflation_counts(&self) -> Vec<(InflateCause, u64)> {
        (0..InflateCause::COUNT as u8)
            .map(|i| {
                let cause = InflateCause::from(i);
                (cause, self.inflations[i as usize].load(Ordering::Relaxed))
            })
            .collect()
    }

    /// Total inflations
    pub fn total_inflations(&self) -> u64 {
        self.inflations.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    #[inline]
    fn revoke_bias(&self, thread: &VmThread, obj: &ObjectRef) {
        if self.use_biased_locking && obj.mark().has_bias_pattern() {
            self.bias.revoke_and_rebias(thread, obj, false);
        }
    }

    fn illegal(op: &'static str, obj: &ObjectRef) -> SyncError {
        SyncError::IllegalMonitorState {
            op,
            object: obj.to_string(),
        }
    }

    /// Lock `obj`, using the bias when configured
    pub fn enter(&self, thread: &VmThread, obj: &ObjectRef) {
        if self.use_biased_locking {
            self.fast_enter(thread, obj);
        } else {
            self.slow_enter(thread, obj);
        }
    }

    /// Unlock `obj`
    pub fn exit(&self, thread: &VmThread, obj: &ObjectRef) -> SyncResult<()> {
        if self.use_biased_locking {
            self.fast_exit(thread, obj)
        } else {
            self.slow_exit(thread, obj)
        }
    }

    /// Bias-aware enter
    pub fn fast_enter(&self, thread: &VmThread, obj: &ObjectRef) {
        thread.poll();
        if self.bias.try_enter(thread, obj) {
            thread.lock_stack().push(LockRecord {
                object: obj.clone(),
                displaced: DisplacedHeader::Unused,
            });
            return;
        }
        self.slow_enter(thread, obj);
    }

    /// Lightweight enter, inflating on contention
    pub fn slow_enter(&self, thread: &VmThread, obj: &ObjectRef) {
        thread.poll();
        let header = obj.header();
        loop {
            let mark = header.load();
            if mark.is_neutral() {
                let mut stack = thread.lock_stack();
                let slot = stack.push(LockRecord {
                    object: obj.clone(),
                    displaced: DisplacedHeader::Displaced(mark),
                });
                let locked = MarkWord::lightweight(LockRecordRef {
                    thread: thread.id(),
                    slot,
                });
                if header.compare_exchange(mark, locked).is_ok() {
                    self.bias.record_fast_path_entry();
                    return;
                }
                stack.remove(slot);
                continue;
            }
            if mark.locker().is_some_and(|r| r.thread == thread.id()) {
                let mut stack = thread.lock_stack();
                // Revalidate under the stack lock so an inflater counts this level
                if header.load() == mark {
                    stack.push(LockRecord {
                        object: obj.clone(),
                        displaced: DisplacedHeader::Recursive,
                    });
                    return;
                }
                continue;
            }
            if mark.has_bias_pattern() {
                self.bias.revoke_and_rebias(thread, obj, false);
                continue;
            }
            let monitor = self.inflate(thread, obj, InflateCause::MonitorEnter);
            monitor.enter(thread);
            thread.lock_stack().push(LockRecord {
                object: obj.clone(),
                displaced: DisplacedHeader::Unused,
            });
            return;
        }
    }

    /// Release the newest lock record for `obj`.
    ///
    /// Recursive records and bias-held records are popped without touching
    /// the lock word.
    pub fn fast_exit(&self, thread: &VmThread, obj: &ObjectRef) -> SyncResult<()> {
        let backoff = Backoff::new();
        loop {
            let mut stack = thread.lock_stack();
            let Some(slot) = stack.latest_for(obj) else {
                return Err(Self::illegal("monitorexit", obj));
            };
            let Some(displaced) = stack.get(slot).map(|r| r.displaced) else {
                crate::sync_fatal!("lock record slot {slot} vanished");
            };
            let mark = obj.mark();
            match displaced {
                DisplacedHeader::Recursive => {
                    if mark.locker().is_some_and(|r| r.thread == thread.id()) {
                        stack.remove(slot);
                        return Ok(());
                    }
                }
                DisplacedHeader::Displaced(original) => {
                    let locked = MarkWord::lightweight(LockRecordRef {
                        thread: thread.id(),
                        slot,
                    });
                    if mark == locked {
                        if obj.header().compare_exchange(mark, original).is_ok() {
                            stack.remove(slot);
                            return Ok(());
                        }
                        // Lost to an inflater; its claim resolves shortly
                        drop(stack);
                        backoff.snooze();
                        continue;
                    }
                }
                DisplacedHeader::Unused => {
                    if mark.biased_locker() == Some(thread.id()) {
                        stack.remove(slot);
                        return Ok(());
                    }
                    if let Some(id) = mark.monitor() {
                        self.pool.get(id).exit(thread)?;
                        stack.remove(slot);
                        return Ok(());
                    }
                    if !mark.is_inflating() {
                        return Err(Self::illegal("monitorexit", obj));
                    }
                }
            }
            if mark.is_inflating() {
                drop(stack);
                backoff.snooze();
                continue;
            }
            crate::sync_fatal!(
                "{obj}: lock word {mark:?} disagrees with {displaced:?} record of {}",
                thread.id()
            );
        }
    }

    /// Lightweight/heavyweight exit
    pub fn slow_exit(&self, thread: &VmThread, obj: &ObjectRef) -> SyncResult<()> {
        self.fast_exit(thread, obj)
    }

    /// Lock `obj` from native code: no lock record, always heavyweight
    pub fn jni_enter(&self, thread: &VmThread, obj: &ObjectRef) {
        thread.poll();
        self.revoke_bias(thread, obj);
        self.inflate(thread, obj, InflateCause::JniEnter).enter(thread);
    }

    /// Unlock a native-interface lock
    pub fn jni_exit(&self, thread: &VmThread, obj: &ObjectRef) -> SyncResult<()> {
        self.revoke_bias(thread, obj);
        self.inflate(thread, obj, InflateCause::JniExit).exit(thread)
    }

    /// Non-blocking heavyweight enter. `false` means take the slow path.
    pub fn quick_enter(&self, thread: &VmThread, obj: &ObjectRef) -> bool {
        let Some(id) = obj.mark().monitor() else {
            return false;
        };
        if !self.pool.get(id).try_enter(thread) {
            return false;
        }
        thread.lock_stack().push(LockRecord {
            object: obj.clone(),
            displaced: DisplacedHeader::Unused,
        });
        true
    }

    /// Non-blocking exit of a monitor `thread` owns through its newest record
    /// for `obj`. `false` means nothing changed; use [`exit`](Self::exit).
    pub fn quick_exit(&self, thread: &VmThread, obj: &ObjectRef) -> bool {
        let Some(id) = obj.mark().monitor() else {
            return false;
        };
        let monitor = self.pool.get(id);
        if !monitor.is_owned_by(thread) {
            return false;
        }
        let mut stack = thread.lock_stack();
        let Some(slot) = stack.latest_for(obj) else {
            return false;
        };
        if !matches!(stack.get(slot).map(|r| r.displaced), Some(DisplacedHeader::Unused)) {
            return false;
        }
        if monitor.exit(thread).is_err() {
            return false;
        }
        stack.remove(slot);
        true
    }

    /// Release everything `thread` holds on `obj`, returning the recursion count
    pub fn complete_exit(&self, thread: &VmThread, obj: &ObjectRef) -> SyncResult<u32> {
        thread.poll();
        self.revoke_bias(thread, obj);
        self.inflate(thread, obj, InflateCause::VmInternal)
            .complete_exit(thread)
    }

    /// Reacquire after [`complete_exit`](Self::complete_exit)
    pub fn reenter(&self, thread: &VmThread, obj: &ObjectRef, recursions: u32) {
        thread.poll();
        self.revoke_bias(thread, obj);
        self.inflate(thread, obj, InflateCause::VmInternal)
            .reenter(thread, recursions);
    }

    /// Wait on `obj`'s monitor. `millis == 0` waits until notified or interrupted.
    pub fn wait(&self, thread: &VmThread, obj: &ObjectRef, millis: u64) -> SyncResult<()> {
        thread.poll();
        self.revoke_bias(thread, obj);
        let monitor = self.inflate(thread, obj, InflateCause::Wait);
        let result = monitor.wait(thread, millis, true);
        tracing::trace!(target: "otter_vm_sync", object = %obj, ?result, "wait returned");
        result
    }

    /// Wait that never reports interruption; a pending interrupt stays set
    pub fn wait_uninterruptibly(
        &self,
        thread: &VmThread,
        obj: &ObjectRef,
        millis: u64,
    ) -> SyncResult<()> {
        thread.poll();
        self.revoke_bias(thread, obj);
        self.inflate(thread, obj, InflateCause::Wait)
            .wait(thread, millis, false)
    }

    fn notify_impl(&self, thread: &VmThread, obj: &ObjectRef, all: bool) -> SyncResult<()> {
        thread.poll();
        self.revoke_bias(thread, obj);
        if obj.mark().locker().is_some_and(|r| r.thread == thread.id()) {
            // Lightweight-locked by us: nobody can be waiting
            return Ok(());
        }
        let monitor = self.inflate(thread, obj, InflateCause::Notify);
        if all {
            monitor.notify_all(thread)
        } else {
            monitor.notify(thread)
        }
    }

    /// Wake one waiter
    pub fn notify(&self, thread: &VmThread, obj: &ObjectRef) -> SyncResult<()> {
        self.notify_impl(thread, obj, false)
    }

    /// Wake every waiter
    pub fn notify_all(&self, thread: &VmThread, obj: &ObjectRef) -> SyncResult<()> {
        self.notify_impl(thread, obj, true)
    }

    /// Non-inflating notify. `false` means take the slow path.
    pub fn quick_notify(&self, thread: &VmThread, obj: &ObjectRef, all: bool) -> bool {
        let mark = obj.mark();
        if mark.locker().is_some_and(|r| r.thread == thread.id()) {
            return true;
        }
        if let Some(id) = mark.monitor() {
            let monitor = self.pool.get(id);
            if monitor.is_owned_by(thread) {
                let notified = if all {
                    monitor.notify_all(thread)
                } else {
                    monitor.notify(thread)
                };
                return notified.is_ok();
            }
        }
        false
    }

    /// Install a monitor for `obj` (or return the installed one)
    pub fn inflate(&self, thread: &VmThread, obj: &ObjectRef, cause: InflateCause) -> &ObjectMonitor {
        let header = obj.header();
        let backoff = Backoff::new();
        loop {
            let mark = header.load();
            if let Some(id) = mark.monitor() {
                return self.pool.get(id);
            }
            if mark.is_inflating() {
                backoff.snooze();
                continue;
            }
            if mark.is_marked() {
                crate::sync_fatal!("{obj}: mutator observed collector lock word {mark:?}");
            }
            if mark.has_bias_pattern() {
                self.bias.revoke_and_rebias(thread, obj, false);
                continue;
            }
            if let Some(record) = mark.locker() {
                let id = self.pool.om_alloc(thread);
                if header.compare_exchange(mark, MarkWord::INFLATING).is_err() {
                    self.pool.om_release(thread, id);
                    continue;
                }
                self.inflate_locked(thread, obj, record, id, cause);
                self.note_inflation(obj, id, cause);
                return self.pool.get(id);
            }

            let id = self.pool.om_alloc(thread);
            let monitor = self.pool.get(id);
            monitor.bind(obj, mark, None, 0, cause);
            if header.compare_exchange(mark, MarkWord::inflated(id)).is_err() {
                self.pool.om_release(thread, id);
                continue;
            }
            self.note_inflation(obj, id, cause);
            return monitor;
        }
    }

    /// Finish inflating a lightweight lock; the lock word holds `INFLATING`
    fn inflate_locked(
        &self,
        thread: &VmThread,
        obj: &ObjectRef,
        record: LockRecordRef,
        id: MonitorId,
        cause: InflateCause,
    ) {
        let other;
        let owner: &VmThread = if record.thread == thread.id() {
            thread
        } else {
            match self.threads.get(record.thread) {
                Some(t) => {
                    other = t;
                    &other
                }
                None => crate::sync_fatal!("{obj} is lightweight-locked by unknown {}", record.thread),
            }
        };
        let mut stack = owner.lock_stack();
        let displaced = match stack.get(record.slot) {
            Some(LockRecord {
                object,
                displaced: DisplacedHeader::Displaced(original),
            }) if object == obj => *original,
            other => crate::sync_fatal!(
                "{obj}: lock word points at slot {} of {} holding {other:?}",
                record.slot,
                record.thread
            ),
        };
        let mut levels = 0u32;
        for (_, r) in stack.iter_mut() {
            if r.object == *obj {
                r.displaced = DisplacedHeader::Unused;
                levels += 1;
            }
        }
        self.pool
            .get(id)
            .bind(obj, displaced, Some(record.thread), levels - 1, cause);
        obj.header().store(MarkWord::inflated(id));
    }

    fn note_inflation(&self, obj: &ObjectRef, id: MonitorId, cause: InflateCause) {
        self.inflations[cause as usize].fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            target: "otter_vm_sync",
            object = %obj,
            monitor = %id,
            cause = cause.name(),
            "inflated"
        );
    }

    /// Stable identity hash of `obj`
    pub fn fast_hash_code(&self, thread: &VmThread, obj: &ObjectRef) -> u32 {
        let header = obj.header();
        loop {
            let mark = header.load();
            if mark.has_bias_pattern() {
                self.bias.revoke_and_rebias(thread, obj, false);
                continue;
            }
            if mark.is_neutral() {
                if let Some(hash) = mark.hash() {
                    return hash;
                }
                let hash = thread.next_hash();
                if header.compare_exchange(mark, mark.with_hash(hash)).is_ok() {
                    return hash;
                }
                continue;
            }
            if let Some(id) = mark.monitor() {
                let monitor = self.pool.get(id);
                let displaced = monitor.header();
                if let Some(hash) = displaced.hash() {
                    return hash;
                }
                let hash = thread.next_hash();
                if monitor.cas_header(displaced, displaced.with_hash(hash)).is_ok() {
                    return hash;
                }
                continue;
            }
            if let Some(record) = mark.locker() {
                if record.thread == thread.id() {
                    let stack = thread.lock_stack();
                    if let Some(LockRecord {
                        displaced: DisplacedHeader::Displaced(original),
                        ..
                    }) = stack.get(record.slot)
                    {
                        if let Some(hash) = original.hash() {
                            return hash;
                        }
                    }
                }
            }
            // Locked without room for a hash
            self.inflate(thread, obj, InflateCause::HashCode);
        }
    }

    /// Identity hash for the current thread
    pub fn identity_hash_value_for(&self, thread: &VmThread, obj: &ObjectRef) -> u32 {
        thread.poll();
        self.fast_hash_code(thread, obj)
    }

    /// `thread` currently holds `obj`
    pub fn current_thread_holds_lock(&self, thread: &VmThread, obj: &ObjectRef) -> bool {
        let backoff = Backoff::new();
        loop {
            let mark = obj.mark();
            if let Some(id) = mark.monitor() {
                return self.pool.get(id).is_owned_by(thread);
            }
            if let Some(record) = mark.locker() {
                return record.thread == thread.id();
            }
            if mark.has_bias_pattern() {
                return mark.biased_locker() == Some(thread.id())
                    && thread.lock_stack().latest_for(obj).is_some();
            }
            if !mark.is_inflating() {
                return false;
            }
            backoff.snooze();
        }
    }

    /// Classify `obj`'s owner relative to `thread`
    pub fn query_lock_ownership(&self, thread: &VmThread, obj: &ObjectRef) -> LockOwnership {
        let relative = |owner: Option<ThreadId>| match owner {
            None => LockOwnership::OwnerNone,
            Some(id) if id == thread.id() => LockOwnership::OwnerSelf,
            Some(_) => LockOwnership::OwnerOther,
        };
        let backoff = Backoff::new();
        loop {
            let mark = obj.mark();
            if mark.has_bias_pattern() {
                match mark.biased_locker() {
                    None => return LockOwnership::OwnerNone,
                    Some(id) if id == thread.id() => {
                        return if thread.lock_stack().latest_for(obj).is_some() {
                            LockOwnership::OwnerSelf
                        } else {
                            LockOwnership::OwnerNone
                        };
                    }
                    Some(_) => {
                        self.bias.revoke_and_rebias(thread, obj, false);
                        continue;
                    }
                }
            }
            if let Some(record) = mark.locker() {
                return relative(Some(record.thread));
            }
            if let Some(id) = mark.monitor() {
                return relative(self.pool.get(id).owner());
            }
            if !mark.is_inflating() {
                return LockOwnership::OwnerNone;
            }
            backoff.snooze();
        }
    }

    /// Owner of `obj`'s lock, revoking a foreign bias to find out
    pub fn get_lock_owner(&self, thread: &VmThread, obj: &ObjectRef) -> Option<ThreadId> {
        let backoff = Backoff::new();
        loop {
            let mark = obj.mark();
            if mark.has_bias_pattern() {
                if mark.is_biased_anonymously() {
                    return None;
                }
                self.bias.revoke_and_rebias(thread, obj, false);
                continue;
            }
            if let Some(record) = mark.locker() {
                return Some(record.thread);
            }
            if let Some(id) = mark.monitor() {
                return self.pool.get(id).owner();
            }
            if !mark.is_inflating() {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Fully release every monitor `thread` still owns (native locks at detach)
    pub fn release_monitors_owned_by_thread(&self, thread: &VmThread) -> usize {
        let mut released = 0;
        for monitor in self.pool.iter() {
            if monitor.is_owned_by(thread) && monitor.complete_exit(thread).is_ok() {
                released += 1;
            }
        }
        if released > 0 {
            tracing::debug!(target: "otter_vm_sync", thread = %thread.id(), released, "released owned monitors");
        }
        released
    }

    /// Visit every monitor currently serving an object
    pub fn monitors_iterate(&self, mut f: impl FnMut(&ObjectMonitor)) {
        for monitor in self.pool.iter() {
            if monitor.object().is_some() {
                f(monitor);
            }
        }
    }

    /// Release `thread`'s lock records newest first, as unwinding frames do
    pub(crate) fn unwind_thread(&self, thread: &VmThread) -> usize {
        let mut unwound = 0;
        loop {
            let top = thread.lock_stack().iter().next().map(|(slot, r)| (slot, r.object.clone()));
            let Some((slot, obj)) = top else {
                return unwound;
            };
            if self.fast_exit(thread, &obj).is_err() {
                thread.lock_stack().remove(slot);
            }
            unwound += 1;
        }
    }
}

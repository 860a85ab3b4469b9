//! Biased locking
//!
//! ## Design
//!
//! - An object of a biasable type starts anonymously biased. The first
//!   locker claims the bias with one CAS; later entries by that thread test
//!   the lock word and never write it.
//! - A bias toward another live thread is revoked by stopping that thread
//!   (handshake or safepoint) and rewriting its lock records as if it had
//!   used lightweight locking all along.
//! - Each type carries a bias epoch in its prototype header. A bulk rebias
//!   bumps the epoch so outstanding biases become stale and can be replaced
//!   by a plain CAS. A bulk revoke makes the type permanently unbiasable.
//! - Biases of objects currently locked on some thread's stack survive a
//!   bulk rebias (their epoch is refreshed) and are converted to lightweight
//!   locks by a bulk revoke. No heap sweep is needed.

use crate::config::{RevocationMode, SyncConfig};
use crate::mark_word::{LockRecordRef, MarkWord, ThreadId};
use crate::object::{ObjectRef, TypeRegistry};
use crate::safepoint::{Safepoint, SafepointScope, handshake};
use crate::thread::{DisplacedHeader, ThreadRegistry, VmThread};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Outcome of a revocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The object was not biased
    NotBiased,
    /// The bias is gone
    BiasRevoked,
    /// The object is now biased toward the requesting thread
    BiasRevokedAndRebiased,
    /// Nothing changed; the lock word moved concurrently
    NotRevoked,
}

/// Per-type revocation policy decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeuristicsResult {
    /// Lock word is not biased
    NotBiased,
    /// Revoke this object only
    SingleRevoke,
    /// Bump the type's epoch
    BulkRebias,
    /// Disable biasing for the type
    BulkRevoke,
}

/// Event counters
#[derive(Debug, Default)]
pub struct BiasedLockingCounters {
    total_entry_count: AtomicU64,
    biased_lock_entry_count: AtomicU64,
    anonymously_biased_lock_entry_count: AtomicU64,
    rebiased_lock_entry_count: AtomicU64,
    revoked_lock_entry_count: AtomicU64,
    expired_bias_count: AtomicU64,
    handshakes_count: AtomicU64,
    fast_path_entry_count: AtomicU64,
}

impl BiasedLockingCounters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Any lock entry was counted
    pub fn nonzero(&self) -> bool {
        self.total_entry_count.load(Ordering::Relaxed) > 0
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> BiasedLockingStats {
        BiasedLockingStats {
            total_entries: self.total_entry_count.load(Ordering::Relaxed),
            biased_entries: self.biased_lock_entry_count.load(Ordering::Relaxed),
            anonymously_biased_entries: self
                .anonymously_biased_lock_entry_count
                .load(Ordering::Relaxed),
            rebiased_entries: self.rebiased_lock_entry_count.load(Ordering::Relaxed),
            revoked_entries: self.revoked_lock_entry_count.load(Ordering::Relaxed),
            expired_biases: self.expired_bias_count.load(Ordering::Relaxed),
            handshakes: self.handshakes_count.load(Ordering::Relaxed),
            fast_path_entries: self.fast_path_entry_count.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`BiasedLockingCounters`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BiasedLockingStats {
    /// Lock entries that went through the bias test
    pub total_entries: u64,
    /// Entries that hit an existing bias
    pub biased_entries: u64,
    /// Entries that claimed an anonymous bias
    pub anonymously_biased_entries: u64,
    /// Entries that replaced a stale bias
    pub rebiased_entries: u64,
    /// Revocations of a bias that was still valid
    pub revoked_entries: u64,
    /// Stale-epoch biases dropped without rebiasing. No biaser held them,
    /// so these are not entries and are not counted as revocations.
    pub expired_biases: u64,
    /// Revocation handshakes
    pub handshakes: u64,
    /// Entries completed by a lightweight CAS
    pub fast_path_entries: u64,
}

impl BiasedLockingStats {
    /// Entries that needed the heavyweight path
    pub fn slow_path_entries(&self) -> u64 {
        self.total_entries.saturating_sub(
            self.biased_entries
                + self.anonymously_biased_entries
                + self.rebiased_entries
                + self.revoked_entries
                + self.fast_path_entries,
        )
    }
}

impl fmt::Display for BiasedLockingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# total entries: {}", self.total_entries)?;
        writeln!(f, "# biased lock entries: {}", self.biased_entries)?;
        writeln!(f, "# anonymously biased lock entries: {}", self.anonymously_biased_entries)?;
        writeln!(f, "# rebiased lock entries: {}", self.rebiased_entries)?;
        writeln!(f, "# revoked lock entries: {}", self.revoked_entries)?;
        writeln!(f, "# expired biases: {}", self.expired_biases)?;
        writeln!(f, "# handshakes entries: {}", self.handshakes)?;
        writeln!(f, "# fast path lock entries: {}", self.fast_path_entries)?;
        write!(f, "# slow path lock entries: {}", self.slow_path_entries())
    }
}

/// Bias policy seam consumed by the synchronizer
pub trait RevocationController: Send + Sync {
    /// Biasing is switched on
    fn enabled(&self) -> bool;

    /// Bias fast path: `true` means `thread` now holds `obj` through its bias
    fn try_enter(&self, thread: &VmThread, obj: &ObjectRef) -> bool;

    /// Remove (or, with `attempt_rebias`, take over) the bias of `obj`
    fn revoke_and_rebias(&self, thread: &VmThread, obj: &ObjectRef, attempt_rebias: bool)
    -> Condition;

    /// Revoke with every thread already stopped
    fn revoke_at_safepoint(&self, scope: &SafepointScope<'_>, obj: &ObjectRef);

    /// A lock entry completed by a lightweight CAS
    fn record_fast_path_entry(&self) {}
}

/// Rewrite `biaser`'s lock records for `obj` and drop the bias.
///
/// The caller has `biaser` stopped (handshake, safepoint, or it is the
/// current thread). The oldest record receives the displaced unbiased word,
/// newer ones become recursive, and the lock word points at the oldest. With
/// no records the object becomes unlocked, or anonymously biased when
/// `allow_rebias` is set.
pub(crate) fn walk_stack_and_revoke(
    obj: &ObjectRef,
    allow_rebias: bool,
    biaser: &VmThread,
) -> Condition {
    let mark = obj.mark();
    if !mark.has_bias_pattern() {
        return Condition::NotBiased;
    }
    if mark.biased_locker() != Some(biaser.id()) {
        return Condition::NotRevoked;
    }
    let unbiased = mark.unbiased();
    let mut stack = biaser.lock_stack();
    let oldest = stack
        .iter()
        .filter(|(_, r)| r.object == *obj)
        .map(|(slot, _)| slot)
        .last();
    let new_mark = match oldest {
        Some(slot) => MarkWord::lightweight(LockRecordRef {
            thread: biaser.id(),
            slot,
        }),
        None if allow_rebias => {
            MarkWord::biased_prototype(obj.type_descriptor().bias_epoch()).with_age(mark.age())
        }
        None => unbiased,
    };
    if obj.header().compare_exchange(mark, new_mark).is_err() {
        return Condition::NotRevoked;
    }
    if let Some(oldest) = oldest {
        for (slot, record) in stack.iter_mut() {
            if record.object == *obj {
                record.displaced = if slot == oldest {
                    DisplacedHeader::Displaced(unbiased)
                } else {
                    DisplacedHeader::Recursive
                };
            }
        }
    }
    Condition::BiasRevoked
}

/// Revoke a bias nobody can be holding (anonymous, or the biaser is gone)
fn revoke_unheld(obj: &ObjectRef, mark: MarkWord, allow_rebias: bool) -> Condition {
    let new_mark = if allow_rebias && obj.type_descriptor().allows_biasing() {
        MarkWord::biased_prototype(obj.type_descriptor().bias_epoch()).with_age(mark.age())
    } else {
        mark.unbiased()
    };
    match obj.header().compare_exchange(mark, new_mark) {
        Ok(()) => Condition::BiasRevoked,
        Err(_) => Condition::NotRevoked,
    }
}

/// Biased locking controller
pub struct BiasedLocking {
    threads: Arc<ThreadRegistry>,
    types: Arc<TypeRegistry>,
    use_biased_locking: bool,
    startup_delay: Duration,
    mode: RevocationMode,
    bulk_rebias_threshold: u32,
    bulk_revoke_threshold: u32,
    decay_time: Duration,
    enabled: AtomicBool,
    counters: BiasedLockingCounters,
    preserved: Mutex<Option<Vec<(ObjectRef, MarkWord)>>>,
}

impl BiasedLocking {
    /// Create the controller. Call [`init`](Self::init) to switch biasing on.
    pub fn new(config: &SyncConfig, threads: Arc<ThreadRegistry>, types: Arc<TypeRegistry>) -> Self {
        Self {
            threads,
            types,
            use_biased_locking: config.use_biased_locking,
            startup_delay: config.biased_locking_startup_delay,
            mode: config.bias_revocation_mode,
            bulk_rebias_threshold: config.bulk_rebias_threshold,
            bulk_revoke_threshold: config.bulk_revoke_threshold,
            decay_time: config.biased_locking_decay_time,
            enabled: AtomicBool::new(false),
            counters: BiasedLockingCounters::default(),
            preserved: Mutex::new(None),
        }
    }

    /// Enable biasing now, or after the configured startup delay on a
    /// background thread
    pub fn init(self: &Arc<Self>) {
        if !self.use_biased_locking {
            return;
        }
        if self.startup_delay.is_zero() {
            Safepoint::run(&self.threads, None, |scope| self.enable(scope));
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let delay = self.startup_delay;
        let spawned = std::thread::Builder::new()
            .name("bias-enabler".into())
            .spawn(move || {
                std::thread::sleep(delay);
                if let Some(bias) = weak.upgrade() {
                    Safepoint::run(&bias.threads, None, |scope| bias.enable(scope));
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(target: "otter_vm_sync", %err, "could not start bias enabler, enabling now");
            Safepoint::run(&self.threads, None, |scope| self.enable(scope));
        }
    }

    /// Make every registered type biasable
    pub fn enable(&self, _scope: &SafepointScope<'_>) {
        self.types.set_biased_by_default(true);
        for ty in self.types.all() {
            if !ty.allows_biasing() && ty.last_bulk_revocation().is_none() {
                ty.set_prototype_header(MarkWord::biased_prototype(0));
            }
        }
        self.enabled.store(true, Ordering::Release);
        tracing::info!(target: "otter_vm_sync", types = self.types.len(), "biased locking enabled");
    }

    /// Biasing has been switched on
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Event counters
    pub fn counters(&self) -> &BiasedLockingCounters {
        &self.counters
    }

    /// Decide how to handle a revocation for `obj`'s type
    pub fn update_heuristics(&self, obj: &ObjectRef) -> HeuristicsResult {
        if !obj.mark().has_bias_pattern() {
            return HeuristicsResult::NotBiased;
        }
        let ty = obj.type_descriptor();
        let mut count = ty.revocation_count();
        if count >= self.bulk_rebias_threshold && count < self.bulk_revoke_threshold {
            if let Some(last) = ty.last_bulk_revocation() {
                if last.elapsed() >= self.decay_time {
                    // Enough time since the last bulk rebias: start over
                    ty.reset_revocation_count();
                    count = 0;
                }
            }
        }
        if count <= self.bulk_revoke_threshold {
            count = ty.record_revocation();
        }
        if count == self.bulk_revoke_threshold {
            HeuristicsResult::BulkRevoke
        } else if count == self.bulk_rebias_threshold {
            HeuristicsResult::BulkRebias
        } else {
            HeuristicsResult::SingleRevoke
        }
    }

    fn revoke_and_rebias_impl(
        &self,
        thread: &VmThread,
        obj: &ObjectRef,
        attempt_rebias: bool,
    ) -> Condition {
        let header = obj.header();
        loop {
            let mark = header.load();
            if !mark.has_bias_pattern() {
                return Condition::NotBiased;
            }
            let ty = obj.type_descriptor();
            let prototype = ty.prototype_header();

            if mark.is_biased_anonymously() && !attempt_rebias {
                if header.compare_exchange(mark, mark.unbiased()).is_ok() {
                    return Condition::BiasRevoked;
                }
                continue;
            }
            if !prototype.has_bias_pattern() {
                // Stale bias from before a bulk revoke of the type
                if header.compare_exchange(mark, mark.unbiased()).is_ok() {
                    BiasedLockingCounters::bump(&self.counters.revoked_lock_entry_count);
                    return Condition::BiasRevoked;
                }
                continue;
            }
            if mark.bias_epoch() != prototype.bias_epoch() {
                // Stale epoch after a bulk rebias: nobody holds this bias
                if attempt_rebias {
                    let rebiased = MarkWord::biased(thread.id(), prototype.bias_epoch(), mark.age());
                    if header.compare_exchange(mark, rebiased).is_ok() {
                        BiasedLockingCounters::bump(&self.counters.rebiased_lock_entry_count);
                        return Condition::BiasRevokedAndRebiased;
                    }
                } else if header.compare_exchange(mark, mark.unbiased()).is_ok() {
                    BiasedLockingCounters::bump(&self.counters.expired_bias_count);
                    return Condition::BiasRevoked;
                }
                continue;
            }
            if attempt_rebias {
                match mark.biased_locker() {
                    None => {
                        let claimed = MarkWord::biased(thread.id(), mark.bias_epoch(), mark.age());
                        if header.compare_exchange(mark, claimed).is_ok() {
                            BiasedLockingCounters::bump(
                                &self.counters.anonymously_biased_lock_entry_count,
                            );
                            return Condition::BiasRevokedAndRebiased;
                        }
                        continue;
                    }
                    Some(owner) if owner == thread.id() => {
                        BiasedLockingCounters::bump(&self.counters.biased_lock_entry_count);
                        return Condition::BiasRevokedAndRebiased;
                    }
                    Some(_) => {}
                }
            }

            let condition = match self.update_heuristics(obj) {
                HeuristicsResult::NotBiased => return Condition::NotBiased,
                HeuristicsResult::SingleRevoke => self.single_revoke(thread, obj, mark),
                HeuristicsResult::BulkRebias => self.bulk_revoke_or_rebias(thread, obj, true, attempt_rebias),
                HeuristicsResult::BulkRevoke => self.bulk_revoke_or_rebias(thread, obj, false, attempt_rebias),
            };
            if condition != Condition::NotRevoked {
                return condition;
            }
        }
    }

    /// Revoke the valid bias `mark` of `obj` toward some thread
    fn single_revoke(&self, thread: &VmThread, obj: &ObjectRef, mark: MarkWord) -> Condition {
        let Some(biaser) = mark.biased_locker() else {
            return revoke_unheld(obj, mark, false);
        };
        if biaser == thread.id() {
            // Our own bias: our stack is stable
            let condition = walk_stack_and_revoke(obj, false, thread);
            if condition == Condition::BiasRevoked {
                BiasedLockingCounters::bump(&self.counters.revoked_lock_entry_count);
            }
            return condition;
        }
        let Some(target) = self.threads.get(biaser) else {
            return revoke_unheld(obj, mark, false);
        };
        tracing::debug!(
            target: "otter_vm_sync",
            object = %obj,
            biaser = %biaser,
            requester = %thread.id(),
            mode = ?self.mode,
            "revoking bias"
        );
        let condition = match self.mode {
            RevocationMode::Handshake => {
                let object = obj.clone();
                let condition = handshake(&self.threads, thread, &target, move |t| {
                    if object.mark() == mark {
                        walk_stack_and_revoke(&object, false, t)
                    } else {
                        Condition::NotRevoked
                    }
                });
                BiasedLockingCounters::bump(&self.counters.handshakes_count);
                condition
            }
            RevocationMode::Safepoint => Safepoint::run(&self.threads, Some(thread), |scope| {
                match scope.thread(biaser) {
                    Some(t) if obj.mark() == mark => walk_stack_and_revoke(obj, false, t),
                    _ => Condition::NotRevoked,
                }
            }),
        };
        if condition == Condition::BiasRevoked {
            BiasedLockingCounters::bump(&self.counters.revoked_lock_entry_count);
        }
        condition
    }

    fn bulk_revoke_or_rebias(
        &self,
        thread: &VmThread,
        obj: &ObjectRef,
        bulk_rebias: bool,
        attempt_rebias: bool,
    ) -> Condition {
        Safepoint::run(&self.threads, Some(thread), |scope| {
            self.bulk_revoke_or_rebias_at_safepoint(scope, obj, bulk_rebias, attempt_rebias, Some(thread.id()))
        })
    }

    fn bulk_revoke_or_rebias_at_safepoint(
        &self,
        scope: &SafepointScope<'_>,
        obj: &ObjectRef,
        bulk_rebias: bool,
        attempt_rebias: bool,
        requester: Option<ThreadId>,
    ) -> Condition {
        let ty = obj.type_descriptor();
        tracing::info!(
            target: "otter_vm_sync",
            type_name = ty.name(),
            operation = if bulk_rebias { "rebias" } else { "revoke" },
            revocations = ty.revocation_count(),
            "bulk bias operation"
        );
        ty.set_last_bulk_revocation(Instant::now());

        if bulk_rebias {
            if ty.allows_biasing() {
                let prototype = ty.prototype_header().incr_bias_epoch();
                ty.set_prototype_header(prototype);
                let epoch = prototype.bias_epoch();
                // Held biases stay valid under the new epoch
                for t in scope.threads() {
                    let stack = t.lock_stack();
                    for (_, record) in stack.iter() {
                        if !Arc::ptr_eq(record.object.type_descriptor(), ty) {
                            continue;
                        }
                        let mark = record.object.mark();
                        if mark.has_bias_pattern() {
                            record.object.header().store(mark.with_bias_epoch(epoch));
                        }
                    }
                }
            }
            let allow_rebias = attempt_rebias && ty.allows_biasing();
            self.revoke_bias_at_safepoint(scope, obj, allow_rebias);
        } else {
            ty.set_prototype_header(MarkWord::unlocked());
            let mut held = Vec::new();
            for t in scope.threads() {
                for (_, record) in t.lock_stack().iter() {
                    if Arc::ptr_eq(record.object.type_descriptor(), ty)
                        && record.object.mark().has_bias_pattern()
                        && !held.contains(&record.object)
                    {
                        held.push(record.object.clone());
                    }
                }
            }
            for o in &held {
                self.revoke_bias_at_safepoint(scope, o, false);
            }
            self.revoke_bias_at_safepoint(scope, obj, false);
        }
        BiasedLockingCounters::bump(&self.counters.revoked_lock_entry_count);

        if attempt_rebias {
            if let Some(requester) = requester {
                let mark = obj.mark();
                if mark.is_biased_anonymously() && ty.allows_biasing() {
                    obj.header()
                        .store(MarkWord::biased(requester, ty.bias_epoch(), mark.age()));
                    BiasedLockingCounters::bump(&self.counters.rebiased_lock_entry_count);
                    return Condition::BiasRevokedAndRebiased;
                }
            }
        }
        Condition::BiasRevoked
    }

    fn revoke_bias_at_safepoint(
        &self,
        scope: &SafepointScope<'_>,
        obj: &ObjectRef,
        allow_rebias: bool,
    ) -> Condition {
        let mark = obj.mark();
        if !mark.has_bias_pattern() {
            return Condition::NotBiased;
        }
        match mark.biased_locker().and_then(|id| scope.thread(id)) {
            Some(biaser) => walk_stack_and_revoke(obj, allow_rebias, biaser),
            None => revoke_unheld(obj, mark, allow_rebias),
        }
    }

    /// Revoke every listed object without rebiasing, stopping the world at
    /// most once. On return none of `objs` is biased.
    pub fn revoke(&self, thread: &VmThread, objs: &[ObjectRef]) {
        thread.poll();
        let mut remaining = Vec::new();
        for obj in objs {
            loop {
                let mark = obj.mark();
                if !mark.has_bias_pattern() {
                    break;
                }
                let ty = obj.type_descriptor();
                let prototype = ty.prototype_header();
                let unheld = mark.is_biased_anonymously()
                    || !prototype.has_bias_pattern()
                    || mark.bias_epoch() != prototype.bias_epoch()
                    || mark
                        .biased_locker()
                        .is_some_and(|id| self.threads.get(id).is_none());
                if unheld {
                    if revoke_unheld(obj, mark, false) == Condition::BiasRevoked {
                        break;
                    }
                    continue;
                }
                if mark.biased_locker() == Some(thread.id()) {
                    if walk_stack_and_revoke(obj, false, thread) == Condition::BiasRevoked {
                        break;
                    }
                    continue;
                }
                remaining.push(obj.clone());
                break;
            }
        }
        if remaining.is_empty() {
            return;
        }
        Safepoint::run(&self.threads, Some(thread), |scope| {
            for obj in &remaining {
                self.revoke_at_safepoint(scope, obj);
            }
        });
    }

    /// Batch form of [`RevocationController::revoke_at_safepoint`]
    pub fn revoke_all_at_safepoint(&self, scope: &SafepointScope<'_>, objs: &[ObjectRef]) {
        for obj in objs {
            self.revoke_at_safepoint(scope, obj);
        }
    }

    /// Save the lock words of biased objects held on any thread's stack.
    ///
    /// Must be paired with exactly one [`restore_marks`](Self::restore_marks).
    pub fn preserve_marks(&self, scope: &SafepointScope<'_>) -> usize {
        let mut preserved = self.preserved.lock();
        if preserved.is_some() {
            crate::sync_fatal!("preserve_marks called twice without restore_marks");
        }
        let mut marks: Vec<(ObjectRef, MarkWord)> = Vec::new();
        for t in scope.threads() {
            for (_, record) in t.lock_stack().iter() {
                let mark = record.object.mark();
                if mark.has_bias_pattern() && !marks.iter().any(|(o, _)| *o == record.object) {
                    marks.push((record.object.clone(), mark));
                }
            }
        }
        let count = marks.len();
        *preserved = Some(marks);
        tracing::debug!(target: "otter_vm_sync", count, "preserved biased marks");
        count
    }

    /// Put back the lock words saved by [`preserve_marks`](Self::preserve_marks)
    pub fn restore_marks(&self, _scope: &SafepointScope<'_>) -> usize {
        let Some(marks) = self.preserved.lock().take() else {
            crate::sync_fatal!("restore_marks called without preserve_marks");
        };
        for (obj, mark) in &marks {
            obj.header().store(*mark);
        }
        marks.len()
    }

    /// Reset `obj`'s lock word to its type prototype, as a collector does
    /// for objects whose word did not need preserving.
    ///
    /// A word carrying an identity hash, a lock record or a monitor is left
    /// alone and `false` is returned.
    pub fn reinit_mark(&self, obj: &ObjectRef) -> bool {
        let mark = obj.mark();
        if mark.must_be_preserved() {
            tracing::trace!(target: "otter_vm_sync", object = %obj, ?mark, "lock word kept on reinit");
            return false;
        }
        obj.header().store(obj.type_descriptor().prototype_header());
        true
    }
}

impl RevocationController for BiasedLocking {
    fn enabled(&self) -> bool {
        BiasedLocking::enabled(self)
    }

    fn try_enter(&self, thread: &VmThread, obj: &ObjectRef) -> bool {
        BiasedLockingCounters::bump(&self.counters.total_entry_count);
        if !obj.mark().has_bias_pattern() {
            return false;
        }
        self.revoke_and_rebias_impl(thread, obj, true) == Condition::BiasRevokedAndRebiased
    }

    fn revoke_and_rebias(
        &self,
        thread: &VmThread,
        obj: &ObjectRef,
        attempt_rebias: bool,
    ) -> Condition {
        self.revoke_and_rebias_impl(thread, obj, attempt_rebias)
    }

    fn revoke_at_safepoint(&self, scope: &SafepointScope<'_>, obj: &ObjectRef) {
        match self.update_heuristics(obj) {
            HeuristicsResult::NotBiased => {}
            HeuristicsResult::SingleRevoke => {
                self.revoke_bias_at_safepoint(scope, obj, false);
            }
            HeuristicsResult::BulkRebias => {
                self.bulk_revoke_or_rebias_at_safepoint(scope, obj, true, false, None);
            }
            HeuristicsResult::BulkRevoke => {
                self.bulk_revoke_or_rebias_at_safepoint(scope, obj, false, false, None);
            }
        }
    }

    fn record_fast_path_entry(&self) {
        BiasedLockingCounters::bump(&self.counters.fast_path_entry_count);
    }
}

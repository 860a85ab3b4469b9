//! Idle monitor deflation and monitor-held object visiting.
//!
//! Runs at a safepoint. A monitor that is neither owned, contended nor
//! waited on gives its displaced header back to the object and returns to
//! the global free list; busy monitors stay where they are.

use crate::mark_word::{MarkWord, MonitorId};
use crate::object::ObjectRef;
use crate::safepoint::SafepointScope;
use crate::synchronizer::ObjectSynchronizer;
use crate::thread::VmThread;
use std::time::{Duration, Instant};

/// Counters for one deflation cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeflateMonitorCounters {
    /// Monitors left bound to objects
    pub n_in_use: usize,
    /// Monitors in the arena
    pub n_in_circulation: usize,
    /// Monitors deflated from every list
    pub n_scavenged: usize,
    /// Monitors deflated from per-thread lists
    pub per_thread_scavenged: usize,
    /// Time spent on per-thread lists
    pub per_thread_times: Duration,
}

/// Visitor over object references held by monitors, as a collector walks roots
pub trait OopVisitor {
    /// Visit one reference; the visitor may replace it
    fn do_oop(&mut self, obj: &mut ObjectRef);
}

impl<F: FnMut(&mut ObjectRef)> OopVisitor for F {
    fn do_oop(&mut self, obj: &mut ObjectRef) {
        self(obj)
    }
}

impl ObjectSynchronizer {
    /// In-use monitors exceed the configured share of the arena
    pub fn is_cleanup_needed(&self) -> bool {
        let population = self.pool().population();
        if population == 0 {
            return false;
        }
        let per_thread: usize = self
            .threads()
            .snapshot()
            .iter()
            .map(|t| t.monitors.lock().in_use_count)
            .sum();
        let in_use = self.pool().global_in_use_count() + per_thread;
        in_use * 100 / population > self.deflation_threshold as usize
    }

    /// Reset `counters` for a new cycle
    pub fn prepare_deflate_idle_monitors(&self, counters: &mut DeflateMonitorCounters) {
        *counters = DeflateMonitorCounters::default();
    }

    /// Deflate one monitor if it is idle. Returns whether it was deflated.
    pub fn deflate_monitor(&self, _scope: &SafepointScope<'_>, id: MonitorId) -> bool {
        let monitor = self.pool().get(id);
        if monitor.is_busy() {
            return false;
        }
        let Some(obj) = monitor.object() else {
            crate::sync_fatal!("{id} is on an in-use list but serves no object");
        };
        let header = monitor.header();
        if !header.is_neutral() {
            crate::sync_fatal!("{obj}: displaced header {header:?} of {id} is not neutral");
        }
        if let Err(observed) = obj.header().compare_exchange(MarkWord::inflated(id), header) {
            crate::sync_fatal!("{obj}: lock word {observed:?} does not point at {id}");
        }
        monitor.recycle();
        tracing::trace!(target: "otter_vm_sync", object = %obj, monitor = %id, "deflated");
        true
    }

    /// Deflate idle monitors on the list at `head`, moving them to `freed`.
    ///
    /// Returns the new head and the number of monitors kept.
    fn deflate_monitor_list(
        &self,
        scope: &SafepointScope<'_>,
        head: u32,
        freed: &mut Vec<MonitorId>,
    ) -> (u32, usize) {
        let (new_head, kept, removed) = self
            .pool()
            .retain_list(head, |id| !self.deflate_monitor(scope, id));
        freed.extend(removed);
        (new_head, kept)
    }

    /// Deflate every idle monitor on the global in-use list and on every
    /// thread's in-use list
    pub fn deflate_idle_monitors(
        &self,
        scope: &SafepointScope<'_>,
        counters: &mut DeflateMonitorCounters,
    ) {
        let mut freed = Vec::new();
        let pool = self.pool();
        let head = pool.global_in_use_head();
        let (new_head, kept) = self.deflate_monitor_list(scope, head, &mut freed);
        pool.set_global_in_use(new_head, kept);
        counters.n_in_use += kept;
        counters.n_scavenged += freed.len();
        pool.release_to_global(&freed);

        for thread in scope.threads() {
            self.deflate_thread_local_monitors(scope, thread, counters);
        }
        counters.n_in_circulation = pool.population();
    }

    /// Deflate the idle monitors on `thread`'s in-use list
    pub fn deflate_thread_local_monitors(
        &self,
        scope: &SafepointScope<'_>,
        thread: &VmThread,
        counters: &mut DeflateMonitorCounters,
    ) {
        let begin = Instant::now();
        let mut freed = Vec::new();
        {
            let mut lists = thread.monitors.lock();
            if lists.in_use_head == 0 {
                return;
            }
            let (new_head, kept) = self.deflate_monitor_list(scope, lists.in_use_head, &mut freed);
            lists.in_use_head = new_head;
            lists.in_use_count = kept;
            counters.n_in_use += kept;
        }
        counters.n_scavenged += freed.len();
        counters.per_thread_scavenged += freed.len();
        self.pool().release_to_global(&freed);
        counters.per_thread_times += begin.elapsed();
    }

    /// Log and record the outcome of a cycle
    pub fn finish_deflate_idle_monitors(&self, counters: &DeflateMonitorCounters) {
        tracing::info!(
            target: "otter_vm_sync",
            scavenged = counters.n_scavenged,
            per_thread_scavenged = counters.per_thread_scavenged,
            in_use = counters.n_in_use,
            in_circulation = counters.n_in_circulation,
            global_free = self.pool().global_free_count(),
            per_thread_us = counters.per_thread_times.as_micros() as u64,
            "deflated idle monitors"
        );
        *self.last_deflation.lock() = Some(*counters);
    }

    /// Counters of the most recent finished cycle
    pub fn last_deflation(&self) -> Option<DeflateMonitorCounters> {
        *self.last_deflation.lock()
    }

    /// Visit the object of every in-use monitor
    pub fn oops_do(&self, scope: &SafepointScope<'_>, visitor: &mut dyn OopVisitor) {
        for id in self.pool().global_in_use_list() {
            self.visit_monitor(id, visitor);
        }
        for thread in scope.threads() {
            self.thread_local_used_oops_do(thread, visitor);
        }
    }

    /// Visit the objects of `thread`'s in-use monitors
    pub fn thread_local_used_oops_do(&self, thread: &VmThread, visitor: &mut dyn OopVisitor) {
        let head = thread.monitors.lock().in_use_head;
        for id in self.pool().collect_list(head) {
            self.visit_monitor(id, visitor);
        }
    }

    fn visit_monitor(&self, id: MonitorId, visitor: &mut dyn OopVisitor) {
        self.pool().get(id).with_object_mut(|obj| {
            if let Some(obj) = obj {
                visitor.do_oop(obj);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::monitor::InflateCause;
    use crate::runtime::SyncRuntime;
    use crate::safepoint::Safepoint;

    #[test]
    fn test_idle_monitor_deflates_to_original_word() {
        let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
        let t = rt.attach_thread("t");
        let obj = rt.new_object("Point");
        let sync = rt.synchronizer();
        let hash = sync.identity_hash_value_for(&t, &obj);
        let id = sync.inflate(&t, &obj, InflateCause::VmInternal).id();

        let counters = t.blocking(|| {
            Safepoint::run(rt.threads(), None, |scope| {
                let mut counters = DeflateMonitorCounters::default();
                sync.prepare_deflate_idle_monitors(&mut counters);
                sync.deflate_idle_monitors(scope, &mut counters);
                sync.finish_deflate_idle_monitors(&counters);
                counters
            })
        });
        assert_eq!(counters.n_scavenged, 1);
        assert_eq!(counters.per_thread_scavenged, 1);
        assert!(obj.mark().is_neutral());
        assert_eq!(obj.mark().hash(), Some(hash));
        assert!(sync.pool().get(id).object().is_none());
        assert_eq!(sync.last_deflation(), Some(counters));
    }

    #[test]
    fn test_owned_monitor_is_kept() {
        let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
        let t = rt.attach_thread("t");
        let obj = rt.new_object("Point");
        let sync = rt.synchronizer();
        sync.jni_enter(&t, &obj);

        let counters = t.blocking(|| {
            Safepoint::run(rt.threads(), None, |scope| {
                let mut counters = DeflateMonitorCounters::default();
                sync.deflate_idle_monitors(scope, &mut counters);
                counters
            })
        });
        assert_eq!(counters.n_scavenged, 0);
        assert_eq!(counters.n_in_use, 1);
        assert!(obj.mark().has_monitor());
        sync.jni_exit(&t, &obj).unwrap();
    }

    #[test]
    fn test_oops_do_visits_monitor_objects() {
        let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
        let t = rt.attach_thread("t");
        let a = rt.new_object("Point");
        let b = rt.new_object("Point");
        let sync = rt.synchronizer();
        sync.inflate(&t, &a, InflateCause::VmInternal);
        sync.inflate(&t, &b, InflateCause::VmInternal);

        let mut seen = Vec::new();
        t.blocking(|| {
            Safepoint::run(rt.threads(), None, |scope| {
                let mut visitor = |obj: &mut ObjectRef| seen.push(obj.clone());
                sync.oops_do(scope, &mut visitor);
            })
        });
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&a) && seen.contains(&b));
    }
}

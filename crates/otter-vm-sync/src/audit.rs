//! Monitor list audit
//!
//! Cross-checks every monitor list against its recorded count and every
//! entry against the state its list implies. Runs at a safepoint.

use crate::mark_word::{MarkWord, MonitorId};
use crate::monitor::ObjectMonitor;
use crate::safepoint::SafepointScope;
use crate::synchronizer::ObjectSynchronizer;
use crate::thread::VmThread;
use std::fmt;

/// Result of [`ObjectSynchronizer::audit_and_print_stats`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditReport {
    /// Monitors in the arena
    pub population: usize,
    /// Global free list length
    pub global_free: usize,
    /// Global in-use list length
    pub global_in_use: usize,
    /// Sum of per-thread free list lengths
    pub per_thread_free: usize,
    /// Sum of per-thread in-use list lengths
    pub per_thread_in_use: usize,
    /// Problems found
    pub errors: Vec<String>,
}

impl AuditReport {
    /// No problems found
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: String) {
        tracing::error!(target: "otter_vm_sync", "{msg}");
        self.errors.push(msg);
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>10}  {:>10}  {:>10}  {:>10}  {:>10}", "pop", "g_free", "g_in_use", "t_free", "t_in_use")?;
        write!(
            f,
            "{:>10}  {:>10}  {:>10}  {:>10}  {:>10}",
            self.population, self.global_free, self.global_in_use, self.per_thread_free, self.per_thread_in_use
        )?;
        for e in &self.errors {
            write!(f, "\nERROR: {e}")?;
        }
        Ok(())
    }
}

impl ObjectSynchronizer {
    /// Audit every list. `on_exit` logs the summary at info level instead of debug.
    pub fn audit_and_print_stats(&self, scope: &SafepointScope<'_>, on_exit: bool) -> AuditReport {
        let mut report = AuditReport {
            population: self.pool().population(),
            ..Default::default()
        };
        self.chk_global_free_list_and_count(&mut report);
        self.chk_global_in_use_list_and_count(&mut report);
        for thread in scope.threads() {
            self.chk_per_thread_free_list_and_count(thread, &mut report);
            self.chk_per_thread_in_use_list_and_count(thread, &mut report);
        }
        let listed = report.global_free + report.global_in_use + report.per_thread_free + report.per_thread_in_use;
        if listed != report.population {
            report.error(format!(
                "population {} but {listed} monitors are on lists",
                report.population
            ));
        }
        if on_exit {
            tracing::info!(target: "otter_vm_sync", "monitor lists:\n{report}");
        } else {
            self.log_monitor_list_counts(&report);
        }
        report
    }

    /// Log list lengths at debug level
    pub fn log_monitor_list_counts(&self, report: &AuditReport) {
        tracing::debug!(
            target: "otter_vm_sync",
            population = report.population,
            global_free = report.global_free,
            global_in_use = report.global_in_use,
            per_thread_free = report.per_thread_free,
            per_thread_in_use = report.per_thread_in_use,
            errors = report.errors.len(),
            "monitor list counts"
        );
    }

    /// `id` names an allocated arena slot
    pub fn verify_monitor_in_pool(&self, id: MonitorId) -> bool {
        self.pool().contains(id)
    }

    /// A free monitor serves nothing and holds nothing
    pub fn chk_free_entry(&self, thread: Option<&VmThread>, m: &ObjectMonitor, report: &mut AuditReport) {
        let list = thread.map_or_else(|| "global free list".to_string(), |t| format!("{} free list", t.id()));
        if m.header().raw() != 0 {
            report.error(format!("{} on {list} has header {:?}", m.id(), m.header()));
        }
        if m.object().is_some() {
            report.error(format!("{} on {list} still serves an object", m.id()));
        }
        if m.owner().is_some() {
            report.error(format!("{} on {list} is owned", m.id()));
        }
        if m.contentions() != 0 || m.waiting() != 0 {
            report.error(format!("{} on {list} has waiters", m.id()));
        }
    }

    /// An in-use monitor serves an object whose lock word points back at it
    pub fn chk_in_use_entry(&self, thread: Option<&VmThread>, m: &ObjectMonitor, report: &mut AuditReport) {
        let list = thread.map_or_else(|| "global in-use list".to_string(), |t| format!("{} in-use list", t.id()));
        let Some(obj) = m.object() else {
            report.error(format!("{} on {list} serves no object", m.id()));
            return;
        };
        if !m.header().is_neutral() {
            report.error(format!("{} on {list} has non-neutral header {:?}", m.id(), m.header()));
        }
        let mark = obj.mark();
        if mark != MarkWord::inflated(m.id()) {
            report.error(format!("{obj}: lock word {mark:?} does not point at {} on {list}", m.id()));
        }
    }

    fn chk_global_free_list_and_count(&self, report: &mut AuditReport) {
        let ids = self.pool().global_free_list();
        for &id in &ids {
            self.chk_free_entry(None, self.pool().get(id), report);
        }
        report.global_free = ids.len();
        let recorded = self.pool().global_free_count();
        if recorded != ids.len() {
            report.error(format!("global free count {recorded} but {} listed", ids.len()));
        }
    }

    fn chk_global_in_use_list_and_count(&self, report: &mut AuditReport) {
        let ids = self.pool().global_in_use_list();
        for &id in &ids {
            self.chk_in_use_entry(None, self.pool().get(id), report);
        }
        report.global_in_use = ids.len();
        let recorded = self.pool().global_in_use_count();
        if recorded != ids.len() {
            report.error(format!("global in-use count {recorded} but {} listed", ids.len()));
        }
    }

    fn chk_per_thread_free_list_and_count(&self, thread: &VmThread, report: &mut AuditReport) {
        let (head, recorded) = {
            let lists = thread.monitors.lock();
            (lists.free_head, lists.free_count)
        };
        let ids = self.pool().collect_list(head);
        for &id in &ids {
            self.chk_free_entry(Some(thread), self.pool().get(id), report);
        }
        report.per_thread_free += ids.len();
        if recorded != ids.len() {
            report.error(format!("{} free count {recorded} but {} listed", thread.id(), ids.len()));
        }
    }

    fn chk_per_thread_in_use_list_and_count(&self, thread: &VmThread, report: &mut AuditReport) {
        let (head, recorded) = {
            let lists = thread.monitors.lock();
            (lists.in_use_head, lists.in_use_count)
        };
        let ids = self.pool().collect_list(head);
        for &id in &ids {
            self.chk_in_use_entry(Some(thread), self.pool().get(id), report);
        }
        report.per_thread_in_use += ids.len();
        if recorded != ids.len() {
            report.error(format!("{} in-use count {recorded} but {} listed", thread.id(), ids.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::monitor::InflateCause;
    use crate::runtime::SyncRuntime;

    #[test]
    fn test_fresh_runtime_audits_clean() {
        let rt = SyncRuntime::new(SyncConfig::default());
        let report = rt.audit(None, false);
        assert!(report.is_clean(), "{report}");
        assert_eq!(report.population, 0);
    }

    #[test]
    fn test_audit_counts_inflated_monitor() {
        let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
        let t = rt.attach_thread("t");
        let obj = rt.new_object("Point");
        let id = rt.synchronizer().inflate(&t, &obj, InflateCause::VmInternal).id();
        assert!(rt.synchronizer().verify_monitor_in_pool(id));

        let report = rt.audit(Some(&*t), true);
        assert!(report.is_clean(), "{report}");
        assert_eq!(report.per_thread_in_use, 1);
        assert_eq!(
            report.global_free + report.per_thread_free + 1,
            report.population
        );
    }
}

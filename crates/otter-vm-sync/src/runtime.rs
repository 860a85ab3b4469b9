//! Process-wide locking runtime
//!
//! Owns the thread and type registries, the monitor pool, the biased
//! locking controller and the synchronizer, and hands out attached threads.

use crate::audit::AuditReport;
use crate::biased::{BiasedLocking, RevocationController};
use crate::config::SyncConfig;
use crate::deflation::DeflateMonitorCounters;
use crate::error::ConfigError;
use crate::mark_word::ThreadId;
use crate::monitor_pool::MonitorPool;
use crate::object::{ObjectRef, TypeRegistry};
use crate::safepoint::Safepoint;
use crate::synchronizer::ObjectSynchronizer;
use crate::thread::{ThreadRegistry, VmThread};
use std::ops::Deref;
use std::sync::Arc;

/// Root of the locking subsystem
pub struct SyncRuntime {
    config: SyncConfig,
    threads: Arc<ThreadRegistry>,
    types: Arc<TypeRegistry>,
    pool: Arc<MonitorPool>,
    bias: Arc<BiasedLocking>,
    synchronizer: ObjectSynchronizer,
}

impl SyncRuntime {
    /// Build a runtime.
    ///
    /// # Panics
    ///
    /// Panics if `config` fails [`SyncConfig::validate`].
    pub fn new(config: SyncConfig) -> Arc<Self> {
        match Self::try_new(config) {
            Ok(rt) => rt,
            Err(err) => crate::sync_fatal!("invalid configuration: {err}"),
        }
    }

    /// Build a runtime, rejecting an invalid configuration
    pub fn try_new(config: SyncConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let threads = Arc::new(ThreadRegistry::new());
        // Types are biasable from birth only when biasing is on immediately
        let types = Arc::new(TypeRegistry::new(false));
        let pool = Arc::new(MonitorPool::new(config.max_monitor_blocks, config.om_free_provision));
        let bias = Arc::new(BiasedLocking::new(&config, threads.clone(), types.clone()));
        let controller: Arc<dyn RevocationController> = bias.clone();
        let synchronizer = ObjectSynchronizer::new(
            pool.clone(),
            threads.clone(),
            controller,
            config.use_biased_locking,
            config.monitor_used_deflation_threshold,
        );
        bias.init();
        tracing::debug!(target: "otter_vm_sync", ?config, "sync runtime created");
        Ok(Arc::new(Self {
            config,
            threads,
            types,
            pool,
            bias,
            synchronizer,
        }))
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Enter/exit/wait/notify/hash
    pub fn synchronizer(&self) -> &ObjectSynchronizer {
        &self.synchronizer
    }

    /// Attached threads and the safepoint coordinator
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    /// Registered types
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Monitor storage
    pub fn pool(&self) -> &Arc<MonitorPool> {
        &self.pool
    }

    /// Biased locking controller
    pub fn biased_locking(&self) -> &Arc<BiasedLocking> {
        &self.bias
    }

    /// Allocate an object of the named type, registering the type on first use
    pub fn new_object(&self, type_name: &str) -> ObjectRef {
        ObjectRef::new(&self.types.register(type_name))
    }

    /// Attach the calling OS thread; dropping the guard detaches it
    pub fn attach_thread(self: &Arc<Self>, name: &str) -> AttachedThread {
        AttachedThread {
            runtime: self.clone(),
            thread: self.threads.attach(name),
        }
    }

    /// Interrupt an attached thread by id
    pub fn interrupt(&self, id: ThreadId) -> bool {
        match self.threads.get(id) {
            Some(thread) => {
                thread.interrupt();
                true
            }
            None => false,
        }
    }

    /// Run one deflation cycle at a safepoint
    pub fn deflate_idle_monitors(&self, requester: Option<&VmThread>) -> DeflateMonitorCounters {
        let sync = &self.synchronizer;
        Safepoint::run(&self.threads, requester, |scope| {
            let mut counters = DeflateMonitorCounters::default();
            sync.prepare_deflate_idle_monitors(&mut counters);
            sync.deflate_idle_monitors(scope, &mut counters);
            sync.finish_deflate_idle_monitors(&counters);
            counters
        })
    }

    /// Audit the monitor lists at a safepoint
    pub fn audit(&self, requester: Option<&VmThread>, on_exit: bool) -> AuditReport {
        Safepoint::run(&self.threads, requester, |scope| {
            self.synchronizer.audit_and_print_stats(scope, on_exit)
        })
    }

    fn detach(&self, thread: &VmThread) {
        let unwound = self.synchronizer.unwind_thread(thread);
        let released = self.synchronizer.release_monitors_owned_by_thread(thread);
        self.pool.om_flush(thread);
        self.threads.remove(thread);
        if unwound > 0 || released > 0 {
            tracing::debug!(
                target: "otter_vm_sync",
                thread = %thread.id(),
                unwound,
                released,
                "detached while holding locks"
            );
        }
    }
}

/// An attached thread; detaches on drop
pub struct AttachedThread {
    runtime: Arc<SyncRuntime>,
    thread: Arc<VmThread>,
}

impl AttachedThread {
    /// Shared handle, for other threads to interrupt or inspect
    pub fn handle(&self) -> &Arc<VmThread> {
        &self.thread
    }
}

impl Deref for AttachedThread {
    type Target = VmThread;

    fn deref(&self) -> &VmThread {
        &self.thread
    }
}

impl Drop for AttachedThread {
    fn drop(&mut self) {
        self.runtime.detach(&self.thread);
    }
}

//! Scoped locking for runtime-internal code

use crate::error::SyncResult;
use crate::object::ObjectRef;
use crate::synchronizer::ObjectSynchronizer;
use crate::thread::VmThread;

/// Holds `obj` locked for its lifetime.
///
/// With `do_lock == false` the guard is inert: nothing is entered and the
/// drop does nothing, so call sites can lock conditionally.
pub struct ObjectLocker<'a> {
    sync: &'a ObjectSynchronizer,
    thread: &'a VmThread,
    obj: ObjectRef,
    do_lock: bool,
}

impl<'a> ObjectLocker<'a> {
    /// Lock `obj` when `do_lock` is set
    pub fn new(sync: &'a ObjectSynchronizer, thread: &'a VmThread, obj: &ObjectRef, do_lock: bool) -> Self {
        if do_lock {
            sync.enter(thread, obj);
        }
        Self {
            sync,
            thread,
            obj: obj.clone(),
            do_lock,
        }
    }

    /// Locked object
    pub fn object(&self) -> &ObjectRef {
        &self.obj
    }

    /// Wait until notified or interrupted
    pub fn wait(&self) -> SyncResult<()> {
        self.sync.wait(self.thread, &self.obj, 0)
    }

    /// Wait until notified, ignoring interrupts
    pub fn wait_uninterruptibly(&self) -> SyncResult<()> {
        self.sync.wait_uninterruptibly(self.thread, &self.obj, 0)
    }

    /// Wake one waiter
    pub fn notify(&self) -> SyncResult<()> {
        self.sync.notify(self.thread, &self.obj)
    }

    /// Wake every waiter
    pub fn notify_all(&self) -> SyncResult<()> {
        self.sync.notify_all(self.thread, &self.obj)
    }

    /// Release every level held on the object; pair with [`reenter`](Self::reenter)
    pub fn complete_exit(&self) -> SyncResult<u32> {
        self.sync.complete_exit(self.thread, &self.obj)
    }

    /// Reacquire with the count returned by [`complete_exit`](Self::complete_exit)
    pub fn reenter(&self, recursions: u32) {
        self.sync.reenter(self.thread, &self.obj, recursions);
    }
}

impl Drop for ObjectLocker<'_> {
    fn drop(&mut self) {
        if !self.do_lock {
            return;
        }
        if let Err(err) = self.sync.exit(self.thread, &self.obj) {
            tracing::warn!(target: "otter_vm_sync", object = %self.obj, %err, "scoped unlock failed");
        }
    }
}

//! Attached VM threads
//!
//! Each attached thread owns a lock stack (its lock records), two intrusive
//! monitor lists, an interrupt flag and a park event. The safepoint fields
//! are driven by [`crate::safepoint`].

use crate::mark_word::ThreadId;
use crate::monitor_pool::LocalMonitorLists;
use crate::object::ObjectRef;
use crate::safepoint::{HandshakeOp, SafepointSync};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// What a lock record remembers about the lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplacedHeader {
    /// Outermost lightweight lock: the word the object had before locking
    Displaced(crate::mark_word::MarkWord),
    /// Nested lightweight lock by the same thread
    Recursive,
    /// Biased or heavyweight lock; the record carries no header
    Unused,
}

/// One lock nesting level
#[derive(Debug, Clone)]
pub struct LockRecord {
    /// Locked object
    pub object: ObjectRef,
    /// Header state
    pub displaced: DisplacedHeader,
}

/// A thread's lock records, addressed by stable slot index.
///
/// Removing a record leaves a hole, so a lightweight lock word keeps pointing
/// at the right slot even when locks are released out of order. Trailing
/// holes are trimmed.
#[derive(Debug, Default)]
pub struct LockStack {
    records: Vec<Option<LockRecord>>,
}

impl LockStack {
    /// Push a record, returning its slot
    pub fn push(&mut self, record: LockRecord) -> u32 {
        self.records.push(Some(record));
        (self.records.len() - 1) as u32
    }

    /// Drop the record at `slot`
    pub fn remove(&mut self, slot: u32) -> Option<LockRecord> {
        let record = self.records.get_mut(slot as usize)?.take();
        while matches!(self.records.last(), Some(None)) {
            self.records.pop();
        }
        record
    }

    /// Record at `slot`
    pub fn get(&self, slot: u32) -> Option<&LockRecord> {
        self.records.get(slot as usize)?.as_ref()
    }

    /// Mutable record at `slot`
    pub fn get_mut(&mut self, slot: u32) -> Option<&mut LockRecord> {
        self.records.get_mut(slot as usize)?.as_mut()
    }

    /// Newest record for `obj`
    pub fn latest_for(&self, obj: &ObjectRef) -> Option<u32> {
        self.iter().find(|(_, r)| r.object == *obj).map(|(slot, _)| slot)
    }

    /// Number of records for `obj`
    pub fn count_for(&self, obj: &ObjectRef) -> usize {
        self.iter().filter(|(_, r)| r.object == *obj).count()
    }

    /// Live records, newest first
    pub fn iter(&self) -> impl Iterator<Item = (u32, &LockRecord)> {
        self.records
            .iter()
            .enumerate()
            .rev()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i as u32, r)))
    }

    /// Live records, newest first
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut LockRecord)> {
        self.records
            .iter_mut()
            .enumerate()
            .rev()
            .filter_map(|(i, r)| r.as_mut().map(|r| (i as u32, r)))
    }

    /// Number of live records
    pub fn depth(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    /// No live records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Binary-permit parker
#[derive(Debug, Default)]
pub struct ParkEvent {
    permit: Mutex<bool>,
    condvar: Condvar,
}

impl ParkEvent {
    /// Block until unparked or `deadline` passes, consuming the permit
    pub fn park(&self, deadline: Option<Instant>) {
        let mut permit = self.permit.lock();
        while !*permit {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut permit, deadline).timed_out() {
                        break;
                    }
                }
                None => self.condvar.wait(&mut permit),
            }
        }
        *permit = false;
    }

    /// Make the permit available, waking a parked thread
    pub fn unpark(&self) {
        *self.permit.lock() = true;
        self.condvar.notify_one();
    }
}

/// An attached VM thread.
///
/// A `&VmThread` is the cooperative-suspension token every blocking
/// operation takes.
pub struct VmThread {
    id: ThreadId,
    name: String,
    lock_stack: Mutex<LockStack>,
    pub(crate) monitors: Mutex<LocalMonitorLists>,
    interrupted: AtomicBool,
    park: Arc<ParkEvent>,
    hash_state: AtomicU64,
    pub(crate) sync: Arc<SafepointSync>,
    /// In a safe region (blocked, parked or waiting)
    pub(crate) safe: AtomicBool,
    /// Held in its safe region by a handshake running on its behalf
    pub(crate) suspended: AtomicBool,
    /// Detached; no longer takes part in safepoints
    pub(crate) exited: AtomicBool,
    pub(crate) pending: Mutex<VecDeque<HandshakeOp>>,
    pub(crate) poll_requested: AtomicBool,
}

impl VmThread {
    fn new(id: ThreadId, name: String, sync: Arc<SafepointSync>) -> Self {
        Self {
            id,
            name,
            lock_stack: Mutex::new(LockStack::default()),
            monitors: Mutex::new(LocalMonitorLists::default()),
            interrupted: AtomicBool::new(false),
            park: Arc::new(ParkEvent::default()),
            hash_state: AtomicU64::new(0x9E37_79B9_7F4A_7C15 ^ (id.get() as u64).wrapping_mul(0x2545_F491)),
            sync,
            safe: AtomicBool::new(true),
            suspended: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            poll_requested: AtomicBool::new(false),
        }
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock records. Never held across a safe-region transition.
    pub fn lock_stack(&self) -> MutexGuard<'_, LockStack> {
        self.lock_stack.lock()
    }

    /// Number of held lock records
    pub fn lock_depth(&self) -> usize {
        self.lock_stack.lock().depth()
    }

    pub(crate) fn park_event(&self) -> &Arc<ParkEvent> {
        &self.park
    }

    /// Set the interrupt flag and wake the thread if it is waiting
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.park.unpark();
    }

    /// Interrupt flag
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Read and clear the interrupt flag
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Next identity hash candidate (Marsaglia xor-shift)
    pub(crate) fn next_hash(&self) -> u32 {
        let mut x = self.hash_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.hash_state.store(x, Ordering::Relaxed);
        match (x as u32) & crate::mark_word::MarkWord::HASH_MASK {
            0 => 0xBAD,
            h => h,
        }
    }

    /// In a safe region
    pub fn is_safe(&self) -> bool {
        self.safe.load(Ordering::Acquire)
    }

    /// Detached
    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

impl fmt::Debug for VmThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("safe", &self.is_safe())
            .field("exited", &self.is_exited())
            .finish()
    }
}

/// All attached threads plus the safepoint coordinator
pub struct ThreadRegistry {
    threads: RwLock<FxHashMap<ThreadId, Arc<VmThread>>>,
    next_id: AtomicU32,
    pub(crate) sync: Arc<SafepointSync>,
}

impl ThreadRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(FxHashMap::default()),
            next_id: AtomicU32::new(1),
            sync: Arc::new(SafepointSync::new()),
        }
    }

    /// Attach a new thread. Returns once no safepoint is in progress.
    pub fn attach(&self, name: &str) -> Arc<VmThread> {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        let Some(id) = ThreadId::new(raw) else {
            crate::sync_fatal!("thread id space exhausted");
        };
        let thread = Arc::new(VmThread::new(id, name.to_string(), self.sync.clone()));
        {
            // Registered while safe so a safepoint snapshot never waits on it
            let _state = self.sync.state.lock();
            self.threads.write().insert(id, thread.clone());
        }
        self.sync.leave_safe(&thread);
        tracing::debug!(target: "otter_vm_sync", thread = %id, name, "attached");
        thread
    }

    /// Unregister `thread`. Pending handshakes are run first.
    pub(crate) fn remove(&self, thread: &VmThread) {
        self.sync.mark_exited(thread);
        self.threads.write().remove(&thread.id());
        tracing::debug!(target: "otter_vm_sync", thread = %thread.id(), "detached");
    }

    /// Look up a live thread
    pub fn get(&self, id: ThreadId) -> Option<Arc<VmThread>> {
        self.threads.read().get(&id).cloned()
    }

    /// Snapshot of live threads, ordered by id
    pub fn snapshot(&self) -> Vec<Arc<VmThread>> {
        let mut threads: Vec<_> = self.threads.read().values().cloned().collect();
        threads.sort_by_key(|t| t.id());
        threads
    }

    /// Number of live threads
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// No live threads
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

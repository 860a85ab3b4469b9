//! # Otter VM Object Synchronization
//!
//! Per-object locking for the VM: `monitorenter`/`monitorexit`, wait/notify
//! and stable identity hashes.
//!
//! ## Design
//!
//! - **Lock word**: One atomic word per object encodes unlocked, biased,
//!   lightweight-locked, inflating, inflated and GC-marked states
//! - **Biased locking**: An uncontended object is claimed by one thread and
//!   relocked without atomics; other threads revoke via handshake or safepoint
//! - **Lightweight locks**: Lock records on the owner's lock stack, one CAS
//!   per acquire and release
//! - **Monitors**: Block-allocated arena with per-thread free lists, inflated
//!   on contention, wait, or hashing, deflated at safepoints when idle

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod audit;
pub mod biased;
pub mod config;
pub mod deflation;
pub mod error;
pub mod locker;
pub mod mark_word;
pub mod monitor;
pub mod monitor_pool;
pub mod object;
pub mod runtime;
pub mod safepoint;
pub mod synchronizer;
pub mod thread;

pub use audit::AuditReport;
pub use biased::{BiasedLocking, BiasedLockingStats, Condition, HeuristicsResult, RevocationController};
pub use config::{RevocationMode, SyncConfig, MONITOR_BLOCK_SIZE};
pub use deflation::{DeflateMonitorCounters, OopVisitor};
pub use error::{ConfigError, SyncError, SyncResult};
pub use locker::ObjectLocker;
pub use mark_word::{LockRecordRef, LockState, MarkWord, MarkWordCell, MonitorId, ThreadId};
pub use monitor::{InflateCause, ObjectMonitor};
pub use monitor_pool::MonitorPool;
pub use object::{Object, ObjectRef, TypeDescriptor, TypeRegistry};
pub use runtime::{AttachedThread, SyncRuntime};
pub use safepoint::{handshake, Safepoint, SafepointScope, SafepointStats};
pub use synchronizer::{LockOwnership, ObjectSynchronizer};
pub use thread::{DisplacedHeader, LockRecord, ThreadRegistry, VmThread};

//! Object lock word encoding
//!
//! Every object header carries one 64-bit lock word. The low bits select the
//! active variant, the rest is variant-specific payload:
//!
//! ```text
//!  63            32 31             15 14     7 6   3  2  1 0
//! ┌────────────────┬─────────────────┬────────┬─────┬───┬────┐
//! │ hash (31 bits) │        0        │   0    │ age │ 0 │ 01 │  unlocked
//! │ thread id / 0  │        0        │ epoch  │ age │ 1 │ 01 │  biased
//! │ thread id      │  lock record slot (30 bits)          │ 00 │  lightweight
//! │ monitor id     │                 0                    │ 10 │  inflated
//! │            opaque collector payload (62 bits)         │ 11 │  marked
//! └────────────────┴──────────────────────────────────────┴────┘
//! ```
//!
//! A lightweight word with thread id 0 is never a valid lock record address;
//! the all-zero word is reserved as the transient `INFLATING` sentinel.
//!
//! All mutation goes through [`MarkWordCell`], which only offers single-word
//! atomic load/store/compare-and-swap. A failed CAS means the word changed
//! concurrently and the caller must reread and retry or take a slower path.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of an attached VM thread. Never zero, so `0` can mean "no owner".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU32);

impl ThreadId {
    /// Create from a raw id, `None` for zero
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw id
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Stable index of a monitor slot inside the monitor arena. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorId(NonZeroU32);

impl MonitorId {
    /// Create from a raw index, `None` for zero
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw index
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "monitor#{}", self.0)
    }
}

/// Address of a lock record: a slot on one thread's lock stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRecordRef {
    /// Thread whose lock stack holds the record
    pub thread: ThreadId,
    /// Slot index on that stack
    pub slot: u32,
}

/// Decoded view of a lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Unlocked, optionally carrying an identity hash
    Unlocked {
        /// Identity hash, if one was assigned
        hash: Option<u32>,
        /// GC age
        age: u8,
    },
    /// Biased toward `owner`, or anonymously biased when `owner` is `None`
    Biased {
        /// Bias holder
        owner: Option<ThreadId>,
        /// Bias epoch at the time the bias was installed
        epoch: u8,
        /// GC age
        age: u8,
    },
    /// Lightweight-locked; the displaced word lives in the lock record
    LightweightLocked(LockRecordRef),
    /// Another thread is installing a monitor right now
    Inflating,
    /// Inflated to a heavyweight monitor
    Inflated(MonitorId),
    /// Collector-owned (marked or forwarded) word
    Marked(u64),
}

/// One object lock word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MarkWord(u64);

impl MarkWord {
    /// Mask of the two lock bits
    pub const LOCK_MASK: u64 = 0b11;
    /// Mask of lock bits plus the bias bit
    pub const BIASED_LOCK_MASK: u64 = 0b111;
    /// Lightweight-locked lock bits
    pub const LOCKED_VALUE: u64 = 0b00;
    /// Unlocked (or biased) lock bits
    pub const UNLOCKED_VALUE: u64 = 0b01;
    /// Inflated lock bits
    pub const MONITOR_VALUE: u64 = 0b10;
    /// Collector-owned lock bits
    pub const MARKED_VALUE: u64 = 0b11;
    /// Bias pattern in the low three bits
    pub const BIASED_LOCK_PATTERN: u64 = 0b101;

    /// Age field
    pub const AGE_SHIFT: u64 = 3;
    /// Age field mask
    pub const AGE_MASK: u64 = 0xF << Self::AGE_SHIFT;
    /// Largest representable age
    pub const MAX_AGE: u8 = 0xF;

    /// Bias epoch field
    pub const EPOCH_SHIFT: u64 = 7;
    /// Bias epoch field mask
    pub const EPOCH_MASK: u64 = 0xFF << Self::EPOCH_SHIFT;

    /// Lock record slot field (lightweight words only)
    pub const SLOT_SHIFT: u64 = 2;
    /// Lock record slot field mask
    pub const SLOT_MASK: u64 = 0x3FFF_FFFF << Self::SLOT_SHIFT;
    /// Largest encodable lock record slot
    pub const MAX_SLOT: u32 = 0x3FFF_FFFF;

    /// Upper 32 bits: hash, thread id or monitor id
    pub const PAYLOAD_SHIFT: u64 = 32;
    /// Identity hash bits
    pub const HASH_MASK: u32 = 0x7FFF_FFFF;

    /// Transient word installed while a monitor is being attached
    pub const INFLATING: MarkWord = MarkWord(0);

    /// Unlocked, unhashed, age 0
    #[inline]
    pub const fn unlocked() -> Self {
        Self(Self::UNLOCKED_VALUE)
    }

    /// Anonymously biased prototype for a type with the given epoch
    #[inline]
    pub const fn biased_prototype(epoch: u8) -> Self {
        Self(Self::BIASED_LOCK_PATTERN | ((epoch as u64) << Self::EPOCH_SHIFT))
    }

    /// Word biased toward `owner`
    #[inline]
    pub fn biased(owner: ThreadId, epoch: u8, age: u8) -> Self {
        Self(
            Self::BIASED_LOCK_PATTERN
                | ((epoch as u64) << Self::EPOCH_SHIFT)
                | (((age & Self::MAX_AGE) as u64) << Self::AGE_SHIFT)
                | ((owner.get() as u64) << Self::PAYLOAD_SHIFT),
        )
    }

    /// Word pointing at a lock record
    #[inline]
    pub fn lightweight(record: LockRecordRef) -> Self {
        debug_assert!(record.slot <= Self::MAX_SLOT);
        Self(
            Self::LOCKED_VALUE
                | (((record.slot & Self::MAX_SLOT) as u64) << Self::SLOT_SHIFT)
                | ((record.thread.get() as u64) << Self::PAYLOAD_SHIFT),
        )
    }

    /// Word pointing at a monitor
    #[inline]
    pub fn inflated(monitor: MonitorId) -> Self {
        Self(Self::MONITOR_VALUE | ((monitor.get() as u64) << Self::PAYLOAD_SHIFT))
    }

    /// Collector-owned word with an opaque 62-bit payload
    #[inline]
    pub fn marked(payload: u64) -> Self {
        Self(Self::MARKED_VALUE | (payload << 2))
    }

    /// Raw bits
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// From raw bits
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    fn payload(self) -> u32 {
        (self.0 >> Self::PAYLOAD_SHIFT) as u32
    }

    /// Unlocked and not biased
    #[inline]
    pub fn is_neutral(self) -> bool {
        self.0 & Self::BIASED_LOCK_MASK == Self::UNLOCKED_VALUE
    }

    /// Biased, anonymously or toward a thread
    #[inline]
    pub fn has_bias_pattern(self) -> bool {
        self.0 & Self::BIASED_LOCK_MASK == Self::BIASED_LOCK_PATTERN
    }

    /// Biased with no owner
    #[inline]
    pub fn is_biased_anonymously(self) -> bool {
        self.has_bias_pattern() && self.payload() == 0
    }

    /// Bias holder, `None` when anonymous or not biased
    #[inline]
    pub fn biased_locker(self) -> Option<ThreadId> {
        if self.has_bias_pattern() {
            ThreadId::new(self.payload())
        } else {
            None
        }
    }

    /// Bias epoch (meaningful for biased words and prototypes)
    #[inline]
    pub fn bias_epoch(self) -> u8 {
        ((self.0 & Self::EPOCH_MASK) >> Self::EPOCH_SHIFT) as u8
    }

    /// Same word with the bias epoch replaced
    #[inline]
    pub fn with_bias_epoch(self, epoch: u8) -> Self {
        debug_assert!(self.has_bias_pattern());
        Self((self.0 & !Self::EPOCH_MASK) | ((epoch as u64) << Self::EPOCH_SHIFT))
    }

    /// Same word with the bias epoch advanced by one (wrapping)
    #[inline]
    pub fn incr_bias_epoch(self) -> Self {
        self.with_bias_epoch(self.bias_epoch().wrapping_add(1))
    }

    /// GC age (unlocked and biased words)
    #[inline]
    pub fn age(self) -> u8 {
        ((self.0 & Self::AGE_MASK) >> Self::AGE_SHIFT) as u8
    }

    /// Same word with the age replaced
    #[inline]
    pub fn with_age(self, age: u8) -> Self {
        debug_assert!(self.is_neutral() || self.has_bias_pattern());
        Self((self.0 & !Self::AGE_MASK) | (((age & Self::MAX_AGE) as u64) << Self::AGE_SHIFT))
    }

    /// Identity hash stored in an unlocked word
    #[inline]
    pub fn hash(self) -> Option<u32> {
        if !self.is_neutral() {
            return None;
        }
        match self.payload() & Self::HASH_MASK {
            0 => None,
            h => Some(h),
        }
    }

    /// Same unlocked word carrying `hash`
    #[inline]
    pub fn with_hash(self, hash: u32) -> Self {
        debug_assert!(self.is_neutral());
        debug_assert!(hash != 0 && hash & !Self::HASH_MASK == 0);
        Self((self.0 & 0xFFFF_FFFF) | (((hash & Self::HASH_MASK) as u64) << Self::PAYLOAD_SHIFT))
    }

    /// Unlocked word with this word's age, bias and hash dropped
    #[inline]
    pub fn unbiased(self) -> Self {
        Self::unlocked().with_age(self.age())
    }

    /// The transient inflation sentinel
    #[inline]
    pub fn is_inflating(self) -> bool {
        self.0 == Self::INFLATING.0
    }

    /// Lightweight-locked (excludes the sentinel)
    #[inline]
    pub fn has_locker(self) -> bool {
        self.0 & Self::LOCK_MASK == Self::LOCKED_VALUE && !self.is_inflating()
    }

    /// Lock record this word points at
    #[inline]
    pub fn locker(self) -> Option<LockRecordRef> {
        if !self.has_locker() {
            return None;
        }
        Some(LockRecordRef {
            thread: ThreadId::new(self.payload())?,
            slot: ((self.0 & Self::SLOT_MASK) >> Self::SLOT_SHIFT) as u32,
        })
    }

    /// Inflated
    #[inline]
    pub fn has_monitor(self) -> bool {
        self.0 & Self::LOCK_MASK == Self::MONITOR_VALUE
    }

    /// Monitor this word points at
    #[inline]
    pub fn monitor(self) -> Option<MonitorId> {
        if self.has_monitor() {
            MonitorId::new(self.payload())
        } else {
            None
        }
    }

    /// Collector-owned
    #[inline]
    pub fn is_marked(self) -> bool {
        self.0 & Self::LOCK_MASK == Self::MARKED_VALUE
    }

    /// Holds state the type prototype cannot rebuild: an identity hash, a
    /// lock record, a monitor or the inflation sentinel. Collector-owned
    /// words do not count; the collector preserves what it overwrites.
    #[inline]
    pub fn must_be_preserved(self) -> bool {
        if self.has_bias_pattern() || self.is_marked() {
            return false;
        }
        !(self.is_neutral() && self.hash().is_none())
    }

    /// Decode into a [`LockState`]
    pub fn decode(self) -> LockState {
        match self.0 & Self::LOCK_MASK {
            Self::UNLOCKED_VALUE if self.has_bias_pattern() => LockState::Biased {
                owner: ThreadId::new(self.payload()),
                epoch: self.bias_epoch(),
                age: self.age(),
            },
            Self::UNLOCKED_VALUE => LockState::Unlocked {
                hash: self.hash(),
                age: self.age(),
            },
            Self::LOCKED_VALUE => match self.locker() {
                Some(record) => LockState::LightweightLocked(record),
                None => LockState::Inflating,
            },
            Self::MONITOR_VALUE => match self.monitor() {
                Some(id) => LockState::Inflated(id),
                None => LockState::Marked(self.0 >> 2),
            },
            _ => LockState::Marked(self.0 >> 2),
        }
    }
}

impl Default for MarkWord {
    fn default() -> Self {
        Self::unlocked()
    }
}

impl fmt::Debug for MarkWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MarkWord({:#018x}: {:?})", self.0, self.decode())
    }
}

/// Atomic storage for a lock word.
///
/// The only way other components touch an object's lock word.
#[derive(Debug)]
#[repr(transparent)]
pub struct MarkWordCell(AtomicU64);

impl MarkWordCell {
    /// New cell holding `mark`
    pub const fn new(mark: MarkWord) -> Self {
        Self(AtomicU64::new(mark.raw()))
    }

    /// Current word
    #[inline]
    pub fn load(&self) -> MarkWord {
        MarkWord(self.0.load(Ordering::Acquire))
    }

    /// Current variant, lock-free
    #[inline]
    pub fn try_observe(&self) -> LockState {
        self.load().decode()
    }

    /// Install `new` if the word still equals `expected`.
    ///
    /// On failure returns the word that was observed instead.
    #[inline]
    pub fn compare_exchange(&self, expected: MarkWord, new: MarkWord) -> Result<(), MarkWord> {
        self.0
            .compare_exchange(expected.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(MarkWord)
    }

    /// Unconditional store. Only valid while the caller holds an exclusive
    /// claim on the word (the inflation sentinel, a safepoint or a handshake).
    #[inline]
    pub fn store(&self, mark: MarkWord) {
        self.0.store(mark.raw(), Ordering::Release);
    }
}

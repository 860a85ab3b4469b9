//! Monitor arena and free lists
//!
//! ## Design
//!
//! - Monitors are allocated in blocks of [`MONITOR_BLOCK_SIZE`] and never
//!   returned to the allocator; a [`MonitorId`] stays valid for the life of
//!   the process.
//! - Free and in-use lists are intrusive, linked through
//!   [`ObjectMonitor::next_om`].
//! - The global free list is a tagged lock-free stack. The global in-use list
//!   collects the in-use monitors of exited threads and is only rewritten
//!   at a safepoint.
//! - Each thread keeps its own free and in-use lists, refilled from the
//!   global free list in batches.

use crate::config::MONITOR_BLOCK_SIZE;
use crate::mark_word::MonitorId;
use crate::monitor::ObjectMonitor;
use crate::thread::VmThread;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// A thread's private monitor lists
#[derive(Debug, Default)]
pub struct LocalMonitorLists {
    pub(crate) free_head: u32,
    pub(crate) free_count: usize,
    pub(crate) in_use_head: u32,
    pub(crate) in_use_count: usize,
}

impl LocalMonitorLists {
    /// Monitors on the private free list
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Monitors on the private in-use list
    pub fn in_use_count(&self) -> usize {
        self.in_use_count
    }
}

/// Process-wide monitor storage
pub struct MonitorPool {
    blocks: Box<[OnceLock<Box<[ObjectMonitor]>>]>,
    block_count: AtomicUsize,
    grow_lock: Mutex<()>,
    /// Tagged head: `(tag << 32) | id`
    free_head: CachePadded<AtomicU64>,
    free_count: AtomicUsize,
    in_use_head: CachePadded<AtomicU32>,
    in_use_count: AtomicUsize,
    provision: usize,
}

impl MonitorPool {
    /// Pool with room for `max_blocks` blocks; threads refill `provision` at a time
    pub fn new(max_blocks: usize, provision: usize) -> Self {
        let blocks = (0..max_blocks).map(|_| OnceLock::new()).collect();
        Self {
            blocks,
            block_count: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            free_head: CachePadded::new(AtomicU64::new(0)),
            free_count: AtomicUsize::new(0),
            in_use_head: CachePadded::new(AtomicU32::new(0)),
            in_use_count: AtomicUsize::new(0),
            provision: provision.max(1),
        }
    }

    /// Resolve an id. An id outside the arena is fatal.
    #[inline]
    pub fn get(&self, id: MonitorId) -> &ObjectMonitor {
        let index = (id.get() - 1) as usize;
        match self
            .blocks
            .get(index / MONITOR_BLOCK_SIZE)
            .and_then(|block| block.get())
        {
            Some(block) => &block[index % MONITOR_BLOCK_SIZE],
            None => crate::sync_fatal!("{id} is not in the monitor arena"),
        }
    }

    #[inline]
    fn get_raw(&self, raw: u32) -> Option<&ObjectMonitor> {
        MonitorId::new(raw).map(|id| self.get(id))
    }

    /// `id` names an allocated arena slot
    pub fn contains(&self, id: MonitorId) -> bool {
        let index = (id.get() - 1) as usize;
        self.blocks
            .get(index / MONITOR_BLOCK_SIZE)
            .is_some_and(|block| block.get().is_some())
    }

    /// Allocated blocks
    pub fn block_count(&self) -> usize {
        self.block_count.load(Ordering::Acquire)
    }

    /// Monitors ever allocated
    pub fn population(&self) -> usize {
        self.block_count() * MONITOR_BLOCK_SIZE
    }

    /// Length of the global free list
    pub fn global_free_count(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    /// Length of the global in-use list
    pub fn global_in_use_count(&self) -> usize {
        self.in_use_count.load(Ordering::Acquire)
    }

    /// Every allocated monitor, in arena order
    pub fn iter(&self) -> impl Iterator<Item = &ObjectMonitor> {
        self.blocks
            .iter()
            .map_while(|block| block.get())
            .flat_map(|block| block.iter())
    }

    fn grow(&self) {
        let _grow = self.grow_lock.lock();
        if self.global_free_count() > 0 {
            // Another thread grew the arena first
            return;
        }
        let n = self.block_count.load(Ordering::Acquire);
        let Some(slot) = self.blocks.get(n) else {
            crate::sync_fatal!(
                "out of monitors: all {} blocks of {MONITOR_BLOCK_SIZE} are in circulation",
                self.blocks.len()
            );
        };
        let base = (n * MONITOR_BLOCK_SIZE) as u32;
        let block: Box<[ObjectMonitor]> = (1..=MONITOR_BLOCK_SIZE as u32)
            .map(|i| match MonitorId::new(base + i) {
                Some(id) => ObjectMonitor::new(id),
                None => crate::sync_fatal!("monitor id overflow"),
            })
            .collect();
        for (i, monitor) in block.iter().enumerate() {
            let next = if i + 1 < MONITOR_BLOCK_SIZE { base + i as u32 + 2 } else { 0 };
            monitor.next_om.store(next, Ordering::Relaxed);
        }
        if slot.set(block).is_err() {
            crate::sync_fatal!("monitor block {n} initialized twice");
        }
        self.block_count.store(n + 1, Ordering::Release);
        let first = self.get_raw(base + 1).map(ObjectMonitor::id);
        let last = self.get_raw(base + MONITOR_BLOCK_SIZE as u32).map(ObjectMonitor::id);
        if let (Some(first), Some(last)) = (first, last) {
            self.push_free_chain(first, last, MONITOR_BLOCK_SIZE);
        }
        tracing::debug!(target: "otter_vm_sync", block = n, population = self.population(), "allocated monitor block");
    }

    /// Push an already linked chain `first ..= last` onto the global free list
    fn push_free_chain(&self, first: MonitorId, last: MonitorId, count: usize) {
        let tail = self.get(last);
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            tail.next_om.store(head as u32, Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let new = (tag << 32) | first.get() as u64;
            match self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
        self.free_count.fetch_add(count, Ordering::AcqRel);
    }

    fn pop_global_free(&self) -> Option<MonitorId> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let monitor = self.get_raw(head as u32)?;
            let next = monitor.next_om.load(Ordering::Acquire);
            let tag = (head >> 32).wrapping_add(1);
            let new = (tag << 32) | next as u64;
            match self
                .free_head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.free_count.fetch_sub(1, Ordering::AcqRel);
                    monitor.next_om.store(0, Ordering::Relaxed);
                    return Some(monitor.id());
                }
                Err(observed) => head = observed,
            }
        }
    }

    /// Link `ids` into a chain and push it onto the global free list
    pub(crate) fn release_to_global(&self, ids: &[MonitorId]) {
        let (Some(&first), Some(&last)) = (ids.first(), ids.last()) else {
            return;
        };
        for pair in ids.windows(2) {
            self.get(pair[0]).next_om.store(pair[1].get(), Ordering::Relaxed);
        }
        self.push_free_chain(first, last, ids.len());
    }

    /// Take a monitor for `thread`, placing it on the thread's in-use list
    pub fn om_alloc(&self, thread: &VmThread) -> MonitorId {
        loop {
            {
                let mut lists = thread.monitors.lock();
                if let Some(monitor) = self.get_raw(lists.free_head) {
                    lists.free_head = monitor.next_om.load(Ordering::Relaxed);
                    lists.free_count -= 1;
                    monitor.next_om.store(lists.in_use_head, Ordering::Relaxed);
                    lists.in_use_head = monitor.id().get();
                    lists.in_use_count += 1;
                    return monitor.id();
                }
            }
            let mut moved = 0;
            while moved < self.provision {
                let Some(id) = self.pop_global_free() else {
                    break;
                };
                let monitor = self.get(id);
                let mut lists = thread.monitors.lock();
                monitor.next_om.store(lists.free_head, Ordering::Relaxed);
                lists.free_head = id.get();
                lists.free_count += 1;
                moved += 1;
            }
            if moved == 0 {
                self.grow();
            }
        }
    }

    /// Give back a monitor that lost its installation race
    pub fn om_release(&self, thread: &VmThread, id: MonitorId) {
        let monitor = self.get(id);
        let mut lists = thread.monitors.lock();
        if !self.unlink(&mut lists.in_use_head, id) {
            crate::sync_fatal!("{id} released by {} but not on its in-use list", thread.id());
        }
        lists.in_use_count -= 1;
        monitor.recycle();
        monitor.next_om.store(lists.free_head, Ordering::Relaxed);
        lists.free_head = id.get();
        lists.free_count += 1;
    }

    fn unlink(&self, head: &mut u32, id: MonitorId) -> bool {
        let target = id.get();
        if *head == target {
            *head = self.get(id).next_om.load(Ordering::Relaxed);
            return true;
        }
        let mut cur = *head;
        while let Some(monitor) = self.get_raw(cur) {
            let next = monitor.next_om.load(Ordering::Relaxed);
            if next == target {
                monitor
                    .next_om
                    .store(self.get(id).next_om.load(Ordering::Relaxed), Ordering::Relaxed);
                return true;
            }
            cur = next;
        }
        false
    }

    /// Move an exiting thread's lists onto the global lists
    pub fn om_flush(&self, thread: &VmThread) {
        let lists = std::mem::take(&mut *thread.monitors.lock());
        let free = self.collect_list(lists.free_head);
        let in_use = self.collect_list(lists.in_use_head);
        if free.len() != lists.free_count || in_use.len() != lists.in_use_count {
            crate::sync_fatal!(
                "{} monitor lists corrupted: free {}/{} in-use {}/{}",
                thread.id(),
                free.len(),
                lists.free_count,
                in_use.len(),
                lists.in_use_count
            );
        }
        for monitor in free.iter().map(|&id| self.get(id)) {
            monitor.recycle();
        }
        self.release_to_global(&free);

        if let (Some(&first), Some(&last)) = (in_use.first(), in_use.last()) {
            let tail = self.get(last);
            let mut head = self.in_use_head.load(Ordering::Acquire);
            loop {
                tail.next_om.store(head, Ordering::Relaxed);
                match self.in_use_head.compare_exchange_weak(
                    head,
                    first.get(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => head = observed,
                }
            }
            self.in_use_count.fetch_add(in_use.len(), Ordering::AcqRel);
        }
        tracing::debug!(
            target: "otter_vm_sync",
            thread = %thread.id(),
            free = free.len(),
            in_use = in_use.len(),
            "flushed thread monitor lists"
        );
    }

    /// Ids on the list starting at `head`. A cycle is fatal.
    pub(crate) fn collect_list(&self, head: u32) -> Vec<MonitorId> {
        let limit = self.population();
        let mut ids = Vec::new();
        let mut cur = head;
        while let Some(monitor) = self.get_raw(cur) {
            if ids.len() >= limit {
                crate::sync_fatal!("monitor list starting at {head} is cyclic");
            }
            ids.push(monitor.id());
            cur = monitor.next_om.load(Ordering::Relaxed);
        }
        ids
    }

    /// Ids on the global free list
    pub(crate) fn global_free_list(&self) -> Vec<MonitorId> {
        self.collect_list(self.free_head.load(Ordering::Acquire) as u32)
    }

    pub(crate) fn global_in_use_head(&self) -> u32 {
        self.in_use_head.load(Ordering::Acquire)
    }

    /// Ids on the global in-use list
    pub(crate) fn global_in_use_list(&self) -> Vec<MonitorId> {
        self.collect_list(self.in_use_head.load(Ordering::Acquire))
    }

    /// Keep only the monitors of the list at `head` for which `keep` holds.
    ///
    /// Returns the new head, the kept count and the removed ids. The caller
    /// must own the list exclusively.
    pub(crate) fn retain_list(
        &self,
        head: u32,
        mut keep: impl FnMut(MonitorId) -> bool,
    ) -> (u32, usize, Vec<MonitorId>) {
        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for id in self.collect_list(head) {
            if keep(id) {
                kept.push(id);
            } else {
                removed.push(id);
            }
        }
        for pair in kept.windows(2) {
            self.get(pair[0]).next_om.store(pair[1].get(), Ordering::Relaxed);
        }
        if let Some(&last) = kept.last() {
            self.get(last).next_om.store(0, Ordering::Relaxed);
        }
        let new_head = kept.first().map_or(0, |id| id.get());
        (new_head, kept.len(), removed)
    }

    /// Replace the global in-use list. Safepoint only.
    pub(crate) fn set_global_in_use(&self, head: u32, count: usize) {
        self.in_use_head.store(head, Ordering::Release);
        self.in_use_count.store(count, Ordering::Release);
    }
}

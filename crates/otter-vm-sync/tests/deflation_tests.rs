//! Deflation tests
//!
//! Idle monitors return to the free list with the object's original word
//! restored; busy monitors survive; reinflation starts from a clean monitor.

use otter_vm_sync::{InflateCause, Safepoint, SyncConfig, SyncRuntime};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;

const WORKERS: usize = 4;
const ROUNDS: u64 = 500;
const SHARED: usize = 8;

#[test]
fn test_deflate_then_reinflate_gives_clean_monitor() {
    let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
    let t = rt.attach_thread("main");
    let obj = rt.new_object("Point");
    let sync = rt.synchronizer();

    let hash = sync.identity_hash_value_for(&t, &obj);
    sync.enter(&t, &obj);
    sync.enter(&t, &obj);
    sync.wait(&t, &obj, 1).unwrap();
    sync.exit(&t, &obj).unwrap();
    sync.exit(&t, &obj).unwrap();
    assert!(obj.mark().has_monitor());

    let counters = rt.deflate_idle_monitors(Some(&*t));
    assert_eq!(counters.n_scavenged, 1);
    assert_eq!(counters.n_in_use, 0);
    assert!(obj.mark().is_neutral());
    assert_eq!(obj.mark().hash(), Some(hash));

    let monitor = sync.inflate(&t, &obj, InflateCause::VmInternal);
    assert_eq!(monitor.owner(), None);
    assert_eq!(monitor.recursions(), 0);
    assert_eq!(monitor.waiting(), 0);
    assert_eq!(monitor.header().hash(), Some(hash));
    assert_eq!(sync.identity_hash_value_for(&t, &obj), hash);

    let report = rt.audit(Some(&*t), false);
    assert!(report.is_clean(), "{report}");
}

#[test]
fn test_busy_monitors_survive_deflation() {
    let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
    let owned = rt.new_object("Owned");
    let waited = rt.new_object("Waited");
    let idle = rt.new_object("Idle");
    let waiting = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    let waiter = {
        let (rt, waited, waiting, done) = (rt.clone(), waited.clone(), waiting.clone(), done.clone());
        thread::spawn(move || {
            let t = rt.attach_thread("waiter");
            let sync = rt.synchronizer();
            sync.enter(&t, &waited);
            waiting.store(true, Ordering::Release);
            while !done.load(Ordering::Acquire) {
                sync.wait(&t, &waited, 0).unwrap();
            }
            sync.exit(&t, &waited).unwrap();
        })
    };

    let t = rt.attach_thread("main");
    let sync = rt.synchronizer();
    sync.jni_enter(&t, &owned);
    sync.inflate(&t, &idle, InflateCause::VmInternal);
    while !(waiting.load(Ordering::Acquire)
        && waited
            .mark()
            .monitor()
            .is_some_and(|id| rt.pool().get(id).waiting() == 1))
    {
        t.blocking(thread::yield_now);
    }

    let counters = rt.deflate_idle_monitors(Some(&*t));
    assert_eq!(counters.n_scavenged, 1);
    assert_eq!(counters.n_in_use, 2);
    assert!(idle.mark().is_neutral());
    assert!(owned.mark().has_monitor());
    assert!(waited.mark().has_monitor());

    sync.enter(&t, &waited);
    done.store(true, Ordering::Release);
    sync.notify(&t, &waited).unwrap();
    sync.exit(&t, &waited).unwrap();
    t.blocking(|| waiter.join()).unwrap();
    sync.jni_exit(&t, &owned).unwrap();

    let counters = rt.deflate_idle_monitors(Some(&*t));
    assert_eq!(counters.n_scavenged, 2);
    assert!(owned.mark().is_neutral() && waited.mark().is_neutral());
}

#[test]
fn test_flushed_lists_are_deflated_globally() {
    let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
    let objs: Vec<_> = (0..8).map(|_| rt.new_object("Point")).collect();
    {
        let t = rt.attach_thread("short-lived");
        for obj in &objs {
            rt.synchronizer().inflate(&t, obj, InflateCause::VmInternal);
        }
    }
    assert_eq!(rt.pool().global_in_use_count(), objs.len());
    let report = rt.audit(None, false);
    assert!(report.is_clean(), "{report}");

    let counters = rt.deflate_idle_monitors(None);
    assert_eq!(counters.n_scavenged, objs.len());
    assert_eq!(counters.per_thread_scavenged, 0);
    assert_eq!(rt.pool().global_in_use_count(), 0);
    assert!(objs.iter().all(|o| o.mark().is_neutral()));
    assert!(rt.audit(None, true).is_clean());
}

#[test]
fn test_cleanup_needed_tracks_usage() {
    let rt = SyncRuntime::new(SyncConfig {
        monitor_used_deflation_threshold: 50,
        ..SyncConfig::without_biased_locking()
    });
    let t = rt.attach_thread("main");
    let sync = rt.synchronizer();
    assert!(!sync.is_cleanup_needed());

    let objs: Vec<_> = (0..100).map(|_| rt.new_object("Point")).collect();
    for obj in &objs {
        sync.inflate(&t, obj, InflateCause::VmInternal);
    }
    assert_eq!(rt.pool().population(), otter_vm_sync::MONITOR_BLOCK_SIZE);
    assert!(sync.is_cleanup_needed());

    rt.deflate_idle_monitors(Some(&*t));
    assert!(!sync.is_cleanup_needed());
}

#[test]
fn test_oops_do_can_observe_every_monitor_object() {
    let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
    let t = rt.attach_thread("main");
    let objs: Vec<_> = (0..3).map(|_| rt.new_object("Point")).collect();
    for obj in &objs {
        rt.synchronizer().inflate(&t, obj, InflateCause::VmInternal);
    }
    let mut visited = 0;
    t.blocking(|| {
        otter_vm_sync::Safepoint::run(rt.threads(), None, |scope| {
            let mut visitor = |obj: &mut otter_vm_sync::ObjectRef| {
                assert!(objs.contains(obj));
                visited += 1;
            };
            rt.synchronizer().oops_do(scope, &mut visitor);
        })
    });
    assert_eq!(visited, 3);
}

#[test]
fn test_parked_contender_keeps_monitor_alive() {
    let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
    let obj = rt.new_object("Point");
    let t = rt.attach_thread("main");
    let sync = rt.synchronizer();
    sync.jni_enter(&t, &obj);
    let Some(id) = obj.mark().monitor() else {
        panic!("jni_enter must inflate");
    };
    let monitor = rt.pool().get(id);

    let contender = {
        let (rt, obj) = (rt.clone(), obj.clone());
        thread::spawn(move || {
            let t = rt.attach_thread("contender");
            let sync = rt.synchronizer();
            sync.enter(&t, &obj);
            sync.exit(&t, &obj).unwrap();
        })
    };
    while monitor.entry_waiters() == 0 {
        t.blocking(thread::yield_now);
    }

    t.blocking(|| {
        Safepoint::run(rt.threads(), Some(&*t), |scope| {
            // Hand the lock back while the contender is still parked
            monitor.exit(&t).unwrap();
            assert!(monitor.contentions() > 0);
            assert!(!sync.deflate_monitor(scope, id));
        })
    });
    assert_eq!(obj.mark().monitor(), Some(id));

    t.blocking(|| contender.join()).unwrap();
    let counters = rt.deflate_idle_monitors(Some(&*t));
    assert_eq!(counters.n_scavenged, 1);
    assert!(obj.mark().is_neutral());
}

/// Workers lock, hash and wait on shared objects while another thread
/// deflates back to back. Every count stays exact and every hash stable.
fn deflate_under_load(config: SyncConfig) {
    let rt = SyncRuntime::new(config);
    let objs: Arc<Vec<_>> = Arc::new((0..SHARED).map(|_| rt.new_object("Cell")).collect());
    let counts: Arc<Vec<AtomicU64>> = Arc::new((0..SHARED).map(|_| AtomicU64::new(0)).collect());
    let hashes: Arc<Vec<AtomicU32>> = Arc::new((0..SHARED).map(|_| AtomicU32::new(0)).collect());
    let done = Arc::new(AtomicBool::new(false));
    let scavenged = Arc::new(AtomicUsize::new(0));

    let deflater = {
        let (rt, done, scavenged) = (rt.clone(), done.clone(), scavenged.clone());
        thread::spawn(move || {
            let t = rt.attach_thread("deflater");
            let mut cycles = 0u32;
            while !done.load(Ordering::Acquire) {
                let counters = rt.deflate_idle_monitors(Some(&*t));
                scavenged.fetch_add(counters.n_scavenged, Ordering::Relaxed);
                cycles += 1;
                if cycles % 16 == 0 {
                    let report = rt.audit(Some(&*t), false);
                    assert!(report.is_clean(), "{report}");
                }
                t.blocking(thread::yield_now);
            }
        })
    };

    let workers: Vec<_> = (0..WORKERS)
        .map(|w| {
            let (rt, objs, counts, hashes) = (rt.clone(), objs.clone(), counts.clone(), hashes.clone());
            thread::spawn(move || {
                let t = rt.attach_thread(&format!("worker-{w}"));
                let sync = rt.synchronizer();
                for round in 0..ROUNDS {
                    let k = (round as usize + w) % SHARED;
                    let obj = &objs[k];
                    sync.enter(&t, obj);
                    sync.enter(&t, obj);
                    let v = counts[k].load(Ordering::Relaxed);
                    thread::yield_now();
                    counts[k].store(v + 1, Ordering::Relaxed);

                    let hash = sync.identity_hash_value_for(&t, obj);
                    if let Err(first) = hashes[k].compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire) {
                        assert_eq!(first, hash, "identity hash of {obj} changed");
                    }
                    if round % 25 == 0 {
                        sync.wait(&t, obj, 1).unwrap();
                    } else if round % 5 == 0 {
                        sync.notify_all(&t, obj).unwrap();
                    }
                    sync.exit(&t, obj).unwrap();
                    sync.exit(&t, obj).unwrap();
                }
                assert_eq!(t.lock_depth(), 0);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    done.store(true, Ordering::Release);
    deflater.join().unwrap();

    let t = rt.attach_thread("main");
    let total: u64 = counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert_eq!(total, WORKERS as u64 * ROUNDS);

    let last = rt.deflate_idle_monitors(Some(&*t));
    assert_eq!(last.n_in_use, 0);
    assert!(scavenged.load(Ordering::Relaxed) + last.n_scavenged > 0);
    for (obj, hash) in objs.iter().zip(hashes.iter()) {
        assert_eq!(obj.mark().hash(), Some(hash.load(Ordering::Acquire)));
    }
    let report = rt.audit(Some(&*t), true);
    assert!(report.is_clean(), "{report}");
}

#[test]
fn test_deflate_under_load_biased() {
    deflate_under_load(SyncConfig::default());
}

#[test]
fn test_deflate_under_load_without_bias() {
    deflate_under_load(SyncConfig::without_biased_locking());
}

//! Biased locking tests
//!
//! Revocation by handshake and by safepoint, bulk rebias through the type
//! epoch, bulk revoke, batch revocation and the collector mark hooks.

use otter_vm_sync::{
    Condition, LockState, ObjectRef, RevocationController, RevocationMode, Safepoint, SyncConfig,
    SyncRuntime,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Lock and unlock every object on a fresh attached thread, leaving each
/// biased toward that (now detached) thread
fn bias_on_other_thread(rt: &Arc<SyncRuntime>, objs: &[ObjectRef]) {
    let rt = rt.clone();
    let objs = objs.to_vec();
    thread::spawn(move || {
        let t = rt.attach_thread("biaser");
        let sync = rt.synchronizer();
        for obj in &objs {
            sync.enter(&t, obj);
            sync.exit(&t, obj).unwrap();
            assert_eq!(obj.mark().biased_locker(), Some(t.id()));
        }
    })
    .join()
    .unwrap();
}

#[test]
fn test_bias_of_dead_thread_is_revoked_without_handshake() {
    let rt = SyncRuntime::new(SyncConfig::default());
    let obj = rt.new_object("Point");
    bias_on_other_thread(&rt, std::slice::from_ref(&obj));

    let t = rt.attach_thread("main");
    let sync = rt.synchronizer();
    sync.enter(&t, &obj);
    assert!(sync.current_thread_holds_lock(&t, &obj));
    sync.exit(&t, &obj).unwrap();
    assert_eq!(rt.biased_locking().counters().snapshot().handshakes, 0);
    assert!(!matches!(obj.mark().decode(), LockState::Biased { owner: Some(o), .. } if o != t.id()));
}

fn revoke_held_bias(mode: RevocationMode) {
    let rt = SyncRuntime::new(SyncConfig {
        bias_revocation_mode: mode,
        ..Default::default()
    });
    let obj = rt.new_object("Point");
    let holding = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let holder = {
        let (rt, obj, holding, release) = (rt.clone(), obj.clone(), holding.clone(), release.clone());
        thread::spawn(move || {
            let t = rt.attach_thread("holder");
            let sync = rt.synchronizer();
            sync.enter(&t, &obj);
            sync.enter(&t, &obj);
            assert_eq!(obj.mark().biased_locker(), Some(t.id()));
            holding.store(true, Ordering::Release);
            // Keep polling so a handshake can run on this thread
            while !release.load(Ordering::Acquire) {
                t.poll();
                thread::yield_now();
            }
            assert!(sync.current_thread_holds_lock(&t, &obj));
            sync.exit(&t, &obj).unwrap();
            sync.exit(&t, &obj).unwrap();
            assert!(!sync.current_thread_holds_lock(&t, &obj));
        })
    };
    while !holding.load(Ordering::Acquire) {
        thread::yield_now();
    }

    let t = rt.attach_thread("revoker");
    let sync = rt.synchronizer();
    let condition = rt.biased_locking().revoke_and_rebias(&t, &obj, false);
    assert_eq!(condition, Condition::BiasRevoked);
    // The holder's oldest record now carries the lock
    match obj.mark().decode() {
        LockState::LightweightLocked(record) => assert_eq!(record.slot, 0),
        other => panic!("expected lightweight lock, got {other:?}"),
    }
    assert_eq!(sync.total_inflations(), 0);

    release.store(true, Ordering::Release);
    t.blocking(|| holder.join()).unwrap();
    assert!(obj.mark().is_neutral());

    let stats = rt.threads().safepoint_stats();
    match mode {
        RevocationMode::Handshake => {
            assert_eq!(rt.biased_locking().counters().snapshot().handshakes, 1);
            assert_eq!(stats.handshakes, 1);
        }
        RevocationMode::Safepoint => assert!(stats.safepoints >= 1),
    }
}

#[test]
fn test_revoke_held_bias_by_handshake() {
    revoke_held_bias(RevocationMode::Handshake);
}

#[test]
fn test_revoke_held_bias_at_safepoint() {
    revoke_held_bias(RevocationMode::Safepoint);
}

#[test]
fn test_bulk_rebias_bumps_epoch() {
    let rt = SyncRuntime::new(SyncConfig::eager_bulk_policy(3, 100));
    let objs: Vec<_> = (0..10).map(|_| rt.new_object("Node")).collect();
    bias_on_other_thread(&rt, &objs);
    let ty = rt.types().get("Node").unwrap();
    assert_eq!(ty.bias_epoch(), 0);

    let t = rt.attach_thread("main");
    let sync = rt.synchronizer();
    for obj in &objs[..3] {
        sync.enter(&t, obj);
        sync.exit(&t, obj).unwrap();
    }
    assert_eq!(ty.bias_epoch(), 1);
    assert!(ty.last_bulk_revocation().is_some());

    // Remaining objects carry the stale epoch and are taken over cheaply
    let before = rt.biased_locking().counters().snapshot();
    for obj in &objs[3..] {
        sync.enter(&t, obj);
        assert_eq!(obj.mark().biased_locker(), Some(t.id()));
        assert_eq!(obj.mark().bias_epoch(), 1);
        sync.exit(&t, obj).unwrap();
    }
    let after = rt.biased_locking().counters().snapshot();
    assert_eq!(after.rebiased_entries - before.rebiased_entries, 7);
    assert_eq!(after.handshakes, before.handshakes);
    assert_eq!(ty.revocation_count(), 3);
}

#[test]
fn test_bulk_revoke_disables_type() {
    let rt = SyncRuntime::new(SyncConfig::eager_bulk_policy(2, 3));
    let objs: Vec<_> = (0..4).map(|_| rt.new_object("Node")).collect();
    let t = rt.attach_thread("main");
    let sync = rt.synchronizer();
    let ty = rt.types().get("Node").unwrap();

    for obj in &objs {
        t.blocking(|| bias_on_other_thread(&rt, std::slice::from_ref(obj)));
        sync.enter(&t, obj);
        sync.exit(&t, obj).unwrap();
        if !ty.allows_biasing() {
            break;
        }
    }
    assert!(!ty.allows_biasing());
    let fresh = rt.new_object("Node");
    assert!(fresh.mark().is_neutral());
    sync.enter(&t, &fresh);
    assert!(fresh.mark().has_locker());
    sync.exit(&t, &fresh).unwrap();
}

#[test]
fn test_batch_revoke_leaves_nothing_biased() {
    let rt = SyncRuntime::new(SyncConfig::default());
    let objs: Vec<_> = (0..5).map(|_| rt.new_object("Point")).collect();
    bias_on_other_thread(&rt, &objs[..3]);
    let t = rt.attach_thread("main");
    let sync = rt.synchronizer();
    sync.enter(&t, &objs[3]);

    rt.biased_locking().revoke(&t, &objs);
    for obj in &objs {
        assert!(!obj.mark().has_bias_pattern(), "{obj} still biased");
    }
    assert!(sync.current_thread_holds_lock(&t, &objs[3]));
    sync.exit(&t, &objs[3]).unwrap();
    assert!(objs[3].mark().is_neutral());
}

#[test]
fn test_preserve_and_restore_around_collection() {
    let rt = SyncRuntime::new(SyncConfig::default());
    let held = rt.new_object("Point");
    let loose = rt.new_object("Point");
    let t = rt.attach_thread("main");
    let sync = rt.synchronizer();
    sync.enter(&t, &held);
    sync.enter(&t, &loose);
    sync.exit(&t, &loose).unwrap();
    let held_mark = held.mark();

    let bias = rt.biased_locking();
    t.blocking(|| {
        Safepoint::run(rt.threads(), None, |scope| {
            assert_eq!(bias.preserve_marks(scope), 1);
            // Collector reuses the lock words while marking
            held.header().store(otter_vm_sync::MarkWord::marked(0x1000));
            assert!(bias.reinit_mark(&loose));
            assert_eq!(bias.restore_marks(scope), 1);
        })
    });
    assert_eq!(held.mark(), held_mark);
    assert!(loose.mark().is_biased_anonymously());
    sync.exit(&t, &held).unwrap();
}

#[test]
fn test_reinit_mark_keeps_hash_and_monitor() {
    let rt = SyncRuntime::new(SyncConfig::default());
    let t = rt.attach_thread("main");
    let hashed = rt.new_object("Point");
    let inflated = rt.new_object("Point");
    let sync = rt.synchronizer();
    let bias = rt.biased_locking();

    let hash = sync.identity_hash_value_for(&t, &hashed);
    assert!(!bias.reinit_mark(&hashed));
    assert_eq!(sync.identity_hash_value_for(&t, &hashed), hash);

    let monitor = sync.inflate(&t, &inflated, otter_vm_sync::InflateCause::VmInternal);
    let id = monitor.id();
    assert!(!bias.reinit_mark(&inflated));
    assert_eq!(inflated.mark().monitor(), Some(id));
    let report = rt.audit(Some(&*t), false);
    assert!(report.is_clean(), "{report}");

    let counters = rt.deflate_idle_monitors(Some(&*t));
    assert_eq!(counters.n_scavenged, 1);
    assert!(bias.reinit_mark(&inflated));
    assert!(inflated.mark().is_biased_anonymously());
}

#[test]
fn test_stats_track_entry_kinds() {
    let rt = SyncRuntime::new(SyncConfig::default());
    let t = rt.attach_thread("main");
    let obj = rt.new_object("Point");
    let sync = rt.synchronizer();
    for _ in 0..4 {
        sync.enter(&t, &obj);
        sync.exit(&t, &obj).unwrap();
    }
    let stats = rt.biased_locking().counters().snapshot();
    assert_eq!(stats.total_entries, 4);
    assert_eq!(stats.anonymously_biased_entries, 1);
    assert_eq!(stats.biased_entries, 3);
    assert_eq!(stats.slow_path_entries(), 0);
}

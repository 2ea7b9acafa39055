//! Integration tests for the event-sourced store.
//!
//! Tests cover:
//!  1. First run: store creation + recovery key
//!  2. End-to-end lifecycle: add, update, history, point-in-time content,
//!     password change
//!  3. Replay idempotence and update ordering
//!  4. Multi-device merge without collisions
//!  5. Natural-key collision resolution with reference rewrite
//!  6. Event recovery from synchronizer conflict copies
//!  7. Mutation fencing while a resolution is pending
//!  8. Crash-resumable password re-encryption
//!  9. Per-record corruption isolation

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use burrow_core::record::{ServerFields, TunnelFields};
use burrow_core::store::{ConfigStore, UnlockOutcome, RECOVERY_FILE, VERIFICATION_FILE};
use burrow_core::{crypto, EventAction, Record, RecordBody, RecordKind, Resolution, StoreError};
use tempfile::tempdir;
use uuid::Uuid;

fn server(name: &str, ip: &str) -> RecordBody {
    RecordBody::Server(ServerFields {
        name: name.to_string(),
        ip_address: ip.to_string(),
        user: "root".to_string(),
        password: None,
        extra: BTreeMap::new(),
    })
}

fn tunnel(server_id: Uuid, hostname: &str, destination: &str) -> RecordBody {
    RecordBody::Tunnel(TunnelFields {
        server_id,
        assigned_client_id: None,
        hostname: hostname.to_string(),
        remote_port: 443,
        local_destination: destination.to_string(),
        enabled: false,
        extra: BTreeMap::new(),
    })
}

fn unlock(store: &ConfigStore, password: &str) {
    match store.unlock(password).unwrap() {
        UnlockOutcome::Unlocked | UnlockOutcome::Created { .. } => {}
    }
}

/// Mirror two store roots the way an append-only file synchronizer would:
/// copy files the other side is missing, never overwrite.
fn sync_dirs(a: &Path, b: &Path) {
    copy_missing(a, b);
    copy_missing(b, a);
}

fn copy_missing(from: &Path, to: &Path) {
    for sub in ["", "history"] {
        let from_dir = from.join(sub);
        let to_dir = to.join(sub);
        fs::create_dir_all(&to_dir).unwrap();
        for entry in fs::read_dir(&from_dir).unwrap() {
            let entry = entry.unwrap();
            if !entry.file_type().unwrap().is_file() {
                continue;
            }
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let dest = to_dir.join(&name);
            if !dest.exists() {
                fs::copy(entry.path(), dest).unwrap();
            }
        }
    }
}

// ─── 1. First run ───────────────────────────────────────────────────────────

#[test]
fn first_run_creates_store_and_recovery_key() {
    let dir = tempdir().unwrap();
    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    assert!(!store.is_configured());

    let recovery_key = match store.unlock("P1").unwrap() {
        UnlockOutcome::Created { recovery_key } => recovery_key,
        other => panic!("expected first-run creation, got {other:?}"),
    };
    assert!(store.is_configured());
    assert!(store.is_unlocked());
    assert!(dir.path().join(VERIFICATION_FILE).exists());
    assert!(dir.path().join(RECOVERY_FILE).exists());
    assert_eq!(store.recovery_key().unwrap(), recovery_key);
}

// ─── 2. End-to-end lifecycle ────────────────────────────────────────────────

#[test]
fn end_to_end_lifecycle() {
    let dir = tempdir().unwrap();
    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    unlock(&store, "P1");

    let server_id = store.add(server("vps-1", "1.2.3.4")).unwrap();
    let tunnel_id = store
        .add(tunnel(server_id, "service1", "localhost:8080"))
        .unwrap();
    assert_eq!(store.list_versions(tunnel_id).unwrap().len(), 1);

    store
        .update(tunnel_id, tunnel(server_id, "service1", "localhost:9090"))
        .unwrap();
    let versions = store.list_versions(tunnel_id).unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].action, EventAction::Add);
    assert_eq!(versions[1].action, EventAction::Update);

    // Content as of the first version still has the original destination.
    let before = store
        .content_at(tunnel_id, versions[0].timestamp)
        .unwrap();
    let old = Record::from_json(&before).unwrap();
    match &old.body {
        RecordBody::Tunnel(t) => assert_eq!(t.local_destination, "localhost:8080"),
        other => panic!("wrong kind: {other:?}"),
    }

    let records_before = store.records();
    store.change_password("P1", "P2").unwrap();
    store.lock();

    assert!(matches!(
        store.unlock("P1"),
        Err(StoreError::AuthFailure)
    ));
    unlock(&store, "P2");
    assert_eq!(store.records(), records_before);
    assert!(!store.recovery_key().unwrap().is_empty());
}

// ─── 3. Replay idempotence & ordering ───────────────────────────────────────

#[test]
fn replay_is_idempotent_and_order_sensitive() {
    let dir = tempdir().unwrap();
    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    unlock(&store, "pw");

    let sid = store.add(server("vps", "10.0.0.1")).unwrap();
    let tid = store.add(tunnel(sid, "svc", "localhost:1")).unwrap();
    store.update(tid, tunnel(sid, "svc", "localhost:2")).unwrap();
    store.update(tid, tunnel(sid, "svc", "localhost:3")).unwrap();

    let first = store.records();
    for _ in 0..3 {
        store.reload().unwrap();
        assert_eq!(store.records(), first);
    }
    match &store.get_record(tid).unwrap().body {
        RecordBody::Tunnel(t) => assert_eq!(t.local_destination, "localhost:3"),
        other => panic!("wrong kind: {other:?}"),
    }

    // A deleted record stays dead across replays, and its history survives.
    store.delete(tid).unwrap();
    store.reload().unwrap();
    assert!(store.get_record(tid).is_none());
    assert_eq!(store.list_versions(tid).unwrap().len(), 4);
}

// ─── 4. Multi-device merge, disjoint ids ────────────────────────────────────

#[test]
fn merging_disjoint_logs_yields_the_union() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let store_a = ConfigStore::open(dir_a.path(), "device-a").unwrap();
    unlock(&store_a, "pw");
    sync_dirs(dir_a.path(), dir_b.path());

    let store_b = ConfigStore::open(dir_b.path(), "device-b").unwrap();
    unlock(&store_b, "pw");

    store_a.add(server("alpha", "10.0.0.1")).unwrap();
    store_b.add(server("beta", "10.0.0.2")).unwrap();
    sync_dirs(dir_a.path(), dir_b.path());

    store_a.reload().unwrap();
    store_b.reload().unwrap();
    assert_eq!(store_a.records().len(), 2);
    assert_eq!(store_a.records(), store_b.records());
}

// ─── 5. Natural-key collision resolution ────────────────────────────────────

#[test]
fn colliding_servers_resolve_to_one_winner_with_rewritten_references() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let store_a = ConfigStore::open(dir_a.path(), "device-a").unwrap();
    unlock(&store_a, "pw");
    sync_dirs(dir_a.path(), dir_b.path());
    let store_b = ConfigStore::open(dir_b.path(), "device-b").unwrap();
    unlock(&store_b, "pw");

    // Both devices register the same physical server independently.
    let server_a = store_a.add(server("from-a", "203.0.113.7")).unwrap();
    let tunnel_a = store_a
        .add(tunnel(server_a, "svc-a", "localhost:3000"))
        .unwrap();
    let server_b = store_b.add(server("from-b", "203.0.113.7")).unwrap();
    store_b
        .add(tunnel(server_b, "svc-b", "localhost:4000"))
        .unwrap();

    sync_dirs(dir_a.path(), dir_b.path());
    store_a.reload().unwrap();

    let session = store_a.begin_resolution(Duration::ZERO).unwrap();
    let groups = session.collision_groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].candidates.len(), 2);

    let summary = session
        .complete(&[Resolution {
            winner: server_b,
            losers: vec![server_a],
        }])
        .unwrap();
    assert_eq!(summary.removed, 1);
    assert!(summary.updated >= 1);

    // Exactly one server with that address survives, and the loser's tunnel
    // now points at the winner.
    let servers = store_a.list_by_kind(RecordKind::Server);
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, server_b);
    match &store_a.get_record(tunnel_a).unwrap().body {
        RecordBody::Tunnel(t) => assert_eq!(t.server_id, server_b),
        other => panic!("wrong kind: {other:?}"),
    }

    // After the resolution syncs, the other device converges to the same set.
    sync_dirs(dir_a.path(), dir_b.path());
    store_b.reload().unwrap();
    assert_eq!(store_a.records(), store_b.records());
}

// ─── 6. Conflict-copy recovery ──────────────────────────────────────────────

#[test]
fn events_trapped_in_conflict_copies_are_recovered() {
    let dir = tempdir().unwrap();
    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    unlock(&store, "pw");

    store.add(server("kept", "10.0.0.1")).unwrap();
    let lost = store.add(server("lost", "10.0.0.2")).unwrap();

    // Simulate the synchronizer demoting the second record's files to
    // conflict copies.
    let marker = ".sync-conflict-20240101-010101-AAAAAAA";
    for entry in fs::read_dir(dir.path().join("history")).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if name.contains(&lost.to_string()) {
            let renamed = name.replace("_manifest.json", &format!("_manifest{marker}.json"));
            fs::rename(&path, path.with_file_name(renamed)).unwrap();
        }
    }
    for entry in fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if name.contains(&lost.to_string()) && name.ends_with(".patch") {
            let renamed = name.replace(".patch", &format!("{marker}.patch"));
            fs::rename(&path, path.with_file_name(renamed)).unwrap();
        }
    }

    store.reload().unwrap();
    assert!(store.get_record(lost).is_none());
    assert_eq!(store.detect_conflicts().unwrap().len(), 2);

    let session = store.begin_resolution(Duration::ZERO).unwrap();
    assert!(session.collision_groups().is_empty());
    let summary = session.complete(&[]).unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.artifacts_deleted, 2);

    assert!(store.get_record(lost).is_some());
    assert!(store.detect_conflicts().unwrap().is_empty());
    assert!(store.pending_conflict().unwrap().is_none());
}

// ─── 7. Mutation fencing during resolution ──────────────────────────────────

#[test]
fn mutations_are_rejected_while_resolution_is_pending() {
    let dir = tempdir().unwrap();
    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    unlock(&store, "pw");

    fs::write(
        dir.path().join("resolution.lock"),
        serde_json::json!({
            "device_id": "device-b",
            "claimed_at": "2024-01-01T00:00:00Z"
        })
        .to_string(),
    )
    .unwrap();

    assert!(matches!(
        store.add(server("x", "10.0.0.9")),
        Err(StoreError::ConflictPending { holder }) if holder == "device-b"
    ));
    assert!(matches!(
        store.change_password("pw", "pw2"),
        Err(StoreError::ConflictPending { .. })
    ));
    // Another device's claim also loses us the election.
    assert!(matches!(
        store.begin_resolution(Duration::ZERO),
        Err(StoreError::LockContention { holder }) if holder == "device-b"
    ));
}

// ─── 8. Crash-resumable password change ─────────────────────────────────────

#[test]
fn interrupted_rekey_is_resumed_on_open() {
    let dir = tempdir().unwrap();
    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    unlock(&store, "old-pw");
    let id = store.add(server("vps", "10.0.0.1")).unwrap();
    let records = store.records();
    drop(store);

    // Re-encrypt everything into .rekey/ and write the commit marker, but
    // "crash" before publishing.
    let staging = dir.path().join(".rekey");
    fs::create_dir_all(&staging).unwrap();
    for entry in fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".dat") || name.ends_with(".patch") {
            let blob = fs::read(entry.path()).unwrap();
            let rewrapped = crypto::re_encrypt(&blob, "old-pw", "new-pw").unwrap();
            fs::write(staging.join(&name), rewrapped).unwrap();
        }
    }
    fs::write(staging.join("COMMIT"), b"").unwrap();

    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    assert!(!dir.path().join(".rekey").exists());
    assert!(matches!(
        store.unlock("old-pw"),
        Err(StoreError::AuthFailure)
    ));
    unlock(&store, "new-pw");
    assert_eq!(store.records(), records);
    assert!(store.get_record(id).is_some());
}

// ─── 9. Corruption isolation ────────────────────────────────────────────────

#[test]
fn corrupt_patch_skips_only_that_record() {
    let dir = tempdir().unwrap();
    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    unlock(&store, "pw");

    let good = store.add(server("good", "10.0.0.1")).unwrap();
    let bad = store.add(server("bad", "10.0.0.2")).unwrap();

    for entry in fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if name.contains(&bad.to_string()) && name.ends_with(".patch") {
            fs::write(&path, b"not ciphertext at all").unwrap();
        }
    }

    store.reload().unwrap();
    assert!(store.get_record(good).is_some());
    assert!(store.get_record(bad).is_none());
    assert_eq!(store.records().len(), 1);
}

// ─── Display index ──────────────────────────────────────────────────────────

#[test]
fn display_index_is_rebuildable_from_the_log() {
    let dir = tempdir().unwrap();
    let store = ConfigStore::open(dir.path(), "device-a").unwrap();
    unlock(&store, "pw");

    let sid = store.add(server("vps-1", "10.0.0.1")).unwrap();
    store.add(tunnel(sid, "svc", "localhost:3000")).unwrap();

    fs::remove_file(dir.path().join("_index.json")).unwrap();
    store.rebuild_index().unwrap();

    let index = store.display_index().unwrap();
    assert_eq!(index.len(), 2);
    assert_eq!(index[&sid].name, "vps-1");
    assert_eq!(index[&sid].kind, RecordKind::Server);
}

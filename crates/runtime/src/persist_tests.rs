// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::os::unix::fs::PermissionsExt;

use super::*;
use crate::event::Event;
use crate::session::{Session, SessionConfig, SessionState};

fn store() -> (tempfile::TempDir, SessionStore) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
    let store = SessionStore::new(dir.path()).unwrap_or_else(|e| panic!("store: {e}"));
    (dir, store)
}

fn snapshot(id: &str) -> SessionSnapshot {
    Session::new(id, SessionConfig::new("shell", "/tmp"), 1024).snapshot()
}

#[test]
fn save_then_load_round_trips() -> crate::Result<()> {
    let (_dir, store) = store();
    let mut session = Session::new("s1", SessionConfig::new("shell", "/tmp"), 1024);
    let _ = session.transition_to(SessionState::Running, "started");
    session.append_output("some output");

    store.save_session(&session.snapshot())?;
    let loaded = store.load_session("s1")?;
    assert_eq!(loaded.id, "s1");
    assert_eq!(loaded.state, SessionState::Running);
    assert_eq!(loaded.output, "some output");
    assert_eq!(loaded.transitions.len(), 1);
    Ok(())
}

#[test]
fn load_missing_session_is_not_found() {
    let (_dir, store) = store();
    let err = store.load_session("ghost");
    assert!(matches!(err, Err(Error::NotFound(id)) if id == "ghost"));
}

#[test]
fn file_and_directory_modes_are_private() -> crate::Result<()> {
    let (dir, store) = store();
    store.save_session(&snapshot("s1"))?;

    let session_dir = dir.path().join("sessions/s1");
    let dir_mode = std::fs::metadata(&session_dir)?.permissions().mode() & 0o777;
    assert_eq!(dir_mode, 0o700);

    let file_mode =
        std::fs::metadata(session_dir.join("session.json"))?.permissions().mode() & 0o777;
    assert_eq!(file_mode, 0o600);
    Ok(())
}

#[test]
fn list_returns_creation_order_and_skips_junk() -> crate::Result<()> {
    let (dir, store) = store();
    store.save_session(&snapshot("a"))?;
    std::thread::sleep(std::time::Duration::from_millis(5));
    store.save_session(&snapshot("b"))?;

    // A directory without a snapshot must not break the listing.
    std::fs::create_dir_all(dir.path().join("sessions/broken"))?;

    let ids: Vec<String> = store.list_sessions()?.into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    Ok(())
}

#[test]
fn delete_removes_everything_and_is_idempotent() -> crate::Result<()> {
    let (dir, store) = store();
    store.save_session(&snapshot("s1"))?;
    store.append_activity("s1", &Event::output("s1", "x"))?;

    store.delete_session("s1")?;
    assert!(!dir.path().join("sessions/s1").exists());
    store.delete_session("s1")?;
    Ok(())
}

#[test]
fn snapshot_overwrite_leaves_no_temp_files() -> crate::Result<()> {
    let (dir, store) = store();
    for _ in 0..5 {
        store.save_session(&snapshot("s1"))?;
    }
    let entries: Vec<String> = std::fs::read_dir(dir.path().join("sessions/s1"))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["session.json"]);
    Ok(())
}

#[test]
fn activity_appends_one_line_per_record() -> crate::Result<()> {
    let (dir, store) = store();
    for n in 0..3 {
        store.append_activity("s1", &Event::output("s1", format!("chunk-{n}")))?;
    }
    let contents = std::fs::read_to_string(dir.path().join("sessions/s1/activity.jsonl"))?;
    assert_eq!(contents.lines().count(), 3);
    for line in contents.lines() {
        let value: serde_json::Value = serde_json::from_str(line).map_err(std::io::Error::from)?;
        assert_eq!(value["type"], "output");
    }
    Ok(())
}

#[test]
fn tail_reads_last_n_in_order() -> crate::Result<()> {
    let (_dir, store) = store();
    for n in 0..10 {
        store.append_activity("s1", &serde_json::json!({ "n": n }))?;
    }

    let tail = store.tail_activity("s1", 3)?;
    assert_eq!(tail.len(), 3);
    let ns: Vec<u64> = tail
        .iter()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter_map(|v| v["n"].as_u64())
        .collect();
    assert_eq!(ns, vec![7, 8, 9]);
    Ok(())
}

#[test]
fn tail_handles_short_files_and_missing_logs() -> crate::Result<()> {
    let (_dir, store) = store();
    assert!(store.tail_activity("absent", 5)?.is_empty());

    store.append_activity("s1", &serde_json::json!({ "only": true }))?;
    let tail = store.tail_activity("s1", 5)?;
    assert_eq!(tail.len(), 1);
    assert!(store.tail_activity("s1", 0)?.is_empty());
    Ok(())
}

#[test]
fn tail_crosses_chunk_boundaries() -> crate::Result<()> {
    let (_dir, store) = store();
    // Each record is ~1KiB so the reverse scan needs several chunks.
    let filler = "f".repeat(1000);
    for n in 0..40 {
        store.append_activity("s1", &serde_json::json!({ "n": n, "filler": filler }))?;
    }
    let tail = store.tail_activity("s1", 12)?;
    let ns: Vec<u64> = tail
        .iter()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter_map(|v| v["n"].as_u64())
        .collect();
    assert_eq!(ns, (28..40).collect::<Vec<u64>>());
    Ok(())
}

#[test]
fn extractor_state_round_trips() -> crate::Result<()> {
    let (_dir, store) = store();
    assert_eq!(store.load_extractor_state("s1")?, None);

    let state = serde_json::json!({ "cursor": 42, "phase": "scan" });
    store.save_extractor_state("s1", &state)?;
    assert_eq!(store.load_extractor_state("s1")?, Some(state));
    Ok(())
}

#[test]
fn concurrent_reader_never_sees_a_torn_snapshot() {
    let (_dir, store) = store();
    let reader_store = store.clone();
    store.save_session(&snapshot("s1")).unwrap_or_else(|e| panic!("seed: {e}"));

    let writer = std::thread::spawn(move || {
        let mut session = Session::new("s1", SessionConfig::new("shell", "/tmp"), 1 << 16);
        for n in 0..200 {
            session.append_output(&format!("chunk {n} "));
            if store.save_session(&session.snapshot()).is_err() {
                return;
            }
        }
    });

    // Every read must parse as a complete document.
    for _ in 0..200 {
        match reader_store.load_session("s1") {
            Ok(loaded) => assert_eq!(loaded.id, "s1"),
            Err(e) => panic!("torn or unreadable snapshot: {e}"),
        }
    }
    let _ = writer.join();
}

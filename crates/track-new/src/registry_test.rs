// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Barrier, Mutex};

use rstest::rstest;
use tempfile::TempDir;

use super::{Mechanism, Registry, TrackedProcess};
use crate::fixtures::*;

#[rstest]
fn test_new_registry_is_empty(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    assert!(registry.is_empty().unwrap());
    assert!(registry.root().is_absolute());
}

#[rstest]
fn test_record_and_list(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    for pid in [300, 100, 200] {
        assert!(registry.record(pid).unwrap(), "first record should be new");
    }
    let mut pids: Vec<_> = registry.list().unwrap().into_iter().map(|p| p.pid).collect();
    pids.sort();
    assert_eq!(pids, vec![100, 200, 300]);
    assert!(registry.contains(200));
    assert!(!registry.contains(400));
}

#[rstest]
fn test_record_is_idempotent(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    let first = TrackedProcess::new(42)
        .with_parent(1)
        .with_mechanism(Mechanism::Fork);
    let second = TrackedProcess::new(42)
        .with_parent(7)
        .with_mechanism(Mechanism::Spawn);
    assert!(registry.record_entry(first).unwrap());
    assert!(!registry.record_entry(second).unwrap());

    let listed = registry.list().unwrap();
    assert_eq!(listed.len(), 1, "a pid should only ever appear once");
    assert_eq!(listed[0].parent_pid, Some(1), "the first write should win");
    assert_eq!(listed[0].mechanism, Some(Mechanism::Fork));
    assert!(listed[0].recorded_at.is_some());
}

#[rstest]
fn test_list_ignores_pending_and_foreign_files(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    registry.record(10).unwrap();
    std::fs::write(registry.root().join(".pending-abc123"), b"{\"parent_pid\"").unwrap();
    std::fs::write(registry.root().join("README"), b"not an entry").unwrap();

    let listed = registry.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pid, 10);
}

#[rstest]
#[case(b"")]
#[case(b"{not json")]
#[case(b"[1, 2, 3]")]
fn test_list_tolerates_unreadable_content(registry: (TempDir, Registry), #[case] content: &[u8]) {
    let (_tmpdir, registry) = registry;
    std::fs::write(registry.root().join("1234"), content).unwrap();

    let listed = registry.list().expect("listing should never fail on a bad entry");
    assert_eq!(listed, vec![TrackedProcess::new(1234)]);
}

#[rstest]
fn test_list_orders_by_record_time(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    let mut expected = Vec::new();
    for pid in [9, 3, 7] {
        registry.record(pid).unwrap();
        expected.push(pid);
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    let pids: Vec<_> = registry.list().unwrap().into_iter().map(|p| p.pid).collect();
    assert_eq!(pids, expected);
}

#[rstest]
fn test_clear(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    for pid in 1..=5 {
        registry.record(pid).unwrap();
    }
    std::fs::write(registry.root().join(".pending-stale"), b"").unwrap();
    registry.clear().unwrap();
    assert!(registry.is_empty().unwrap());
    assert_eq!(
        std::fs::read_dir(registry.root()).unwrap().count(),
        0,
        "stale pending files should also be removed"
    );
    assert!(registry.record(3).unwrap(), "cleared pids can be recorded again");
}

#[rstest]
fn test_open_missing_registry(tmpdir: TempDir) {
    let missing = tmpdir.path().join("nothing-here");
    assert!(matches!(
        Registry::open(&missing),
        Err(crate::Error::RegistryNotFound(_))
    ));
}

#[rstest]
fn test_create_joins_existing(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    registry.record(77).unwrap();
    let joined = Registry::create(registry.root()).unwrap();
    assert_eq!(joined, registry);
    assert!(joined.contains(77), "joining must not clear existing entries");
}

#[rstest]
fn test_sessions_are_unique_and_empty(tmpdir: TempDir) {
    let first = Registry::create_session_in(tmpdir.path()).unwrap();
    first.record(1).unwrap();
    let second = Registry::create_session_in(tmpdir.path()).unwrap();
    assert_ne!(first.root(), second.root());
    assert!(second.is_empty().unwrap());
}

#[cfg(unix)]
#[rstest]
fn test_session_is_reachable_by_everyone(tmpdir: TempDir) {
    use std::os::unix::fs::PermissionsExt;

    let registry = Registry::create_session_in(tmpdir.path().join("nested/parent")).unwrap();
    let mode = std::fs::metadata(registry.root()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o777);
}

#[rstest]
fn test_destroy(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    registry.record(1).unwrap();
    let root = registry.root().to_owned();
    registry.destroy().unwrap();
    assert!(!root.exists());
}

#[rstest]
#[case(1)]
#[case(16)]
fn test_concurrent_writers(registry: (TempDir, Registry), #[case] writers: u32) {
    let (_tmpdir, registry) = registry;
    let per_writer = 25;
    std::thread::scope(|scope| {
        for writer in 0..writers {
            let registry = &registry;
            scope.spawn(move || {
                for i in 0..per_writer {
                    // overlapping pids across writers exercise duplicate records
                    let pid = 1000 + (writer / 2) * per_writer + i;
                    registry.record(pid).expect("concurrent record should succeed");
                }
            });
        }
    });

    let listed = registry.list().unwrap();
    let unique: HashSet<_> = listed.iter().map(|p| p.pid).collect();
    assert_eq!(unique.len(), listed.len(), "no pid should be listed twice");
    let expected = writers.div_ceil(2) * per_writer;
    assert_eq!(listed.len() as u32, expected);
}

#[rstest]
fn test_racing_writers_one_winner(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    const WRITERS: u32 = 8;
    for round in 0..20u32 {
        let pid = 10_000 + round;
        let barrier = Arc::new(Barrier::new(WRITERS as usize));
        let handles: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let entry = TrackedProcess::new(pid).with_parent(writer);
                    (writer, registry.record_entry(entry).unwrap())
                })
            })
            .collect();
        let winners: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|(_, recorded)| *recorded)
            .map(|(writer, _)| writer)
            .collect();
        assert_eq!(winners.len(), 1, "exactly one writer must win pid {pid}");

        let stored = registry
            .list()
            .unwrap()
            .into_iter()
            .find(|p| p.pid == pid)
            .expect("pid should be recorded");
        assert_eq!(
            stored.parent_pid,
            Some(winners[0]),
            "the stored entry must be the one reported as recorded"
        );
    }
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn take(&self) -> String {
        String::from_utf8(std::mem::take(&mut *self.0.lock().unwrap())).unwrap()
    }
}

#[rstest]
fn test_write_entry_is_silent(registry: (TempDir, Registry)) {
    let (_tmpdir, registry) = registry;
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(move || writer.clone())
        .without_time()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        assert!(registry.write_entry(TrackedProcess::new(11)).unwrap());
        assert!(!registry.write_entry(TrackedProcess::new(11)).unwrap());
        assert_eq!(captured.take(), "", "writing from a forked child must not log");

        assert!(registry.record_entry(TrackedProcess::new(12)).unwrap());
        assert!(captured.take().contains("recorded process"));
    });
}

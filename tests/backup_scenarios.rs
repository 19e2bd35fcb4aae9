//! End-to-end backup scenarios over real temporary filesystem trees.

use shuttervault::backup::checksum::ChecksumEngine;
use shuttervault::backup::duplicates::DuplicatePolicy;
use shuttervault::backup::BackupManager;
use shuttervault::{BackupConfig, RunOutcome};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

fn config_for(source: &Path, destinations: Vec<PathBuf>) -> BackupConfig {
    BackupConfig {
        source_root: source.to_path_buf(),
        destinations,
        // Keep runs deterministic regardless of what backs the tempdir
        worker_override: 2,
        ..BackupConfig::default()
    }
}

fn write_source(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn checksum(path: &Path) -> String {
    ChecksumEngine::default()
        .checksum_file(path)
        .unwrap()
        .to_string()
}

/// Snapshot after the aggregator has folded the terminal event; the event
/// channel is FIFO, so once the outcome shows up every counter is final.
async fn settled(manager: &BackupManager) -> shuttervault::ProgressSnapshot {
    for _ in 0..1000 {
        let snap = manager.snapshot();
        if snap.outcome.is_some() {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("aggregator never folded the run outcome");
}

/// Every data file present at the destination (engine metadata aside).
fn destination_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .filter(|p| !p.starts_with(".shuttervault"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_destination_copies_and_verifies_everything() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_source(
        src.path(),
        &[
            ("wedding/001.arw", b"raw-001"),
            ("wedding/002.arw", b"raw-002"),
            ("wedding/previews/001.jpg", b"jpeg-001"),
            ("street/003.dng", b"dng-003"),
            ("street/004.jpg", b"jpeg-004"),
        ],
    );

    let manager =
        BackupManager::new(config_for(src.path(), vec![dst.path().to_path_buf()])).unwrap();
    let outcome = manager.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::CompletedClean);

    let snap = settled(&manager).await;
    assert_eq!(snap.destinations[0].files_completed, 5);
    assert_eq!(snap.destinations[0].files_verified, 5);
    assert_eq!(snap.destinations[0].files_quarantined, 0);
    assert_eq!(snap.destinations[0].files_skipped, 0);
    assert_eq!(snap.destinations[0].files_failed, 0);
    assert!(snap.failed_files.is_empty());

    // The round-trip law: every destination file is bit-exact with its source
    for rel in destination_files(dst.path()) {
        assert_eq!(
            checksum(&src.path().join(&rel)),
            checksum(&dst.path().join(&rel)),
            "mismatch at {rel:?}"
        );
    }
    assert_eq!(destination_files(dst.path()).len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_policy_skips_exact_and_renamed_copies() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_source(
        src.path(),
        &[
            ("a.jpg", b"content-a"),
            ("b.jpg", b"content-b"),
            ("c.jpg", b"content-c"),
        ],
    );
    // a: exact duplicate (same path, same bytes); b: renamed duplicate
    write_source(
        dst.path(),
        &[("a.jpg", b"content-a"), ("archive/b_old.jpg", b"content-b")],
    );

    let config = BackupConfig {
        duplicate_policy: DuplicatePolicy::SkipBoth,
        ..config_for(src.path(), vec![dst.path().to_path_buf()])
    };
    let manager = BackupManager::new(config).unwrap();
    let outcome = manager.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::CompletedClean);

    let snap = settled(&manager).await;
    let dest = &snap.destinations[0];
    assert_eq!(dest.duplicates_exact, 1);
    assert_eq!(dest.duplicates_renamed, 1);
    assert_eq!(dest.files_skipped, 2);
    assert_eq!(dest.files_completed, 1);
    assert_eq!(dest.files_verified, 1);

    // Only the unique file was written; the renamed original is untouched
    assert!(dst.path().join("c.jpg").exists());
    assert!(!dst.path().join("b.jpg").exists());
    assert_eq!(
        fs::read(dst.path().join("archive/b_old.jpg")).unwrap(),
        b"content-b"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_destination_file_is_quarantined_not_overwritten() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_source(src.path(), &[("shoot/hero.jpg", b"the new edit")]);
    write_source(dst.path(), &[("shoot/hero.jpg", b"an older edit")]);
    let displaced_checksum = checksum(&dst.path().join("shoot/hero.jpg"));

    let manager =
        BackupManager::new(config_for(src.path(), vec![dst.path().to_path_buf()])).unwrap();
    let outcome = manager.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::CompletedClean);

    let snap = settled(&manager).await;
    assert_eq!(snap.destinations[0].files_quarantined, 1);
    assert_eq!(snap.destinations[0].files_completed, 1);
    assert_eq!(snap.destinations[0].files_verified, 1);

    // New content landed and verified
    assert_eq!(
        fs::read(dst.path().join("shoot/hero.jpg")).unwrap(),
        b"the new edit"
    );

    // The displaced file is recoverable from quarantine, bit-exact
    let quarantine_root = dst.path().join(".shuttervault/quarantine");
    let quarantined: Vec<PathBuf> = WalkDir::new(&quarantine_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name() != "quarantine-log.jsonl")
        .map(|e| e.path().to_path_buf())
        .collect();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(fs::read(&quarantined[0]).unwrap(), b"an older edit");
    assert_eq!(checksum(&quarantined[0]), displaced_checksum);

    // And the trail records it
    let log = fs::read_to_string(quarantine_root.join("quarantine-log.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("hero.jpg"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destinations_are_independent() {
    let src = tempfile::tempdir().unwrap();
    let dst_fresh = tempfile::tempdir().unwrap();
    let dst_seeded = tempfile::tempdir().unwrap();
    write_source(src.path(), &[("a.jpg", b"alpha"), ("b.jpg", b"bravo")]);
    // One destination already holds an exact copy of a.jpg
    write_source(dst_seeded.path(), &[("a.jpg", b"alpha")]);

    let config = BackupConfig {
        duplicate_policy: DuplicatePolicy::SkipExact,
        ..config_for(
            src.path(),
            vec![dst_fresh.path().to_path_buf(), dst_seeded.path().to_path_buf()],
        )
    };
    let manager = BackupManager::new(config).unwrap();
    let outcome = manager.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::CompletedClean);

    let snap = settled(&manager).await;
    // Same manifest entry, different decision per destination
    assert_eq!(snap.destinations[0].files_completed, 2);
    assert_eq!(snap.destinations[0].files_skipped, 0);
    assert_eq!(snap.destinations[1].files_completed, 1);
    assert_eq!(snap.destinations[1].files_skipped, 1);

    for dst in [dst_fresh.path(), dst_seeded.path()] {
        assert_eq!(fs::read(dst.join("a.jpg")).unwrap(), b"alpha");
        assert_eq!(fs::read(dst.join("b.jpg")).unwrap(), b"bravo");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn organization_folder_nests_all_engine_output() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_source(src.path(), &[("a.jpg", b"alpha")]);

    let config = BackupConfig {
        organization_folder: Some("photo-vault".to_string()),
        ..config_for(src.path(), vec![dst.path().to_path_buf()])
    };
    let manager = BackupManager::new(config).unwrap();
    assert_eq!(manager.run().await.unwrap(), RunOutcome::CompletedClean);

    assert_eq!(
        fs::read(dst.path().join("photo-vault/a.jpg")).unwrap(),
        b"alpha"
    );
    assert!(!dst.path().join("a.jpg").exists());
    assert!(dst
        .path()
        .join("photo-vault/.shuttervault/checksum-cache.json")
        .exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_run_skips_everything_via_the_persisted_cache() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_source(
        src.path(),
        &[("a.jpg", b"alpha"), ("b.jpg", b"bravo"), ("c.jpg", b"charlie")],
    );

    let config = BackupConfig {
        duplicate_policy: DuplicatePolicy::SkipExact,
        ..config_for(src.path(), vec![dst.path().to_path_buf()])
    };

    let first = BackupManager::new(config.clone()).unwrap();
    assert_eq!(first.run().await.unwrap(), RunOutcome::CompletedClean);
    assert_eq!(first.snapshot().destinations[0].files_completed, 3);
    assert!(dst.path().join(".shuttervault/checksum-cache.json").exists());

    let second = BackupManager::new(config).unwrap();
    assert_eq!(second.run().await.unwrap(), RunOutcome::CompletedClean);
    let snap = second.snapshot();
    assert_eq!(snap.destinations[0].files_completed, 0);
    assert_eq!(snap.destinations[0].files_skipped, 3);
    assert_eq!(snap.destinations[0].duplicates_exact, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_manifests_are_identical_for_an_unchanged_tree() {
    let src = tempfile::tempdir().unwrap();
    let dst_a = tempfile::tempdir().unwrap();
    let dst_b = tempfile::tempdir().unwrap();
    write_source(
        src.path(),
        &[
            ("x/1.jpg", b"one"),
            ("x/2.jpg", b"two"),
            ("y/3.jpg", b"three"),
        ],
    );

    // Two runs over the same source produce byte-identical destination trees
    let first =
        BackupManager::new(config_for(src.path(), vec![dst_a.path().to_path_buf()])).unwrap();
    first.run().await.unwrap();
    let second =
        BackupManager::new(config_for(src.path(), vec![dst_b.path().to_path_buf()])).unwrap();
    second.run().await.unwrap();

    let mut files_a = destination_files(dst_a.path());
    let mut files_b = destination_files(dst_b.path());
    files_a.sort();
    files_b.sort();
    assert_eq!(files_a, files_b);
    for rel in files_a {
        assert_eq!(
            checksum(&dst_a.path().join(&rel)),
            checksum(&dst_b.path().join(&rel))
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_preserves_integrity_of_completed_files() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    // Large enough that a single worker spends real time copying
    let payload: Vec<u8> = (0..16 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();
    for i in 0..10 {
        fs::write(src.path().join(format!("{i:02}.raw")), &payload).unwrap();
    }

    let config = BackupConfig {
        worker_override: 1,
        ..config_for(src.path(), vec![dst.path().to_path_buf()])
    };
    let manager = Arc::new(BackupManager::new(config).unwrap());

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    // Cancel as soon as at least one file has completed the copy pass
    let mut cancelled = false;
    for _ in 0..30_000 {
        let snap = manager.snapshot();
        if snap.destinations[0].files_completed >= 1 {
            manager.cancel();
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(cancelled, "run never completed a first file");

    let outcome = runner.await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);

    let snap = settled(&manager).await;
    let dest = &snap.destinations[0];
    // Every file that finished copying was verified, and only those exist
    assert_eq!(dest.files_verified, dest.files_completed);
    assert!(dest.files_completed < 10);

    let present = destination_files(dst.path());
    assert_eq!(present.len(), dest.files_completed as usize);
    for rel in present {
        let path = dst.path().join(&rel);
        assert!(
            !rel.to_string_lossy().ends_with(".svpart"),
            "partial file left behind: {rel:?}"
        );
        assert_eq!(fs::read(&path).unwrap(), payload, "corrupt file at {rel:?}");
    }
}

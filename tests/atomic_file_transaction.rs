//! Integration Tests for Atomic File Writes and Multi-Op Transactions
//!
//! Exercises the write-then-rename contract and `FileTransaction` rollback
//! across a realistic multi-file batch, plus the crash-between-write-and-
//! rename scenario from spec.md §8.

use conductor::atomic::{write_text, FileTransaction, WriteOptions};
use std::fs;
use tempfile::TempDir;

#[tokio::test]
async fn interrupted_write_never_exposes_a_partial_target() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("state.json");
    fs::write(&target, "original content").unwrap();

    // Simulate a crash between the temp-file write and the rename: a
    // leftover temp file sits next to the target, but the target itself
    // was never touched by the interrupted attempt.
    let stray_temp = dir.path().join(".tmp-state.json.leftover");
    fs::write(&stray_temp, "half-written garbage").unwrap();

    assert_eq!(fs::read_to_string(&target).unwrap(), "original content");

    // A fresh write still succeeds and is fully observable; the stray temp
    // file from the simulated crash is untouched (no reader ever sees it
    // under the target's name).
    write_text(&target, "new content", WriteOptions::default()).await.unwrap();
    assert_eq!(fs::read_to_string(&target).unwrap(), "new content");
    assert_eq!(fs::read_to_string(&stray_temp).unwrap(), "half-written garbage");

    let backup = dir.path().join("state.json.backup");
    assert_eq!(fs::read_to_string(&backup).unwrap(), "original content");
}

#[tokio::test]
async fn multi_op_transaction_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    let report = dir.path().join("report.json");
    let manifest = dir.path().join("manifest.txt");
    fs::write(&manifest, "v1").unwrap();

    let mut tx = FileTransaction::new();
    tx.write(&report, b"{\"status\":\"ok\"}".to_vec());
    tx.copy(&manifest, dir.path().join("manifest.bak"));
    // the source doesn't exist, so this move fails and the whole batch
    // must roll back, including the write and copy queued before it.
    tx.move_file(dir.path().join("no-such-file.txt"), dir.path().join("dest.txt"));

    let result = tx.commit().await;
    assert!(result.is_err());

    assert!(!report.exists(), "write rolled back");
    assert!(!dir.path().join("manifest.bak").exists(), "copy rolled back");
    assert_eq!(fs::read_to_string(&manifest).unwrap(), "v1", "original file untouched");
}

#[tokio::test]
async fn multi_op_transaction_commits_every_operation_together() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("input.txt");
    fs::write(&source, "payload").unwrap();
    let copy_dest = dir.path().join("copy.txt");
    let written = dir.path().join("written.txt");
    let to_delete = dir.path().join("stale.txt");
    fs::write(&to_delete, "stale").unwrap();

    let mut tx = FileTransaction::new();
    tx.copy(&source, &copy_dest);
    tx.write(&written, b"fresh".to_vec());
    tx.delete(&to_delete);

    tx.commit().await.unwrap();

    assert_eq!(fs::read_to_string(&copy_dest).unwrap(), "payload");
    assert_eq!(fs::read_to_string(&written).unwrap(), "fresh");
    assert!(!to_delete.exists());
    assert!(source.exists(), "copy leaves the source in place");
}

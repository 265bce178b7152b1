//! Atomic writer and multi-op file transaction layer (C2).
//!
//! Every write goes through write-temp / sync / (backup) / rename so that a
//! reader never observes a torn file: either the old content or the new
//! content is visible, never a partial prefix of either. Blocking filesystem
//! calls are wrapped in [`tokio::task::spawn_blocking`] so the async caller
//! never stalls its executor thread, mirroring the teacher's session-writer
//! pattern of wrapping `std::fs` in a blocking task.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AtomicWriteError;

/// Streaming chunk size used for payloads above [`STREAM_THRESHOLD_BYTES`].
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// Payloads at or above this size are streamed in [`STREAM_CHUNK_BYTES`]
/// chunks rather than buffered whole in memory.
const STREAM_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Serialization format used for structured payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredFormat {
    /// Compact JSON via `serde_json`.
    Json,
    /// YAML via `serde_yaml`.
    Yaml,
}

/// Options controlling a single atomic write.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Keep the prior file content at `target.backup` before replacing it.
    pub backup: bool,
    /// Re-hash the renamed target and compare against the pre-rename hash.
    pub verify_integrity: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            backup: true,
            verify_integrity: true,
        }
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; STREAM_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn write_bytes_streamed(writer: &mut BufWriter<File>, payload: &[u8]) -> std::io::Result<()> {
    if (payload.len() as u64) < STREAM_THRESHOLD_BYTES {
        writer.write_all(payload)?;
        return Ok(());
    }
    for chunk in payload.chunks(STREAM_CHUNK_BYTES) {
        writer.write_all(chunk)?;
    }
    Ok(())
}

/// Performs the write-temp/backup/rename/verify sequence for raw bytes.
///
/// This is the synchronous core; callers on an async executor should run it
/// inside [`tokio::task::spawn_blocking`] (see [`write_bytes`]).
fn write_bytes_sync(
    target: &Path,
    payload: &[u8],
    opts: &WriteOptions,
) -> Result<(), AtomicWriteError> {
    let io_err = |source: std::io::Error| AtomicWriteError::Io {
        path: target.display().to_string(),
        source,
    };

    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;

    let temp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
    let backup_path = PathBuf::from(format!("{}.backup", target.display()));

    let write_result = (|| -> Result<(), AtomicWriteError> {
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(io_err)?;
            let mut writer = BufWriter::new(file);
            write_bytes_streamed(&mut writer, payload).map_err(io_err)?;
            writer.flush().map_err(io_err)?;
            writer.get_ref().sync_all().map_err(io_err)?;
        }

        let expected_hash = if opts.verify_integrity {
            Some(sha256_file(&temp_path).map_err(io_err)?)
        } else {
            None
        };

        let had_target = target.exists();
        if had_target && opts.backup {
            fs::rename(target, &backup_path).map_err(io_err)?;
        }

        if let Err(source) = fs::rename(&temp_path, target) {
            if had_target && opts.backup && backup_path.exists() {
                let _ = fs::rename(&backup_path, target);
            }
            return Err(io_err(source));
        }

        if let Some(expected) = expected_hash {
            let actual = sha256_file(target).map_err(io_err)?;
            if actual != expected {
                if had_target && opts.backup && backup_path.exists() {
                    let _ = fs::rename(&backup_path, target);
                }
                return Err(AtomicWriteError::Integrity {
                    path: target.display().to_string(),
                    expected,
                    actual,
                });
            }
        }

        Ok(())
    })();

    if temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }

    write_result
}

/// Atomically writes raw bytes to `target`.
pub async fn write_bytes(
    target: impl AsRef<Path>,
    payload: Vec<u8>,
    opts: WriteOptions,
) -> Result<(), AtomicWriteError> {
    let target = target.as_ref().to_path_buf();
    let result = tokio::task::spawn_blocking(move || write_bytes_sync(&target, &payload, &opts))
        .await
        .map_err(|e| AtomicWriteError::Other(anyhow::anyhow!("atomic write task panicked: {e}")))?;
    result
}

/// Atomically writes UTF-8 text to `target`.
pub async fn write_text(
    target: impl AsRef<Path>,
    text: impl Into<String>,
    opts: WriteOptions,
) -> Result<(), AtomicWriteError> {
    write_bytes(target, text.into().into_bytes(), opts).await
}

/// Atomically serializes `value` as JSON or YAML and writes it to `target`.
pub async fn write_structured<T: Serialize>(
    target: impl AsRef<Path>,
    value: &T,
    format: StructuredFormat,
    opts: WriteOptions,
) -> Result<(), AtomicWriteError> {
    let payload = match format {
        StructuredFormat::Json => serde_json::to_vec_pretty(value)
            .map_err(|e| AtomicWriteError::Validation(format!("JSON serialization failed: {e}")))?,
        StructuredFormat::Yaml => serde_yaml::to_string(value)
            .map_err(|e| AtomicWriteError::Validation(format!("YAML serialization failed: {e}")))?
            .into_bytes(),
    };
    write_bytes(target, payload, opts).await
}

/// A single operation recorded for rollback by [`FileTransaction`].
#[derive(Debug, Clone)]
enum RecoveryPoint {
    /// A write replaced (or created) `path`; `had_backup` means a
    /// `path.backup` file was produced and should be restored.
    Write { path: PathBuf, had_backup: bool },
    /// A copy created `destination` from nothing.
    Copy { destination: PathBuf },
    /// A move relocated `source` to `destination`.
    Move { source: PathBuf, destination: PathBuf },
    /// A delete removed `path`, preserved at `path.backup`.
    Delete { path: PathBuf, had_backup: bool },
}

/// One queued operation in a [`FileTransaction`].
enum TxOp {
    Write { target: PathBuf, payload: Vec<u8> },
    Copy { source: PathBuf, destination: PathBuf },
    Move { source: PathBuf, destination: PathBuf },
    Delete { path: PathBuf },
}

/// Batches write/copy/move/delete operations with all-or-nothing semantics.
///
/// On failure, recorded recovery points are replayed in reverse order.
/// Rollback is best-effort: individual restore failures are logged as
/// warnings rather than escalated, since the caller already has the
/// original failure to report.
#[derive(Default)]
pub struct FileTransaction {
    ops: Vec<TxOp>,
}

impl FileTransaction {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an atomic write of `payload` to `target`.
    pub fn write(&mut self, target: impl Into<PathBuf>, payload: Vec<u8>) -> &mut Self {
        self.ops.push(TxOp::Write {
            target: target.into(),
            payload,
        });
        self
    }

    /// Queues a copy from `source` to `destination`.
    pub fn copy(&mut self, source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> &mut Self {
        self.ops.push(TxOp::Copy {
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    /// Queues a move from `source` to `destination`. Cross-filesystem moves
    /// degrade to copy-then-delete.
    pub fn move_file(&mut self, source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> &mut Self {
        self.ops.push(TxOp::Move {
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    /// Queues a delete of `path`.
    pub fn delete(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.ops.push(TxOp::Delete { path: path.into() });
        self
    }

    /// Executes all queued operations. On the first failure, rolls back
    /// everything done so far (best-effort) and returns the failure.
    pub async fn commit(self) -> Result<(), AtomicWriteError> {
        let mut recovery: Vec<RecoveryPoint> = Vec::new();

        for op in self.ops {
            let step = self.execute_step(op, &mut recovery).await;
            if let Err(err) = step {
                Self::rollback(recovery).await;
                return Err(err);
            }
        }

        Ok(())
    }

    async fn execute_step(
        &self,
        op: TxOp,
        recovery: &mut Vec<RecoveryPoint>,
    ) -> Result<(), AtomicWriteError> {
        match op {
            TxOp::Write { target, payload } => {
                let had_backup = target.exists();
                write_bytes(&target, payload, WriteOptions::default()).await?;
                recovery.push(RecoveryPoint::Write {
                    path: target,
                    had_backup,
                });
                Ok(())
            }
            TxOp::Copy { source, destination } => {
                let source2 = source.clone();
                let destination2 = destination.clone();
                tokio::task::spawn_blocking(move || -> Result<(), AtomicWriteError> {
                    if let Some(dir) = destination2.parent() {
                        fs::create_dir_all(dir).map_err(|e| AtomicWriteError::Io {
                            path: destination2.display().to_string(),
                            source: e,
                        })?;
                    }
                    fs::copy(&source2, &destination2).map_err(|e| AtomicWriteError::Io {
                        path: destination2.display().to_string(),
                        source: e,
                    })?;
                    Ok(())
                })
                .await
                .map_err(|e| AtomicWriteError::Other(anyhow::anyhow!("copy task panicked: {e}")))??;
                recovery.push(RecoveryPoint::Copy {
                    destination,
                });
                Ok(())
            }
            TxOp::Move { source, destination } => {
                let source2 = source.clone();
                let destination2 = destination.clone();
                tokio::task::spawn_blocking(move || -> Result<(), AtomicWriteError> {
                    if let Some(dir) = destination2.parent() {
                        fs::create_dir_all(dir).map_err(|e| AtomicWriteError::Io {
                            path: destination2.display().to_string(),
                            source: e,
                        })?;
                    }
                    match fs::rename(&source2, &destination2) {
                        Ok(()) => Ok(()),
                        Err(_) => {
                            // cross-filesystem: degrade to copy + delete
                            fs::copy(&source2, &destination2).map_err(|e| AtomicWriteError::Io {
                                path: destination2.display().to_string(),
                                source: e,
                            })?;
                            fs::remove_file(&source2).map_err(|e| AtomicWriteError::Io {
                                path: source2.display().to_string(),
                                source: e,
                            })?;
                            Ok(())
                        }
                    }
                })
                .await
                .map_err(|e| AtomicWriteError::Other(anyhow::anyhow!("move task panicked: {e}")))??;
                recovery.push(RecoveryPoint::Move { source, destination });
                Ok(())
            }
            TxOp::Delete { path } => {
                let backup_path = PathBuf::from(format!("{}.backup", path.display()));
                let path2 = path.clone();
                let backup2 = backup_path.clone();
                let had_backup = tokio::task::spawn_blocking(move || -> Result<bool, AtomicWriteError> {
                    if !path2.exists() {
                        return Ok(false);
                    }
                    fs::copy(&path2, &backup2).map_err(|e| AtomicWriteError::Io {
                        path: path2.display().to_string(),
                        source: e,
                    })?;
                    fs::remove_file(&path2).map_err(|e| AtomicWriteError::Io {
                        path: path2.display().to_string(),
                        source: e,
                    })?;
                    Ok(true)
                })
                .await
                .map_err(|e| AtomicWriteError::Other(anyhow::anyhow!("delete task panicked: {e}")))??;
                recovery.push(RecoveryPoint::Delete { path, had_backup });
                Ok(())
            }
        }
    }

    async fn rollback(recovery: Vec<RecoveryPoint>) {
        for point in recovery.into_iter().rev() {
            let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                match point {
                    RecoveryPoint::Write { path, had_backup } => {
                        let backup = PathBuf::from(format!("{}.backup", path.display()));
                        if had_backup && backup.exists() {
                            fs::rename(&backup, &path)?;
                        } else {
                            let _ = fs::remove_file(&path);
                        }
                    }
                    RecoveryPoint::Copy { destination } => {
                        let _ = fs::remove_file(&destination);
                    }
                    RecoveryPoint::Move { source, destination } => {
                        if destination.exists() {
                            fs::rename(&destination, &source)?;
                        }
                    }
                    RecoveryPoint::Delete { path, had_backup } => {
                        let backup = PathBuf::from(format!("{}.backup", path.display()));
                        if had_backup && backup.exists() {
                            fs::rename(&backup, &path)?;
                        }
                    }
                }
                Ok(())
            })
            .await;

            if let Err(e) = result {
                warn!("rollback task panicked: {e}");
            } else if let Ok(Err(e)) = result {
                warn!("rollback step failed, filesystem may retain partial state: {e}");
            } else {
                debug!("rollback step applied");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_rename_is_observable() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("report.json");
        write_text(&target, "hello", WriteOptions::default()).await.unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "hello");
    }

    #[tokio::test]
    async fn overwrite_produces_backup() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("report.json");
        write_text(&target, "v1", WriteOptions::default()).await.unwrap();
        write_text(&target, "v2", WriteOptions::default()).await.unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "v2");
        let backup = dir.path().join("report.json.backup");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "v1");
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("report.json");
        write_text(&target, "hello", WriteOptions::default()).await.unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn transaction_rolls_back_writes_on_later_failure() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, "original").unwrap();

        let mut tx = FileTransaction::new();
        tx.write(&a, b"mutated".to_vec());
        tx.delete(dir.path().join("does-not-exist-but-ok"));
        // force a failure: move a nonexistent source to an invalid destination
        tx.move_file(dir.path().join("missing-source.txt"), dir.path().join("dest.txt"));

        let result = tx.commit().await;
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&a).unwrap(), "original");
    }

    #[tokio::test]
    async fn transaction_all_ops_succeed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "payload").unwrap();
        let copy_dest = dir.path().join("copy.txt");
        let new_file = dir.path().join("new.txt");

        let mut tx = FileTransaction::new();
        tx.copy(&src, &copy_dest);
        tx.write(&new_file, b"created".to_vec());

        tx.commit().await.unwrap();
        assert_eq!(fs::read_to_string(&copy_dest).unwrap(), "payload");
        assert_eq!(fs::read_to_string(&new_file).unwrap(), "created");
    }
}

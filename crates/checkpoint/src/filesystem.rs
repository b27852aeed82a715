//! Filesystem-backed checkpoint storage.

use std::path::{Path, PathBuf};

use crate::{Checkpoint, CheckpointError, CheckpointStore};

/// Stores one JSON record per collection in a directory.
///
/// Commit writes `<collection>.json.tmp` and renames it over
/// `<collection>.json`; the rename is atomic on POSIX filesystems, so
/// readers see either the previous or the new record, never a torn one.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FilesystemStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.json"))
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FilesystemStore {
    async fn get(&self, collection: &str) -> Checkpoint {
        let path = self.record_path(collection);
        if !path.exists() {
            return Checkpoint::empty(collection);
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(
                    collection,
                    "unreadable checkpoint at {}, re-scanning from start: {err}",
                    path.display()
                );
                return Checkpoint::empty(collection);
            }
        };

        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                tracing::warn!(
                    collection,
                    "corrupted checkpoint at {}, re-scanning from start: {err}",
                    path.display()
                );
                return Checkpoint::empty(collection);
            }
        };

        if checkpoint.collection != collection {
            tracing::warn!(
                collection,
                found = %checkpoint.collection,
                "checkpoint record names a different collection, re-scanning from start"
            );
            return Checkpoint::empty(collection);
        }

        checkpoint
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.record_path(&checkpoint.collection);
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, serde_json::to_string_pretty(checkpoint)?)?;
        std::fs::rename(&tmp_path, &path)?;

        tracing::debug!(
            collection = %checkpoint.collection,
            "committed checkpoint to {}",
            path.display()
        );
        Ok(())
    }

    async fn reset(&self, collection: &str) -> Result<(), CheckpointError> {
        let path = self.record_path(collection);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(collection, "checkpoint reset");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

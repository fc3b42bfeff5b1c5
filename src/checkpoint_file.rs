//! Local fast-restart cache for `CoordinatorState`: atomic write-then-rename
//! plus a SHA-256 body checksum (spec.md §6 "Checkpoint file format").
//!
//! The database's `sync_checkpoints` row is authoritative; this file only
//! shaves the RPC round trips a cold start would otherwise need to
//! rediscover roughly where to resume (documented open-question decision,
//! see DESIGN.md).

use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::{IndexerError, Result};
use crate::models::CheckpointFile;

const FORMAT_VERSION: u32 = 1;
const KEEP_LAST: usize = 5;

fn checksum_of(file: &CheckpointFile) -> Result<String> {
    let mut unsummed = file.clone();
    unsummed.sha256_checksum = String::new();
    let body = serde_json::to_vec(&unsummed)?;
    let mut hasher = Sha256::new();
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn tmp_path(&self, height: u64) -> PathBuf {
        self.dir.join(format!("tmp.ckp.{height}"))
    }

    fn final_path(&self, height: u64) -> PathBuf {
        self.dir.join(format!("checkpoint.ckp.{height}"))
    }

    /// Writes the checkpoint via temp-file-then-rename so a crash mid-write
    /// never leaves a corrupt file at the canonical path.
    pub async fn write(&self, height: u64, state_snapshot: crate::models::CoordinatorState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| IndexerError::Checkpoint(e.to_string()))?;

        let mut file = CheckpointFile {
            height,
            timestamp: chrono::Utc::now(),
            state_snapshot,
            sha256_checksum: String::new(),
            format_version: FORMAT_VERSION,
        };
        file.sha256_checksum = checksum_of(&file)?;

        let body = serde_json::to_vec_pretty(&file)?;
        let tmp = self.tmp_path(height);
        tokio::fs::write(&tmp, &body).await.map_err(|e| IndexerError::Checkpoint(e.to_string()))?;
        tokio::fs::rename(&tmp, self.final_path(height)).await.map_err(|e| IndexerError::Checkpoint(e.to_string()))?;

        self.prune_old(height).await;
        Ok(())
    }

    async fn prune_old(&self, latest_height: u64) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else { return };
        let mut heights = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(h) = parse_checkpoint_height(&entry.file_name().to_string_lossy()) {
                heights.push(h);
            }
        }
        heights.sort_unstable();
        heights.retain(|h| *h != latest_height);
        if heights.len() + 1 > KEEP_LAST {
            for h in &heights[..heights.len() + 1 - KEEP_LAST] {
                let _ = tokio::fs::remove_file(self.final_path(*h)).await;
            }
        }
    }

    /// Loads the highest-height checkpoint on disk, verifying its checksum
    /// and that the embedded height matches the filename. Returns `None` if
    /// no valid checkpoint exists (a fresh deployment, or all corrupt).
    pub async fn load_latest(&self) -> Result<Option<CheckpointFile>> {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else { return Ok(None) };
        let mut heights = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(h) = parse_checkpoint_height(&entry.file_name().to_string_lossy()) {
                heights.push(h);
            }
        }
        heights.sort_unstable();

        for height in heights.into_iter().rev() {
            match self.load_one(height).await {
                Ok(file) => return Ok(Some(file)),
                Err(e) => tracing::warn!(height, error = %e, "checkpoint file failed validation, trying the next older one"),
            }
        }
        Ok(None)
    }

    async fn load_one(&self, height: u64) -> Result<CheckpointFile> {
        let path = self.final_path(height);
        let body = tokio::fs::read(&path).await.map_err(|e| IndexerError::Checkpoint(e.to_string()))?;
        let file: CheckpointFile = serde_json::from_slice(&body)?;

        if file.height != height {
            return Err(IndexerError::Checkpoint(format!("filename height {height} does not match embedded height {}", file.height)));
        }
        let expected = checksum_of(&file)?;
        if expected != file.sha256_checksum {
            return Err(IndexerError::Checkpoint(format!("checksum mismatch for checkpoint at height {height}")));
        }
        Ok(file)
    }
}

fn parse_checkpoint_height(filename: &str) -> Option<u64> {
    filename.strip_prefix("checkpoint.ckp.").and_then(|h| h.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CoordinatorState;

    #[tokio::test]
    async fn write_then_load_round_trips_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = CoordinatorState { synced_cursor: 500, ..Default::default() };

        store.write(500, state.clone()).await.unwrap();
        let loaded = store.load_latest().await.unwrap().expect("checkpoint present");
        assert_eq!(loaded.height, 500);
        assert_eq!(loaded.state_snapshot.synced_cursor, 500);
    }

    #[tokio::test]
    async fn tampered_body_fails_checksum_and_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.write(100, CoordinatorState::default()).await.unwrap();

        let path = store.final_path(100);
        let mut file: CheckpointFile = serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        file.state_snapshot.synced_cursor = 999999;
        tokio::fs::write(&path, serde_json::to_vec(&file).unwrap()).await.unwrap();

        assert!(store.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn keeps_only_the_last_five_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        for h in 0..8 {
            store.write(h * 100, CoordinatorState::default()).await.unwrap();
        }
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[test]
    fn parses_height_from_canonical_filename() {
        assert_eq!(parse_checkpoint_height("checkpoint.ckp.12345"), Some(12345));
        assert_eq!(parse_checkpoint_height("tmp.ckp.12345"), None);
        assert_eq!(parse_checkpoint_height("garbage"), None);
    }
}

//! Partition checkpoints for chunked steps
//!
//! A checkpoint records how far a chunked step got: the next partition, the
//! next row offset, and the aggregate of everything processed so far. It is
//! only reused for the exact same input, identified by a SHA-256 fingerprint.

use crate::error::{Result, StrataError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub version: u32,
    /// Fingerprint of the params (dataset included) the step ran with
    pub fingerprint: String,
    /// Partitions fully processed and folded into `aggregate`
    pub partitions_completed: usize,
    /// First row of the next partition
    pub next_row: usize,
    /// Partition size in effect when the checkpoint was written
    pub partition_rows: usize,
    pub aggregate: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkCheckpoint {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            fingerprint: fingerprint.into(),
            partitions_completed: 0,
            next_row: 0,
            partition_rows: 0,
            aggregate: None,
            updated_at: Utc::now(),
        }
    }
}

/// SHA-256 of the canonical JSON encoding of `value`
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Where chunk checkpoints live
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<ChunkCheckpoint>>;
    async fn save(&self, key: &str, checkpoint: &ChunkCheckpoint) -> Result<()>;
    async fn clear(&self, key: &str) -> Result<()>;
}

/// One JSON file per key, written through a temp file and an atomic rename
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `a/b` maps to `<root>/a/b-<hash>.json`; anything outside `[A-Za-z0-9_-]`
    /// becomes `_`, and the hash of the raw key keeps distinct keys apart
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        let components: Vec<String> = key
            .split('/')
            .filter(|part| !part.is_empty())
            .map(sanitize)
            .collect();
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        let suffix = &digest[..12];
        match components.split_last() {
            Some((last, dirs)) => {
                for dir in dirs {
                    path.push(dir);
                }
                path.push(format!("{last}-{suffix}.json"));
            }
            None => path.push(format!("_-{suffix}.json")),
        }
        path
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, key: &str) -> Result<Option<ChunkCheckpoint>> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StrataError::checkpoint("Failed to read checkpoint", Some(path))
                    .with_source(e))
            }
        };

        let checkpoint: ChunkCheckpoint = serde_json::from_str(&content).map_err(|e| {
            StrataError::checkpoint("Failed to parse checkpoint", Some(path.clone())).with_source(e)
        })?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(StrataError::checkpoint(
                format!(
                    "Checkpoint version {} is newer than supported version {}",
                    checkpoint.version, CHECKPOINT_VERSION
                ),
                Some(path),
            ));
        }

        Ok(Some(checkpoint))
    }

    async fn save(&self, key: &str, checkpoint: &ChunkCheckpoint) -> Result<()> {
        let path = self.path_for(key);
        let temp_path = path.with_extension("tmp");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StrataError::checkpoint(
                    "Failed to create checkpoint directory",
                    Some(parent.to_path_buf()),
                )
                .with_source(e)
            })?;
        }

        let json = serde_json::to_string_pretty(checkpoint).map_err(|e| {
            StrataError::checkpoint("Failed to serialize checkpoint", Some(path.clone()))
                .with_source(e)
        })?;
        fs::write(&temp_path, json).await.map_err(|e| {
            StrataError::checkpoint("Failed to write checkpoint", Some(temp_path.clone()))
                .with_source(e)
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StrataError::checkpoint("Failed to move checkpoint into place", Some(path.clone()))
                .with_source(e)
        })?;

        debug!(
            "Saved checkpoint {} at partition {}",
            key, checkpoint.partitions_completed
        );
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::checkpoint("Failed to remove checkpoint", Some(path))
                .with_source(e)),
        }
    }
}

/// Process-local store, used in tests and for jobs that do not need to survive a restart
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, ChunkCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &str) -> Result<Option<ChunkCheckpoint>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, checkpoint: &ChunkCheckpoint) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

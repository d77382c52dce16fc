//! Durable watermark checkpoint.
//!
//! The checkpoint is a single JSON object mapping table name to the
//! string-encoded watermark position:
//!
//! ```json
//! {"orders":"1045","events":"20210901103000"}
//! ```
//!
//! Writes go to `<file>.tmp` and are renamed over the checkpoint, so a
//! reader never observes a half-written file. A checkpoint whose content
//! does not parse is moved aside to `<file>.bak.<unix_millis>` and rebuilt
//! from the in-memory watermarks. I/O failures while reading are returned
//! to the caller and leave the file in place.
//!
//! One process owns one checkpoint file; sharing a path between instances
//! is not supported.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::error::{SourceError, SourceResult};
use crate::watermark::TableState;

/// What `load` found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No checkpoint existed; a new one was written from defaults
    Created,
    /// Positions restored for this many configured tables
    Restored(usize),
    /// File was corrupt and moved to the given backup path
    Recovered { backup: PathBuf },
}

pub struct CheckpointStore {
    path: PathBuf,
    /// Last written mapping, including tables no longer configured
    entries: BTreeMap<String, String>,
}

impl CheckpointStore {
    /// Prepare a store at `dir/file_name`, creating `dir` if needed.
    pub async fn open(dir: impl Into<PathBuf>, file_name: &str) -> SourceResult<Self> {
        let dir = dir.into();
        if !fs::try_exists(&dir).await? {
            info!(dir = %dir.display(), "Creating checkpoint directory");
            fs::create_dir_all(&dir).await?;
        }
        Ok(Self {
            path: dir.join(file_name),
            entries: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply stored positions to `tables`.
    ///
    /// Tables without a stored position keep their configured start. Stored
    /// tables that are not configured are ignored but kept in the file.
    pub async fn load(&mut self, tables: &mut [TableState]) -> SourceResult<LoadOutcome> {
        if !fs::try_exists(&self.path).await? {
            info!(path = %self.path.display(), "No checkpoint found, creating from defaults");
            self.save(tables).await?;
            return Ok(LoadOutcome::Created);
        }

        match self.read_positions().await {
            Ok(positions) => {
                let mut restored = 0;
                for table in tables.iter_mut() {
                    if let Some(position) = positions.get(&table.spec.name) {
                        debug!(table = %table.spec.name, position, "Restored watermark");
                        table.watermark.restore(*position);
                        restored += 1;
                    }
                }
                self.entries = positions
                    .into_iter()
                    .map(|(name, position)| (name, position.to_string()))
                    .collect();
                info!(path = %self.path.display(), restored, "Checkpoint loaded");
                Ok(LoadOutcome::Restored(restored))
            }
            Err(e @ (SourceError::Serialization(_) | SourceError::Checkpoint(_))) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "Corrupt checkpoint, backing up and starting from defaults"
                );
                let backup = self.on_corrupt().await?;
                self.entries.clear();
                self.save(tables).await?;
                Ok(LoadOutcome::Recovered { backup })
            }
            Err(e) => Err(e),
        }
    }

    /// Parse the checkpoint file into table → position.
    pub async fn read_positions(&self) -> SourceResult<BTreeMap<String, i64>> {
        read_positions_at(&self.path).await
    }

    /// Persist the positions of `tables`, replacing the whole file.
    pub async fn save(&mut self, tables: &mut [TableState]) -> SourceResult<()> {
        for table in tables.iter_mut() {
            let position = table.watermark.current_position();
            self.entries
                .insert(table.spec.name.clone(), position.to_string());
        }

        let content = serde_json::to_string(&self.entries)?;
        let tmp = tmp_path(&self.path);
        fs::write(&tmp, content.as_bytes()).await.map_err(|e| {
            SourceError::Checkpoint(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            SourceError::Checkpoint(format!("failed to replace {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), tables = self.entries.len(), "Checkpoint saved");
        Ok(())
    }

    /// Move the current file to a unique `<file>.bak.<unix_millis>` path.
    pub async fn on_corrupt(&self) -> SourceResult<PathBuf> {
        let mut millis = Utc::now().timestamp_millis();
        let mut backup = backup_path(&self.path, millis);
        while fs::try_exists(&backup).await? {
            millis += 1;
            backup = backup_path(&self.path, millis);
        }

        fs::rename(&self.path, &backup).await.map_err(|e| {
            SourceError::Checkpoint(format!("failed to back up {}: {}", self.path.display(), e))
        })?;
        warn!(backup = %backup.display(), "Corrupt checkpoint backed up");
        Ok(backup)
    }
}

/// Read a checkpoint file without opening a store, so nothing is created.
pub async fn read_positions_at(path: &Path) -> SourceResult<BTreeMap<String, i64>> {
    let content = fs::read(path).await?;
    parse_positions(&content)
}

fn parse_positions(content: &[u8]) -> SourceResult<BTreeMap<String, i64>> {
    let raw: BTreeMap<String, Value> = serde_json::from_slice(content)?;
    let mut positions = BTreeMap::new();
    for (table, value) in raw {
        let position = match &value {
            Value::Null => continue,
            Value::String(s) if s.trim().is_empty() => continue,
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        };
        let position = position.ok_or_else(|| {
            SourceError::Checkpoint(format!("invalid position for {}: {}", table, value))
        })?;
        positions.insert(table, position);
    }
    Ok(positions)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn backup_path(path: &Path, millis: i64) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".bak.{}", millis));
    PathBuf::from(name)
}

// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Backup and restore history — bounded, newest first
//!
//! Persisted as JSON lists under `<state.dir>/<key>.json`. Appends are
//! load-all, prepend, truncate, save; callers hold the task lock while doing so.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;

pub const BACKUP_HISTORY_KEY: &str = "backup-history";
pub const RESTORE_HISTORY_KEY: &str = "restore-history";
pub const MAX_BACKUP_RECORDS: usize = 100;
pub const MAX_RESTORE_RECORDS: usize = 50;

/// Named JSON lists
pub trait ListStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Vec<Value>>;
    fn save(&self, key: &str, items: &[Value]) -> Result<()>;
}

pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl ListStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Vec<Value>> {
        let path = self.path(key);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(items) => Ok(items),
            Err(e) => {
                warn!("Ignoring unreadable history file {}: {}", path.display(), e);
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, key: &str, items: &[Value]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(items)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub filenames: Vec<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub guest_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub filename: String,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn ListStore>,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn ListStore>) -> Self {
        Self { store }
    }

    pub fn record_backup(&self, record: BackupRecord) -> Result<()> {
        self.prepend(BACKUP_HISTORY_KEY, record, MAX_BACKUP_RECORDS)
    }

    pub fn record_restore(&self, record: RestoreRecord) -> Result<()> {
        self.prepend(RESTORE_HISTORY_KEY, record, MAX_RESTORE_RECORDS)
    }

    pub fn backups(&self) -> Result<Vec<BackupRecord>> {
        self.read(BACKUP_HISTORY_KEY)
    }

    pub fn restores(&self) -> Result<Vec<RestoreRecord>> {
        self.read(RESTORE_HISTORY_KEY)
    }

    fn prepend<T: Serialize>(&self, key: &str, record: T, max: usize) -> Result<()> {
        let mut items = self.store.load(key)?;
        items.insert(0, serde_json::to_value(record)?);
        items.truncate(max);
        self.store.save(key, &items)
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        Ok(self.store.load(key)?
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }
}

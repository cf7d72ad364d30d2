//! Durable per-delegation records as JSON files.
//!
//! One file per delegation under `<base_dir>/delegations/<id>.json`. Writes
//! go through a temp-file rename so a crash never leaves a torn record, and
//! each delegation's file doubles as its write lock: writers serialize per
//! delegation, never globally.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::delegation::DelegationRecord;
use crate::{AwcpError, Result};

/// File-backed store of delegation records.
pub struct DelegationStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DelegationStore {
    /// Open (and create) the store directory.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Store` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|err| AwcpError::Store(format!("cannot create store dir: {err}")))?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Persist a record, atomically replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Store` on serialization or I/O failure.
    pub async fn save(&self, record: &DelegationRecord) -> Result<()> {
        let lock = self.lock_for(&record.id).await;
        let _guard = lock.lock().await;

        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)
            .map_err(|err| AwcpError::Store(format!("record encode: {err}")))?;
        std::fs::write(&tmp, json)
            .map_err(|err| AwcpError::Store(format!("record write: {err}")))?;
        std::fs::rename(&tmp, &path)
            .map_err(|err| AwcpError::Store(format!("record rename: {err}")))?;
        Ok(())
    }

    /// Load a record by id.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::NotFound` if no record exists, or
    /// `AwcpError::Store` if it cannot be parsed.
    pub async fn load(&self, delegation_id: &str) -> Result<DelegationRecord> {
        let lock = self.lock_for(delegation_id).await;
        let _guard = lock.lock().await;

        let path = self.record_path(delegation_id);
        let raw = std::fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AwcpError::NotFound(format!("delegation {delegation_id} not found"))
            } else {
                AwcpError::Store(format!("record read: {err}"))
            }
        })?;
        serde_json::from_slice(&raw)
            .map_err(|err| AwcpError::Store(format!("record decode: {err}")))
    }

    /// List every stored record. Unparseable files are skipped with a
    /// warning so one corrupt record cannot hide the rest.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Store` if the directory cannot be read.
    pub async fn list(&self) -> Result<Vec<DelegationRecord>> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|err| AwcpError::Store(format!("store list: {err}")))?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match std::fs::read(&path).map_err(AwcpError::from).and_then(|raw| {
                serde_json::from_slice::<DelegationRecord>(&raw)
                    .map_err(|err| AwcpError::Store(format!("record decode: {err}")))
            }) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable delegation record");
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Delete a record. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Store` on I/O failure other than absence.
    pub async fn delete(&self, delegation_id: &str) -> Result<()> {
        let lock = self.lock_for(delegation_id).await;
        let _guard = lock.lock().await;

        let path = self.record_path(delegation_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(delegation_id, "delegation record deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AwcpError::Store(format!("record delete: {err}"))),
        }
    }

    fn record_path(&self, delegation_id: &str) -> PathBuf {
        // Ids are generated UUIDs, but a caller-supplied id must still
        // never traverse out of the store directory.
        let safe: String = delegation_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    async fn lock_for(&self, delegation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(delegation_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

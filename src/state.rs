use crate::datetime_utils::now_utc;
use crate::error_utils::{parse_json_with_context, serialize_to_json_with_context};
use crate::post::PostId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("State file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize watch state: {0:#}")]
    Serialize(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub last_seen_id: String,
    /// Unix seconds of the last write
    pub updated_at: i64,
}

/// Per-account high-water marks, persisted as a single JSON document.
///
/// Every change rewrites the whole file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    records: BTreeMap<String, AccountRecord>,
}

impl StateStore {
    /// Load the store. A missing file is an empty store; so is an unreadable one,
    /// with a warning.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(contents) => {
                match parse_json_with_context::<BTreeMap<String, AccountRecord>>(
                    &contents,
                    "watch state",
                ) {
                    Ok(records) => records,
                    Err(e) => {
                        warn!("Ignoring corrupt state file {path}: {e:#}", path = path.display());
                        BTreeMap::new()
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {path}, starting fresh", path = path.display());
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Cannot read state file {path}: {e}", path = path.display());
                BTreeMap::new()
            }
        };

        debug!("Loaded {count} account records", count = records.len());
        Self { path, records }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored high-water mark for an account; unparsable ids count as absent
    pub fn get_last_seen_id(&self, account: &str) -> Option<PostId> {
        let record = self.records.get(account)?;
        match record.last_seen_id.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("@{account}: ignoring stored id {id:?}: {e}", id = record.last_seen_id);
                None
            }
        }
    }

    pub fn set_last_seen_id(&mut self, account: &str, id: &PostId) -> Result<(), PersistenceError> {
        self.records.insert(
            account.to_string(),
            AccountRecord {
                last_seen_id: id.to_string(),
                updated_at: now_utc().timestamp(),
            },
        );
        self.save()
    }

    /// Forget an account; returns whether a record existed
    pub fn remove(&mut self, account: &str) -> Result<bool, PersistenceError> {
        if self.records.remove(account).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    fn save(&self) -> Result<(), PersistenceError> {
        let json = serialize_to_json_with_context(&self.records, "watch state")
            .map_err(PersistenceError::Serialize)?;

        let io_err = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!("Saved watch state to {path}", path = self.path.display());
        Ok(())
    }
}

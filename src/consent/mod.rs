//! Durable storage for the portal restore token.
//!
//! The record is a small JSON document next to the user's config. Writes go
//! through a uniquely named temporary sibling that is synced and then renamed
//! over the target, so a crash mid-write leaves either the old or the new
//! record.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{Capabilities, PersistMode};

/// A consent decision the portal can reapply without showing its dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRecord {
    pub restore_token: String,
    pub granted: Capabilities,
    pub persist_mode: PersistMode,
    pub created_at: DateTime<Utc>,
}

impl ConsentRecord {
    pub fn new(restore_token: String, granted: Capabilities, persist_mode: PersistMode) -> Self {
        Self {
            restore_token,
            granted,
            persist_mode,
            created_at: Utc::now(),
        }
    }
}

/// On-disk shape. Every field is optional so that structurally broken
/// files can be told apart from I/O errors.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(default)]
    granted_capabilities: Vec<String>,
    #[serde(default)]
    restore_token: Option<String>,
    #[serde(default)]
    persist_mode: Option<u32>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl TryFrom<StoredRecord> for ConsentRecord {
    type Error = Error;

    fn try_from(stored: StoredRecord) -> Result<Self> {
        let restore_token = stored
            .restore_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| Error::InvalidConsent("missing restore_token".into()))?;
        let created_at = stored
            .created_at
            .ok_or_else(|| Error::InvalidConsent("missing created_at".into()))?;
        let persist_mode = stored
            .persist_mode
            .map(PersistMode::try_from)
            .transpose()
            .map_err(Error::InvalidConsent)?
            .unwrap_or_default();
        let granted = Capabilities::from_names(&stored.granted_capabilities)?;

        Ok(Self {
            restore_token,
            granted,
            persist_mode,
            created_at,
        })
    }
}

impl From<&ConsentRecord> for StoredRecord {
    fn from(record: &ConsentRecord) -> Self {
        Self {
            granted_capabilities: record.granted.names(),
            restore_token: Some(record.restore_token.clone()),
            persist_mode: Some(record.persist_mode.as_u32()),
            created_at: Some(record.created_at),
        }
    }
}

/// Reads and writes the single consent record at `path`.
#[derive(Debug, Clone)]
pub struct ConsentStore {
    path: PathBuf,
}

impl ConsentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored record, or `None` when there is none or it is unusable.
    pub fn load(&self) -> Option<ConsentRecord> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %self.path.display(), ?err, "Failed to read consent record");
                return None;
            }
        };

        let parsed = serde_json::from_str::<StoredRecord>(&content)
            .map_err(Error::from)
            .and_then(ConsentRecord::try_from);

        match parsed {
            Ok(record) => {
                debug!(
                    path = %self.path.display(),
                    granted = ?record.granted,
                    created_at = %record.created_at,
                    "Loaded consent record"
                );
                Some(record)
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "Ignoring invalid consent record");
                None
            }
        }
    }

    pub fn save(&self, record: &ConsentRecord) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let json = serde_json::to_string_pretty(&StoredRecord::from(record))?;

        // Unique name per writer; dropped unpersisted files remove themselves.
        let mut file = tempfile::NamedTempFile::new_in(parent)?;
        file.write_all(json.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| err.error)?;

        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }

        info!(
            path = %self.path.display(),
            granted = ?record.granted,
            persist_mode = ?record.persist_mode,
            "Saved consent record"
        );
        Ok(())
    }

    /// True iff the record covers every requested capability.
    pub fn is_sufficient(record: &ConsentRecord, requested: Capabilities) -> bool {
        record.granted.contains(requested)
    }

    /// Deletes the record. A missing file is not an error.
    pub fn invalidate(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Invalidated consent record");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

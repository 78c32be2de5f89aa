use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::util::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub remote_key: String,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub state: UploadState,
    #[serde(default)]
    pub synced_from_remote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDoc {
    version: u32,
    last_updated: Option<DateTime<Utc>>,
    // Keyed by content hash: the same bytes under a different filename are
    // still a duplicate.
    entries: BTreeMap<String, RegistryEntry>,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: 1,
            last_updated: None,
            entries: BTreeMap::new(),
        }
    }
}

/// Durable record of what has been synchronized remotely, keyed by content
/// hash. An entry in the `uploaded` state means the remote object is known to
/// exist with exactly that content; the sync engine consults this instead of
/// probing the remote for every file.
#[derive(Debug)]
pub struct UploadRegistry {
    path: PathBuf,
    doc: RegistryDoc,
}

impl UploadRegistry {
    /// Loads the registry, starting fresh (with a warning) when the file is
    /// missing, unreadable, or corrupt: a broken registry must not block
    /// every future sync, it only costs re-uploads.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<RegistryDoc>(&raw) {
                Ok(doc) => {
                    debug!("loaded upload registry with {} entries", doc.entries.len());
                    doc
                }
                Err(e) => {
                    warn!("invalid upload registry {}, starting fresh: {e}", path.display());
                    RegistryDoc::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryDoc::default(),
            Err(e) => {
                warn!("failed to read upload registry {}: {e}", path.display());
                RegistryDoc::default()
            }
        };
        Self { path, doc }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, checksum: &str) -> Option<&RegistryEntry> {
        self.doc.entries.get(checksum)
    }

    pub fn is_uploaded(&self, checksum: &str) -> bool {
        matches!(
            self.lookup(checksum),
            Some(entry) if entry.state == UploadState::Uploaded
        )
    }

    pub fn has_remote_key(&self, remote_key: &str) -> bool {
        self.doc.entries.values().any(|e| e.remote_key == remote_key)
    }

    pub fn len(&self) -> usize {
        self.doc.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.doc.entries.iter()
    }

    /// Idempotent: recording a success for a hash already in the uploaded
    /// state is a no-op.
    pub fn record_success(&mut self, checksum: &str, remote_key: &str) -> Result<()> {
        if self.is_uploaded(checksum) {
            debug!("registry already has a successful upload for {checksum}");
            return Ok(());
        }
        let attempts = self.lookup(checksum).map(|e| e.attempts).unwrap_or(0);
        self.doc.entries.insert(
            checksum.to_string(),
            RegistryEntry {
                remote_key: remote_key.to_string(),
                uploaded_at: Some(Utc::now()),
                attempts: attempts.saturating_add(1),
                last_error: None,
                state: UploadState::Uploaded,
                synced_from_remote: false,
            },
        );
        info!("marked as uploaded: {checksum} -> {remote_key}");
        self.save()
    }

    /// A failure recorded after a prior success never downgrades the entry.
    pub fn record_failure(&mut self, checksum: &str, remote_key: &str, error: &str) -> Result<()> {
        if self.is_uploaded(checksum) {
            debug!("ignoring failure for {checksum}: already uploaded");
            return Ok(());
        }
        let attempts = self.lookup(checksum).map(|e| e.attempts).unwrap_or(0);
        self.doc.entries.insert(
            checksum.to_string(),
            RegistryEntry {
                remote_key: remote_key.to_string(),
                uploaded_at: None,
                attempts: attempts.saturating_add(1),
                last_error: Some(error.to_string()),
                state: UploadState::Failed,
                synced_from_remote: false,
            },
        );
        self.save()
    }

    /// Records an entry reconstructed from a remote listing (registry file
    /// was lost or predates this machine).
    pub fn insert_synced(
        &mut self,
        checksum: &str,
        remote_key: &str,
        uploaded_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if self.doc.entries.contains_key(checksum) {
            return Ok(());
        }
        self.doc.entries.insert(
            checksum.to_string(),
            RegistryEntry {
                remote_key: remote_key.to_string(),
                uploaded_at,
                attempts: 0,
                last_error: None,
                state: UploadState::Uploaded,
                synced_from_remote: true,
            },
        );
        self.save()
    }

    pub fn remove(&mut self, checksum: &str) -> Result<bool> {
        let removed = self.doc.entries.remove(checksum).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn remove_by_remote_key(&mut self, remote_key: &str) -> Result<bool> {
        let keys: Vec<String> = self
            .doc
            .entries
            .iter()
            .filter(|(_, e)| e.remote_key == remote_key)
            .map(|(k, _)| k.clone())
            .collect();
        if keys.is_empty() {
            return Ok(false);
        }
        for k in keys {
            self.doc.entries.remove(&k);
        }
        self.save()?;
        Ok(true)
    }

    fn save(&mut self) -> Result<()> {
        self.doc.last_updated = Some(Utc::now());
        write_json_atomic(&self.path, &self.doc)
    }
}

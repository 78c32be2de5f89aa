use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::metadata::{
    BackupMetadata, SnapshotKind, load_metadata, metadata_path_for, parse_snapshot_filename,
};
use crate::util::{ensure_dir, remove_file_if_exists};

/// One checksummed dump plus its parsed metadata sidecar.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub metadata_path: PathBuf,
    pub metadata: BackupMetadata,
}

impl Snapshot {
    pub fn filename(&self) -> &str {
        self.path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    }

    pub fn kind(&self) -> SnapshotKind {
        self.metadata.kind()
    }

    pub fn checksum(&self) -> &str {
        self.metadata.checksum()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.timestamp()
    }
}

/// Filesystem-backed catalog of local snapshots, one subdirectory per kind.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        for kind in SnapshotKind::ALL {
            ensure_dir(&store.kind_dir(kind))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind_dir(&self, kind: SnapshotKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    /// All snapshots, newest first by embedded metadata timestamp (ties
    /// broken by filename for determinism). Entries with missing or corrupt
    /// metadata are skipped and logged; a file that disappears mid-scan is a
    /// benign race with a concurrent prune, not an error.
    pub fn list(&self, kind: Option<SnapshotKind>) -> Result<Vec<Snapshot>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("snapshot scan entry error (ignored): {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            // Filename convention is the fast path: kind filtering happens
            // before any metadata file is opened.
            let Some(parsed) = parse_snapshot_filename(name) else {
                continue;
            };
            if let Some(want) = kind
                && parsed.kind != want
            {
                continue;
            }

            let dump_path = entry.path().to_path_buf();
            let meta_path = metadata_path_for(&dump_path);
            match load_metadata(&meta_path) {
                Ok(metadata) => out.push(Snapshot {
                    path: dump_path,
                    metadata_path: meta_path,
                    metadata,
                }),
                Err(e) => {
                    warn!("skipping snapshot {}: {e}", dump_path.display());
                }
            }
        }

        out.sort_by(|a, b| {
            b.timestamp()
                .cmp(&a.timestamp())
                .then_with(|| a.filename().cmp(b.filename()))
        });
        Ok(out)
    }

    pub fn latest(&self, kind: SnapshotKind) -> Result<Option<Snapshot>> {
        Ok(self.list(Some(kind))?.into_iter().next())
    }

    /// Loads a snapshot from an explicit dump path (used by `restore` and
    /// `upload --file`).
    pub fn load(&self, dump_path: &Path) -> Result<Snapshot> {
        if !dump_path.is_file() {
            return Err(Error::not_found(format!(
                "backup file not found: {}",
                dump_path.display()
            )));
        }
        let meta_path = metadata_path_for(dump_path);
        let metadata = load_metadata(&meta_path)?;
        Ok(Snapshot {
            path: dump_path.to_path_buf(),
            metadata_path: meta_path,
            metadata,
        })
    }

    /// Removes the data file first, then the metadata file, so a mid-failure
    /// leaves an orphaned data file rather than metadata pointing at nothing.
    pub fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        remove_file_if_exists(&snapshot.path)?;
        remove_file_if_exists(&snapshot.metadata_path)?;
        debug!("deleted snapshot {}", snapshot.filename());
        Ok(())
    }
}

// Writes snapshot fixtures straight to disk for tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn write_fixture(
    store: &SnapshotStore,
    kind: SnapshotKind,
    timestamp: DateTime<Utc>,
    base: &str,
    body: &[u8],
) -> Snapshot {
    use crate::metadata::{BackupInfo, MigrationInfo, save_metadata, snapshot_file_names};

    let (dump_name, json_name) = snapshot_file_names(base, kind, 7, timestamp);
    let dir = store.kind_dir(kind);
    let dump_path = dir.join(&dump_name);
    std::fs::write(&dump_path, body).expect("write fixture dump");
    let metadata = BackupMetadata {
        backup_info: BackupInfo {
            timestamp,
            kind,
            database: "app".into(),
            filename: dump_name,
            size_bytes: body.len() as u64,
            checksum_sha256: crate::checksum::sha256_file(&dump_path).expect("hash fixture"),
            compression_level: 9,
            tool_exit_status: 0,
        },
        migration_info: MigrationInfo {
            version: 7,
            dirty: false,
        },
        table_counts: Default::default(),
        enum_types: Vec::new(),
        foreign_keys: Vec::new(),
    };
    let meta_path = dir.join(json_name);
    save_metadata(&meta_path, &metadata).expect("write fixture metadata");
    Snapshot {
        path: dump_path,
        metadata_path: meta_path,
        metadata,
    }
}

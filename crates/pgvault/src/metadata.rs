use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::write_json_atomic;

pub const DUMP_EXT: &str = "dump";
pub const METADATA_EXT: &str = "json";

const FILENAME_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Daily,
    Weekly,
    Manual,
}

impl SnapshotKind {
    pub const ALL: [SnapshotKind; 3] =
        [SnapshotKind::Daily, SnapshotKind::Weekly, SnapshotKind::Manual];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Daily => "daily",
            SnapshotKind::Weekly => "weekly",
            SnapshotKind::Manual => "manual",
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SnapshotKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "daily" => Ok(SnapshotKind::Daily),
            "weekly" => Ok(SnapshotKind::Weekly),
            "manual" => Ok(SnapshotKind::Manual),
            other => Err(Error::parse(format!("invalid snapshot kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: SnapshotKind,
    pub database: String,
    pub filename: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
    #[serde(default)]
    pub compression_level: u8,
    #[serde(default)]
    pub tool_exit_status: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: i64,
    pub dirty: bool,
}

/// Sidecar document stored next to each dump file. Immutable once written:
/// if it must change it is rewritten wholesale through the atomic writer,
/// never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_info: BackupInfo,
    #[serde(default)]
    pub migration_info: MigrationInfo,
    #[serde(default)]
    pub table_counts: BTreeMap<String, i64>,
    #[serde(default)]
    pub enum_types: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<String>,
}

impl BackupMetadata {
    pub fn checksum(&self) -> &str {
        &self.backup_info.checksum_sha256
    }

    pub fn kind(&self) -> SnapshotKind {
        self.backup_info.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.backup_info.timestamp
    }
}

/// Builds the paired dump/metadata file names:
/// `{base}_{YYYYmmdd_HHMMSS}_v{migration_version}_{kind}.dump` / `.json`.
/// The name encodes kind, timestamp, and schema version so listings can
/// filter without opening metadata; metadata stays authoritative.
pub fn snapshot_file_names(
    base: &str,
    kind: SnapshotKind,
    migration_version: i64,
    timestamp: DateTime<Utc>,
) -> (String, String) {
    let stem = format!(
        "{}_{}_v{}_{}",
        base,
        timestamp.format(FILENAME_TS_FORMAT),
        migration_version,
        kind.as_str()
    );
    (format!("{stem}.{DUMP_EXT}"), format!("{stem}.{METADATA_EXT}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSnapshotName {
    pub base: String,
    pub timestamp: DateTime<Utc>,
    pub migration_version: i64,
    pub kind: SnapshotKind,
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<base>.+)_(?P<ts>\d{8}_\d{6})_v(?P<ver>\d+)_(?P<kind>daily|weekly|manual)\.dump$",
        )
        .expect("snapshot name regex")
    })
}

/// Fast-path parse of a dump filename. Returns `None` for names that do not
/// follow the convention; such files are simply not snapshots.
pub fn parse_snapshot_filename(name: &str) -> Option<ParsedSnapshotName> {
    let caps = name_regex().captures(name)?;
    let ts = NaiveDateTime::parse_from_str(&caps["ts"], FILENAME_TS_FORMAT).ok()?;
    Some(ParsedSnapshotName {
        base: caps["base"].to_string(),
        timestamp: ts.and_utc(),
        migration_version: caps["ver"].parse().ok()?,
        kind: caps["kind"].parse().ok()?,
    })
}

pub fn metadata_path_for(dump_path: &Path) -> std::path::PathBuf {
    dump_path.with_extension(METADATA_EXT)
}

pub fn save_metadata(path: &Path, metadata: &BackupMetadata) -> Result<()> {
    write_json_atomic(path, metadata)
        .map_err(|e| Error::io(format!("failed to write metadata {}: {e}", path.display())))
}

pub fn load_metadata(path: &Path) -> Result<BackupMetadata> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read metadata {}: {e}", path.display())))?;
    serde_json::from_str::<BackupMetadata>(&raw)
        .map_err(|e| Error::parse(format!("invalid metadata {}: {e}", path.display())))
}

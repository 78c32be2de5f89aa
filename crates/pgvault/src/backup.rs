use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::checksum::sha256_file;
use crate::config::{Config, PostgresConfig};
use crate::error::{Error, Result};
use crate::metadata::{
    BackupInfo, BackupMetadata, MigrationInfo, SnapshotKind, save_metadata, snapshot_file_names,
};
use crate::store::{Snapshot, SnapshotStore};
use crate::tools::DatabaseTools;
use crate::util::remove_file_if_exists;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackupPhase {
    Starting,
    Dumping,
    Verifying,
    MetadataWritten,
    Complete,
}

impl BackupPhase {
    fn as_str(&self) -> &'static str {
        match self {
            BackupPhase::Starting => "starting",
            BackupPhase::Dumping => "dumping",
            BackupPhase::Verifying => "verifying",
            BackupPhase::MetadataWritten => "metadata_written",
            BackupPhase::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub base_name: String,
    pub compression_level: u8,
    pub tool_timeout: Duration,
}

impl BackupOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_name: config.base_name.clone(),
            compression_level: config.compression_level,
            tool_timeout: config.tool_timeout,
        }
    }
}

/// Drives the external dump tool and turns its output into a store-visible
/// snapshot: dump to a temporary name, fsync, rename into place, checksum the
/// renamed file, then write metadata. A reader of the store never observes a
/// snapshot without a checksum-verified data file and matching metadata.
pub struct BackupEngine<'a, T: DatabaseTools> {
    tools: &'a T,
    store: &'a SnapshotStore,
    conn: &'a PostgresConfig,
    opts: BackupOptions,
}

impl<'a, T: DatabaseTools> BackupEngine<'a, T> {
    pub fn new(
        tools: &'a T,
        store: &'a SnapshotStore,
        conn: &'a PostgresConfig,
        opts: BackupOptions,
    ) -> Self {
        Self {
            tools,
            store,
            conn,
            opts,
        }
    }

    pub fn create(&self, kind: SnapshotKind) -> Result<Snapshot> {
        let mut phase = BackupPhase::Starting;
        debug!("backup phase: {}", phase.as_str());
        info!(
            "creating {} backup for database {}",
            kind, self.conn.database
        );

        // Provenance is captured before the dump so metadata describes the
        // state the dump was taken from.
        let migration_info = self.migration_info();
        let table_counts = self.table_counts();
        let enum_types = self.enum_types();
        let foreign_keys = self.foreign_keys();

        let timestamp = Utc::now();
        let (dump_name, json_name) = snapshot_file_names(
            &self.opts.base_name,
            kind,
            migration_info.version,
            timestamp,
        );
        let dir = self.store.kind_dir(kind);
        let final_path = dir.join(&dump_name);
        let metadata_path = dir.join(&json_name);
        let tmp_path = dir.join(format!(".{}.tmp.{}", dump_name, std::process::id()));

        phase = BackupPhase::Dumping;
        debug!("backup phase: {}", phase.as_str());
        if let Err(e) = self.tools.dump(
            self.conn,
            &tmp_path,
            self.opts.compression_level,
            self.opts.tool_timeout,
        ) {
            let _ = remove_file_if_exists(&tmp_path);
            return Err(e);
        }
        if !tmp_path.is_file() {
            return Err(Error::dump_tool(format!(
                "dump tool reported success but produced no file at {}",
                tmp_path.display()
            )));
        }

        // Flush to disk before the rename makes the snapshot observable.
        if let Err(e) = fs::File::open(&tmp_path).and_then(|f| f.sync_all()) {
            let _ = remove_file_if_exists(&tmp_path);
            return Err(Error::io(format!(
                "failed to sync {}: {e}",
                tmp_path.display()
            )));
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = remove_file_if_exists(&tmp_path);
            return Err(Error::io(format!(
                "failed to rename {} -> {}: {e}",
                tmp_path.display(),
                final_path.display()
            )));
        }

        phase = BackupPhase::Verifying;
        debug!("backup phase: {}", phase.as_str());
        let checksum = match sha256_file(&final_path) {
            Ok(c) => c,
            Err(e) => {
                let _ = remove_file_if_exists(&final_path);
                return Err(e);
            }
        };
        let size_bytes = fs::metadata(&final_path)
            .map(|m| m.len())
            .map_err(|e| Error::io(format!("failed to stat {}: {e}", final_path.display())))?;

        let metadata = BackupMetadata {
            backup_info: BackupInfo {
                timestamp,
                kind,
                database: self.conn.database.clone(),
                filename: dump_name.clone(),
                size_bytes,
                checksum_sha256: checksum,
                compression_level: self.opts.compression_level,
                tool_exit_status: 0,
            },
            migration_info,
            table_counts,
            enum_types,
            foreign_keys,
        };

        phase = BackupPhase::MetadataWritten;
        debug!("backup phase: {}", phase.as_str());
        if let Err(e) = save_metadata(&metadata_path, &metadata) {
            // Without metadata the data file is invisible to the store;
            // remove it rather than leave an orphan behind a failed run.
            let _ = remove_file_if_exists(&final_path);
            return Err(e);
        }

        phase = BackupPhase::Complete;
        debug!("backup phase: {}", phase.as_str());
        info!(
            "backup complete: {} ({} bytes, migration v{})",
            dump_name, size_bytes, metadata.migration_info.version
        );
        Ok(Snapshot {
            path: final_path,
            metadata_path,
            metadata,
        })
    }

    fn migration_info(&self) -> MigrationInfo {
        let sql = "SELECT version, dirty FROM schema_migrations LIMIT 1;";
        match self.tools.query(self.conn, sql) {
            Ok(out) => {
                let line = out.trim();
                if let Some((version, dirty)) = line.split_once('|')
                    && let Ok(version) = version.trim().parse::<i64>()
                {
                    return MigrationInfo {
                        version,
                        dirty: matches!(dirty.trim(), "t" | "true" | "1"),
                    };
                }
                warn!("no migration info found, using default");
                MigrationInfo::default()
            }
            Err(e) => {
                warn!("failed to read migration info: {e}, using default");
                MigrationInfo::default()
            }
        }
    }

    fn discovered_tables(&self) -> Vec<String> {
        let sql = "SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename;";
        match self.tools.query(self.conn, sql) {
            Ok(out) => lines_of(&out),
            Err(e) => {
                warn!("failed to list tables: {e}");
                Vec::new()
            }
        }
    }

    fn table_counts(&self) -> BTreeMap<String, i64> {
        let mut counts = BTreeMap::new();
        for table in self.discovered_tables() {
            let sql = format!("SELECT COUNT(*) FROM \"{table}\";");
            match self.tools.query(self.conn, &sql) {
                Ok(out) => {
                    if let Ok(count) = out.trim().parse::<i64>() {
                        counts.insert(table, count);
                    }
                }
                Err(e) => debug!("could not count rows in {table}: {e}"),
            }
        }
        counts
    }

    fn enum_types(&self) -> Vec<String> {
        let sql = "SELECT typname FROM pg_type WHERE typtype = 'e' ORDER BY typname;";
        match self.tools.query(self.conn, sql) {
            Ok(out) => lines_of(&out),
            Err(e) => {
                warn!("failed to list enum types: {e}");
                Vec::new()
            }
        }
    }

    fn foreign_keys(&self) -> Vec<String> {
        let sql = "SELECT constraint_name FROM information_schema.table_constraints \
                   WHERE constraint_type = 'FOREIGN KEY' AND table_schema = 'public' \
                   ORDER BY constraint_name;";
        match self.tools.query(self.conn, sql) {
            Ok(out) => lines_of(&out),
            Err(e) => {
                warn!("failed to list foreign keys: {e}");
                Vec::new()
            }
        }
    }
}

fn lines_of(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

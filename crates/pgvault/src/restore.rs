use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{Config, PostgresConfig};
use crate::error::{Error, Result};
use crate::metadata::BackupMetadata;
use crate::tools::DatabaseTools;

const READY_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

const DROP_SCHEMA_SQL: &str = "DROP SCHEMA public CASCADE; CREATE SCHEMA public; \
     GRANT ALL ON SCHEMA public TO current_user; GRANT ALL ON SCHEMA public TO public;";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestorePhase {
    Restoring,
    Validating,
    Reported,
    RestoreFailed,
}

impl RestorePhase {
    fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Restoring => "restoring",
            RestorePhase::Validating => "validating",
            RestorePhase::Reported => "reported",
            RestorePhase::RestoreFailed => "restore_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub skipped: bool,
    pub detail: String,
}

impl CheckResult {
    fn passed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            skipped: false,
            detail: detail.into(),
        }
    }

    fn failed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            skipped: false,
            detail: detail.into(),
        }
    }

    fn skipped(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            skipped: true,
            detail: detail.into(),
        }
    }
}

/// Persisted artifact of one restore attempt. Written exactly once per
/// invocation; a later attempt gets a fresh file and never mutates this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub timestamp: DateTime<Utc>,
    pub backup_file: String,
    pub database: String,
    pub restore_success: bool,
    pub restore_duration_seconds: f64,
    pub validation_passed: bool,
    pub validation_errors: Vec<String>,
    pub error: Option<String>,
    pub checks: Vec<CheckResult>,
}

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    pub tool_timeout: Duration,
    pub health_check_url: Option<String>,
}

impl RestoreSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tool_timeout: config.tool_timeout,
            health_check_url: config.health_check_url.clone(),
        }
    }
}

/// Restores a snapshot into the connected instance and runs nine independent
/// structural checks against the result. The target connection must point at
/// an isolated instance; this engine does not enforce that isolation.
pub struct RestoreEngine<'a, T: DatabaseTools> {
    tools: &'a T,
    conn: &'a PostgresConfig,
    settings: RestoreSettings,
}

impl<'a, T: DatabaseTools> RestoreEngine<'a, T> {
    pub fn new(tools: &'a T, conn: &'a PostgresConfig, settings: RestoreSettings) -> Self {
        Self {
            tools,
            conn,
            settings,
        }
    }

    /// Runs the restore and, when it succeeds, the full validation battery.
    /// Always produces a report; a failed restore skips validation entirely.
    pub fn run(
        &self,
        backup_path: &Path,
        metadata: Option<&BackupMetadata>,
        drop_schema: bool,
    ) -> ValidationReport {
        let started = Instant::now();
        let timestamp = Utc::now();
        let mut phase = RestorePhase::Restoring;
        debug!("restore phase: {}", phase.as_str());
        info!("starting restore from {}", backup_path.display());

        if let Err(e) = self.restore_step(backup_path, drop_schema) {
            phase = RestorePhase::RestoreFailed;
            debug!("restore phase: {}", phase.as_str());
            error!("restore failed: {e}");
            return ValidationReport {
                timestamp,
                backup_file: backup_path.display().to_string(),
                database: self.conn.database.clone(),
                restore_success: false,
                restore_duration_seconds: started.elapsed().as_secs_f64(),
                validation_passed: false,
                validation_errors: vec![e.to_string()],
                error: Some(e.to_string()),
                checks: Vec::new(),
            };
        }

        phase = RestorePhase::Validating;
        debug!("restore phase: {}", phase.as_str());
        let checks = self.run_checks(metadata);
        let validation_passed = checks.iter().filter(|c| !c.skipped).all(|c| c.passed);
        let validation_errors = checks
            .iter()
            .filter(|c| !c.passed && !c.skipped)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect();

        phase = RestorePhase::Reported;
        debug!("restore phase: {}", phase.as_str());
        info!(
            "restore completed in {:.2}s, validation {}",
            started.elapsed().as_secs_f64(),
            if validation_passed { "passed" } else { "failed" }
        );
        ValidationReport {
            timestamp,
            backup_file: backup_path.display().to_string(),
            database: self.conn.database.clone(),
            restore_success: true,
            restore_duration_seconds: started.elapsed().as_secs_f64(),
            validation_passed,
            validation_errors,
            error: None,
            checks,
        }
    }

    fn restore_step(&self, backup_path: &Path, drop_schema: bool) -> Result<()> {
        if !backup_path.is_file() {
            return Err(Error::not_found(format!(
                "backup file not found: {}",
                backup_path.display()
            )));
        }
        self.tools.verify_archive(backup_path)?;
        self.tools.wait_ready(self.conn, READY_TIMEOUT)?;
        if drop_schema {
            if let Err(e) = self.tools.query(self.conn, DROP_SCHEMA_SQL) {
                warn!("could not drop schema before restore: {e}");
            }
        }
        self.tools
            .restore(self.conn, backup_path, self.settings.tool_timeout)
    }

    // The nine checks are order-independent; none short-circuits the rest,
    // and a check whose own query errors is recorded as failed rather than
    // aborting the battery.
    fn run_checks(&self, metadata: Option<&BackupMetadata>) -> Vec<CheckResult> {
        vec![
            self.check_migration_version(metadata),
            self.check_migration_dirty(),
            self.check_tables_exist(metadata),
            self.check_enums_exist(metadata),
            self.check_indexes(),
            self.check_foreign_keys(metadata),
            self.check_row_counts(metadata),
            self.check_health_endpoint(),
            self.check_orphans(),
        ]
    }

    fn check_migration_version(&self, metadata: Option<&BackupMetadata>) -> CheckResult {
        const NAME: &str = "Migration Version";
        let out = match self
            .tools
            .query(self.conn, "SELECT version FROM schema_migrations LIMIT 1;")
        {
            Ok(out) => out,
            Err(e) => return CheckResult::failed(NAME, format!("failed to check: {e}")),
        };
        let Ok(version) = out.trim().parse::<i64>() else {
            return CheckResult::failed(NAME, "no migration version found");
        };
        match metadata {
            Some(m) if m.migration_info.version == version => CheckResult::passed(
                NAME,
                format!("version {version} matches expected"),
            ),
            Some(m) => CheckResult::failed(
                NAME,
                format!(
                    "version {version} does not match expected {}",
                    m.migration_info.version
                ),
            ),
            None => CheckResult::skipped(NAME, format!("version {version} (no metadata to compare)")),
        }
    }

    fn check_migration_dirty(&self) -> CheckResult {
        const NAME: &str = "Migration Dirty Flag";
        let out = match self
            .tools
            .query(self.conn, "SELECT dirty FROM schema_migrations LIMIT 1;")
        {
            Ok(out) => out,
            Err(e) => return CheckResult::failed(NAME, format!("failed to check: {e}")),
        };
        match out.trim() {
            "" => CheckResult::failed(NAME, "could not determine dirty status"),
            "t" | "true" | "1" => {
                CheckResult::failed(NAME, "migration is dirty - pending migrations")
            }
            _ => CheckResult::passed(NAME, "migration is clean"),
        }
    }

    fn check_tables_exist(&self, metadata: Option<&BackupMetadata>) -> CheckResult {
        const NAME: &str = "Tables Exist";
        let expected: Vec<&str> = metadata
            .map(|m| m.table_counts.keys().map(String::as_str).collect())
            .unwrap_or_default();
        if expected.is_empty() {
            return CheckResult::skipped(NAME, "no tables recorded in metadata");
        }
        let present = match self.query_names(
            "SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename;",
        ) {
            Ok(names) => names,
            Err(e) => return CheckResult::failed(NAME, format!("failed to check: {e}")),
        };
        let missing: Vec<&&str> = expected.iter().filter(|t| !present.contains(**t)).collect();
        if missing.is_empty() {
            CheckResult::passed(
                NAME,
                format!("all {} expected tables present", expected.len()),
            )
        } else {
            CheckResult::failed(NAME, format!("missing tables: {missing:?}"))
        }
    }

    fn check_enums_exist(&self, metadata: Option<&BackupMetadata>) -> CheckResult {
        const NAME: &str = "ENUM Types Exist";
        let expected: Vec<&str> = metadata
            .map(|m| m.enum_types.iter().map(String::as_str).collect())
            .unwrap_or_default();
        if expected.is_empty() {
            return CheckResult::skipped(NAME, "no enum types recorded in metadata");
        }
        let present = match self
            .query_names("SELECT typname FROM pg_type WHERE typtype = 'e' ORDER BY typname;")
        {
            Ok(names) => names,
            Err(e) => return CheckResult::failed(NAME, format!("failed to check: {e}")),
        };
        let missing: Vec<&&str> = expected.iter().filter(|t| !present.contains(**t)).collect();
        if missing.is_empty() {
            CheckResult::passed(
                NAME,
                format!("all {} expected enum types present", expected.len()),
            )
        } else {
            CheckResult::failed(NAME, format!("missing enum types: {missing:?}"))
        }
    }

    fn check_indexes(&self) -> CheckResult {
        const NAME: &str = "Indexes Present";
        match self.query_count("SELECT COUNT(*) FROM pg_indexes WHERE schemaname = 'public';") {
            Ok(count) if count > 0 => {
                CheckResult::passed(NAME, format!("found {count} indexes in database"))
            }
            Ok(_) => CheckResult::failed(NAME, "no indexes found in restored schema"),
            Err(e) => CheckResult::failed(NAME, format!("failed to check: {e}")),
        }
    }

    fn check_foreign_keys(&self, metadata: Option<&BackupMetadata>) -> CheckResult {
        const NAME: &str = "Foreign Keys Present";
        let expected: Vec<&str> = metadata
            .map(|m| m.foreign_keys.iter().map(String::as_str).collect())
            .unwrap_or_default();
        if expected.is_empty() {
            return CheckResult::skipped(NAME, "no foreign keys recorded in metadata");
        }
        let present = match self.query_names(
            "SELECT constraint_name FROM information_schema.table_constraints \
             WHERE constraint_type = 'FOREIGN KEY' AND table_schema = 'public' \
             ORDER BY constraint_name;",
        ) {
            Ok(names) => names,
            Err(e) => return CheckResult::failed(NAME, format!("failed to check: {e}")),
        };
        let missing: Vec<&&str> = expected.iter().filter(|c| !present.contains(**c)).collect();
        if missing.is_empty() {
            CheckResult::passed(
                NAME,
                format!("all {} expected foreign keys present", expected.len()),
            )
        } else {
            CheckResult::failed(NAME, format!("missing foreign keys: {missing:?}"))
        }
    }

    fn check_row_counts(&self, metadata: Option<&BackupMetadata>) -> CheckResult {
        const NAME: &str = "Row Counts Match";
        let Some(counts) = metadata.map(|m| &m.table_counts).filter(|c| !c.is_empty()) else {
            return CheckResult::skipped(NAME, "no row counts recorded in metadata");
        };
        let mut mismatches = Vec::new();
        for (table, expected) in counts {
            match self.query_count(&format!("SELECT COUNT(*) FROM \"{table}\";")) {
                Ok(actual) if actual == *expected => {}
                Ok(actual) => mismatches.push(format!("{table}: expected {expected}, got {actual}")),
                Err(e) => mismatches.push(format!("{table}: count query failed: {e}")),
            }
        }
        if mismatches.is_empty() {
            CheckResult::passed(NAME, format!("all {} row counts match metadata", counts.len()))
        } else {
            CheckResult::failed(NAME, format!("row count mismatches: {}", mismatches.join("; ")))
        }
    }

    fn check_health_endpoint(&self) -> CheckResult {
        const NAME: &str = "API Health";
        let Some(url) = self.settings.health_check_url.as_deref() else {
            return CheckResult::skipped(NAME, "health endpoint not configured");
        };
        let client = match reqwest::blocking::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(e) => return CheckResult::failed(NAME, format!("failed to build client: {e}")),
        };
        match client.get(url).send() {
            Ok(res) if res.status().is_success() => {
                CheckResult::passed(NAME, format!("health endpoint responded {}", res.status()))
            }
            Ok(res) => CheckResult::failed(
                NAME,
                format!("health endpoint responded {}", res.status()),
            ),
            Err(e) => CheckResult::failed(NAME, format!("health endpoint unreachable: {e}")),
        }
    }

    // Scans every foreign-key relationship discovered from the restored
    // schema itself for child rows whose parent is gone.
    fn check_orphans(&self) -> CheckResult {
        const NAME: &str = "Orphaned Records";
        let sql = "SELECT tc.table_name, kcu.column_name, ccu.table_name, ccu.column_name \
                   FROM information_schema.table_constraints tc \
                   JOIN information_schema.key_column_usage kcu \
                     ON tc.constraint_name = kcu.constraint_name \
                    AND tc.table_schema = kcu.table_schema \
                   JOIN information_schema.constraint_column_usage ccu \
                     ON tc.constraint_name = ccu.constraint_name \
                    AND tc.table_schema = ccu.table_schema \
                   WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public';";
        let out = match self.tools.query(self.conn, sql) {
            Ok(out) => out,
            Err(e) => return CheckResult::failed(NAME, format!("failed to check: {e}")),
        };

        let mut scanned = 0usize;
        let mut findings = Vec::new();
        for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let parts: Vec<&str> = line.split('|').map(str::trim).collect();
            let [child, column, parent, parent_column] = parts.as_slice() else {
                continue;
            };
            scanned += 1;
            let count_sql = format!(
                "SELECT COUNT(*) FROM \"{child}\" c WHERE c.\"{column}\" IS NOT NULL \
                 AND NOT EXISTS (SELECT 1 FROM \"{parent}\" p \
                 WHERE p.\"{parent_column}\" = c.\"{column}\");"
            );
            match self.query_count(&count_sql) {
                Ok(0) => {}
                Ok(orphans) => findings.push(format!(
                    "{child}.{column} -> {parent}.{parent_column}: {orphans} orphans"
                )),
                Err(e) => findings.push(format!(
                    "{child}.{column} -> {parent}.{parent_column}: scan failed: {e}"
                )),
            }
        }
        if findings.is_empty() {
            CheckResult::passed(
                NAME,
                format!("no orphaned records across {scanned} foreign keys"),
            )
        } else {
            CheckResult::failed(NAME, format!("orphaned records: {}", findings.join("; ")))
        }
    }

    fn query_names(&self, sql: &str) -> Result<BTreeSet<String>> {
        let out = self.tools.query(self.conn, sql)?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn query_count(&self, sql: &str) -> Result<i64> {
        let out = self.tools.query(self.conn, sql)?;
        out.trim()
            .parse::<i64>()
            .map_err(|_| Error::parse(format!("expected a count, got '{}'", out.trim())))
    }
}

pub fn default_report_path(report_dir: &Path, timestamp: DateTime<Utc>) -> PathBuf {
    report_dir.join(format!(
        "validation_{}.json",
        timestamp.format("%Y%m%d_%H%M%S")
    ))
}

/// Writes the report exactly once: an existing file at `path` is refused,
/// never appended to or overwritten.
pub fn write_report(report: &ValidationReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        crate::util::ensure_dir(parent)?;
    }
    let body = serde_json::to_string_pretty(report)
        .map_err(|e| Error::parse(format!("failed to encode validation report: {e}")))?;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => Error::io(format!(
                "validation report already exists, refusing to overwrite: {}",
                path.display()
            )),
            _ => Error::io(format!("failed to create report {}: {e}", path.display())),
        })?;
    file.write_all(body.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|e| Error::io(format!("failed to write report {}: {e}", path.display())))?;
    info!("validation report written to {}", path.display());
    Ok(())
}

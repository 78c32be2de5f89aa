use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::PostgresConfig;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const QUERY_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Captured result of one bounded subprocess run.
#[derive(Debug)]
pub struct Captured {
    pub code: i32,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == 0
    }
}

/// Runs a command with piped output and a hard deadline. On timeout the child
/// is killed and the result reports `timed_out`; callers treat that exactly
/// like a non-zero exit.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Captured> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::io(format!("failed to spawn {:?}: {e}", cmd.get_program())))?;

    // Drain both pipes on threads so a chatty child never blocks on a full
    // pipe buffer while we wait on it.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_handle = std::thread::spawn(move || read_all(stdout));
    let err_handle = std::thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    let _ = child.kill();
                    break child
                        .wait()
                        .map_err(|e| Error::io(format!("wait failed: {e}")))?;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(Error::io(format!("wait failed: {e}"))),
        }
    };

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();
    Ok(Captured {
        code: status.code().unwrap_or(-1),
        timed_out,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn read_all<R: Read>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        let _ = r.read_to_end(&mut buf);
    }
    buf
}

/// Best diagnostic line for a failed command: stderr, then stdout, then the
/// bare status.
pub(crate) fn command_summary(out: &Captured) -> String {
    if out.timed_out {
        return "timed out".to_string();
    }
    let stderr = out.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = out.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("status {}", out.code)
}

pub(crate) fn is_not_found_text(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("not found")
        || m.contains("404")
        || m.contains("no such")
        || m.contains("does not exist")
        || m.contains("no url") // gsutil phrasing for missing objects
}

/// The dump/restore/query executables, kept behind a trait so the engines
/// can be exercised against scripted implementations in tests.
pub trait DatabaseTools {
    /// Writes a compressed custom-format archive of the database to `output`.
    fn dump(
        &self,
        conn: &PostgresConfig,
        output: &Path,
        compression_level: u8,
        timeout: Duration,
    ) -> Result<()>;

    /// Restores the archive into the connected database.
    fn restore(&self, conn: &PostgresConfig, archive: &Path, timeout: Duration) -> Result<()>;

    /// Cheap structural check that a file is a readable archive.
    fn verify_archive(&self, archive: &Path) -> Result<()>;

    /// Blocks until the server accepts connections or the deadline passes.
    fn wait_ready(&self, conn: &PostgresConfig, timeout: Duration) -> Result<()>;

    /// Runs one SQL statement and returns its unaligned, tuples-only output.
    fn query(&self, conn: &PostgresConfig, sql: &str) -> Result<String>;
}

/// Production implementation driving pg_dump / pg_restore / psql /
/// pg_isready as subprocesses.
#[derive(Debug, Default)]
pub struct PgTools;

impl PgTools {
    pub fn new() -> Self {
        Self
    }
}

fn apply_connection(cmd: &mut Command, conn: &PostgresConfig) {
    cmd.env("PGPASSWORD", &conn.password)
        .arg("-h")
        .arg(&conn.host)
        .arg("-p")
        .arg(conn.port.to_string())
        .arg("-U")
        .arg(&conn.user);
}

impl DatabaseTools for PgTools {
    fn dump(
        &self,
        conn: &PostgresConfig,
        output: &Path,
        compression_level: u8,
        timeout: Duration,
    ) -> Result<()> {
        let mut cmd = Command::new("pg_dump");
        apply_connection(&mut cmd, conn);
        cmd.arg("-Fc")
            .arg(format!("-Z{compression_level}"))
            .arg("-b")
            .arg("-d")
            .arg(&conn.database)
            .arg("-f")
            .arg(output);

        info!("running pg_dump for database {}", conn.database);
        let out = run_with_timeout(&mut cmd, timeout)
            .map_err(|e| Error::dump_tool(format!("failed to run pg_dump: {e}")))?;
        if !out.success() {
            return Err(Error::dump_tool(format!(
                "pg_dump failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }

    fn restore(&self, conn: &PostgresConfig, archive: &Path, timeout: Duration) -> Result<()> {
        let mut cmd = Command::new("pg_restore");
        apply_connection(&mut cmd, conn);
        cmd.arg("-d")
            .arg(&conn.database)
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--no-tablespaces")
            .arg("--use-set-session-authorization")
            .arg(archive);

        info!("running pg_restore from {}", archive.display());
        let out = run_with_timeout(&mut cmd, timeout)
            .map_err(|e| Error::restore_tool(format!("failed to run pg_restore: {e}")))?;
        if !out.success() {
            // pg_restore exits non-zero for ignorable per-object errors; only
            // that specific summary line is tolerated.
            if !out.timed_out && out.stderr.to_ascii_lowercase().contains("errors ignored on restore")
            {
                warn!(
                    "pg_restore completed with ignored errors (status {})",
                    out.code
                );
                return Ok(());
            }
            return Err(Error::restore_tool(format!(
                "pg_restore failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }

    fn verify_archive(&self, archive: &Path) -> Result<()> {
        let mut cmd = Command::new("pg_restore");
        cmd.arg("-l").arg(archive);
        let out = run_with_timeout(&mut cmd, QUERY_TIMEOUT)
            .map_err(|e| Error::restore_tool(format!("failed to run pg_restore -l: {e}")))?;
        if !out.success() {
            return Err(Error::restore_tool(format!(
                "archive format verification failed: {}",
                command_summary(&out)
            )));
        }
        debug!("archive format verified: {}", archive.display());
        Ok(())
    }

    fn wait_ready(&self, conn: &PostgresConfig, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut cmd = Command::new("pg_isready");
            apply_connection(&mut cmd, conn);
            cmd.arg("-d").arg(&conn.database);
            match run_with_timeout(&mut cmd, Duration::from_secs(5)) {
                Ok(out) if out.success() => {
                    debug!("database is ready");
                    return Ok(());
                }
                Ok(_) | Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::restore_tool(format!(
                    "database not ready after {}s",
                    timeout.as_secs()
                )));
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
    }

    fn query(&self, conn: &PostgresConfig, sql: &str) -> Result<String> {
        let mut cmd = Command::new("psql");
        apply_connection(&mut cmd, conn);
        cmd.arg("-d")
            .arg(&conn.database)
            .arg("-t")
            .arg("-A")
            .arg("-q")
            .arg("-c")
            .arg(sql);

        let out = run_with_timeout(&mut cmd, QUERY_TIMEOUT)
            .map_err(|e| Error::io(format!("failed to run psql: {e}")))?;
        if !out.success() {
            return Err(Error::io(format!(
                "psql query failed: {}",
                command_summary(&out)
            )));
        }
        Ok(out.stdout)
    }
}

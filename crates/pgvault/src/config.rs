use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_BACKUP_DIR: &str = "/backups";
const DEFAULT_BASE_NAME: &str = "postgres_db";
const DEFAULT_REMOTE_PREFIX: &str = "backups/postgres";

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_required(key: &str) -> Result<String> {
    env_string(key).ok_or_else(|| Error::config(format!("{key} is required")))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::config(format!("{key} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_string(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::config(format!(
                "{key} has invalid boolean value '{raw}'"
            ))),
        },
        None => Ok(default),
    }
}

/// Connection parameters for one PostgreSQL instance. The restore target is
/// expected to be a separate, isolated instance; isolation itself is the
/// deployment's responsibility.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl PostgresConfig {
    pub fn from_env() -> Result<Self> {
        let port: u16 = env_parse("POSTGRES_PORT", 5432)?;
        if port == 0 {
            return Err(Error::config("POSTGRES_PORT must be in 1..=65535"));
        }
        Ok(Self {
            host: env_string("POSTGRES_HOST").unwrap_or_else(|| "localhost".into()),
            port,
            user: env_required("POSTGRES_USER")?,
            password: env_required("POSTGRES_PASSWORD")?,
            database: env_required("POSTGRES_DB")?,
        })
    }
}

#[derive(Debug, Clone)]
pub enum RemoteBackend {
    /// Google Cloud Storage bucket, driven through the gsutil CLI.
    Gcs {
        bucket: String,
        credentials_path: Option<PathBuf>,
    },
    /// Plain HTTP object endpoint (PUT/GET/HEAD/DELETE under a base URL).
    Http {
        base_url: String,
        token: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub backend: RemoteBackend,
    pub prefix: String,
    pub retry_max: u32,
    pub retention_enabled: bool,
    pub retention_daily: i64,
    pub retention_weekly: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub backup_dir: PathBuf,
    pub base_name: String,
    pub compression_level: u8,
    pub retention_daily: i64,
    pub retention_weekly: i64,
    pub remote: Option<RemoteConfig>,
    pub sync_interval_seconds: u64,
    pub health_check_url: Option<String>,
    pub tool_timeout: Duration,
}

impl Config {
    /// Loads and validates the full configuration from the environment.
    /// Missing required settings and out-of-range values fail here, once,
    /// rather than deep inside a backup run.
    pub fn from_env() -> Result<Self> {
        let postgres = PostgresConfig::from_env()?;

        let compression_level: u8 = env_parse("BACKUP_COMPRESSION_LEVEL", 9)?;
        if compression_level > 9 {
            return Err(Error::config(
                "BACKUP_COMPRESSION_LEVEL must be in 0..=9",
            ));
        }

        let timeout_secs: u64 = env_parse("TOOL_TIMEOUT_SECONDS", 3600)?;
        if timeout_secs == 0 {
            return Err(Error::config("TOOL_TIMEOUT_SECONDS must be positive"));
        }

        Ok(Self {
            postgres,
            backup_dir: PathBuf::from(
                env_string("BACKUP_DIR").unwrap_or_else(|| DEFAULT_BACKUP_DIR.into()),
            ),
            base_name: env_string("BACKUP_BASE_NAME").unwrap_or_else(|| DEFAULT_BASE_NAME.into()),
            compression_level,
            retention_daily: env_parse("BACKUP_RETENTION_DAILY", 7)?,
            retention_weekly: env_parse("BACKUP_RETENTION_WEEKLY", 4)?,
            remote: load_remote()?,
            sync_interval_seconds: env_parse("SYNC_INTERVAL_SECONDS", 1800)?,
            health_check_url: env_string("HEALTH_CHECK_URL"),
            tool_timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.backup_dir.join(".upload_registry.json")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.backup_dir.join("reports")
    }
}

fn load_remote() -> Result<Option<RemoteConfig>> {
    let gcs_bucket = env_string("GCS_BUCKET_NAME");
    let http_url = env_string("HTTP_REMOTE_URL");

    let backend = match (gcs_bucket, http_url) {
        (Some(_), Some(_)) => {
            return Err(Error::config(
                "GCS_BUCKET_NAME and HTTP_REMOTE_URL are mutually exclusive",
            ));
        }
        (Some(bucket), None) => RemoteBackend::Gcs {
            bucket,
            credentials_path: env_string("GCS_CREDENTIALS_PATH").map(PathBuf::from),
        },
        (None, Some(base_url)) => RemoteBackend::Http {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: env_string("HTTP_REMOTE_TOKEN"),
        },
        (None, None) => return Ok(None),
    };

    let retry_max: u32 = env_parse("REMOTE_RETRY_MAX", 3)?;
    if retry_max == 0 {
        return Err(Error::config("REMOTE_RETRY_MAX must be at least 1"));
    }

    Ok(Some(RemoteConfig {
        backend,
        prefix: env_string("REMOTE_PREFIX")
            .unwrap_or_else(|| DEFAULT_REMOTE_PREFIX.into())
            .trim_matches('/')
            .to_string(),
        retry_max,
        // Pruning the durability tier must be an explicit choice.
        retention_enabled: env_bool("REMOTE_RETENTION_ENABLED", false)?,
        retention_daily: env_parse("REMOTE_RETENTION_DAILY", 7)?,
        retention_weekly: env_parse("REMOTE_RETENTION_WEEKLY", 4)?,
    }))
}

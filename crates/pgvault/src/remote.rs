use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{RemoteBackend, RemoteConfig};
use crate::error::{Error, Result};
use crate::tools::{command_summary, is_not_found_text, run_with_timeout};
use crate::util::ensure_dir;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub key: String,
    pub size_bytes: u64,
    pub updated: Option<DateTime<Utc>>,
}

/// The object-storage transport. Network calls and authentication live behind
/// this seam; the sync engine on top only decides what to transfer, when to
/// retry, and what counts as "already present".
pub trait ObjectStore {
    fn put(&self, local: &Path, key: &str) -> Result<()>;
    fn get(&self, key: &str, dest: &Path) -> Result<()>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn test_connection(&self) -> Result<()>;
}

pub fn open_store(config: &RemoteConfig) -> Result<Box<dyn ObjectStore>> {
    match &config.backend {
        RemoteBackend::Gcs {
            bucket,
            credentials_path,
        } => Ok(Box::new(GcsCliStore::new(
            bucket.clone(),
            credentials_path.clone(),
        ))),
        RemoteBackend::Http { base_url, token } => Ok(Box::new(HttpObjectStore::new(
            base_url.clone(),
            token.clone(),
        )?)),
    }
}

/// Google Cloud Storage through the gsutil CLI.
pub struct GcsCliStore {
    bucket: String,
    credentials_path: Option<PathBuf>,
}

impl GcsCliStore {
    pub fn new(bucket: String, credentials_path: Option<PathBuf>) -> Self {
        Self {
            bucket,
            credentials_path,
        }
    }

    fn uri(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket, key.trim_start_matches('/'))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("gsutil");
        if let Some(creds) = &self.credentials_path {
            cmd.env("GOOGLE_APPLICATION_CREDENTIALS", creds);
        }
        cmd
    }

    fn run(&self, cmd: &mut Command) -> Result<crate::tools::Captured> {
        run_with_timeout(cmd, TRANSFER_TIMEOUT)
            .map_err(|e| Error::transfer(format!("failed to run gsutil: {e}")))
    }
}

impl ObjectStore for GcsCliStore {
    fn put(&self, local: &Path, key: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("cp").arg(local).arg(self.uri(key));
        let out = self.run(&mut cmd)?;
        if !out.success() {
            return Err(Error::transfer(format!(
                "gsutil upload failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }

    fn get(&self, key: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        let mut cmd = self.command();
        cmd.arg("cp").arg(self.uri(key)).arg(dest);
        let out = self.run(&mut cmd)?;
        if !out.success() {
            let msg = command_summary(&out);
            if is_not_found_text(&msg) {
                return Err(Error::not_found(format!("remote object missing: {key}")));
            }
            return Err(Error::transfer(format!("gsutil download failed: {msg}")));
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let mut cmd = self.command();
        cmd.arg("-q").arg("stat").arg(self.uri(key));
        let out = self.run(&mut cmd)?;
        if out.success() {
            return Ok(true);
        }
        if out.code == 1 {
            return Ok(false);
        }
        Err(Error::transfer(format!(
            "gsutil stat failed: {}",
            command_summary(&out)
        )))
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut cmd = self.command();
        cmd.arg("ls")
            .arg("-l")
            .arg(format!("{}**", self.uri(&format!("{}/", prefix.trim_matches('/')))));
        let out = self.run(&mut cmd)?;
        if !out.success() {
            let msg = command_summary(&out);
            if is_not_found_text(&msg) {
                return Ok(Vec::new());
            }
            return Err(Error::transfer(format!("gsutil list failed: {msg}")));
        }
        Ok(parse_gsutil_ls(&self.bucket, &out.stdout))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("rm").arg(self.uri(key));
        let out = self.run(&mut cmd)?;
        if !out.success() {
            let msg = command_summary(&out);
            if is_not_found_text(&msg) {
                debug!("remote object already gone: {key}");
                return Ok(());
            }
            return Err(Error::transfer(format!("gsutil delete failed: {msg}")));
        }
        Ok(())
    }

    fn test_connection(&self) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("ls").arg("-b").arg(format!("gs://{}", self.bucket));
        let out = self.run(&mut cmd)?;
        if !out.success() {
            return Err(Error::transfer(format!(
                "bucket probe failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }
}

// Lines look like "   1024  2026-02-11T03:03:16Z  gs://bucket/prefix/x.dump",
// followed by a TOTAL summary line.
fn parse_gsutil_ls(bucket: &str, stdout: &str) -> Vec<RemoteObject> {
    let uri_prefix = format!("gs://{bucket}/");
    let mut out = Vec::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [size, updated, uri] = parts.as_slice() else {
            continue;
        };
        let Some(key) = uri.strip_prefix(&uri_prefix) else {
            continue;
        };
        let Ok(size_bytes) = size.parse::<u64>() else {
            continue;
        };
        out.push(RemoteObject {
            key: key.to_string(),
            size_bytes,
            updated: DateTime::parse_from_rfc3339(updated)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        });
    }
    out
}

/// Plain HTTP object endpoint: objects are PUT/GET/HEAD/DELETE under
/// `{base_url}/{key}`, and `GET {base_url}/{prefix}/?list=1` returns a JSON
/// array of `{key, size_bytes, updated}` objects (bare key strings are also
/// accepted).
pub struct HttpObjectStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpObjectStore {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .map_err(|e| Error::transfer(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn authed(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn put(&self, local: &Path, key: &str) -> Result<()> {
        let body = std::fs::read(local)
            .map_err(|e| Error::io(format!("failed to read {}: {e}", local.display())))?;
        let res = self
            .authed(self.client.put(self.url(key)).body(body))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP upload failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::transfer(format!(
                "HTTP upload failed with status {}",
                res.status()
            )));
        }
        Ok(())
    }

    fn get(&self, key: &str, dest: &Path) -> Result<()> {
        let res = self
            .authed(self.client.get(self.url(key)))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP download failed: {e}")))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("remote object missing: {key}")));
        }
        if !res.status().is_success() {
            return Err(Error::transfer(format!(
                "HTTP download failed with status {}",
                res.status()
            )));
        }
        let bytes = res
            .bytes()
            .map_err(|e| Error::transfer(format!("HTTP body read failed: {e}")))?;
        if let Some(parent) = dest.parent() {
            ensure_dir(parent)?;
        }
        std::fs::write(dest, &bytes)
            .map_err(|e| Error::io(format!("failed to write {}: {e}", dest.display())))?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let res = self
            .authed(self.client.head(self.url(key)))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP probe failed: {e}")))?;
        if res.status().is_success() {
            return Ok(true);
        }
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Err(Error::transfer(format!(
            "HTTP probe failed with status {}",
            res.status()
        )))
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let url = format!("{}/{}/?list=1", self.base_url, prefix.trim_matches('/'));
        let res = self
            .authed(self.client.get(url))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP list failed: {e}")))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !res.status().is_success() {
            return Err(Error::transfer(format!(
                "HTTP list failed with status {}",
                res.status()
            )));
        }
        let value: serde_json::Value = res
            .json()
            .map_err(|e| Error::transfer(format!("HTTP list JSON parse failed: {e}")))?;
        Ok(parse_list_json(&value))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let res = self
            .authed(self.client.delete(self.url(key)))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP delete failed: {e}")))?;
        if res.status().is_success() || res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Error::transfer(format!(
            "HTTP delete failed with status {}",
            res.status()
        )))
    }

    fn test_connection(&self) -> Result<()> {
        self.list("").map(|_| ())
    }
}

fn parse_list_json(value: &serde_json::Value) -> Vec<RemoteObject> {
    let Some(arr) = value.as_array() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in arr {
        match item {
            serde_json::Value::String(key) => out.push(RemoteObject {
                key: key.clone(),
                size_bytes: 0,
                updated: None,
            }),
            serde_json::Value::Object(map) => {
                let Some(key) = map.get("key").and_then(|k| k.as_str()) else {
                    continue;
                };
                out.push(RemoteObject {
                    key: key.to_string(),
                    size_bytes: map.get("size_bytes").and_then(|s| s.as_u64()).unwrap_or(0),
                    updated: map
                        .get("updated")
                        .and_then(|u| u.as_str())
                        .and_then(|u| DateTime::parse_from_rfc3339(u).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                });
            }
            _ => {}
        }
    }
    out
}

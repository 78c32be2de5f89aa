use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::checksum::sha256_file;
use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::metadata::{SnapshotKind, load_metadata, metadata_path_for, parse_snapshot_filename};
use crate::registry::UploadRegistry;
use crate::remote::{ObjectStore, RemoteObject};
use crate::store::{Snapshot, SnapshotStore};
use crate::util::remove_file_if_exists;

const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { remote_key: String },
    /// The registry already holds a succeeded entry for this content hash;
    /// no transport call was made.
    AlreadyUploaded,
}

#[derive(Debug, Clone)]
pub enum SyncItemOutcome {
    Uploaded,
    Skipped,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<(String, SyncItemOutcome)>,
}

#[derive(Debug, Default)]
pub struct RemoteRetentionReport {
    pub removed: Vec<String>,
}

/// Upload/download policy on top of an [`ObjectStore`]: consult the registry
/// before transferring, retry transport failures with exponential backoff,
/// and verify integrity on the way back down.
pub struct SyncEngine<'a> {
    objects: &'a dyn ObjectStore,
    registry: &'a mut UploadRegistry,
    prefix: String,
    retry_max: u32,
    backoff_base: Duration,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        objects: &'a dyn ObjectStore,
        registry: &'a mut UploadRegistry,
        config: &RemoteConfig,
    ) -> Self {
        Self {
            objects,
            registry,
            prefix: config.prefix.clone(),
            retry_max: config.retry_max.max(1),
            backoff_base: BACKOFF_BASE,
        }
    }

    /// Shrinks the backoff base; useful where real sleeps are unwanted.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn remote_key(&self, kind: SnapshotKind, filename: &str) -> String {
        format!("{}/{}/{}", self.prefix, kind.as_str(), filename)
    }

    pub fn test_connection(&self) -> Result<()> {
        self.objects.test_connection()
    }

    /// Uploads the data file and its metadata sidecar as paired objects.
    /// Transport errors are retried up to the configured ceiling, each retry
    /// re-sending whole objects; every attempt's outcome lands in the
    /// registry. A hash already marked succeeded short-circuits with zero
    /// transport calls, regardless of filename.
    pub fn upload(&mut self, snapshot: &Snapshot) -> Result<UploadOutcome> {
        let checksum = snapshot.checksum().to_string();
        if self.registry.is_uploaded(&checksum) {
            debug!("already uploaded (by content): {}", snapshot.filename());
            return Ok(UploadOutcome::AlreadyUploaded);
        }

        let dump_key = self.remote_key(snapshot.kind(), snapshot.filename());
        let meta_key = sidecar_key(&dump_key);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .objects
                .put(&snapshot.path, &dump_key)
                .and_then(|()| self.objects.put(&snapshot.metadata_path, &meta_key));
            match result {
                Ok(()) => {
                    self.registry.record_success(&checksum, &dump_key)?;
                    info!("uploaded {} -> {}", snapshot.filename(), dump_key);
                    return Ok(UploadOutcome::Uploaded {
                        remote_key: dump_key,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.retry_max => {
                    self.registry
                        .record_failure(&checksum, &dump_key, e.message())?;
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "upload attempt {attempt}/{} for {} failed: {e}; retrying in {:?}",
                        self.retry_max,
                        snapshot.filename(),
                        delay
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    self.registry
                        .record_failure(&checksum, &dump_key, e.message())?;
                    return Err(e);
                }
            }
        }
    }

    /// Uploads every local snapshot lacking a succeeded registry entry. One
    /// item's failure never aborts the batch.
    pub fn sync_pending(&mut self, store: &SnapshotStore) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        for snapshot in store.list(None)? {
            let name = snapshot.filename().to_string();
            match self.upload(&snapshot) {
                Ok(UploadOutcome::Uploaded { .. }) => {
                    summary.uploaded += 1;
                    summary.outcomes.push((name, SyncItemOutcome::Uploaded));
                }
                Ok(UploadOutcome::AlreadyUploaded) => {
                    summary.skipped += 1;
                    summary.outcomes.push((name, SyncItemOutcome::Skipped));
                }
                Err(e) => {
                    warn!("sync of {name} failed: {e}");
                    summary.failed += 1;
                    summary
                        .outcomes
                        .push((name, SyncItemOutcome::Failed(e.to_string())));
                }
            }
        }
        info!(
            "sync complete: {} uploaded, {} skipped, {} failed",
            summary.uploaded, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    /// Fetches a remote dump plus its sidecar into `dest_dir` and verifies
    /// the data against the metadata's recorded checksum. A mismatch removes
    /// both files and is an integrity error, never silently accepted.
    pub fn download(&self, remote_key: &str, dest_dir: &Path) -> Result<Snapshot> {
        let Some(filename) = remote_key.rsplit('/').next().filter(|f| !f.is_empty()) else {
            return Err(Error::not_found(format!("invalid remote key '{remote_key}'")));
        };
        if !filename.ends_with(".dump") {
            return Err(Error::not_found(format!(
                "remote key does not name a dump object: {remote_key}"
            )));
        }

        let dump_dest = dest_dir.join(filename);
        let meta_dest = metadata_path_for(&dump_dest);
        self.objects.get(remote_key, &dump_dest)?;
        if let Err(e) = self.objects.get(&sidecar_key(remote_key), &meta_dest) {
            let _ = remove_file_if_exists(&dump_dest);
            return Err(e);
        }

        let metadata = match load_metadata(&meta_dest) {
            Ok(m) => m,
            Err(e) => {
                let _ = remove_file_if_exists(&dump_dest);
                let _ = remove_file_if_exists(&meta_dest);
                return Err(e);
            }
        };
        let actual = sha256_file(&dump_dest)?;
        if !actual.eq_ignore_ascii_case(metadata.checksum()) {
            let _ = remove_file_if_exists(&dump_dest);
            let _ = remove_file_if_exists(&meta_dest);
            return Err(Error::integrity(format!(
                "checksum mismatch for {remote_key}: expected {}, got {actual}",
                metadata.checksum()
            )));
        }

        info!("downloaded {} ({} bytes)", filename, metadata.backup_info.size_bytes);
        Ok(Snapshot {
            path: dump_dest,
            metadata_path: meta_dest,
            metadata,
        })
    }

    /// Remote dump objects, newest first by the timestamp encoded in the
    /// object name.
    pub fn list_remote(&self, kind: Option<SnapshotKind>) -> Result<Vec<RemoteObject>> {
        let prefix = match kind {
            Some(k) => format!("{}/{}", self.prefix, k.as_str()),
            None => self.prefix.clone(),
        };
        let mut dumps: Vec<RemoteObject> = self
            .objects
            .list(&prefix)?
            .into_iter()
            .filter(|o| o.key.ends_with(".dump"))
            .collect();
        dumps.sort_by(|a, b| {
            key_timestamp(&b.key)
                .cmp(&key_timestamp(&a.key))
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(dumps)
    }

    /// Rebuilds registry entries from the remote listing, fetching each
    /// orphan object's sidecar for its content hash. Recovers deduplication
    /// after a lost or corrupted registry file.
    pub fn rebuild_registry(&mut self) -> Result<usize> {
        let tmp = tempfile::tempdir()
            .map_err(|e| Error::io(format!("failed to create temp dir: {e}")))?;
        let mut synced = 0usize;
        for obj in self.objects.list(&self.prefix)? {
            if !obj.key.ends_with(".dump") || self.registry.has_remote_key(&obj.key) {
                continue;
            }
            let meta_dest = tmp.path().join("sidecar.json");
            match self
                .objects
                .get(&sidecar_key(&obj.key), &meta_dest)
                .and_then(|()| load_metadata(&meta_dest))
            {
                Ok(metadata) => {
                    self.registry
                        .insert_synced(metadata.checksum(), &obj.key, obj.updated)?;
                    synced += 1;
                }
                Err(e) => warn!("cannot rebuild registry entry for {}: {e}", obj.key),
            }
        }
        if synced > 0 {
            info!("rebuilt {synced} registry entries from remote listing");
        }
        Ok(synced)
    }

    /// Deletes remote dumps beyond the per-kind keep counts. Only invoked
    /// when remote retention is explicitly enabled; pruning the durability
    /// tier is never implicit.
    pub fn enforce_remote_retention(
        &mut self,
        retention_daily: i64,
        retention_weekly: i64,
    ) -> Result<RemoteRetentionReport> {
        let mut report = RemoteRetentionReport::default();
        for (kind, keep_count) in [
            (SnapshotKind::Daily, retention_daily),
            (SnapshotKind::Weekly, retention_weekly),
        ] {
            let mut dumps = self.list_remote(Some(kind))?;
            let keep_n = if keep_count <= 0 {
                0
            } else {
                (keep_count as usize).min(dumps.len())
            };
            for obj in dumps.split_off(keep_n) {
                self.objects.delete(&obj.key)?;
                self.objects.delete(&sidecar_key(&obj.key))?;
                self.registry.remove_by_remote_key(&obj.key)?;
                info!("remote retention: deleted {}", obj.key);
                report.removed.push(obj.key);
            }
        }
        Ok(report)
    }
}

fn sidecar_key(dump_key: &str) -> String {
    match dump_key.strip_suffix(".dump") {
        Some(stem) => format!("{stem}.json"),
        None => format!("{dump_key}.json"),
    }
}

fn key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let name = key.rsplit('/').next()?;
    parse_snapshot_filename(name).map(|p| p.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemoteBackend, RemoteConfig};
    use crate::store::write_fixture;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use chrono::TimeZone;

    #[derive(Default)]
    struct MemStore {
        objects: RefCell<BTreeMap<String, Vec<u8>>>,
        puts: Cell<usize>,
        // Number of upcoming put calls that fail with a transfer error.
        fail_next_puts: Cell<usize>,
    }

    impl MemStore {
        fn contents(&self, key: &str) -> Option<Vec<u8>> {
            self.objects.borrow().get(key).cloned()
        }

        fn corrupt(&self, key: &str) {
            let mut objects = self.objects.borrow_mut();
            let body = objects.get_mut(key).expect("object to corrupt");
            body[0] ^= 0xff;
        }
    }

    impl ObjectStore for MemStore {
        fn put(&self, local: &Path, key: &str) -> Result<()> {
            self.puts.set(self.puts.get() + 1);
            if self.fail_next_puts.get() > 0 {
                self.fail_next_puts.set(self.fail_next_puts.get() - 1);
                return Err(Error::transfer("injected transport failure"));
            }
            let body = std::fs::read(local).expect("read local object");
            self.objects.borrow_mut().insert(key.to_string(), body);
            Ok(())
        }

        fn get(&self, key: &str, dest: &Path) -> Result<()> {
            match self.objects.borrow().get(key) {
                Some(body) => {
                    std::fs::write(dest, body).expect("write dest");
                    Ok(())
                }
                None => Err(Error::not_found(format!("remote object missing: {key}"))),
            }
        }

        fn exists(&self, key: &str) -> Result<bool> {
            Ok(self.objects.borrow().contains_key(key))
        }

        fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
            Ok(self
                .objects
                .borrow()
                .iter()
                .filter(|(k, _)| k.starts_with(prefix.trim_matches('/')))
                .map(|(k, v)| RemoteObject {
                    key: k.clone(),
                    size_bytes: v.len() as u64,
                    updated: None,
                })
                .collect())
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.objects.borrow_mut().remove(key);
            Ok(())
        }

        fn test_connection(&self) -> Result<()> {
            Ok(())
        }
    }

    fn remote_config(retry_max: u32) -> RemoteConfig {
        RemoteConfig {
            backend: RemoteBackend::Http {
                base_url: "http://unused".into(),
                token: None,
            },
            prefix: "backups/postgres".into(),
            retry_max,
            retention_enabled: true,
            retention_daily: 7,
            retention_weekly: 4,
        }
    }

    fn fixture_store(tmp: &Path, days: &[u32]) -> SnapshotStore {
        let store = SnapshotStore::open(tmp).expect("open");
        for day in days {
            write_fixture(
                &store,
                SnapshotKind::Daily,
                Utc.with_ymd_and_hms(2026, 2, *day, 2, 0, 0).unwrap(),
                "postgres_db",
                format!("dump-{day}").as_bytes(),
            );
        }
        store
    }

    #[test]
    fn upload_pairs_objects_and_dedupes_by_hash() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = fixture_store(tmp.path(), &[1]);
        let snapshots = store.list(None).expect("list");
        let snapshot = &snapshots[0];
        let mem = MemStore::default();
        let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
        let cfg = remote_config(3);
        let mut engine = SyncEngine::new(&mem, &mut registry, &cfg);

        let outcome = engine.upload(snapshot).expect("upload");
        let UploadOutcome::Uploaded { remote_key } = outcome else {
            panic!("expected a fresh upload");
        };
        assert!(remote_key.ends_with(".dump"));
        assert!(mem.contents(&remote_key).is_some());
        assert!(mem.contents(&sidecar_key(&remote_key)).is_some());
        assert_eq!(mem.puts.get(), 2);

        // Same content again: zero further transport calls.
        let again = engine.upload(snapshot).expect("upload again");
        assert_eq!(again, UploadOutcome::AlreadyUploaded);
        assert_eq!(mem.puts.get(), 2);
    }

    #[test]
    fn transient_failures_retry_then_succeed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = fixture_store(tmp.path(), &[1]);
        let snapshots = store.list(None).expect("list");
        let snapshot = &snapshots[0];
        let mem = MemStore::default();
        mem.fail_next_puts.set(2);
        let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
        let cfg = remote_config(3);
        let mut engine =
            SyncEngine::new(&mem, &mut registry, &cfg).with_backoff_base(Duration::from_millis(1));

        let outcome = engine.upload(snapshot).expect("upload survives retries");
        assert!(matches!(outcome, UploadOutcome::Uploaded { .. }));
        assert!(registry.is_uploaded(snapshot.checksum()));
        // Attempts: two failed (one put each) + one successful pair.
        assert_eq!(mem.puts.get(), 4);
        assert_eq!(registry.lookup(snapshot.checksum()).expect("entry").attempts, 3);
    }

    #[test]
    fn exhausted_retries_surface_transfer_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = fixture_store(tmp.path(), &[1]);
        let snapshots = store.list(None).expect("list");
        let snapshot = &snapshots[0];
        let mem = MemStore::default();
        mem.fail_next_puts.set(10);
        let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
        let cfg = remote_config(2);
        let mut engine =
            SyncEngine::new(&mem, &mut registry, &cfg).with_backoff_base(Duration::from_millis(1));

        let err = engine.upload(snapshot).unwrap_err();
        assert_eq!(err.class(), "TransferError");
        let entry = registry.lookup(snapshot.checksum()).expect("entry");
        assert_eq!(entry.attempts, 2);
        assert!(!registry.is_uploaded(snapshot.checksum()));
    }

    #[test]
    fn sync_pending_reports_per_item_outcomes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = fixture_store(tmp.path(), &[1, 2, 3]);
        let snapshots = store.list(None).expect("list");
        let mem = MemStore::default();
        let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
        // Newest snapshot is already uploaded by content hash.
        registry
            .record_success(snapshots[0].checksum(), "pre-existing-key")
            .expect("seed registry");
        // First put of the batch fails terminally (retry_max 1).
        mem.fail_next_puts.set(1);
        let cfg = remote_config(1);
        let mut engine =
            SyncEngine::new(&mem, &mut registry, &cfg).with_backoff_base(Duration::from_millis(1));

        let summary = engine.sync_pending(&store).expect("sync");
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.outcomes.len(), 3);
    }

    #[test]
    fn download_verifies_checksum_and_rejects_corruption() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = fixture_store(tmp.path(), &[1]);
        let snapshots = store.list(None).expect("list");
        let snapshot = &snapshots[0];
        let mem = MemStore::default();
        let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
        let cfg = remote_config(3);
        let mut engine = SyncEngine::new(&mem, &mut registry, &cfg);
        let UploadOutcome::Uploaded { remote_key } = engine.upload(snapshot).expect("upload")
        else {
            panic!("expected upload");
        };

        let down_dir = tmp.path().join("restored");
        std::fs::create_dir_all(&down_dir).expect("mkdir");
        let fetched = engine.download(&remote_key, &down_dir).expect("download");
        assert_eq!(fetched.checksum(), snapshot.checksum());
        assert!(fetched.path.is_file());

        // Flip one byte remotely: the same download now fails integrity and
        // leaves nothing behind.
        std::fs::remove_file(&fetched.path).expect("clear");
        std::fs::remove_file(&fetched.metadata_path).expect("clear");
        mem.corrupt(&remote_key);
        let err = engine.download(&remote_key, &down_dir).unwrap_err();
        assert_eq!(err.class(), "IntegrityError");
        assert!(!fetched.path.exists());
        assert!(!fetched.metadata_path.exists());

        // Unknown keys are NotFound.
        let err = engine
            .download("backups/postgres/daily/nope.dump", &down_dir)
            .unwrap_err();
        assert_eq!(err.class(), "NotFoundError");
    }

    #[test]
    fn remote_retention_prunes_oldest_pairs_and_registry_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = fixture_store(tmp.path(), &[1, 2, 3, 4]);
        let mem = MemStore::default();
        let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
        let cfg = remote_config(3);
        let mut engine = SyncEngine::new(&mem, &mut registry, &cfg);
        engine.sync_pending(&store).expect("seed remote");

        let report = engine.enforce_remote_retention(2, 4).expect("retention");
        assert_eq!(report.removed.len(), 2);
        assert!(report.removed.iter().all(|k| k.contains("/daily/")));
        assert_eq!(engine.list_remote(Some(SnapshotKind::Daily)).expect("list").len(), 2);

        // Registry entries for deleted objects are gone too.
        for key in &report.removed {
            assert!(!registry.has_remote_key(key));
        }
    }

    #[test]
    fn rebuild_registry_recovers_hashes_from_sidecars() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = fixture_store(tmp.path(), &[1, 2]);
        let mem = MemStore::default();
        let cfg = remote_config(3);
        {
            let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
            let mut engine = SyncEngine::new(&mem, &mut registry, &cfg);
            engine.sync_pending(&store).expect("seed remote");
        }

        // Fresh registry, as if the file was lost.
        let mut registry = UploadRegistry::open(tmp.path().join("reg2.json"));
        let mut engine = SyncEngine::new(&mem, &mut registry, &cfg);
        let synced = engine.rebuild_registry().expect("rebuild");
        assert_eq!(synced, 2);
        for snapshot in store.list(None).expect("list") {
            assert!(registry.is_uploaded(snapshot.checksum()));
        }

        // Rebuilding again adds nothing.
        let mut engine = SyncEngine::new(&mem, &mut registry, &cfg);
        assert_eq!(engine.rebuild_registry().expect("rebuild again"), 0);
    }
}

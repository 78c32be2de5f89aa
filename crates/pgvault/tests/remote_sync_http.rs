use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, TimeZone, Utc};

use pgvault::checksum::sha256_file;
use pgvault::config::{RemoteBackend, RemoteConfig};
use pgvault::metadata::{
    BackupInfo, BackupMetadata, MigrationInfo, SnapshotKind, save_metadata, snapshot_file_names,
};
use pgvault::registry::UploadRegistry;
use pgvault::remote::HttpObjectStore;
use pgvault::store::{Snapshot, SnapshotStore};
use pgvault::sync::{SyncEngine, UploadOutcome};

type Objects = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

// Minimal HTTP object endpoint: PUT/GET/HEAD/DELETE on /{key}, plus
// GET /{prefix}/?list=1 returning a JSON array. One request per connection.
fn spawn_object_server(objects: Objects, hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            hits.fetch_add(1, Ordering::SeqCst);
            handle_request(&mut stream, &objects);
        }
    });
    format!("http://{addr}")
}

fn handle_request(stream: &mut TcpStream, objects: &Objects) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp).unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).unwrap_or(0);
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    if let Some(prefix) = target.strip_suffix("?list=1") {
        let prefix = prefix.trim_matches('/');
        let objects = objects.lock().expect("lock");
        let items: Vec<serde_json::Value> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| serde_json::json!({"key": key, "size_bytes": value.len()}))
            .collect();
        let body = serde_json::to_vec(&items).expect("encode listing");
        respond(stream, "200 OK", &body);
        return;
    }

    let key = target.trim_start_matches('/').to_string();
    match method.as_str() {
        "PUT" => {
            objects.lock().expect("lock").insert(key, body);
            respond(stream, "200 OK", b"");
        }
        "GET" => match objects.lock().expect("lock").get(&key) {
            Some(value) => {
                let value = value.clone();
                respond(stream, "200 OK", &value);
            }
            None => respond(stream, "404 Not Found", b""),
        },
        "HEAD" => {
            if objects.lock().expect("lock").contains_key(&key) {
                respond(stream, "200 OK", b"");
            } else {
                respond(stream, "404 Not Found", b"");
            }
        }
        "DELETE" => {
            if objects.lock().expect("lock").remove(&key).is_some() {
                respond(stream, "200 OK", b"");
            } else {
                respond(stream, "404 Not Found", b"");
            }
        }
        _ => respond(stream, "400 Bad Request", b""),
    }
}

fn respond(stream: &mut TcpStream, status: &str, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(body);
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn remote_config() -> RemoteConfig {
    RemoteConfig {
        backend: RemoteBackend::Http {
            base_url: "http://placeholder".into(),
            token: None,
        },
        prefix: "backups/postgres".into(),
        retry_max: 3,
        retention_enabled: true,
        retention_daily: 7,
        retention_weekly: 4,
    }
}

fn make_snapshot(
    store: &SnapshotStore,
    kind: SnapshotKind,
    timestamp: DateTime<Utc>,
    base: &str,
    body: &[u8],
) -> Snapshot {
    let (dump_name, json_name) = snapshot_file_names(base, kind, 7, timestamp);
    let dir = store.kind_dir(kind);
    let dump_path = dir.join(&dump_name);
    fs::write(&dump_path, body).expect("write dump");
    let metadata = BackupMetadata {
        backup_info: BackupInfo {
            timestamp,
            kind,
            database: "app".into(),
            filename: dump_name,
            size_bytes: body.len() as u64,
            checksum_sha256: sha256_file(&dump_path).expect("hash"),
            compression_level: 9,
            tool_exit_status: 0,
        },
        migration_info: MigrationInfo {
            version: 7,
            dirty: false,
        },
        table_counts: BTreeMap::new(),
        enum_types: Vec::new(),
        foreign_keys: Vec::new(),
    };
    save_metadata(&dir.join(&json_name), &metadata).expect("write metadata");
    store.load(&dump_path).expect("load snapshot")
}

#[test]
fn upload_download_roundtrip_over_http() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(tmp.path().join("backups")).expect("open");
    let snapshot = make_snapshot(
        &store,
        SnapshotKind::Daily,
        Utc.with_ymd_and_hms(2026, 2, 11, 3, 3, 16).unwrap(),
        "postgres_db",
        b"the dump payload",
    );

    let objects: Objects = Arc::new(Mutex::new(BTreeMap::new()));
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_object_server(objects.clone(), hits.clone());
    let http = HttpObjectStore::new(base_url, None).expect("client");
    let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
    let mut engine = SyncEngine::new(&http, &mut registry, &remote_config());

    let UploadOutcome::Uploaded { remote_key } = engine.upload(&snapshot).expect("upload") else {
        panic!("expected a fresh upload");
    };
    assert_eq!(
        remote_key,
        format!("backups/postgres/daily/{}", snapshot.filename())
    );
    {
        let stored = objects.lock().expect("lock");
        assert_eq!(stored.len(), 2, "dump and sidecar are paired objects");
        assert_eq!(
            stored.get(&remote_key).map(Vec::len),
            Some(b"the dump payload".len())
        );
    }

    let dest = tmp.path().join("downloaded");
    fs::create_dir_all(&dest).expect("mkdir");
    let fetched = engine.download(&remote_key, &dest).expect("download");
    assert_eq!(fetched.checksum(), snapshot.checksum());
    assert_eq!(
        fs::read(&fetched.path).expect("read"),
        b"the dump payload".to_vec()
    );
}

#[test]
fn identical_content_under_new_name_is_not_reuploaded() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(tmp.path().join("backups")).expect("open");
    let first = make_snapshot(
        &store,
        SnapshotKind::Daily,
        Utc.with_ymd_and_hms(2026, 2, 11, 3, 0, 0).unwrap(),
        "postgres_db",
        b"same bytes",
    );
    // Same content captured later under a different filename.
    let second = make_snapshot(
        &store,
        SnapshotKind::Daily,
        Utc.with_ymd_and_hms(2026, 2, 12, 3, 0, 0).unwrap(),
        "postgres_db",
        b"same bytes",
    );
    assert_ne!(first.filename(), second.filename());
    assert_eq!(first.checksum(), second.checksum());

    let objects: Objects = Arc::new(Mutex::new(BTreeMap::new()));
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_object_server(objects, hits.clone());
    let http = HttpObjectStore::new(base_url, None).expect("client");
    let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
    let mut engine = SyncEngine::new(&http, &mut registry, &remote_config());

    assert!(matches!(
        engine.upload(&first).expect("first upload"),
        UploadOutcome::Uploaded { .. }
    ));
    let after_first = hits.load(Ordering::SeqCst);

    // Duplicate content: the registry answers, the wire stays silent.
    assert_eq!(
        engine.upload(&second).expect("second upload"),
        UploadOutcome::AlreadyUploaded
    );
    assert_eq!(hits.load(Ordering::SeqCst), after_first);
}

#[test]
fn corrupted_remote_object_fails_integrity_on_download() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(tmp.path().join("backups")).expect("open");
    let snapshot = make_snapshot(
        &store,
        SnapshotKind::Weekly,
        Utc.with_ymd_and_hms(2026, 2, 8, 3, 0, 0).unwrap(),
        "postgres_db",
        b"weekly dump",
    );

    let objects: Objects = Arc::new(Mutex::new(BTreeMap::new()));
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_object_server(objects.clone(), hits);
    let http = HttpObjectStore::new(base_url, None).expect("client");
    let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
    let mut engine = SyncEngine::new(&http, &mut registry, &remote_config());

    let UploadOutcome::Uploaded { remote_key } = engine.upload(&snapshot).expect("upload") else {
        panic!("expected upload");
    };

    // Flip one byte of the stored dump.
    {
        let mut stored = objects.lock().expect("lock");
        let body = stored.get_mut(&remote_key).expect("object");
        body[0] ^= 0xff;
    }

    let dest = tmp.path().join("downloaded");
    fs::create_dir_all(&dest).expect("mkdir");
    let err = engine.download(&remote_key, &dest).unwrap_err();
    assert_eq!(err.class(), "IntegrityError");
    // Nothing half-verified is left on disk.
    assert!(fs::read_dir(&dest).expect("read_dir").next().is_none());

    let err = engine
        .download("backups/postgres/daily/absent.dump", &dest)
        .unwrap_err();
    assert_eq!(err.class(), "NotFoundError");
}

#[test]
fn sync_pending_then_remote_retention_over_http() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(tmp.path().join("backups")).expect("open");
    for day in 1..=4 {
        make_snapshot(
            &store,
            SnapshotKind::Daily,
            Utc.with_ymd_and_hms(2026, 2, day, 2, 0, 0).unwrap(),
            "postgres_db",
            format!("daily dump {day}").as_bytes(),
        );
    }

    let objects: Objects = Arc::new(Mutex::new(BTreeMap::new()));
    let hits = Arc::new(AtomicUsize::new(0));
    let base_url = spawn_object_server(objects.clone(), hits);
    let http = HttpObjectStore::new(base_url, None).expect("client");
    let mut registry = UploadRegistry::open(tmp.path().join("reg.json"));
    let mut engine = SyncEngine::new(&http, &mut registry, &remote_config());

    let summary = engine.sync_pending(&store).expect("sync");
    assert_eq!(summary.uploaded, 4);
    assert_eq!(summary.failed, 0);
    assert_eq!(objects.lock().expect("lock").len(), 8);

    // A second pass transfers nothing.
    let summary = engine.sync_pending(&store).expect("resync");
    assert_eq!(summary.uploaded, 0);
    assert_eq!(summary.skipped, 4);

    let report = engine.enforce_remote_retention(2, 4).expect("remote retention");
    assert_eq!(report.removed.len(), 2);
    let remaining = engine
        .list_remote(Some(SnapshotKind::Daily))
        .expect("list remote");
    assert_eq!(remaining.len(), 2);
    // The newest dumps survive.
    assert!(remaining[0].key.contains("20260204"));
    assert!(remaining[1].key.contains("20260203"));
    assert_eq!(objects.lock().expect("lock").len(), 4);
}

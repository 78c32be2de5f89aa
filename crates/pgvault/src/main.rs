use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use pgvault::backup::{BackupEngine, BackupOptions};
use pgvault::config::{Config, RemoteConfig};
use pgvault::error::Error;
use pgvault::metadata::{SnapshotKind, load_metadata, metadata_path_for};
use pgvault::registry::UploadRegistry;
use pgvault::remote::open_store;
use pgvault::restore::{RestoreEngine, RestoreSettings, default_report_path, write_report};
use pgvault::retention::enforce_local;
use pgvault::store::SnapshotStore;
use pgvault::sync::{SyncEngine, UploadOutcome};
use pgvault::tools::PgTools;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a backup snapshot, prune local history, and upload it
    Backup {
        /// Snapshot kind: daily, weekly, or manual
        #[arg(long = "type", default_value = "manual")]
        kind: String,
    },
    /// Restore a snapshot into the configured (isolated) instance and
    /// validate it
    Restore {
        /// Path to a backup .dump file
        backup_file: PathBuf,
        /// Don't drop the public schema before restoring
        #[arg(long)]
        no_drop_schema: bool,
        /// Where to write the validation report
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// List local or remote snapshots
    List {
        /// Filter by snapshot kind
        #[arg(long = "type")]
        kind: Option<String>,
        /// List remote objects instead of local snapshots
        #[arg(long)]
        cloud: bool,
        /// JSON output
        #[arg(long)]
        json: bool,
        /// Limit results
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Upload one snapshot, or sync everything pending
    Upload {
        /// Specific .dump file to upload (default: sync all pending)
        #[arg(long)]
        file: Option<PathBuf>,
        /// Rebuild the upload registry from the remote listing first
        #[arg(long)]
        rebuild_registry: bool,
    },
    /// Download a snapshot from remote storage
    Download {
        /// Remote object key of the .dump file
        key: String,
        /// Destination directory
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Show the upload status of local snapshots
    Status,
    /// Test remote storage connectivity
    Test,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_logging();

    let args = Args::parse();
    match run(args.cmd) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn run(cmd: Command) -> pgvault::Result<ExitCode> {
    let config = Config::from_env()?;
    match cmd {
        Command::Backup { kind } => cmd_backup(&config, &kind),
        Command::Restore {
            backup_file,
            no_drop_schema,
            output,
        } => cmd_restore(&config, &backup_file, no_drop_schema, output),
        Command::List {
            kind,
            cloud,
            json,
            limit,
        } => cmd_list(&config, kind.as_deref(), cloud, json, limit),
        Command::Upload {
            file,
            rebuild_registry,
        } => cmd_upload(&config, file, rebuild_registry),
        Command::Download { key, output } => cmd_download(&config, &key, output),
        Command::Status => cmd_status(&config),
        Command::Test => cmd_test(&config),
    }
}

fn require_remote(config: &Config) -> pgvault::Result<&RemoteConfig> {
    config
        .remote
        .as_ref()
        .ok_or_else(|| Error::config("remote storage is not configured"))
}

fn parse_kind(raw: &str) -> pgvault::Result<SnapshotKind> {
    raw.parse::<SnapshotKind>()
        .map_err(|_| Error::config(format!("invalid snapshot kind '{raw}'")))
}

fn format_mb(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

fn cmd_backup(config: &Config, kind: &str) -> pgvault::Result<ExitCode> {
    let kind = parse_kind(kind)?;
    let store = SnapshotStore::open(&config.backup_dir)?;
    let tools = PgTools::new();
    let engine = BackupEngine::new(
        &tools,
        &store,
        &config.postgres,
        BackupOptions::from_config(config),
    );

    let snapshot = engine.create(kind)?;
    println!("Backup created: {}", snapshot.path.display());
    println!("Metadata: {}", snapshot.metadata_path.display());
    println!("Size: {} bytes", snapshot.metadata.backup_info.size_bytes);
    println!("Checksum: {}", snapshot.checksum());

    let mut registry = UploadRegistry::open(config.registry_path());
    enforce_local(
        &store,
        Some(&registry),
        config.retention_daily,
        config.retention_weekly,
    )?;

    if let Some(remote) = config.remote.as_ref() {
        let objects = open_store(remote)?;
        let mut engine = SyncEngine::new(objects.as_ref(), &mut registry, remote);
        match engine.upload(&snapshot) {
            Ok(UploadOutcome::Uploaded { remote_key }) => {
                println!("Uploaded: {remote_key}");
            }
            Ok(UploadOutcome::AlreadyUploaded) => {
                println!("Already uploaded (identical content)");
            }
            // The snapshot itself is intact; the registry keeps the failed
            // attempt and the next sync pass retries it.
            Err(e) => eprintln!("warning: upload failed, will retry on next sync: {e}"),
        }
        if remote.retention_enabled {
            engine.enforce_remote_retention(remote.retention_daily, remote.retention_weekly)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_restore(
    config: &Config,
    backup_file: &PathBuf,
    no_drop_schema: bool,
    output: Option<PathBuf>,
) -> pgvault::Result<ExitCode> {
    let metadata_path = metadata_path_for(backup_file);
    let metadata = if metadata_path.is_file() {
        match load_metadata(&metadata_path) {
            Ok(m) => Some(m),
            Err(e) => {
                eprintln!("warning: could not load metadata: {e}");
                None
            }
        }
    } else {
        None
    };

    let tools = PgTools::new();
    let engine = RestoreEngine::new(
        &tools,
        &config.postgres,
        RestoreSettings::from_config(config),
    );
    let report = engine.run(backup_file, metadata.as_ref(), !no_drop_schema);

    let report_path =
        output.unwrap_or_else(|| default_report_path(&config.report_dir(), report.timestamp));
    write_report(&report, &report_path)?;
    println!("Report written to: {}", report_path.display());

    if !report.restore_success {
        eprintln!(
            "Restore failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
        return Ok(ExitCode::FAILURE);
    }
    println!(
        "Restore completed in {:.2}s",
        report.restore_duration_seconds
    );
    if report.validation_passed {
        println!("Validation: PASSED");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Validation: FAILED");
        for error in &report.validation_errors {
            println!("  - {error}");
        }
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_list(
    config: &Config,
    kind: Option<&str>,
    cloud: bool,
    json: bool,
    limit: usize,
) -> pgvault::Result<ExitCode> {
    let kind = kind.map(parse_kind).transpose()?;

    if cloud {
        let remote = require_remote(config)?;
        let objects = open_store(remote)?;
        let mut registry = UploadRegistry::open(config.registry_path());
        let engine = SyncEngine::new(objects.as_ref(), &mut registry, remote);
        let listed = engine.list_remote(kind)?;

        if json {
            let items: Vec<serde_json::Value> = listed
                .iter()
                .take(limit)
                .map(|o| {
                    serde_json::json!({
                        "key": o.key,
                        "size_bytes": o.size_bytes,
                        "updated": o.updated.map(|u| u.to_rfc3339()),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        } else {
            println!("Remote backups ({}):", listed.len());
            for obj in listed.iter().take(limit) {
                println!("  {} - {}", obj.key, format_mb(obj.size_bytes));
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let store = SnapshotStore::open(&config.backup_dir)?;
    let snapshots = store.list(kind)?;
    if json {
        let items: Vec<serde_json::Value> = snapshots
            .iter()
            .take(limit)
            .map(|s| {
                serde_json::json!({
                    "filename": s.filename(),
                    "type": s.kind().as_str(),
                    "timestamp": s.timestamp().to_rfc3339(),
                    "size_bytes": s.metadata.backup_info.size_bytes,
                    "checksum_sha256": s.checksum(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        println!("Local backups ({}):", snapshots.len());
        for snapshot in snapshots.iter().take(limit) {
            println!(
                "  {} - {}",
                snapshot.filename(),
                format_mb(snapshot.metadata.backup_info.size_bytes)
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_upload(
    config: &Config,
    file: Option<PathBuf>,
    rebuild_registry: bool,
) -> pgvault::Result<ExitCode> {
    let remote = require_remote(config)?;
    let store = SnapshotStore::open(&config.backup_dir)?;
    let objects = open_store(remote)?;
    let mut registry = UploadRegistry::open(config.registry_path());
    let mut engine = SyncEngine::new(objects.as_ref(), &mut registry, remote);

    if rebuild_registry {
        let synced = engine.rebuild_registry()?;
        println!("Rebuilt {synced} registry entries from remote listing");
    }

    if let Some(file) = file {
        let snapshot = store.load(&file)?;
        match engine.upload(&snapshot)? {
            UploadOutcome::Uploaded { remote_key } => {
                println!("Uploaded: {} -> {}", snapshot.filename(), remote_key);
            }
            UploadOutcome::AlreadyUploaded => {
                println!("Already uploaded: {}", snapshot.filename());
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    println!("Syncing pending uploads...");
    let summary = engine.sync_pending(&store)?;
    println!(
        "Synced {} backups ({} already uploaded, {} failed)",
        summary.uploaded, summary.skipped, summary.failed
    );
    for (name, outcome) in &summary.outcomes {
        if let pgvault::sync::SyncItemOutcome::Failed(err) = outcome {
            eprintln!("  failed: {name}: {err}");
        }
    }
    if summary.failed > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_download(config: &Config, key: &str, output: Option<PathBuf>) -> pgvault::Result<ExitCode> {
    let remote = require_remote(config)?;
    let objects = open_store(remote)?;
    let mut registry = UploadRegistry::open(config.registry_path());
    let engine = SyncEngine::new(objects.as_ref(), &mut registry, remote);

    let dest_dir = output.unwrap_or_else(|| PathBuf::from("."));
    let snapshot = engine.download(key, &dest_dir)?;
    println!("Downloaded to: {}", snapshot.path.display());
    println!("Checksum verified: {}", snapshot.checksum());
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(config: &Config) -> pgvault::Result<ExitCode> {
    let store = SnapshotStore::open(&config.backup_dir)?;
    let registry = UploadRegistry::open(config.registry_path());
    let remote_configured = config.remote.is_some();

    let mut total = 0usize;
    let mut uploaded = 0usize;
    for kind in SnapshotKind::ALL {
        let snapshots = store.list(Some(kind))?;
        if snapshots.is_empty() {
            continue;
        }
        println!("{} backups:", kind.as_str().to_uppercase());
        for snapshot in snapshots {
            total += 1;
            let state = if !remote_configured {
                "LOCAL ONLY"
            } else if registry.is_uploaded(snapshot.checksum()) {
                uploaded += 1;
                "UPLOADED"
            } else {
                "PENDING UPLOAD"
            };
            println!(
                "  {} - {} - {}",
                snapshot.filename(),
                format_mb(snapshot.metadata.backup_info.size_bytes),
                state
            );
        }
    }

    println!("Total local backups: {total}");
    if remote_configured {
        println!("Uploaded: {uploaded}");
        println!("Pending upload: {}", total - uploaded);
    } else {
        println!("Remote storage not configured - upload status unavailable");
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_test(config: &Config) -> pgvault::Result<ExitCode> {
    let remote = require_remote(config)?;
    let objects = open_store(remote)?;
    println!("Testing remote storage connection...");
    objects.test_connection()?;
    println!("Remote storage connection: OK");
    println!("Prefix: {}", remote.prefix);
    Ok(ExitCode::SUCCESS)
}

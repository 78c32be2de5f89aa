use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metadata::SnapshotKind;
use crate::registry::UploadRegistry;
use crate::store::{Snapshot, SnapshotStore};

/// Partition of one kind's snapshots into survivors and prune candidates.
#[derive(Debug)]
pub struct RetentionDecision {
    pub keep: Vec<Snapshot>,
    pub prune: Vec<Snapshot>,
}

/// Keeps the `keep_count` most recent snapshots by embedded metadata
/// timestamp (filesystem mtime lies after copies and restores), with ties
/// broken by lexicographic filename order for determinism. `keep_count <= 0`
/// keeps nothing: callers must pass an explicit positive count to retain
/// anything.
pub fn evaluate(mut snapshots: Vec<Snapshot>, keep_count: i64) -> RetentionDecision {
    snapshots.sort_by(|a, b| {
        b.timestamp()
            .cmp(&a.timestamp())
            .then_with(|| a.filename().cmp(b.filename()))
    });
    if keep_count <= 0 {
        return RetentionDecision {
            keep: Vec::new(),
            prune: snapshots,
        };
    }
    let keep_n = (keep_count as usize).min(snapshots.len());
    let prune = snapshots.split_off(keep_n);
    RetentionDecision {
        keep: snapshots,
        prune,
    }
}

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub kept_daily: usize,
    pub kept_weekly: usize,
    pub removed_daily: Vec<String>,
    pub removed_weekly: Vec<String>,
}

impl RetentionReport {
    pub fn total_removed(&self) -> usize {
        self.removed_daily.len() + self.removed_weekly.len()
    }
}

/// Prunes local daily and weekly snapshots with independent counts. Manual
/// snapshots are never auto-pruned. Local retention is a hard resource
/// constraint: a snapshot that was never uploaded is still pruned, with a
/// warning.
pub fn enforce_local(
    store: &SnapshotStore,
    registry: Option<&UploadRegistry>,
    retention_daily: i64,
    retention_weekly: i64,
) -> Result<RetentionReport> {
    let mut report = RetentionReport::default();
    for (kind, keep_count) in [
        (SnapshotKind::Daily, retention_daily),
        (SnapshotKind::Weekly, retention_weekly),
    ] {
        let decision = evaluate(store.list(Some(kind))?, keep_count);
        let removed = prune_all(store, registry, &decision.prune)?;
        match kind {
            SnapshotKind::Daily => {
                report.kept_daily = decision.keep.len();
                report.removed_daily = removed;
            }
            SnapshotKind::Weekly => {
                report.kept_weekly = decision.keep.len();
                report.removed_weekly = removed;
            }
            SnapshotKind::Manual => unreachable!(),
        }
    }
    if report.total_removed() > 0 {
        info!(
            "local retention: removed {} snapshots (kept {} daily, {} weekly)",
            report.total_removed(),
            report.kept_daily,
            report.kept_weekly
        );
    } else {
        debug!("local retention: nothing to prune");
    }
    Ok(report)
}

fn prune_all(
    store: &SnapshotStore,
    registry: Option<&UploadRegistry>,
    prune: &[Snapshot],
) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for snapshot in prune {
        if let Some(reg) = registry
            && !reg.is_uploaded(snapshot.checksum())
        {
            warn!(
                "pruning snapshot {} that was never uploaded to remote storage",
                snapshot.filename()
            );
        }
        store.delete(snapshot)?;
        removed.push(snapshot.filename().to_string());
    }
    Ok(removed)
}

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{RetrievalError, RetrievalResult};
use crate::index::{IndexSnapshot, IndexStore};
use crate::models::DocumentChange;
use crate::paths::{domains_root, is_document_path};
use crate::sources::{BrainSource, Rejected};

/// Watch `<brain>/domains` and apply debounced changes to `store` until
/// `shutdown` is cancelled.
pub async fn run_watcher(
    store: Arc<IndexStore>,
    brain_root: PathBuf,
    debounce: Duration,
    shutdown: CancellationToken,
) -> RetrievalResult<()> {
    let root = domains_root(&brain_root);
    tokio::fs::create_dir_all(&root).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let _ = tx.send(event.paths);
            }
            Err(err) => warn!("brain watcher error: {err}"),
        })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!(root = %root.display(), "watching brain for changes");

    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(paths) = rx.recv() => {
                pending.extend(paths);
            }
            _ = tokio::time::sleep(debounce) => {
                if !pending.is_empty() {
                    flush(&store, std::mem::take(&mut pending)).await;
                }
            }
        }
    }
    Ok(())
}

async fn flush(store: &IndexStore, paths: BTreeSet<PathBuf>) {
    debug!(paths = paths.len(), "applying brain changes");
    for path in paths {
        let snapshot = store.snapshot();
        let inspected = path.clone();
        let report = tokio::task::spawn_blocking(move || inspect_path(&snapshot, &inspected))
            .await
            .map_err(|err| RetrievalError::Io(std::io::Error::other(err)));
        let report = match report {
            Ok(report) => report,
            Err(err) => {
                warn!("failed to inspect changed path: {err}");
                continue;
            }
        };
        for change in report.changes {
            let id = change.document_id().to_string();
            if let Err(err) = store.apply_change(change).await {
                warn!(document = %id, "watcher reindex failed: {err}");
            }
        }
        if let Err(err) = store.refresh_rejections(&path, report.rejected).await {
            warn!(path = %path.display(), "failed to update rejected documents: {err}");
        }
    }
}

/// What a filesystem event on one path means for the index.
#[derive(Debug, Default, PartialEq)]
pub struct PathReport {
    pub changes: Vec<DocumentChange>,
    /// Files under the path that exist but cannot be loaded.
    pub rejected: Vec<Rejected>,
}

/// Document changes implied by a filesystem event on `path`, judged against
/// what `snapshot` currently holds for that location.
pub fn changes_for_path(snapshot: &IndexSnapshot, path: &Path) -> Vec<DocumentChange> {
    inspect_path(snapshot, path).changes
}

pub fn inspect_path(snapshot: &IndexSnapshot, path: &Path) -> PathReport {
    if path.is_dir() {
        let mut report = PathReport::default();
        for entry in WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && is_document_path(entry.path()))
        {
            let file = inspect_path(snapshot, entry.path());
            report.changes.extend(file.changes);
            report.rejected.extend(file.rejected);
        }
        return report;
    }

    let indexed: Vec<&str> = snapshot
        .documents()
        .filter(|doc| doc.path.as_deref().is_some_and(|p| p.starts_with(path)))
        .map(|doc| doc.id.as_str())
        .collect();

    let removals = |keep: Option<&str>| -> Vec<DocumentChange> {
        indexed
            .iter()
            .filter(|id| keep != Some(**id))
            .map(|id| DocumentChange::Removed(id.to_string()))
            .collect()
    };

    if !path.exists() || !is_document_path(path) {
        return PathReport {
            changes: removals(None),
            rejected: Vec::new(),
        };
    }

    match BrainSource::read_path(path) {
        Ok(doc) => {
            let mut changes = removals(Some(doc.id.as_str()));
            if let Some(existing) = snapshot.document(&doc.id)
                && let Some(first) = existing.path.as_deref().filter(|p| *p != path)
            {
                warn!(
                    id = %doc.id,
                    path = %path.display(),
                    "document id already indexed from another file, ignoring"
                );
                let rejected = Rejected {
                    origin: path.display().to_string(),
                    reason: format!(
                        "duplicate id '{}' (first defined in {})",
                        doc.id,
                        first.display()
                    ),
                };
                return PathReport {
                    changes,
                    rejected: vec![rejected],
                };
            }
            changes.push(if snapshot.document(&doc.id).is_some() {
                DocumentChange::Modified(doc)
            } else {
                DocumentChange::Added(doc)
            });
            PathReport {
                changes,
                rejected: Vec::new(),
            }
        }
        Err(err) => {
            warn!(path = %path.display(), "changed document no longer parses: {err}");
            PathReport {
                changes: removals(None),
                rejected: vec![Rejected {
                    origin: path.display().to_string(),
                    reason: err.to_string(),
                }],
            }
        }
    }
}

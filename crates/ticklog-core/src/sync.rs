//! Durability sync boundary.
//!
//! The pipeline pushes partition and view files to an external store and
//! pulls them back at startup to warm local state. The store is optional:
//! without one the pipeline degrades to local-only persistence. Push
//! failures are logged and retried on the next push cycle — a storage
//! outage never stalls data collection or serving.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{AssetId, SlotSpec, UtcInstant, ViewKind};

/// Errors raised by a sync store.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("sync store unavailable: {0}")]
    Unavailable(String),
}

/// External durable-storage contract.
///
/// Paths are relative to the data directory (`<asset>/<file>`), so the
/// remote layout mirrors the local one. `pull` returns `None` for absent
/// objects — absence is not an error.
pub trait SyncStore: Send + Sync {
    fn push<'a>(
        &'a self,
        rel_path: &'a str,
        bytes: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'a>>;

    fn pull<'a>(
        &'a self,
        rel_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, SyncError>> + Send + 'a>>;
}

/// Filesystem-backed reference store: a mirror directory tree.
#[derive(Debug, Clone)]
pub struct LocalMirrorSync {
    root: PathBuf,
}

impl LocalMirrorSync {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SyncStore for LocalMirrorSync {
    fn push<'a>(
        &'a self,
        rel_path: &'a str,
        bytes: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'a>> {
        Box::pin(async move {
            let target = self.root.join(rel_path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, bytes)?;
            Ok(())
        })
    }

    fn pull<'a>(
        &'a self,
        rel_path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, SyncError>> + Send + 'a>> {
        Box::pin(async move {
            let source = self.root.join(rel_path);
            match std::fs::read(&source) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(error) => Err(SyncError::Io(error)),
            }
        })
    }
}

/// Set of files awaiting a durability push, keyed by data-dir-relative
/// path. Failed pushes re-queue so the next cycle retries them.
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    inner: Arc<Mutex<BTreeSet<String>>>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, rel_path: impl Into<String>) {
        self.inner
            .lock()
            .expect("dirty set lock never poisons")
            .insert(rel_path.into());
    }

    pub fn mark_all(&self, rel_paths: impl IntoIterator<Item = String>) {
        let mut set = self.inner.lock().expect("dirty set lock never poisons");
        set.extend(rel_paths);
    }

    pub fn drain(&self) -> Vec<String> {
        let mut set = self.inner.lock().expect("dirty set lock never poisons");
        let drained: Vec<String> = set.iter().cloned().collect();
        set.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("dirty set lock never poisons")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Push every dirty file once; failures are logged and re-queued.
///
/// Returns the number of files pushed successfully.
pub async fn push_dirty(
    sync: &Arc<dyn SyncStore>,
    data_dir: &Path,
    dirty: &DirtySet,
) -> usize {
    let mut pushed = 0usize;
    for rel_path in dirty.drain() {
        let local = data_dir.join(&rel_path);
        let bytes = match std::fs::read(&local) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                // Deleted or renamed since it was marked; nothing to push.
                continue;
            }
            Err(error) => {
                warn!(file = %local.display(), %error, "failed to read file for sync push");
                dirty.mark(rel_path);
                continue;
            }
        };

        match sync.push(&rel_path, &bytes).await {
            Ok(()) => {
                pushed += 1;
                debug!(file = %rel_path, "synced to durable store");
            }
            Err(error) => {
                warn!(file = %rel_path, %error, "sync push failed; will retry next cycle");
                dirty.mark(rel_path);
            }
        }
    }
    pushed
}

/// Warm local state for one asset before polling begins: pull the active
/// partition and the latest views. Files already present locally are kept
/// (local data is never clobbered by a stale remote copy). Returns the
/// number of files hydrated.
pub async fn hydrate_asset(
    sync: &Arc<dyn SyncStore>,
    data_dir: &Path,
    asset: &AssetId,
    spec: SlotSpec,
    now: UtcInstant,
) -> Result<usize, SyncError> {
    let dir = asset.dir_name();
    let mut candidates = vec![format!("{dir}/{}.csv", spec.label(now))];
    for kind in [
        ViewKind::Historical,
        ViewKind::Recent,
        ViewKind::Daily(now.date()),
        ViewKind::Metadata,
        ViewKind::Index,
    ] {
        candidates.push(format!("{dir}/views/{}", kind.file_name()));
    }

    let mut hydrated = 0usize;
    for rel_path in candidates {
        let local = data_dir.join(&rel_path);
        if local.exists() {
            continue;
        }
        if let Some(bytes) = sync.pull(&rel_path).await? {
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&local, bytes)?;
            hydrated += 1;
            debug!(file = %rel_path, "hydrated from durable store");
        }
    }

    Ok(hydrated)
}

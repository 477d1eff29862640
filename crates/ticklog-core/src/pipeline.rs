//! Per-asset pipelines and the supervisor that owns them.
//!
//! One pipeline per configured asset runs an independent poll loop:
//! fetch → append → rebuild → publish. Pipelines share no mutable state;
//! the only cross-asset resource is the read-only registry. Within one
//! asset, the writer/aggregator pair lives behind a mutex so an append
//! and a rebuild can never interleave, while readers of the published
//! generation never touch that lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AssetRuntime, Registry};
use crate::fetch::{BookSource, ExchangeBookAdapter};
use crate::http_client::HttpClient;
use crate::partition::{AppendOutcome, PartitionStore, PartitionWriter, WriteError};
use crate::retry::Backoff;
use crate::sync::{hydrate_asset, push_dirty, DirtySet, LocalMirrorSync, SyncStore};
use crate::views::{
    Aggregator, AggregatorSettings, Generation, RebuildError, RebuildScope, ViewKind,
};
use crate::{AssetId, Snapshot, UtcInstant};

/// Lifecycle state of one asset's poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Polling,
    Backoff,
}

/// Errors returned by the serving boundary.
#[derive(Debug, Error)]
pub enum ViewQueryError {
    #[error("unknown asset '{asset}'")]
    UnknownAsset { asset: String },

    #[error("views for '{asset}' are not yet available")]
    NotYetAvailable { asset: String },

    #[error("view '{file}' not found for '{asset}'")]
    NotFound { asset: String, file: String },
}

/// Errors returned by an on-demand rebuild trigger.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unknown asset '{asset}'")]
    UnknownAsset { asset: String },

    #[error(transparent)]
    Rebuild(#[from] RebuildError),
}

/// Writer + aggregator for one asset, guarded by the per-asset mutex.
struct PipelineCore {
    writer: PartitionWriter,
    aggregator: Aggregator,
    publisher: watch::Sender<Option<Arc<Generation>>>,
    dirty: DirtySet,
    asset_dir: String,
}

impl PipelineCore {
    /// Append with one immediate retry: the in-memory snapshot is never
    /// dropped without a second attempt.
    fn append_with_retry(&mut self, snapshot: &Snapshot) -> Result<AppendOutcome, WriteError> {
        let outcome = match self.writer.append(snapshot) {
            Ok(outcome) => outcome,
            Err(first) => {
                warn!(asset = %snapshot.asset, error = %first,
                      "append failed; retrying once before dropping the snapshot");
                self.writer.append(snapshot)?
            }
        };

        self.dirty
            .mark(format!("{}/{}.csv", self.asset_dir, outcome.label));
        if let Some(sealed) = outcome.sealed {
            self.dirty.mark(format!("{}/{sealed}.csv", self.asset_dir));
        }
        Ok(outcome)
    }

    fn rebuild_and_publish(
        &mut self,
        scope: RebuildScope,
        now: UtcInstant,
        appended: Option<&Snapshot>,
    ) -> Result<(), RebuildError> {
        let prev = self.publisher.borrow().clone();
        let generation = self
            .aggregator
            .rebuild(scope, now, prev.as_deref(), appended)?;

        self.dirty.mark_all(
            generation
                .view_files()
                .into_iter()
                .map(|file| format!("{}/{file}", self.asset_dir)),
        );
        self.publisher.send_replace(Some(Arc::new(generation)));
        Ok(())
    }
}

/// The fetch/write/aggregate unit for one asset.
pub struct AssetPipeline {
    runtime: AssetRuntime,
    source: Arc<dyn BookSource>,
    core: Arc<Mutex<PipelineCore>>,
    views: watch::Receiver<Option<Arc<Generation>>>,
    state: Arc<RwLock<PipelineState>>,
    backoff: Backoff,
    dirty: DirtySet,
}

impl AssetPipeline {
    pub fn build(
        data_dir: &Path,
        runtime: AssetRuntime,
        source: Arc<dyn BookSource>,
    ) -> Result<Self, WriteError> {
        let store = PartitionStore::open(data_dir, runtime.asset.clone(), runtime.slot)?;
        let writer = PartitionWriter::open(store.clone())?;
        let aggregator = Aggregator::new(
            store,
            AggregatorSettings {
                exchange: runtime.exchange.clone(),
                recent_window: runtime.recent_window,
                bucket_secs: runtime.bucket_secs,
                ma_windows: runtime.ma_windows.clone(),
                poll_interval: runtime.poll_interval,
            },
        );

        let (publisher, views) = watch::channel(None);
        let dirty = DirtySet::new();
        let core = PipelineCore {
            writer,
            aggregator,
            publisher,
            dirty: dirty.clone(),
            asset_dir: runtime.asset.dir_name(),
        };

        Ok(Self {
            runtime,
            source,
            core: Arc::new(Mutex::new(core)),
            views,
            state: Arc::new(RwLock::new(PipelineState::Stopped)),
            backoff: Backoff::default(),
            dirty,
        })
    }

    /// Replace the fetch-failure backoff policy (tests use a fixed,
    /// near-zero delay).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            asset: self.runtime.asset.clone(),
            endpoint_name: self.runtime.endpoint_name.clone(),
            core: Arc::clone(&self.core),
            views: self.views.clone(),
            state: Arc::clone(&self.state),
        }
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.write().expect("state lock never poisons") = state;
    }

    /// Republish views from partitions already on disk so a restart
    /// serves data before the first fetch of this run.
    pub async fn warm_start(&self) {
        let mut core = self.core.lock().await;
        let has_partitions = match core.writer.store().list() {
            Ok(partitions) => !partitions.is_empty(),
            Err(error) => {
                warn!(asset = %self.runtime.asset, %error,
                      "could not list partitions during warm start");
                false
            }
        };
        if !has_partitions {
            return;
        }
        if let Err(error) =
            core.rebuild_and_publish(RebuildScope::Full, UtcInstant::now(), None)
        {
            warn!(asset = %self.runtime.asset, %error,
                  "warm-start rebuild failed; views stay unavailable until first append");
        }
    }

    /// Poll until shutdown. Fetch failures back off and keep cycling;
    /// write failures are retried next tick; rebuild failures keep the
    /// previously published generation being served.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.set_state(PipelineState::Polling);
        info!(asset = %self.runtime.asset, endpoint = %self.runtime.endpoint,
              interval_secs = self.runtime.poll_interval.as_secs(), "pipeline polling started");

        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let tick_started = tokio::time::Instant::now();
            match self.source.fetch().await {
                Ok(snapshot) => {
                    if failures > 0 {
                        info!(asset = %self.runtime.asset, after_failures = failures,
                              "fetch recovered");
                    }
                    failures = 0;
                    self.set_state(PipelineState::Polling);
                    self.ingest(snapshot).await;

                    let wait = self
                        .runtime
                        .poll_interval
                        .saturating_sub(tick_started.elapsed());
                    if !sleep_or_shutdown(wait, &mut shutdown).await {
                        break;
                    }
                }
                Err(fetch_error) => {
                    failures += 1;
                    self.set_state(PipelineState::Backoff);
                    warn!(asset = %self.runtime.asset, code = fetch_error.code(),
                          error = %fetch_error, consecutive = failures,
                          "fetch failed; backing off");

                    let delay = self.backoff.delay(failures.saturating_sub(1));
                    if !sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    self.set_state(PipelineState::Polling);
                }
            }
        }

        self.set_state(PipelineState::Stopped);
        info!(asset = %self.runtime.asset, "pipeline stopped");
    }

    async fn ingest(&self, snapshot: Snapshot) {
        let now = UtcInstant::now();
        let mut core = self.core.lock().await;
        match core.append_with_retry(&snapshot) {
            Ok(outcome) => {
                let scope = if outcome.rotated {
                    RebuildScope::Full
                } else {
                    RebuildScope::Incremental
                };
                if let Err(error) = core.rebuild_and_publish(scope, now, Some(&snapshot)) {
                    error!(asset = %self.runtime.asset, %error,
                           "rebuild failed; previous generation remains published");
                }
            }
            Err(error) => {
                error!(asset = %self.runtime.asset, %error,
                       "append failed after retry; snapshot lost for this tick");
            }
        }
    }
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            Err(_) => false,
        },
    }
}

/// Cloneable serving-boundary handle for one asset.
#[derive(Clone)]
pub struct PipelineHandle {
    asset: AssetId,
    endpoint_name: String,
    core: Arc<Mutex<PipelineCore>>,
    views: watch::Receiver<Option<Arc<Generation>>>,
    state: Arc<RwLock<PipelineState>>,
}

impl PipelineHandle {
    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read().expect("state lock never poisons")
    }

    /// Most recently published generation, without waiting on any rebuild.
    pub fn latest_generation(&self) -> Option<Arc<Generation>> {
        self.views.borrow().clone()
    }

    /// Serving boundary: bytes of one view from the latest generation.
    pub fn view_bytes(&self, kind: ViewKind) -> Result<Vec<u8>, ViewQueryError> {
        let generation = self
            .latest_generation()
            .ok_or_else(|| ViewQueryError::NotYetAvailable {
                asset: self.asset.to_string(),
            })?;
        generation
            .view_bytes(kind)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| ViewQueryError::NotFound {
                asset: self.asset.to_string(),
                file: kind.file_name(),
            })
    }

    /// On-demand regeneration, serialized with the poll loop's appends.
    pub async fn trigger_rebuild(&self, scope: RebuildScope) -> Result<(), RebuildError> {
        let mut core = self.core.lock().await;
        core.rebuild_and_publish(scope, UtcInstant::now(), None)
    }

    /// Out-of-order appends observed by this asset's writer.
    pub async fn out_of_order_total(&self) -> u64 {
        self.core.lock().await.writer.out_of_order_total()
    }
}

/// Owns one pipeline per configured asset; faults stay inside the asset
/// that produced them.
pub struct Supervisor {
    handles: BTreeMap<AssetId, PipelineHandle>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    startup_errors: Vec<(String, String)>,
}

impl Supervisor {
    /// Build and start every runnable pipeline from the registry.
    ///
    /// `sync_store` overrides the configured mirror (tests inject fakes
    /// here); with neither, the process runs local-only. Rejected config
    /// entries and per-asset build failures are surfaced in
    /// [`Supervisor::startup_errors`] while the remaining assets run.
    pub async fn start(
        registry: Registry,
        http: Arc<dyn HttpClient>,
        sync_store: Option<Arc<dyn SyncStore>>,
    ) -> Self {
        let Registry {
            data_dir,
            sync: sync_config,
            assets,
            rejected,
        } = registry;

        let sync: Option<Arc<dyn SyncStore>> = sync_store.or_else(|| {
            sync_config
                .as_ref()
                .map(|cfg| Arc::new(LocalMirrorSync::new(&cfg.mirror_dir)) as Arc<dyn SyncStore>)
        });
        let sync_interval = Duration::from_secs(
            sync_config.as_ref().map(|cfg| cfg.interval_secs.max(1)).unwrap_or(60),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = BTreeMap::new();
        let mut tasks = Vec::new();
        let mut startup_errors: Vec<(String, String)> = rejected
            .into_iter()
            .map(|(pair, error)| (pair, error.to_string()))
            .collect();
        for (pair, reason) in &startup_errors {
            error!(asset = %pair, %reason, "asset rejected at startup; pipeline stays stopped");
        }

        for runtime in assets {
            if let Some(sync) = &sync {
                match hydrate_asset(
                    sync,
                    &data_dir,
                    &runtime.asset,
                    runtime.slot,
                    UtcInstant::now(),
                )
                .await
                {
                    Ok(hydrated) if hydrated > 0 => {
                        info!(asset = %runtime.asset, files = hydrated,
                              "hydrated local state from durable store");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(asset = %runtime.asset, %error,
                              "hydration failed; continuing with local state");
                    }
                }
            }

            let source: Arc<dyn BookSource> = Arc::new(ExchangeBookAdapter::new(
                runtime.asset.clone(),
                runtime.exchange.clone(),
                runtime.endpoint.clone(),
                runtime.book_depth,
                runtime.fetch_timeout.as_millis() as u64,
                Arc::clone(&http),
            ));

            let pair = runtime.asset.to_string();
            match AssetPipeline::build(&data_dir, runtime, source) {
                Ok(pipeline) => {
                    let pipeline = Arc::new(pipeline);
                    pipeline.warm_start().await;
                    handles.insert(pipeline.runtime.asset.clone(), pipeline.handle());

                    if let Some(sync) = &sync {
                        tasks.push(tokio::spawn(run_sync_pusher(
                            Arc::clone(sync),
                            data_dir.clone(),
                            pipeline.dirty.clone(),
                            sync_interval,
                            shutdown_rx.clone(),
                            pipeline.runtime.asset.clone(),
                        )));
                    }
                    tasks.push(tokio::spawn(
                        Arc::clone(&pipeline).run(shutdown_rx.clone()),
                    ));
                }
                Err(error) => {
                    error!(asset = %pair, %error,
                           "pipeline failed to start; other assets are unaffected");
                    startup_errors.push((pair, error.to_string()));
                }
            }
        }

        Self {
            handles,
            tasks,
            shutdown,
            startup_errors,
        }
    }

    pub fn handle(&self, asset: &AssetId) -> Option<&PipelineHandle> {
        self.handles.get(asset)
    }

    pub fn handles(&self) -> impl Iterator<Item = &PipelineHandle> {
        self.handles.values()
    }

    /// Config entries and pipelines that could not start, with reasons.
    pub fn startup_errors(&self) -> &[(String, String)] {
        &self.startup_errors
    }

    /// Serving boundary: `getView(asset, viewKind)`.
    pub fn view_bytes(&self, asset: &AssetId, kind: ViewKind) -> Result<Vec<u8>, ViewQueryError> {
        let handle = self
            .handles
            .get(asset)
            .ok_or_else(|| ViewQueryError::UnknownAsset {
                asset: asset.to_string(),
            })?;
        handle.view_bytes(kind)
    }

    /// Serving boundary: `triggerRebuild(asset, scope)`.
    pub async fn trigger_rebuild(
        &self,
        asset: &AssetId,
        scope: RebuildScope,
    ) -> Result<(), TriggerError> {
        let handle = self
            .handles
            .get(asset)
            .ok_or_else(|| TriggerError::UnknownAsset {
                asset: asset.to_string(),
            })?;
        handle.trigger_rebuild(scope).await?;
        Ok(())
    }

    /// Stop taking new ticks and wait for in-flight work to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("supervisor shut down");
    }
}

async fn run_sync_pusher(
    sync: Arc<dyn SyncStore>,
    data_dir: PathBuf,
    dirty: DirtySet,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    asset: AssetId,
) {
    loop {
        if !sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
        let pushed = push_dirty(&sync, &data_dir, &dirty).await;
        if pushed > 0 {
            debug!(asset = %asset, files = pushed, "durability push cycle complete");
        }
    }
    // Final flush so artifacts written during the last ticks land durably.
    push_dirty(&sync, &data_dir, &dirty).await;
}

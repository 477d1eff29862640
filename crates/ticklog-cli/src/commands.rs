use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use ticklog_core::{
    Aggregator, AggregatorSettings, AssetId, PartitionStore, PipelineConfig, RebuildScope,
    Registry, ReqwestHttpClient, Supervisor, UtcInstant,
};

use crate::error::CliError;

fn load_registry(config_path: &Path) -> Result<Registry, CliError> {
    let config = PipelineConfig::load(config_path)?;
    Ok(config.validate()?)
}

/// `ticklog run`: start every runnable pipeline and block until ctrl-c.
pub async fn run(config_path: &Path) -> Result<(), CliError> {
    let registry = load_registry(config_path)?;

    let supervisor =
        Supervisor::start(registry, Arc::new(ReqwestHttpClient::new()), None).await;

    for (pair, reason) in supervisor.startup_errors() {
        error!(asset = %pair, %reason, "asset did not start");
    }
    let running: Vec<String> = supervisor
        .handles()
        .map(|handle| handle.asset().to_string())
        .collect();
    if running.is_empty() {
        error!("no asset pipelines are running; check the configuration");
    } else {
        info!(assets = ?running, "ticklog is sampling");
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; draining in-flight work");
    supervisor.shutdown().await;
    Ok(())
}

/// `ticklog rebuild`: one-shot full view regeneration for one asset.
pub fn rebuild(config_path: &Path, pair: &str) -> Result<(), CliError> {
    let registry = load_registry(config_path)?;
    let asset = AssetId::parse(pair)?;

    let runtime = registry
        .assets
        .iter()
        .find(|runtime| runtime.asset == asset)
        .ok_or_else(|| CliError::UnknownPair {
            pair: asset.to_string(),
        })?;

    let store = PartitionStore::open(&registry.data_dir, runtime.asset.clone(), runtime.slot)?;
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

    let generation = aggregator.rebuild(RebuildScope::Full, UtcInstant::now(), None, None)?;
    let stats = generation.stats();
    let summary = json!({
        "asset": runtime.asset.as_str(),
        "generation": generation.id.to_string(),
        "total_records": stats.total_records,
        "views_dir": aggregator.views_dir(),
        "daily_views": generation.daily_dates().count(),
    });
    println!("{}", serde_json::to_string_pretty(&summary).expect("summary serializes"));
    Ok(())
}

/// `ticklog assets`: dump the validated registry as JSON.
pub fn assets(config_path: &Path) -> Result<(), CliError> {
    let registry = load_registry(config_path)?;

    let assets: Vec<_> = registry
        .assets
        .iter()
        .map(|runtime| {
            json!({
                "pair": runtime.asset.as_str(),
                "exchange": runtime.exchange,
                "endpoint": runtime.endpoint,
                "endpoint_name": runtime.endpoint_name,
                "poll_interval_secs": runtime.poll_interval.as_secs(),
                "book_depth": runtime.book_depth,
                "slot_hours": runtime.slot.width_hours(),
                "bucket_secs": runtime.bucket_secs,
                "ma_windows": runtime.ma_windows,
            })
        })
        .collect();
    let rejected: Vec<_> = registry
        .rejected
        .iter()
        .map(|(pair, error)| json!({"pair": pair, "error": error.to_string()}))
        .collect();

    let doc = json!({"assets": assets, "rejected": rejected});
    println!("{}", serde_json::to_string_pretty(&doc).expect("doc serializes"));
    Ok(())
}

//! # ticklog Core
//!
//! Order-book sampling, partition rotation, and chart-view aggregation.
//!
//! ## Overview
//!
//! This crate is the ingestion-and-aggregation pipeline behind the
//! ticklog service:
//!
//! - **Snapshot fetcher** polls an exchange's level-2 book endpoint and
//!   normalizes each response into a [`Snapshot`]
//! - **Partition writer** appends snapshots to time-rotated, append-only
//!   CSV partitions (one file per asset and wall-clock slot)
//! - **View aggregator** rebuilds the derived JSON views served to chart
//!   clients: full history, rolling recent window, per-day minute buckets
//!   with moving averages, metadata, and an index
//! - **Supervisor** runs one isolated pipeline per configured asset
//! - **Sync boundary** pushes artifacts to, and hydrates from, an
//!   external durable store
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | JSON configuration and the validated registry |
//! | [`domain`] | Core types (`Snapshot`, `AssetId`, `SlotSpec`, `UtcInstant`) |
//! | [`fetch`] | `BookSource` trait and the exchange book adapter |
//! | [`http_client`] | HTTP transport abstraction (reqwest / mock) |
//! | [`partition`] | Partition storage, rotation, and the CSV codec |
//! | [`pipeline`] | Per-asset poll loops, supervisor, serving handles |
//! | [`retry`] | Backoff policy for fetch failures |
//! | [`sync`] | Durability push/pull boundary |
//! | [`views`] | View aggregation and generation publishing |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ticklog_core::{PipelineConfig, ReqwestHttpClient, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::load("ticklog.json".as_ref())?;
//!     let registry = config.validate()?;
//!
//!     let supervisor =
//!         Supervisor::start(registry, Arc::new(ReqwestHttpClient::new()), None).await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees
//!
//! - Every view is a pure function of the partitions it covers; a full
//!   rebuild over the same partitions is byte-identical apart from the
//!   generation stamp.
//! - Readers of the published generation never wait on a rebuild, and
//!   never observe a set of views that mixes two generations.
//! - Faults are isolated per asset: a dead upstream or a malformed
//!   response backs off one pipeline and touches nothing else.

pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod http_client;
pub mod partition;
pub mod pipeline;
pub mod retry;
pub mod sync;
pub mod views;

// Re-export commonly used types at crate root for convenience

// Domain models
pub use domain::{AssetId, BookLevel, SlotLabel, SlotSpec, Snapshot, UtcInstant};

// Error types
pub use error::ValidationError;

// Fetch boundary
pub use fetch::{BookSource, ExchangeBookAdapter, FetchError, FetchErrorKind};

// HTTP transport
pub use http_client::{
    HttpClient, HttpError, HttpErrorKind, HttpRequest, HttpResponse, NoopHttpClient,
    ReqwestHttpClient,
};

// Partition storage
pub use partition::{
    AppendOutcome, PartitionRef, PartitionStore, PartitionWriter, WriteError, PARTITION_HEADER,
};

// Views
pub use views::{
    Aggregator, AggregatorSettings, ChartPoint, DailyPoint, Generation, GenerationStats,
    RebuildError, RebuildScope, ViewKind,
};

// Pipeline and serving boundary
pub use pipeline::{
    AssetPipeline, PipelineHandle, PipelineState, Supervisor, TriggerError, ViewQueryError,
};

// Backoff policy
pub use retry::Backoff;

// Durability boundary
pub use sync::{DirtySet, LocalMirrorSync, SyncError, SyncStore};

// Configuration
pub use config::{
    default_endpoint, AssetEntry, AssetRuntime, ConfigError, PipelineConfig, Registry, SyncConfig,
};

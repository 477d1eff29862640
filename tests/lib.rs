//! Shared fixtures for ticklog behavior tests.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub use ticklog_core::{
    AssetId, AssetRuntime, BookSource, FetchError, SlotSpec, Snapshot, UtcInstant,
};

/// Validated runtime settings for a test asset, with a fast poll.
pub fn test_runtime(pair: &str) -> AssetRuntime {
    AssetRuntime {
        asset: AssetId::parse(pair).expect("valid pair"),
        exchange: String::from("Coinbase"),
        endpoint: format!("https://api.exchange.test/products/{pair}/book?level=2"),
        endpoint_name: pair.to_ascii_lowercase(),
        poll_interval: Duration::from_millis(10),
        book_depth: 5,
        slot: SlotSpec::new(8).expect("valid width"),
        recent_window: time::Duration::hours(24),
        bucket_secs: 60,
        ma_windows: vec![50, 100, 200],
        fetch_timeout: Duration::from_millis(200),
    }
}

/// Snapshot fixture at a fixed timestamp.
pub fn snapshot_at(pair: &str, ts: &str, price: f64) -> Snapshot {
    Snapshot::new(
        UtcInstant::parse(ts).expect("valid timestamp"),
        AssetId::parse(pair).expect("valid pair"),
        "Coinbase",
        price,
        price - 0.01,
        price + 0.01,
        0.02,
        100.0,
        0.02,
        (0.02 / price) * 100.0,
    )
    .expect("valid snapshot")
}

/// Snapshot fixture stamped with the current instant, for live-pipeline
/// tests where the recent window is anchored at wall-clock now.
pub fn snapshot_now(pair: &str, price: f64) -> Snapshot {
    Snapshot::new(
        UtcInstant::now(),
        AssetId::parse(pair).expect("valid pair"),
        "Coinbase",
        price,
        price - 0.01,
        price + 0.01,
        0.02,
        100.0,
        0.02,
        (0.02 / price) * 100.0,
    )
    .expect("valid snapshot")
}

/// A level-2 book payload in the upstream wire shape.
pub const BOOK_JSON: &str = r#"{
    "bids": [["0.84", "100.5", 3], ["0.83", "50", 1]],
    "asks": [["0.86", "80", 2], ["0.87", "40", 1]],
    "sequence": 123456
}"#;

/// Book source driven by a script of fetch results; replays `fallback`
/// once the script is exhausted and counts every fetch.
pub struct ScriptedBookSource {
    asset: AssetId,
    script: Mutex<VecDeque<Result<Snapshot, FetchError>>>,
    fallback: Result<Snapshot, FetchError>,
    fetches: AtomicU32,
}

impl ScriptedBookSource {
    pub fn new(
        pair: &str,
        script: Vec<Result<Snapshot, FetchError>>,
        fallback: Result<Snapshot, FetchError>,
    ) -> Self {
        Self {
            asset: AssetId::parse(pair).expect("valid pair"),
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            fetches: AtomicU32::new(0),
        }
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl BookSource for ScriptedBookSource {
    fn asset(&self) -> &AssetId {
        &self.asset
    }

    fn fetch<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Snapshot, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .expect("script lock never poisons")
                .pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        })
    }
}

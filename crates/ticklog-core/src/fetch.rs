//! Snapshot fetcher: polls an upstream level-2 order-book endpoint and
//! normalizes the response into a [`Snapshot`].
//!
//! A fetch failure is never a stop condition — it is reported to the
//! pipeline, which backs off and polls again.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;

use crate::http_client::{HttpClient, HttpErrorKind, HttpRequest};
use crate::{AssetId, BookLevel, Snapshot, UtcInstant, ValidationError};

/// Fetch-failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The upstream call exceeded its bounded timeout.
    Timeout,
    /// Transport failure or upstream error status.
    Unreachable,
    /// Non-JSON payload or a payload that does not look like a book.
    MalformedResponse,
    /// A book with an empty bid or ask side.
    EmptyBook,
}

/// Structured fetch error surfaced to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    kind: FetchErrorKind,
    message: String,
}

impl FetchError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Unreachable,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::MalformedResponse,
            message: message.into(),
        }
    }

    pub fn empty_book(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::EmptyBook,
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Every fetch failure is retried on a later tick; none is fatal.
    pub const fn retryable(&self) -> bool {
        true
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            FetchErrorKind::Timeout => "fetch.timeout",
            FetchErrorKind::Unreachable => "fetch.unreachable",
            FetchErrorKind::MalformedResponse => "fetch.malformed_response",
            FetchErrorKind::EmptyBook => "fetch.empty_book",
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for FetchError {}

/// Source of normalized snapshots for one asset.
///
/// Implementations must be `Send + Sync`; the pipeline shares them across
/// the poll task and on-demand triggers.
pub trait BookSource: Send + Sync {
    fn asset(&self) -> &AssetId;

    /// Fetch one snapshot. The snapshot timestamp is the completion
    /// instant of the call, not an upstream-provided time.
    fn fetch<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Snapshot, FetchError>> + Send + 'a>>;
}

/// Book fetcher for one asset against a configured exchange endpoint.
///
/// Over a mock transport the adapter serves deterministic seeded books so
/// the whole pipeline runs offline in tests.
pub struct ExchangeBookAdapter {
    asset: AssetId,
    exchange: String,
    endpoint: String,
    depth: usize,
    timeout_ms: u64,
    http_client: Arc<dyn HttpClient>,
}

impl ExchangeBookAdapter {
    pub fn new(
        asset: AssetId,
        exchange: impl Into<String>,
        endpoint: impl Into<String>,
        depth: usize,
        timeout_ms: u64,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            asset,
            exchange: exchange.into(),
            endpoint: endpoint.into(),
            depth,
            timeout_ms,
            http_client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch_real(&self) -> Result<Snapshot, FetchError> {
        let request = HttpRequest::get(&self.endpoint).with_timeout_ms(self.timeout_ms);

        let response = self.http_client.execute(request).await.map_err(|error| {
            match error.kind() {
                HttpErrorKind::Timeout => FetchError::timeout(error.message().to_owned()),
                HttpErrorKind::Connect | HttpErrorKind::Other => {
                    FetchError::unreachable(error.message().to_owned())
                }
            }
        })?;

        if !response.is_success() {
            return Err(FetchError::unreachable(format!(
                "upstream returned status {}",
                response.status
            )));
        }

        let (bids, asks) = parse_book(&response.body)?;
        self.normalize(UtcInstant::now(), &bids, &asks)
    }

    fn fetch_fake(&self) -> Result<Snapshot, FetchError> {
        let seed = asset_seed(&self.asset);
        let mid = 0.5 + (seed % 5_000) as f64 / 100.0;
        let tick = 0.01;

        let mut bids = Vec::with_capacity(self.depth);
        let mut asks = Vec::with_capacity(self.depth);
        for level in 0..self.depth.max(1) {
            let offset = tick * (level as f64 + 0.5);
            bids.push(BookLevel {
                price: mid - offset,
                size: 10.0 + (seed % 90) as f64 + level as f64,
            });
            asks.push(BookLevel {
                price: mid + offset,
                size: 10.0 + (seed % 70) as f64 + level as f64,
            });
        }

        self.normalize(UtcInstant::now(), &bids, &asks)
    }

    fn normalize(
        &self,
        timestamp: UtcInstant,
        bids: &[BookLevel],
        asks: &[BookLevel],
    ) -> Result<Snapshot, FetchError> {
        Snapshot::from_book(
            timestamp,
            self.asset.clone(),
            self.exchange.clone(),
            bids,
            asks,
            self.depth,
        )
        .map_err(|error| match error {
            ValidationError::EmptyBookSide => {
                FetchError::empty_book("order book has an empty side")
            }
            other => FetchError::malformed(format!("book failed validation: {other}")),
        })
    }
}

impl BookSource for ExchangeBookAdapter {
    fn asset(&self) -> &AssetId {
        &self.asset
    }

    fn fetch<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Snapshot, FetchError>> + Send + 'a>> {
        Box::pin(async move {
            if self.http_client.is_mock() {
                self.fetch_fake()
            } else {
                self.fetch_real().await
            }
        })
    }
}

// Level-2 book payload, e.g.
// `{"bids": [["0.8461", "120.5", 3], ...], "asks": [...], "sequence": ...}`.
// Prices and sizes arrive as strings on most venues; numbers are accepted
// too.
#[derive(Debug, Deserialize)]
struct BookPayload {
    #[serde(default)]
    bids: Vec<RawLevel>,
    #[serde(default)]
    asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct RawLevel(Vec<RawField>);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawField {
    Text(String),
    Num(f64),
    Other(serde_json::Value),
}

impl RawField {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Text(text) => text.parse().ok(),
            Self::Num(value) => Some(*value),
            Self::Other(_) => None,
        }
    }
}

fn parse_book(body: &str) -> Result<(Vec<BookLevel>, Vec<BookLevel>), FetchError> {
    let payload: BookPayload = serde_json::from_str(body)
        .map_err(|e| FetchError::malformed(format!("failed to parse book payload: {e}")))?;

    let bids = parse_side("bids", &payload.bids)?;
    let asks = parse_side("asks", &payload.asks)?;
    Ok((bids, asks))
}

fn parse_side(side: &'static str, levels: &[RawLevel]) -> Result<Vec<BookLevel>, FetchError> {
    levels
        .iter()
        .enumerate()
        .map(|(index, level)| {
            let price = level.0.first().and_then(RawField::as_f64);
            let size = level.0.get(1).and_then(RawField::as_f64);
            match (price, size) {
                (Some(price), Some(size)) => Ok(BookLevel { price, size }),
                _ => Err(FetchError::malformed(format!(
                    "{side} level {index} is not a [price, size, ...] entry"
                ))),
            }
        })
        .collect()
}

fn asset_seed(asset: &AssetId) -> u64 {
    asset.as_str().bytes().fold(0_u64, |acc, byte| {
        acc.wrapping_mul(33).wrapping_add(byte as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpError, HttpResponse, NoopHttpClient};

    struct ScriptedHttpClient {
        response: Result<HttpResponse, HttpError>,
    }

    impl HttpClient for ScriptedHttpClient {
        fn execute<'a>(
            &'a self,
            _request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
            let response = self.response.clone();
            Box::pin(async move { response })
        }
    }

    fn adapter(client: Arc<dyn HttpClient>) -> ExchangeBookAdapter {
        ExchangeBookAdapter::new(
            AssetId::parse("ADA-USD").expect("valid pair"),
            "Coinbase",
            "https://api.exchange.test/products/ADA-USD/book?level=2",
            2,
            1_000,
            client,
        )
    }

    #[tokio::test]
    async fn parses_string_levels_into_snapshot() {
        let body = r#"{"bids": [["0.84", "100.5", 3], ["0.83", "50"]],
                       "asks": [["0.86", "80", 1], ["0.87", "40"]],
                       "sequence": 12345}"#;
        let client = Arc::new(ScriptedHttpClient {
            response: Ok(HttpResponse::ok_json(body)),
        });

        let snapshot = adapter(client).fetch().await.expect("fetch should succeed");
        assert!((snapshot.price - 0.85).abs() < 1e-12);
        assert!((snapshot.volume - 270.5).abs() < 1e-12);
        assert_eq!(snapshot.exchange, "Coinbase");
    }

    #[tokio::test]
    async fn empty_side_is_an_empty_book_error() {
        let body = r#"{"bids": [], "asks": [["0.86", "80"]]}"#;
        let client = Arc::new(ScriptedHttpClient {
            response: Ok(HttpResponse::ok_json(body)),
        });

        let error = adapter(client).fetch().await.expect_err("must fail");
        assert_eq!(error.kind(), FetchErrorKind::EmptyBook);
        assert!(error.retryable());
    }

    #[tokio::test]
    async fn non_json_payload_is_malformed() {
        let client = Arc::new(ScriptedHttpClient {
            response: Ok(HttpResponse::ok_json("<html>rate limited</html>")),
        });

        let error = adapter(client).fetch().await.expect_err("must fail");
        assert_eq!(error.kind(), FetchErrorKind::MalformedResponse);
    }

    #[tokio::test]
    async fn transport_timeout_maps_to_timeout_kind() {
        let client = Arc::new(ScriptedHttpClient {
            response: Err(HttpError::timeout("request timeout")),
        });

        let error = adapter(client).fetch().await.expect_err("must fail");
        assert_eq!(error.kind(), FetchErrorKind::Timeout);
    }

    #[tokio::test]
    async fn upstream_error_status_maps_to_unreachable() {
        let client = Arc::new(ScriptedHttpClient {
            response: Ok(HttpResponse {
                status: 503,
                body: String::new(),
            }),
        });

        let error = adapter(client).fetch().await.expect_err("must fail");
        assert_eq!(error.kind(), FetchErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn mock_transport_serves_deterministic_books() {
        let first = adapter(Arc::new(NoopHttpClient))
            .fetch()
            .await
            .expect("fake fetch");
        let second = adapter(Arc::new(NoopHttpClient))
            .fetch()
            .await
            .expect("fake fetch");

        assert_eq!(first.price, second.price);
        assert_eq!(first.volume, second.volume);
        assert!(first.bid <= first.price && first.price <= first.ask);
    }
}

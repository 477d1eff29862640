use serde::{Deserialize, Serialize};

use crate::{AssetId, UtcInstant, ValidationError};

/// One normalized market observation derived from an order-book poll.
///
/// Immutable once constructed; ownership passes to the partition it is
/// appended to. Field order matters: it is the stable column order of the
/// partition record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: UtcInstant,
    pub asset: AssetId,
    pub exchange: String,
    /// Bid/ask midpoint.
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    /// Summed size across the top-N levels of both book sides.
    pub volume: f64,
    /// Mean spread across the top-N book levels.
    pub spread_avg: f64,
    /// `spread_avg` as a percentage of the midpoint.
    pub spread_avg_pct: f64,
}

/// One parsed order-book level: price and size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl Snapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp: UtcInstant,
        asset: AssetId,
        exchange: impl Into<String>,
        price: f64,
        bid: f64,
        ask: f64,
        spread: f64,
        volume: f64,
        spread_avg: f64,
        spread_avg_pct: f64,
    ) -> Result<Self, ValidationError> {
        validate_non_negative("price", price)?;
        validate_non_negative("bid", bid)?;
        validate_non_negative("ask", ask)?;
        validate_non_negative("volume", volume)?;
        validate_finite("spread", spread)?;
        validate_finite("spread_avg", spread_avg)?;
        validate_finite("spread_avg_pct", spread_avg_pct)?;

        if bid > ask {
            return Err(ValidationError::CrossedBook { bid, ask });
        }
        if price < bid || price > ask {
            return Err(ValidationError::PriceOutsideBook { price, bid, ask });
        }
        if spread < 0.0 {
            return Err(ValidationError::NegativeValue { field: "spread" });
        }

        Ok(Self {
            timestamp,
            asset,
            exchange: exchange.into(),
            price,
            bid,
            ask,
            spread,
            volume,
            spread_avg,
            spread_avg_pct,
        })
    }

    /// Normalize a parsed level-2 book into a snapshot.
    ///
    /// `price` is the best-bid/best-ask midpoint, `volume` the summed size
    /// across the top `depth` levels of both sides, and `spread_avg` the
    /// difference of the side-averaged prices over those levels. A book
    /// shallower than `depth` on either side falls back to the top-of-book
    /// spread for the depth-averaged fields.
    pub fn from_book(
        timestamp: UtcInstant,
        asset: AssetId,
        exchange: impl Into<String>,
        bids: &[BookLevel],
        asks: &[BookLevel],
        depth: usize,
    ) -> Result<Self, ValidationError> {
        let (best_bid, best_ask) = match (bids.first(), asks.first()) {
            (Some(bid), Some(ask)) => (bid.price, ask.price),
            _ => return Err(ValidationError::EmptyBookSide),
        };

        let mid = (best_bid + best_ask) / 2.0;
        let spread = best_ask - best_bid;

        let top_bids = &bids[..bids.len().min(depth)];
        let top_asks = &asks[..asks.len().min(depth)];

        let (spread_avg, spread_avg_pct) = if top_bids.len() < depth || top_asks.len() < depth {
            (spread, percent_of(spread, mid))
        } else {
            let bid_avg = mean(top_bids.iter().map(|level| level.price));
            let ask_avg = mean(top_asks.iter().map(|level| level.price));
            let avg = ask_avg - bid_avg;
            (avg, percent_of(avg, mid))
        };

        let volume = top_bids.iter().map(|level| level.size).sum::<f64>()
            + top_asks.iter().map(|level| level.size).sum::<f64>();

        Self::new(
            timestamp, asset, exchange, mid, best_bid, best_ask, spread, volume, spread_avg,
            spread_avg_pct,
        )
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn percent_of(value: f64, base: f64) -> f64 {
    if base == 0.0 {
        0.0
    } else {
        (value / base) * 100.0
    }
}

fn validate_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    validate_finite(field, value)?;
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}

fn validate_finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(pairs: &[(f64, f64)]) -> Vec<BookLevel> {
        pairs
            .iter()
            .map(|&(price, size)| BookLevel { price, size })
            .collect()
    }

    fn asset() -> AssetId {
        AssetId::parse("ADA-USD").expect("valid pair")
    }

    fn ts() -> UtcInstant {
        UtcInstant::parse("2025-07-18T08:00:00Z").expect("valid timestamp")
    }

    #[test]
    fn computes_midpoint_spread_and_volume() {
        let bids = levels(&[(0.84, 100.0), (0.83, 50.0)]);
        let asks = levels(&[(0.86, 80.0), (0.87, 40.0)]);

        let snapshot =
            Snapshot::from_book(ts(), asset(), "Coinbase", &bids, &asks, 2).expect("must build");

        assert!((snapshot.price - 0.85).abs() < 1e-12);
        assert!((snapshot.spread - 0.02).abs() < 1e-12);
        assert!((snapshot.volume - 270.0).abs() < 1e-12);
        // side averages: bid 0.835, ask 0.865
        assert!((snapshot.spread_avg - 0.03).abs() < 1e-12);
    }

    #[test]
    fn shallow_book_falls_back_to_top_of_book_spread() {
        let bids = levels(&[(0.84, 100.0)]);
        let asks = levels(&[(0.86, 80.0)]);

        let snapshot =
            Snapshot::from_book(ts(), asset(), "Coinbase", &bids, &asks, 20).expect("must build");

        assert!((snapshot.spread_avg - snapshot.spread).abs() < 1e-12);
    }

    #[test]
    fn rejects_empty_side() {
        let bids = levels(&[(0.84, 100.0)]);
        let err = Snapshot::from_book(ts(), asset(), "Coinbase", &bids, &[], 20)
            .expect_err("must fail");
        assert!(matches!(err, ValidationError::EmptyBookSide));
    }

    #[test]
    fn rejects_crossed_book() {
        let err = Snapshot::new(
            ts(),
            asset(),
            "Coinbase",
            0.85,
            0.90,
            0.80,
            -0.10,
            10.0,
            -0.10,
            -11.0,
        )
        .expect_err("must fail");
        assert!(matches!(err, ValidationError::CrossedBook { .. }));
    }
}

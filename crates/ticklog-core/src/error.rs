use thiserror::Error;

/// Validation and contract errors exposed by `ticklog-core`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("asset id cannot be empty")]
    EmptyAssetId,
    #[error("asset id length {len} exceeds max {max}")]
    AssetIdTooLong { len: usize, max: usize },
    #[error("asset id must be a BASE-QUOTE pair: '{value}'")]
    AssetIdNotAPair { value: String },
    #[error("asset id contains invalid character '{ch}' at index {index}")]
    AssetIdInvalidChar { ch: char, index: usize },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("slot width must be a divisor of 24 hours, got {hours}")]
    InvalidSlotWidth { hours: u8 },
    #[error("slot label must be YYYY-MM-DD_HH: '{value}'")]
    InvalidSlotLabel { value: String },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },

    #[error("order book side is empty")]
    EmptyBookSide,
    #[error("book is crossed: bid {bid} > ask {ask}")]
    CrossedBook { bid: f64, ask: f64 },
    #[error("price {price} outside book bounds [{bid}, {ask}]")]
    PriceOutsideBook { price: f64, bid: f64, ask: f64 },
}

//! # Domain Models
//!
//! Canonical domain types for the ticklog pipeline.
//!
//! All models validate their invariants at construction time:
//!
//! - [`AssetId`] — normalized trading-pair identifier
//! - [`Snapshot`] — one order-book observation (`bid <= price <= ask`,
//!   `spread >= 0`, finite non-negative fields)
//! - [`SlotSpec`] / [`SlotLabel`] — partition window arithmetic
//! - [`UtcInstant`] — RFC3339 UTC timestamp

mod asset;
mod slot;
mod snapshot;
pub(crate) mod timestamp;

pub use asset::AssetId;
pub use slot::{SlotLabel, SlotSpec};
pub use snapshot::{BookLevel, Snapshot};
pub use timestamp::UtcInstant;

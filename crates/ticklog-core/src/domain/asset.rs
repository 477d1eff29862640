use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_PAIR_LEN: usize = 20;

/// Normalized trading-pair identifier, e.g. `ADA-USD`.
///
/// Two non-empty ASCII alphanumeric segments joined by a single dash,
/// normalized to uppercase. Doubles as the stable identity used for the
/// on-disk partition directory and the serving routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    /// Parse and normalize a pair code to uppercase.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyAssetId);
        }

        let normalized = trimmed.to_ascii_uppercase();
        let len = normalized.chars().count();
        if len > MAX_PAIR_LEN {
            return Err(ValidationError::AssetIdTooLong {
                len,
                max: MAX_PAIR_LEN,
            });
        }

        let mut segments = normalized.split('-');
        let base = segments.next().unwrap_or_default();
        let quote = segments.next().unwrap_or_default();
        if base.is_empty() || quote.is_empty() || segments.next().is_some() {
            return Err(ValidationError::AssetIdNotAPair {
                value: normalized.clone(),
            });
        }

        for (index, ch) in normalized.chars().enumerate() {
            let valid = ch.is_ascii_alphanumeric() || ch == '-';
            if !valid {
                return Err(ValidationError::AssetIdInvalidChar { ch, index });
            }
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase form used for the per-asset data directory.
    pub fn dir_name(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Base currency segment, e.g. `ADA` for `ADA-USD`.
    pub fn base(&self) -> &str {
        self.0.split('-').next().expect("pair has a base segment")
    }
}

impl Display for AssetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for AssetId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for AssetId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AssetId> for String {
    fn from(value: AssetId) -> Self {
        value.0
    }
}

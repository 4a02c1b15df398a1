//! Byte size parsing for quota options.
//!
//! Sizes follow the RAM convention used by container storage configuration:
//! every unit is a power of 1024 and the suffix is case-insensitive.
//! - "512" -> 512 bytes
//! - "10k", "10kb", "10KiB" -> 10 * 1024 bytes
//! - "1.5g" -> 1.5 * 1024^3 bytes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LaminaError, LaminaResult};

/// A size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteSize(u64);

const KI: u64 = 1024;
const MI: u64 = KI * 1024;
const GI: u64 = MI * 1024;
const TI: u64 = GI * 1024;
const PI: u64 = TI * 1024;

impl ByteSize {
    /// Create a size from bytes.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a size from mebibytes.
    #[must_use]
    pub const fn mebibytes(mib: u64) -> Self {
        Self(mib * MI)
    }

    /// Create a size from gibibytes.
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib * GI)
    }

    /// Get the size in bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Parse a size string.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::InvalidSize`] if the string is not a size.
    pub fn parse(s: &str) -> LaminaResult<Self> {
        let invalid = || LaminaError::InvalidSize {
            value: s.to_string(),
        };
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, suffix) = trimmed.split_at(split);
        if number.is_empty() {
            return Err(invalid());
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let suffix = suffix.trim_start().to_ascii_lowercase();
        let suffix = suffix.strip_suffix('b').unwrap_or(&suffix);
        let suffix = suffix.strip_suffix('i').unwrap_or(suffix);
        let multiplier = match suffix {
            "" => 1,
            "k" => KI,
            "m" => MI,
            "g" => GI,
            "t" => TI,
            "p" => PI,
            _ => return Err(invalid()),
        };

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let bytes = (value * multiplier as f64) as u64;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= GI && self.0 % GI == 0 {
            write!(f, "{}GiB", self.0 / GI)
        } else if self.0 >= MI && self.0 % MI == 0 {
            write!(f, "{}MiB", self.0 / MI)
        } else if self.0 >= KI && self.0 % KI == 0 {
            write!(f, "{}KiB", self.0 / KI)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for ByteSize {
    type Err = LaminaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

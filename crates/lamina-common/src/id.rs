//! Layer and link ID generation and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LaminaError, LaminaResult};

/// A validated layer ID.
///
/// Layer IDs are opaque to the driver, but they name a directory in the
/// store, so they must:
/// - Be 1-255 bytes long
/// - Not contain `/` or NUL bytes
/// - Not be `.`, `..` or the link directory name `l`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Maximum length of a layer ID.
    pub const MAX_LENGTH: usize = 255;

    /// Create a new layer ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID cannot be used as a directory name.
    pub fn new(id: impl Into<String>) -> LaminaResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the layer ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate a layer ID string.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::InvalidLayerId`] for unusable names.
    pub fn validate(id: &str) -> LaminaResult<()> {
        let invalid = id.is_empty()
            || id.len() > Self::MAX_LENGTH
            || id == "."
            || id == ".."
            || id == LinkId::DIR
            || id.contains('/')
            || id.contains('\0');
        if invalid {
            return Err(LaminaError::InvalidLayerId { id: id.to_string() });
        }
        Ok(())
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LayerId {
    type Err = LaminaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for LayerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Short random alias naming a symlink in the link directory.
///
/// The alias keeps overlay mount data short: a lower is referenced as
/// `l/<alias>` instead of `<home>/<layer-id>/diff`. The length is chosen so
/// that `(LENGTH + len("l/") + 1) * 128 <= page size - 512`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(String);

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

impl LinkId {
    /// Number of characters in a generated alias.
    pub const LENGTH: usize = 26;

    /// Name of the directory holding the aliases.
    pub const DIR: &'static str = "l";

    /// Generate a new random alias.
    ///
    /// 128 random bits from a UUID v4, base32 encoded without padding,
    /// give exactly [`Self::LENGTH`] characters.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(base32(uuid.as_bytes())[..Self::LENGTH].to_string())
    }

    /// Wrap an alias read back from disk.
    #[must_use]
    pub fn from_disk(name: &str) -> Self {
        Self(name.trim_end_matches('\n').to_string())
    }

    /// Get the alias as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The alias as it appears in a `lower` file: `l/<alias>`.
    #[must_use]
    pub fn lower_entry(&self) -> String {
        format!("{}/{}", Self::DIR, self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// A content-addressable digest (e.g., sha256:abc123...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// The algorithm used (e.g., "sha256").
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl Digest {
    /// Create a new digest.
    #[must_use]
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// Create a SHA-256 digest.
    #[must_use]
    pub fn sha256(hash: impl Into<String>) -> Self {
        Self::new("sha256", hash)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Digest {
    type Err = LaminaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hash))
                if !algorithm.is_empty() && !hash.is_empty() && !hash.contains('/') =>
            {
                Ok(Self::new(algorithm, hash))
            }
            _ => Err(LaminaError::config(format!("invalid digest {s:?}"))),
        }
    }
}

//! Project quotas for writable layers.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use lamina_common::{ByteSize, LaminaError, LaminaResult};

/// Limits applied to one layer directory. Zero means "track, don't limit".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    /// Maximum bytes.
    pub size: u64,
    /// Maximum inodes.
    pub inodes: u64,
}

impl Quota {
    /// Whether any limit is set.
    #[must_use]
    pub const fn is_limited(&self) -> bool {
        self.size > 0 || self.inodes > 0
    }
}

/// Applies project quotas on the backing filesystem.
///
/// Implementations exist for XFS project quotas; the driver only calls
/// into one when the backing filesystem supports them.
pub trait QuotaControl: Send + Sync + fmt::Debug {
    /// Put `dir` under a fresh project with the given limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the project cannot be assigned.
    fn set_quota(&self, dir: &Path, quota: Quota) -> LaminaResult<()>;
}

/// Parse per-layer storage options (`size`, `inodes`), case-insensitively.
///
/// # Errors
///
/// Returns an error for unknown keys and malformed values.
pub fn parse_storage_opt(opts: &HashMap<String, String>) -> LaminaResult<Quota> {
    let mut quota = Quota::default();
    for (key, value) in opts {
        match key.to_ascii_lowercase().as_str() {
            "size" => quota.size = ByteSize::parse(value)?.as_bytes(),
            "inodes" => {
                quota.inodes = value.parse().map_err(|_| LaminaError::InvalidSize {
                    value: value.clone(),
                })?;
            }
            _ => return Err(LaminaError::config(format!("Unknown option {key}"))),
        }
    }
    Ok(quota)
}

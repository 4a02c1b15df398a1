//! On-disk cache of probed capabilities.
//!
//! Facts live in one JSON record in the runtime directory. Every fact is
//! also mirrored as a `<feature>-true` / `<feature>-false` marker file whose
//! content is the diagnostic text, which is the format older tools read and
//! write; markers are consulted when the record has no entry.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use lamina_common::{LaminaResult, StorePaths};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A probed fact about the kernel or the backing filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFact {
    /// Whether the feature can be used.
    pub supported: bool,
    /// Why the feature is missing, or empty.
    #[serde(default)]
    pub diagnostic: String,
    /// Backing filesystem that made the feature unusable, if that was the cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incompatible_fs: Option<String>,
    /// When the probe ran. Missing for facts read from marker files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probed_at: Option<DateTime<Utc>>,
}

impl CapabilityFact {
    /// A supported feature.
    #[must_use]
    pub fn supported() -> Self {
        Self {
            supported: true,
            diagnostic: String::new(),
            incompatible_fs: None,
            probed_at: Some(Utc::now()),
        }
    }

    /// An unsupported feature with an explanation.
    pub fn unsupported(diagnostic: impl Into<String>) -> Self {
        Self {
            supported: false,
            diagnostic: diagnostic.into(),
            incompatible_fs: None,
            probed_at: Some(Utc::now()),
        }
    }

    /// A feature the backing filesystem cannot provide.
    pub fn incompatible(backing_fs: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            incompatible_fs: Some(backing_fs.into()),
            ..Self::unsupported(diagnostic)
        }
    }

    /// A plain boolean fact.
    #[must_use]
    pub fn from_bool(supported: bool) -> Self {
        if supported {
            Self::supported()
        } else {
            Self::unsupported("")
        }
    }
}

/// Reads and writes [`CapabilityFact`]s below the runtime directory.
#[derive(Debug)]
pub struct CapabilityCache {
    paths: StorePaths,
    lock: Mutex<()>,
}

fn marker_name(feature: &str) -> String {
    feature.replace('/', "_")
}

impl CapabilityCache {
    /// Cache rooted at `paths.runhome`.
    #[must_use]
    pub fn new(paths: &StorePaths) -> Self {
        Self {
            paths: paths.clone(),
            lock: Mutex::new(()),
        }
    }

    fn record_path(&self) -> PathBuf {
        self.paths.capability_record()
    }

    fn load(&self) -> BTreeMap<String, CapabilityFact> {
        let path = self.record_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), %e, "Ignoring unreadable capability record");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        }
    }

    fn check_markers(&self, feature: &str) -> Option<CapabilityFact> {
        let name = marker_name(feature);
        let positive = fs::read_to_string(self.paths.capability_marker(&name, true)).ok();
        let negative = fs::read_to_string(self.paths.capability_marker(&name, false)).ok();
        match (positive, negative) {
            (Some(text), None) => Some(CapabilityFact {
                supported: true,
                diagnostic: text,
                incompatible_fs: None,
                probed_at: None,
            }),
            (None, Some(text)) => Some(CapabilityFact {
                supported: false,
                diagnostic: text,
                incompatible_fs: None,
                probed_at: None,
            }),
            (Some(_), Some(_)) => {
                tracing::warn!(feature, "Conflicting capability markers, probing again");
                None
            }
            (None, None) => None,
        }
    }

    /// Look up a cached fact.
    #[must_use]
    pub fn check(&self, feature: &str) -> Option<CapabilityFact> {
        let _guard = self.lock.lock();
        self.load()
            .remove(feature)
            .or_else(|| self.check_markers(feature))
    }

    /// Persist a fact.
    ///
    /// # Errors
    ///
    /// Returns an error if the record or the marker cannot be written.
    pub fn record(&self, feature: &str, fact: &CapabilityFact) -> LaminaResult<()> {
        let _guard = self.lock.lock();
        fs::create_dir_all(&self.paths.runhome)?;

        let mut record = self.load();
        record.insert(feature.to_string(), fact.clone());
        let mut tmp = tempfile::NamedTempFile::new_in(&self.paths.runhome)?;
        tmp.write_all(&serde_json::to_vec_pretty(&record)?)?;
        tmp.persist(self.record_path()).map_err(|e| e.error)?;

        let name = marker_name(feature);
        let stale = self.paths.capability_marker(&name, !fact.supported);
        if let Err(e) = fs::remove_file(&stale) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        fs::write(
            self.paths.capability_marker(&name, fact.supported),
            &fact.diagnostic,
        )?;

        tracing::debug!(feature, supported = fact.supported, "Recorded capability");
        Ok(())
    }

    /// Return the cached fact, or run `probe` and cache its result.
    ///
    /// An error from `probe` is returned as is and nothing is cached, so the
    /// probe runs again next time.
    ///
    /// # Errors
    ///
    /// Propagates probe errors and failures to persist the result.
    pub fn check_or_probe<F>(&self, feature: &str, probe: F) -> LaminaResult<CapabilityFact>
    where
        F: FnOnce() -> LaminaResult<CapabilityFact>,
    {
        if let Some(fact) = self.check(feature) {
            tracing::debug!(feature, supported = fact.supported, "Cached capability");
            return Ok(fact);
        }
        let fact = probe()?;
        tracing::debug!(feature, supported = fact.supported, "Probed capability");
        self.record(feature, &fact)?;
        Ok(fact)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use lamina_common::LaminaError;

    use super::*;

    fn cache() -> (tempfile::TempDir, CapabilityCache) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::with_roots(dir.path().join("graph"), dir.path().join("run"));
        let cache = CapabilityCache::new(&paths);
        (dir, cache)
    }

    #[test]
    fn record_then_check() {
        let (_dir, cache) = cache();
        assert!(cache.check("volatile").is_none());
        cache
            .record("volatile", &CapabilityFact::unsupported("no volatile"))
            .unwrap();
        let fact = cache.check("volatile").unwrap();
        assert!(!fact.supported);
        assert_eq!(fact.diagnostic, "no volatile");
    }

    #[test]
    fn record_writes_legacy_marker() {
        let (_dir, cache) = cache();
        cache.record("overlay", &CapabilityFact::supported()).unwrap();
        assert!(cache.paths.capability_marker("overlay", true).exists());
        cache
            .record("overlay", &CapabilityFact::unsupported("gone"))
            .unwrap();
        assert!(!cache.paths.capability_marker("overlay", true).exists());
        assert_eq!(
            fs::read_to_string(cache.paths.capability_marker("overlay", false)).unwrap(),
            "gone"
        );
    }

    #[test]
    fn legacy_markers_are_read() {
        let (_dir, cache) = cache();
        fs::create_dir_all(&cache.paths.runhome).unwrap();
        fs::write(cache.paths.capability_marker("metacopy(nodev)", true), "").unwrap();
        assert!(cache.check("metacopy(nodev)").unwrap().supported);
    }

    #[test]
    fn conflicting_markers_are_not_cached() {
        let (_dir, cache) = cache();
        fs::create_dir_all(&cache.paths.runhome).unwrap();
        fs::write(cache.paths.capability_marker("volatile", true), "").unwrap();
        fs::write(cache.paths.capability_marker("volatile", false), "").unwrap();
        assert!(cache.check("volatile").is_none());
    }

    #[test]
    fn cached_negative_does_not_reprobe() {
        let (_dir, cache) = cache();
        let runs = Cell::new(0);
        let probe = || {
            runs.set(runs.get() + 1);
            Ok(CapabilityFact::unsupported("nope"))
        };
        assert!(!cache.check_or_probe("volatile", probe).unwrap().supported);
        assert!(!cache.check_or_probe("volatile", probe).unwrap().supported);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn probe_errors_are_not_cached() {
        let (_dir, cache) = cache();
        let err = cache
            .check_or_probe("overlay", || {
                Err(LaminaError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC)))
            })
            .unwrap_err();
        assert!(matches!(err, LaminaError::Io(_)));
        assert!(cache.check("overlay").is_none());
    }
}

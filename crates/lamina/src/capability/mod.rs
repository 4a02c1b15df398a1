//! Kernel and filesystem capabilities.
//!
//! Probing needs real test mounts, so every answer is cached twice: on disk
//! in the runtime directory (surviving restarts until reboot) and in memory
//! for the lifetime of the driver.

pub mod backing;
pub mod cache;
pub mod probe;

pub use backing::BackingFs;
pub use cache::{CapabilityCache, CapabilityFact};

use std::path::{Path, PathBuf};

use lamina_common::{LaminaError, LaminaResult, StorePaths};
use once_cell::sync::OnceCell;

use crate::idmap;

/// Cache key of the native overlay probe.
pub const FEATURE_OVERLAY: &str = "overlay";
/// Cache key of the volatile probe.
pub const FEATURE_VOLATILE: &str = "volatile";
/// Cache key of the ID-mapped lower probe.
pub const FEATURE_IDMAPPED_LOWERS: &str = "idmapped-lower-dir";

/// Cache key of the metacopy probe, which depends on the mount options.
#[must_use]
pub fn metacopy_feature(mount_options: &str) -> String {
    format!("metacopy({mount_options})")
}

/// Cache key of the native diff probe, which depends on the mount options.
#[must_use]
pub fn native_diff_feature(mount_options: &str) -> String {
    format!("native-diff({mount_options})")
}

/// Capabilities of one driver instance.
///
/// Each answer is computed at most once. Probe errors are not latched, so a
/// failed probe is retried on the next call.
#[derive(Debug)]
pub struct Capabilities {
    home: PathBuf,
    cache: CapabilityCache,
    overlay: OnceCell<CapabilityFact>,
    metacopy: OnceCell<bool>,
    volatile: OnceCell<bool>,
    idmapped_lowers: OnceCell<bool>,
    native_diff: OnceCell<bool>,
}

impl Capabilities {
    /// Capabilities for the store at `paths`.
    #[must_use]
    pub fn new(paths: &StorePaths) -> Self {
        Self {
            home: paths.home.clone(),
            cache: CapabilityCache::new(paths),
            overlay: OnceCell::new(),
            metacopy: OnceCell::new(),
            volatile: OnceCell::new(),
            idmapped_lowers: OnceCell::new(),
            native_diff: OnceCell::new(),
        }
    }

    /// Preset the answers that hold for any FUSE mount program.
    #[must_use]
    pub fn for_mount_program(paths: &StorePaths) -> Self {
        let caps = Self::new(paths);
        let _ = caps.overlay.set(CapabilityFact::supported());
        let _ = caps.metacopy.set(false);
        let _ = caps.volatile.set(true);
        let _ = caps.idmapped_lowers.set(false);
        let _ = caps.native_diff.set(false);
        caps
    }

    /// The on-disk cache.
    #[must_use]
    pub const fn cache(&self) -> &CapabilityCache {
        &self.cache
    }

    fn resolve<F>(&self, cell: &OnceCell<bool>, feature: &str, probe: F) -> LaminaResult<bool>
    where
        F: FnOnce() -> LaminaResult<CapabilityFact>,
    {
        cell.get_or_try_init(|| {
            let fact = self.cache.check_or_probe(feature, probe)?;
            if !fact.supported && !fact.diagnostic.is_empty() {
                tracing::debug!(feature, diagnostic = %fact.diagnostic, "Capability unavailable");
            }
            Ok(fact.supported)
        })
        .copied()
    }

    /// Native overlay support, including `d_type`.
    ///
    /// Requires root; for other users the answer is "unsupported" and is
    /// not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe could not run.
    pub fn overlay(&self, backing: BackingFs) -> LaminaResult<CapabilityFact> {
        if !idmap::is_root() {
            return Ok(CapabilityFact::unsupported("native overlay requires root"));
        }
        self.overlay
            .get_or_try_init(|| {
                self.cache.check_or_probe(FEATURE_OVERLAY, || {
                    probe::probe_overlay(&self.home, backing)
                })
            })
            .cloned()
    }

    /// Turn a negative overlay fact into the matching error.
    #[must_use]
    pub fn overlay_error(fact: &CapabilityFact) -> LaminaError {
        fact.incompatible_fs.as_ref().map_or_else(
            || LaminaError::unsupported("overlay", fact.diagnostic.clone()),
            |fs| LaminaError::IncompatibleFs {
                backing_fs: fs.clone(),
                reason: fact.diagnostic.clone(),
            },
        )
    }

    /// Whether `metacopy=on` works with the given mount options.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe could not run.
    pub fn metacopy(&self, mount_options: &str) -> LaminaResult<bool> {
        self.resolve(&self.metacopy, &metacopy_feature(mount_options), || {
            probe::probe_metacopy(&self.home, mount_options)
        })
    }

    /// Whether the `volatile` option is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe could not run.
    pub fn volatile(&self) -> LaminaResult<bool> {
        self.resolve(&self.volatile, FEATURE_VOLATILE, || {
            probe::probe_volatile(&self.home)
        })
    }

    /// Whether ID-mapped mounts can be used as overlay lowers.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe could not run.
    pub fn idmapped_lowers(&self) -> LaminaResult<bool> {
        if !idmap::is_root() {
            return Ok(false);
        }
        self.resolve(&self.idmapped_lowers, FEATURE_IDMAPPED_LOWERS, || {
            probe::probe_idmapped_lowers(&self.home)
        })
    }

    /// Whether the upper directory of a layer can be read as its diff.
    ///
    /// Kernels that copy the opaque flag up or record directory renames as
    /// redirects produce upper directories that misdescribe the changes.
    /// Requires root like the overlay probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe could not run.
    pub fn native_diff(&self, mount_options: &str) -> LaminaResult<bool> {
        if !idmap::is_root() {
            return Ok(false);
        }
        self.resolve(&self.native_diff, &native_diff_feature(mount_options), || {
            probe::probe_native_diff(&self.home, mount_options)
        })
    }

    /// Driver home the probes run in.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }
}

//! Standard filesystem paths for the overlay layer store.
//!
//! The layout is shared with other implementations and must not change:
//!
//! ```text
//! <home>/l/<link-id>                     -> ../<layer-id>/diff
//! <home>/<layer-id>/{link,lower,diff,work,merged,empty}
//! <home>/.has-mount-program
//! <runhome>/<feature>-{true,false}
//! ```

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::id::LinkId;

/// Default graph root for Lamina data.
pub static LAMINA_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LAMINA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/lamina"))
});

/// Default runtime root for Lamina.
pub static LAMINA_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("LAMINA_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/lamina"))
});

/// Name of the driver, used as the subdirectory of the graph and run roots
/// and of additional image stores.
pub const DRIVER_NAME: &str = "overlay";

/// Paths used by one overlay driver instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// Driver home holding layer directories (default: /var/lib/lamina/overlay).
    pub home: PathBuf,
    /// Runtime directory holding capability facts (default: /run/lamina/overlay).
    pub runhome: PathBuf,
}

impl StorePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths below a graph root and a run root.
    #[must_use]
    pub fn with_roots(graph_root: impl AsRef<Path>, run_root: impl AsRef<Path>) -> Self {
        Self {
            home: graph_root.as_ref().join(DRIVER_NAME),
            runhome: run_root.as_ref().join(DRIVER_NAME),
        }
    }

    /// Paths below the invoking user's data directory.
    #[must_use]
    pub fn rootless() -> Self {
        let data = dirs::data_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        let run = dirs::runtime_dir().unwrap_or_else(|| data.join("run"));
        Self::with_roots(data.join("lamina"), run.join("lamina"))
    }

    /// Directory holding the short link aliases.
    #[must_use]
    pub fn link_dir(&self) -> PathBuf {
        self.home.join(LinkId::DIR)
    }

    /// Path of one link alias.
    #[must_use]
    pub fn link(&self, link: &LinkId) -> PathBuf {
        self.link_dir().join(link.as_str())
    }

    /// Directory of a layer in the primary store.
    #[must_use]
    pub fn layer(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }

    /// Marker created when the store is driven by a mount program.
    #[must_use]
    pub fn mount_program_flag(&self) -> PathBuf {
        self.home.join(".has-mount-program")
    }

    /// Structured capability record.
    #[must_use]
    pub fn capability_record(&self) -> PathBuf {
        self.runhome.join("capabilities.json")
    }

    /// Legacy marker file encoding a probed capability in its name.
    #[must_use]
    pub fn capability_marker(&self, feature: &str, supported: bool) -> PathBuf {
        self.runhome.join(format!("{feature}-{supported}"))
    }

    /// Staging area for layers being assembled.
    #[must_use]
    pub fn staging(&self) -> PathBuf {
        self.home.join("staging")
    }

    /// Create the home, link and runtime directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.link_dir())?;
        std::fs::create_dir_all(&self.runhome)?;
        Ok(())
    }
}

impl Default for StorePaths {
    fn default() -> Self {
        Self::with_roots(LAMINA_ROOT.as_path(), LAMINA_RUNTIME_DIR.as_path())
    }
}

/// Names of the entries inside a layer directory.
pub mod layer {
    /// Upper directory holding this layer's own changes.
    pub const DIFF: &str = "diff";
    /// Overlay scratch directory.
    pub const WORK: &str = "work";
    /// Mount target.
    pub const MERGED: &str = "merged";
    /// Placeholder lower for layers without a parent.
    pub const EMPTY: &str = "empty";
    /// File naming the layer's link alias.
    pub const LINK: &str = "link";
    /// File holding the colon separated lower chain.
    pub const LOWER: &str = "lower";
    /// Pointer to a layer in an additional layer store.
    pub const ADDITIONAL_LAYER: &str = "additionallayer";
    /// Roots of ID-mapped lower mounts.
    pub const MAPPED: &str = "mapped";
    /// Mount points of composefs lowers.
    pub const COMPOSEFS_LAYERS: &str = "composefs-layers";
    /// Directory holding this layer's composefs blob.
    pub const COMPOSEFS_DATA: &str = "composefs-data";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_roots() {
        let paths = StorePaths::with_roots("/tmp/lamina-test", "/tmp/lamina-run");
        assert_eq!(paths.home, PathBuf::from("/tmp/lamina-test/overlay"));
        assert_eq!(paths.runhome, PathBuf::from("/tmp/lamina-run/overlay"));
        assert_eq!(paths.link_dir(), PathBuf::from("/tmp/lamina-test/overlay/l"));
        assert_eq!(
            paths.layer("abc"),
            PathBuf::from("/tmp/lamina-test/overlay/abc")
        );
    }

    #[test]
    fn capability_files() {
        let paths = StorePaths::with_roots("/g", "/r");
        assert_eq!(
            paths.capability_marker("volatile", false),
            PathBuf::from("/r/overlay/volatile-false")
        );
        assert_eq!(
            paths.capability_record(),
            PathBuf::from("/r/overlay/capabilities.json")
        );
        assert_eq!(
            paths.mount_program_flag(),
            PathBuf::from("/g/overlay/.has-mount-program")
        );
    }

    #[test]
    fn link_path() {
        let paths = StorePaths::with_roots("/g", "/r");
        let link = LinkId::from_disk("ABCDEF");
        assert_eq!(paths.link(&link), PathBuf::from("/g/overlay/l/ABCDEF"));
    }
}

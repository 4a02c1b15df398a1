//! Common error types for the Lamina overlay driver.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`LaminaError`].
pub type LaminaResult<T> = Result<T, LaminaError>;

/// Errors surfaced by the layer store, the mount assembler and the probes.
#[derive(Error, Diagnostic, Debug)]
pub enum LaminaError {
    /// Layer not found.
    #[error("Layer not found: {id}")]
    #[diagnostic(code(lamina::layer::not_found))]
    LayerNotFound {
        /// The layer ID that was not found.
        id: String,
    },

    /// Invalid layer ID format.
    #[error("Invalid layer ID: {id}")]
    #[diagnostic(
        code(lamina::layer::invalid_id),
        help("Layer IDs are single path components and may not be '.', '..' or 'l'")
    )]
    InvalidLayerId {
        /// The invalid layer ID.
        id: String,
    },

    /// Invalid byte size format.
    #[error("Invalid size: {value}")]
    #[diagnostic(
        code(lamina::config::invalid_size),
        help("Use formats like '512m', '10G', '1.5GiB' or a plain byte count")
    )]
    InvalidSize {
        /// The invalid value.
        value: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(lamina::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(lamina::serialization))]
    Serialization(String),

    /// The kernel or backing filesystem lacks a required feature.
    #[error("{feature} is not supported: {reason}")]
    #[diagnostic(
        code(lamina::unsupported),
        help("Configure a mount_program or choose a different storage driver")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
        /// Why the feature was found to be missing.
        reason: String,
    },

    /// The backing filesystem cannot host overlay layers.
    #[error("'overlay' is not supported over {backing_fs}: {reason}")]
    #[diagnostic(
        code(lamina::incompatible_fs),
        help("A mount_program such as fuse-overlayfs is required on this filesystem")
    )]
    IncompatibleFs {
        /// Name of the backing filesystem.
        backing_fs: String,
        /// Details about the failed check.
        reason: String,
    },

    /// A mount syscall or mount helper failed.
    #[error("error creating overlay mount to {}, mount_data={data:?}: {source}", .target.display())]
    #[diagnostic(code(lamina::mount::failed))]
    Mount {
        /// Mount target.
        target: PathBuf,
        /// The mount data that was attempted.
        data: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The external mount program exited unsuccessfully.
    #[error("using mount program {}: {output}", .program.display())]
    #[diagnostic(code(lamina::mount::program))]
    MountProgram {
        /// The mount program that failed.
        program: PathBuf,
        /// Captured stderr of the program.
        output: String,
    },

    /// Mount data does not fit into a single page even with relative paths.
    #[error("cannot mount layer, mount data too large {len} > page size {page_size}")]
    #[diagnostic(code(lamina::mount::too_large))]
    MountDataTooLarge {
        /// Length of the mount data.
        len: usize,
        /// Page size of the host.
        page_size: usize,
    },

    /// Too many lower layers.
    #[error("max depth exceeded: {depth} lower layers, limit is {max}")]
    #[diagnostic(
        code(lamina::layer::depth_exceeded),
        help("Squash the image to reduce the number of layers")
    )]
    DepthExceeded {
        /// Number of resolved lower directories.
        depth: usize,
        /// The configured maximum.
        max: usize,
    },

    /// Symlink repair left inconsistencies it could not fix.
    #[error("error recreating the layer links: {} problem(s) remain", .issues.len())]
    #[diagnostic(
        code(lamina::repair::incomplete),
        help("It might be best to wipe the storage to avoid further errors due to storage corruption")
    )]
    Repair {
        /// Every outstanding inconsistency.
        #[related]
        issues: Vec<RepairIssue>,
    },

    /// Symlink repair did not converge.
    #[error("giving up on recreating layer links after {passes} passes")]
    #[diagnostic(code(lamina::repair::gave_up))]
    RepairGaveUp {
        /// Number of passes that were attempted.
        passes: usize,
    },

    /// An additional layer store does not have the requested layer.
    #[error("additional layer unknown: {reason}")]
    #[diagnostic(code(lamina::additional_layer::unknown))]
    AdditionalLayerUnknown {
        /// Lookup details.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(lamina::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(lamina::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl LaminaError {
    /// Whether this error means something did not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::LayerNotFound { .. } => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether the error reports a missing kernel or filesystem capability.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. } | Self::IncompatibleFs { .. })
    }

    /// Shorthand for an [`LaminaError::Unsupported`] error.
    pub fn unsupported(feature: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`LaminaError::Config`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for LaminaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A single inconsistency found while repairing the link directory.
#[derive(Error, Diagnostic, Debug)]
#[error("{}: {message}", .path.display())]
#[diagnostic(code(lamina::repair::issue))]
pub struct RepairIssue {
    /// The file or link that could not be repaired.
    pub path: PathBuf,
    /// What went wrong.
    pub message: String,
}

impl RepairIssue {
    /// Create a new repair issue.
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

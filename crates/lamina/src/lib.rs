//! # lamina
//!
//! Copy-on-write layer storage for container images on top of overlayfs.
//!
//! Lamina provides:
//! - A layer store with short link aliases and self-repair
//! - Overlay mount assembly, with fallbacks for long lower chains
//! - Cached probes of kernel and filesystem capabilities
//! - ID-mapped lowers and ownership rewriting for user namespaces
//! - Composefs-backed lowers
//!
//! Binaries that use the driver must call [`init_if_helper`] first thing in
//! `main`, so the re-exec mount helper can take over the process.

#![warn(missing_docs)]

pub mod archive;
pub mod capability;
pub mod composefs;
pub mod config;
pub mod driver;
pub mod idmap;
pub mod layout;
pub mod mount;
pub mod quota;

pub use archive::{ArchiveEngine, Change, ChangeKind, TarOptions, WhiteoutFormat};
pub use config::{DriverConfig, OverlayOptions};
pub use driver::{
    CreateOpts, Driver, DriverBuilder, LayerMetadata, MountOpts, supports_native_overlay,
};
pub use idmap::{IdMap, IdMappings};
pub use mount::reexec::init_if_helper;
pub use quota::{Quota, QuotaControl};

//! The overlay graph driver.
//!
//! [`Driver`] ties the layer store, the capability probes and the mount
//! assembler together behind the operations a container storage library
//! expects from a graph driver.

mod diff;
mod mount;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lamina_common::paths::layer;
use lamina_common::{Digest, LaminaError, LaminaResult, LayerId, StorePaths};
use parking_lot::Mutex;

use crate::archive::{ArchiveEngine, WhiteoutFormat};
use crate::capability::{BackingFs, Capabilities};
use crate::config::{DriverConfig, OverlayOptions};
use crate::idmap::{self, IdMap, IdMappings};
use crate::layout::{
    self, AdditionalLayer, CreateSpec, LayerStore, additional, mkdir_all_as, root_ids,
};
use crate::mount::{MountBackend, RefCounter, SystemBackend, syscall};
use crate::quota::{Quota, QuotaControl, parse_storage_opt};

/// Options of one `get`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOpts {
    /// Mount options; the configured `mountopt` is used when empty.
    pub options: Vec<String>,
    /// SELinux label of the mount.
    pub mount_label: Option<String>,
    /// Ask for a volatile mount where supported.
    pub volatile: bool,
    /// UID mappings of the container using the mount.
    pub uid_maps: Vec<IdMap>,
    /// GID mappings of the container using the mount.
    pub gid_maps: Vec<IdMap>,
    /// Do not shift ownership even when the driver could.
    pub disable_shifting: bool,
}

impl MountOpts {
    /// Options for a read-only mount.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            options: vec!["ro".to_string()],
            ..Self::default()
        }
    }
}

/// Options of one `create`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOpts {
    /// Per-layer storage options (`size`, `inodes`).
    pub storage_opt: HashMap<String, String>,
    /// ID mappings overriding the driver defaults.
    pub id_mappings: Option<IdMappings>,
}

impl CreateOpts {
    fn has_storage_opt(&self, key: &str) -> bool {
        self.storage_opt.keys().any(|k| k.eq_ignore_ascii_case(key))
    }
}

/// Where the pieces of a layer live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMetadata {
    /// Work directory.
    pub work_dir: PathBuf,
    /// Mount point.
    pub merged_dir: PathBuf,
    /// Upper directory.
    pub upper_dir: PathBuf,
    /// Colon separated lower directories, absent for base layers.
    pub lower_dir: Option<String>,
}

impl LayerMetadata {
    /// The metadata as the conventional key/value map.
    #[must_use]
    pub fn to_map(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::from([
            ("WorkDir", self.work_dir.display().to_string()),
            ("MergedDir", self.merged_dir.display().to_string()),
            ("UpperDir", self.upper_dir.display().to_string()),
        ]);
        if let Some(lower) = &self.lower_dir {
            map.insert("LowerDir", lower.clone());
        }
        map
    }
}

/// Builds a [`Driver`] with optional collaborators.
#[derive(Debug)]
pub struct DriverBuilder {
    config: DriverConfig,
    archive: Option<Arc<dyn ArchiveEngine>>,
    quota: Option<Arc<dyn QuotaControl>>,
    backend: Arc<dyn MountBackend>,
}

impl DriverBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            archive: None,
            quota: None,
            backend: Arc::new(SystemBackend),
        }
    }

    /// Use `engine` for extracting and diffing layers.
    #[must_use]
    pub fn with_archive(mut self, engine: Arc<dyn ArchiveEngine>) -> Self {
        self.archive = Some(engine);
        self
    }

    /// Use `control` for project quotas on XFS.
    #[must_use]
    pub fn with_quota(mut self, control: Arc<dyn QuotaControl>) -> Self {
        self.quota = Some(control);
        self
    }

    /// Perform mounts through `backend`.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn MountBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Bring the driver up.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid options, a backing filesystem overlay
    /// cannot work on, a kernel without overlay support, or when the home
    /// cannot be prepared.
    pub fn init(self) -> LaminaResult<Driver> {
        let options = OverlayOptions::parse(self.config.options.as_slice())?;
        let paths = self.config.paths();
        let id_mappings = self.config.id_mappings.clone();

        let (uid, gid) = root_ids(&id_mappings)?;
        mkdir_all_as(&paths.link_dir(), 0o700, uid, gid)?;
        mkdir_all_as(&paths.runhome, 0o700, uid, gid)?;

        let backing = BackingFs::detect(&paths.home)?;

        let (caps, supports_dtype, using_metacopy, native_diff) = if options.mount_program.is_some() {
            if let Err(e) = fs::File::create(paths.mount_program_flag()) {
                tracing::debug!(%e, "Failed to create the mount program flag file");
            }
            (Capabilities::for_mount_program(&paths), true, false, false)
        } else {
            if options.force_mask.is_some() {
                return Err(LaminaError::config(
                    "'force_mask' is supported only with 'mount_program'",
                ));
            }
            if backing.needs_mount_program() {
                return Err(LaminaError::IncompatibleFs {
                    backing_fs: backing.name().to_string(),
                    reason: "a mount_program is required".to_string(),
                });
            }
            let caps = Capabilities::new(&paths);
            let fact = caps.overlay(backing)?;
            if !fact.supported {
                return Err(Capabilities::overlay_error(&fact));
            }
            let metacopy = caps.metacopy(&options.mount_options)?;
            let native_diff = caps.native_diff(&options.mount_options)?;
            if !native_diff {
                tracing::info!(
                    "Not using native diff for overlay, this may cause degraded performance for building images"
                );
            }
            (caps, true, metacopy, native_diff)
        };

        if !options.skip_mount_home {
            self.backend.make_private(&paths.home)?;
        }

        let quota = if backing.supports_project_quota() {
            match self.quota {
                Some(control) => Some(control),
                None if options.quota.size > 0 => {
                    return Err(LaminaError::config(
                        "Storage option overlay.size not supported. Filesystem does not support Project Quota",
                    ));
                }
                None => None,
            }
        } else if options.quota.size > 0 {
            return Err(LaminaError::config(format!(
                "Storage option overlay.size only supported for backingFS XFS. Found {backing}"
            )));
        } else {
            None
        };

        let store = LayerStore::new(paths.clone(), options.image_stores.clone());
        let driver = Driver {
            paths,
            options,
            id_mappings,
            backing,
            caps,
            store,
            supports_dtype,
            using_metacopy,
            native_diff,
            ctr: RefCounter::new(),
            locks: Mutex::new(HashMap::new()),
            backend: self.backend,
            archive: self.archive,
            quota,
            page_size: syscall::page_size(),
        };

        tracing::debug!(
            backing_fs = %driver.backing,
            project_quota = driver.quota.is_some(),
            native_diff = !driver.use_naive_diff(),
            metacopy = driver.using_metacopy,
            "Initialized overlay driver"
        );
        Ok(driver)
    }
}

/// The overlay graph driver.
pub struct Driver {
    paths: StorePaths,
    options: OverlayOptions,
    id_mappings: IdMappings,
    backing: BackingFs,
    caps: Capabilities,
    store: LayerStore,
    supports_dtype: bool,
    using_metacopy: bool,
    native_diff: bool,
    ctr: RefCounter,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    backend: Arc<dyn MountBackend>,
    archive: Option<Arc<dyn ArchiveEngine>>,
    quota: Option<Arc<dyn QuotaControl>>,
    page_size: usize,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("home", &self.paths.home)
            .field("backing", &self.backing)
            .field("mount_program", &self.options.mount_program)
            .field("mounts", &self.ctr.len())
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Initialise a driver with the system mount backend and no archive
    /// engine or quota control.
    ///
    /// # Errors
    ///
    /// See [`DriverBuilder::init`].
    pub fn init(config: DriverConfig) -> LaminaResult<Self> {
        DriverBuilder::new(config).init()
    }

    /// Name of the driver.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        lamina_common::paths::DRIVER_NAME
    }

    /// Driver home.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.paths.home
    }

    /// Store paths.
    #[must_use]
    pub const fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Parsed driver options.
    #[must_use]
    pub const fn options(&self) -> &OverlayOptions {
        &self.options
    }

    /// The layer store.
    #[must_use]
    pub const fn store(&self) -> &LayerStore {
        &self.store
    }

    /// Capability answers of this driver.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Read-only image stores searched for lowers.
    #[must_use]
    pub fn additional_image_stores(&self) -> &[PathBuf] {
        self.store.image_stores()
    }

    /// Number of layers currently mounted through this driver.
    #[must_use]
    pub fn active_mounts(&self) -> usize {
        self.ctr.len()
    }

    /// Whether mounts can shift ownership for a user namespace.
    #[must_use]
    pub fn supports_shifting(&self) -> bool {
        if self.options.mount_program.is_some() {
            return true;
        }
        self.caps.idmapped_lowers().unwrap_or(false)
    }

    /// Whether diffs have to be computed by comparing mounted trees.
    ///
    /// Metadata-only copy-ups and FUSE mounts leave upper directories that
    /// do not describe the changes on their own. Neither do kernels that
    /// failed the native diff check.
    #[must_use]
    pub const fn use_naive_diff(&self) -> bool {
        self.options.mount_program.is_some() || self.using_metacopy || !self.native_diff
    }

    /// Whiteout convention of the diff directories.
    #[must_use]
    pub const fn whiteout_format(&self) -> WhiteoutFormat {
        WhiteoutFormat::for_mount_program(self.options.mount_program.is_some())
    }

    /// Human readable driver status.
    #[must_use]
    pub fn status(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Backing Filesystem", self.backing.name().to_string()),
            ("Supports d_type", self.supports_dtype.to_string()),
            ("Native Overlay Diff", (!self.use_naive_diff()).to_string()),
            ("Using metacopy", self.using_metacopy.to_string()),
        ]
    }

    fn lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(id.to_string()).or_default())
    }

    fn archive(&self) -> LaminaResult<&dyn ArchiveEngine> {
        self.archive
            .as_deref()
            .ok_or_else(|| LaminaError::config("no archive engine configured"))
    }

    /// Create a read-only layer.
    ///
    /// # Errors
    ///
    /// Returns an error when a `size` storage option is given, the ID is
    /// invalid, or the layer cannot be created.
    pub fn create(&self, id: &str, parent: Option<&str>, opts: Option<&CreateOpts>) -> LaminaResult<()> {
        if opts.is_some_and(|o| o.has_storage_opt("size")) {
            return Err(LaminaError::config(
                "--storage-opt size is only supported for ReadWrite Layers",
            ));
        }
        self.create_layer(id, parent, opts, Quota::default())
    }

    /// Create a writable layer for a container, applying the configured
    /// default quota unless the options carry their own size.
    ///
    /// # Errors
    ///
    /// Returns an error when storage options are given without quota
    /// support, the ID is invalid, or the layer cannot be created.
    pub fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        opts: Option<&CreateOpts>,
    ) -> LaminaResult<()> {
        if opts.is_some_and(|o| !o.storage_opt.is_empty()) && self.quota.is_none() {
            return Err(LaminaError::config(
                "--storage-opt is supported only for overlay over xfs with 'pquota' mount option",
            ));
        }
        let defaults = Quota {
            size: self.options.quota.size,
            inodes: 0,
        };
        self.create_layer(id, parent, opts, defaults)
    }

    /// Create a layer with `template` as its parent.
    ///
    /// # Errors
    ///
    /// See [`Self::create`] and [`Self::create_read_write`].
    pub fn create_from_template(
        &self,
        id: &str,
        template: &str,
        opts: Option<&CreateOpts>,
        read_write: bool,
    ) -> LaminaResult<()> {
        if read_write {
            self.create_read_write(id, Some(template), opts)
        } else {
            self.create(id, Some(template), opts)
        }
    }

    fn create_layer(
        &self,
        id: &str,
        parent: Option<&str>,
        opts: Option<&CreateOpts>,
        defaults: Quota,
    ) -> LaminaResult<()> {
        let id = LayerId::new(id)?;
        let maps = opts
            .and_then(|o| o.id_mappings.as_ref())
            .unwrap_or(&self.id_mappings);
        let (uid, gid) = root_ids(maps)?;

        let mut quota = defaults;
        if let Some(opts) = opts {
            let requested = parse_storage_opt(&opts.storage_opt)?;
            if requested.size > 0 {
                quota.size = requested.size;
            }
            if requested.inodes > 0 {
                quota.inodes = requested.inodes;
            }
        }

        let spec = CreateSpec {
            uid,
            gid,
            force_mask: self.options.force_mask,
        };
        self.store.create(&id, parent, spec, |dir| match &self.quota {
            Some(control) => control.set_quota(dir, quota),
            None => Ok(()),
        })
    }

    /// Create a layer whose diff is served by an additional layer store.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be created or linked; a layer
    /// that was created is removed again.
    pub fn create_from_additional_layer(
        &self,
        id: &str,
        parent: Option<&str>,
        layer: &AdditionalLayer,
    ) -> LaminaResult<()> {
        self.create(id, parent, None)?;
        if let Err(err) = layer.attach(&self.store.dir(id)) {
            if let Err(cleanup) = self.store.remove(id) {
                tracing::warn!(layer = id, %cleanup, "Failed to remove half-created layer");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove a layer from the home.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer directory cannot be deleted.
    pub fn remove(&self, id: &str) -> LaminaResult<()> {
        let lock = self.lock(id);
        let guard = lock.lock();
        let result = self.store.remove(id);
        drop(guard);
        self.locks.lock().remove(id);
        result
    }

    /// Whether the layer exists in the home or an image store.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.store.exists(id)
    }

    /// Where the directories of a layer are.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer does not exist or its lowers cannot be
    /// resolved.
    pub fn metadata(&self, id: &str) -> LaminaResult<LayerMetadata> {
        let dir = self.store.dir(id);
        if !dir.exists() {
            return Err(LaminaError::LayerNotFound { id: id.to_string() });
        }
        let lowers = self.store.lower_dirs(id)?;
        let lower_dir = (!lowers.is_empty()).then(|| {
            lowers
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":")
        });
        Ok(LayerMetadata {
            work_dir: dir.join(layer::WORK),
            merged_dir: dir.join(layer::MERGED),
            upper_dir: dir.join(layer::DIFF),
            lower_dir,
        })
    }

    /// Find a layer in the additional layer stores and take a reference
    /// on it.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::AdditionalLayerUnknown`] if no store has it.
    pub fn lookup_additional_layer(&self, digest: &Digest, reference: &str) -> LaminaResult<AdditionalLayer> {
        let path = additional::lookup(&self.options.layer_stores, digest, reference)?;
        Ok(AdditionalLayer::acquire(path))
    }

    /// The additional layer backing the existing layer `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is not backed by an additional store.
    pub fn lookup_additional_layer_by_id(&self, id: &str) -> LaminaResult<AdditionalLayer> {
        let path = additional::path_by_layer_dir(&self.store.dir(id))?;
        Ok(AdditionalLayer::acquire(path))
    }

    /// Release resources held for the home: the staging area and the
    /// private mount of the home.
    ///
    /// # Errors
    ///
    /// Returns an error if the home cannot be unmounted.
    pub fn cleanup(&self) -> LaminaResult<()> {
        if !self.ctr.is_empty() {
            tracing::warn!(mounts = self.ctr.len(), "Cleaning up while layers are still mounted");
        }
        if let Err(e) = fs::remove_dir_all(self.paths.staging()) {
            tracing::trace!(%e, "No staging directory to remove");
        }
        self.backend.detach(&self.paths.home)
    }

    /// Repair the link aliases of the home.
    ///
    /// # Errors
    ///
    /// See [`layout::recreate_symlinks`].
    pub fn recreate_symlinks(&self) -> LaminaResult<layout::RepairReport> {
        self.store.recreate_symlinks()
    }
}

/// Whether kernel overlay mounts work for the store below `graph_root`.
///
/// Stores already set up for a mount program, and non-root callers, get
/// `false` without probing.
///
/// # Errors
///
/// Returns an error if the backing filesystem cannot be identified.
pub fn supports_native_overlay(graph_root: &Path, run_root: &Path) -> LaminaResult<bool> {
    if !idmap::is_root() || graph_root.as_os_str().is_empty() || run_root.as_os_str().is_empty() {
        return Ok(false);
    }
    let paths = StorePaths::with_roots(graph_root, run_root);
    if paths.mount_program_flag().exists() {
        tracing::debug!("overlay storage already configured with a mount-program");
        return Ok(false);
    }
    for dir in [&paths.home, &paths.runhome] {
        if let Err(e) = mkdir_all_as(dir, 0o700, 0, 0) {
            tracing::debug!(dir = %dir.display(), %e, "Failed to create store directory");
        }
    }
    let backing = BackingFs::detect(&paths.home)?;
    let caps = Capabilities::new(&paths);
    Ok(caps.overlay(backing).is_ok_and(|fact| fact.supported))
}

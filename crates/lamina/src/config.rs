//! Driver configuration.

use std::fs;
use std::path::{Path, PathBuf};

use lamina_common::paths::{DRIVER_NAME, LAMINA_ROOT, LAMINA_RUNTIME_DIR};
use lamina_common::{ByteSize, LaminaError, LaminaResult, StorePaths};

use crate::idmap::{IdMap, IdMappings};
use crate::layout::AdditionalLayerStore;
use crate::quota::Quota;

/// Options accepted in the driver option list, as `key=value` strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayOptions {
    /// Extra options passed to every overlay mount.
    pub mount_options: String,
    /// Default quota of writable layers.
    pub quota: Quota,
    /// Read-only image stores searched for lower layers.
    pub image_stores: Vec<PathBuf>,
    /// Additional layer stores.
    pub layer_stores: Vec<AdditionalLayerStore>,
    /// FUSE program used instead of kernel overlay mounts.
    pub mount_program: Option<PathBuf>,
    /// Leave the propagation of the home mount alone.
    pub skip_mount_home: bool,
    /// Carry on when extracted files cannot be chowned.
    pub ignore_chown_errors: bool,
    /// Mode forced onto layer contents.
    pub force_mask: Option<u32>,
    /// Mount lowers from composefs images when a layer has one.
    pub use_composefs: bool,
}

fn parse_bool(key: &str, value: &str) -> LaminaResult<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(LaminaError::config(format!(
            "overlay: invalid boolean {value:?} for {key}"
        ))),
    }
}

fn existing_dir(kind: &str, raw: &str) -> LaminaResult<PathBuf> {
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(LaminaError::config(format!(
            "overlay: {kind} path {raw:?} is not absolute. Can not be relative"
        )));
    }
    let meta = fs::metadata(&path)
        .map_err(|e| LaminaError::config(format!("overlay: can't stat {kind} dir {raw}: {e}")))?;
    if !meta.is_dir() {
        return Err(LaminaError::config(format!(
            "overlay: {kind} path {raw:?} must be a directory"
        )));
    }
    // Components are normalised, `..` is kept as the kernel resolves it.
    Ok(path.components().collect())
}

fn parse_force_mask(value: &str) -> LaminaResult<u32> {
    match value {
        "shared" => Ok(0o755),
        "private" => Ok(0o700),
        octal => u32::from_str_radix(octal, 8)
            .ok()
            .filter(|mask| *mask <= 0o7777)
            .ok_or_else(|| LaminaError::config(format!("overlay: invalid force_mask {octal:?}"))),
    }
}

impl OverlayOptions {
    /// Parse a driver option list.
    ///
    /// Keys are case-insensitive and may carry an `overlay.`, `overlay2.` or
    /// `.` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::Config`] for unknown keys, malformed values and
    /// store paths that are not existing absolute directories.
    pub fn parse<S: AsRef<str>>(options: &[S]) -> LaminaResult<Self> {
        let mut opts = Self::default();
        for option in options {
            let option = option.as_ref();
            let (key, value) = option.split_once('=').ok_or_else(|| {
                LaminaError::config(format!("Unable to parse key/value option: {option}"))
            })?;
            let lowered = key.trim().to_ascii_lowercase();
            let name = lowered.strip_prefix("overlay.").unwrap_or(&lowered);
            let name = name.strip_prefix("overlay2.").unwrap_or(name);
            let name = name.strip_prefix('.').unwrap_or(name);
            let value = value.trim();

            match name {
                "override_kernel_check" => {
                    tracing::debug!("overlay: override_kernel_check option was specified, but is no longer necessary");
                }
                "mountopt" => opts.mount_options = value.to_string(),
                "size" => {
                    tracing::debug!(size = value, "overlay: size");
                    opts.quota.size = ByteSize::parse(value)?.as_bytes();
                }
                "inodes" => {
                    tracing::debug!(inodes = value, "overlay: inodes");
                    opts.quota.inodes = value.parse().map_err(|_| {
                        LaminaError::config(format!("overlay: invalid inodes value {value:?}"))
                    })?;
                }
                "imagestore" | "additionalimagestore" => {
                    tracing::debug!(imagestore = value, "overlay: imagestore");
                    for store in value.split(',').filter(|s| !s.is_empty()) {
                        opts.image_stores.push(existing_dir("imageStore", store)?);
                    }
                }
                "additionallayerstore" => {
                    tracing::debug!(additionallayerstore = value, "overlay: additionallayerstore");
                    for store in value.split(',').filter(|s| !s.is_empty()) {
                        opts.layer_stores.push(parse_layer_store(store)?);
                    }
                }
                "mount_program" => {
                    tracing::debug!(mount_program = value, "overlay: mount_program");
                    if value.is_empty() {
                        opts.mount_program = None;
                    } else {
                        fs::metadata(value).map_err(|e| {
                            LaminaError::config(format!("overlay: can't stat program {value:?}: {e}"))
                        })?;
                        opts.mount_program = Some(PathBuf::from(value));
                    }
                }
                "skip_mount_home" => opts.skip_mount_home = parse_bool(name, value)?,
                "ignore_chown_errors" => opts.ignore_chown_errors = parse_bool(name, value)?,
                "force_mask" => {
                    tracing::debug!(force_mask = value, "overlay: force_mask");
                    opts.force_mask = Some(parse_force_mask(value)?);
                }
                "use_composefs" => opts.use_composefs = parse_bool(name, value)?,
                _ => return Err(LaminaError::config(format!("overlay: Unknown option {key}"))),
            }
        }
        Ok(opts)
    }
}

fn parse_layer_store(raw: &str) -> LaminaResult<AdditionalLayerStore> {
    let mut elems = raw.split(':');
    let path = existing_dir("additionallayerstore", elems.next().unwrap_or_default())?;
    let mut with_reference = false;
    for elem in elems {
        match elem {
            "ref" if with_reference => {
                return Err(LaminaError::config(format!(
                    "overlay: additionallayerstore config of {raw:?} contains \"ref\" option twice"
                )));
            }
            "ref" => with_reference = true,
            other => {
                return Err(LaminaError::config(format!(
                    "overlay: additionallayerstore config {raw:?} contains unknown option {other:?}"
                )));
            }
        }
    }
    Ok(AdditionalLayerStore {
        path,
        with_reference,
    })
}

/// Everything needed to bring up a driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Driver home.
    pub home: PathBuf,
    /// Run root; the runtime directory is `<run_root>/<basename of home>`.
    pub run_root: PathBuf,
    /// Raw driver options.
    pub options: Vec<String>,
    /// Default ID mappings of layers.
    pub id_mappings: IdMappings,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            home: LAMINA_ROOT.join(DRIVER_NAME),
            run_root: LAMINA_RUNTIME_DIR.to_path_buf(),
            options: Vec::new(),
            id_mappings: IdMappings::default(),
        }
    }
}

impl DriverConfig {
    /// Configuration below a graph root and a run root.
    #[must_use]
    pub fn with_roots(graph_root: impl AsRef<Path>, run_root: impl Into<PathBuf>) -> Self {
        Self::default()
            .with_home(graph_root.as_ref().join(DRIVER_NAME))
            .with_run_root(run_root)
    }

    /// Set the driver home.
    #[must_use]
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    /// Set the run root.
    #[must_use]
    pub fn with_run_root(mut self, run_root: impl Into<PathBuf>) -> Self {
        self.run_root = run_root.into();
        self
    }

    /// Replace the driver options.
    #[must_use]
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default ID mappings.
    #[must_use]
    pub fn with_id_mappings(mut self, uids: Vec<IdMap>, gids: Vec<IdMap>) -> Self {
        self.id_mappings = IdMappings::new(uids, gids);
        self
    }

    /// Resolved store paths.
    #[must_use]
    pub fn paths(&self) -> StorePaths {
        let base = self
            .home
            .file_name()
            .map_or_else(|| PathBuf::from(DRIVER_NAME), PathBuf::from);
        StorePaths {
            home: self.home.clone(),
            runhome: self.run_root.join(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive_with_prefixes() {
        let opts = OverlayOptions::parse(&[
            "overlay.MountOpt=nodev",
            "overlay2.size=1G",
            ".inodes=100",
            "Skip_Mount_Home=true",
            "override_kernel_check=1",
        ])
        .unwrap();
        assert_eq!(opts.mount_options, "nodev");
        assert_eq!(opts.quota.size, 1 << 30);
        assert_eq!(opts.quota.inodes, 100);
        assert!(opts.skip_mount_home);
    }

    #[test]
    fn force_mask_values() {
        let parse = |v: &str| OverlayOptions::parse(&[format!("force_mask={v}")]);
        assert_eq!(parse("shared").unwrap().force_mask, Some(0o755));
        assert_eq!(parse("private").unwrap().force_mask, Some(0o700));
        assert_eq!(parse("750").unwrap().force_mask, Some(0o750));
        assert!(parse("9").is_err());
        assert!(parse("77777").is_err());
    }

    #[test]
    fn booleans_follow_go_syntax() {
        assert!(OverlayOptions::parse(&["ignore_chown_errors=T"]).unwrap().ignore_chown_errors);
        assert!(!OverlayOptions::parse(&["ignore_chown_errors=0"]).unwrap().ignore_chown_errors);
        assert!(OverlayOptions::parse(&["ignore_chown_errors=yes"]).is_err());
    }

    #[test]
    fn unknown_and_malformed_options() {
        let err = OverlayOptions::parse(&["frobnicate=1"]).unwrap_err();
        assert!(err.to_string().contains("Unknown option frobnicate"));
        assert!(OverlayOptions::parse(&["mountopt"]).is_err());
    }

    #[test]
    fn stores_must_be_absolute_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().display().to_string();

        let opts = OverlayOptions::parse(&[format!("imagestore={store},{store}")]).unwrap();
        assert_eq!(opts.image_stores.len(), 2);
        assert!(OverlayOptions::parse(&["imagestore=relative/path"]).is_err());
        assert!(OverlayOptions::parse(&["imagestore=/does/not/exist"]).is_err());
        assert!(OverlayOptions::parse(&["imagestore="]).unwrap().image_stores.is_empty());

        let file = dir.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(OverlayOptions::parse(&[format!("imagestore={}", file.display())]).is_err());
    }

    #[test]
    fn layer_store_reference_option() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().display().to_string();

        let opts = OverlayOptions::parse(&[format!("additionallayerstore={store}:ref")]).unwrap();
        assert!(opts.layer_stores[0].with_reference);
        assert!(OverlayOptions::parse(&[format!("additionallayerstore={store}:ref:ref")]).is_err());
        assert!(OverlayOptions::parse(&[format!("additionallayerstore={store}:bogus")]).is_err());
    }

    #[test]
    fn mount_program_must_exist() {
        let opts = OverlayOptions::parse(&["mount_program=/bin/true"]).unwrap();
        assert_eq!(opts.mount_program, Some(PathBuf::from("/bin/true")));
        assert!(OverlayOptions::parse(&["mount_program=/no/such/program"]).is_err());
    }

    #[test]
    fn config_builder_and_paths() {
        let config = DriverConfig::with_roots("/g", "/r")
            .with_options(["mountopt=nodev"])
            .with_id_mappings(vec![IdMap::new(0, 1000, 1)], vec![IdMap::new(0, 1000, 1)]);
        let paths = config.paths();
        assert_eq!(paths.home, PathBuf::from("/g/overlay"));
        assert_eq!(paths.runhome, PathBuf::from("/r/overlay"));
        assert_eq!(config.options, vec!["mountopt=nodev".to_string()]);
        assert!(!config.id_mappings.is_empty());

        let custom = DriverConfig::default().with_home("/data/layers").with_run_root("/run/x");
        assert_eq!(custom.paths().runhome, PathBuf::from("/run/x/layers"));
    }
}

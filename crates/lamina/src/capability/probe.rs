//! Disposable test mounts that find out what the kernel supports.
//!
//! Each probe works in a fresh temporary directory below the driver home so
//! it exercises the same backing filesystem the layers will live on.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use lamina_common::{LaminaError, LaminaResult};
use rustix::mount::MountFlags;

use super::backing::BackingFs;
use super::cache::CapabilityFact;
use crate::idmap::{self, IdMap, create_idmapped_mount, create_userns_process};
use crate::mount::{parse_mount_options, syscall};

/// A scratch directory with the usual overlay subdirectories.
///
/// Anything mounted on the children is detached on drop, then the whole
/// tree is removed.
#[derive(Debug)]
pub struct ScratchMount {
    dir: tempfile::TempDir,
    mounted: Vec<PathBuf>,
}

impl ScratchMount {
    /// Create `<home>/<prefix>XXXX/{<subdirs>}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn new(home: &Path, prefix: &str, subdirs: &[&str]) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(home)?;
        for sub in subdirs {
            fs::create_dir(dir.path().join(sub))?;
            fs::set_permissions(dir.path().join(sub), fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir,
            mounted: Vec::new(),
        })
    }

    /// Path of a child directory.
    #[must_use]
    pub fn path(&self, sub: &str) -> PathBuf {
        self.dir.path().join(sub)
    }

    /// Root of the scratch tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Mount an overlay with `data` on the `merged` child.
    ///
    /// # Errors
    ///
    /// Returns the raw mount error.
    pub fn mount_overlay(&mut self, flags: MountFlags, data: &str) -> std::io::Result<()> {
        let merged = self.path("merged");
        syscall::mount_fs("overlay", &merged, "overlay", flags, data)?;
        self.mounted.push(merged);
        Ok(())
    }

    /// Remember an externally created mount for cleanup.
    pub fn track(&mut self, path: PathBuf) {
        self.mounted.push(path);
    }
}

impl Drop for ScratchMount {
    fn drop(&mut self) {
        for path in self.mounted.drain(..).rev() {
            let _ = syscall::unmount(&path, true);
        }
    }
}

fn userxattr(data: String) -> String {
    if idmap::is_rootless() {
        format!("{data},userxattr")
    } else {
        data
    }
}

/// Whether `dir` reports file types in directory entries.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn supports_dtype(dir: &Path) -> LaminaResult<bool> {
    use rustix::fs::{Dir, FileType, Mode, OFlags, open};

    let probe = dir.join("d_type-probe");
    fs::write(&probe, b"")?;

    let fd = open(dir, OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC, Mode::empty())
        .map_err(std::io::Error::from)?;
    let entries = Dir::read_from(&fd).map_err(std::io::Error::from)?;
    let mut supported = true;
    for entry in entries {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_name().to_bytes() == b"d_type-probe" {
            supported = entry.file_type() != FileType::Unknown;
        }
    }
    fs::remove_file(&probe)?;
    Ok(supported)
}

fn is_enospc(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOSPC)
}

/// Probe native overlay support with multiple lowers.
///
/// # Errors
///
/// Only running out of space or failing to read directories is an error;
/// everything else yields an unsupported fact.
pub fn probe_overlay(home: &Path, backing: BackingFs) -> LaminaResult<CapabilityFact> {
    // Best effort, the module may be built in.
    let _ = Command::new("modprobe")
        .arg("overlay")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    let mut scratch = match ScratchMount::new(
        home,
        "compat",
        &["lower1", "lower2", "upper", "work", "merged"],
    ) {
        Ok(scratch) => scratch,
        Err(e) if is_enospc(&e) => return Err(e.into()),
        Err(e) => {
            return Ok(CapabilityFact::unsupported(format!(
                "'overlay' not found as a supported filesystem on this host: {e}"
            )));
        }
    };

    if !supports_dtype(scratch.root())? {
        return Ok(CapabilityFact::incompatible(
            backing.name(),
            format!(
                "'overlay' is not supported over {backing} without d_type support at {}",
                home.display()
            ),
        ));
    }

    let lower1 = scratch.path("lower1");
    let lower2 = scratch.path("lower2");
    let upper = scratch.path("upper");
    let work = scratch.path("work");

    let multi = userxattr(format!(
        "lowerdir={}:{},upperdir={},workdir={}",
        lower1.display(),
        lower2.display(),
        upper.display(),
        work.display()
    ));
    match scratch.mount_overlay(MountFlags::empty(), &multi) {
        Ok(()) => {
            tracing::debug!("Overlay test mount with multiple lowers succeeded");
            return Ok(CapabilityFact::supported());
        }
        Err(e) if is_enospc(&e) => return Err(e.into()),
        Err(e) => tracing::debug!(%e, "Overlay test mount with multiple lowers failed"),
    }

    let single = userxattr(format!(
        "lowerdir={},upperdir={},workdir={}",
        lower1.display(),
        upper.display(),
        work.display()
    ));
    match scratch.mount_overlay(MountFlags::empty(), &single) {
        Ok(()) => Ok(CapabilityFact::unsupported(
            "kernel too old to provide multiple lowers feature for overlay",
        )),
        Err(e) => {
            tracing::debug!(%e, "Overlay test mount with a single lower failed");
            Ok(CapabilityFact::incompatible(
                backing.name(),
                format!("'overlay' is not supported over {backing} at {}", home.display()),
            ))
        }
    }
}


/// Probe whether a chmod through an overlay with `mount_options` creates a
/// metadata-only copy in the upper directory.
///
/// # Errors
///
/// Returns an error if the test mount fails or the xattr cannot be read
/// for reasons other than missing privileges.
pub fn probe_metacopy(home: &Path, mount_options: &str) -> LaminaResult<CapabilityFact> {
    let mut scratch = ScratchMount::new(home, "metacopy-check", &["l1", "l2", "l3", "work", "merged"])?;
    let file = scratch.path("l1").join("f");
    fs::write(&file, b"")?;
    fs::set_permissions(&file, fs::Permissions::from_mode(0o700))?;

    let mut data = format!(
        "lowerdir={}:{},upperdir={},workdir={}",
        scratch.path("l2").display(),
        scratch.path("l1").display(),
        scratch.path("l3").display(),
        scratch.path("work").display()
    );
    let (flags, extra) = parse_mount_options(mount_options);
    if !extra.is_empty() {
        data = format!("{data},{extra}");
    }
    let data = userxattr(data);

    scratch
        .mount_overlay(flags, &data)
        .map_err(|e| LaminaError::Mount {
            target: scratch.path("merged"),
            data: data.clone(),
            source: e,
        })?;

    fs::set_permissions(
        scratch.path("merged").join("f"),
        fs::Permissions::from_mode(0o600),
    )?;

    match xattr::get(scratch.path("l3").join("f"), overlay_xattr("metacopy")) {
        Ok(value) => Ok(CapabilityFact::from_bool(value.is_some())),
        Err(e) if e.raw_os_error() == Some(libc::EPERM) => Ok(CapabilityFact::unsupported(
            "not permitted to read the metacopy xattr",
        )),
        Err(e) => Err(LaminaError::Internal {
            message: format!("metacopy flag was not set on file in upper layer: {e}"),
        }),
    }
}

/// Name of an overlay private xattr such as `opaque` or `redirect`.
#[must_use]
pub fn overlay_xattr(name: &str) -> String {
    let namespace = if idmap::is_rootless() { "user" } else { "trusted" };
    format!("{namespace}.overlay.{name}")
}

/// Probe whether the upper directory of an overlay mounted with
/// `mount_options` describes its changes the way a diff reads them.
///
/// Two kernel behaviours break that: copying the opaque flag of a lower
/// directory up on copy-up, and recording a directory rename as a
/// `redirect` xattr instead of a full copy.
///
/// # Errors
///
/// Returns an error if the scratch tree cannot be prepared. A failed test
/// mount yields an unsupported fact.
pub fn probe_native_diff(home: &Path, mount_options: &str) -> LaminaResult<CapabilityFact> {
    let mut scratch =
        ScratchMount::new(home, "opaque-bug-check", &["l1", "l2", "l3", "work", "merged"])?;
    fs::create_dir(scratch.path("l1").join("d"))?;
    fs::write(scratch.path("l1").join("d").join("f"), b"")?;
    let opaque_dir = scratch.path("l2").join("d");
    fs::create_dir(&opaque_dir)?;
    let opaque = overlay_xattr("opaque");
    if let Err(e) = xattr::set(&opaque_dir, &opaque, b"y") {
        return Ok(CapabilityFact::unsupported(format!(
            "failed to set opaque flag on middle layer: {e}"
        )));
    }

    let mut data = format!(
        "lowerdir={}:{},upperdir={},workdir={}",
        scratch.path("l2").display(),
        scratch.path("l1").display(),
        scratch.path("l3").display(),
        scratch.path("work").display()
    );
    let (flags, extra) = parse_mount_options(mount_options);
    if !extra.is_empty() {
        data = format!("{data},{extra}");
    }
    let data = userxattr(data);
    if let Err(e) = scratch.mount_overlay(flags, &data) {
        return Ok(CapabilityFact::unsupported(format!("failed to mount overlay: {e}")));
    }

    // Writing below d copies the opaque directory up into l3.
    let merged = scratch.path("merged");
    fs::write(merged.join("d").join("f"), b"")?;
    match xattr::get(scratch.path("l3").join("d"), &opaque) {
        Ok(Some(value)) if value == b"y" => {
            return Ok(CapabilityFact::unsupported(
                "opaque flag erroneously copied up, consider update to kernel 4.8 or later to fix",
            ));
        }
        Ok(_) => {}
        Err(e) => {
            return Ok(CapabilityFact::unsupported(format!(
                "failed to read opaque flag on upper layer: {e}"
            )));
        }
    }

    let renamed = merged.join("d2");
    if let Err(e) = fs::rename(merged.join("d"), &renamed) {
        // Without redirect_dir the kernel refuses the rename instead.
        if e.raw_os_error() == Some(libc::EXDEV) {
            return Ok(CapabilityFact::supported());
        }
        return Ok(CapabilityFact::unsupported(format!(
            "failed to rename dir in merged directory: {e}"
        )));
    }
    match xattr::get(scratch.path("l3").join("d2"), overlay_xattr("redirect")) {
        Ok(Some(value)) if !value.is_empty() => Ok(CapabilityFact::unsupported(
            "kernel has CONFIG_OVERLAY_FS_REDIRECT_DIR enabled",
        )),
        Ok(_) => Ok(CapabilityFact::supported()),
        Err(e) => Ok(CapabilityFact::unsupported(format!(
            "failed to read redirect flag on upper layer: {e}"
        ))),
    }
}

/// Probe whether overlay accepts the `volatile` option.
///
/// # Errors
///
/// Returns an error when the test mount fails for a reason other than an
/// unknown option.
pub fn probe_volatile(home: &Path) -> LaminaResult<CapabilityFact> {
    let mut scratch = ScratchMount::new(home, "volatile-check", &["lower", "upper", "work", "merged"])?;
    let data = userxattr(format!(
        "volatile,lowerdir={},upperdir={},workdir={}",
        scratch.path("lower").display(),
        scratch.path("upper").display(),
        scratch.path("work").display()
    ));
    match scratch.mount_overlay(MountFlags::empty(), &data) {
        Ok(()) => Ok(CapabilityFact::supported()),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(CapabilityFact::unsupported(
            format!("overlay rejected the volatile option: {e}"),
        )),
        Err(e) => Err(LaminaError::Mount {
            target: scratch.path("merged"),
            data,
            source: e,
        }),
    }
}

/// Probe whether an ID-mapped mount can serve as an overlay lower.
///
/// # Errors
///
/// Returns an error if the scratch directories cannot be created.
pub fn probe_idmapped_lowers(home: &Path) -> LaminaResult<CapabilityFact> {
    let mut scratch = ScratchMount::new(
        home,
        "compat",
        &["lower", "lower-mapped", "upper", "work", "merged"],
    )?;

    let identity = [IdMap::new(0, 0, 1)];
    let process = match create_userns_process(&identity, &identity) {
        Ok(p) => p,
        Err(e) => return Ok(CapabilityFact::unsupported(e.to_string())),
    };

    let mapped = scratch.path("lower-mapped");
    if let Err(e) = create_idmapped_mount(&scratch.path("lower"), &mapped, process.pid()) {
        return Ok(CapabilityFact::unsupported(format!("create mapped mount: {e}")));
    }
    scratch.track(mapped.clone());
    process.cleanup();

    let data = format!(
        "lowerdir={},upperdir={},workdir={}",
        mapped.display(),
        scratch.path("upper").display(),
        scratch.path("work").display()
    );
    match scratch.mount_overlay(MountFlags::empty(), &data) {
        Ok(()) => Ok(CapabilityFact::supported()),
        Err(e) => Ok(CapabilityFact::unsupported(format!(
            "overlay over an ID-mapped lower failed: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_is_removed_on_drop() {
        let home = tempfile::tempdir().unwrap();
        let root = {
            let scratch = ScratchMount::new(home.path(), "compat", &["a", "b"]).unwrap();
            assert!(scratch.path("a").is_dir());
            assert!(scratch
                .root()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("compat"));
            scratch.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn tempdir_reports_dtype() {
        let dir = tempfile::tempdir().unwrap();
        // Every filesystem a CI runner uses for /tmp fills in d_type.
        assert!(supports_dtype(dir.path()).unwrap());
        assert!(!dir.path().join("d_type-probe").exists());
    }

    #[test]
    fn overlay_xattr_namespace_follows_privileges() {
        let name = overlay_xattr("opaque");
        if idmap::is_rootless() {
            assert_eq!(name, "user.overlay.opaque");
        } else {
            assert_eq!(name, "trusted.overlay.opaque");
        }
    }

    #[test]
    #[cfg_attr(not(feature = "integration"), ignore)]
    fn native_diff_check_leaves_no_scratch_behind() {
        let home = tempfile::tempdir().unwrap();
        probe_native_diff(home.path(), "").unwrap();
        assert_eq!(fs::read_dir(home.path()).unwrap().count(), 0);
    }

    #[test]
    #[cfg_attr(not(feature = "integration"), ignore)]
    fn overlay_probe_as_root() {
        let home = tempfile::tempdir().unwrap();
        let backing = BackingFs::detect(home.path()).unwrap();
        let fact = probe_overlay(home.path(), backing).unwrap();
        assert!(fact.supported, "{}", fact.diagnostic);
    }
}

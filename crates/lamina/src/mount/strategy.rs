//! How an assembled overlay mount reaches the kernel.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use lamina_common::{LaminaError, LaminaResult};

use super::options::parse_mount_options;
use super::reexec::{MountFromRequest, mount_from};
use super::syscall;

/// The available ways of performing a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// `mount(2)` from this process.
    Direct,
    /// `mount(2)` from a helper running in the driver home, with relative paths.
    MountFrom,
    /// An external program such as fuse-overlayfs.
    MountProgram,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Direct => "direct",
            Self::MountFrom => "mountfrom",
            Self::MountProgram => "mount-program",
        };
        f.write_str(name)
    }
}

/// Pick a strategy for mount data of `data_len` bytes.
#[must_use]
pub const fn select_strategy(data_len: usize, page_size: usize, has_program: bool) -> StrategyKind {
    if has_program {
        StrategyKind::MountProgram
    } else if data_len > page_size {
        StrategyKind::MountFrom
    } else {
        StrategyKind::Direct
    }
}

/// A fully assembled mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    /// Mount source, `overlay` for overlay mounts.
    pub source: String,
    /// Mount target. Relative to `home` for [`StrategyKind::MountFrom`].
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Option string including flag options such as `ro`.
    pub options: String,
    /// Driver home, used as working directory by helpers.
    pub home: PathBuf,
    /// External mount program, when configured.
    pub mount_program: Option<PathBuf>,
}

impl MountRequest {
    fn error(&self, source: std::io::Error) -> LaminaError {
        LaminaError::Mount {
            target: self.target.clone(),
            data: self.options.clone(),
            source,
        }
    }
}

/// One way of performing a mount.
pub trait MountStrategy: fmt::Debug {
    /// The kind implemented.
    fn kind(&self) -> StrategyKind;

    /// Perform the mount.
    ///
    /// # Errors
    ///
    /// Returns an error carrying the attempted mount data on failure.
    fn mount(&self, request: &MountRequest) -> LaminaResult<()>;
}

/// Mount with a direct syscall.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectMount;

impl MountStrategy for DirectMount {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    fn mount(&self, request: &MountRequest) -> LaminaResult<()> {
        let (flags, data) = parse_mount_options(&request.options);
        syscall::mount_fs(&request.source, &request.target, &request.fstype, flags, &data)
            .map_err(|e| request.error(e))
    }
}

/// Mount from a helper process whose working directory is the home.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountFrom;

impl MountStrategy for MountFrom {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MountFrom
    }

    fn mount(&self, request: &MountRequest) -> LaminaResult<()> {
        mount_from(&MountFromRequest {
            dir: request.home.clone(),
            source: request.source.clone(),
            target: request.target.clone(),
            fstype: request.fstype.clone(),
            options: request.options.clone(),
        })
    }
}

/// Mount by running `<program> -o <options> <target>` in the home.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountProgram;

impl MountStrategy for MountProgram {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MountProgram
    }

    fn mount(&self, request: &MountRequest) -> LaminaResult<()> {
        let Some(program) = request.mount_program.as_deref() else {
            return Err(LaminaError::config("mount program strategy without a program"));
        };

        tracing::debug!(
            program = %program.display(),
            target = %request.target.display(),
            "Running mount program"
        );

        let output = Command::new(program)
            .arg("-o")
            .arg(&request.options)
            .arg(&request.target)
            .current_dir(&request.home)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| request.error(e))?;

        if output.status.success() {
            return Ok(());
        }
        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            stderr = "<stderr empty>".to_string();
        }
        Err(LaminaError::MountProgram {
            program: program.to_path_buf(),
            output: format!("{}: {stderr}", output.status),
        })
    }
}

/// The strategy implementing `kind`.
#[must_use]
pub fn strategy_for(kind: StrategyKind) -> &'static dyn MountStrategy {
    match kind {
        StrategyKind::Direct => &DirectMount,
        StrategyKind::MountFrom => &MountFrom,
        StrategyKind::MountProgram => &MountProgram,
    }
}

/// Side-effecting mount operations used by the driver.
///
/// [`SystemBackend`] talks to the kernel; tests substitute a recording
/// implementation.
pub trait MountBackend: Send + Sync + fmt::Debug {
    /// Perform `request` with the given strategy.
    ///
    /// # Errors
    ///
    /// Returns an error when the mount fails.
    fn mount(&self, kind: StrategyKind, request: &MountRequest) -> LaminaResult<()>;

    /// Undo a mount made through this backend.
    ///
    /// # Errors
    ///
    /// Returns an error when the mount point cannot be released.
    fn unmount(&self, target: &Path, mount_program: bool) -> LaminaResult<()>;

    /// Make the driver home a private mount point.
    ///
    /// # Errors
    ///
    /// Returns an error when the propagation cannot be changed.
    fn make_private(&self, home: &Path) -> LaminaResult<()>;

    /// Detach whatever is mounted on `path`, ignoring "not mounted".
    ///
    /// # Errors
    ///
    /// Returns an error for failures other than "not mounted".
    fn detach(&self, path: &Path) -> LaminaResult<()>;
}

/// Backend performing real mounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBackend;

fn ignore_not_mounted(result: std::io::Result<()>) -> LaminaResult<()> {
    match result {
        Err(e)
            if e.raw_os_error() == Some(libc::EINVAL)
                || e.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(())
        }
        other => Ok(other?),
    }
}

impl MountBackend for SystemBackend {
    fn mount(&self, kind: StrategyKind, request: &MountRequest) -> LaminaResult<()> {
        strategy_for(kind).mount(request)
    }

    fn unmount(&self, target: &Path, mount_program: bool) -> LaminaResult<()> {
        if mount_program {
            for helper in ["fusermount3", "fusermount"] {
                match Command::new(helper).arg("-u").arg(target).output() {
                    Ok(out) if out.status.success() => return Ok(()),
                    Ok(out) => tracing::debug!(
                        helper,
                        target = %target.display(),
                        stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                        "FUSE unmount failed"
                    ),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::debug!(helper, %e, "Cannot run FUSE unmount helper"),
                }
            }
            // Make sure pending changes reach the backing filesystem.
            if let Err(e) = syscall::syncfs(target) {
                tracing::debug!(target = %target.display(), %e, "syncfs failed");
            }
        }
        ignore_not_mounted(syscall::unmount(target, true))
    }

    fn make_private(&self, home: &Path) -> LaminaResult<()> {
        Ok(syscall::make_private_mount_point(home)?)
    }

    fn detach(&self, path: &Path) -> LaminaResult<()> {
        ignore_not_mounted(syscall::unmount(path, true))
    }
}

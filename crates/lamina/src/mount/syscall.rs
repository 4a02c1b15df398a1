#![allow(unsafe_code)]
//! Thin wrappers around the mount syscalls.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rustix::mount::MountFlags;

fn c_string(s: &[u8]) -> io::Result<CString> {
    CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL byte"))
}

/// Mount `source` on `target` with the given filesystem type, flags and
/// option string.
///
/// Relative paths in `target` and `data` resolve against the current
/// working directory, which is what the re-exec helper relies on.
///
/// # Errors
///
/// Returns the raw OS error of `mount(2)`.
pub fn mount_fs(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MountFlags,
    data: &str,
) -> io::Result<()> {
    let source_c = c_string(source.as_bytes())?;
    let target_c = c_string(target.as_os_str().as_bytes())?;
    let fstype_c = c_string(fstype.as_bytes())?;
    let data_c = c_string(data.as_bytes())?;

    tracing::trace!(
        source,
        target = %target.display(),
        fstype,
        ?flags,
        data,
        "Mounting filesystem"
    );

    // SAFETY: every pointer refers to a live NUL-terminated string.
    let ret = unsafe {
        libc::mount(
            source_c.as_ptr(),
            target_c.as_ptr(),
            fstype_c.as_ptr(),
            libc::c_ulong::from(flags.bits()),
            data_c.as_ptr().cast(),
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Unmount a filesystem, lazily when `detach` is set.
///
/// # Errors
///
/// Returns the OS error of `umount2(2)`.
pub fn unmount(target: &Path, detach: bool) -> io::Result<()> {
    use rustix::mount::UnmountFlags;

    let flags = if detach {
        UnmountFlags::DETACH
    } else {
        UnmountFlags::empty()
    };
    tracing::trace!(target = %target.display(), detach, "Unmounting filesystem");
    rustix::mount::unmount(target, flags).map_err(io::Error::from)
}

/// Make a mount point private (no propagation).
///
/// # Errors
///
/// Returns the OS error of the propagation change.
pub fn make_private(target: &Path) -> io::Result<()> {
    use rustix::mount::{MountPropagationFlags, mount_change};

    tracing::debug!(target = %target.display(), "Making mount private");
    mount_change(target, MountPropagationFlags::PRIVATE).map_err(io::Error::from)
}

/// Bind mount a directory on itself so its propagation can be changed, then
/// make it private. Already being a mount point is fine.
///
/// # Errors
///
/// Returns an error if the bind mount or the propagation change fails.
pub fn make_private_mount_point(target: &Path) -> io::Result<()> {
    if make_private(target).is_ok() {
        return Ok(());
    }
    rustix::mount::mount_bind(target, target).map_err(io::Error::from)?;
    make_private(target)
}

/// Flush the filesystem containing `path`.
///
/// # Errors
///
/// Returns an error if the path cannot be opened or synced.
pub fn syncfs(path: &Path) -> io::Result<()> {
    use rustix::fs::{Mode, OFlags, open};

    let fd = open(path, OFlags::DIRECTORY | OFlags::CLOEXEC, Mode::empty())?;
    rustix::fs::syncfs(&fd).map_err(io::Error::from)
}

/// Host page size; mount data must fit into one page.
#[must_use]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn mount_rejects_nul() {
        let err = mount_fs("overlay", Path::new("/tmp"), "overlay", MountFlags::empty(), "a\0b")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn syncfs_on_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        syncfs(dir.path()).unwrap();
    }
}

#![allow(unsafe_code)]
//! ID-mapped bind mounts of lower directories.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use lamina_common::{LaminaError, LaminaResult, LinkId};

use super::{IdMap, create_userns_process};
use crate::mount::syscall;

const OPEN_TREE_CLONE: libc::c_uint = 1;
const AT_RECURSIVE: libc::c_uint = 0x8000;
const MOVE_MOUNT_F_EMPTY_PATH: libc::c_uint = 0x0000_0004;
const MOUNT_ATTR_IDMAP: u64 = 0x0010_0000;

/// `struct mount_attr` from linux/mount.h.
#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

fn cstring(path: &Path) -> LaminaResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| LaminaError::config(format!("path {} contains a NUL byte", path.display())))
}

fn syscall_error(what: &str) -> LaminaError {
    let err = std::io::Error::last_os_error();
    LaminaError::Io(std::io::Error::new(err.kind(), format!("{what}: {err}")))
}

/// Clone the mount at `source`, give it the ID mapping of the user namespace
/// owned by `ns_pid`, and attach it at `target`.
///
/// # Errors
///
/// Returns an error if the kernel refuses any of `open_tree`,
/// `mount_setattr` or `move_mount`.
pub fn create_idmapped_mount(source: &Path, target: &Path, ns_pid: libc::pid_t) -> LaminaResult<()> {
    let userns = File::open(format!("/proc/{ns_pid}/ns/user"))?;
    let source_c = cstring(source)?;

    // SAFETY: valid NUL-terminated path, fd checked below.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_open_tree,
            libc::AT_FDCWD,
            source_c.as_ptr(),
            OPEN_TREE_CLONE | libc::O_CLOEXEC as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(syscall_error(&format!("open_tree {}", source.display())));
    }
    #[allow(clippy::cast_possible_truncation)]
    // SAFETY: open_tree returned a fresh descriptor we now own.
    let tree = unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) };

    let attr = MountAttr {
        attr_set: MOUNT_ATTR_IDMAP,
        attr_clr: 0,
        propagation: 0,
        #[allow(clippy::cast_sign_loss)]
        userns_fd: userns.as_raw_fd() as u64,
    };
    let empty = c"";
    // SAFETY: attr outlives the call and its size is passed alongside.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mount_setattr,
            tree.as_raw_fd(),
            empty.as_ptr(),
            libc::AT_EMPTY_PATH as libc::c_uint | AT_RECURSIVE,
            &raw const attr,
            std::mem::size_of::<MountAttr>(),
        )
    };
    if ret < 0 {
        return Err(syscall_error("set IDMAP attribute"));
    }

    match fs::create_dir(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }

    let target_c = cstring(target)?;
    // SAFETY: both paths are valid C strings, the fd is live.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_move_mount,
            tree.as_raw_fd(),
            empty.as_ptr(),
            libc::AT_FDCWD,
            target_c.as_ptr(),
            MOVE_MOUNT_F_EMPTY_PATH,
        )
    };
    if ret < 0 {
        return Err(syscall_error(&format!("move_mount to {}", target.display())));
    }

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        ns_pid,
        "Created ID-mapped mount"
    );
    Ok(())
}

/// Pick the directory an ID-mapped mount should be applied to.
///
/// Siblings share the mount of their parent directory, which keeps the
/// number of mounts small and the mount data short. Link aliases live in
/// `<home>/l`, so they are mapped at `<home>` where the alias targets
/// (`../<id>/diff`) still resolve.
#[must_use]
pub fn mapped_mount_root(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(path);
    if parent.file_name().is_some_and(|name| name == LinkId::DIR) {
        return parent.parent().unwrap_or(parent).to_path_buf();
    }
    parent.to_path_buf()
}

/// ID-mapped views of a set of lower directories.
///
/// The mapped mounts are detached when this value is dropped; overlay keeps
/// its own reference on the sources, so that is safe as soon as the overlay
/// itself is mounted.
#[derive(Debug, Default)]
pub struct IdMappedLowers {
    mounts: Vec<PathBuf>,
}

impl IdMappedLowers {
    /// Map every lower through a fresh user namespace carrying the given
    /// tables, returning the rewritten lower paths.
    ///
    /// Mount roots are created as `<mapped_root>/<n>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or any mapped mount cannot be
    /// created. Mounts created so far are detached again.
    pub fn map(
        lowers: &[PathBuf],
        mapped_root: &Path,
        uid_maps: &[IdMap],
        gid_maps: &[IdMap],
    ) -> LaminaResult<(Self, Vec<PathBuf>)> {
        let process = create_userns_process(uid_maps, gid_maps)?;
        fs::create_dir_all(mapped_root)?;

        let mut guard = Self::default();
        let mut roots: HashMap<PathBuf, PathBuf> = HashMap::new();
        let mut mapped = Vec::with_capacity(lowers.len());

        for lower in lowers {
            let source = mapped_mount_root(lower);
            let root = if let Some(root) = roots.get(&source) {
                root.clone()
            } else {
                let root = mapped_root.join(roots.len().to_string());
                create_idmapped_mount(&source, &root, process.pid()).map_err(|e| {
                    LaminaError::Internal {
                        message: format!(
                            "create mapped mount for {} on {}: {e}",
                            source.display(),
                            root.display()
                        ),
                    }
                })?;
                guard.mounts.push(root.clone());
                roots.insert(source.clone(), root.clone());
                root
            };
            let relative = lower.strip_prefix(&source).unwrap_or(lower);
            mapped.push(root.join(relative));
        }

        // The namespace is only needed while the mounts are being set up.
        process.cleanup();
        Ok((guard, mapped))
    }

    /// Number of distinct mapped mounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether no mapped mount was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

impl Drop for IdMappedLowers {
    fn drop(&mut self) {
        for root in self.mounts.drain(..) {
            if let Err(err) = syscall::unmount(&root, true) {
                tracing::debug!(root = %root.display(), %err, "Failed to detach mapped mount");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn siblings_share_parent() {
        assert_eq!(
            mapped_mount_root(Path::new("/store/overlay/abc/diff1")),
            PathBuf::from("/store/overlay/abc")
        );
        assert_eq!(
            mapped_mount_root(Path::new("/store/overlay/abc/empty")),
            PathBuf::from("/store/overlay/abc")
        );
    }

    #[test]
    fn link_aliases_map_at_home() {
        assert_eq!(
            mapped_mount_root(Path::new("/store/overlay/l/ABCDEFGH")),
            PathBuf::from("/store/overlay")
        );
    }

    #[test]
    fn rotated_alias_paths_keep_dotdot() {
        let lower = Path::new("/store/overlay/l/ABCDEFGH/../diff1");
        assert_eq!(
            mapped_mount_root(lower),
            PathBuf::from("/store/overlay/l/ABCDEFGH/..")
        );
    }
}

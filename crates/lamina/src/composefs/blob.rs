//! Building, sealing and mounting composefs images.

#![allow(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use lamina_common::{LaminaError, LaminaResult};
use rustix::mount::MountFlags;

use super::loopdev::LoopDevice;
use crate::mount::syscall;

/// File name of the image inside a composefs data directory.
pub const BLOB_NAME: &str = "composefs.blob";

const HELPER: &str = "mkcomposefs";
const FALLBACK_DIRS: [&str; 3] = ["/usr/bin", "/usr/sbin", "/usr/local/bin"];

const FS_IOC_ENABLE_VERITY: libc::c_ulong = 0x4080_6685;
const FS_VERITY_HASH_ALG_SHA256: u32 = 1;
const VERITY_BLOCK_SIZE: u32 = 4096;

/// Header flag of an erofs image built with ACL support.
const EROFS_FLAGS_HAS_ACL: u32 = 1;
const EROFS_FLAGS_OFFSET: u64 = 8;

#[repr(C)]
struct FsVerityEnableArg {
    version: u32,
    hash_algorithm: u32,
    block_size: u32,
    salt_size: u32,
    salt_ptr: u64,
    sig_size: u32,
    reserved1: u32,
    sig_ptr: u64,
    reserved2: [u64; 11],
}

/// Path of the image in `data_dir`.
#[must_use]
pub fn blob_path(data_dir: &Path) -> PathBuf {
    data_dir.join(BLOB_NAME)
}

/// Locate the `mkcomposefs` helper.
///
/// # Errors
///
/// Returns [`LaminaError::Unsupported`] when the helper is not installed.
pub fn helper_path() -> LaminaResult<PathBuf> {
    let from_path = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();
    from_path
        .into_iter()
        .chain(FALLBACK_DIRS.iter().map(PathBuf::from))
        .map(|dir| dir.join(HELPER))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| LaminaError::unsupported("composefs", format!("{HELPER} not found")))
}

/// Convert `manifest` into `<out_dir>/composefs.blob`.
///
/// The helper reads the manifest on stdin and writes the image to file
/// descriptor 3. The finished image is verity-sealed where the filesystem
/// supports it.
///
/// # Errors
///
/// Returns an error if the helper is missing or fails, or the image exists
/// already.
pub fn generate_composefs_blob<R: Read>(mut manifest: R, out_dir: &Path) -> LaminaResult<PathBuf> {
    let helper = helper_path()?;
    fs::create_dir_all(out_dir)?;
    let dest = blob_path(out_dir);

    let out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(&dest)?;

    let result = run_helper(&helper, &mut manifest, &out);
    drop(out);
    if let Err(err) = result {
        let _ = fs::remove_file(&dest);
        return Err(err);
    }

    let sealed = File::open(&dest)?;
    if let Err(e) = enable_verity(&sealed) {
        tracing::warn!(blob = %dest.display(), %e, "Failed to enable fs-verity on composefs image");
    }

    tracing::debug!(blob = %dest.display(), "Generated composefs image");
    Ok(dest)
}

fn run_helper<R: Read>(helper: &Path, manifest: &mut R, out: &File) -> LaminaResult<()> {
    let out_fd = out.as_raw_fd();
    let mut cmd = Command::new(helper);
    cmd.args(["--from-file", "-", "/proc/self/fd/3"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    // SAFETY: only async-signal-safe calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if out_fd == 3 {
                let flags = libc::fcntl(3, libc::F_GETFD);
                if flags < 0 || libc::fcntl(3, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(out_fd, 3) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        io::copy(manifest, &mut stdin)?;
        stdin.flush()?;
    }
    let output = child.wait_with_output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(LaminaError::MountProgram {
            program: helper.to_path_buf(),
            output: format!(
                "failed to convert the manifest to erofs ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

/// Enable fs-verity (SHA-256, 4 KiB blocks) on a read-only file.
///
/// A filesystem without verity support and an already sealed file are
/// both fine.
///
/// # Errors
///
/// Returns other ioctl failures.
pub fn enable_verity(file: &File) -> io::Result<()> {
    let arg = FsVerityEnableArg {
        version: 1,
        hash_algorithm: FS_VERITY_HASH_ALG_SHA256,
        block_size: VERITY_BLOCK_SIZE,
        salt_size: 0,
        salt_ptr: 0,
        sig_size: 0,
        reserved1: 0,
        sig_ptr: 0,
        reserved2: [0; 11],
    };
    // SAFETY: `arg` is a valid fsverity_enable_arg for the whole call.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_ENABLE_VERITY as _, &raw const arg) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOTSUP | libc::ENOTTY | libc::EEXIST) => Ok(()),
        _ => Err(err),
    }
}

/// Whether the erofs image at `path` was built with ACL support.
///
/// # Errors
///
/// Returns an error if the header cannot be read.
pub fn has_acl(path: &Path) -> io::Result<bool> {
    let file = File::open(path)?;
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, EROFS_FLAGS_OFFSET)?;
    Ok(u32::from_le_bytes(buf) & EROFS_FLAGS_HAS_ACL != 0)
}

/// Mount the image of `data_dir` read-only on `mount_point`.
///
/// # Errors
///
/// Returns an error if no loop device can be attached or the mount fails.
pub fn mount_composefs_blob(data_dir: &Path, mount_point: &Path) -> LaminaResult<()> {
    let blob = blob_path(data_dir);
    let device = LoopDevice::attach_read_only(&blob)?;

    let mut options = String::from("ro");
    if !has_acl(&blob)? {
        options.push_str(",noacl");
    }

    let source = device.path().display().to_string();
    syscall::mount_fs(&source, mount_point, "erofs", MountFlags::RDONLY, &options).map_err(|e| {
        LaminaError::Mount {
            target: mount_point.to_path_buf(),
            data: options.clone(),
            source: e,
        }
    })?;
    tracing::debug!(
        blob = %blob.display(),
        target = %mount_point.display(),
        device = %source,
        "Mounted composefs image"
    );
    // Auto-clear releases the device with the mount.
    drop(device);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verity_arg_layout() {
        assert_eq!(std::mem::size_of::<FsVerityEnableArg>(), 128);
    }

    #[test]
    fn acl_flag_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("img");

        let mut header = vec![0u8; 16];
        header[8..12].copy_from_slice(&1u32.to_le_bytes());
        fs::write(&image, &header).unwrap();
        assert!(has_acl(&image).unwrap());

        header[8..12].copy_from_slice(&2u32.to_le_bytes());
        fs::write(&image, &header).unwrap();
        assert!(!has_acl(&image).unwrap());

        fs::write(&image, [0u8; 10]).unwrap();
        assert!(has_acl(&image).is_err());
    }

    #[test]
    fn verity_on_plain_file_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"data").unwrap();
        // tmpfs and most CI filesystems lack verity; ext4 with verity seals it.
        let file = File::open(&path).unwrap();
        let _ = enable_verity(&file);
    }

    #[test]
    fn blob_location() {
        assert_eq!(
            blob_path(Path::new("/h/a/composefs-data")),
            PathBuf::from("/h/a/composefs-data/composefs.blob")
        );
    }
}

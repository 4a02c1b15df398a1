//! Read-only, auto-clearing loop devices.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use lamina_common::LaminaResult;

const LOOP_CONTROL: &str = "/dev/loop-control";
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// Attempts before giving up on a device that keeps being taken.
const ATTACH_ATTEMPTS: usize = 16;

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn for_file(path: &Path) -> Self {
        let mut info = Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        };
        let name = path.as_os_str().as_encoded_bytes();
        let len = name.len().min(LO_NAME_SIZE - 1);
        info.lo_file_name[..len].copy_from_slice(&name[..len]);
        info
    }
}

fn ioctl_arg(fd: &File, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<libc::c_int> {
    // SAFETY: the requests used with this helper take an integer argument.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// A loop device bound to a backing file.
///
/// The device is set to auto-clear, so it goes away with the last mount
/// once the handle is dropped.
#[derive(Debug)]
pub struct LoopDevice {
    device: File,
    path: PathBuf,
}

impl LoopDevice {
    /// Bind `backing` read-only to a free loop device.
    ///
    /// # Errors
    ///
    /// Returns an error if no device can be allocated or configured.
    pub fn attach_read_only(backing: &Path) -> LaminaResult<Self> {
        let file = File::open(backing)?;
        let control = OpenOptions::new().read(true).write(true).open(LOOP_CONTROL)?;

        let mut last_err = None;
        for _ in 0..ATTACH_ATTEMPTS {
            let index = ioctl_arg(&control, LOOP_CTL_GET_FREE, 0)?;
            let path = PathBuf::from(format!("/dev/loop{index}"));
            let device = match OpenOptions::new().read(true).open(&path) {
                Ok(device) => device,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            match ioctl_arg(&device, LOOP_SET_FD, file.as_raw_fd() as libc::c_ulong) {
                Ok(_) => {}
                // Another process grabbed the device in between.
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let info = LoopInfo64::for_file(backing);
            // SAFETY: `info` is a properly initialised loop_info64 that
            // outlives the call.
            let ret = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_STATUS64 as _, &raw const info) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                let _ = ioctl_arg(&device, LOOP_CLR_FD, 0);
                return Err(err.into());
            }

            tracing::debug!(
                device = %path.display(),
                backing = %backing.display(),
                "Attached loop device"
            );
            return Ok(Self { device, path });
        }

        Err(last_err
            .unwrap_or_else(|| io::Error::from_raw_os_error(libc::EBUSY))
            .into())
    }

    /// Path of the device node.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unbind the backing file right away.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is busy.
    pub fn detach(self) -> LaminaResult<()> {
        ioctl_arg(&self.device, LOOP_CLR_FD, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_info_layout() {
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }

    #[test]
    fn loop_info_truncates_long_names() {
        let long = "/x".repeat(100);
        let info = LoopInfo64::for_file(Path::new(&long));
        assert_eq!(info.lo_file_name[LO_NAME_SIZE - 1], 0);
        assert_eq!(&info.lo_file_name[..2], b"/x");
        assert_eq!(info.lo_flags & LO_FLAGS_AUTOCLEAR, LO_FLAGS_AUTOCLEAR);
    }

    #[test]
    #[cfg_attr(not(feature = "integration"), ignore)]
    fn attach_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let backing = dir.path().join("image");
        std::fs::write(&backing, vec![0u8; 1 << 20]).unwrap();
        let dev = LoopDevice::attach_read_only(&backing).unwrap();
        assert!(dev.path().starts_with("/dev/loop"));
        dev.detach().unwrap();
    }
}

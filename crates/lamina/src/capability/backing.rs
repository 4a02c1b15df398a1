//! Identifying the filesystem the driver home lives on.

use std::fmt;
use std::path::Path;

use lamina_common::LaminaResult;

/// Filesystem magic numbers as reported by `statfs(2)`.
pub mod magic {
    /// aufs
    pub const AUFS: u64 = 0x6175_6673;
    /// btrfs
    pub const BTRFS: u64 = 0x9123_683e;
    /// ecryptfs
    pub const ECRYPTFS: u64 = 0xf15f;
    /// erofs
    pub const EROFS: u64 = 0xe0f5_e1e2;
    /// ext2/3/4
    pub const EXTFS: u64 = 0xef53;
    /// f2fs
    pub const F2FS: u64 = 0xf2f5_2010;
    /// FUSE
    pub const FUSE: u64 = 0x6573_5546;
    /// NFS
    pub const NFS: u64 = 0x6969;
    /// overlay
    pub const OVERLAY: u64 = 0x794c_7630;
    /// ramfs
    pub const RAMFS: u64 = 0x8584_58f6;
    /// squashfs
    pub const SQUASHFS: u64 = 0x7371_7368;
    /// tmpfs
    pub const TMPFS: u64 = 0x0102_1994;
    /// xfs
    pub const XFS: u64 = 0x5846_5342;
    /// zfs
    pub const ZFS: u64 = 0x2fc1_2fc1;
}

const NAMES: &[(u64, &str)] = &[
    (magic::AUFS, "aufs"),
    (magic::BTRFS, "btrfs"),
    (magic::ECRYPTFS, "ecryptfs"),
    (magic::EROFS, "erofs"),
    (magic::EXTFS, "extfs"),
    (magic::F2FS, "f2fs"),
    (magic::FUSE, "fuse"),
    (magic::NFS, "nfs"),
    (magic::OVERLAY, "overlayfs"),
    (magic::RAMFS, "ramfs"),
    (magic::SQUASHFS, "squashfs"),
    (magic::TMPFS, "tmpfs"),
    (magic::XFS, "xfs"),
    (magic::ZFS, "zfs"),
];

/// The filesystem backing a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingFs {
    magic: u64,
}

impl BackingFs {
    /// Wrap a raw magic number.
    #[must_use]
    pub const fn from_magic(magic: u64) -> Self {
        Self { magic }
    }

    /// Detect the filesystem of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if `statfs` fails.
    pub fn detect(path: &Path) -> LaminaResult<Self> {
        let stat = rustix::fs::statfs(path).map_err(std::io::Error::from)?;
        #[allow(clippy::cast_sign_loss, clippy::unnecessary_cast)]
        let magic = (stat.f_type as u64) & 0xffff_ffff;
        Ok(Self { magic })
    }

    /// Raw magic number.
    #[must_use]
    pub const fn magic(&self) -> u64 {
        self.magic
    }

    /// Human readable name, `<unknown>` for unlisted filesystems.
    #[must_use]
    pub fn name(&self) -> &'static str {
        NAMES
            .iter()
            .find(|(m, _)| *m == self.magic)
            .map_or("<unknown>", |(_, name)| name)
    }

    /// Overlay cannot use this filesystem for its layers without a mount
    /// program.
    #[must_use]
    pub const fn needs_mount_program(&self) -> bool {
        matches!(
            self.magic,
            magic::AUFS | magic::ZFS | magic::OVERLAY | magic::ECRYPTFS
        )
    }

    /// Project quotas can be enforced.
    #[must_use]
    pub const fn supports_project_quota(&self) -> bool {
        self.magic == magic::XFS
    }
}

impl fmt::Display for BackingFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

//! The archive engine the driver delegates layer content to.
//!
//! Extracting a changeset and comparing directory trees are not the
//! driver's business; it only decides where they happen and with which
//! whiteout convention.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use lamina_common::LaminaResult;

use crate::idmap::IdMap;

/// How deletions are represented inside a diff directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WhiteoutFormat {
    /// Character device 0/0 and the `opaque` xattr, as the kernel writes them.
    #[default]
    Overlay,
    /// `.wh.` prefixed files, understood by FUSE mount programs.
    Aufs,
}

impl WhiteoutFormat {
    /// The format matching how layers will be mounted.
    #[must_use]
    pub const fn for_mount_program(has_program: bool) -> Self {
        if has_program { Self::Aufs } else { Self::Overlay }
    }
}

/// Options for extracting or exporting a layer.
#[derive(Debug, Clone, Default)]
pub struct TarOptions {
    /// UID mappings applied to extracted files.
    pub uid_maps: Vec<IdMap>,
    /// GID mappings applied to extracted files.
    pub gid_maps: Vec<IdMap>,
    /// Carry on when files cannot be chowned.
    pub ignore_chown_errors: bool,
    /// Store real ownership and modes in an xattr and use this mode on disk.
    pub force_mask: Option<u32>,
    /// Whiteout convention to write.
    pub whiteout_format: WhiteoutFormat,
    /// Extraction runs inside a user namespace.
    pub in_user_ns: bool,
    /// Lower diff directories consulted when exporting a diff directory, so
    /// opaque directories and whiteouts can be told apart from content.
    pub whiteout_data: Vec<PathBuf>,
}

/// Kind of one change between two trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// The path exists in both trees with different content or metadata.
    Modify,
    /// The path exists only in the newer tree.
    Add,
    /// The path exists only in the older tree.
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Modify => "C",
            Self::Add => "A",
            Self::Delete => "D",
        })
    }
}

/// One changed path, relative to the tree root and starting with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Change {
    /// Changed path.
    pub path: PathBuf,
    /// What happened to it.
    pub kind: ChangeKind,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path.display())
    }
}

/// Tar extraction and tree diffing.
pub trait ArchiveEngine: Send + Sync + fmt::Debug {
    /// Extract the uncompressed layer tar in `diff` into `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is malformed or a file cannot be
    /// written.
    fn untar(&self, diff: &mut dyn Read, dest: &Path, options: &TarOptions) -> LaminaResult<()>;

    /// Changes recorded in the upper directory `upper` of an overlay whose
    /// lowers are `lowers`, interpreting overlay whiteouts.
    ///
    /// # Errors
    ///
    /// Returns an error if a tree cannot be walked.
    fn overlay_changes(&self, lowers: &[PathBuf], upper: &Path) -> LaminaResult<Vec<Change>>;

    /// Changes between two mounted trees; `old` is `None` for a base layer.
    ///
    /// # Errors
    ///
    /// Returns an error if a tree cannot be walked.
    fn tree_changes(&self, old: Option<&Path>, new: &Path) -> LaminaResult<Vec<Change>>;

    /// Uncompressed tar of the diff directory `diff`, translating its
    /// whiteouts with the help of `options.whiteout_data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn tar_diff(&self, diff: &Path, options: &TarOptions) -> LaminaResult<Box<dyn Read + Send>>;

    /// Uncompressed tar holding `changes`, with content read from the
    /// mounted tree `root` and deletions written as whiteouts.
    ///
    /// # Errors
    ///
    /// Returns an error if a changed file cannot be read.
    fn export_changes(
        &self,
        root: &Path,
        changes: &[Change],
        options: &TarOptions,
    ) -> LaminaResult<Box<dyn Read + Send>>;

    /// Composefs manifest describing the extracted layer in `diff`, if the
    /// engine produces one.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be generated.
    fn composefs_manifest(&self, diff: &Path) -> LaminaResult<Option<Vec<u8>>> {
        let _ = diff;
        Ok(None)
    }
}

//! On-disk layout of the layer store.
//!
//! ```text
//! <home>/l/<link>            -> ../<id>/diff
//! <home>/<id>/link           link alias of the layer
//! <home>/<id>/lower          l/<parent-link>:l/<grandparent-link>:...
//! <home>/<id>/{diff,work,merged,empty}
//! ```

pub mod additional;
mod repair;
mod store;

pub use additional::{AdditionalLayer, AdditionalLayerStore};
pub use repair::{RepairReport, recreate_symlinks};
pub use store::{CreateSpec, LayerStore, ResolvedLowers};

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::Path;

use lamina_common::LaminaResult;

use crate::idmap::IdMappings;

/// Maximum number of lower directories of one mount.
pub const MAX_DEPTH: usize = 500;

/// Mode of a diff directory when nothing better is known.
pub const DEFAULT_PERMS: u32 = 0o555;

/// Upper bound on symlink repair passes.
pub const MAX_REPAIR_PASSES: usize = 10;

/// `diff`, `diff1`, `diff2`, ...
#[must_use]
pub fn name_with_suffix(name: &str, n: usize) -> String {
    if n == 0 {
        name.to_string()
    } else {
        format!("{name}{n}")
    }
}

/// Join path components without normalising `..`, which must be resolved
/// by the kernel through the symlink in front of it.
#[must_use]
pub fn dumb_join(parts: &[&str]) -> String {
    parts.join("/")
}

fn lazy_chown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.uid() != uid || meta.gid() != gid {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    }
    Ok(())
}

/// Create one directory with an exact mode and owner.
///
/// # Errors
///
/// Returns an error if the directory exists or cannot be created.
pub fn mkdir_as(path: &Path, mode: u32, uid: u32, gid: u32) -> io::Result<()> {
    fs::DirBuilder::new().mode(mode).create(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    lazy_chown(path, uid, gid)
}

/// Create a directory and its missing parents, fixing up the owner of the
/// directories it created.
///
/// # Errors
///
/// Returns an error if a directory cannot be created.
pub fn mkdir_all_as(path: &Path, mode: u32, uid: u32, gid: u32) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        mkdir_all_as(parent, mode, uid, gid)?;
    }
    match mkdir_as(path, mode, uid, gid) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        other => other,
    }
}

/// Host IDs that own layer directories.
///
/// Without mappings directories belong to the invoking user.
///
/// # Errors
///
/// Returns an error if the mappings do not cover container root.
pub fn root_ids(maps: &IdMappings) -> LaminaResult<(u32, u32)> {
    if maps.is_empty() {
        return Ok((
            rustix::process::geteuid().as_raw(),
            rustix::process::getegid().as_raw(),
        ));
    }
    maps.root_pair()
}

/// Disk usage of a directory tree in bytes, counting hard links once.
///
/// # Errors
///
/// Returns an error if the tree cannot be walked.
pub fn directory_size(path: &Path) -> LaminaResult<u64> {
    let mut seen = std::collections::HashSet::new();
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| lamina_common::LaminaError::Internal {
            message: format!("Failed to walk {}: {e}", path.display()),
        })?;
        let meta = entry.metadata().map_err(|e| lamina_common::LaminaError::Internal {
            message: format!("Failed to stat {}: {e}", entry.path().display()),
        })?;
        if entry.depth() == 0 || meta.is_dir() {
            continue;
        }
        if meta.nlink() > 1 && !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        total += meta.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes() {
        assert_eq!(name_with_suffix("diff", 0), "diff");
        assert_eq!(name_with_suffix("diff", 3), "diff3");
        assert_eq!(dumb_join(&["l/ABC", "..", "diff1"]), "l/ABC/../diff1");
    }

    #[test]
    fn mkdir_modes() {
        let dir = tempfile::tempdir().unwrap();
        let (uid, gid) = root_ids(&IdMappings::default()).unwrap();
        let nested = dir.path().join("a/b/c");
        mkdir_all_as(&nested, 0o700, uid, gid).unwrap();
        mkdir_all_as(&nested, 0o700, uid, gid).unwrap();
        let leaf = nested.join("diff");
        mkdir_as(&leaf, 0o555, uid, gid).unwrap();
        let mode = fs::metadata(&leaf).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o555);
        assert!(mkdir_as(&leaf, 0o555, uid, gid).is_err());
    }

    #[test]
    fn size_counts_hardlinks_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c"), vec![0u8; 20]).unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 120);
    }
}

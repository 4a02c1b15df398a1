//! UID/GID mapping tables and ID-mapped lower layers.
//!
//! The mapping tables themselves come from the caller. This module knows how
//! to translate IDs through them, how to rewrite ownership of a tree, and
//! (in the submodules) how to expose a directory through an ID-mapped mount
//! instead of rewriting ownership on disk.

mod mount;
mod userns;

pub use mount::{IdMappedLowers, create_idmapped_mount, mapped_mount_root};
pub use userns::{UsernsProcess, create_userns_process};

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use lamina_common::{LaminaError, LaminaResult};

/// UID/GID mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    /// Container ID (start).
    pub container_id: u32,
    /// Host ID (start).
    pub host_id: u32,
    /// Range size.
    pub size: u32,
}

impl IdMap {
    /// Create a new ID mapping.
    #[must_use]
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Format for /proc/<pid>/uid_map or gid_map.
    #[must_use]
    pub fn to_proc_format(&self) -> String {
        format!("{} {} {}", self.container_id, self.host_id, self.size)
    }

    fn host_to_container(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.host_id)?;
        (offset < self.size).then(|| self.container_id + offset)
    }

    fn container_to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        (offset < self.size).then(|| self.host_id + offset)
    }
}

/// A pair of UID and GID mapping tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMappings {
    /// UID mappings.
    pub uids: Vec<IdMap>,
    /// GID mappings.
    pub gids: Vec<IdMap>,
}

impl IdMappings {
    /// Create mappings from UID and GID tables.
    #[must_use]
    pub const fn new(uids: Vec<IdMap>, gids: Vec<IdMap>) -> Self {
        Self { uids, gids }
    }

    /// No mapping at all: IDs pass through unchanged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uids.is_empty() && self.gids.is_empty()
    }

    /// Host UID and GID that container root maps to.
    ///
    /// # Errors
    ///
    /// Returns an error if a non-empty table does not map container ID 0.
    pub fn root_pair(&self) -> LaminaResult<(u32, u32)> {
        Ok((root_of(&self.uids, "uid")?, root_of(&self.gids, "gid")?))
    }

    /// Translate a host UID/GID pair into container IDs.
    ///
    /// # Errors
    ///
    /// Returns an error when an ID falls outside every range.
    pub fn to_container(&self, uid: u32, gid: u32) -> LaminaResult<(u32, u32)> {
        Ok((
            translate(&self.uids, uid, IdMap::host_to_container, "uid")?,
            translate(&self.gids, gid, IdMap::host_to_container, "gid")?,
        ))
    }

    /// Translate a container UID/GID pair into host IDs.
    ///
    /// # Errors
    ///
    /// Returns an error when an ID falls outside every range.
    pub fn to_host(&self, uid: u32, gid: u32) -> LaminaResult<(u32, u32)> {
        Ok((
            translate(&self.uids, uid, IdMap::container_to_host, "uid")?,
            translate(&self.gids, gid, IdMap::container_to_host, "gid")?,
        ))
    }
}

fn root_of(maps: &[IdMap], kind: &str) -> LaminaResult<u32> {
    if maps.is_empty() {
        return Ok(0);
    }
    maps.iter()
        .find_map(|m| m.container_to_host(0))
        .ok_or_else(|| LaminaError::config(format!("container ID 0 cannot be mapped to a host {kind}")))
}

fn translate(
    maps: &[IdMap],
    id: u32,
    f: fn(&IdMap, u32) -> Option<u32>,
    kind: &str,
) -> LaminaResult<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    maps.iter()
        .find_map(|m| f(m, id))
        .ok_or_else(|| LaminaError::config(format!("{kind} {id} is not covered by the ID mappings")))
}

/// Rewrite ownership of every entry below `root`, moving IDs from the
/// `to_container` view into the `to_host` view.
///
/// # Errors
///
/// Returns an error if the tree cannot be walked or an entry cannot be
/// re-owned.
pub fn chown_tree(
    root: &Path,
    to_container: Option<&IdMappings>,
    to_host: Option<&IdMappings>,
) -> LaminaResult<()> {
    let empty = IdMappings::default();
    let to_container = to_container.unwrap_or(&empty);
    let to_host = to_host.unwrap_or(&empty);

    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| LaminaError::Internal {
            message: format!("Failed to walk directory: {e}"),
        })?;
        let meta = fs::symlink_metadata(entry.path())?;
        let (uid, gid) = to_container.to_container(meta.uid(), meta.gid())?;
        let (uid, gid) = to_host.to_host(uid, gid)?;
        if (uid, gid) != (meta.uid(), meta.gid()) {
            std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))?;
        }
    }
    Ok(())
}

/// Check if the process runs inside a user namespace.
///
/// The initial namespace maps the whole 32-bit range onto itself.
#[must_use]
pub fn running_in_user_ns() -> bool {
    fs::read_to_string("/proc/self/uid_map").is_ok_and(|content| {
        let fields: Vec<&str> = content.split_whitespace().collect();
        fields.as_slice() != ["0", "0", "4294967295"]
    })
}

/// Check if running as root.
#[must_use]
pub fn is_root() -> bool {
    rustix::process::geteuid().is_root()
}

/// Rootless means either a non-root user or root inside a user namespace.
#[must_use]
pub fn is_rootless() -> bool {
    !is_root() || running_in_user_ns()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_maps() -> IdMappings {
        IdMappings::new(
            vec![IdMap::new(0, 100_000, 65536)],
            vec![IdMap::new(0, 200_000, 65536)],
        )
    }

    #[test]
    fn test_id_map_format() {
        let map = IdMap::new(0, 1000, 1);
        assert_eq!(map.to_proc_format(), "0 1000 1");
    }

    #[test]
    fn root_pair_of_empty_maps_is_root() {
        assert_eq!(IdMappings::default().root_pair().unwrap(), (0, 0));
    }

    #[test]
    fn root_pair_follows_maps() {
        assert_eq!(container_maps().root_pair().unwrap(), (100_000, 200_000));
    }

    #[test]
    fn root_pair_requires_zero() {
        let maps = IdMappings::new(vec![IdMap::new(1, 1000, 10)], vec![]);
        assert!(maps.root_pair().is_err());
    }

    #[test]
    fn translate_both_ways() {
        let maps = container_maps();
        assert_eq!(maps.to_host(0, 0).unwrap(), (100_000, 200_000));
        assert_eq!(maps.to_host(42, 7).unwrap(), (100_042, 200_007));
        assert_eq!(maps.to_container(100_042, 200_007).unwrap(), (42, 7));
        assert!(maps.to_container(5, 5).is_err());
        assert!(maps.to_host(70_000, 0).is_err());
    }

    #[test]
    fn chown_tree_identity_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"x").unwrap();
        chown_tree(dir.path(), None, None).unwrap();
    }
}

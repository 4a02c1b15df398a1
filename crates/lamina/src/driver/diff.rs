//! Layer contents: applying, measuring and comparing diffs.

use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use lamina_common::LaminaResult;
use lamina_common::paths::layer;

use super::{Driver, MountOpts};
use crate::archive::{Change, ChangeKind, TarOptions};
use crate::composefs;
use crate::idmap::{self, IdMappings, chown_tree};
use crate::layout::{DEFAULT_PERMS, mkdir_all_as, mkdir_as, name_with_suffix, root_ids};

impl Driver {
    fn tar_options(&self, mappings: Option<&IdMappings>) -> TarOptions {
        let maps = mappings.unwrap_or(&self.id_mappings);
        TarOptions {
            uid_maps: maps.uids.clone(),
            gid_maps: maps.gids.clone(),
            ignore_chown_errors: self.options.ignore_chown_errors,
            force_mask: self.options.force_mask,
            whiteout_format: self.whiteout_format(),
            in_user_ns: idmap::running_in_user_ns(),
            whiteout_data: Vec::new(),
        }
    }

    /// Extract a layer tar into `id` and return the size of the result.
    ///
    /// When `parent` is not the layer's parent the tar is applied through
    /// a mount of the layer, otherwise straight into its diff directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no archive engine is configured, the layer is
    /// missing, or extraction fails.
    pub fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: &mut dyn Read,
        mappings: Option<&IdMappings>,
    ) -> LaminaResult<u64> {
        let engine = self.archive()?;
        let options = self.tar_options(mappings);

        if !self.store.is_parent(id, parent) {
            tracing::debug!(layer = id, "Applying tar through a mount");
            let merged = self.get(id, &MountOpts::default())?;
            let result = engine.untar(diff, &merged, &options);
            self.put(id)?;
            result?;
            return self.diff_size(id, parent);
        }

        let target = self.store.diff_path(id)?;
        tracing::debug!(layer = id, target = %target.display(), "Applying tar");
        engine.untar(diff, &target, &options)?;

        if self.options.use_composefs {
            if let Some(manifest) = engine.composefs_manifest(&target)? {
                let data_dir = self.store.dir(id).join(layer::COMPOSEFS_DATA);
                composefs::generate_composefs_blob(manifest.as_slice(), &data_dir)?;
            }
        }

        crate::layout::directory_size(&target)
    }

    /// Size of the changes `id` makes on top of `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be mounted or walked.
    pub fn diff_size(&self, id: &str, parent: Option<&str>) -> LaminaResult<u64> {
        // Sizes of mount program layers are read from the upper directory
        // even though their changes are not.
        let naive = self.options.mount_program.is_none()
            && (self.use_naive_diff() || !self.store.is_parent(id, parent));
        if naive {
            let changes = self.naive_changes(id, parent)?;
            let merged = self.get(id, &MountOpts::read_only())?;
            let size = changes_size(&merged, &changes);
            self.put(id)?;
            return Ok(size);
        }
        crate::layout::directory_size(&self.store.diff_path(id)?)
    }

    /// Tar stream of the changes `id` makes on top of `parent`.
    ///
    /// The upper directory is exported as is when it can be read as a
    /// diff; otherwise the layer is mounted and compared with its parent,
    /// and stays mounted until the returned stream is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if no archive engine is configured, or the layer
    /// cannot be mounted or read.
    pub fn diff(
        &self,
        id: &str,
        parent: Option<&str>,
        mappings: Option<&IdMappings>,
    ) -> LaminaResult<Box<dyn Read + '_>> {
        let engine = self.archive()?;
        let mut options = self.tar_options(mappings);

        if self.use_naive_diff() || !self.store.is_parent(id, parent) {
            let changes = self.naive_changes(id, parent)?;
            let merged = self.get(id, &MountOpts::read_only())?;
            return match engine.export_changes(&merged, &changes, &options) {
                Ok(inner) => Ok(Box::new(MountedExport {
                    inner,
                    driver: self,
                    id: id.to_string(),
                })),
                Err(err) => {
                    if let Err(e) = self.put(id) {
                        tracing::warn!(layer = id, %e, "Failed to release layer mount");
                    }
                    Err(err)
                }
            };
        }

        options.whiteout_data = self.store.lower_diff_paths(id)?;
        let diff = self.store.diff_path(id)?;
        tracing::debug!(layer = id, diff = %diff.display(), "Tar with options");
        let stream: Box<dyn Read + '_> = engine.tar_diff(&diff, &options)?;
        Ok(stream)
    }

    /// Changes `id` makes on top of `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be mounted or walked.
    pub fn changes(&self, id: &str, parent: Option<&str>) -> LaminaResult<Vec<Change>> {
        if self.use_naive_diff() || !self.store.is_parent(id, parent) {
            return self.naive_changes(id, parent);
        }
        let engine = self.archive()?;
        let lowers = self.store.lower_diff_paths(id)?;
        engine.overlay_changes(&lowers, &self.store.diff_path(id)?)
    }

    fn naive_changes(&self, id: &str, parent: Option<&str>) -> LaminaResult<Vec<Change>> {
        let engine = self.archive()?;
        let layer_fs = self.get(id, &MountOpts::read_only())?;

        let result = match parent {
            None => engine.tree_changes(None, &layer_fs),
            Some(parent) => match self.get(parent, &MountOpts::read_only()) {
                Ok(parent_fs) => {
                    let changes = engine.tree_changes(Some(&parent_fs), &layer_fs);
                    if let Err(e) = self.put(parent) {
                        tracing::warn!(layer = parent, %e, "Failed to release parent mount");
                    }
                    changes
                }
                Err(e) => Err(e),
            },
        };

        if let Err(e) = self.put(id) {
            tracing::warn!(layer = id, %e, "Failed to release layer mount");
        }
        result
    }

    /// Rewrite ownership of a layer from one set of mappings to another and
    /// fold its contents into a fresh lower.
    ///
    /// The existing diff directories are rotated up by one (`diff` becomes
    /// `diff1`) and an empty diff is created on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be mounted, re-owned or
    /// rotated.
    pub fn update_layer_id_map(
        &self,
        id: &str,
        to_container: Option<&IdMappings>,
        to_host: Option<&IdMappings>,
        mount_label: Option<&str>,
    ) -> LaminaResult<()> {
        let opts = MountOpts {
            mount_label: mount_label.map(str::to_string),
            ..MountOpts::default()
        };
        let merged = self.get_inner(id, true, &opts)?;
        if let Err(err) = chown_tree(&merged, to_container, to_host) {
            if let Err(e) = self.put(id) {
                tracing::warn!(layer = id, %e, "Failed to release layer mount");
            }
            return Err(err);
        }
        self.put(id)?;

        let dir = self.store.dir(id);
        let mut top = 0;
        while dir.join(name_with_suffix(layer::DIFF, top + 1)).exists() {
            top += 1;
        }
        for n in (0..=top).rev() {
            fs::rename(
                dir.join(name_with_suffix(layer::DIFF, n)),
                dir.join(name_with_suffix(layer::DIFF, n + 1)),
            )?;
        }

        let (uid, gid) = root_ids(to_host.unwrap_or(&self.id_mappings))?;

        let work = dir.join(layer::WORK);
        match fs::remove_dir_all(&work) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        mkdir_as(&work, DEFAULT_PERMS, uid, gid)?;

        let perms = match self.options.force_mask {
            Some(mask) => mask,
            None => fs::metadata(dir.join(name_with_suffix(layer::DIFF, 1)))?
                .permissions()
                .mode()
                & 0o7777,
        };
        mkdir_all_as(&dir.join(layer::DIFF), perms, uid, gid)?;
        tracing::debug!(layer = id, lowers = top + 1, "Updated layer ID mappings");
        Ok(())
    }
}

/// An exported changeset read from a mount that is released on drop.
struct MountedExport<'a> {
    inner: Box<dyn Read + Send>,
    driver: &'a Driver,
    id: String,
}

impl Read for MountedExport<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for MountedExport<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.driver.put(&self.id) {
            tracing::warn!(layer = %self.id, %e, "Failed to release layer mount");
        }
    }
}

/// Bytes of added and modified regular files below `root`.
fn changes_size(root: &Path, changes: &[Change]) -> u64 {
    changes
        .iter()
        .filter(|c| matches!(c.kind, ChangeKind::Add | ChangeKind::Modify))
        .filter_map(|c| {
            let relative = c.path.strip_prefix("/").unwrap_or(&c.path);
            fs::symlink_metadata(root.join(relative)).ok()
        })
        .filter(fs::Metadata::is_file)
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn size_counts_added_and_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"12345").unwrap();
        fs::write(dir.path().join("b"), b"123").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();

        let changes = vec![
            Change { path: PathBuf::from("/a"), kind: ChangeKind::Add },
            Change { path: PathBuf::from("/b"), kind: ChangeKind::Modify },
            Change { path: PathBuf::from("/d"), kind: ChangeKind::Add },
            Change { path: PathBuf::from("/gone"), kind: ChangeKind::Delete },
        ];
        assert_eq!(changes_size(dir.path(), &changes), 8);
    }
}

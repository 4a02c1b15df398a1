//! Layer directories, link aliases and lower chains.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use lamina_common::paths::layer;
use lamina_common::{LaminaError, LaminaResult, LayerId, LinkId, StorePaths};
use lamina_common::paths::DRIVER_NAME;

use super::repair::{RepairReport, recreate_symlinks};
use super::{DEFAULT_PERMS, MAX_DEPTH, additional, dumb_join, mkdir_all_as, mkdir_as, name_with_suffix};
use crate::mount::Lower;

/// Ownership and permissions for a new layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateSpec {
    /// Host UID owning the layer directories.
    pub uid: u32,
    /// Host GID owning the layer directories.
    pub gid: u32,
    /// Mode forced onto the diff directory.
    pub force_mask: Option<u32>,
}

/// The lower directories of a layer, ready for mounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLowers {
    /// Lowers, topmost first.
    pub lowers: Vec<Lower>,
    /// Mode to give the upper directory.
    pub perms: u32,
}

/// The layer directories below the driver home, plus read-only image
/// stores searched for layers missing from the home.
#[derive(Debug, Clone)]
pub struct LayerStore {
    paths: StorePaths,
    image_stores: Vec<PathBuf>,
}

fn not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

fn mode_of(meta: &fs::Metadata) -> u32 {
    meta.permissions().mode() & 0o7777
}

impl LayerStore {
    /// Store rooted at `paths.home`.
    #[must_use]
    pub const fn new(paths: StorePaths, image_stores: Vec<PathBuf>) -> Self {
        Self {
            paths,
            image_stores,
        }
    }

    /// Paths of the store.
    #[must_use]
    pub const fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Driver home.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.paths.home
    }

    /// Additional read-only image stores.
    #[must_use]
    pub fn image_stores(&self) -> &[PathBuf] {
        &self.image_stores
    }

    /// Directory of `id` in the home, whether or not it exists.
    #[must_use]
    pub fn home_dir(&self, id: &str) -> PathBuf {
        self.paths.layer(id)
    }

    /// Directory of `id`: the home if it exists there, else the first image
    /// store that has it, else the home.
    #[must_use]
    pub fn dir(&self, id: &str) -> PathBuf {
        let home = self.home_dir(id);
        if home.exists() {
            return home;
        }
        self.image_stores
            .iter()
            .map(|store| store.join(DRIVER_NAME).join(id))
            .find(|p| p.exists())
            .unwrap_or(home)
    }

    /// Whether the layer exists anywhere.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.dir(id).exists()
    }

    /// IDs of all layers in the home, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the home cannot be listed.
    pub fn layer_ids(&self) -> LaminaResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.home())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LinkId::DIR || !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.path().join(layer::DIFF).symlink_metadata().is_ok() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Run symlink repair over the home.
    ///
    /// # Errors
    ///
    /// See [`recreate_symlinks`].
    pub fn recreate_symlinks(&self) -> LaminaResult<RepairReport> {
        recreate_symlinks(&self.paths)
    }

    /// Link alias of the layer in `dir`, repairing the store once when the
    /// link file is missing.
    fn link_of(&self, dir: &Path) -> LaminaResult<LinkId> {
        let file = dir.join(layer::LINK);
        match fs::read_to_string(&file) {
            Ok(link) => Ok(LinkId::from_disk(&link)),
            Err(e) if not_found(&e) => {
                tracing::warn!(
                    path = %file.display(),
                    "Layer link file is missing, recreating the link aliases"
                );
                self.recreate_symlinks()?;
                Ok(LinkId::from_disk(&fs::read_to_string(&file)?))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Entries of the `lower` file of `id`, topmost first.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn lower_chain(&self, id: &str) -> LaminaResult<Vec<String>> {
        match fs::read_to_string(self.dir(id).join(layer::LOWER)) {
            Ok(content) => Ok(content
                .trim_end_matches('\n')
                .split(':')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// The `lower` file content for a child of `parent`: the parent's own
    /// alias followed by the parent's chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent does not exist or has no link alias
    /// even after repair.
    pub fn chain_for_child(&self, parent: &str) -> LaminaResult<String> {
        let parent_dir = self.dir(parent);
        if let Err(e) = fs::symlink_metadata(&parent_dir) {
            return Err(if not_found(&e) {
                LaminaError::LayerNotFound {
                    id: parent.to_string(),
                }
            } else {
                e.into()
            });
        }
        let link = self.link_of(&parent_dir)?;
        let mut chain = vec![link.lower_entry()];
        chain.extend(self.lower_chain(parent)?);
        Ok(chain.join(":"))
    }

    /// Create the directory tree of a new layer.
    ///
    /// `prepare` runs right after the layer directory exists, before its
    /// content is created; quotas are applied there. On any failure the
    /// partially created layer is removed again.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer exists already, the parent is missing
    /// or a directory cannot be created.
    pub fn create<F>(
        &self,
        id: &LayerId,
        parent: Option<&str>,
        spec: CreateSpec,
        prepare: F,
    ) -> LaminaResult<()>
    where
        F: FnOnce(&Path) -> LaminaResult<()>,
    {
        let dir = self.home_dir(id.as_str());
        let (mut uid, mut gid) = (spec.uid, spec.gid);

        mkdir_all_as(&self.paths.link_dir(), 0o700, uid, gid)?;
        if let Some(parent) = parent {
            let meta = fs::metadata(self.dir(parent)).map_err(|e| {
                if not_found(&e) {
                    LaminaError::LayerNotFound {
                        id: parent.to_string(),
                    }
                } else {
                    e.into()
                }
            })?;
            uid = meta.uid();
            gid = meta.gid();
        }
        mkdir_as(&dir, 0o700, uid, gid)?;

        let mut link_path = None;
        let result = self.populate(id, parent, spec, (uid, gid), &dir, &mut link_path, prepare);
        if let Err(err) = &result {
            tracing::debug!(layer = %id, %err, "Rolling back layer creation");
            if let Some(link) = link_path {
                let _ = fs::remove_file(link);
            }
            let _ = fs::remove_dir_all(&dir);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn populate<F>(
        &self,
        id: &LayerId,
        parent: Option<&str>,
        spec: CreateSpec,
        (uid, gid): (u32, u32),
        dir: &Path,
        link_path: &mut Option<PathBuf>,
        prepare: F,
    ) -> LaminaResult<()>
    where
        F: FnOnce(&Path) -> LaminaResult<()>,
    {
        prepare(dir)?;

        let perms = match (spec.force_mask, parent) {
            (Some(mask), _) => mask,
            (None, Some(parent)) => mode_of(&fs::metadata(self.dir(parent).join(layer::DIFF))?),
            (None, None) => DEFAULT_PERMS,
        };
        mkdir_as(&dir.join(layer::DIFF), perms, uid, gid)?;

        let link = LinkId::generate();
        let alias = self.paths.link(&link);
        std::os::unix::fs::symlink(dumb_join(&["..", id.as_str(), layer::DIFF]), &alias)?;
        *link_path = Some(alias);
        fs::write(dir.join(layer::LINK), link.as_str())?;

        mkdir_as(&dir.join(layer::WORK), 0o700, uid, gid)?;
        mkdir_as(&dir.join(layer::MERGED), 0o700, uid, gid)?;

        match parent {
            None => mkdir_as(&dir.join(layer::EMPTY), 0o700, uid, gid)?,
            Some(parent) => {
                let chain = self.chain_for_child(parent)?;
                fs::write(dir.join(layer::LOWER), chain)?;
            }
        }

        tracing::debug!(layer = %id, parent = ?parent, link = %link, "Created layer");
        Ok(())
    }

    /// Absolute diff directories of the lowers of `id`, topmost first,
    /// following each alias to its layer.
    ///
    /// # Errors
    ///
    /// Returns an error if an alias is unreadable even after repair.
    pub fn lower_dirs(&self, id: &str) -> LaminaResult<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in self.lower_chain(id)? {
            let alias = self.dir(&entry);
            let target = match fs::read_link(&alias) {
                Ok(target) => target,
                Err(e) if not_found(&e) => {
                    tracing::warn!(
                        link = %alias.display(),
                        "Link alias is missing, a storage corruption might have occurred; recreating the link aliases"
                    );
                    self.recreate_symlinks()?;
                    fs::read_link(&alias)?
                }
                Err(e) => return Err(e.into()),
            };
            let target = target.to_string_lossy().into_owned();
            let layer_id = target
                .strip_prefix("../")
                .and_then(|rest| rest.strip_suffix("/diff"))
                .filter(|id| !id.is_empty() && !id.contains('/'))
                .ok_or_else(|| LaminaError::Internal {
                    message: format!("link target of {} looks weird: {target}", alias.display()),
                })?;
            dirs.push(self.dir(layer_id).join(layer::DIFF));
        }
        Ok(dirs)
    }

    /// The lower directories used to mount `id`: its own rotated diffs,
    /// then each lower alias followed by that layer's rotated diffs.
    ///
    /// Aliases missing from the home are searched in the image stores; an
    /// alias missing everywhere triggers symlink repair.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::DepthExceeded`] for more than
    /// [`MAX_DEPTH`] lowers, before anything is mounted.
    pub fn resolve_lowers(&self, id: &str, force_mask: Option<u32>) -> LaminaResult<ResolvedLowers> {
        let dir = self.dir(id);
        if let Err(e) = fs::metadata(&dir) {
            return Err(if not_found(&e) {
                LaminaError::LayerNotFound { id: id.to_string() }
            } else {
                e.into()
            });
        }

        let chain = self.lower_chain(id)?;
        if chain.len() > MAX_DEPTH {
            return Err(LaminaError::DepthExceeded {
                depth: chain.len(),
                max: MAX_DEPTH,
            });
        }

        let link = self.link_of(&dir)?;
        let mut perms: Option<u32> = force_mask;
        let mut lowers = Vec::new();

        for n in 1.. {
            let rotated = dir.join(name_with_suffix(layer::DIFF, n));
            let Ok(meta) = fs::metadata(&rotated) else {
                break;
            };
            perms.get_or_insert(mode_of(&meta));
            let relative = dumb_join(&[&link.lower_entry(), "..", &name_with_suffix(layer::DIFF, n)]);
            lowers.push(Lower::new(rotated, relative));
        }

        for entry in &chain {
            let in_home = self.home().join(entry);
            let absolute = match fs::metadata(&in_home) {
                Ok(meta) => {
                    perms.get_or_insert(mode_of(&meta));
                    in_home
                }
                Err(e) => {
                    let in_store = self
                        .image_stores
                        .iter()
                        .map(|store| store.join(DRIVER_NAME).join(entry))
                        .find_map(|p| fs::metadata(&p).ok().map(|meta| (p, meta)));
                    match in_store {
                        Some((p, meta)) => {
                            perms.get_or_insert(mode_of(&meta));
                            p
                        }
                        None if not_found(&e) => {
                            tracing::warn!(
                                lower = %in_home.display(),
                                "Lower layer does not exist, recreating the link aliases"
                            );
                            self.recreate_symlinks()?;
                            in_home
                        }
                        None => return Err(e.into()),
                    }
                }
            };

            let abs_str = absolute.to_string_lossy().into_owned();
            lowers.push(Lower::new(absolute, entry.clone()));
            for n in 1.. {
                let suffix = name_with_suffix(layer::DIFF, n);
                let rotated = dumb_join(&[&abs_str, "..", &suffix]);
                if fs::metadata(&rotated).is_err() {
                    break;
                }
                lowers.push(Lower::new(rotated, dumb_join(&[entry, "..", &suffix])));
            }
        }

        if lowers.len() > MAX_DEPTH {
            return Err(LaminaError::DepthExceeded {
                depth: lowers.len(),
                max: MAX_DEPTH,
            });
        }
        if lowers.is_empty() {
            lowers.push(Lower::new(
                dir.join(layer::EMPTY),
                dumb_join(&[id, layer::EMPTY]),
            ));
        }

        Ok(ResolvedLowers {
            lowers,
            perms: perms.unwrap_or(DEFAULT_PERMS),
        })
    }

    /// Remove a layer from the home: its alias, any additional layer
    /// reference and the directory tree. Image stores are never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be removed; a missing layer is
    /// not an error.
    pub fn remove(&self, id: &str) -> LaminaResult<()> {
        let dir = self.home_dir(id);
        if let Ok(link) = fs::read_to_string(dir.join(layer::LINK)) {
            let alias = self.paths.link(&LinkId::from_disk(&link));
            if let Err(e) = fs::remove_file(&alias) {
                tracing::debug!(link = %alias.display(), %e, "Failed to remove link alias");
            }
        }

        additional::release_by_layer_dir(&dir);

        match fs::remove_dir_all(&dir) {
            Err(e) if !not_found(&e) => Err(e.into()),
            _ => {
                tracing::debug!(layer = id, "Removed layer");
                Ok(())
            }
        }
    }

    /// Whether `parent` is the direct parent of `id`.
    #[must_use]
    pub fn is_parent(&self, id: &str, parent: Option<&str>) -> bool {
        let Ok(lowers) = self.lower_dirs(id) else {
            return false;
        };
        match (parent, lowers.first()) {
            (None, None) => true,
            (None, Some(_)) | (Some(_), None) => false,
            (Some(parent), Some(first)) => first.parent() == Some(self.dir(parent).as_path()),
        }
    }

    /// Diff directory of `id`, following a link into an additional layer
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed additional layer link.
    pub fn diff_path(&self, id: &str) -> LaminaResult<PathBuf> {
        additional::redirect_diff(&self.dir(id).join(layer::DIFF))
    }

    /// Diff directories of the lowers of `id`, redirected like [`Self::diff_path`].
    ///
    /// # Errors
    ///
    /// Returns an error if the lowers cannot be resolved.
    pub fn lower_diff_paths(&self, id: &str) -> LaminaResult<Vec<PathBuf>> {
        self.lower_dirs(id)?
            .iter()
            .map(|p| additional::redirect_diff(p))
            .collect()
    }
}

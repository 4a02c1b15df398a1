//! Mounting and unmounting layers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lamina_common::paths::layer;
use lamina_common::{LaminaError, LaminaResult};

use super::{Driver, MountOpts};
use crate::composefs::{self, blob_path};
use crate::idmap::{self, IdMappedLowers, IdMappings};
use crate::layout::{mkdir_all_as, root_ids};
use crate::mount::{Lower, MountInput, MountRequest, has_option, plan_mount, split_options, syscall};

/// Mounts made for a single `get` that only have to live until the overlay
/// itself is mounted.
#[derive(Debug, Default)]
struct TransientMounts {
    composefs: Vec<PathBuf>,
    idmapped: Option<IdMappedLowers>,
}

impl Drop for TransientMounts {
    fn drop(&mut self) {
        for target in self.composefs.drain(..) {
            if let Err(e) = syscall::unmount(&target, true) {
                tracing::debug!(target = %target.display(), %e, "Failed to detach composefs mount");
            }
        }
        self.idmapped.take();
    }
}

impl Driver {
    /// Mount a layer and return the path of its merged directory.
    ///
    /// Concurrent callers share the mount; it is only performed by the
    /// first one.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer does not exist, its chain is deeper
    /// than allowed, or the mount fails.
    pub fn get(&self, id: &str, opts: &MountOpts) -> LaminaResult<PathBuf> {
        self.get_inner(id, false, opts)
    }

    pub(super) fn get_inner(
        &self,
        id: &str,
        disable_shifting: bool,
        opts: &MountOpts,
    ) -> LaminaResult<PathBuf> {
        let lock = self.lock(id);
        let _guard = lock.lock();

        let dir = self.store.dir(id);
        if let Err(e) = fs::metadata(&dir) {
            return Err(if e.kind() == io::ErrorKind::NotFound {
                LaminaError::LayerNotFound { id: id.to_string() }
            } else {
                e.into()
            });
        }

        let disable_shifting = disable_shifting || opts.disable_shifting || !self.supports_shifting();

        let mut options = if opts.options.is_empty() {
            split_options(&self.options.mount_options)
        } else {
            opts.options.clone()
        };
        let configured_metacopy = has_option(&split_options(&self.options.mount_options), "metacopy=on");
        if configured_metacopy && !has_option(&options, "metacopy=on") {
            if self.using_metacopy {
                options.push("metacopy=on".to_string());
            } else {
                tracing::debug!(layer = id, "Ignoring metacopy option, not supported by the kernel");
            }
        }
        let read_write = !has_option(&options, "ro");

        let resolved = self.store.resolve_lowers(id, self.options.force_mask)?;
        let (root_uid, root_gid) = root_ids(&self.id_mappings)?;
        let diff = dir.join(layer::DIFF);
        mkdir_all_as(&diff, resolved.perms, root_uid, root_gid)?;

        let merged = dir.join(layer::MERGED);
        match fs::create_dir(&merged) {
            Err(e) if e.kind() != io::ErrorKind::AlreadyExists => return Err(e.into()),
            _ => {}
        }

        self.ctr.acquire(&merged, || {
            self.mount_layer(id, &dir, resolved.lowers, options, read_write, disable_shifting, opts)
        })?;
        Ok(merged)
    }

    #[allow(clippy::too_many_arguments)]
    fn mount_layer(
        &self,
        id: &str,
        dir: &Path,
        mut lowers: Vec<Lower>,
        options: Vec<String>,
        read_write: bool,
        disable_shifting: bool,
        opts: &MountOpts,
    ) -> LaminaResult<()> {
        let has_program = self.options.mount_program.is_some();
        let mut transient = TransientMounts::default();
        let mut extra: Vec<&str> = Vec::new();
        let mut data_only = Vec::new();

        if self.options.use_composefs {
            let mut kept = Vec::with_capacity(lowers.len());
            for lower in lowers {
                let Some(layer_dir) = composefs_layer_of(&lower.absolute) else {
                    kept.push(lower);
                    continue;
                };
                let target = dir
                    .join(layer::COMPOSEFS_LAYERS)
                    .join(transient.composefs.len().to_string());
                fs::create_dir_all(&target)?;
                composefs::mount_composefs_blob(&layer_dir.join(layer::COMPOSEFS_DATA), &target)?;
                let relative = target
                    .strip_prefix(&self.paths.home)
                    .map_or_else(|_| target.display().to_string(), |p| p.display().to_string());
                transient.composefs.push(target.clone());
                kept.push(Lower::new(target, relative));
                data_only.push(lower);
            }
            lowers = kept;
            if !data_only.is_empty() {
                extra.push("metacopy=on");
                extra.push("redirect_dir=on");
            }
        }

        if !has_program
            && !disable_shifting
            && !opts.uid_maps.is_empty()
            && !opts.gid_maps.is_empty()
            && idmap::is_root()
            && self.caps.idmapped_lowers()?
        {
            let sources: Vec<PathBuf> = lowers.iter().map(|l| l.absolute.clone()).collect();
            let (guard, mapped) = IdMappedLowers::map(
                &sources,
                &dir.join(layer::MAPPED),
                &opts.uid_maps,
                &opts.gid_maps,
            )?;
            lowers = mapped
                .into_iter()
                .map(|absolute| {
                    let relative = absolute
                        .strip_prefix(&self.paths.home)
                        .map_or_else(|_| absolute.display().to_string(), |p| p.display().to_string());
                    Lower::new(absolute, relative)
                })
                .collect();
            transient.idmapped = Some(guard);
        }

        if !has_program && idmap::is_rootless() {
            extra.push("userxattr");
        }
        if opts.volatile && !has_option(&options, "volatile") && self.caps.volatile()? {
            extra.push("volatile");
        }

        let program_mappings = (has_program && !disable_shifting)
            .then(|| IdMappings::new(opts.uid_maps.clone(), opts.gid_maps.clone()));

        let plan = plan_mount(&MountInput {
            id,
            home: &self.paths.home,
            layer_dir: dir,
            lowers: &lowers,
            data_only: &data_only,
            options: &options,
            extra: &extra,
            read_write,
            mount_label: opts.mount_label.as_deref(),
            page_size: self.page_size,
            mount_program: has_program,
            program_mappings: program_mappings.as_ref(),
        })?;

        // A volatile upper refuses to be mounted again after a crash
        // unless the marker is gone.
        let marker = dir.join(layer::WORK).join("work/incompat/volatile");
        match fs::remove_file(&marker) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let request = MountRequest {
            source: "overlay".to_string(),
            target: plan.target,
            fstype: "overlay".to_string(),
            options: plan.data,
            home: self.paths.home.clone(),
            mount_program: self.options.mount_program.clone(),
        };
        tracing::debug!(
            layer = id,
            strategy = %plan.kind,
            lowers = lowers.len(),
            read_write,
            "Mounting layer"
        );
        self.backend.mount(plan.kind, &request)?;
        drop(transient);
        Ok(())
    }

    /// Release a mount taken with [`Self::get`]; the last release unmounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer does not exist.
    pub fn put(&self, id: &str) -> LaminaResult<()> {
        let lock = self.lock(id);
        let _guard = lock.lock();

        let dir = self.store.dir(id);
        if let Err(e) = fs::metadata(&dir) {
            return Err(if e.kind() == io::ErrorKind::NotFound {
                LaminaError::LayerNotFound { id: id.to_string() }
            } else {
                e.into()
            });
        }

        let merged = dir.join(layer::MERGED);
        let has_program = self.options.mount_program.is_some();
        self.ctr.release(&merged, || {
            if let Err(e) = self.backend.unmount(&merged, has_program) {
                tracing::debug!(layer = id, %e, "Failed to unmount layer");
            }
            if let Err(e) = fs::remove_dir(&merged) {
                tracing::debug!(merged = %merged.display(), %e, "Failed to remove mount point");
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// Layer directory of `lower` if that layer carries a composefs image.
fn composefs_layer_of(lower: &Path) -> Option<PathBuf> {
    let diff = fs::canonicalize(lower).ok()?;
    let layer_dir = diff.parent()?;
    blob_path(&layer_dir.join(layer::COMPOSEFS_DATA))
        .is_file()
        .then(|| layer_dir.to_path_buf())
}

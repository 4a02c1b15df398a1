//! Layers served by additional layer stores.
//!
//! An additional layer store is an externally managed directory, usually a
//! FUSE filesystem that fetches layer contents lazily. A layer lives at
//! `<store>/[base64(ref)/]<digest>/` and has `diff`, `info` and `blob`
//! entries. The store learns about its users through marker operations:
//! creating and removing a `use` file announces a user, removing the
//! layer directory announces that a user went away. A store that tracks
//! users answers both with `ENOENT`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use lamina_common::paths::layer;
use lamina_common::{Digest, LaminaError, LaminaResult};

/// One configured additional layer store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalLayerStore {
    /// Root of the store.
    pub path: PathBuf,
    /// Layers are grouped by the base64 encoded image reference.
    pub with_reference: bool,
}

/// Find `digest` in the configured stores. Only the first store is
/// consulted for a given layer, stores are not merged.
///
/// # Errors
///
/// Returns [`LaminaError::AdditionalLayerUnknown`] when the layer or one of
/// its required files is missing.
pub fn lookup(
    stores: &[AdditionalLayerStore],
    digest: &Digest,
    reference: &str,
) -> LaminaResult<PathBuf> {
    let encoded = STANDARD.encode(reference.as_bytes());
    let Some(store) = stores.first() else {
        return Err(LaminaError::AdditionalLayerUnknown {
            reason: format!("additional layer ({digest}, {reference:?}) not found"),
        });
    };

    let mut target = store.path.clone();
    if store.with_reference {
        target.push(&encoded);
    }
    target.push(digest.to_string());

    for required in [layer::DIFF, "info", "blob"] {
        let p = target.join(required);
        if let Err(e) = fs::metadata(&p) {
            return Err(LaminaError::AdditionalLayerUnknown {
                reason: format!("failed to stat additional layer {}: {e}", p.display()),
            });
        }
    }
    Ok(target)
}

/// Tell the store that the layer at `path` gained a user.
pub fn notify_use(path: &Path) {
    if !path.is_absolute() {
        tracing::warn!(path = %path.display(), "Additional layer path must be absolute");
        return;
    }
    let use_file = path.join("use");
    match File::create(&use_file) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Ok(_) => {
            if fs::remove_file(&use_file).is_err() {
                tracing::warn!(path = %use_file.display(), "Failed to remove use file");
            }
            tracing::warn!(
                path = %path.display(),
                "Additional layer store accepted a use file; it does not seem to track users"
            );
        }
        Err(e) => tracing::warn!(
            path = %path.display(),
            %e,
            "Unexpected error from additional layer store during use"
        ),
    }
}

/// Tell the store that the layer at `path` lost a user.
pub fn notify_release(path: &Path) {
    if !path.is_absolute() {
        tracing::warn!(path = %path.display(), "Additional layer path must be absolute");
        return;
    }
    match fs::remove_dir(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Ok(()) => tracing::warn!(
            path = %path.display(),
            "Additional layer store let us remove the layer; it does not seem to track users"
        ),
        Err(e) => tracing::warn!(
            path = %path.display(),
            %e,
            "Unexpected error from additional layer store during release"
        ),
    }
}

/// If `diff` is a link into an additional layer store, return its target.
///
/// # Errors
///
/// Returns an error for relative link targets and unreadable paths.
pub fn redirect_diff(diff: &Path) -> LaminaResult<PathBuf> {
    match fs::read_link(diff) {
        Ok(target) if target.is_absolute() => Ok(target),
        Ok(target) => Err(LaminaError::Internal {
            message: format!("linkpath must be absolute (got: {})", target.display()),
        }),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(diff.to_path_buf()),
        Err(e) => Err(e.into()),
    }
}

/// Store path recorded for the layer in `layer_dir`.
///
/// # Errors
///
/// Returns the I/O error of reading the marker; `NotFound` means the layer
/// does not come from an additional store.
pub fn path_by_layer_dir(layer_dir: &Path) -> io::Result<PathBuf> {
    fs::read_to_string(layer_dir.join(layer::ADDITIONAL_LAYER)).map(PathBuf::from)
}

/// Release the store reference held by the layer in `layer_dir`, if any.
pub fn release_by_layer_dir(layer_dir: &Path) {
    match path_by_layer_dir(layer_dir) {
        Ok(path) => notify_release(&path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(%e, "Unexpected error reading additional layer pointer"),
    }
}

/// A layer found in an additional layer store.
///
/// The handle holds one store reference, dropped on [`AdditionalLayer::release`]
/// or when the handle goes out of scope.
#[derive(Debug)]
pub struct AdditionalLayer {
    path: PathBuf,
    released: AtomicBool,
}

impl AdditionalLayer {
    /// Take a reference on the store layer at `path`.
    #[must_use]
    pub fn acquire(path: PathBuf) -> Self {
        notify_use(&path);
        Self {
            path,
            released: AtomicBool::new(false),
        }
    }

    /// Directory of the layer inside the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the `info` file stored with the layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn info(&self) -> io::Result<File> {
        File::open(self.path.join("info"))
    }

    /// Open the raw layer blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn blob(&self) -> io::Result<File> {
        File::open(self.path.join("blob"))
    }

    /// Point the freshly created layer in `layer_dir` at this store layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the diff cannot be replaced by the link.
    pub fn attach(&self, layer_dir: &Path) -> LaminaResult<()> {
        let diff = layer_dir.join(layer::DIFF);
        fs::remove_dir_all(&diff)?;
        fs::write(
            layer_dir.join(layer::ADDITIONAL_LAYER),
            self.path.as_os_str().as_encoded_bytes(),
        )?;
        notify_use(&self.path);
        std::os::unix::fs::symlink(self.path.join(layer::DIFF), &diff)?;
        tracing::debug!(
            layer = %layer_dir.display(),
            store = %self.path.display(),
            "Attached additional layer"
        );
        Ok(())
    }

    /// Drop the store reference. Later calls do nothing.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            notify_release(&self.path);
        }
    }
}

impl Drop for AdditionalLayer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_layer(with_reference: bool, reference: &str) -> (tempfile::TempDir, AdditionalLayerStore, Digest) {
        let dir = tempfile::tempdir().unwrap();
        let digest = Digest::sha256("abcdef");
        let mut layer_dir = dir.path().to_path_buf();
        if with_reference {
            layer_dir.push(STANDARD.encode(reference));
        }
        layer_dir.push(digest.to_string());
        fs::create_dir_all(layer_dir.join("diff")).unwrap();
        fs::write(layer_dir.join("info"), b"{}").unwrap();
        fs::write(layer_dir.join("blob"), b"blob").unwrap();
        let store = AdditionalLayerStore {
            path: dir.path().to_path_buf(),
            with_reference,
        };
        (dir, store, digest)
    }

    #[test]
    fn lookup_plain_and_by_reference() {
        let (_dir, store, digest) = store_with_layer(false, "");
        let path = lookup(&[store], &digest, "docker.io/library/alpine:latest").unwrap();
        assert!(path.ends_with(digest.to_string()));

        let reference = "docker.io/library/alpine:latest";
        let (_dir, store, digest) = store_with_layer(true, reference);
        let path = lookup(&[store.clone()], &digest, reference).unwrap();
        assert!(path.parent().unwrap().ends_with(STANDARD.encode(reference)));
        assert!(lookup(&[store], &digest, "other").is_err());
    }

    #[test]
    fn lookup_requires_all_files() {
        let (_dir, store, digest) = store_with_layer(false, "");
        fs::remove_file(store.path.join(digest.to_string()).join("blob")).unwrap();
        let err = lookup(&[store], &digest, "").unwrap_err();
        assert!(matches!(err, LaminaError::AdditionalLayerUnknown { .. }));
        assert!(lookup(&[], &digest, "").is_err());
    }

    #[test]
    fn redirect_only_follows_links() {
        let dir = tempfile::tempdir().unwrap();
        let diff = dir.path().join("diff");
        fs::create_dir(&diff).unwrap();
        assert_eq!(redirect_diff(&diff).unwrap(), diff);

        let linked = dir.path().join("linked");
        std::os::unix::fs::symlink("/store/sha256:abc/diff", &linked).unwrap();
        assert_eq!(
            redirect_diff(&linked).unwrap(),
            PathBuf::from("/store/sha256:abc/diff")
        );

        let relative = dir.path().join("relative");
        std::os::unix::fs::symlink("../diff", &relative).unwrap();
        assert!(redirect_diff(&relative).is_err());
    }

    #[test]
    fn attach_and_release() {
        let (_dir, store, digest) = store_with_layer(false, "");
        let path = lookup(&[store], &digest, "").unwrap();
        let handle = AdditionalLayer::acquire(path.clone());

        let layer = tempfile::tempdir().unwrap();
        fs::create_dir(layer.path().join("diff")).unwrap();
        handle.attach(layer.path()).unwrap();
        assert_eq!(path_by_layer_dir(layer.path()).unwrap(), path);
        assert_eq!(
            redirect_diff(&layer.path().join("diff")).unwrap(),
            path.join("diff")
        );

        // A plain directory store refuses rmdir of a non-empty layer.
        handle.release();
        handle.release();
        assert!(path.exists());
    }
}

//! Reference counting of active mounts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lamina_common::LaminaResult;
use parking_lot::Mutex;

type Slot = Arc<Mutex<usize>>;

/// Counts users of each mount point.
///
/// Every path has its own slot; the slot stays locked while the first user
/// mounts or the last user unmounts, so a concurrent `acquire` on the same
/// path waits for the mount to exist instead of racing it.
#[derive(Debug, Default)]
pub struct RefCounter {
    slots: Mutex<HashMap<PathBuf, Slot>>,
}

impl RefCounter {
    /// Create an empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, path: &Path) -> Slot {
        Arc::clone(self.slots.lock().entry(path.to_path_buf()).or_default())
    }

    fn prune(&self, path: &Path) {
        let mut slots = self.slots.lock();
        let idle = slots
            .get(path)
            .is_some_and(|slot| Arc::strong_count(slot) == 1 && *slot.lock() == 0);
        if idle {
            slots.remove(path);
        }
    }

    /// Take a reference on `path`, running `mount` if this is the first one.
    ///
    /// Returns the new count. When `mount` fails no reference is taken.
    ///
    /// # Errors
    ///
    /// Propagates the error of `mount`.
    pub fn acquire<F>(&self, path: &Path, mount: F) -> LaminaResult<usize>
    where
        F: FnOnce() -> LaminaResult<()>,
    {
        let slot = self.slot(path);
        let result = {
            let mut count = slot.lock();
            if *count == 0 {
                mount().map(|()| {
                    *count = 1;
                    1
                })
            } else {
                *count += 1;
                Ok(*count)
            }
        };
        drop(slot);
        if result.is_err() {
            self.prune(path);
        }
        result
    }

    /// Drop a reference on `path`, running `unmount` when it was the last
    /// one or when the path was never counted.
    ///
    /// Returns the remaining count.
    ///
    /// # Errors
    ///
    /// Propagates the error of `unmount`; the count is reset regardless.
    pub fn release<F>(&self, path: &Path, unmount: F) -> LaminaResult<usize>
    where
        F: FnOnce() -> LaminaResult<()>,
    {
        let slot = self.slot(path);
        let result = {
            let mut count = slot.lock();
            if *count > 1 {
                *count -= 1;
                Ok(*count)
            } else {
                *count = 0;
                unmount().map(|()| 0)
            }
        };
        drop(slot);
        self.prune(path);
        result
    }

    /// Current count for `path`.
    #[must_use]
    pub fn count(&self, path: &Path) -> usize {
        self.slots.lock().get(path).map_or(0, |slot| *slot.lock())
    }

    /// Number of tracked mount points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether nothing is mounted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

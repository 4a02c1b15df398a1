//! Shared fixtures for driver tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lamina::archive::{ArchiveEngine, Change, ChangeKind, TarOptions};
use lamina::mount::{MountBackend, MountRequest, StrategyKind};
use lamina::{Driver, DriverBuilder, DriverConfig};
use lamina_common::LaminaResult;
use parking_lot::Mutex;
use tempfile::TempDir;

/// One recorded mount.
#[derive(Debug, Clone)]
pub struct RecordedMount {
    pub kind: StrategyKind,
    pub target: PathBuf,
    pub data: String,
}

/// Backend that records mounts instead of performing them.
///
/// A mount lays the top-level files of every lower and the upper directory
/// flat into the target, upper last, so tree comparisons see content. An
/// unmount empties the target again.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub mounts: Mutex<Vec<RecordedMount>>,
    pub unmounts: Mutex<Vec<PathBuf>>,
    pub mount_calls: AtomicUsize,
    pub unmount_calls: AtomicUsize,
}

impl RecordingBackend {
    pub fn mount_count(&self) -> usize {
        self.mount_calls.load(Ordering::SeqCst)
    }

    pub fn unmount_count(&self) -> usize {
        self.unmount_calls.load(Ordering::SeqCst)
    }

    pub fn last_mount(&self) -> Option<RecordedMount> {
        self.mounts.lock().last().cloned()
    }
}

impl MountBackend for RecordingBackend {
    fn mount(&self, kind: StrategyKind, request: &MountRequest) -> LaminaResult<()> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which a racing caller could mount twice.
        std::thread::sleep(std::time::Duration::from_millis(5));
        flatten_layers(&request.options, &request.home, &request.home.join(&request.target))?;
        self.mounts.lock().push(RecordedMount {
            kind,
            target: request.target.clone(),
            data: request.options.clone(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path, _mount_program: bool) -> LaminaResult<()> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        self.unmounts.lock().push(target.to_path_buf());
        if let Ok(entries) = fs::read_dir(target) {
            for entry in entries {
                let path = entry?.path();
                if path.is_file() {
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }

    fn make_private(&self, _home: &Path) -> LaminaResult<()> {
        Ok(())
    }

    fn detach(&self, _path: &Path) -> LaminaResult<()> {
        Ok(())
    }
}

/// Copy the regular files of the `lowerdir` and `upperdir` entries of an
/// overlay option string into `target`, bottom lower first.
fn flatten_layers(data: &str, home: &Path, target: &Path) -> LaminaResult<()> {
    let mut sources: Vec<PathBuf> = Vec::new();
    let mut upper = None;
    for option in data.split(',') {
        match option.split_once('=') {
            Some(("lowerdir", lowers)) => {
                sources.extend(lowers.split(':').rev().map(|l| home.join(l)));
            }
            Some(("upperdir", dir)) => upper = Some(home.join(dir)),
            _ => {}
        }
    }
    sources.extend(upper);
    for source in sources {
        let Ok(entries) = fs::read_dir(&source) else {
            continue;
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().is_file() {
                fs::copy(entry.path(), target.join(entry.file_name()))?;
            }
        }
    }
    Ok(())
}

/// Regular files directly below `dir`, by name.
fn flat_files(dir: &Path) -> LaminaResult<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().is_file() {
            files.insert(
                entry.file_name().to_string_lossy().into_owned(),
                fs::read(entry.path())?,
            );
        }
    }
    Ok(files)
}

/// Archive engine that writes `name=content` lines as files.
///
/// Exports use the same format, with a `-name` line per deletion. Every
/// entry point counts its calls.
#[derive(Debug, Default)]
pub struct LineArchive {
    pub overlay_calls: AtomicUsize,
    pub tree_calls: AtomicUsize,
    pub tar_calls: AtomicUsize,
    pub export_calls: AtomicUsize,
    pub whiteout_data: Mutex<Vec<PathBuf>>,
}

impl LineArchive {
    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl ArchiveEngine for LineArchive {
    fn untar(&self, diff: &mut dyn Read, dest: &Path, _options: &TarOptions) -> LaminaResult<()> {
        let mut text = String::new();
        diff.read_to_string(&mut text)?;
        for line in text.lines() {
            if let Some((name, content)) = line.split_once('=') {
                fs::write(dest.join(name), content)?;
            }
        }
        Ok(())
    }

    fn overlay_changes(&self, _lowers: &[PathBuf], upper: &Path) -> LaminaResult<Vec<Change>> {
        self.overlay_calls.fetch_add(1, Ordering::SeqCst);
        Ok(flat_files(upper)?
            .into_keys()
            .map(|name| Change {
                path: Path::new("/").join(name),
                kind: ChangeKind::Add,
            })
            .collect())
    }

    fn tree_changes(&self, old: Option<&Path>, new: &Path) -> LaminaResult<Vec<Change>> {
        self.tree_calls.fetch_add(1, Ordering::SeqCst);
        let old = match old {
            Some(dir) => flat_files(dir)?,
            None => BTreeMap::new(),
        };
        let new = flat_files(new)?;

        let mut changes = Vec::new();
        for (name, content) in &new {
            let kind = match old.get(name) {
                None => ChangeKind::Add,
                Some(before) if before != content => ChangeKind::Modify,
                Some(_) => continue,
            };
            changes.push(Change {
                path: Path::new("/").join(name),
                kind,
            });
        }
        for name in old.keys().filter(|name| !new.contains_key(*name)) {
            changes.push(Change {
                path: Path::new("/").join(name),
                kind: ChangeKind::Delete,
            });
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn tar_diff(&self, diff: &Path, options: &TarOptions) -> LaminaResult<Box<dyn Read + Send>> {
        self.tar_calls.fetch_add(1, Ordering::SeqCst);
        *self.whiteout_data.lock() = options.whiteout_data.clone();
        let mut out = String::new();
        for (name, content) in flat_files(diff)? {
            out.push_str(&format!("{name}={}\n", String::from_utf8_lossy(&content)));
        }
        Ok(Box::new(Cursor::new(out.into_bytes())))
    }

    fn export_changes(
        &self,
        root: &Path,
        changes: &[Change],
        _options: &TarOptions,
    ) -> LaminaResult<Box<dyn Read + Send>> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        let mut out = String::new();
        for change in changes {
            let name = change.path.strip_prefix("/").unwrap_or(&change.path);
            match change.kind {
                ChangeKind::Delete => out.push_str(&format!("-{}\n", name.display())),
                ChangeKind::Add | ChangeKind::Modify => {
                    let content = fs::read_to_string(root.join(name))?;
                    out.push_str(&format!("{}={content}\n", name.display()));
                }
            }
        }
        Ok(Box::new(Cursor::new(out.into_bytes())))
    }
}

/// A driver over a fresh temporary store that uses `/bin/true` as its mount
/// program, so no real mount is ever attempted.
pub struct TestDriver {
    pub driver: Driver,
    pub backend: Arc<RecordingBackend>,
    pub archive: Arc<LineArchive>,
    pub root: TempDir,
}

pub fn driver_with_options(extra: &[&str]) -> TestDriver {
    let root = tempfile::tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::default());
    let archive = Arc::new(LineArchive::default());
    let mut options = vec![
        "overlay.mount_program=/bin/true".to_string(),
        "overlay.skip_mount_home=true".to_string(),
    ];
    options.extend(extra.iter().map(|s| (*s).to_string()));
    let config = DriverConfig::with_roots(root.path().join("graph"), root.path().join("run"))
        .with_options(options);
    let driver = DriverBuilder::new(config)
        .with_backend(Arc::clone(&backend) as Arc<dyn MountBackend>)
        .with_archive(Arc::clone(&archive) as Arc<dyn ArchiveEngine>)
        .init()
        .unwrap();
    TestDriver {
        driver,
        backend,
        archive,
        root,
    }
}

pub fn test_driver() -> TestDriver {
    driver_with_options(&[])
}

/// Create a chain of layers `ids[0] <- ids[1] <- ...`.
pub fn create_chain(driver: &Driver, ids: &[&str]) {
    let mut parent: Option<&str> = None;
    for id in ids {
        driver.create(id, parent, None).unwrap();
        parent = Some(id);
    }
}

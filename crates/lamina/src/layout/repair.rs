//! Link alias repair.
//!
//! Layers reference each other only through `l/<alias>` entries, so a lost
//! or stale alias breaks every child of a layer. Repair makes the link
//! directory and the per-layer `link` files agree again, pass after pass,
//! until a pass changes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use lamina_common::error::RepairIssue;
use lamina_common::paths::layer;
use lamina_common::{LaminaError, LaminaResult, LinkId, StorePaths};

use super::{MAX_REPAIR_PASSES, dumb_join};

/// What a repair run changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Passes run, including the final one that changed nothing.
    pub passes: usize,
    /// Passes that changed the store. A store that needed fixing and was
    /// fixed at once reports one here and two in `passes`.
    pub repairing_passes: usize,
    /// Aliases created.
    pub created: usize,
    /// Malformed or dangling aliases removed.
    pub removed: usize,
    /// `link` files rewritten to name an existing alias.
    pub rewritten: usize,
}

#[derive(Debug, Default)]
struct Pass {
    created: usize,
    removed: usize,
    rewritten: usize,
    issues: Vec<RepairIssue>,
}

impl Pass {
    const fn changed(&self) -> bool {
        self.created + self.removed + self.rewritten > 0
    }
}

/// Repair the link directory of the store at `paths`.
///
/// # Errors
///
/// Returns [`LaminaError::Repair`] with every outstanding problem when a
/// pass makes no progress, and [`LaminaError::RepairGaveUp`] when the
/// store still changes after [`MAX_REPAIR_PASSES`] passes.
pub fn recreate_symlinks(paths: &StorePaths) -> LaminaResult<RepairReport> {
    fs::create_dir_all(paths.link_dir())?;

    let mut report = RepairReport::default();
    while report.passes < MAX_REPAIR_PASSES {
        report.passes += 1;
        let pass = repair_pass(paths)?;
        report.created += pass.created;
        report.removed += pass.removed;
        report.rewritten += pass.rewritten;

        if pass.changed() {
            report.repairing_passes += 1;
            continue;
        }
        if pass.issues.is_empty() {
            tracing::debug!(
                passes = report.passes,
                created = report.created,
                removed = report.removed,
                rewritten = report.rewritten,
                "Link aliases are consistent"
            );
            return Ok(report);
        }
        return Err(LaminaError::Repair {
            issues: pass.issues,
        });
    }
    Err(LaminaError::RepairGaveUp {
        passes: report.passes,
    })
}

/// Layer directories below the home: every directory other than the link
/// directory that has a `diff` entry.
fn layer_dirs(home: &Path) -> io::Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(home)? {
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

/// Layer ID of an alias target of the form `../<id>/diff`.
fn target_layer(target: &str) -> Option<&str> {
    let parts: Vec<&str> = target.split('/').collect();
    match parts.as_slice() {
        ["..", id, "diff"] if !id.is_empty() && *id != "." && *id != ".." => Some(*id),
        _ => None,
    }
}

fn read_link_file(dir: &Path) -> io::Result<LinkId> {
    fs::read_to_string(dir.join(layer::LINK)).map(|s| LinkId::from_disk(&s))
}

fn make_alias(paths: &StorePaths, link: &LinkId, id: &str) -> io::Result<()> {
    std::os::unix::fs::symlink(dumb_join(&["..", id, layer::DIFF]), paths.link(link))
}

/// Give `id` a newly generated alias and point its link file at it.
fn mint_alias(paths: &StorePaths, id: &str) -> io::Result<LinkId> {
    let link = LinkId::generate();
    make_alias(paths, &link, id)?;
    fs::write(paths.layer(id).join(layer::LINK), link.as_str())?;
    Ok(link)
}

#[allow(clippy::too_many_lines)]
fn repair_pass(paths: &StorePaths) -> LaminaResult<Pass> {
    let mut pass = Pass::default();
    let ids = layer_dirs(&paths.home)?;
    let mut without_link_file = BTreeSet::new();

    // Every link file must have its alias.
    for id in &ids {
        let dir = paths.layer(id);
        let link = match read_link_file(&dir) {
            Ok(link) => link,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                without_link_file.insert(id.clone());
                continue;
            }
            Err(e) => {
                pass.issues
                    .push(RepairIssue::new(dir.join(layer::LINK), e.to_string()));
                continue;
            }
        };
        let alias = paths.link(&link);
        match fs::read_link(&alias) {
            Ok(target) => {
                let target = target.to_string_lossy();
                match target_layer(&target) {
                    Some(owner) if owner != id => {
                        // The name belongs to another layer; this one needs its own.
                        match mint_alias(paths, id) {
                            Ok(fresh) => {
                                tracing::debug!(
                                    layer = %id,
                                    taken = %link,
                                    owner,
                                    link = %fresh,
                                    "Replaced link alias owned by another layer"
                                );
                                pass.created += 1;
                                pass.rewritten += 1;
                            }
                            Err(e) => pass
                                .issues
                                .push(RepairIssue::new(dir.join(layer::LINK), e.to_string())),
                        }
                    }
                    _ => {}
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(_) => continue,
        }
        match make_alias(paths, &link, id) {
            Ok(()) => {
                tracing::debug!(layer = %id, link = %link, "Recreated missing link alias");
                pass.created += 1;
            }
            Err(e) => pass.issues.push(RepairIssue::new(alias, e.to_string())),
        }
    }

    // Every alias must point at a layer in the home; group the rest.
    let mut claimed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut names: Vec<String> = fs::read_dir(paths.link_dir())?
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    for name in names {
        let alias = paths.link_dir().join(&name);
        let target = match fs::read_link(&alias) {
            Ok(target) => target.to_string_lossy().into_owned(),
            Err(e) => {
                pass.issues.push(RepairIssue::new(&alias, e.to_string()));
                continue;
            }
        };
        let owner = target_layer(&target)
            .filter(|id| paths.layer(id).join(layer::DIFF).symlink_metadata().is_ok());
        match owner {
            Some(id) => claimed.entry(id.to_string()).or_default().push(name),
            None => match fs::remove_file(&alias) {
                Ok(()) => {
                    tracing::debug!(link = %alias.display(), %target, "Removed stale link alias");
                    pass.removed += 1;
                }
                Err(e) => pass.issues.push(RepairIssue::new(&alias, e.to_string())),
            },
        }
    }

    // The link file must name one of the aliases of its layer.
    for (id, aliases) in &claimed {
        let dir = paths.layer(id);
        let current = read_link_file(&dir).ok();
        if current
            .as_ref()
            .is_some_and(|link| aliases.iter().any(|a| a == link.as_str()))
        {
            continue;
        }
        let Some(chosen) = aliases.last() else {
            continue;
        };
        match fs::write(dir.join(layer::LINK), chosen) {
            Ok(()) => {
                tracing::debug!(layer = %id, link = %chosen, "Rewrote layer link file");
                without_link_file.remove(id);
                pass.rewritten += 1;
            }
            Err(e) => pass
                .issues
                .push(RepairIssue::new(dir.join(layer::LINK), e.to_string())),
        }
    }

    // Layers nobody refers to get a fresh alias.
    for id in without_link_file {
        if claimed.contains_key(&id) {
            continue;
        }
        match mint_alias(paths, &id) {
            Ok(link) => {
                tracing::debug!(layer = %id, link = %link, "Created link alias for unlinked layer");
                pass.created += 1;
            }
            Err(e) => pass
                .issues
                .push(RepairIssue::new(paths.layer(&id).join(layer::LINK), e.to_string())),
        }
    }

    Ok(pass)
}

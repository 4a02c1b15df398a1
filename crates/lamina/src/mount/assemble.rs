//! Building the overlay mount data for a layer.

use std::path::{Path, PathBuf};

use lamina_common::paths::layer;
use lamina_common::{LaminaError, LaminaResult};

use super::options::{append_mappings, format_mount_label};
use super::strategy::{StrategyKind, select_strategy};
use crate::idmap::IdMappings;

/// One lower directory, absolute and relative to the driver home.
///
/// The relative form goes through the `l/` aliases and is what keeps the
/// mount data short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lower {
    /// Absolute path.
    pub absolute: PathBuf,
    /// Path relative to the driver home.
    pub relative: String,
}

impl Lower {
    /// Create a lower entry.
    pub fn new(absolute: impl Into<PathBuf>, relative: impl Into<String>) -> Self {
        Self {
            absolute: absolute.into(),
            relative: relative.into(),
        }
    }
}

/// Everything the assembler needs to know about one `get`.
#[derive(Debug, Clone)]
pub struct MountInput<'a> {
    /// Layer ID.
    pub id: &'a str,
    /// Driver home.
    pub home: &'a Path,
    /// Layer directory.
    pub layer_dir: &'a Path,
    /// Lower directories, topmost first.
    pub lowers: &'a [Lower],
    /// Data-only lowers, only referenced through metacopy redirects.
    pub data_only: &'a [Lower],
    /// Caller options placed before the overlay data.
    pub options: &'a [String],
    /// Options appended after the overlay data, in order.
    pub extra: &'a [&'a str],
    /// Mount the upper directory writable.
    pub read_write: bool,
    /// SELinux label for the mount.
    pub mount_label: Option<&'a str>,
    /// Host page size.
    pub page_size: usize,
    /// Whether a mount program will perform the mount.
    pub mount_program: bool,
    /// Mappings passed to the mount program, if shifting is enabled.
    pub program_mappings: Option<&'a IdMappings>,
}

/// The outcome of assembling a mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    /// Strategy to use.
    pub kind: StrategyKind,
    /// Mount target; relative to the home for [`StrategyKind::MountFrom`].
    pub target: PathBuf,
    /// Complete option string.
    pub data: String,
}

fn join_lowers<'a>(lowers: impl Iterator<Item = &'a str>, data_only: &[&str]) -> String {
    let mut out = lowers.collect::<Vec<_>>().join(":");
    for extra in data_only {
        out.push_str("::");
        out.push_str(extra);
    }
    out
}

fn overlay_data(
    lowers: &str,
    diff: &str,
    work: &str,
    input: &MountInput<'_>,
) -> String {
    let overlay = if input.read_write {
        format!("lowerdir={lowers},upperdir={diff},workdir={work}")
    } else {
        format!("lowerdir={diff}:{lowers}")
    };

    let mut parts: Vec<&str> = input.options.iter().map(String::as_str).collect();
    parts.push(&overlay);
    parts.extend(input.extra.iter().copied());
    let data = parts.join(",");
    format_mount_label(&data, input.mount_label)
}

/// Assemble the mount for a layer.
///
/// Absolute paths are used when they fit into one page. Otherwise the
/// data is rebuilt with paths relative to the home for the re-exec helper;
/// a mount program gets absolute paths regardless.
///
/// # Errors
///
/// Returns [`LaminaError::MountDataTooLarge`] when even the relative form
/// does not fit.
pub fn plan_mount(input: &MountInput<'_>) -> LaminaResult<MountPlan> {
    let diff = input.layer_dir.join(layer::DIFF);
    let work = input.layer_dir.join(layer::WORK);
    let merged = input.layer_dir.join(layer::MERGED);

    let abs_data_only: Vec<String> = input
        .data_only
        .iter()
        .map(|l| l.absolute.display().to_string())
        .collect();
    let abs_data_only: Vec<&str> = abs_data_only.iter().map(String::as_str).collect();
    let abs_lowers: Vec<String> = input
        .lowers
        .iter()
        .map(|l| l.absolute.display().to_string())
        .collect();
    let lowers = join_lowers(abs_lowers.iter().map(String::as_str), &abs_data_only);

    let mut data = overlay_data(
        &lowers,
        &diff.display().to_string(),
        &work.display().to_string(),
        input,
    );

    let kind = select_strategy(data.len(), input.page_size, input.mount_program);
    match kind {
        StrategyKind::MountProgram => {
            if let Some(maps) = input.program_mappings {
                data = append_mappings(&data, &maps.uids, &maps.gids);
            }
            Ok(MountPlan {
                kind,
                target: merged,
                data,
            })
        }
        StrategyKind::Direct => Ok(MountPlan {
            kind,
            target: merged,
            data,
        }),
        StrategyKind::MountFrom => {
            let rel_data_only: Vec<&str> =
                input.data_only.iter().map(|l| l.relative.as_str()).collect();
            let lowers = join_lowers(
                input.lowers.iter().map(|l| l.relative.as_str()),
                &rel_data_only,
            );
            let id = input.id;
            let data = overlay_data(
                &lowers,
                &format!("{id}/{}", layer::DIFF),
                &format!("{id}/{}", layer::WORK),
                input,
            );
            if data.len() > input.page_size {
                return Err(LaminaError::MountDataTooLarge {
                    len: data.len(),
                    page_size: input.page_size,
                });
            }
            tracing::debug!(id, len = data.len(), "Using relative mount data");
            Ok(MountPlan {
                kind,
                target: Path::new(id).join(layer::MERGED),
                data,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idmap::IdMap;

    fn input<'a>(lowers: &'a [Lower], options: &'a [String], extra: &'a [&'a str]) -> MountInput<'a> {
        MountInput {
            id: "abc",
            home: Path::new("/h"),
            layer_dir: Path::new("/h/abc"),
            lowers,
            data_only: &[],
            options,
            extra,
            read_write: true,
            mount_label: None,
            page_size: 4096,
            mount_program: false,
            program_mappings: None,
        }
    }

    fn lowers(n: usize) -> Vec<Lower> {
        (0..n)
            .map(|i| {
                let link = format!("{i:0>26}");
                Lower::new(format!("/var/lib/lamina/overlay/l/{link}"), format!("l/{link}"))
            })
            .collect()
    }

    #[test]
    fn read_write_layout() {
        let lowers = lowers(2);
        let plan = plan_mount(&input(&lowers, &[], &[])).unwrap();
        assert_eq!(plan.kind, StrategyKind::Direct);
        assert_eq!(plan.target, PathBuf::from("/h/abc/merged"));
        assert_eq!(
            plan.data,
            format!(
                "lowerdir={}:{},upperdir=/h/abc/diff,workdir=/h/abc/work",
                lowers[0].absolute.display(),
                lowers[1].absolute.display()
            )
        );
    }

    #[test]
    fn read_only_folds_diff_into_lowers() {
        let lowers = lowers(1);
        let options = vec!["ro".to_string()];
        let mut inp = input(&lowers, &options, &[]);
        inp.read_write = false;
        let plan = plan_mount(&inp).unwrap();
        assert!(plan.data.starts_with("ro,lowerdir=/h/abc/diff:/var/lib/lamina/overlay/l/"));
        assert!(!plan.data.contains("upperdir"));
    }

    #[test]
    fn extras_and_label_follow_overlay_data() {
        let lowers = lowers(1);
        let options = vec!["nodev".to_string(), "metacopy=on".to_string()];
        let extra = ["userxattr", "volatile"];
        let mut inp = input(&lowers, &options, &extra);
        inp.mount_label = Some("label");
        let plan = plan_mount(&inp).unwrap();
        assert!(plan.data.starts_with("nodev,metacopy=on,lowerdir="));
        assert!(plan.data.ends_with(",userxattr,volatile,context=\"label\""));
    }

    #[test]
    fn long_data_switches_to_relative_paths() {
        let lowers = lowers(100);
        let plan = plan_mount(&input(&lowers, &[], &[])).unwrap();
        assert_eq!(plan.kind, StrategyKind::MountFrom);
        assert_eq!(plan.target, PathBuf::from("abc/merged"));
        assert!(plan.data.starts_with("lowerdir=l/"));
        assert!(plan.data.ends_with(",upperdir=abc/diff,workdir=abc/work"));
        assert!(plan.data.len() <= 4096);
    }

    #[test]
    fn too_large_even_when_relative() {
        let lowers = lowers(400);
        let err = plan_mount(&input(&lowers, &[], &[])).unwrap_err();
        assert!(matches!(err, LaminaError::MountDataTooLarge { .. }));
    }

    #[test]
    fn mount_program_keeps_absolute_paths_and_appends_mappings() {
        let lowers = lowers(150);
        let maps = IdMappings::new(vec![IdMap::new(0, 1000, 1)], vec![IdMap::new(0, 1000, 1)]);
        let mut inp = input(&lowers, &[], &[]);
        inp.mount_program = true;
        inp.program_mappings = Some(&maps);
        let plan = plan_mount(&inp).unwrap();
        assert_eq!(plan.kind, StrategyKind::MountProgram);
        assert!(plan.data.starts_with("lowerdir=/var/lib/lamina/overlay/l/"));
        assert!(plan.data.ends_with(",squash_to_uid=1000,squash_to_gid=1000"));
    }

    #[test]
    fn data_only_lowers_use_double_colon() {
        let lowers = vec![Lower::new("/h/abc/composefs-layers/0", "abc/composefs-layers/0")];
        let data_only = vec![Lower::new("/h/def/diff", "def/diff")];
        let mut inp = input(&lowers, &[], &[]);
        inp.data_only = &data_only;
        let plan = plan_mount(&inp).unwrap();
        assert!(plan.data.starts_with("lowerdir=/h/abc/composefs-layers/0::/h/def/diff,"));
    }
}

//! Mount option strings.
//!
//! The caller hands over `mount(8)`-style option lists. Options the kernel
//! expects as `MS_*` flags are split out; everything else is passed through
//! as filesystem data.

use rustix::mount::MountFlags;

use crate::idmap::IdMap;

/// How a textual option affects the flag word.
enum FlagOp {
    Set(MountFlags),
    Clear(MountFlags),
}

fn flag_op(option: &str) -> Option<FlagOp> {
    use FlagOp::{Clear, Set};

    let op = match option {
        "defaults" | "rw" => Clear(MountFlags::RDONLY),
        "ro" => Set(MountFlags::RDONLY),
        "suid" => Clear(MountFlags::NOSUID),
        "nosuid" => Set(MountFlags::NOSUID),
        "dev" => Clear(MountFlags::NODEV),
        "nodev" => Set(MountFlags::NODEV),
        "exec" => Clear(MountFlags::NOEXEC),
        "noexec" => Set(MountFlags::NOEXEC),
        "sync" => Set(MountFlags::SYNCHRONOUS),
        "async" => Clear(MountFlags::SYNCHRONOUS),
        "dirsync" => Set(MountFlags::DIRSYNC),
        "atime" => Clear(MountFlags::NOATIME),
        "noatime" => Set(MountFlags::NOATIME),
        "diratime" => Clear(MountFlags::NODIRATIME),
        "nodiratime" => Set(MountFlags::NODIRATIME),
        "bind" => Set(MountFlags::BIND),
        "rbind" => Set(MountFlags::BIND.union(MountFlags::REC)),
        "relatime" => Set(MountFlags::RELATIME),
        "norelatime" => Clear(MountFlags::RELATIME),
        "strictatime" => Set(MountFlags::STRICTATIME),
        "nostrictatime" => Clear(MountFlags::STRICTATIME),
        _ => return None,
    };
    Some(op)
}

/// Split a comma separated option string into mount flags and the data
/// string handed to the filesystem.
#[must_use]
pub fn parse_mount_options(options: &str) -> (MountFlags, String) {
    let mut flags = MountFlags::empty();
    let mut data = Vec::new();

    for option in options.split(',').filter(|o| !o.is_empty()) {
        match flag_op(option) {
            Some(FlagOp::Set(f)) => flags |= f,
            Some(FlagOp::Clear(f)) => flags &= !f,
            None => data.push(option),
        }
    }
    (flags, data.join(","))
}

/// Split a comma separated list into its non-empty options.
#[must_use]
pub fn split_options(options: &str) -> Vec<String> {
    options
        .split(',')
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether `options` contains exactly `name`.
#[must_use]
pub fn has_option<S: AsRef<str>>(options: &[S], name: &str) -> bool {
    options.iter().any(|o| o.as_ref() == name)
}

/// Append an SELinux context to mount data.
#[must_use]
pub fn format_mount_label(data: &str, label: Option<&str>) -> String {
    match label {
        Some(label) if !label.is_empty() => {
            if data.is_empty() {
                format!("context=\"{label}\"")
            } else {
                format!("{data},context=\"{label}\"")
            }
        }
        _ => data.to_string(),
    }
}

fn mapping_option(kind: &str, maps: &[IdMap]) -> String {
    if let [single] = maps {
        if single.size == 1 {
            return format!("squash_to_{kind}={}", single.host_id);
        }
    }
    let ranges = maps
        .iter()
        .map(|m| format!("{}:{}:{}", m.container_id, m.host_id, m.size))
        .collect::<Vec<_>>()
        .join(":");
    format!("{kind}mapping={ranges}")
}

/// Append UID/GID mapping options understood by FUSE mount programs.
///
/// Single-ID tables squash every owner to that ID.
#[must_use]
pub fn append_mappings(data: &str, uid_maps: &[IdMap], gid_maps: &[IdMap]) -> String {
    if uid_maps.is_empty() {
        return data.to_string();
    }
    format!(
        "{data},{},{}",
        mapping_option("uid", uid_maps),
        mapping_option("gid", gid_maps)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn flags_are_split_from_data() {
        let (flags, data) = parse_mount_options("ro,nodev,lowerdir=/a:/b,metacopy=on");
        assert!(flags.contains(MountFlags::RDONLY | MountFlags::NODEV));
        assert_eq!(data, "lowerdir=/a:/b,metacopy=on");
    }

    #[test]
    fn later_options_win() {
        let (flags, _) = parse_mount_options("ro,rw");
        assert!(!flags.contains(MountFlags::RDONLY));
    }

    #[test]
    fn mandatory_locking_is_not_a_flag() {
        let (flags, data) = parse_mount_options("nodev,mand,nomand");
        assert_eq!(flags, MountFlags::NODEV);
        assert_eq!(data, "mand,nomand");
    }

    #[test]
    fn empty_options() {
        let (flags, data) = parse_mount_options("");
        assert!(flags.is_empty());
        assert!(data.is_empty());
        assert!(split_options(",,").is_empty());
    }

    #[test]
    fn label_formatting() {
        assert_eq!(format_mount_label("a=b", None), "a=b");
        assert_eq!(format_mount_label("a=b", Some("")), "a=b");
        assert_eq!(
            format_mount_label("a=b", Some("system_u:object_r:container_file_t:s0")),
            "a=b,context=\"system_u:object_r:container_file_t:s0\""
        );
        assert_eq!(format_mount_label("", Some("x")), "context=\"x\"");
    }

    #[test]
    fn mappings_for_mount_program() {
        let uids = [IdMap::new(0, 1000, 1), IdMap::new(1, 100_000, 65536)];
        let gids = [IdMap::new(0, 1000, 1)];
        assert_eq!(
            append_mappings("lowerdir=/a", &uids, &gids),
            "lowerdir=/a,uidmapping=0:1000:1:1:100000:65536,squash_to_gid=1000"
        );
        assert_eq!(append_mappings("lowerdir=/a", &[], &[]), "lowerdir=/a");
    }

    proptest! {
        #[test]
        fn unknown_options_pass_through(opts in proptest::collection::vec("[a-z]{3,8}=[a-z0-9/]{1,8}", 0..6)) {
            let joined = opts.join(",");
            let (flags, data) = parse_mount_options(&joined);
            prop_assert!(flags.is_empty());
            prop_assert_eq!(data, joined);
        }
    }
}

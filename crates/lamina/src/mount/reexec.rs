//! Mounting from a re-executed helper process.
//!
//! When the overlay mount data would not fit into a page, the paths are
//! rewritten relative to the driver home and the mount is performed by a
//! child process whose working directory is the home. Changing directory in
//! the calling process would race other threads, so the child is a fresh
//! copy of the current executable started with [`MOUNT_FROM_ARG`].

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use lamina_common::{LaminaError, LaminaResult};
use serde::{Deserialize, Serialize};

use super::options::parse_mount_options;
use super::syscall;

/// First argument that turns the current executable into the mount helper.
pub const MOUNT_FROM_ARG: &str = "lamina-mountfrom";

/// What the helper should mount, sent as JSON on its stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFromRequest {
    /// Directory to change into before mounting.
    pub dir: PathBuf,
    /// Mount source.
    pub source: String,
    /// Mount target, relative to `dir`.
    pub target: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Full option string, flags included.
    pub options: String,
}

/// Run the mount described by `request` in a helper process.
///
/// # Errors
///
/// Returns [`LaminaError::Mount`] carrying the helper's stderr when the
/// helper cannot be started or reports a failure.
pub fn mount_from(request: &MountFromRequest) -> LaminaResult<()> {
    let exe = std::env::current_exe()?;
    let payload = serde_json::to_vec(request)?;

    tracing::debug!(
        dir = %request.dir.display(),
        target = %request.target.display(),
        "Mounting through re-exec helper"
    );

    let mut child = Command::new(exe)
        .arg(MOUNT_FROM_ARG)
        .arg(&request.dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| mount_error(request, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).map_err(|e| mount_error(request, e))?;
    }

    let output = child.wait_with_output().map_err(|e| mount_error(request, e))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(mount_error(
        request,
        std::io::Error::other(format!("mountfrom helper {}: {stderr}", output.status)),
    ))
}

fn mount_error(request: &MountFromRequest, source: std::io::Error) -> LaminaError {
    LaminaError::Mount {
        target: request.dir.join(&request.target),
        data: request.options.clone(),
        source,
    }
}

/// Serve a mount request from stdin. Only ever called inside the helper.
fn serve(dir: &Path) -> LaminaResult<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let request: MountFromRequest = serde_json::from_str(&input)?;
    if request.dir != dir {
        return Err(LaminaError::config(format!(
            "helper started for {} but asked to mount in {}",
            dir.display(),
            request.dir.display()
        )));
    }

    std::env::set_current_dir(&request.dir)?;
    let (flags, data) = parse_mount_options(&request.options);
    syscall::mount_fs(&request.source, &request.target, &request.fstype, flags, &data)?;
    Ok(())
}

/// Act as the re-exec mount helper when started as one.
///
/// Binaries embedding the driver must call this at the very top of `main`.
/// In a helper invocation the function performs the mount and exits the
/// process; otherwise it returns immediately.
pub fn init_if_helper() {
    let mut args = std::env::args_os().skip(1);
    if args.next().as_deref() != Some(std::ffi::OsStr::new(MOUNT_FROM_ARG)) {
        return;
    }
    let Some(dir) = args.next() else {
        eprintln!("{MOUNT_FROM_ARG}: missing directory argument");
        std::process::exit(2);
    };

    match serve(Path::new(&dir)) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let request = MountFromRequest {
            dir: PathBuf::from("/var/lib/lamina/overlay"),
            source: "overlay".to_string(),
            target: PathBuf::from("abc/merged"),
            fstype: "overlay".to_string(),
            options: "lowerdir=l/AAAA:l/BBBB,upperdir=abc/diff,workdir=abc/work".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: MountFromRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn init_is_noop_outside_helper() {
        init_if_helper();
    }
}

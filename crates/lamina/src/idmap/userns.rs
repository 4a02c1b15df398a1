#![allow(unsafe_code)]
//! Throwaway user namespace processes.
//!
//! An ID-mapped mount needs a user namespace carrying the desired mapping.
//! The cheapest way to get one is a child cloned straight into a new user
//! namespace that does nothing but sleep until it is killed.

use std::fs;

use lamina_common::{LaminaError, LaminaResult};

use super::IdMap;

/// A sleeping process living in its own user namespace.
///
/// Dropping the handle kills and reaps the process.
#[derive(Debug)]
pub struct UsernsProcess {
    pid: libc::pid_t,
}

impl UsernsProcess {
    /// PID of the namespace holder.
    #[must_use]
    pub const fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Path of the user namespace file of the process.
    #[must_use]
    pub fn ns_path(&self) -> String {
        format!("/proc/{}/ns/user", self.pid)
    }

    /// Kill and reap the process now.
    pub fn cleanup(self) {
        drop(self);
    }
}

impl Drop for UsernsProcess {
    fn drop(&mut self) {
        // SAFETY: pid refers to our own child; it is reaped right after.
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
            while libc::waitpid(self.pid, std::ptr::null_mut(), 0) == -1
                && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
            {}
        }
        tracing::trace!(pid = self.pid, "Reaped user namespace process");
    }
}

/// Clone a process into a new user namespace and install the given maps.
///
/// # Errors
///
/// Returns an error if the clone fails or the maps are rejected by the
/// kernel. The process is reaped before returning an error.
pub fn create_userns_process(uid_maps: &[IdMap], gid_maps: &[IdMap]) -> LaminaResult<UsernsProcess> {
    // A raw clone without CLONE_VM gives the child a copy of the address
    // space; it only calls async-signal-safe functions before sleeping.
    // SAFETY: the child never returns into Rust code paths that allocate.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            libc::c_long::from(libc::CLONE_NEWUSER | libc::SIGCHLD),
            0 as libc::c_long,
            0 as libc::c_long,
            0 as libc::c_long,
            0 as libc::c_long,
        )
    };

    if ret < 0 {
        return Err(LaminaError::Internal {
            message: format!("clone user namespace: {}", std::io::Error::last_os_error()),
        });
    }

    if ret == 0 {
        // SAFETY: child side, only raw syscalls until SIGKILL arrives.
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0);
            loop {
                libc::pause();
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    let process = UsernsProcess {
        pid: ret as libc::pid_t,
    };

    write_mappings(&format!("/proc/{}/uid_map", process.pid), uid_maps)?;
    write_mappings(&format!("/proc/{}/gid_map", process.pid), gid_maps)?;

    tracing::debug!(pid = process.pid, "Created user namespace process");
    Ok(process)
}

fn write_mappings(path: &str, maps: &[IdMap]) -> LaminaResult<()> {
    let content: String = maps
        .iter()
        .map(|m| format!("{}\n", m.to_proc_format()))
        .collect();
    fs::write(path, content).map_err(|e| LaminaError::Internal {
        message: format!("Failed to write {path}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(not(feature = "integration"), ignore)]
    fn identity_namespace_process() {
        let maps = [IdMap::new(0, 0, 1)];
        let process = create_userns_process(&maps, &maps).unwrap();
        let uid_map = fs::read_to_string(format!("/proc/{}/uid_map", process.pid())).unwrap();
        assert!(uid_map.split_whitespace().eq(["0", "0", "1"]));
        let pid = process.pid();
        process.cleanup();
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }
}

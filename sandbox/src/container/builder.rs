//! Spawns a container daemon (C3) process and hands back a connected [`ContainerClient`] (C4).
//!
//! Per the documented lifecycle, a container instance is created by `Builder::build()`: it forks
//! a fresh, namespaced process running `--container-init`, waits for its first `ping` to answer,
//! and returns. Spawning reuses [`crate::forkexec::start`] itself — the daemon-to-be is just
//! another `ExecutionParams` execution, one that re-execs the current binary with the sentinel
//! argument instead of running a user program, and that carries the host's end of a fresh
//! socketpair through at fd index 3 instead of the usual stdio triplet.

use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};

use crate::forkexec::{self, StartOutcome};
use crate::mount::Mount;
use crate::{ContainerClient, ExecutionParams, SandboxConfig};

/// Builds and spawns a container daemon. Mirrors [`crate::mount::MountBuilder`]'s consuming,
/// chainable style.
pub struct ContainerBuilder {
    config: SandboxConfig,
    mounts: Vec<Mount>,
}

impl ContainerBuilder {
    pub fn new(config: SandboxConfig) -> ContainerBuilder {
        ContainerBuilder { config, mounts: Vec::new() }
    }

    /// Mount plan applied inside the daemon's new root before it starts serving requests. Built
    /// separately from any per-`execve` mount, since the daemon's root is set up once for its
    /// whole lifetime.
    pub fn mounts(mut self, mounts: Vec<Mount>) -> ContainerBuilder {
        self.mounts = mounts;
        self
    }

    /// Fork the daemon, wait for it to answer a `ping`, and return a client connected to it. The
    /// daemon keeps running (and the namespaces it set up stay alive) until the returned client
    /// is dropped and the daemon observes the control socket close.
    pub fn build(self) -> crate::Result<ContainerClient> {
        std::fs::create_dir_all(&self.config.container_root)?;

        let (host_fd, daemon_fd): (RawFd, RawFd) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;

        let exe = std::env::current_exe()?;
        let params = self.daemon_params(exe, daemon_fd);

        let mut sync_func = |_pid: nix::unistd::Pid| Ok(());
        let outcome = forkexec::start(&params, &mut sync_func);

        // The daemon's own copy of `daemon_fd` now lives at its fd 3; this side never needs it
        // again regardless of whether the clone succeeded.
        let _ = nix::unistd::close(daemon_fd);

        match outcome? {
            StartOutcome::Started(_pid) => {}
            StartOutcome::Failed(err) => {
                let _ = nix::unistd::close(host_fd);
                return Err(crate::ErrorKind::ChildStartupFailed(err).into());
            }
        }

        let mut client = ContainerClient::new(host_fd);
        client.ping()?;
        Ok(client)
    }

    fn daemon_params(&self, exe: PathBuf, daemon_fd: RawFd) -> ExecutionParams {
        let mut params = ExecutionParams::new(
            vec![exe.into_os_string(), OsString::from("--container-init")],
            PathBuf::from("/"),
        );
        params.files = vec![libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO, daemon_fd];
        params.mounts = self.mounts.clone();
        params.new_root = Some(self.config.container_root.clone());
        params.unshare_newns = true;
        params.unshare_pid = true;
        params.unshare_net = true;
        params.unshare_ipc = true;
        params.unshare_uts = true;
        params.unshare_user = true;
        params.unshare_cgroup_at_clone = false;
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_params_carries_sentinel_and_inherited_fd() {
        let builder = ContainerBuilder::new(SandboxConfig::default());
        let params = builder.daemon_params(PathBuf::from("/usr/bin/sandbox-bin"), 9);
        assert_eq!(params.argv[1], OsString::from("--container-init"));
        assert_eq!(params.files, vec![0, 1, 2, 9]);
        assert!(params.unshare_newns);
        assert_eq!(params.new_root, Some(builder.config.container_root.clone()));
    }
}

//! Message shapes exchanged between the container client (C4) and daemon (C3) over a
//! [`crate::socket::FramedChannel`] (C2). Encoded with `rmp-serde` (MessagePack): compact, and
//! already a dependency this crate's sibling components use for their own wire formats.

use serde::{Deserialize, Serialize};

use crate::{ExecResult, Pid, RLimitSpec};

/// A request sent from the host (C4) to the container daemon (C3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    /// Check the daemon is alive; answered with `Reply::Pong`.
    Ping,

    /// Apply container-wide settings. Answered with `Reply::Ok`.
    Conf(ContainerSettings),

    /// Start a program. Real file descriptors (`exec_fd`, `cgroup_fd`, then `files` in that fixed
    /// order) travel as ancillary data alongside this message, not inside it; this payload only
    /// carries the fd *count* hints plus everything else `ExecutionParams` needs.
    Execve(ExecveRequest),

    /// Ask the daemon to `SIGKILL` the running child's process group. Idempotent: a `Kill`
    /// received before any `Execve`, or after the child has already been reaped, is a no-op.
    Kill,

    /// Acknowledge a pid-carrying reply, releasing the daemon to continue towards exec, or
    /// acknowledge a final reply, driving the daemon from *Draining* back to *Idle*.
    Ok,
}

/// A reply sent from the container daemon (C3) back to the host (C4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    Pong,
    Ok,

    /// Carries the started child's pid. On the wire this additionally arrives as
    /// `SCM_CREDENTIALS` ancillary data; the pid inside the payload is redundant but lets the
    /// client avoid depending on `SO_PASSCRED` having been enabled.
    Pid(Pid),

    /// The terminal reply for an `Execve` request.
    ExecResult(ExecResult),

    /// A free-form diagnostic for transport or daemon-internal failures that do not fit the
    /// `ExecResult` taxonomy (e.g. the daemon itself could not parse the request).
    Error(String),
}

/// Settings that apply to every execution the daemon subsequently runs, sent once after the
/// daemon is spawned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerSettings {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub unshare_cgroup: bool,
    pub default_env: Vec<(String, String)>,
}

/// The non-fd portion of `ExecutionParams`, sent as the `Execve` command payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecveRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,

    /// Number of positional `files` fds that will arrive as ancillary data, in order.
    pub file_count: u32,
    pub has_exec_fd: bool,
    pub has_cgroup_fd: bool,

    pub rlimits: Vec<RLimitSpec>,
    pub work_dir: String,
    pub ctty: bool,
    pub sync_after_exec: bool,

    /// A compiled cBPF program (see `SeccompFilter::export_bpf`) to install in the child, or
    /// `None` to run the request with no syscall policy at all.
    pub seccomp_bpf: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execve_request_round_trips_through_rmp_serde() {
        let request = ExecveRequest {
            argv: vec!["/bin/echo".to_owned(), "hi".to_owned()],
            env: vec![("PATH".to_owned(), "/usr/bin".to_owned())],
            file_count: 3,
            has_exec_fd: false,
            has_cgroup_fd: true,
            rlimits: crate::default_rlimits(1, 256 << 20, 64 << 20, 64 << 20),
            work_dir: "/sandbox/w".to_owned(),
            ctty: false,
            sync_after_exec: false,
            seccomp_bpf: Some(vec![1, 2, 3, 4]),
        };

        let encoded = rmp_serde::to_vec(&request).unwrap();
        let decoded: ExecveRequest = rmp_serde::from_slice(&encoded).unwrap();

        assert_eq!(decoded.argv, request.argv);
        assert_eq!(decoded.file_count, request.file_count);
        assert_eq!(decoded.has_cgroup_fd, request.has_cgroup_fd);
        assert_eq!(decoded.rlimits.len(), request.rlimits.len());
        assert_eq!(decoded.seccomp_bpf, request.seccomp_bpf);
    }

    #[test]
    fn test_command_enum_round_trips() {
        let encoded = rmp_serde::to_vec(&Command::Kill).unwrap();
        let decoded: Command = rmp_serde::from_slice(&encoded).unwrap();
        matches!(decoded, Command::Kill);
    }
}

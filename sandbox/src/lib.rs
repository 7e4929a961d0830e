//! This crate implements a sandboxed execution engine. Given a program to run, it creates an
//! isolated child process under a prescribed set of Linux namespaces, resource limits, and a
//! seccomp syscall filter, and reports back how the program behaved: its exit status, wall/CPU
//! time, peak memory, and why it stopped running (normally, because it was killed for exceeding a
//! limit, or because it attempted something disallowed).
//!
//! Two ways to supervise an execution are provided, built on the same [`forkexec::start`]
//! primitive:
//!
//! * a [`ptrace`] supervisor that runs in-process and arbitrates filesystem-sensitive syscalls by
//!   path as they happen;
//! * a [`container`] daemon/client pair that runs the execution inside a long-lived, already
//!   namespaced process, communicating over a framed control [`socket`].

#[macro_use]
extern crate error_chain;
extern crate libc;
extern crate nix;
extern crate seccomp_sys;

pub mod container;
pub mod forkexec;
pub mod mount;
pub mod protocol;
pub mod ptrace;
pub mod seccomp;
pub mod socket;

mod misc;
mod rlimits;

use std::cmp::Ordering;
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};

pub use mount::Mount;
pub use rlimits::{default_rlimits, Resource, RLimitSpec};
pub use seccomp::{Action, SeccompFilter, SyscallRule};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        Io(::std::io::Error);
        Nix(::nix::Error);
        Seccomp(seccomp::SeccompError);
        RmpEncode(::rmp_serde::encode::Error);
        RmpDecode(::rmp_serde::decode::Error);
    }

    errors {
        InvalidProcessArgument(arg: String) {
            description("invalid argv entry")
            display("invalid argv entry: {}", arg)
        }

        InvalidEnvironmentVariable(env: String) {
            description("invalid environment variable")
            display("invalid environment variable: {}", env)
        }

        ChildStartupFailed(err: ChildError) {
            description("child process failed to start")
            display("child process failed to start at {:?} (step {}): errno {}",
                err.location, err.step, err.errno)
        }

        ProtocolError(msg: String) {
            description("control protocol error")
            display("control protocol error: {}", msg)
        }

        ChannelClosed {
            description("control channel is permanently closed")
        }
    }
}

/// Type for process identifiers, kept distinct from `nix::unistd::Pid` so that this crate's
/// public API does not force `nix` on every caller.
pub type Pid = i32;

/// Measurement of the size of a block of memory.
#[derive(Clone, Copy, Debug, Eq)]
pub enum MemorySize {
    Bytes(usize),
    KiloBytes(usize),
    MegaBytes(usize),
    GigaBytes(usize),
    TeraBytes(usize),
}

impl MemorySize {
    pub fn bytes(&self) -> usize {
        match self {
            MemorySize::Bytes(s) => *s,
            MemorySize::KiloBytes(s) => s * 1024,
            MemorySize::MegaBytes(s) => s * 1024 * 1024,
            MemorySize::GigaBytes(s) => s * 1024 * 1024 * 1024,
            MemorySize::TeraBytes(s) => s * 1024 * 1024 * 1024 * 1024,
        }
    }
}

impl PartialEq for MemorySize {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for MemorySize {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemorySize {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes().cmp(&other.bytes())
    }
}

impl From<usize> for MemorySize {
    fn from(value: usize) -> MemorySize {
        MemorySize::Bytes(value)
    }
}

impl Display for MemorySize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MemorySize::Bytes(s) => f.write_fmt(format_args!("{} B", s)),
            MemorySize::KiloBytes(s) => f.write_fmt(format_args!("{} KB", s)),
            MemorySize::MegaBytes(s) => f.write_fmt(format_args!("{} MB", s)),
            MemorySize::GigaBytes(s) => f.write_fmt(format_args!("{} GB", s)),
            MemorySize::TeraBytes(s) => f.write_fmt(format_args!("{} TB", s)),
        }
    }
}

/// Process-wide configuration, constructed explicitly by library callers. The library itself
/// never reads environment variables or configuration files; only the `sandbox-bin` CLI front end
/// parses flags and fills this in.
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    /// Staging directory a container instance uses for its `old_root`, tmpfs work dir, and bind
    /// mount targets.
    pub container_root: PathBuf,

    /// Environment handed to every container-mode child unless the request overrides it.
    pub default_env: Vec<(String, String)>,

    /// uid/gid the container daemon itself (not its children) runs as, if overridden.
    pub daemon_uid: Option<u32>,
    pub daemon_gid: Option<u32>,

    /// Whether the container should `unshare(NEWCGROUP)` after the sync handshake rather than
    /// relying on `CLONE_INTO_CGROUP` at clone time.
    pub unshare_cgroup: bool,

    /// Rlimit defaults applied when a caller's `ExecutionParams` does not specify its own.
    pub default_cpu_time_secs: u64,
    pub default_memory_bytes: u64,
    pub default_stack_bytes: u64,
    pub default_output_bytes: u64,
}

impl Default for SandboxConfig {
    fn default() -> SandboxConfig {
        SandboxConfig {
            container_root: PathBuf::from("/tmp/sandbox-root"),
            default_env: Vec::new(),
            daemon_uid: None,
            daemon_gid: None,
            unshare_cgroup: false,
            default_cpu_time_secs: 1,
            default_memory_bytes: 256 << 20,
            default_stack_bytes: 64 << 20,
            default_output_bytes: 64 << 20,
        }
    }
}

/// Positional mapping of a child fd index to a host-owned fd. Index 0, 1, 2 are stdio.
pub type FdMapping = Vec<RawFd>;

/// Where the seccomp filter a child installs comes from: compiled in this process via
/// libseccomp, or precompiled cBPF bytes that arrived over the container wire protocol (the
/// daemon's process never saw the symbolic rule list the client built `SeccompFilter` from, only
/// the bytes `SeccompFilter::export_bpf` produced).
pub enum SeccompSource {
    Compiled(SeccompFilter),
    Bpf(Vec<u8>),
}

/// Per-run input to [`forkexec::start`] and, by extension, to the container and ptrace runners.
pub struct ExecutionParams {
    pub argv: Vec<OsString>,
    pub env: Vec<(String, String)>,

    /// `child_fd_index -> host_fd`; indices 0, 1, 2 are stdio.
    pub files: FdMapping,

    /// Executable image fd; when present, exec is performed against the fd rather than a
    /// pathname (`argv[0]` is still passed as `argv[0]` to the exec'd program).
    pub exec_fd: Option<RawFd>,

    /// Resource-accounting group directory fd; when present the child is placed in that group by
    /// the kernel at clone time via `CLONE_INTO_CGROUP`.
    pub cgroup_fd: Option<RawFd>,

    pub rlimits: Vec<RLimitSpec>,

    /// Seccomp filter to install in the child; `None` selects "unsafe" mode with no syscall
    /// policy at all.
    pub seccomp_filter: Option<SeccompSource>,

    pub mounts: Vec<Mount>,

    /// New root for the child's mount namespace; `None` skips `pivot_root` entirely even if
    /// `unshare_mount_ns` requests a private mount namespace for other reasons.
    pub new_root: Option<PathBuf>,

    pub work_dir: PathBuf,

    /// Whether the child should acquire a controlling terminal on fd 0 via `TIOCSCTTY`.
    pub ctty: bool,

    /// Selects which edge of the sync handshake the host's accounting callback fires on: `false`
    /// fires before exec (the usual case), `true` fires after exec has already been issued, in
    /// which case the callback receives no usable pid (see `sync_after_exec` in the container
    /// daemon).
    pub sync_after_exec: bool,

    pub unshare_newns: bool,
    pub unshare_pid: bool,
    pub unshare_net: bool,
    pub unshare_ipc: bool,
    pub unshare_uts: bool,
    pub unshare_user: bool,
    pub unshare_cgroup_at_clone: bool,

    /// Perform `unshare(NEWCGROUP)` right before exec rather than at clone time.
    pub unshare_cgroup_after_sync: bool,

    pub no_new_privs: bool,
    pub drop_caps: bool,
}

impl ExecutionParams {
    /// A minimal, unnamespaced set of parameters suitable for the simplest "apply rlimits and
    /// exec" mode. Callers fill in `argv`/`env`/`files` and opt into isolation features as needed.
    pub fn new(argv: Vec<OsString>, work_dir: PathBuf) -> ExecutionParams {
        ExecutionParams {
            argv,
            env: Vec::new(),
            files: Vec::new(),
            exec_fd: None,
            cgroup_fd: None,
            rlimits: Vec::new(),
            seccomp_filter: None,
            mounts: Vec::new(),
            new_root: None,
            work_dir,
            ctty: false,
            sync_after_exec: false,
            unshare_newns: false,
            unshare_pid: false,
            unshare_net: false,
            unshare_ipc: false,
            unshare_uts: false,
            unshare_user: false,
            unshare_cgroup_at_clone: false,
            unshare_cgroup_after_sync: false,
            no_new_privs: false,
            drop_caps: false,
        }
    }
}

/// The outcome taxonomy every runner converges on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    Normal,
    NonzeroExit,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    DisallowedSyscall,
    Signalled,
    RunnerError,
}

/// The final report produced by any runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecResult {
    pub status: ExecStatus,
    pub exit_status: i32,
    pub time: Duration,
    pub memory: MemorySize,
    pub proc_peak: u32,
    pub setup_time: Duration,
    pub running_time: Duration,
    pub error_message: Option<String>,
}

impl ExecResult {
    pub fn runner_error(msg: impl Into<String>) -> ExecResult {
        ExecResult {
            status: ExecStatus::RunnerError,
            exit_status: -1,
            time: Duration::new(0, 0),
            memory: MemorySize::Bytes(0),
            proc_peak: 0,
            setup_time: Duration::new(0, 0),
            running_time: Duration::new(0, 0),
            error_message: Some(msg.into()),
        }
    }
}

/// Names the exact post-clone step a child failure occurred in, so host-side diagnostics never
/// need to parse a message string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildErrorLocation {
    Clone,
    Mount,
    UidGidMap,
    PivotRoot,
    Hostname,
    Chdir,
    Dup,
    Rlimit,
    Ctty,
    NoNewPrivs,
    DropCaps,
    Sync,
    Seccomp,
    UnshareCgroup,
    Exec,
}

/// The structured failure a child reports over the sync socket when any post-clone step fails.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ChildError {
    pub location: ChildErrorLocation,
    pub step: u32,
    pub errno: i32,
}

impl ChildError {
    pub fn new(location: ChildErrorLocation, step: u32, errno: i32) -> ChildError {
        ChildError { location, step, errno }
    }
}

/// `wait4`-equivalent result, used internally by the container daemon and the ptrace supervisor
/// before they classify it into an [`ExecStatus`].
#[derive(Clone, Copy, Debug)]
pub struct WaitResult {
    pub status: WaitStatus,
    pub user_cpu: Duration,
    pub system_cpu: Duration,
    pub max_rss_kb: u64,
}

/// Classify a `wait4` outcome plus the declared rlimits into an [`ExecStatus`] and a partially
/// filled [`ExecResult`]. Shared by the container daemon and the ptrace supervisor so the two
/// runners agree on what e.g. `SIGXCPU` means. The caller is expected to overwrite `memory` if a
/// more precise accounting-group reading is available, and to upgrade `Normal` to a limit-exceeded
/// status if the measured usage exceeds the declared limit (the accounting group may observe more
/// than the rlimit saw).
pub fn classify_wait(result: &WaitResult, rlimits: &[RLimitSpec]) -> (ExecStatus, i32) {
    match result.status {
        WaitStatus::Exited(_, code) => {
            if code == 0 {
                (ExecStatus::Normal, 0)
            } else {
                (ExecStatus::NonzeroExit, code)
            }
        }
        WaitStatus::Signaled(_, signal, _) => {
            let status = match signal {
                Signal::SIGXCPU | Signal::SIGKILL => ExecStatus::TimeLimitExceeded,
                Signal::SIGXFSZ => ExecStatus::OutputLimitExceeded,
                Signal::SIGSYS => ExecStatus::DisallowedSyscall,
                _ => ExecStatus::Signalled,
            };
            (status, signal as i32)
        }
        _ => (ExecStatus::RunnerError, -1),
    }
    .pipe(|(status, code)| upgrade_for_limits(status, code, result, rlimits))
}

fn upgrade_for_limits(
    status: ExecStatus,
    code: i32,
    result: &WaitResult,
    rlimits: &[RLimitSpec],
) -> (ExecStatus, i32) {
    if status != ExecStatus::Normal {
        return (status, code);
    }

    let cpu_limit = rlimits
        .iter()
        .find(|r| r.resource == Resource::CPUTime)
        .map(|r| r.hard);
    if let Some(limit) = cpu_limit {
        if (result.user_cpu + result.system_cpu).as_secs() >= limit {
            return (ExecStatus::TimeLimitExceeded, code);
        }
    }

    let mem_limit = rlimits
        .iter()
        .find(|r| r.resource == Resource::AddressSpace)
        .map(|r| r.hard);
    if let Some(limit) = mem_limit {
        if result.max_rss_kb * 1024 >= limit {
            return (ExecStatus::MemoryLimitExceeded, code);
        }
    }

    (status, code)
}

/// Trivial pipe-to-closure helper; kept local rather than pulling in a crate for one call site.
trait Pipe: Sized {
    fn pipe<R>(self, f: impl FnOnce(Self) -> R) -> R {
        f(self)
    }
}
impl<T> Pipe for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_size_to_bytes() {
        assert_eq!(2, MemorySize::Bytes(2).bytes());
        assert_eq!(2 * 1024, MemorySize::KiloBytes(2).bytes());
        assert_eq!(2 * 1024 * 1024, MemorySize::MegaBytes(2).bytes());
        assert_eq!(2 * 1024 * 1024 * 1024, MemorySize::GigaBytes(2).bytes());
        assert_eq!(2 * 1024 * 1024 * 1024 * 1024, MemorySize::TeraBytes(2).bytes());
    }

    #[test]
    fn test_classify_normal_exit() {
        let result = WaitResult {
            status: WaitStatus::Exited(nix::unistd::Pid::from_raw(1), 0),
            user_cpu: Duration::from_millis(10),
            system_cpu: Duration::from_millis(1),
            max_rss_kb: 512,
        };
        let (status, code) = classify_wait(&result, &[]);
        assert_eq!(status, ExecStatus::Normal);
        assert_eq!(code, 0);
    }

    #[test]
    fn test_classify_sigxcpu_as_time_limit_exceeded() {
        let result = WaitResult {
            status: WaitStatus::Signaled(nix::unistd::Pid::from_raw(1), Signal::SIGXCPU, false),
            user_cpu: Duration::from_secs(1),
            system_cpu: Duration::from_secs(0),
            max_rss_kb: 512,
        };
        let (status, code) = classify_wait(&result, &[]);
        assert_eq!(status, ExecStatus::TimeLimitExceeded);
        assert_eq!(code, Signal::SIGXCPU as i32);
    }

    #[test]
    fn test_classify_upgrades_normal_when_cpu_usage_exceeds_hard_limit() {
        let result = WaitResult {
            status: WaitStatus::Exited(nix::unistd::Pid::from_raw(1), 0),
            user_cpu: Duration::from_secs(4),
            system_cpu: Duration::from_secs(0),
            max_rss_kb: 512,
        };
        let rlimits = vec![RLimitSpec::new(Resource::CPUTime, 1, 3)];
        let (status, _) = classify_wait(&result, &rlimits);
        assert_eq!(status, ExecStatus::TimeLimitExceeded);
    }
}

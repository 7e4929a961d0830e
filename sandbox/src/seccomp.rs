//! This module contains facilities that relate to the seccomp feature of Linux
//! systems. This module is based on the `seccomp_sys` crate which furthur
//! depends on the `libseccomp` native library.
//!
//! The construction of a filter from a symbolic rule list (`SyscallRule`) is the "black-box
//! compiler" the specification treats as an external collaborator: this module is the
//! documented interface to it, not a reimplementation of a rule language. Everything downstream
//! of `SeccompFilter` (in particular `forkexec`) only ever sees the compiled, opaque result.

use std::error::Error;
use std::fmt::{Display, Formatter};

use seccomp_sys::*;


/// The error type used in `seccomp` module.
#[derive(Clone, Copy, Debug)]
pub struct SeccompError {
    errno: i32
}

impl SeccompError {
    /// Create a new `SeccompError` instance.
    pub fn new(errno: i32) -> Self {
        SeccompError { errno }
    }

    /// Get the error number returned by the underlying `libseccomp` library.
    pub fn errno(&self) -> i32 {
        self.errno
    }
}

impl Display for SeccompError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("seccomp error: {}", self.errno))
    }
}

impl Error for SeccompError {
    // Use default trait implementation here.
}

/// The result type used in `seccomp` module.
pub type Result<T> = std::result::Result<T, SeccompError>;

/// Represent the action to take on specific syscall.
#[derive(Clone, Copy, Debug)]
#[allow(dead_code)]
pub enum Action {
    /// Allow the syscall.
    Allow,

    /// Kill the calling thread immediately.
    KillThread,

    /// Kill the calling process immediately, as though it is killed by the delivery of a `SIGSYS`
    /// signal.
    KillProcess,

    /// Send a `SIGSYS` signal to the calling thread.
    Trap,

    /// The called syscall immediately returns with the specified return value.
    Errno(u32),

    /// Notify any tracing thread with the specified value. Used by the ptrace supervisor (C5):
    /// the filter's default action is `Trace` so every file-bearing syscall reaches the tracer
    /// as a `PTRACE_EVENT_SECCOMP` stop before it runs.
    Trace(u32),
}

impl Action {
    /// Convert the `Action` enum value into native, libseccomp compatible format.
    pub fn as_native(&self) -> u32 {
        match self {
            Action::Allow => SCMP_ACT_ALLOW,
            Action::KillThread => SCMP_ACT_KILL,
            Action::KillProcess => SCMP_ACT_KILL_PROCESS,
            Action::Trap => SCMP_ACT_TRAP,
            Action::Errno(errno) => SCMP_ACT_ERRNO(*errno),
            Action::Trace(sig) => SCMP_ACT_TRACE(*sig)
        }
    }
}

/// A single symbolic `(syscall, action)` rule, as accepted by the external rule-list compiler
/// interface (`SeccompFilter::from_rules`). Resolving a syscall *name* (e.g. `"openat"`) to its
/// platform-specific number, and discovering the default allow/trace lists for known language
/// runtimes, are both out of scope here: callers are expected to hand in resolved syscall
/// numbers, typically produced by that external catalog.
#[derive(Clone, Copy, Debug)]
pub struct SyscallRule {
    pub syscall: i32,
    pub action: Action,
}

impl SyscallRule {
    pub fn new(syscall: i32, action: Action) -> Self {
        SyscallRule { syscall, action }
    }
}

/// An opaque, compiled seccomp filter, ready to be installed on a process with `TSYNC` by
/// `forkexec`. Construction (`from_rules`) is the only place this module talks to libseccomp;
/// everything else treats the filter as a black box.
pub struct SeccompFilter {
    ctx: *mut scmp_filter_ctx,
}

// The underlying `libseccomp` context is only ever touched from the thread that built it and,
// post-fork, from the single-threaded child; it is never shared concurrently, so handing it
// across the fork boundary is safe.
unsafe impl Send for SeccompFilter {}

impl SeccompFilter {
    /// Compile `rules` into a loadable filter, with `default_action` applied to any syscall not
    /// named by a rule. This mirrors the construction the upstream CLI front-end performs from a
    /// symbolic rule catalog — that catalog itself lives outside this crate.
    pub fn from_rules<T>(rules: T, default_action: Action) -> Result<SeccompFilter>
        where T: IntoIterator<Item = SyscallRule>
    {
        let ctx = unsafe { seccomp_init(default_action.as_native()) };
        if ctx.is_null() {
            return Err(SeccompError::new(-1));
        }

        for rule in rules {
            let ret = unsafe {
                seccomp_rule_add_array(ctx, rule.action.as_native(), rule.syscall, 0, std::ptr::null())
            };
            if ret < 0 {
                unsafe { seccomp_release(ctx) };
                return Err(SeccompError::new(ret));
            }
        }

        Ok(SeccompFilter { ctx })
    }

    /// Load this filter onto the calling process/thread with `SECCOMP_FILTER_FLAG_TSYNC`, so that
    /// every thread in the thread group is synchronized onto the same filter. Called from the
    /// child path, after the sync handshake (step 11 of the post-clone sequence): the filter is
    /// installed last because it is typically stricter than anything steps 1-10 need.
    pub fn install_with_tsync(&self) -> Result<()> {
        let ret = unsafe {
            seccomp_attr_set(self.ctx, scmp_filter_attr::SCMP_FLTATR_CTL_TSYNC, 1)
        };
        if ret < 0 {
            return Err(SeccompError::new(ret));
        }

        let ret = unsafe { seccomp_load(self.ctx) };
        if ret < 0 {
            return Err(SeccompError::new(ret));
        }

        Ok(())
    }
}

impl Drop for SeccompFilter {
    fn drop(&mut self) {
        unsafe { seccomp_release(self.ctx) };
    }
}

impl SeccompFilter {
    /// Export this filter as a compiled cBPF program (`libseccomp`'s `seccomp_export_bpf`), so it
    /// can be carried over the wire to a process that has no libseccomp context of its own — the
    /// container protocol transmits bytes, never a live `scmp_filter_ctx`. `libseccomp` only
    /// exports to a file descriptor, so this pipes through one and reads the program back.
    pub fn export_bpf(&self) -> Result<Vec<u8>> {
        let (read_fd, write_fd) = nix::unistd::pipe().map_err(|e| SeccompError::new(e as i32))?;

        let ret = unsafe { seccomp_export_bpf(self.ctx, write_fd) };
        let _ = nix::unistd::close(write_fd);
        if ret < 0 {
            let _ = nix::unistd::close(read_fd);
            return Err(SeccompError::new(ret));
        }

        let mut program = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match nix::unistd::read(read_fd, &mut chunk) {
                Ok(0) => break,
                Ok(n) => program.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        let _ = nix::unistd::close(read_fd);

        Ok(program)
    }
}

/// Install a precompiled cBPF program directly via the `seccomp(2)` syscall, bypassing
/// libseccomp entirely. Used on the no-allocation post-clone child path when the filter arrived
/// as raw bytes over the container wire protocol rather than being compiled in this process: the
/// bytes were already allocated by the daemon before it cloned this child, so reading them here
/// does not violate the no-allocation discipline, only the syscall that installs them runs in the
/// child.
pub fn install_bpf_tsync(bytes: &[u8]) -> Result<()> {
    let prog = libc::sock_fprog {
        len: (bytes.len() / std::mem::size_of::<libc::sock_filter>()) as u16,
        filter: bytes.as_ptr() as *mut libc::sock_filter,
    };

    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            libc::SECCOMP_SET_MODE_FILTER,
            libc::SECCOMP_FILTER_FLAG_TSYNC,
            &prog as *const libc::sock_fprog,
        )
    };

    if ret < 0 {
        Err(SeccompError::new(std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)))
    } else {
        Ok(())
    }
}

/// Apply a list of syscall filters to the calling process without keeping the compiled filter
/// around afterwards. This is the simple "blacklist" mode: kept for the ptrace-free single-shot
/// invocation the CLI wrapper offers for a handful of explicitly banned syscalls, where no
/// `Trace` action is involved.
pub fn apply_syscall_filters<T>(filters: T) -> Result<()>
    where T: IntoIterator<Item = SyscallRule>, {
    let filter = SeccompFilter::from_rules(filters, Action::KillProcess)?;
    filter.install_with_tsync()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_as_native_allow() {
        assert_eq!(Action::Allow.as_native(), SCMP_ACT_ALLOW);
    }

    #[test]
    fn test_syscall_rule_construction() {
        let rule = SyscallRule::new(libc::SYS_openat as i32, Action::Trace(0));
        assert_eq!(rule.syscall, libc::SYS_openat as i32);
    }
}

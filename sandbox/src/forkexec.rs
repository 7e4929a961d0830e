//! The fork/exec primitive (C1): creates a child with a prescribed set of namespaces, fds,
//! rlimits, root, capabilities, and seccomp filter, and hands back its pid after a synchronization
//! handshake.
//!
//! Everything after `clone` and before `execve` in the child runs with no heap allocation, no
//! locking, and no call whose correctness depends on thread-local state the clone may have left
//! inconsistent — only direct syscalls, operating on buffers the parent prepared in advance. This
//! is the same discipline the upstream `pkg/forkexec` package documents for its own child path;
//! Rust does not have a "no_std but still have an allocator available" middle ground as
//! convenient as Go's, so the boundary here is enforced by code review rather than the compiler:
//! every function called between `do_clone` and `execve_child` is written to this rule by hand.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use nix::mount::{mount, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::unistd::{self, ForkResult, Pid};

use crate::misc::set_cloexec;
use crate::mount::Mount;
use crate::rlimits;
use crate::{ChildError, ChildErrorLocation, ExecutionParams};

/// A callback the parent invokes once the child reports it has reached the sync point (step 10),
/// giving the caller a chance to attach the child to an external accounting group before it is
/// released to continue towards `exec`. Returning `Err` aborts the child: it exits without
/// running user code.
///
/// When `params.sync_after_exec` is set, this closure is instead called *after* `execve` has
/// already been issued by the child; in that case `pid` is still meaningful (the child's pid is
/// known from `clone`'s return value regardless of which edge the handshake fires on) but the
/// child may have already exited by the time the callback runs, so the callback must treat the pid
/// as best-effort and must not itself attempt to move it into any cgroup — attachment, if it
/// happens at all, already happened implicitly via `CLONE_INTO_CGROUP` at clone time.
pub type SyncFunc<'a> = dyn FnMut(Pid) -> Result<(), String> + 'a;

/// Result of [`start`]: either the parent-visible pid of a child that successfully reached (and
/// passed) `execve`, or the structured failure the child reported over the sync socket.
pub enum StartOutcome {
    Started(Pid),
    Failed(ChildError),
}

/// Create an isolated child process executing `params.argv[0]`, performing every isolation step
/// described on [`ExecutionParams`] in order, and returning either its pid or a structured
/// [`ChildError`] naming the first step that failed.
pub fn start(params: &ExecutionParams, sync_func: &mut SyncFunc) -> crate::Result<StartOutcome> {
    warn_if_seccomp_absent(params);

    let (parent_sock, child_sock) = socket::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;

    let native_argv = build_cstrings(params.argv.iter().map(|s| s.as_os_str()))?;
    let native_env = build_cstrings(
        params
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .iter()
            .map(std::ffi::OsStr::new),
    )?;
    // argv/envp as NUL-terminated pointer arrays, built once here so the child never needs to
    // allocate a `Vec` of pointers (or anything else) per `exec` attempt.
    let argv_ptrs = build_ptrs(&native_argv);
    let envp_ptrs = build_ptrs(&native_env);

    // uid/gid map contents, preformatted here: the child's uid/gid are identical to the parent's
    // (fork does not change credentials), so there is no need to call `getuid`/`getgid` or format
    // a string after clone.
    let (uid_map, gid_map) = if params.unshare_user {
        let uid = unistd::getuid().as_raw();
        let gid = unistd::getgid().as_raw();
        (format!("0 {} 1\n", uid).into_bytes(), format!("0 {} 1\n", gid).into_bytes())
    } else {
        (Vec::new(), Vec::new())
    };

    let clone_flags = build_clone_flags(params);

    for &fd in params.files.iter().chain(params.exec_fd.iter()).chain(params.cgroup_fd.iter()) {
        set_cloexec(fd, true)?;
    }

    match unsafe { clone(clone_flags, params.cgroup_fd) }? {
        ForkResult::Parent { child } => {
            unistd::close(child_sock)?;
            Ok(run_parent_side(child, parent_sock, params, sync_func))
        }
        ForkResult::Child => {
            // Nothing below this point may allocate, lock, or unwind across an FFI boundary.
            // `child_main` never returns: it either execs or reports an error and exits. Every
            // buffer it touches (argv/envp pointer arrays, uid/gid map text) was built above,
            // before `clone`, in this same address space.
            child_main(
                params,
                &argv_ptrs,
                &envp_ptrs,
                &uid_map,
                &gid_map,
                child_sock,
                parent_sock,
            );
            unreachable!("child_main does not return")
        }
    }
}

/// Warn once per process, regardless of how many executions run without a seccomp filter, rather
/// than once per call — a sandbox with a stuck "unsafe" config would otherwise flood the log.
fn warn_if_seccomp_absent(params: &ExecutionParams) {
    static WARNED: AtomicBool = AtomicBool::new(false);
    if params.seccomp_filter.is_none() && !WARNED.swap(true, Ordering::Relaxed) {
        warn!("running without a seccomp filter; syscalls are unrestricted");
    }
}

/// Build a NUL-terminated array of raw pointers into `values`' backing `CString`s. The returned
/// `Vec` must outlive every use of the pointers it contains; callers build this before `clone` so
/// the child only ever reads it, never allocates it.
fn build_ptrs(values: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = values.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// Raw `clone(2)` via `clone3`, carrying every namespace-unshare bit in `flags` unconditionally,
/// plus `CLONE_INTO_CGROUP` and the cgroup fd argument when `cgroup_fd` is present (kernel >= 5.7,
/// cgroup v2). `nix::sched::clone` does not expose `CLONE_INTO_CGROUP`'s fd argument, so this goes
/// through `libc::syscall` directly, matching how the upstream runner issues a flag-carrying clone
/// regardless of whether a cgroup fd is present. Only falls back to plain `fork()` when there is
/// nothing at all to unshare and no cgroup fd to attach into.
unsafe fn clone(flags: CloneFlags, cgroup_fd: Option<RawFd>) -> crate::Result<ForkResult> {
    if flags.is_empty() && cgroup_fd.is_none() {
        return Ok(nix::unistd::fork()?);
    }

    let mut flags_bits = flags.bits();
    let mut cgroup_arg: u64 = 0;
    if let Some(fd) = cgroup_fd {
        flags_bits |= libc::CLONE_INTO_CGROUP;
        cgroup_arg = fd as u64;
    }

    let pid = libc::syscall(libc::SYS_clone3, &libc::clone_args {
        flags: flags_bits as u64,
        pidfd: 0,
        child_tid: 0,
        parent_tid: 0,
        exit_signal: libc::SIGCHLD as u64,
        stack: 0,
        stack_size: 0,
        tls: 0,
        set_tid: 0,
        set_tid_size: 0,
        cgroup: cgroup_arg,
    } as *const libc::clone_args, std::mem::size_of::<libc::clone_args>());

    if pid < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    if pid == 0 {
        Ok(ForkResult::Child)
    } else {
        Ok(ForkResult::Parent { child: Pid::from_raw(pid as i32) })
    }
}

fn build_clone_flags(params: &ExecutionParams) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    if params.unshare_newns {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    if params.unshare_pid {
        flags |= CloneFlags::CLONE_NEWPID;
    }
    if params.unshare_net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if params.unshare_ipc {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    if params.unshare_uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if params.unshare_user {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    if params.unshare_cgroup_at_clone {
        flags |= CloneFlags::CLONE_NEWCGROUP;
    }
    flags
}

fn build_cstrings<'a>(
    values: impl Iterator<Item = &'a std::ffi::OsStr>,
) -> crate::Result<Vec<CString>> {
    use std::os::unix::ffi::OsStrExt;

    let mut out = Vec::new();
    for value in values {
        let cstring = CString::new(value.as_bytes()).map_err(|_| {
            crate::ErrorKind::InvalidProcessArgument(value.to_string_lossy().into_owned())
        })?;
        out.push(cstring);
    }
    Ok(out)
}

/// Parent side of the handshake: wait for the child's sync byte or its `ChildError`, invoke
/// `sync_func`, and reply.
///
/// When `params.sync_after_exec` is set, the child skips step 10 entirely (see `child_main`) and
/// execs immediately without pausing, so there is no sync byte to wait for and no reply edge to
/// release the child through — `sync_func` is not called here at all in that case. Responsibility
/// for running an equivalent accounting handshake moves up to whoever called `start`, after this
/// function returns `Started`, since by then the child's pid is only meaningful on a best-effort
/// basis (it may already have exited). This mirrors the upstream runner, which passes a `nil`
/// `SyncFunc` into the low-level primitive in this mode and performs its own post-exec handshake
/// one layer up (see `container::daemon::handle_execve`).
fn run_parent_side(
    child: Pid,
    sync_sock: RawFd,
    params: &ExecutionParams,
    sync_func: &mut SyncFunc,
) -> StartOutcome {
    if params.sync_after_exec {
        let _ = unistd::close(sync_sock);
        return StartOutcome::Started(child);
    }

    let mut byte = [0u8; 1];
    match unistd::read(sync_sock, &mut byte) {
        Ok(1) if byte[0] == SYNC_OK => {}
        Ok(1) if byte[0] == SYNC_ERR => {
            // The child's `report_and_die` writes the `ChildError` bytes immediately after the
            // marker byte, on the same socket; read them before closing it.
            let child_error = read_child_error(sync_sock).unwrap_or(ChildError::new(
                ChildErrorLocation::Sync,
                10,
                libc::EIO,
            ));
            debug!("child {} failed before exec: {:?}", child, child_error);
            let _ = unistd::close(sync_sock);
            return StartOutcome::Failed(child_error);
        }
        _ => {
            let _ = unistd::close(sync_sock);
            return StartOutcome::Failed(ChildError::new(ChildErrorLocation::Sync, 10, libc::EIO));
        }
    }

    let reply = match sync_func(child) {
        Ok(()) => SYNC_OK,
        Err(_) => SYNC_ERR,
    };
    let _ = unistd::write(sync_sock, &[reply]);
    let _ = unistd::close(sync_sock);

    if reply == SYNC_ERR {
        return StartOutcome::Failed(ChildError::new(ChildErrorLocation::Sync, 10, libc::ECANCELED));
    }

    StartOutcome::Started(child)
}

/// Read the `size_of::<ChildError>()` bytes `report_and_die` wrote right after the `SYNC_ERR`
/// marker byte, and decode them back into a `ChildError`. A short read or a closed socket (the
/// child died before finishing the write, e.g. `clone` itself partially failed) is reported as
/// `None` rather than panicking; the caller already has a generic fallback for that case.
fn read_child_error(sync_sock: RawFd) -> Option<ChildError> {
    let mut buf = [0u8; std::mem::size_of::<ChildError>()];
    let mut filled = 0;

    while filled < buf.len() {
        match unistd::read(sync_sock, &mut buf[filled..]) {
            Ok(0) => return None,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }

    // `ChildError` is `repr(Rust)` but POD (three `Copy` fields with no padding-sensitive
    // invariants), and `buf` was filled by our own `report_and_die` on the other end of the same
    // socket, so this is exactly the inverse of the `from_raw_parts` write there.
    Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const ChildError) })
}

const SYNC_OK: u8 = 1;
const SYNC_ERR: u8 = 0;

/// Entry point for the child, called immediately after `clone` returns in the new process.
/// Performs the thirteen post-clone steps from the parent-preparation contract in order, reporting
/// the first failure over `sync_sock` and exiting. Never returns.
fn child_main(
    params: &ExecutionParams,
    argv_ptrs: &[*const libc::c_char],
    envp_ptrs: &[*const libc::c_char],
    uid_map: &[u8],
    gid_map: &[u8],
    sync_sock: RawFd,
    parent_sock: RawFd,
) -> ! {
    let _ = unistd::close(parent_sock);

    macro_rules! step {
        ($location:expr, $step:expr, $body:expr) => {
            match $body {
                Ok(v) => v,
                Err(e) => report_and_die(sync_sock, $location, $step, e),
            }
        };
    }

    // 1. uid/gid maps, if a user namespace was requested.
    if params.unshare_user {
        step!(ChildErrorLocation::UidGidMap, 1, write_uid_gid_maps(uid_map, gid_map));
    }

    // 2. pivot_root and the mount plan.
    if let Some(new_root) = &params.new_root {
        step!(
            ChildErrorLocation::PivotRoot,
            2,
            do_pivot_root(new_root, &params.mounts)
        );
    }

    // 3. hostname/domainname, if in a UTS namespace.
    if params.unshare_uts {
        step!(ChildErrorLocation::Hostname, 3, set_hostname());
    }

    // 4. chdir(work_dir).
    step!(
        ChildErrorLocation::Chdir,
        4,
        unistd::chdir(&params.work_dir).map_err(errno_of)
    );

    // 5. duplicate files onto their positional fds; clear cloexec on survivors.
    step!(ChildErrorLocation::Dup, 5, dup_files(&params.files));

    // 6. rlimits.
    step!(
        ChildErrorLocation::Rlimit,
        6,
        rlimits::apply_all(&params.rlimits).map_err(|e| e.raw_os_error().unwrap_or(libc::EINVAL))
    );

    // 7. controlling terminal.
    if params.ctty {
        step!(ChildErrorLocation::Ctty, 7, set_ctty());
    }

    // 8. no_new_privs.
    if params.no_new_privs {
        step!(ChildErrorLocation::NoNewPrivs, 8, set_no_new_privs());
    }

    // 9. drop capabilities.
    if params.drop_caps {
        step!(ChildErrorLocation::DropCaps, 9, drop_all_capabilities());
    }

    // 10. sync handshake.
    if !params.sync_after_exec {
        step!(ChildErrorLocation::Sync, 10, do_sync_handshake(sync_sock));
    }

    // 11. seccomp, installed last because it is typically stricter than steps 1-10 need.
    if let Some(filter) = &params.seccomp_filter {
        step!(ChildErrorLocation::Seccomp, 11, match filter {
            crate::SeccompSource::Compiled(f) => {
                f.install_with_tsync().map_err(|e| e.errno().unsigned_abs() as i32)
            }
            crate::SeccompSource::Bpf(bytes) => {
                crate::seccomp::install_bpf_tsync(bytes).map_err(|e| e.errno().unsigned_abs() as i32)
            }
        });
    }

    // 12. unshare(NEWCGROUP), if deferred to just before exec.
    if params.unshare_cgroup_after_sync {
        step!(ChildErrorLocation::UnshareCgroup, 12, do_unshare_cgroup());
    }

    // 13. exec, with the ETXTBSY retry for fd-based exec.
    step!(ChildErrorLocation::Exec, 13, exec_child(params, argv_ptrs, envp_ptrs));

    unreachable!("exec_child only returns on error, which reports and exits above")
}

fn errno_of<E: std::fmt::Debug>(_e: E) -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

fn report_and_die(sync_sock: RawFd, location: ChildErrorLocation, step: u32, errno: i32) -> ! {
    let error = ChildError::new(location, step, errno);
    let buf = unsafe {
        std::slice::from_raw_parts(
            &error as *const ChildError as *const u8,
            std::mem::size_of::<ChildError>(),
        )
    };
    let _ = unistd::write(sync_sock, &[SYNC_ERR]);
    let _ = unistd::write(sync_sock, buf);
    let _ = unistd::close(sync_sock);
    unsafe { libc::_exit(127) }
}

fn write_uid_gid_maps(uid_map: &[u8], gid_map: &[u8]) -> Result<(), i32> {
    write_proc_self_file(b"/proc/self/setgroups\0", b"deny")?;
    write_proc_self_file(b"/proc/self/uid_map\0", uid_map)?;
    write_proc_self_file(b"/proc/self/gid_map\0", gid_map)?;
    Ok(())
}

/// `path` must be a NUL-terminated byte string literal; passing one avoids a `CString::new`
/// allocation on the no-allocation child path.
fn write_proc_self_file(path: &'static [u8], data: &[u8]) -> Result<(), i32> {
    let fd = unsafe { libc::open(path.as_ptr() as *const libc::c_char, libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL));
    }
    let ret = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    unsafe { libc::close(fd) };
    if ret < 0 {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    } else {
        Ok(())
    }
}

/// Mark `/` private-recursive, bind the new root onto itself, chdir into it, perform every mount
/// in the plan (creating ancestor directories first), then `pivot_root` and lazily unmount the old
/// root.
fn do_pivot_root(new_root: &std::path::Path, plan: &[Mount]) -> Result<(), i32> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(nix_errno)?;

    mount(Some(new_root), new_root, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)
        .map_err(nix_errno)?;

    unistd::chdir(new_root).map_err(nix_errno)?;

    for entry in plan {
        for ancestor in &entry.ancestors {
            let _ = std::fs::create_dir(ancestor);
        }

        let source: Option<&std::path::Path> = if entry.fstype == "none" {
            Some(&entry.source)
        } else {
            None
        };
        let data: Option<&str> = if entry.data.is_empty() { None } else { Some(&entry.data) };

        mount(source, &entry.target, Some(entry.fstype.as_str()), entry.flags, data)
            .map_err(nix_errno)?;

        if entry.readonly_remount {
            mount(
                None::<&str>,
                &entry.target,
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(nix_errno)?;
        }
    }

    let old_root = std::path::Path::new("old_root");
    let _ = std::fs::create_dir(old_root);
    nix::unistd::pivot_root(".", old_root).map_err(nix_errno)?;
    unistd::chdir("/").map_err(nix_errno)?;

    nix::mount::umount2("/old_root", nix::mount::MntFlags::MNT_DETACH).map_err(nix_errno)?;

    Ok(())
}

fn nix_errno(e: nix::Error) -> i32 {
    e as i32
}

fn set_hostname() -> Result<(), i32> {
    unistd::sethostname("sandbox").map_err(nix_errno)
}

fn dup_files(files: &[RawFd]) -> Result<(), i32> {
    for (index, &fd) in files.iter().enumerate() {
        unistd::dup2(fd, index as RawFd).map_err(nix_errno)?;
    }
    for (index, _) in files.iter().enumerate() {
        set_cloexec(index as RawFd, false).map_err(nix_errno)?;
    }
    Ok(())
}

fn set_ctty() -> Result<(), i32> {
    let ret = unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) };
    if ret < 0 {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    } else {
        Ok(())
    }
}

fn set_no_new_privs() -> Result<(), i32> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret < 0 {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    } else {
        Ok(())
    }
}

/// Clear permitted, effective, inheritable, and ambient capability sets, then lock securebits.
/// Hand-rolled against raw `capset(2)`/`prctl(2)` rather than the `caps` crate: this runs on the
/// no-allocation child path, and `caps` builds and iterates a `HashSet` internally.
fn drop_all_capabilities() -> Result<(), i32> {
    let header = libc::cap_user_header_t {
        version: libc::_LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [libc::cap_user_data_t { effective: 0, permissive: 0, inheritable: 0 }; 2];

    let ret = unsafe {
        libc::syscall(libc::SYS_capset, &header as *const _, data.as_ptr())
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL));
    }

    for cap in 0..64 {
        unsafe {
            libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0);
        }
    }

    let ret = unsafe { libc::prctl(libc::PR_SET_SECUREBITS, SECBITS_LOCKED, 0, 0, 0) };
    if ret < 0 {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    } else {
        Ok(())
    }
}

const SECBITS_LOCKED: libc::c_ulong = 0x2f;

fn do_sync_handshake(sync_sock: RawFd) -> Result<(), i32> {
    unistd::write(sync_sock, &[SYNC_OK]).map_err(nix_errno)?;
    let mut byte = [0u8; 1];
    let n = unistd::read(sync_sock, &mut byte).map_err(nix_errno)?;
    if n != 1 || byte[0] != SYNC_OK {
        return Err(libc::ECANCELED);
    }
    Ok(())
}

fn do_unshare_cgroup() -> Result<(), i32> {
    nix::sched::unshare(CloneFlags::CLONE_NEWCGROUP).map_err(nix_errno)
}

/// Exec the child, retrying a bounded number of times on `ETXTBSY` when execing against an fd
/// whose writer has not yet closed it. `argv_ptrs`/`envp_ptrs` are the NUL-terminated pointer
/// arrays `start()` built before `clone`; nothing here allocates.
fn exec_child(
    params: &ExecutionParams,
    argv_ptrs: &[*const libc::c_char],
    envp_ptrs: &[*const libc::c_char],
) -> Result<(), i32> {
    const MAX_ETXTBSY_RETRIES: u32 = 50;

    for attempt in 0..=MAX_ETXTBSY_RETRIES {
        let result = if let Some(exec_fd) = params.exec_fd {
            unsafe {
                libc::syscall(
                    libc::SYS_execveat,
                    exec_fd,
                    b"\0".as_ptr(),
                    argv_ptrs.as_ptr(),
                    envp_ptrs.as_ptr(),
                    libc::AT_EMPTY_PATH,
                )
            }
        } else {
            unsafe { libc::execve(argv_ptrs[0], argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) as i64 }
        };

        if result >= 0 {
            return Ok(());
        }

        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL);
        if errno == libc::ETXTBSY && attempt < MAX_ETXTBSY_RETRIES {
            std::thread::sleep(std::time::Duration::from_millis(1));
            continue;
        }
        return Err(errno);
    }

    Err(libc::ETXTBSY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_clone_flags_selects_requested_namespaces() {
        let mut params = ExecutionParams::new(vec![], PathBuf::from("/"));
        params.unshare_newns = true;
        params.unshare_pid = true;
        let flags = build_clone_flags(&params);
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_build_cstrings_rejects_embedded_nul() {
        let values = vec![std::ffi::OsString::from("abc\0def")];
        let err = build_cstrings(values.iter().map(|s| s.as_os_str()));
        assert!(err.is_err());
    }

    #[test]
    fn test_build_cstrings_accepts_plain_argv() {
        let values = vec![std::ffi::OsString::from("/bin/echo"), std::ffi::OsString::from("hi")];
        let result = build_cstrings(values.iter().map(|s| s.as_os_str())).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].to_str().unwrap(), "/bin/echo");
    }

    #[test]
    fn test_build_ptrs_appends_null_terminator() {
        let values = vec![CString::new("/bin/echo").unwrap(), CString::new("hi").unwrap()];
        let ptrs = build_ptrs(&values);
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
        assert_eq!(unsafe { std::ffi::CStr::from_ptr(ptrs[0]) }.to_str().unwrap(), "/bin/echo");
    }
}

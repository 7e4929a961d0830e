//! This module provide Rust friendly bindings to the native `rlimit` mechanism.
//!
//! `setrlimit` here is a thin wrapper around the raw syscall: it performs no heap allocation and
//! is safe to call from the child path after `fork`, which is the only place most of these
//! resources are ever actually applied (see `forkexec::apply_rlimits`).

use libc::rlimit;
use serde::{Deserialize, Serialize};

/// Represent a resource governed by `setrlimit(2)`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    /// Maximum size of the process's virtual memory (address space). This
    /// variant corresponds to the `RLIMIT_AS` native constant.
    AddressSpace = libc::RLIMIT_AS,

    /// Limit, in seconds, on the amount of CPU time that the process can
    /// consume. This variant corresponds to the `RLIMIT_CPU` native constant.
    CPUTime = libc::RLIMIT_CPU,

    /// Maximum size of the process's stack, in bytes. Corresponds to
    /// `RLIMIT_STACK`.
    Stack = libc::RLIMIT_STACK,

    /// Maximum size of any single file the process may create, in bytes.
    /// Exceeding it delivers `SIGXFSZ`. Corresponds to `RLIMIT_FSIZE`.
    FileSize = libc::RLIMIT_FSIZE,

    /// Maximum number of open file descriptors (one past the highest
    /// allowed fd number). Corresponds to `RLIMIT_NOFILE`.
    NumFiles = libc::RLIMIT_NOFILE,

    /// Maximum size of a core dump file, in bytes. Setting this to zero
    /// disables core dumps. Corresponds to `RLIMIT_CORE`.
    Core = libc::RLIMIT_CORE,
}

/// Specify the soft limit and the hard limit for some resource.
#[derive(Clone, Copy, Debug)]
pub struct ResourceLimit {
    /// The soft limit of the resource.
    pub soft_limit: u64,

    /// The hard limit of the resource.
    pub hard_limit: u64
}

impl ResourceLimit {
    /// Create a `ResourceLimit` with the soft and hard limit both set to `limit`.
    pub fn exact(limit: u64) -> ResourceLimit {
        ResourceLimit { soft_limit: limit, hard_limit: limit }
    }

    /// Convert the `ResourceLimit` structure into native representation.
    fn as_native(&self) -> rlimit {
        rlimit {
            rlim_cur: self.soft_limit,
            rlim_max: self.hard_limit
        }
    }
}

/// Set resource limit for the calling process, using the native `rlimit` mechanism.
pub fn setrlimit(resource: Resource, limit: &ResourceLimit) -> std::io::Result<()> {
    let ret = unsafe { libc::setrlimit(resource as u32, &limit.as_native()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Set resource limit for the calling process. The soft limit and the hard
/// limit are both set to the given `limit` value.
pub fn setrlimit_hard(resource: Resource, limit: u64) -> std::io::Result<()> {
    setrlimit(resource, &ResourceLimit::exact(limit))
}

/// A single `(resource, soft, hard)` triple as supplied by a caller of the sandbox, independent
/// of whether it is ultimately applied via native `rlimit` (ptrace/unshare runners) or merely
/// polled against (container runner, where the daemon also checks usage against these numbers so
/// that a cgroup-observed overrun still classifies correctly).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RLimitSpec {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

impl RLimitSpec {
    pub fn new(resource: Resource, soft: u64, hard: u64) -> RLimitSpec {
        RLimitSpec { resource, soft, hard }
    }

    pub fn exact(resource: Resource, limit: u64) -> RLimitSpec {
        RLimitSpec { resource, soft: limit, hard: limit }
    }

    fn as_resource_limit(&self) -> ResourceLimit {
        ResourceLimit { soft_limit: self.soft, hard_limit: self.hard }
    }
}

/// Apply every rlimit in `specs` to the calling process, in order. Called from the child path
/// after `fork`; every step here is a single raw syscall, no allocation involved.
pub fn apply_all(specs: &[RLimitSpec]) -> std::io::Result<()> {
    for spec in specs {
        setrlimit(spec.resource, &spec.as_resource_limit())?;
    }
    Ok(())
}

/// Build the default rlimit set described in the external interface: CPU (soft = requested, hard
/// = requested + 2s), stack (clamped to at most the memory limit), output file size, a fixed
/// open-file count of 256, and disabled core dumps.
pub fn default_rlimits(
    cpu_time_secs: u64,
    memory_bytes: u64,
    stack_bytes: u64,
    output_bytes: u64,
) -> Vec<RLimitSpec> {
    let stack = stack_bytes.min(memory_bytes);
    vec![
        RLimitSpec::new(Resource::CPUTime, cpu_time_secs, cpu_time_secs + 2),
        RLimitSpec::exact(Resource::AddressSpace, memory_bytes),
        RLimitSpec::exact(Resource::Stack, stack),
        RLimitSpec::exact(Resource::FileSize, output_bytes),
        RLimitSpec::exact(Resource::NumFiles, 256),
        RLimitSpec::exact(Resource::Core, 0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rlimits_clamps_stack_to_memory() {
        let limits = default_rlimits(1, 64 << 20, 256 << 20, 16 << 20);
        let stack = limits.iter().find(|l| l.resource == Resource::Stack).unwrap();
        assert_eq!(stack.soft, 64 << 20);

        let cpu = limits.iter().find(|l| l.resource == Resource::CPUTime).unwrap();
        assert_eq!(cpu.soft, 1);
        assert_eq!(cpu.hard, 3);

        let nofile = limits.iter().find(|l| l.resource == Resource::NumFiles).unwrap();
        assert_eq!(nofile.soft, 256);

        let core = limits.iter().find(|l| l.resource == Resource::Core).unwrap();
        assert_eq!(core.soft, 0);
    }
}

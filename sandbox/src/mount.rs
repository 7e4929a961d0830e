//! Declarative assembly of bind/tmpfs/proc mounts for a sandboxed root filesystem (C6).
//!
//! A `MountBuilder` collects entries in whatever order the caller finds natural, then
//! `filter_not_exist` drops any whose source is absent from the host (so the plan survives a
//! partially-installed toolchain image), and `build` produces the ordered `Vec<Mount>` that
//! `forkexec`'s child path consumes. Every mount's ancestor directories are recorded alongside
//! it so the child can `mkdir` them before calling `mount(2)`, without needing to walk the target
//! path itself (which would mean allocating post-fork).

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

/// A single mount to perform inside the new root, relative to it.
#[derive(Clone, Debug)]
pub struct Mount {
    /// Source path on the host (or staging area), ignored for `tmpfs`/`proc`.
    pub source: PathBuf,

    /// Target path, relative to the new root.
    pub target: PathBuf,

    /// Filesystem type, e.g. `"tmpfs"`, `"proc"`, or `"none"` for a bind mount.
    pub fstype: String,

    /// Raw mount flags.
    pub flags: MsFlags,

    /// Filesystem-specific mount data, e.g. `"size=8m,nr_inodes=4k"`.
    pub data: String,

    /// If true and `source` does not exist on the host, this entry is silently dropped by
    /// `filter_not_exist` instead of failing the build.
    pub ignore_if_source_missing: bool,

    /// Ancestor directories of `target`, shallowest first, that must exist before this mount can
    /// be performed. Computed once at build time so the child never has to walk a path.
    pub ancestors: Vec<PathBuf>,

    /// Whether this bind mount must additionally be remounted read-only (the kernel requires two
    /// syscalls for a read-only bind: `mount(MS_BIND)` then `mount(MS_REMOUNT|MS_BIND|MS_RDONLY)`).
    pub readonly_remount: bool,
}

enum Entry {
    Bind { source: PathBuf, target: PathBuf, readonly: bool, ignore_if_missing: bool },
    Tmpfs { target: PathBuf, data: String },
    Proc { target: PathBuf },
}

impl Entry {
    fn source(&self) -> Option<&Path> {
        match self {
            Entry::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Builder for a sequence of mounts inside a sandboxed root.
pub struct MountBuilder {
    entries: Vec<Entry>,
}

impl MountBuilder {
    pub fn new() -> MountBuilder {
        MountBuilder { entries: Vec::new() }
    }

    /// Bind-mount `source` (an absolute host path) onto `target` (relative to the new root).
    /// `readonly` expands to the two-syscall bind+remount sequence at build time.
    pub fn with_bind<P1, P2>(mut self, source: P1, target: P2, readonly: bool) -> Self
        where P1: AsRef<Path>, P2: AsRef<Path>
    {
        self.entries.push(Entry::Bind {
            source: source.as_ref().to_path_buf(),
            target: target.as_ref().to_path_buf(),
            readonly,
            ignore_if_missing: false,
        });
        self
    }

    /// A tmpfs mount at `target`, with raw `data` options (e.g. `"size=8m,nr_inodes=4k"`).
    pub fn with_tmpfs<P: AsRef<Path>>(mut self, target: P, data: &str) -> Self {
        self.entries.push(Entry::Tmpfs { target: target.as_ref().to_path_buf(), data: data.to_owned() });
        self
    }

    /// A `procfs` mount at `target` (conventionally `"proc"`).
    pub fn with_proc<P: AsRef<Path>>(mut self, target: P) -> Self {
        self.entries.push(Entry::Proc { target: target.as_ref().to_path_buf() });
        self
    }

    /// Mark every bind entry whose source is currently absent on the host as
    /// "ignore if missing", so `build` drops it instead of failing. Call this once all `with_*`
    /// calls are in place and before `build`; it does not touch entries already marked.
    pub fn filter_not_exist(mut self) -> Self {
        for entry in &mut self.entries {
            if let Entry::Bind { source, ignore_if_missing, .. } = entry {
                if !source.exists() {
                    *ignore_if_missing = true;
                }
            }
        }
        self
    }

    /// Produce the ordered mount plan. Entries whose source is marked `ignore_if_missing` and
    /// which are still absent are dropped here (silently — `filter_not_exist` already decided
    /// which ones qualify).
    pub fn build(self) -> Vec<Mount> {
        let mut plan = Vec::with_capacity(self.entries.len());

        for entry in self.entries {
            if let Some(source) = entry.source() {
                if let Entry::Bind { ignore_if_missing: true, .. } = &entry {
                    if !source.exists() {
                        continue;
                    }
                }
            }

            let mount = match entry {
                Entry::Bind { source, target, readonly, .. } => Mount {
                    ancestors: ancestor_dirs(&target),
                    source,
                    fstype: "none".to_owned(),
                    flags: MsFlags::MS_BIND,
                    data: String::new(),
                    ignore_if_source_missing: false,
                    readonly_remount: readonly,
                    target,
                },
                Entry::Tmpfs { target, data } => Mount {
                    ancestors: ancestor_dirs(&target),
                    source: PathBuf::from("none"),
                    fstype: "tmpfs".to_owned(),
                    flags: MsFlags::empty(),
                    data,
                    ignore_if_source_missing: false,
                    readonly_remount: false,
                    target,
                },
                Entry::Proc { target } => Mount {
                    ancestors: ancestor_dirs(&target),
                    source: PathBuf::from("none"),
                    fstype: "proc".to_owned(),
                    flags: MsFlags::empty(),
                    data: String::new(),
                    ignore_if_source_missing: false,
                    readonly_remount: false,
                    target,
                },
            };
            plan.push(mount);
        }

        plan
    }
}

impl Default for MountBuilder {
    fn default() -> MountBuilder {
        MountBuilder::new()
    }
}

/// Every non-empty ancestor of `target` (which is relative), shallowest first, followed by
/// `target` itself. Used so the child can `mkdir -p`-equivalent the mount point without walking
/// the path itself (no allocation needed at mount time; this is precomputed here, in the
/// parent).
fn ancestor_dirs(target: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut current = PathBuf::new();
    let components: Vec<_> = target.components().collect();
    // Every component except the last is an ancestor directory that must exist; the last
    // component is the mount point itself, created the same way by the child before mounting.
    for component in &components {
        current.push(component.as_os_str());
        dirs.push(current.clone());
    }
    dirs
}

/// A standard layout for a language-runtime sandbox root: toolchain directories bound read-only,
/// `/proc`, and tmpfs work/tmp directories. Mirrors the mount plan the upstream CLI front-end
/// assembles for its container and unshare runners; kept here as a convenience constructor since
/// the shape is identical across both runners, only the source paths vary by installed image.
pub fn standard_plan(extra_binds: &[(&Path, &str)]) -> Vec<Mount> {
    let mut builder = MountBuilder::new()
        .with_bind("/bin", "bin", true)
        .with_bind("/lib", "lib", true)
        .with_bind("/lib64", "lib64", true)
        .with_bind("/usr", "usr", true)
        .with_proc("proc")
        .with_bind("/etc/alternatives", "etc/alternatives", true)
        .with_bind("/dev/null", "dev/null", false)
        .with_tmpfs("w", "size=8m,nr_inodes=4k")
        .with_tmpfs("tmp", "size=8m,nr_inodes=4k");

    for (source, target) in extra_binds {
        builder = builder.with_bind(*source, *target, true);
    }

    builder.filter_not_exist().build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestor_dirs() {
        let dirs = ancestor_dirs(Path::new("etc/alternatives"));
        assert_eq!(dirs, vec![PathBuf::from("etc"), PathBuf::from("etc/alternatives")]);
    }

    #[test]
    fn test_filter_not_exist_drops_missing_sources() {
        let staging = tempfile::tempdir().unwrap();
        let missing = staging.path().join("does-not-exist");

        let plan = MountBuilder::new()
            .with_bind(&missing, "nope", true)
            .with_bind(staging.path(), "root", true)
            .filter_not_exist()
            .build();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].target, PathBuf::from("root"));
    }

    #[test]
    fn test_tmpfs_and_proc_entries_carry_no_source_check() {
        let plan = MountBuilder::new()
            .with_tmpfs("w", "size=8m,nr_inodes=4k")
            .with_proc("proc")
            .filter_not_exist()
            .build();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].fstype, "tmpfs");
        assert_eq!(plan[1].fstype, "proc");
    }

    #[test]
    fn test_readonly_bind_recorded_for_two_syscall_remount() {
        let plan = MountBuilder::new()
            .with_bind("/", "root", true)
            .build();
        assert!(plan[0].readonly_remount);
    }
}

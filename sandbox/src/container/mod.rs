//! The container daemon (C3) and its host-side client (C4): a long-lived, already-namespaced
//! process that accepts execution requests over a framed control socket and relays back
//! wait-status and resource usage, as an alternative to driving [`crate::forkexec`] directly under
//! ptrace.

pub mod builder;
pub mod client;
pub mod daemon;

pub use builder::ContainerBuilder;
pub use client::{ContainerClient, ExecuteContext};
pub use daemon::ContainerDaemon;

use std::sync::atomic::{AtomicBool, Ordering};

static DAEMON_ENTERED: AtomicBool = AtomicBool::new(false);

/// The process-wide entry point that turns the current process into a container daemon when a
/// sentinel argument is present, e.g. `sandbox-bin --container-init <staging-dir>`. Must run once,
/// before any other initialization; detects and refuses recursive re-entry rather than silently
/// running twice.
///
/// Callers invoke this at the very top of `main`, before touching argv for any other purpose:
/// if it decides the process is a container daemon, it never returns.
pub fn maybe_enter_daemon_main(args: &[String], config: crate::SandboxConfig) -> crate::Result<()> {
    const SENTINEL: &str = "--container-init";

    if args.first().map(String::as_str) != Some(SENTINEL) {
        return Ok(());
    }

    if DAEMON_ENTERED.swap(true, Ordering::SeqCst) {
        panic!("container daemon entry point invoked twice in the same process");
    }

    daemon::run_from_inherited_socket(config)?;
    std::process::exit(0);
}

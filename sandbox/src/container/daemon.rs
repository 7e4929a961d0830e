//! The container daemon (C3): runs inside an already-namespaced process, drives
//! [`crate::forkexec::start`] per `Execve` request, and relays wait-status/resource-usage back to
//! the host over the control socket.
//!
//! The daemon's command handler and its background reaper communicate only by message passing
//! over three internal queues — never shared mutable state — so the "daemon kills reaper's child,
//! reaper tells daemon the child died" relationship never becomes a shared-state race:
//!
//! * `wait_pid`: the command handler registers a pid it wants reaped.
//! * `wait_pid_result`: the reaper sends back the single outstanding wait result.
//! * `wait_all` / `wait_all_done`: drain barriers used when tearing down (`Kill`) to block the
//!   command handler until every descendant is confirmed gone.

use std::os::unix::io::RawFd;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use log::trace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::WaitPidFlag;
use nix::unistd::{Gid, Pid, Uid};

use crate::forkexec::{self, StartOutcome};
use crate::misc::{timeval_to_duration, wait4_nonblocking};
use crate::protocol::{Command, ContainerSettings, Reply};
use crate::socket::FramedChannel;
use crate::{classify_wait, ExecResult, ExecutionParams, SandboxConfig, WaitResult};

/// Daemon state, per §4.3 of the design: Idle -> Starting -> Running -> Draining -> Idle, with
/// any state able to fall to Dead on a socket error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Starting,
    Running,
    Draining,
    Dead,
}

enum ReaperMsg {
    Watch(Pid),
    DrainAll,
}

enum ReaperReply {
    Result(WaitResult),
    DrainDone,
}

/// The container daemon's command-handling half. Owns the control channel and the settings
/// negotiated by `Conf`; delegates all waiting to a background reaper thread.
pub struct ContainerDaemon {
    state: State,
    settings: ContainerSettings,
    reaper_tx: Sender<ReaperMsg>,
    reaper_rx: Receiver<ReaperReply>,
}

impl ContainerDaemon {
    pub fn new(settings: ContainerSettings) -> ContainerDaemon {
        let (reaper_tx, cmd_rx) = mpsc::channel();
        let (reply_tx, reaper_rx) = mpsc::channel();
        trace!("starting reaper thread...");
        std::thread::spawn(move || reaper_loop(cmd_rx, reply_tx));

        ContainerDaemon { state: State::Idle, settings, reaper_tx, reaper_rx }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Drive the daemon's command loop over `channel` until the channel reports it is done (the
    /// host process exited or the socket broke).
    pub fn run(&mut self, channel: &mut FramedChannel) -> crate::Result<()> {
        loop {
            trace!("daemon waiting for next command, state = {:?}", self.state);
            let received = match channel.recv() {
                Ok(received) => received,
                Err(_) => {
                    self.state = State::Dead;
                    return Ok(());
                }
            };

            let command: Command = rmp_serde::from_slice(&received.payload)
                .map_err(|e| crate::ErrorKind::ProtocolError(e.to_string()))?;

            trace!("daemon received command: {:?}", command);

            match command {
                Command::Ping => self.reply(channel, Reply::Pong)?,
                Command::Conf(settings) => {
                    self.settings = settings;
                    self.reply(channel, Reply::Ok)?;
                }
                Command::Execve(request) => self.handle_execve(channel, request, received.fds)?,
                Command::Kill => self.handle_kill(channel)?,
                Command::Ok => {}
            }
        }
    }

    fn handle_execve(
        &mut self,
        channel: &mut FramedChannel,
        request: crate::protocol::ExecveRequest,
        mut fds: Vec<RawFd>,
    ) -> crate::Result<()> {
        self.state = State::Starting;

        let params = build_execution_params(&request, &mut fds, &self.settings);
        let sync_after_exec = params.sync_after_exec;

        // The actual Starting -> Running pid-exchange: `forkexec::start`'s internal sync
        // handshake (step 10 of the child path) is answered from *here*, over the wire, rather
        // than unconditionally — the host's `ok`/`kill` decides whether the child is released
        // towards `exec` or aborted before it ever gets there. A transport error or an explicit
        // `Kill` both reject the handshake; only `Ok` accepts it.
        //
        // When `sync_after_exec` is set, `forkexec::start` never calls this at all (the child
        // execs immediately with no pre-exec pause), so it is invoked explicitly below, after
        // `start` returns, instead.
        let mut sync_func = |pid: Pid| -> Result<(), String> {
            let encoded = rmp_serde::to_vec(&Reply::Pid(pid.as_raw())).map_err(|e| e.to_string())?;
            channel.send(&encoded, &[]).map_err(|e| e.to_string())?;
            let ack = channel.recv().map_err(|e| e.to_string())?;
            match rmp_serde::from_slice(&ack.payload) {
                Ok(Command::Ok) => Ok(()),
                Ok(Command::Kill) => Err("host sent kill during sync handshake".to_owned()),
                other => Err(format!("unexpected command during sync handshake: {:?}", other)),
            }
        };

        match forkexec::start(&params, &mut sync_func) {
            Ok(StartOutcome::Started(pid)) => {
                if sync_after_exec {
                    // The child may already have exited by now; the pid is passed purely for the
                    // host's bookkeeping (see `ExecutionParams::sync_after_exec`). A rejection
                    // here can no longer stop the child from running user code, so the only
                    // recourse is the same one `handle_kill` uses: kill the whole group and drain.
                    if let Err(reason) = sync_func(pid) {
                        self.state = State::Draining;
                        self.reaper_tx.send(ReaperMsg::DrainAll).ok();
                        let _ = self.reaper_rx.recv();
                        self.state = State::Idle;
                        return self.reply(channel, Reply::Error(reason));
                    }
                }

                trace!("daemon started child pid {}", pid);
                self.state = State::Running;
                self.reaper_tx.send(ReaperMsg::Watch(pid)).ok();
                let wait_result = match self.reaper_rx.recv() {
                    Ok(ReaperReply::Result(r)) => r,
                    _ => {
                        self.state = State::Dead;
                        return self.reply(channel, Reply::Error("reaper channel closed".to_owned()));
                    }
                };

                trace!("daemon reaped pid {}: {:?}", pid, wait_result.status);
                self.state = State::Draining;
                let (status, exit_status) = classify_wait(&wait_result, &params.rlimits);
                let result = ExecResult {
                    status,
                    exit_status,
                    time: wait_result.user_cpu + wait_result.system_cpu,
                    memory: crate::MemorySize::KiloBytes(wait_result.max_rss_kb as usize),
                    proc_peak: 1,
                    setup_time: Duration::from_millis(0),
                    running_time: wait_result.user_cpu + wait_result.system_cpu,
                    error_message: None,
                };

                self.reply(channel, Reply::ExecResult(result))?;
                self.state = State::Idle;
            }
            Ok(StartOutcome::Failed(child_error)) => {
                self.state = State::Idle;
                self.reply(channel, Reply::ExecResult(ExecResult::runner_error(format!(
                    "{:?}", child_error
                ))))?;
            }
            Err(e) => {
                self.state = State::Idle;
                self.reply(channel, Reply::Error(e.to_string()))?;
            }
        }

        Ok(())
    }

    fn handle_kill(&mut self, channel: &mut FramedChannel) -> crate::Result<()> {
        if self.state != State::Running && self.state != State::Starting {
            return self.reply(channel, Reply::Ok);
        }

        self.state = State::Draining;
        self.reaper_tx.send(ReaperMsg::DrainAll).ok();
        let _ = self.reaper_rx.recv();
        self.state = State::Idle;

        self.reply(channel, Reply::Ok)
    }

    fn reply(&mut self, channel: &mut FramedChannel, reply: Reply) -> crate::Result<()> {
        let encoded = rmp_serde::to_vec(&reply)?;
        channel.send(&encoded, &[])
    }
}

fn build_execution_params(
    request: &crate::protocol::ExecveRequest,
    fds: &mut Vec<RawFd>,
    settings: &ContainerSettings,
) -> ExecutionParams {
    let mut idx = 0;
    let exec_fd = if request.has_exec_fd {
        let fd = fds[idx];
        idx += 1;
        Some(fd)
    } else {
        None
    };
    let cgroup_fd = if request.has_cgroup_fd {
        let fd = fds[idx];
        idx += 1;
        Some(fd)
    } else {
        None
    };
    let files = fds.split_off(idx);

    let mut env = request.env.clone();
    if env.is_empty() {
        env = settings.default_env.clone();
    }

    let mut params = ExecutionParams::new(
        request.argv.iter().map(std::ffi::OsString::from).collect(),
        std::path::PathBuf::from(&request.work_dir),
    );
    params.env = env;
    params.files = files;
    params.exec_fd = exec_fd;
    params.cgroup_fd = cgroup_fd;
    params.rlimits = request.rlimits.clone();
    params.ctty = request.ctty;
    params.sync_after_exec = request.sync_after_exec;
    params.unshare_cgroup_after_sync = settings.unshare_cgroup;
    params.seccomp_filter = request.seccomp_bpf.clone().map(crate::SeccompSource::Bpf);
    // Every container-mode execution runs under these regardless of what the client asked for:
    // a client that can reach the daemon's socket already has enough access that skipping these
    // would make container mode weaker than the ptrace and unsafe runners, not an alternative to
    // them.
    params.no_new_privs = true;
    params.drop_caps = true;
    params
}

/// Background reaper: owns all `waitpid` calls so the command handler never blocks on one
/// directly. Mirrors the polling `WaitPidGuard` loop the older single-process daemon used, but
/// driven by messages instead of a context struct shared across threads.
fn reaper_loop(cmd_rx: Receiver<ReaperMsg>, reply_tx: Sender<ReaperReply>) {
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    while let Ok(msg) = cmd_rx.recv() {
        match msg {
            ReaperMsg::Watch(pid) => loop {
                trace!("reaper calling wait4 on {}", pid);
                match wait4_nonblocking(pid, WaitPidFlag::empty()) {
                    Ok(None) => std::thread::sleep(POLL_INTERVAL),
                    // `rusage` is only meaningful once the child has actually terminated; by the
                    // time it has, `/proc/[pid]` is already gone, so this is read straight out of
                    // the same `wait4(2)` call that reaped it rather than from procfs afterwards.
                    Ok(Some((status, rusage))) => {
                        trace!(
                            "reaper got wait status {:?}, rusage maxrss {} KiB",
                            status, rusage.ru_maxrss
                        );
                        let _ = reply_tx.send(ReaperReply::Result(WaitResult {
                            status,
                            user_cpu: timeval_to_duration(rusage.ru_utime),
                            system_cpu: timeval_to_duration(rusage.ru_stime),
                            max_rss_kb: rusage.ru_maxrss.max(0) as u64,
                        }));
                        break;
                    }
                    Err(_) => {
                        let _ = reply_tx.send(ReaperReply::Result(WaitResult {
                            status: nix::sys::wait::WaitStatus::Exited(pid, -1),
                            user_cpu: Duration::from_secs(0),
                            system_cpu: Duration::from_secs(0),
                            max_rss_kb: 0,
                        }));
                        break;
                    }
                }
            },
            ReaperMsg::DrainAll => {
                let _ = signal::kill(Pid::from_raw(-1), Signal::SIGKILL);
                // Keep reaping until `wait4` reports `ECHILD` (no descendants left), rather than
                // a fixed number of polls or a status check that can never observe "no children".
                loop {
                    match wait4_nonblocking(Pid::from_raw(-1), WaitPidFlag::empty()) {
                        Ok(Some(_)) => continue,
                        Ok(None) => std::thread::sleep(POLL_INTERVAL),
                        Err(_) => break,
                    }
                }
                let _ = reply_tx.send(ReaperReply::DrainDone);
            }
        }
    }
}

/// Entry point used by `container::maybe_enter_daemon_main`: the control socket fd is inherited
/// (conventionally fd 3, the first fd past stdio) rather than passed as a CLI argument, since a
/// raw fd number is not meaningfully nameable on a command line across re-exec.
pub fn run_from_inherited_socket(config: SandboxConfig) -> crate::Result<()> {
    const INHERITED_FD: RawFd = 3;

    // Drop to the configured uid/gid once, before serving any request: this governs the daemon
    // process itself, not the children it forks per `Execve` (those get their own uid/gid from
    // the user namespace set up at clone time). gid first, since dropping uid first would strip
    // the privilege needed to still change gid.
    if let Some(gid) = config.daemon_gid {
        nix::unistd::setgid(Gid::from_raw(gid))?;
    }
    if let Some(uid) = config.daemon_uid {
        nix::unistd::setuid(Uid::from_raw(uid))?;
    }

    let mut channel = FramedChannel::new(INHERITED_FD);
    let mut daemon = ContainerDaemon::new(ContainerSettings {
        uid: config.daemon_uid,
        gid: config.daemon_gid,
        unshare_cgroup: config.unshare_cgroup,
        default_env: config.default_env,
    });
    daemon.run(&mut channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_execution_params_splits_fds_in_fixed_order() {
        let request = crate::protocol::ExecveRequest {
            argv: vec!["/bin/echo".to_owned()],
            env: vec![],
            file_count: 3,
            has_exec_fd: true,
            has_cgroup_fd: true,
            rlimits: vec![],
            work_dir: "/".to_owned(),
            ctty: false,
            sync_after_exec: false,
            seccomp_bpf: Some(vec![9, 9, 9]),
        };
        let mut fds = vec![10, 11, 0, 1, 2];
        let settings = ContainerSettings {
            uid: None,
            gid: None,
            unshare_cgroup: false,
            default_env: vec![],
        };

        let params = build_execution_params(&request, &mut fds, &settings);
        assert_eq!(params.exec_fd, Some(10));
        assert_eq!(params.cgroup_fd, Some(11));
        assert_eq!(params.files, vec![0, 1, 2]);
        assert!(params.no_new_privs);
        assert!(params.drop_caps);
        assert!(matches!(params.seccomp_filter, Some(crate::SeccompSource::Bpf(ref b)) if b == &[9, 9, 9]));
    }
}

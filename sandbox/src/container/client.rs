//! The container client (C4): the host-process peer of the container daemon (C3). Exposes a
//! single `execute` operation and implements timeout/cancel by sending `kill` over the control
//! socket.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::protocol::{Command, ExecveRequest, Reply};
use crate::socket::FramedChannel;
use crate::{ExecResult, ExecutionParams};

/// Context for a single `execute` call: an optional deadline and an externally-owned cancellation
/// flag (e.g. a channel the caller selects on in its own runtime). This crate does not assume any
/// particular async runtime, so cancellation is polled at the points `execute` would otherwise
/// block anyway.
pub struct ExecuteContext {
    pub deadline: Option<Instant>,

    /// Called with the started child's pid once the daemon's pid-carrying reply arrives. Returning
    /// `Err` rejects the handshake: `execute` sends `Kill` instead of `Ok`, which the daemon's own
    /// sync handshake (run inside `forkexec::start`, see `daemon::handle_execve`) surfaces as a
    /// `ChildError` before the child ever reaches `exec` — the container-mode equivalent of the
    /// ptrace/unsafe runners' `sync_func` rejecting a direct `forkexec::start` call.
    pub sync_func: Box<dyn FnMut(crate::Pid) -> Result<(), String> + Send>,
}

impl ExecuteContext {
    pub fn with_deadline(deadline: Instant) -> ExecuteContext {
        ExecuteContext { deadline: Some(deadline), sync_func: Box::new(|_| Ok(())) }
    }

    pub fn unbounded() -> ExecuteContext {
        ExecuteContext { deadline: None, sync_func: Box::new(|_| Ok(())) }
    }
}

/// Owns the host end of the framed control socket connected to a container daemon.
pub struct ContainerClient {
    channel: FramedChannel,
}

impl ContainerClient {
    pub fn new(fd: RawFd) -> ContainerClient {
        ContainerClient { channel: FramedChannel::new(fd) }
    }

    pub fn ping(&mut self) -> crate::Result<()> {
        self.send(Command::Ping)?;
        match self.recv_reply()? {
            Reply::Pong => Ok(()),
            other => Err(crate::ErrorKind::ProtocolError(format!("unexpected reply to ping: {:?}", other)).into()),
        }
    }

    /// Run `params` to completion inside the container, honoring `ctx`'s deadline by sending
    /// `kill` if it elapses before the daemon's terminal reply arrives.
    pub fn execute(&mut self, params: &ExecutionParams, mut ctx: ExecuteContext) -> crate::Result<ExecResult> {
        let start = Instant::now();

        let request = to_execve_request(params)?;
        let mut fds: Vec<RawFd> = Vec::new();
        fds.extend(params.exec_fd);
        fds.extend(params.cgroup_fd);
        fds.extend(params.files.iter().copied());

        let encoded = rmp_serde::to_vec(&Command::Execve(request))?;
        let send_result = self.channel.send(&encoded, &fds);
        // Every passed fd is single-writer: once handed to the daemon as ancillary data, this
        // side has no further use for it, so close it here regardless of whether the send itself
        // succeeded.
        for fd in &fds {
            let _ = nix::unistd::close(*fd);
        }
        send_result?;

        let first_reply_time;
        match self.recv_reply()? {
            Reply::Pid(pid) => {
                first_reply_time = Instant::now();
                match (ctx.sync_func)(pid) {
                    Ok(()) => self.send(Command::Ok)?,
                    Err(_) => self.send(Command::Kill)?,
                }
            }
            Reply::Error(msg) => return Ok(ExecResult::runner_error(msg)),
            Reply::ExecResult(mut result) => {
                result.setup_time = Instant::now() - start;
                return Ok(result);
            }
            other => {
                return Err(crate::ErrorKind::ProtocolError(format!("unexpected reply to execve: {:?}", other)).into())
            }
        }

        loop {
            if let Some(deadline) = ctx.deadline {
                if Instant::now() >= deadline {
                    self.send(Command::Kill)?;
                }
            }

            match self.recv_reply()? {
                Reply::ExecResult(mut result) => {
                    self.send(Command::Ok)?;
                    let now = Instant::now();
                    result.setup_time = first_reply_time - start;
                    result.running_time = now - first_reply_time;
                    return Ok(result);
                }
                Reply::Error(msg) => return Ok(ExecResult::runner_error(msg)),
                Reply::Ok => continue,
                other => {
                    return Err(crate::ErrorKind::ProtocolError(format!(
                        "unexpected reply while waiting for result: {:?}",
                        other
                    ))
                    .into())
                }
            }
        }
    }

    fn send(&mut self, command: Command) -> crate::Result<()> {
        let encoded = rmp_serde::to_vec(&command)?;
        self.channel.send(&encoded, &[])
    }

    fn recv_reply(&mut self) -> crate::Result<Reply> {
        let received = self.channel.recv()?;
        rmp_serde::from_slice(&received.payload).map_err(|e| crate::ErrorKind::ProtocolError(e.to_string()).into())
    }
}

fn to_execve_request(params: &ExecutionParams) -> crate::Result<ExecveRequest> {
    let seccomp_bpf = match &params.seccomp_filter {
        None => None,
        Some(crate::SeccompSource::Bpf(bytes)) => Some(bytes.clone()),
        Some(crate::SeccompSource::Compiled(filter)) => Some(filter.export_bpf()?),
    };

    Ok(ExecveRequest {
        argv: params.argv.iter().map(|s| s.to_string_lossy().into_owned()).collect(),
        env: params.env.clone(),
        file_count: params.files.len() as u32,
        has_exec_fd: params.exec_fd.is_some(),
        has_cgroup_fd: params.cgroup_fd.is_some(),
        rlimits: params.rlimits.clone(),
        work_dir: params.work_dir.to_string_lossy().into_owned(),
        ctty: params.ctty,
        sync_after_exec: params.sync_after_exec,
        seccomp_bpf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_to_execve_request_preserves_fd_presence_flags() {
        let mut params = ExecutionParams::new(vec!["/bin/echo".into()], PathBuf::from("/"));
        params.exec_fd = Some(7);
        let request = to_execve_request(&params).unwrap();
        assert!(request.has_exec_fd);
        assert!(!request.has_cgroup_fd);
        assert!(request.seccomp_bpf.is_none());
        assert_eq!(request.argv, vec!["/bin/echo".to_owned()]);
    }
}

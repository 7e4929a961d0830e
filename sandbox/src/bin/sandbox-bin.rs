//! Thin CLI wrapper around the sandbox library, exercising the core from a terminal. It
//! intentionally stays thin: no database, no submission queue, no per-language policy catalog —
//! those remain extension points for whatever front-end embeds this crate.

#[macro_use]
extern crate error_chain;
extern crate clap;
extern crate sandbox;

use std::ffi::OsString;
use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use error_chain::ChainedError;

use sandbox::{ExecResult, ExecStatus, ExecutionParams};

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandbox(sandbox::Error, sandbox::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
    }
}

#[derive(Parser, Debug)]
#[command(name = "sandbox-bin", version, about = "Run a program inside the sandbox execution engine")]
struct Cli {
    /// CPU time limit, in milliseconds.
    #[arg(short = 't', long = "cpu", value_name = "MS")]
    cpu_time_limit_ms: Option<u64>,

    /// Memory limit, in megabytes.
    #[arg(short = 'm', long = "mem", value_name = "MB")]
    memory_limit_mb: Option<u64>,

    /// Output (written file) size limit, in megabytes.
    #[arg(long = "output", value_name = "MB", default_value_t = 64)]
    output_limit_mb: u64,

    /// Path to redirect the child's stdin from.
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input_file: Option<PathBuf>,

    /// Path to redirect the child's stdout to.
    #[arg(short = 'o', long = "output-file", value_name = "FILE")]
    output_file: Option<PathBuf>,

    /// Path to redirect the child's stderr to.
    #[arg(short = 'e', long = "error", value_name = "FILE")]
    error_file: Option<PathBuf>,

    /// Environment variables passed to the child, as `KEY=VALUE`.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    envs: Vec<String>,

    /// Which supervision strategy to use.
    #[arg(long = "runner", value_enum, default_value_t = RunnerKind::Unsafe)]
    runner: RunnerKind,

    /// The program to run, followed by its arguments.
    #[arg(required = true, trailing_var_arg = true)]
    program: Vec<String>,
}

/// Which supervision strategy runs the program.
#[derive(Clone, Copy, Debug, clap::ValueEnum, PartialEq, Eq)]
enum RunnerKind {
    /// Drive the fork/exec primitive directly with no syscall tracing or extra namespace.
    Unsafe,
    /// Attach a ptrace supervisor that arbitrates filesystem syscalls by path.
    Ptrace,
    /// Hand the request to a container daemon over the framed control socket.
    Container,
}

fn build_params(cli: &Cli) -> Result<ExecutionParams> {
    let argv: Vec<OsString> = cli.program.iter().map(OsString::from).collect();
    let work_dir = std::env::current_dir()?;
    let mut params = ExecutionParams::new(argv, work_dir);

    for entry in &cli.envs {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::from(format!("invalid environment variable: {}", entry)))?;
        params.env.push((name.to_owned(), value.to_owned()));
    }

    let stdin = match &cli.input_file {
        Some(path) => std::fs::File::open(path)?.into_raw_fd(),
        None => libc::STDIN_FILENO,
    };
    let stdout = match &cli.output_file {
        Some(path) => std::fs::File::create(path)?.into_raw_fd(),
        None => libc::STDOUT_FILENO,
    };
    let stderr = match &cli.error_file {
        Some(path) => std::fs::File::create(path)?.into_raw_fd(),
        None => libc::STDERR_FILENO,
    };
    params.files = vec![stdin, stdout, stderr];

    let cpu_secs = cli.cpu_time_limit_ms.map(|ms| (ms + 999) / 1000).unwrap_or(10);
    let memory_bytes = cli.memory_limit_mb.map(|mb| mb << 20).unwrap_or(256 << 20);
    let output_bytes = cli.output_limit_mb << 20;
    params.rlimits = sandbox::default_rlimits(cpu_secs, memory_bytes, memory_bytes.min(64 << 20), output_bytes);

    params.no_new_privs = true;

    Ok(params)
}

fn run(cli: &Cli, params: ExecutionParams) -> Result<ExecResult> {
    let deadline = cli.cpu_time_limit_ms.map(|ms| Instant::now() + Duration::from_millis(ms) * 4);

    match cli.runner {
        RunnerKind::Unsafe => {
            let mut sync_func = |_pid: nix::unistd::Pid| Ok(());
            match sandbox::forkexec::start(&params, &mut sync_func)? {
                sandbox::forkexec::StartOutcome::Started(pid) => {
                    let mut status: libc::c_int = 0;
                    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
                    let reaped = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut rusage) };
                    if reaped < 0 {
                        return Err(sandbox::Error::from(std::io::Error::last_os_error()).into());
                    }
                    let wait_status = nix::sys::wait::WaitStatus::from_raw(pid, status)
                        .map_err(sandbox::Error::from)?;

                    let user_cpu = Duration::new(rusage.ru_utime.tv_sec.max(0) as u64, (rusage.ru_utime.tv_usec.max(0) as u32) * 1000);
                    let system_cpu = Duration::new(rusage.ru_stime.tv_sec.max(0) as u64, (rusage.ru_stime.tv_usec.max(0) as u32) * 1000);
                    let max_rss_kb = rusage.ru_maxrss.max(0) as u64;

                    let wait_result = sandbox::WaitResult { status: wait_status, user_cpu, system_cpu, max_rss_kb };
                    let (exec_status, exit_status) = sandbox::classify_wait(&wait_result, &params.rlimits);
                    let time = user_cpu + system_cpu;
                    Ok(ExecResult {
                        status: exec_status,
                        exit_status,
                        time,
                        memory: sandbox::MemorySize::KiloBytes(max_rss_kb as usize),
                        proc_peak: 1,
                        setup_time: Duration::from_secs(0),
                        running_time: time,
                        error_message: None,
                    })
                }
                sandbox::forkexec::StartOutcome::Failed(child_error) => {
                    Ok(ExecResult::runner_error(format!("{:?}", child_error)))
                }
            }
        }
        RunnerKind::Ptrace => {
            struct AllowAll;
            impl sandbox::ptrace::Handler for AllowAll {
                fn check_read(&mut self, _path: &std::path::Path) -> sandbox::ptrace::Verdict {
                    sandbox::ptrace::Verdict::Allow
                }
                fn check_write(&mut self, _path: &std::path::Path) -> sandbox::ptrace::Verdict {
                    sandbox::ptrace::Verdict::Allow
                }
                fn check_stat(&mut self, _path: &std::path::Path) -> sandbox::ptrace::Verdict {
                    sandbox::ptrace::Verdict::Allow
                }
                fn check_syscall(&mut self, _syscall: i64) -> sandbox::ptrace::Verdict {
                    sandbox::ptrace::Verdict::Allow
                }
            }

            let ctx = sandbox::ptrace::TraceContext { deadline };
            Ok(sandbox::ptrace::trace(&params, &mut AllowAll, &ctx)?)
        }
        RunnerKind::Container => {
            let mut client =
                sandbox::container::ContainerBuilder::new(sandbox::SandboxConfig::default()).build()?;
            let ctx = match deadline {
                Some(d) => sandbox::container::ExecuteContext::with_deadline(d),
                None => sandbox::container::ExecuteContext::unbounded(),
            };
            Ok(client.execute(&params, ctx)?)
        }
    }
}

fn do_main() -> Result<ExecResult> {
    let cli = Cli::parse();
    let params = build_params(&cli)?;
    run(&cli, params)
}

/// Emit the exit-time report line: `<status_code> <time_ms> <memory_kb> <exit_status>`.
fn status_code(status: ExecStatus) -> u32 {
    match status {
        ExecStatus::Normal => 0,
        ExecStatus::NonzeroExit => 1,
        ExecStatus::TimeLimitExceeded => 2,
        ExecStatus::MemoryLimitExceeded => 3,
        ExecStatus::OutputLimitExceeded => 4,
        ExecStatus::DisallowedSyscall => 5,
        ExecStatus::Signalled => 6,
        ExecStatus::RunnerError => 7,
    }
}

fn main() {
    stderrlog::new().verbosity(2).init().ok();

    // Must run before anything else touches argv: if this process was re-exec'd as a container
    // daemon (`sandbox::container::ContainerBuilder::build` does this), it never returns.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = sandbox::container::maybe_enter_daemon_main(&args, sandbox::SandboxConfig::default()) {
        eprintln!("container daemon exited with error: {}", e);
        std::process::exit(1);
    }

    match do_main() {
        Ok(result) => {
            println!(
                "{} {} {} {}",
                status_code(result.status),
                result.time.as_millis(),
                result.memory.bytes() / 1024,
                result.exit_status
            );
            if result.status == ExecStatus::RunnerError {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("error: {}", e.display_chain());
            println!("{} 0 0 -1", status_code(ExecStatus::RunnerError));
            std::process::exit(1);
        }
    }
}

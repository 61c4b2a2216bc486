//! Blocking executor: spawn, feed, drain, and reap a child without an async
//! runtime. Timeouts and buffer ceilings are enforced by a polling reap loop
//! with signal escalation.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use derive_builder::Builder;
use tracing::{debug, warn};

use procmux_core::{
    KillSignal, ProcessSpec, ProcmuxError, ResolvedSpec, Result, Shell, SpawnError,
    StdioDescriptor, StdioSpec, normalize, signals,
};

use crate::collect::DEFAULT_MAX_BUFFER;
use crate::factory::platform_launcher;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Grace period after the configured signal before escalating to a hard kill.
const KILL_ESCALATION: Duration = Duration::from_millis(200);

/// Options for the blocking runners.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option))]
pub struct SyncOptions {
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,

    #[builder(default)]
    pub working_directory: Option<PathBuf>,

    /// Bytes written to the child's stdin before it is closed.
    #[builder(default)]
    pub input: Option<Vec<u8>>,

    #[builder(default)]
    pub timeout: Option<Duration>,

    /// Per-stream ceiling in bytes. `None` disables the limit.
    #[builder(default = "Some(DEFAULT_MAX_BUFFER)")]
    pub max_buffer: Option<usize>,

    #[builder(default)]
    pub kill_signal: KillSignal,

    /// Shell override for `exec_sync`; ignored by `exec_file_sync`.
    #[builder(default)]
    pub shell: Option<String>,

    /// Stdio override for the exec-family runners. Leaving it unset pipes
    /// all three streams and mirrors collected stderr to the parent's.
    #[builder(default)]
    pub stdio: Option<StdioSpec>,
}

impl SyncOptions {
    pub fn builder() -> SyncOptionsBuilder {
        SyncOptionsBuilder::default()
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            working_directory: None,
            input: None,
            timeout: None,
            max_buffer: Some(DEFAULT_MAX_BUFFER),
            kill_signal: KillSignal::default(),
            shell: None,
            stdio: None,
        }
    }
}

impl SyncOptionsBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

/// Complete result of a blocking run. Failures that occur after the spawn are
/// reported in `error` rather than raised, so partial output stays available.
#[derive(Debug)]
pub struct SyncOutput {
    pub pid: Option<u32>,
    pub status: Option<i32>,
    pub signal: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<ProcmuxError>,
    pub exited_due_to_timeout: bool,
    pub exited_due_to_max_buffer: bool,
}

/// Run a spawn request to completion on the calling thread.
pub fn spawn_sync(spec: &ProcessSpec, options: &SyncOptions) -> Result<SyncOutput> {
    let resolved = normalize(spec)?;
    if resolved.stdio.contains(&StdioDescriptor::Ipc) {
        return Err(ProcmuxError::validation(
            "ipc is not supported by the blocking executor",
        ));
    }
    // An unknown kill signal is a pre-launch error here; there is no event
    // channel to report it through later.
    let kill_signo = signals::resolve(&options.kill_signal)?;
    let timeout = options.timeout.or(spec.timeout);
    run_blocking(resolved, options, timeout, kill_signo)
}

/// Run a command line through the shell; returns collected stdout or raises
/// on any failure, embedding collected stderr in the error.
pub fn exec_sync(command: &str, options: &SyncOptions) -> Result<Vec<u8>> {
    let mut spec = ProcessSpec::new(command);
    spec.shell = match &options.shell {
        Some(program) => Shell::Program(program.clone()),
        None => Shell::Default,
    };
    finish_exec(command.to_string(), spec, options)
}

/// Run an executable directly (no shell) under `exec_sync` semantics.
pub fn exec_file_sync(
    program: &str,
    args: &[impl AsRef<str>],
    options: &SyncOptions,
) -> Result<Vec<u8>> {
    let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
    let command_line = std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    let mut spec = ProcessSpec::new(program);
    spec.args = args;
    finish_exec(command_line, spec, options)
}

fn finish_exec(command: String, mut spec: ProcessSpec, options: &SyncOptions) -> Result<Vec<u8>> {
    let mirror_stderr = options.stdio.is_none();
    spec.env = options.env.clone();
    spec.working_directory = options.working_directory.clone();
    spec.kill_signal = options.kill_signal.clone();
    if let Some(stdio) = &options.stdio {
        spec.stdio = stdio.clone();
    }

    let output = spawn_sync(&spec, options)?;
    if mirror_stderr && !output.stderr.is_empty() {
        let _ = std::io::stderr().write_all(&output.stderr);
    }
    if let Some(error) = output.error {
        return Err(error);
    }
    if output.status != Some(0) || output.signal.is_some() {
        return Err(ProcmuxError::CommandFailed {
            command,
            code: output.status,
            signal: output.signal,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output.stdout)
}

fn run_blocking(
    resolved: ResolvedSpec,
    options: &SyncOptions,
    timeout: Option<Duration>,
    kill_signo: i32,
) -> Result<SyncOutput> {
    let mut cmd = std::process::Command::new(&resolved.program);
    cmd.args(&resolved.args);
    for (key, value) in &resolved.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &resolved.working_directory {
        cmd.current_dir(dir);
    }
    apply_platform(&mut cmd, &resolved);
    apply_stdio(&mut cmd, &resolved)?;

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return Ok(SyncOutput {
                pid: None,
                status: None,
                signal: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
                error: Some(SpawnError::from_io("spawn", err).into()),
                exited_due_to_timeout: false,
                exited_due_to_max_buffer: false,
            });
        }
    };
    let pid = child.id();
    debug!(pid = %pid, program = %resolved.program, "blocking run started");

    // Stdin is fed from its own thread so an input larger than the pipe
    // capacity cannot deadlock against the child's unfilled output pipes.
    // The thread drops the handle afterwards, closing the pipe so children
    // reading to EOF can finish.
    let input_thread = child.stdin.take().map(|mut stdin| {
        let input = options.input.clone().unwrap_or_default();
        std::thread::spawn(move || {
            let _ = stdin.write_all(&input);
        })
    });

    let stdout_overflow = Arc::new(AtomicBool::new(false));
    let stderr_overflow = Arc::new(AtomicBool::new(false));
    let stdout_thread = child
        .stdout
        .take()
        .map(|s| reader_thread(s, options.max_buffer, stdout_overflow.clone()));
    let stderr_thread = child
        .stderr
        .take()
        .map(|s| reader_thread(s, options.max_buffer, stderr_overflow.clone()));

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    let mut buffer_hit = false;
    let mut killed_at: Option<Instant> = None;
    let mut wait_error = None;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(err) => {
                wait_error = Some(ProcmuxError::Io(err));
                break None;
            }
        }
        let overflowed =
            stdout_overflow.load(Ordering::SeqCst) || stderr_overflow.load(Ordering::SeqCst);
        if killed_at.is_none() && overflowed {
            buffer_hit = true;
            deliver_kill(&mut child, pid, kill_signo);
            killed_at = Some(Instant::now());
        }
        if killed_at.is_none() && deadline.is_some_and(|d| Instant::now() >= d) {
            timed_out = true;
            deliver_kill(&mut child, pid, kill_signo);
            killed_at = Some(Instant::now());
        }
        if killed_at.is_some_and(|at| at.elapsed() >= KILL_ESCALATION) {
            warn!(pid = %pid, "child survived kill signal, escalating");
            let _ = child.kill();
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    // The child is gone, so any blocked stdin write fails and the feeder
    // thread finishes promptly.
    if let Some(handle) = input_thread {
        let _ = handle.join();
    }
    let (stdout, _) = join_reader(stdout_thread);
    let (stderr, _) = join_reader(stderr_thread);

    let (code, signal) = status.map_or((None, None), split_status);
    let error = wait_error.or(if timed_out {
        Some(ProcmuxError::Timeout {
            millis: timeout.map_or(0, |t| t.as_millis() as u64),
        })
    } else if buffer_hit {
        let stream = if stdout_overflow.load(Ordering::SeqCst) {
            "stdout"
        } else {
            "stderr"
        };
        Some(ProcmuxError::BufferLimit { stream })
    } else {
        None
    });

    Ok(SyncOutput {
        pid: Some(pid),
        status: code,
        signal,
        stdout,
        stderr,
        error,
        exited_due_to_timeout: timed_out,
        exited_due_to_max_buffer: buffer_hit,
    })
}

#[cfg(unix)]
fn apply_platform(cmd: &mut std::process::Command, resolved: &ResolvedSpec) {
    use std::os::unix::process::CommandExt;

    cmd.arg0(&resolved.argv0);
    if let Some(uid) = resolved.uid {
        cmd.uid(uid);
    }
    if let Some(gid) = resolved.gid {
        cmd.gid(gid);
    }
    if resolved.detached {
        cmd.process_group(0);
    }
}

#[cfg(not(unix))]
fn apply_platform(_cmd: &mut std::process::Command, _resolved: &ResolvedSpec) {}

fn apply_stdio(cmd: &mut std::process::Command, resolved: &ResolvedSpec) -> Result<()> {
    use std::process::Stdio;

    for (slot, descriptor) in resolved.stdio.iter().enumerate().take(3) {
        let stdio = match descriptor {
            StdioDescriptor::Ignore => Stdio::null(),
            StdioDescriptor::Pipe => Stdio::piped(),
            StdioDescriptor::Inherit => Stdio::inherit(),
            StdioDescriptor::Fd(fd) => clone_fd(*fd)?,
            // Rejected by spawn_sync before this point.
            StdioDescriptor::Ipc => continue,
        };
        match slot {
            0 => cmd.stdin(stdio),
            1 => cmd.stdout(stdio),
            2 => cmd.stderr(stdio),
            _ => unreachable!(),
        };
    }
    if resolved.stdio.len() > 3 {
        for descriptor in &resolved.stdio[3..] {
            if !matches!(descriptor, StdioDescriptor::Ignore) {
                return Err(ProcmuxError::validation(
                    "stdio slots beyond stderr are not supported by the blocking executor",
                ));
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn clone_fd(fd: i32) -> Result<std::process::Stdio> {
    use std::os::fd::{BorrowedFd, OwnedFd};

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let owned: OwnedFd = borrowed.try_clone_to_owned().map_err(ProcmuxError::Io)?;
    Ok(std::process::Stdio::from(owned))
}

#[cfg(not(unix))]
fn clone_fd(_fd: i32) -> Result<std::process::Stdio> {
    Err(ProcmuxError::validation(
        "raw fd stdio is not supported on this platform",
    ))
}

fn deliver_kill(child: &mut std::process::Child, pid: u32, signo: i32) {
    if platform_launcher().kill(pid, signo).is_err() {
        let _ = child.kill();
    }
}

#[cfg(unix)]
fn split_status(status: std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal().map(|signo| {
        signals::name_of(signo)
            .map(str::to_string)
            .unwrap_or_else(|| signo.to_string())
    });
    (status.code(), signal)
}

#[cfg(not(unix))]
fn split_status(status: std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    (status.code(), None)
}

fn reader_thread<R: Read + Send + 'static>(
    mut source: R,
    max: Option<usize>,
    overflow: Arc<AtomicBool>,
) -> std::thread::JoinHandle<(Vec<u8>, bool)> {
    std::thread::spawn(move || {
        let mut collected = Vec::new();
        let mut truncated = false;
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(max) = max {
                        if collected.len() + n > max {
                            let allowance = max - collected.len();
                            collected.extend_from_slice(&chunk[..allowance]);
                            truncated = true;
                            overflow.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                    collected.extend_from_slice(&chunk[..n]);
                }
                Err(_) => break,
            }
        }
        (collected, truncated)
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or((Vec::new(), false))
}

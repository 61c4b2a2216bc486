//! Launcher collaborator contract: the platform layer that performs the
//! actual OS spawn/wait/kill. Everything above it is platform-independent.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SpawnError;
use crate::normalize::ResolvedSpec;

/// Environment variable through which the launcher tells a child which fd
/// carries the IPC channel.
pub const IPC_FD_ENV: &str = "PROCMUX_IPC_FD";

pub type PipeReadEnd = Box<dyn AsyncRead + Send + Unpin>;
pub type PipeWriteEnd = Box<dyn AsyncWrite + Send + Unpin>;

/// Bidirectional byte stream backing an IPC channel endpoint.
pub trait IpcDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcDuplex for T {}

/// Terminal status of a launched process, as the pair the launcher observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// A successfully launched OS process. Pipe endpoints are take-once; `wait`
/// resolves exactly once with the exit outcome.
#[async_trait]
pub trait LaunchedChild: Send {
    fn pid(&self) -> Option<u32>;

    fn take_stdin(&mut self) -> Option<PipeWriteEnd>;

    fn take_stdout(&mut self) -> Option<PipeReadEnd>;

    fn take_stderr(&mut self) -> Option<PipeReadEnd>;

    /// Parent end of the IPC channel, when the spec carried an `Ipc` slot.
    fn take_ipc(&mut self) -> Option<Box<dyn IpcDuplex>>;

    async fn wait(&mut self) -> std::io::Result<ExitOutcome>;
}

/// Platform process launcher.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &ResolvedSpec) -> Result<Box<dyn LaunchedChild>, SpawnError>;

    /// Deliver a signal to a pid. Signal `0` is a liveness probe.
    fn kill(&self, pid: u32, signo: i32) -> Result<(), SpawnError>;

    fn platform_name(&self) -> &'static str;
}

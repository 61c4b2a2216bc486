//! procmux - OS process supervision and stdio/IPC multiplexing
//!
//! Spawn requests are described by [`ProcessSpec`], launched through a
//! platform [`Launcher`], and supervised by a [`ChildProcess`] handle that
//! reports lifecycle through an ordered event channel. Convenience layers
//! cover buffered collection ([`exec`], [`exec_file`]), blocking execution
//! ([`spawn_sync`] and friends), and self-respawning workers with a message
//! channel ([`fork`]).

mod adapters;
mod cancel;
mod collect;
mod factory;
mod handle;
mod ipc;
mod sync;

use std::sync::Arc;

use derive_builder::Builder;

pub use adapters::{PipeReader, PipeWriter};
pub use collect::{
    CollectedOutput, DEFAULT_MAX_BUFFER, Encoding, ExecFailure, ExecOptions, ExecOptionsBuilder,
    ExecOutput, exec, exec_file,
};
pub use factory::platform_launcher;
pub use handle::ChildProcess;
pub use ipc::{ChildEndpoint, IpcChannel};
pub use procmux_core::{
    ForeignStream, IpcError, KillSignal, LaunchedChild, Launcher, ProcessEvent, ProcessSpec,
    ProcessSpecBuilder, ProcmuxError, Result, SerializationMode, Shell, SpawnError,
    SpawnErrorKind, StdioDescriptor, StdioEntry, StdioSpec, stdio,
};
pub use sync::{
    SyncOptions, SyncOptionsBuilder, SyncOutput, exec_file_sync, exec_sync, spawn_sync,
};

/// Spawn a process with the platform launcher.
pub async fn spawn(spec: ProcessSpec) -> Result<ChildProcess> {
    spawn_with(factory::platform_launcher(), spec).await
}

/// Spawn with an explicit launcher. Useful for tests and embedding.
pub async fn spawn_with(launcher: Arc<dyn Launcher>, spec: ProcessSpec) -> Result<ChildProcess> {
    ChildProcess::spawn_with_launcher(launcher, spec, false).await
}

/// Options for [`fork`].
#[derive(Debug, Clone, Default, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct ForkOptions {
    /// Pipe the worker's stdio instead of inheriting the parent's.
    pub silent: bool,
    pub env: std::collections::HashMap<String, String>,
    pub working_directory: Option<std::path::PathBuf>,
    pub serialization: SerializationMode,
}

impl ForkOptions {
    pub fn builder() -> ForkOptionsBuilder {
        ForkOptionsBuilder::default()
    }
}

/// Respawn the current executable as a worker with an IPC channel on slot 3.
///
/// The worker discovers its end of the channel through
/// [`ChildEndpoint::from_env`].
pub async fn fork(args: &[impl AsRef<str>], options: ForkOptions) -> Result<ChildProcess> {
    let program = std::env::current_exe().map_err(ProcmuxError::Io)?;
    let stream = if options.silent {
        StdioEntry::Named("pipe".to_string())
    } else {
        StdioEntry::Named("inherit".to_string())
    };
    let stdio = StdioSpec::entries(vec![
        stream.clone(),
        stream.clone(),
        stream,
        StdioEntry::Named("ipc".to_string()),
    ]);

    let mut spec = ProcessSpec::new(program.to_string_lossy().into_owned());
    spec.args = args.iter().map(|a| a.as_ref().to_string()).collect();
    spec.env = options.env;
    spec.working_directory = options.working_directory;
    spec.serialization = options.serialization;
    spec.stdio = stdio;

    ChildProcess::spawn_with_launcher(factory::platform_launcher(), spec, true).await
}

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::signals::KillSignal;
use crate::stdio::StdioSpec;

/// Shell wrapping mode for a spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Shell {
    /// Execute the program directly.
    #[default]
    Off,
    /// Wrap through the platform default shell (`/bin/sh`, or `%COMSPEC%`
    /// falling back to `cmd.exe`).
    Default,
    /// Wrap through a specific shell program.
    Program(String),
}

/// Wire format for messages on the IPC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationMode {
    /// Newline-delimited JSON.
    #[default]
    Json,
    /// Length-prefixed JSON frames; survives embedded newlines.
    Advanced,
}

/// A spawn request. Immutable once the process has been launched.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option))]
pub struct ProcessSpec {
    /// Executable path or, with shell wrapping, the command to wrap.
    pub program: String,

    #[builder(default)]
    #[builder(setter(custom))]
    pub args: Vec<String>,

    /// Extra environment entries layered over the parent environment.
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,

    #[builder(default)]
    pub working_directory: Option<PathBuf>,

    #[builder(default)]
    pub stdio: StdioSpec,

    /// Place the child in its own process group.
    #[builder(default)]
    pub detached: bool,

    #[builder(default)]
    pub uid: Option<u32>,

    #[builder(default)]
    pub gid: Option<u32>,

    #[builder(default)]
    pub shell: Shell,

    /// Override for the child's argv[0]; defaults to the (possibly
    /// shell-substituted) executable.
    #[builder(default)]
    pub argv0: Option<String>,

    #[builder(default)]
    pub windows_hide: bool,

    #[builder(default)]
    pub windows_verbatim_arguments: bool,

    #[builder(default)]
    pub serialization: SerializationMode,

    /// When set, a one-shot guard kills the child with `kill_signal` on
    /// expiry. Disarmed by exit.
    #[builder(default)]
    pub timeout: Option<Duration>,

    #[builder(default)]
    pub kill_signal: KillSignal,

    /// Abort source; cancelling it converges on the same kill path as
    /// timeout and explicit kill().
    #[builder(default)]
    pub abort: Option<CancellationToken>,
}

impl ProcessSpec {
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }

    /// Spec with defaults for everything but the program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
            stdio: StdioSpec::default(),
            detached: false,
            uid: None,
            gid: None,
            shell: Shell::Off,
            argv0: None,
            windows_hide: false,
            windows_verbatim_arguments: false,
            serialization: SerializationMode::default(),
            timeout: None,
            kill_signal: KillSignal::default(),
            abort: None,
        }
    }
}

impl ProcessSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

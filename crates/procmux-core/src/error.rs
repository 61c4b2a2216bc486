use thiserror::Error;

/// Tagged OS-level condition reported by a launcher when a spawn fails.
///
/// Every kind except `Other` is reported asynchronously through the event
/// channel; `Other` propagates as a synchronous error from `spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorKind {
    AccessDenied,
    ResourceUnavailable,
    TooManyOpenFiles,
    SystemFileTableFull,
    NotFound,
    Other,
}

impl SpawnErrorKind {
    /// Coarse classification from a portable `io::ErrorKind`. Platform
    /// launchers refine this with raw errno values where they can.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => Self::AccessDenied,
            ErrorKind::WouldBlock => Self::ResourceUnavailable,
            ErrorKind::NotFound => Self::NotFound,
            _ => Self::Other,
        }
    }
}

/// OS-level launch or signal-delivery failure, tagged with the originating
/// syscall and the classified condition.
#[derive(Debug, Error)]
#[error("{syscall} failed: {source}")]
pub struct SpawnError {
    pub kind: SpawnErrorKind,
    pub syscall: &'static str,
    #[source]
    pub source: std::io::Error,
}

impl SpawnError {
    pub fn new(kind: SpawnErrorKind, syscall: &'static str, source: std::io::Error) -> Self {
        Self {
            kind,
            syscall,
            source,
        }
    }

    pub fn from_io(syscall: &'static str, source: std::io::Error) -> Self {
        Self {
            kind: SpawnErrorKind::from_io(&source),
            syscall,
            source,
        }
    }

    pub fn other(syscall: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: SpawnErrorKind::Other,
            syscall,
            source: std::io::Error::other(message.into()),
        }
    }

    /// Whether this failure is reported through `error`/`close` events rather
    /// than a synchronous error from the spawn call.
    pub fn is_deferred(&self) -> bool {
        !matches!(self.kind, SpawnErrorKind::Other)
    }
}

/// Errors raised by the IPC message channel.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("process already closed")]
    ChannelClosed,

    #[error("ipc channel is not connected")]
    NotConnected,

    #[error("failed to serialize ipc message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Error taxonomy for process supervision operations.
#[derive(Debug, Error)]
pub enum ProcmuxError {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("stdio vector contains more than one ipc slot")]
    DuplicateIpc,

    #[error("unsupported stdio object: {0}")]
    UnsupportedStdio(String),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("{stream} maxBuffer length exceeded")]
    BufferLimit { stream: &'static str },

    #[error("timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    #[error("operation aborted")]
    Aborted,

    #[error("Command failed: {command}\n{stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        signal: Option<String>,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProcmuxError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Pre-launch errors reject before any OS resource is touched and are the
    /// only ones a spawn call returns synchronously (besides non-deferred
    /// launch failures).
    pub fn is_pre_launch(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::DuplicateIpc
                | Self::UnsupportedStdio(_)
                | Self::UnknownSignal(_)
        )
    }

    /// Whether the error is reported through the event/result channel
    /// instead of being thrown from the originating call.
    pub fn is_deferred(&self) -> bool {
        match self {
            Self::Spawn(e) => e.is_deferred(),
            Self::BufferLimit { .. } | Self::Timeout { .. } | Self::Aborted => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcmuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_whitelist_excludes_other() {
        let whitelisted = SpawnError::new(
            SpawnErrorKind::NotFound,
            "spawn",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(whitelisted.is_deferred());

        let other = SpawnError::other("spawn", "exotic failure");
        assert!(!other.is_deferred());
    }

    #[test]
    fn pre_launch_classification() {
        assert!(ProcmuxError::validation("bad").is_pre_launch());
        assert!(ProcmuxError::DuplicateIpc.is_pre_launch());
        assert!(ProcmuxError::UnknownSignal("SIGBOGUS".into()).is_pre_launch());
        assert!(!ProcmuxError::Timeout { millis: 50 }.is_pre_launch());
    }

    #[test]
    fn command_failed_embeds_stderr() {
        let err = ProcmuxError::CommandFailed {
            command: "ls /nope".into(),
            code: Some(2),
            signal: None,
            stderr: "ls: /nope: No such file or directory".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("ls /nope"));
        assert!(rendered.contains("No such file or directory"));
    }

    #[test]
    fn io_kind_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(SpawnErrorKind::from_io(&err), SpawnErrorKind::AccessDenied);
        let err = std::io::Error::other("weird");
        assert_eq!(SpawnErrorKind::from_io(&err), SpawnErrorKind::Other);
    }
}

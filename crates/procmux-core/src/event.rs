use std::sync::Arc;

use crate::error::ProcmuxError;

/// Events a supervised process delivers through its event channel.
///
/// Delivery order is enforced by the emitter: `Spawn` first, `Exit` strictly
/// before `Close`, and `Close` exactly once as the terminal event.
#[derive(Debug, Clone, derive_more::From)]
pub enum ProcessEvent {
    /// The launcher accepted the spawn request.
    Spawn,
    /// The OS process terminated. Streams may still be draining.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
    /// Terminal event: exit plus every materialized sub-resource completed.
    Close {
        code: Option<i32>,
        signal: Option<String>,
    },
    #[from]
    Error(Arc<ProcmuxError>),
    /// Inbound IPC payload.
    #[from]
    Message(serde_json::Value),
    /// The IPC channel was torn down.
    Disconnect,
}

impl ProcessEvent {
    pub fn error(err: ProcmuxError) -> Self {
        ProcessEvent::Error(Arc::new(err))
    }

    pub fn is_close(&self) -> bool {
        matches!(self, ProcessEvent::Close { .. })
    }
}

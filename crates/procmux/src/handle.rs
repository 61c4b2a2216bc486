//! Supervised child handle: event channel, close accounting, kill path.
//!
//! Every observable event flows through one unbounded channel, enqueued from
//! spawned tasks so nothing is delivered synchronously from a public call.
//! `Close` fires exactly once, strictly after `Exit`, and only after every
//! materialized sub-resource (pipe adapters, fork-origin IPC) has completed.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use procmux_core::{
    KillSignal, LaunchedChild, Launcher, PipeReadEnd, PipeWriteEnd, ProcessEvent, ProcessSpec,
    ProcmuxError, Result, SpawnError, StdioDescriptor, normalize, signals,
};

use crate::adapters::{PipeReader, PipeWriter};
use crate::cancel;
use crate::ipc::IpcChannel;

/// Why a kill was issued on behalf of the supervisor rather than the caller.
/// Collectors use this to synthesize the right terminal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillCause {
    Timeout(u64),
    BufferLimit(&'static str),
    Abort,
}

/// A stdio pipe endpoint between launch and caller pickup.
enum SlotState<T> {
    /// No pipe was negotiated for this slot.
    Absent,
    /// Pipe exists but no adapter has been handed out yet.
    Uncreated(T),
    /// An adapter owns the endpoint; its completion is on the ledger.
    Materialized,
    /// Endpoint dropped without ever being materialized.
    Destroyed,
}

impl<T> SlotState<T> {
    fn take(&mut self) -> SlotState<T> {
        std::mem::replace(self, SlotState::Destroyed)
    }
}

/// Counts completions toward the terminal `Close` event. Exit itself is the
/// baseline contributor; each materialized adapter and a fork-origin IPC
/// channel add one more.
struct Ledger {
    needed: u32,
    got: u32,
    exited: bool,
    closed: bool,
    code: Option<i32>,
    signal: Option<String>,
}

/// State shared between the handle, its adapters, and its background tasks.
pub(crate) struct Shared {
    events: UnboundedSender<ProcessEvent>,
    ledger: Mutex<Ledger>,
    killed: AtomicBool,
    kill_cause: Mutex<Option<KillCause>>,
    /// Cancelled when the OS process has exited. Disarms timeout/abort guards.
    pub(crate) exit_token: CancellationToken,
    stdin_slot: Mutex<SlotState<PipeWriteEnd>>,
    stdout_slot: Mutex<SlotState<PipeReadEnd>>,
    stderr_slot: Mutex<SlotState<PipeReadEnd>>,
}

impl Shared {
    fn new(events: UnboundedSender<ProcessEvent>) -> Self {
        Self {
            events,
            ledger: Mutex::new(Ledger {
                needed: 1,
                got: 0,
                exited: false,
                closed: false,
                code: None,
                signal: None,
            }),
            killed: AtomicBool::new(false),
            kill_cause: Mutex::new(None),
            exit_token: CancellationToken::new(),
            stdin_slot: Mutex::new(SlotState::Absent),
            stdout_slot: Mutex::new(SlotState::Absent),
            stderr_slot: Mutex::new(SlotState::Absent),
        }
    }

    /// Enqueue an event. Delivery happens when the caller drains the channel,
    /// never inline with the emitting call.
    pub(crate) fn emit(&self, event: ProcessEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn set_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_kill_cause(&self, cause: KillCause) {
        let mut slot = self.kill_cause.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cause);
        }
    }

    pub(crate) fn kill_cause(&self) -> Option<KillCause> {
        *self.kill_cause.lock().unwrap()
    }

    /// Register one more completion the `Close` event must wait for.
    pub(crate) fn add_close_contributor(&self) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.needed += 1;
    }

    /// Record one completion and emit `Close` if it was the last one owed.
    pub(crate) fn complete_close(&self) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.got += 1;
        self.maybe_close_locked(&mut ledger);
    }

    fn record_exit(&self, code: Option<i32>, signal: Option<String>) {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.exited {
            return;
        }
        ledger.exited = true;
        ledger.code = code;
        ledger.signal = signal.clone();
        self.emit(ProcessEvent::Exit { code, signal });
        ledger.got += 1;
        self.maybe_close_locked(&mut ledger);
    }

    fn maybe_close_locked(&self, ledger: &mut Ledger) {
        if ledger.exited && !ledger.closed && ledger.got >= ledger.needed {
            ledger.closed = true;
            self.emit(ProcessEvent::Close {
                code: ledger.code,
                signal: ledger.signal.clone(),
            });
        }
    }

    /// Deferred-failure path: no process exists, so the handle settles with an
    /// `Error` followed by a synthetic `Close` carrying code -1.
    fn settle_failed_spawn(&self, err: ProcmuxError) {
        {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.exited = true;
            ledger.closed = true;
            ledger.code = Some(-1);
        }
        self.emit(ProcessEvent::error(err));
        self.emit(ProcessEvent::Close {
            code: Some(-1),
            signal: None,
        });
    }

    fn store_endpoints(&self, stdio: &[StdioDescriptor], child: &mut Box<dyn LaunchedChild>) {
        if stdio.first() == Some(&StdioDescriptor::Pipe) {
            if let Some(end) = child.take_stdin() {
                *self.stdin_slot.lock().unwrap() = SlotState::Uncreated(end);
            }
        }
        if stdio.get(1) == Some(&StdioDescriptor::Pipe) {
            if let Some(end) = child.take_stdout() {
                *self.stdout_slot.lock().unwrap() = SlotState::Uncreated(end);
            }
        }
        if stdio.get(2) == Some(&StdioDescriptor::Pipe) {
            if let Some(end) = child.take_stderr() {
                *self.stderr_slot.lock().unwrap() = SlotState::Uncreated(end);
            }
        }
    }

    /// Tear down a never-materialized stdin at exit; there is no one left to
    /// read it. Read endpoints are deliberately NOT destroyed: the kernel
    /// keeps their buffered output, so a caller materializing stdout/stderr
    /// even after a fast exit still drains everything to EOF.
    fn discard_unused_stdin(&self) {
        let mut guard = self.stdin_slot.lock().unwrap();
        if let SlotState::Uncreated(_) = &*guard {
            *guard = SlotState::Destroyed;
        }
    }
}

/// Stateless kill capability, cloneable into guard tasks. Converging on one
/// delivery path keeps explicit kill, timeout, abort, and buffer-limit kills
/// behaviorally identical.
#[derive(Clone)]
pub(crate) struct Killer {
    pid: Option<u32>,
    pub(crate) shared: Arc<Shared>,
    launcher: Arc<dyn Launcher>,
}

impl Killer {
    /// Deliver a signal. `Ok(true)` means delivered (or the process was
    /// already killed); `Ok(false)` means delivery failed and the failure was
    /// reported through the event channel. Unknown signals error out before
    /// anything is sent.
    pub(crate) fn kill(&self, signal: &KillSignal) -> Result<bool> {
        if self.shared.is_killed() {
            return Ok(true);
        }
        let signo = signals::resolve(signal)?;
        let Some(pid) = self.pid else {
            self.shared.emit(ProcessEvent::error(
                SpawnError::other("kill", "process never started").into(),
            ));
            return Ok(false);
        };
        match self.launcher.kill(pid, signo) {
            Ok(()) => {
                debug!(pid = %pid, signo, "signal delivered");
                self.shared.set_killed();
                Ok(true)
            }
            Err(err) => {
                warn!(pid = %pid, signo, error = %err, "signal delivery failed");
                self.shared.emit(ProcessEvent::error(err.into()));
                Ok(false)
            }
        }
    }

    pub(crate) fn kill_for(&self, signal: &KillSignal, cause: KillCause) -> Result<bool> {
        self.shared.set_kill_cause(cause);
        self.kill(signal)
    }

    /// Signal 0: liveness probe, bypasses the signal table, no side effects.
    fn probe(&self) -> bool {
        match self.pid {
            Some(pid) => self.launcher.kill(pid, 0).is_ok(),
            None => false,
        }
    }
}

/// Handle to a supervised OS process.
///
/// Obtained from [`crate::spawn`] and friends. The handle itself never blocks
/// on the child; lifecycle is observed through [`ChildProcess::events`].
pub struct ChildProcess {
    pid: Option<u32>,
    kill_signal: KillSignal,
    shared: Arc<Shared>,
    launcher: Arc<dyn Launcher>,
    events: Option<UnboundedReceiver<ProcessEvent>>,
    ipc: Option<IpcChannel>,
}

impl ChildProcess {
    pub(crate) async fn spawn_with_launcher(
        launcher: Arc<dyn Launcher>,
        spec: ProcessSpec,
        fork_origin: bool,
    ) -> Result<ChildProcess> {
        let resolved = normalize(&spec)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(tx));

        let mut child = match launcher.launch(&resolved).await {
            Ok(child) => child,
            Err(err) if err.is_deferred() => {
                warn!(
                    program = %resolved.program,
                    kind = ?err.kind,
                    "launch failed, reporting through event channel"
                );
                let settle = shared.clone();
                tokio::spawn(async move {
                    settle.settle_failed_spawn(err.into());
                });
                return Ok(ChildProcess {
                    pid: None,
                    kill_signal: spec.kill_signal,
                    shared,
                    launcher,
                    events: Some(rx),
                    ipc: None,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let pid = child.pid();
        shared.store_endpoints(&resolved.stdio, &mut child);

        let ipc = child.take_ipc().map(|duplex| {
            IpcChannel::start(duplex, resolved.serialization, shared.clone(), fork_origin)
        });

        shared.emit(ProcessEvent::Spawn);
        if let Some(pid) = pid {
            info!(pid = %pid, program = %resolved.program, "supervising process");
        }

        let wait_shared = shared.clone();
        tokio::spawn(async move {
            let (code, signal) = match child.wait().await {
                Ok(outcome) => (outcome.code, outcome.signal.map(signal_name)),
                Err(err) => {
                    warn!(error = %err, "wait on child failed");
                    wait_shared.emit(ProcessEvent::error(err.into()));
                    (None, None)
                }
            };
            debug!(?code, ?signal, "process exited");
            wait_shared.exit_token.cancel();
            wait_shared.discard_unused_stdin();
            wait_shared.record_exit(code, signal);
        });

        let killer = Killer {
            pid,
            shared: shared.clone(),
            launcher: launcher.clone(),
        };
        if let Some(timeout) = spec.timeout {
            cancel::arm_timeout(killer.clone(), spec.kill_signal.clone(), timeout);
        }
        if let Some(token) = spec.abort.clone() {
            cancel::bridge_abort(killer.clone(), spec.kill_signal.clone(), token);
        }

        Ok(ChildProcess {
            pid,
            kill_signal: spec.kill_signal,
            shared,
            launcher,
            events: Some(rx),
            ipc,
        })
    }

    /// OS pid, `None` when the spawn failure was deferred.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn killed(&self) -> bool {
        self.shared.is_killed()
    }

    /// Take the event channel. Yields once per handle.
    pub fn events(&mut self) -> Option<UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }

    /// Materialize the stdin adapter. First call wins; later calls and
    /// non-pipe slots yield `None`.
    pub fn stdin(&self) -> Option<PipeWriter> {
        let mut guard = self.shared.stdin_slot.lock().unwrap();
        match guard.take() {
            SlotState::Uncreated(end) => {
                *guard = SlotState::Materialized;
                self.shared.add_close_contributor();
                Some(PipeWriter::new(end, self.shared.clone()))
            }
            prev => {
                *guard = prev;
                None
            }
        }
    }

    pub fn stdout(&self) -> Option<PipeReader> {
        Self::materialize_reader(&self.shared.stdout_slot, &self.shared)
    }

    pub fn stderr(&self) -> Option<PipeReader> {
        Self::materialize_reader(&self.shared.stderr_slot, &self.shared)
    }

    fn materialize_reader(
        slot: &Mutex<SlotState<PipeReadEnd>>,
        shared: &Arc<Shared>,
    ) -> Option<PipeReader> {
        let mut guard = slot.lock().unwrap();
        match guard.take() {
            SlotState::Uncreated(end) => {
                *guard = SlotState::Materialized;
                shared.add_close_contributor();
                Some(PipeReader::new(end, shared.clone()))
            }
            prev => {
                *guard = prev;
                None
            }
        }
    }

    /// IPC channel, present when the stdio vector negotiated an `ipc` slot.
    pub fn ipc(&self) -> Option<&IpcChannel> {
        self.ipc.as_ref()
    }

    /// Send a message over the IPC channel.
    pub async fn send(&self, message: &serde_json::Value) -> Result<()> {
        match &self.ipc {
            Some(channel) => Ok(channel.send(message).await?),
            None => Err(procmux_core::IpcError::ChannelClosed.into()),
        }
    }

    /// Tear down the IPC channel from the parent side.
    pub async fn disconnect(&self) -> Result<()> {
        match &self.ipc {
            Some(channel) => Ok(channel.disconnect()?),
            None => Err(procmux_core::IpcError::NotConnected.into()),
        }
    }

    /// Deliver a signal to the process.
    ///
    /// Signal `0` is a liveness probe: it reports `true` for an
    /// already-killed handle and otherwise probes the pid without going
    /// through the signal table and without marking the handle killed.
    pub fn kill<S: Into<KillSignal>>(&self, signal: S) -> Result<bool> {
        let signal = signal.into();
        if signal == KillSignal::Number(0) {
            if self.shared.is_killed() {
                return Ok(true);
            }
            return Ok(self.killer().probe());
        }
        self.killer().kill(&signal)
    }

    /// Kill with the signal configured on the spawn request.
    pub fn terminate(&self) -> Result<bool> {
        self.killer().kill(&self.kill_signal)
    }

    pub(crate) fn killer(&self) -> Killer {
        Killer {
            pid: self.pid,
            shared: self.shared.clone(),
            launcher: self.launcher.clone(),
        }
    }

    pub(crate) fn kill_cause(&self) -> Option<KillCause> {
        self.shared.kill_cause()
    }
}

fn signal_name(signo: i32) -> String {
    signals::name_of(signo)
        .map(str::to_string)
        .unwrap_or_else(|| signo.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use procmux_core::{ExitOutcome, IpcDuplex, ResolvedSpec};

    use super::*;

    /// Launcher that fabricates an instantly-exiting child, optionally with
    /// an IPC duplex attached, so ledger behavior is observable without an
    /// OS process.
    struct StubLauncher {
        ipc: Mutex<Option<Box<dyn IpcDuplex>>>,
    }

    impl StubLauncher {
        fn with_ipc(duplex: Box<dyn IpcDuplex>) -> Self {
            Self {
                ipc: Mutex::new(Some(duplex)),
            }
        }
    }

    #[async_trait]
    impl Launcher for StubLauncher {
        async fn launch(
            &self,
            _spec: &ResolvedSpec,
        ) -> std::result::Result<Box<dyn LaunchedChild>, SpawnError> {
            Ok(Box::new(StubChild {
                ipc: self.ipc.lock().unwrap().take(),
            }))
        }

        fn kill(&self, _pid: u32, _signo: i32) -> std::result::Result<(), SpawnError> {
            Ok(())
        }

        fn platform_name(&self) -> &'static str {
            "stub"
        }
    }

    struct StubChild {
        ipc: Option<Box<dyn IpcDuplex>>,
    }

    #[async_trait]
    impl LaunchedChild for StubChild {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn take_stdin(&mut self) -> Option<PipeWriteEnd> {
            None
        }

        fn take_stdout(&mut self) -> Option<PipeReadEnd> {
            None
        }

        fn take_stderr(&mut self) -> Option<PipeReadEnd> {
            None
        }

        fn take_ipc(&mut self) -> Option<Box<dyn IpcDuplex>> {
            self.ipc.take()
        }

        async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
            Ok(ExitOutcome {
                code: Some(0),
                signal: None,
            })
        }
    }

    #[tokio::test]
    async fn fork_origin_ipc_holds_close_until_teardown() {
        let (theirs, ours) = tokio::io::duplex(256);
        let launcher: Arc<dyn Launcher> = Arc::new(StubLauncher::with_ipc(Box::new(theirs)));
        let mut child =
            ChildProcess::spawn_with_launcher(launcher, ProcessSpec::new("stub"), true)
                .await
                .unwrap();
        let mut events = child.events().unwrap();

        assert!(matches!(events.recv().await, Some(ProcessEvent::Spawn)));
        assert!(matches!(
            events.recv().await,
            Some(ProcessEvent::Exit { code: Some(0), .. })
        ));
        // The channel still holds its ledger slot, so Close is withheld.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), events.recv())
                .await
                .is_err()
        );

        child.disconnect().await.unwrap();
        assert!(matches!(events.recv().await, Some(ProcessEvent::Disconnect)));
        assert!(matches!(
            events.recv().await,
            Some(ProcessEvent::Close { code: Some(0), .. })
        ));
        drop(ours);
    }

    #[tokio::test]
    async fn plain_spawn_ipc_does_not_hold_close() {
        let (theirs, ours) = tokio::io::duplex(256);
        let launcher: Arc<dyn Launcher> = Arc::new(StubLauncher::with_ipc(Box::new(theirs)));
        let mut child =
            ChildProcess::spawn_with_launcher(launcher, ProcessSpec::new("stub"), false)
                .await
                .unwrap();
        let mut events = child.events().unwrap();

        assert!(matches!(events.recv().await, Some(ProcessEvent::Spawn)));
        assert!(matches!(
            events.recv().await,
            Some(ProcessEvent::Exit { code: Some(0), .. })
        ));
        // No disconnect needed; exit alone settles the ledger.
        assert!(matches!(
            events.recv().await,
            Some(ProcessEvent::Close { code: Some(0), .. })
        ));
        drop(ours);
    }
}

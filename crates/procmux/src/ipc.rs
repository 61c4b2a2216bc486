//! JSON message channel over a dedicated duplex byte stream.
//!
//! Two wire formats: newline-delimited JSON and length-prefixed frames
//! (4-byte big-endian payload length). Inbound messages surface as `Message`
//! events; teardown from either side emits a single `Disconnect`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use procmux_core::{IPC_FD_ENV, IpcDuplex, IpcError, ProcessEvent, SerializationMode};

use crate::handle::Shared;

/// Frames larger than this are treated as stream corruption.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

type Writer = WriteHalf<Box<dyn IpcDuplex>>;

/// Parent-side endpoint of the IPC channel.
pub struct IpcChannel {
    writer: Arc<Mutex<Option<Writer>>>,
    connected: Arc<AtomicBool>,
    mode: SerializationMode,
    teardown: CancellationToken,
}

impl IpcChannel {
    /// Wire up the channel and start the reader task. A fork-origin channel
    /// additionally holds a slot on the close ledger until it tears down.
    pub(crate) fn start(
        duplex: Box<dyn IpcDuplex>,
        mode: SerializationMode,
        shared: Arc<Shared>,
        fork_origin: bool,
    ) -> Self {
        if fork_origin {
            shared.add_close_contributor();
        }

        let (read_half, write_half) = tokio::io::split(duplex);
        let writer = Arc::new(Mutex::new(Some(write_half)));
        let connected = Arc::new(AtomicBool::new(true));
        let teardown = CancellationToken::new();

        let task_writer = writer.clone();
        let task_connected = connected.clone();
        let task_teardown = teardown.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                tokio::select! {
                    _ = task_teardown.cancelled() => break,
                    frame = read_frame(&mut reader, mode) => match frame {
                        Ok(Some(message)) => shared.emit(ProcessEvent::Message(message)),
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "ipc stream error");
                            shared.emit(ProcessEvent::error(IpcError::Io(err).into()));
                            break;
                        }
                    }
                }
            }

            // Single teardown path regardless of which side hung up first.
            task_connected.store(false, Ordering::SeqCst);
            if let Some(mut write_half) = task_writer.lock().await.take() {
                let _ = write_half.shutdown().await;
            }
            debug!("ipc channel torn down");
            shared.emit(ProcessEvent::Disconnect);
            if fork_origin {
                shared.complete_close();
            }
        });

        Self {
            writer,
            connected,
            mode,
            teardown,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Serialize and send one message. Fails with `ChannelClosed` once the
    /// channel has torn down.
    pub async fn send(&self, message: &serde_json::Value) -> Result<(), IpcError> {
        if !self.is_connected() {
            return Err(IpcError::ChannelClosed);
        }
        let frame = encode_frame(message, self.mode)?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(IpcError::ChannelClosed);
        };
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Initiate teardown. Errors if the channel is no longer connected.
    pub fn disconnect(&self) -> Result<(), IpcError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(IpcError::NotConnected);
        }
        self.teardown.cancel();
        Ok(())
    }
}

fn encode_frame(
    message: &serde_json::Value,
    mode: SerializationMode,
) -> Result<Vec<u8>, IpcError> {
    let payload = serde_json::to_vec(message)?;
    Ok(match mode {
        SerializationMode::Json => {
            let mut frame = payload;
            frame.push(b'\n');
            frame
        }
        SerializationMode::Advanced => {
            let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
            frame.extend_from_slice(&payload);
            frame
        }
    })
}

async fn read_frame<R>(
    reader: &mut BufReader<R>,
    mode: SerializationMode,
) -> std::io::Result<Option<serde_json::Value>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match mode {
        SerializationMode::Json => loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(std::io::Error::other);
        },
        SerializationMode::Advanced => {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(err) => return Err(err),
            }
            let len = u32::from_be_bytes(len_buf);
            if len > MAX_FRAME_LEN {
                return Err(std::io::Error::other(format!(
                    "ipc frame length {len} exceeds limit"
                )));
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).await?;
            serde_json::from_slice(&payload)
                .map(Some)
                .map_err(std::io::Error::other)
        }
    }
}

/// Child-side channel handed to a process started via [`crate::fork`].
///
/// Resolves the inherited fd from the environment; `None` when this process
/// was not forked with an IPC slot.
pub struct ChildEndpoint {
    reader: BufReader<ReadHalf<Box<dyn IpcDuplex>>>,
    writer: Writer,
    mode: SerializationMode,
}

impl ChildEndpoint {
    pub fn from_env(mode: SerializationMode) -> Option<ChildEndpoint> {
        let fd: i32 = std::env::var(IPC_FD_ENV).ok()?.parse().ok()?;
        let duplex = duplex_from_fd(fd)?;
        let (read_half, write_half) = tokio::io::split(duplex);
        Some(ChildEndpoint {
            reader: BufReader::new(read_half),
            writer: write_half,
            mode,
        })
    }

    pub async fn send(&mut self, message: &serde_json::Value) -> Result<(), IpcError> {
        let frame = encode_frame(message, self.mode)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next message; `None` on orderly shutdown of the parent end.
    pub async fn recv(&mut self) -> Result<Option<serde_json::Value>, IpcError> {
        Ok(read_frame(&mut self.reader, self.mode).await?)
    }
}

#[cfg(unix)]
fn duplex_from_fd(fd: i32) -> Option<Box<dyn IpcDuplex>> {
    use std::os::fd::FromRawFd;

    // Ownership of the inherited fd is taken exactly once per process.
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream.set_nonblocking(true).ok()?;
    let stream = tokio::net::UnixStream::from_std(std_stream).ok()?;
    Some(Box::new(stream))
}

#[cfg(not(unix))]
fn duplex_from_fd(_fd: i32) -> Option<Box<dyn IpcDuplex>> {
    None
}

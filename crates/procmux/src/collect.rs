//! Buffered output collection: the `exec`/`exec_file` convenience layer.
//!
//! Collection enforces a per-stream ceiling. Crossing it truncates the stream
//! to exactly the remaining allowance, kills the child immediately, and
//! resolves the whole run with a buffer-limit error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use procmux_core::{KillSignal, ProcessEvent, ProcessSpec, ProcmuxError, Shell};

use crate::adapters::PipeReader;
use crate::handle::{KillCause, Killer};

/// Default per-stream collection ceiling: 1 MiB.
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

const READ_CHUNK: usize = 8192;

/// How collected output is decoded and how the ceiling is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Decode as UTF-8; the ceiling counts characters.
    #[default]
    Utf8,
    /// Raw bytes; the ceiling counts bytes.
    Binary,
}

/// One collected stream, shaped by the requested encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectedOutput {
    Text(String),
    Binary(Vec<u8>),
}

impl CollectedOutput {
    fn empty(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Utf8 => CollectedOutput::Text(String::new()),
            Encoding::Binary => CollectedOutput::Binary(Vec::new()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CollectedOutput::Text(text) => Some(text),
            CollectedOutput::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CollectedOutput::Text(text) => text.as_bytes(),
            CollectedOutput::Binary(bytes) => bytes,
        }
    }

    /// Text view regardless of encoding, replacing invalid sequences.
    pub fn to_text(&self) -> String {
        match self {
            CollectedOutput::Text(text) => text.clone(),
            CollectedOutput::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Options for the buffered-collection runners.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into, strip_option))]
pub struct ExecOptions {
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,

    #[builder(default)]
    pub working_directory: Option<PathBuf>,

    /// Shell override for `exec`; ignored by `exec_file`.
    #[builder(default)]
    pub shell: Option<String>,

    #[builder(default)]
    pub timeout: Option<Duration>,

    #[builder(default)]
    pub kill_signal: KillSignal,

    /// Per-stream ceiling. `None` disables the limit entirely.
    #[builder(default = "Some(DEFAULT_MAX_BUFFER)")]
    pub max_buffer: Option<usize>,

    #[builder(default)]
    pub encoding: Encoding,

    #[builder(default)]
    pub abort: Option<CancellationToken>,

    #[builder(default)]
    pub uid: Option<u32>,

    #[builder(default)]
    pub gid: Option<u32>,
}

impl ExecOptions {
    pub fn builder() -> ExecOptionsBuilder {
        ExecOptionsBuilder::default()
    }
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            working_directory: None,
            shell: None,
            timeout: None,
            kill_signal: KillSignal::default(),
            max_buffer: Some(DEFAULT_MAX_BUFFER),
            encoding: Encoding::default(),
            abort: None,
            uid: None,
            gid: None,
        }
    }
}

impl ExecOptionsBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

/// Successful run: both streams collected in full.
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: CollectedOutput,
    pub stderr: CollectedOutput,
}

/// Failed run. Output collected up to the failure point rides along with the
/// error so callers can still inspect it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecFailure {
    pub error: Arc<ProcmuxError>,
    pub stdout: CollectedOutput,
    pub stderr: CollectedOutput,
}

/// Run a command line through the shell and collect its output.
pub async fn exec(command: &str, options: ExecOptions) -> Result<ExecOutput, ExecFailure> {
    let shell = match &options.shell {
        Some(program) => Shell::Program(program.clone()),
        None => Shell::Default,
    };
    let spec = build_spec(command, &[], shell, &options);
    run_collected(spec, command.to_string(), options).await
}

/// Run an executable directly (no shell) and collect its output.
pub async fn exec_file(
    program: &str,
    args: &[impl AsRef<str>],
    options: ExecOptions,
) -> Result<ExecOutput, ExecFailure> {
    let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
    let command_line = std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    let spec = build_spec(program, &args, Shell::Off, &options);
    run_collected(spec, command_line, options).await
}

fn build_spec(program: &str, args: &[String], shell: Shell, options: &ExecOptions) -> ProcessSpec {
    let mut spec = ProcessSpec::new(program);
    spec.args = args.to_vec();
    spec.env = options.env.clone();
    spec.working_directory = options.working_directory.clone();
    spec.shell = shell;
    spec.timeout = options.timeout;
    spec.kill_signal = options.kill_signal.clone();
    spec.abort = options.abort.clone();
    spec.uid = options.uid;
    spec.gid = options.gid;
    spec
}

async fn run_collected(
    spec: ProcessSpec,
    command_line: String,
    options: ExecOptions,
) -> Result<ExecOutput, ExecFailure> {
    let encoding = options.encoding;
    let mut child = match crate::spawn(spec).await {
        Ok(child) => child,
        Err(error) => {
            return Err(ExecFailure {
                error: Arc::new(error),
                stdout: CollectedOutput::empty(encoding),
                stderr: CollectedOutput::empty(encoding),
            });
        }
    };

    let mut events = child.events().expect("event channel taken from fresh handle");
    let killer = child.killer();

    let stdout_task = collect_stream(
        child.stdout(),
        encoding,
        options.max_buffer,
        killer.clone(),
        options.kill_signal.clone(),
        "stdout",
    );
    let stderr_task = collect_stream(
        child.stderr(),
        encoding,
        options.max_buffer,
        killer,
        options.kill_signal.clone(),
        "stderr",
    );

    let mut first_error: Option<Arc<ProcmuxError>> = None;
    let mut code = None;
    let mut signal = None;
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Error(err) => {
                first_error.get_or_insert(err);
            }
            ProcessEvent::Close {
                code: close_code,
                signal: close_signal,
            } => {
                code = close_code;
                signal = close_signal;
                break;
            }
            _ => {}
        }
    }

    let stdout = stdout_task
        .await
        .unwrap_or_else(|_| CollectedOutput::empty(encoding));
    let stderr = stderr_task
        .await
        .unwrap_or_else(|_| CollectedOutput::empty(encoding));

    let error = if let Some(err) = first_error {
        Some(err)
    } else if let Some(KillCause::BufferLimit(stream)) = child.kill_cause() {
        Some(Arc::new(ProcmuxError::BufferLimit { stream }))
    } else if code != Some(0) || signal.is_some() {
        // Covers ordinary non-zero exits as well as timeout kills, which
        // surface through the exit signal.
        Some(Arc::new(ProcmuxError::CommandFailed {
            command: command_line,
            code,
            signal,
            stderr: stderr.to_text(),
        }))
    } else {
        None
    };

    match error {
        Some(error) => Err(ExecFailure {
            error,
            stdout,
            stderr,
        }),
        None => Ok(ExecOutput { stdout, stderr }),
    }
}

fn collect_stream(
    reader: Option<PipeReader>,
    encoding: Encoding,
    max: Option<usize>,
    killer: Killer,
    kill_signal: KillSignal,
    stream: &'static str,
) -> JoinHandle<CollectedOutput> {
    tokio::spawn(async move {
        let mut buffer = BoundedBuffer::new(encoding, max);
        let Some(mut reader) = reader else {
            return buffer.finish();
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if !buffer.push(&chunk[..n]) {
                        warn!(stream, "output ceiling exceeded, killing process");
                        let _ = killer.kill_for(&kill_signal, KillCause::BufferLimit(stream));
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        buffer.finish()
    })
}

/// Accumulator with a hard ceiling. `push` reports `false` once the ceiling
/// is hit, after retaining exactly the remaining allowance. In text mode a
/// multibyte sequence split across reads is carried over to the next push so
/// chunk boundaries never manufacture replacement characters.
struct BoundedBuffer {
    encoding: Encoding,
    max: Option<usize>,
    len: usize,
    text: String,
    bytes: Vec<u8>,
    pending: Vec<u8>,
}

impl BoundedBuffer {
    fn new(encoding: Encoding, max: Option<usize>) -> Self {
        Self {
            encoding,
            max,
            len: 0,
            text: String::new(),
            bytes: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> bool {
        match self.encoding {
            Encoding::Binary => {
                let allowance = self.max.map(|max| max - self.len);
                match allowance {
                    Some(allowance) if chunk.len() > allowance => {
                        self.bytes.extend_from_slice(&chunk[..allowance]);
                        self.len += allowance;
                        false
                    }
                    _ => {
                        self.bytes.extend_from_slice(chunk);
                        self.len += chunk.len();
                        true
                    }
                }
            }
            Encoding::Utf8 => {
                let mut data = std::mem::take(&mut self.pending);
                data.extend_from_slice(chunk);
                let carry = utf8_carry_len(&data);
                let ready = &data[..data.len() - carry];
                self.pending = data[data.len() - carry..].to_vec();

                let decoded = String::from_utf8_lossy(ready);
                let count = decoded.chars().count();
                let allowance = self.max.map(|max| max - self.len);
                match allowance {
                    Some(allowance) if count > allowance => {
                        self.text.extend(decoded.chars().take(allowance));
                        self.len += allowance;
                        false
                    }
                    _ => {
                        self.text.push_str(&decoded);
                        self.len += count;
                        true
                    }
                }
            }
        }
    }

    fn finish(mut self) -> CollectedOutput {
        match self.encoding {
            Encoding::Utf8 => {
                // A sequence still incomplete at stream end really is
                // malformed; decode it lossily within the allowance.
                if !self.pending.is_empty() {
                    let decoded = String::from_utf8_lossy(&self.pending);
                    match self.max.map(|max| max - self.len) {
                        Some(allowance) => self.text.extend(decoded.chars().take(allowance)),
                        None => self.text.push_str(&decoded),
                    }
                }
                CollectedOutput::Text(self.text)
            }
            Encoding::Binary => CollectedOutput::Binary(self.bytes),
        }
    }
}

/// Length of the trailing bytes that begin, but do not complete, a UTF-8
/// sequence. Invalid leading bytes are left for the lossy decoder.
fn utf8_carry_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 != 0x80 {
            let width = match byte {
                b if b < 0x80 => 1,
                b if b & 0xE0 == 0xC0 => 2,
                b if b & 0xF0 == 0xE0 => 3,
                b if b & 0xF8 == 0xF0 => 4,
                _ => 1,
            };
            return if width > back { back } else { 0 };
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffer_truncates_to_allowance() {
        let mut buffer = BoundedBuffer::new(Encoding::Utf8, Some(10));
        assert!(buffer.push(b"abcdefghi"));
        assert!(!buffer.push(b"j0123"));
        assert_eq!(buffer.finish(), CollectedOutput::Text("abcdefghij".into()));
    }

    #[test]
    fn bounded_buffer_binary_counts_bytes() {
        let mut buffer = BoundedBuffer::new(Encoding::Binary, Some(4));
        assert!(!buffer.push(&[1, 2, 3, 4, 5]));
        assert_eq!(buffer.finish(), CollectedOutput::Binary(vec![1, 2, 3, 4]));
    }

    #[test]
    fn multibyte_chars_survive_chunk_boundaries() {
        let bytes = "caf\u{e9}".as_bytes();
        let mut buffer = BoundedBuffer::new(Encoding::Utf8, Some(10));
        // Split inside the two-byte sequence.
        assert!(buffer.push(&bytes[..4]));
        assert!(buffer.push(&bytes[4..]));
        assert_eq!(buffer.finish(), CollectedOutput::Text("caf\u{e9}".into()));
    }

    #[test]
    fn split_multibyte_char_counts_once_toward_ceiling() {
        let bytes = "\u{e9}x".as_bytes();
        let mut buffer = BoundedBuffer::new(Encoding::Utf8, Some(1));
        assert!(buffer.push(&bytes[..1]));
        assert!(!buffer.push(&bytes[1..]));
        assert_eq!(buffer.finish(), CollectedOutput::Text("\u{e9}".into()));
    }

    #[test]
    fn truncated_trailing_sequence_decodes_lossily_at_finish() {
        let mut buffer = BoundedBuffer::new(Encoding::Utf8, None);
        assert!(buffer.push(b"ok"));
        // Lead byte of a two-byte sequence with no continuation.
        assert!(buffer.push(&[0xC3]));
        assert_eq!(
            buffer.finish(),
            CollectedOutput::Text("ok\u{fffd}".into())
        );
    }

    #[test]
    fn unlimited_buffer_never_truncates() {
        let mut buffer = BoundedBuffer::new(Encoding::Binary, None);
        assert!(buffer.push(&vec![0u8; DEFAULT_MAX_BUFFER * 2]));
    }

    #[test]
    fn default_options_carry_one_mebibyte_ceiling() {
        let options = ExecOptions::default();
        assert_eq!(options.max_buffer, Some(DEFAULT_MAX_BUFFER));
        let built = ExecOptions::builder().build().unwrap();
        assert_eq!(built.max_buffer, Some(DEFAULT_MAX_BUFFER));
    }
}

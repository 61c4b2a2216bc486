//! procmux-core - platform-independent process supervision types
//!
//! This crate provides the spawn-request model, stdio negotiation, signal
//! table, event model, error taxonomy, and the launcher contract shared
//! across platform-specific implementations.

mod config;
mod error;
mod event;
pub mod launcher;
pub mod normalize;
pub mod signals;
pub mod stdio;

pub use config::*;
pub use error::*;
pub use event::*;
pub use launcher::{
    ExitOutcome, IpcDuplex, LaunchedChild, Launcher, PipeReadEnd, PipeWriteEnd, IPC_FD_ENV,
};
pub use normalize::{normalize, normalize_for, Platform, ResolvedSpec};
pub use signals::KillSignal;
pub use stdio::{ForeignStream, StdioDescriptor, StdioEntry, StdioSpec};

//! Unix-specific process launcher implementation

mod unix_launcher;

#[cfg(unix)]
pub use unix_launcher::UnixChild;
pub use unix_launcher::UnixLauncher;

//! Windows-specific process launcher implementation

mod windows_launcher;

#[cfg(windows)]
pub use windows_launcher::{WindowsChild, WindowsLauncher};

// Stubs so the crate still compiles as a workspace member off-Windows.
#[cfg(not(windows))]
pub struct WindowsLauncher;

#[cfg(not(windows))]
impl WindowsLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(windows))]
impl Default for WindowsLauncher {
    fn default() -> Self {
        Self::new()
    }
}

//! Compile-time selection of the platform launcher.

use std::sync::Arc;

use procmux_core::Launcher;

/// The launcher for the current platform.
pub fn platform_launcher() -> Arc<dyn Launcher> {
    #[cfg(unix)]
    return Arc::new(procmux_unix::UnixLauncher::new());

    #[cfg(windows)]
    return Arc::new(procmux_windows::WindowsLauncher::new());
}

#![cfg(windows)]

use async_trait::async_trait;
use procmux_core::{
    ExitOutcome, IpcDuplex, LaunchedChild, Launcher, PipeReadEnd, PipeWriteEnd, ResolvedSpec,
    SpawnError, SpawnErrorKind, StdioDescriptor,
};
use std::os::windows::process::CommandExt;
use std::process::Stdio;
use tokio::process::Child;
use tracing::{info, warn};
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::System::Threading::{
    OpenProcess, TerminateProcess, CREATE_NO_WINDOW, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_TERMINATE,
};

/// Windows process launcher. Signals other than the liveness probe collapse
/// to TerminateProcess; there is no IPC slot support on this platform.
pub struct WindowsLauncher;

impl WindowsLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsLauncher {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WindowsChild {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl LaunchedChild for WindowsChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_stdin(&mut self) -> Option<PipeWriteEnd> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as PipeWriteEnd)
    }

    fn take_stdout(&mut self) -> Option<PipeReadEnd> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as PipeReadEnd)
    }

    fn take_stderr(&mut self) -> Option<PipeReadEnd> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as PipeReadEnd)
    }

    fn take_ipc(&mut self) -> Option<Box<dyn IpcDuplex>> {
        None
    }

    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        let status = self.child.wait().await?;
        Ok(ExitOutcome {
            code: status.code(),
            signal: None,
        })
    }
}

#[async_trait]
impl Launcher for WindowsLauncher {
    async fn launch(&self, spec: &ResolvedSpec) -> Result<Box<dyn LaunchedChild>, SpawnError> {
        let mut cmd = std::process::Command::new(&spec.program);

        if spec.windows_verbatim_arguments {
            for arg in &spec.args {
                cmd.raw_arg(arg);
            }
        } else {
            cmd.args(&spec.args);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        if spec.windows_hide {
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }

        for (slot, descriptor) in spec.stdio.iter().enumerate() {
            let stdio = match descriptor {
                StdioDescriptor::Ignore => Stdio::null(),
                StdioDescriptor::Pipe => Stdio::piped(),
                StdioDescriptor::Inherit => Stdio::inherit(),
                StdioDescriptor::Fd(_) => {
                    return Err(SpawnError::other(
                        "spawn",
                        format!("raw fd stdio is not supported on windows (slot {slot})"),
                    ));
                }
                StdioDescriptor::Ipc => {
                    return Err(SpawnError::other(
                        "spawn",
                        "ipc channel is not supported by the windows launcher",
                    ));
                }
            };
            match slot {
                0 => cmd.stdin(stdio),
                1 => cmd.stdout(stdio),
                2 => cmd.stderr(stdio),
                _ => continue,
            };
        }

        let mut cmd = tokio::process::Command::from(cmd);
        let child = cmd.spawn().map_err(|err| {
            let spawn_err = SpawnError::from_io("spawn", err);
            warn!(program = %spec.program, kind = ?spawn_err.kind, "spawn failed");
            spawn_err
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            info!(pid = %pid, program = %spec.program, "process spawned");
        }

        Ok(Box::new(WindowsChild { child, pid }))
    }

    fn kill(&self, pid: u32, signo: i32) -> Result<(), SpawnError> {
        unsafe {
            if signo == 0 {
                // Liveness probe: can we open the process at all.
                let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid)
                    .map_err(|err| {
                        SpawnError::new(
                            SpawnErrorKind::NotFound,
                            "kill",
                            std::io::Error::other(err.to_string()),
                        )
                    })?;
                let _ = CloseHandle(handle);
                return Ok(());
            }

            let handle = OpenProcess(PROCESS_TERMINATE, false, pid).map_err(|err| {
                SpawnError::new(
                    SpawnErrorKind::NotFound,
                    "kill",
                    std::io::Error::other(err.to_string()),
                )
            })?;
            let result = TerminateProcess(handle, 1);
            let _ = CloseHandle(handle);
            result.map_err(|err| {
                SpawnError::new(
                    SpawnErrorKind::AccessDenied,
                    "kill",
                    std::io::Error::other(err.to_string()),
                )
            })
        }
    }

    fn platform_name(&self) -> &'static str {
        "windows"
    }
}

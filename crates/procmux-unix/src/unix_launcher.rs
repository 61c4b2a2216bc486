use async_trait::async_trait;
use procmux_core::{
    ExitOutcome, IpcDuplex, LaunchedChild, Launcher, PipeReadEnd, PipeWriteEnd, ResolvedSpec,
    SpawnError, SpawnErrorKind, StdioDescriptor, IPC_FD_ENV,
};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::Pid as NixPid;
    use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::Stdio;
    use tokio::net::UnixStream;
    use tokio::process::Child;
    use tracing::{debug, info, warn};

    /// Unix process launcher backed by tokio::process, with socketpair IPC
    /// slots wired through dup2 in the pre-exec hook.
    pub struct UnixLauncher;

    impl UnixLauncher {
        pub fn new() -> Self {
            Self
        }
    }

    impl Default for UnixLauncher {
        fn default() -> Self {
            Self::new()
        }
    }

    pub struct UnixChild {
        child: Child,
        pid: Option<u32>,
        ipc: Option<UnixStream>,
    }

    #[async_trait]
    impl LaunchedChild for UnixChild {
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
            self.ipc.take().map(|s| Box::new(s) as Box<dyn IpcDuplex>)
        }

        async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
            let status = self.child.wait().await?;
            Ok(ExitOutcome {
                code: status.code(),
                signal: status.signal(),
            })
        }
    }

    #[async_trait]
    impl Launcher for UnixLauncher {
        async fn launch(&self, spec: &ResolvedSpec) -> Result<Box<dyn LaunchedChild>, SpawnError> {
            let mut cmd = std::process::Command::new(&spec.program);
            cmd.args(&spec.args);
            cmd.arg0(&spec.argv0);

            for (key, value) in &spec.env {
                cmd.env(key, value);
            }

            if let Some(dir) = &spec.working_directory {
                cmd.current_dir(dir);
            }

            if let Some(uid) = spec.uid {
                cmd.uid(uid);
            }
            if let Some(gid) = spec.gid {
                cmd.gid(gid);
            }

            if spec.detached {
                cmd.process_group(0);
            }

            // Fds dup2'd into place between fork and exec, plus the parent
            // ends and keep-alives that must outlive spawn().
            let mut dup_plan: Vec<(i32, i32)> = Vec::new();
            let mut keepalive: Vec<OwnedFd> = Vec::new();
            let mut parent_ipc: Option<OwnedFd> = None;

            for (slot, descriptor) in spec.stdio.iter().enumerate() {
                match (slot, descriptor) {
                    (0..=2, StdioDescriptor::Ignore) => {
                        set_std_slot(&mut cmd, slot, Stdio::null());
                    }
                    (0..=2, StdioDescriptor::Pipe) => {
                        set_std_slot(&mut cmd, slot, Stdio::piped());
                    }
                    (0..=2, StdioDescriptor::Inherit) => {
                        set_std_slot(&mut cmd, slot, Stdio::inherit());
                    }
                    (0..=2, StdioDescriptor::Fd(fd)) => {
                        let owned = clone_fd(*fd)?;
                        set_std_slot(&mut cmd, slot, Stdio::from(owned));
                    }
                    (0..=2, StdioDescriptor::Ipc) => {
                        let (parent, child) = ipc_socketpair()?;
                        set_std_slot(&mut cmd, slot, Stdio::from(child));
                        parent_ipc = Some(parent);
                        cmd.env(IPC_FD_ENV, slot.to_string());
                    }
                    (_, StdioDescriptor::Ignore | StdioDescriptor::Inherit) => {}
                    (_, StdioDescriptor::Fd(fd)) => {
                        dup_plan.push((*fd, slot as i32));
                    }
                    (_, StdioDescriptor::Ipc) => {
                        let (parent, child) = ipc_socketpair()?;
                        dup_plan.push((child.as_raw_fd(), slot as i32));
                        keepalive.push(child);
                        parent_ipc = Some(parent);
                        cmd.env(IPC_FD_ENV, slot.to_string());
                    }
                    (_, StdioDescriptor::Pipe) => {
                        return Err(SpawnError::other(
                            "pipe",
                            format!("pipe descriptors beyond stderr are not supported (slot {slot})"),
                        ));
                    }
                }
            }

            if !dup_plan.is_empty() {
                let plan = dup_plan.clone();
                // Async-signal-safe: only dup2 between fork and exec.
                unsafe {
                    cmd.pre_exec(move || {
                        for (src, dst) in &plan {
                            if nix::libc::dup2(*src, *dst) < 0 {
                                return Err(std::io::Error::last_os_error());
                            }
                        }
                        Ok(())
                    });
                }
            }

            let mut cmd = tokio::process::Command::from(cmd);
            let child = cmd.spawn().map_err(|err| {
                let spawn_err = classify_spawn_error(err);
                warn!(
                    program = %spec.program,
                    kind = ?spawn_err.kind,
                    "spawn failed"
                );
                spawn_err
            })?;
            drop(keepalive);

            let pid = child.id();
            if let Some(pid) = pid {
                info!(pid = %pid, program = %spec.program, "process spawned");
            }

            let ipc = match parent_ipc {
                Some(fd) => Some(into_ipc_stream(fd)?),
                None => None,
            };
            if ipc.is_some() {
                debug!(program = %spec.program, "ipc channel attached");
            }

            Ok(Box::new(UnixChild { child, pid, ipc }))
        }

        fn kill(&self, pid: u32, signo: i32) -> Result<(), SpawnError> {
            let target = NixPid::from_raw(pid as i32);
            let signal = if signo == 0 {
                None
            } else {
                Some(Signal::try_from(signo).map_err(|_| {
                    SpawnError::other("kill", format!("signal {signo} not deliverable"))
                })?)
            };

            signal::kill(target, signal).map_err(|errno| {
                debug!(pid = %pid, signo = %signo, errno = %errno, "kill failed");
                let kind = match errno {
                    Errno::ESRCH => SpawnErrorKind::NotFound,
                    Errno::EPERM | Errno::EACCES => SpawnErrorKind::AccessDenied,
                    _ => SpawnErrorKind::Other,
                };
                SpawnError::new(kind, "kill", std::io::Error::from_raw_os_error(errno as i32))
            })
        }

        fn platform_name(&self) -> &'static str {
            "unix"
        }
    }

    fn set_std_slot(cmd: &mut std::process::Command, slot: usize, stdio: Stdio) {
        match slot {
            0 => cmd.stdin(stdio),
            1 => cmd.stdout(stdio),
            _ => cmd.stderr(stdio),
        };
    }

    fn clone_fd(fd: i32) -> Result<OwnedFd, SpawnError> {
        // Duplicate so the child owns its copy independent of the caller's.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        borrowed
            .try_clone_to_owned()
            .map_err(|err| SpawnError::from_io("dup", err))
    }

    fn ipc_socketpair() -> Result<(OwnedFd, OwnedFd), SpawnError> {
        // Cloexec on both ends; the child-side copy that survives exec is the
        // Stdio slot / dup2 target, which clears the flag.
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|errno| {
            let kind = match errno {
                Errno::EMFILE => SpawnErrorKind::TooManyOpenFiles,
                Errno::ENFILE => SpawnErrorKind::SystemFileTableFull,
                _ => SpawnErrorKind::Other,
            };
            SpawnError::new(
                kind,
                "socketpair",
                std::io::Error::from_raw_os_error(errno as i32),
            )
        })
    }

    fn into_ipc_stream(fd: OwnedFd) -> Result<UnixStream, SpawnError> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream
            .set_nonblocking(true)
            .map_err(|err| SpawnError::from_io("socketpair", err))?;
        UnixStream::from_std(std_stream).map_err(|err| SpawnError::from_io("socketpair", err))
    }

    fn classify_spawn_error(err: std::io::Error) -> SpawnError {
        let kind = match err.raw_os_error().map(Errno::from_raw) {
            Some(Errno::EACCES) => SpawnErrorKind::AccessDenied,
            Some(Errno::EAGAIN) => SpawnErrorKind::ResourceUnavailable,
            Some(Errno::EMFILE) => SpawnErrorKind::TooManyOpenFiles,
            Some(Errno::ENFILE) => SpawnErrorKind::SystemFileTableFull,
            Some(Errno::ENOENT) => SpawnErrorKind::NotFound,
            _ => SpawnErrorKind::from_io(&err),
        };
        SpawnError::new(kind, "spawn", err)
    }
}

#[cfg(unix)]
pub use unix_impl::{UnixChild, UnixLauncher};

// Stubs so the crate still compiles as a workspace member off-Unix.
#[cfg(not(unix))]
pub struct UnixLauncher;

#[cfg(not(unix))]
impl UnixLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixLauncher {
    fn default() -> Self {
        Self::new()
    }
}

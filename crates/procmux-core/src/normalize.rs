//! Spawn-request validation and canonicalization, including cross-platform
//! shell wrapping. Fails before any OS resource is touched and never mutates
//! the caller's spec.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::{ProcessSpec, SerializationMode, Shell};
use crate::error::{ProcmuxError, Result};
use crate::stdio::{self, StdioDescriptor};

/// Target flavor for shell selection. Split out from `cfg` so both branches
/// stay unit-testable on any host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Canonicalized, launcher-facing spawn request. Immutable once built.
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    pub program: String,
    pub argv0: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub stdio: Vec<StdioDescriptor>,
    pub detached: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub windows_hide: bool,
    pub windows_verbatim_arguments: bool,
    pub serialization: SerializationMode,
}

/// Validate and canonicalize a spawn request for the current platform.
pub fn normalize(spec: &ProcessSpec) -> Result<ResolvedSpec> {
    normalize_for(spec, Platform::current())
}

/// Validate and canonicalize a spawn request for an explicit platform.
pub fn normalize_for(spec: &ProcessSpec, platform: Platform) -> Result<ResolvedSpec> {
    if spec.program.is_empty() {
        return Err(ProcmuxError::validation("program must not be empty"));
    }
    reject_nul("program", &spec.program)?;
    for arg in &spec.args {
        reject_nul("argument", arg)?;
    }
    if let Some(argv0) = &spec.argv0 {
        reject_nul("argv0", argv0)?;
    }
    for (key, value) in &spec.env {
        reject_nul("environment key", key)?;
        reject_nul("environment value", value)?;
    }

    let resolved_stdio = stdio::negotiate(&spec.stdio)?;

    let (program, args, forced_verbatim) = match &spec.shell {
        Shell::Off => (spec.program.clone(), spec.args.clone(), false),
        shell => wrap_shell(platform, shell, &spec.program, &spec.args),
    };

    let argv0 = spec.argv0.clone().unwrap_or_else(|| program.clone());

    Ok(ResolvedSpec {
        program,
        argv0,
        args,
        env: spec.env.clone(),
        working_directory: spec.working_directory.clone(),
        stdio: resolved_stdio,
        detached: spec.detached,
        uid: spec.uid,
        gid: spec.gid,
        windows_hide: spec.windows_hide,
        windows_verbatim_arguments: spec.windows_verbatim_arguments || forced_verbatim,
        serialization: spec.serialization,
    })
}

/// Join file and args into one command string and select the shell that will
/// interpret it. Returns (shell program, wrapped args, verbatim forced).
fn wrap_shell(
    platform: Platform,
    shell: &Shell,
    program: &str,
    args: &[String],
) -> (String, Vec<String>, bool) {
    let command = std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");

    match platform {
        Platform::Unix => {
            let shell_program = match shell {
                Shell::Program(path) => path.clone(),
                _ => "/bin/sh".to_string(),
            };
            (shell_program, vec!["-c".to_string(), command], false)
        }
        Platform::Windows => {
            let shell_program = match shell {
                Shell::Program(path) => path.clone(),
                _ => std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string()),
            };
            if is_cmd_shell(&shell_program) {
                // cmd.exe re-parses the whole line, so the command travels
                // quoted and arguments must not be re-escaped.
                let args = vec![
                    "/d".to_string(),
                    "/s".to_string(),
                    "/c".to_string(),
                    format!("\"{command}\""),
                ];
                (shell_program, args, true)
            } else {
                (shell_program, vec!["-c".to_string(), command], false)
            }
        }
    }
}

fn is_cmd_shell(shell_program: &str) -> bool {
    let basename = shell_program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(shell_program)
        .to_ascii_lowercase();
    basename == "cmd" || basename == "cmd.exe"
}

fn reject_nul(what: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        Err(ProcmuxError::validation(format!(
            "{what} must not contain a null byte"
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec::builder()
            .program(program)
            .args(args.iter().copied())
            .build()
            .unwrap()
    }

    #[test]
    fn direct_spawn_passes_through() {
        let resolved = normalize_for(&spec("echo", &["hi"]), Platform::Unix).unwrap();
        assert_eq!(resolved.program, "echo");
        assert_eq!(resolved.argv0, "echo");
        assert_eq!(resolved.args, vec!["hi"]);
        assert!(!resolved.windows_verbatim_arguments);
    }

    #[test]
    fn posix_shell_wrap() {
        let mut spec = spec("echo", &["hi"]);
        spec.shell = Shell::Default;
        let resolved = normalize_for(&spec, Platform::Unix).unwrap();
        assert_eq!(resolved.program, "/bin/sh");
        assert_eq!(resolved.args, vec!["-c", "echo hi"]);
        assert_eq!(resolved.argv0, "/bin/sh");
    }

    #[test]
    fn custom_posix_shell() {
        let mut spec = spec("ls", &[]);
        spec.shell = Shell::Program("/bin/bash".to_string());
        let resolved = normalize_for(&spec, Platform::Unix).unwrap();
        assert_eq!(resolved.program, "/bin/bash");
        assert_eq!(resolved.args, vec!["-c", "ls"]);
    }

    #[test]
    fn windows_cmd_wrap_forces_verbatim() {
        let mut spec = spec("dir", &["C:\\"]);
        spec.shell = Shell::Program("C:\\Windows\\System32\\cmd.exe".to_string());
        let resolved = normalize_for(&spec, Platform::Windows).unwrap();
        assert_eq!(
            resolved.args,
            vec!["/d", "/s", "/c", "\"dir C:\\\""]
        );
        assert!(resolved.windows_verbatim_arguments);
    }

    #[test]
    fn windows_non_cmd_shell_uses_dash_c() {
        let mut spec = spec("ls", &["-l"]);
        spec.shell = Shell::Program("pwsh".to_string());
        let resolved = normalize_for(&spec, Platform::Windows).unwrap();
        assert_eq!(resolved.args, vec!["-c", "ls -l"]);
        assert!(!resolved.windows_verbatim_arguments);
    }

    #[test]
    fn explicit_argv0_wins() {
        let mut spec = spec("/bin/busybox", &["ls"]);
        spec.argv0 = Some("busybox-ls".to_string());
        let resolved = normalize_for(&spec, Platform::Unix).unwrap();
        assert_eq!(resolved.argv0, "busybox-ls");
    }

    #[test]
    fn null_bytes_are_rejected() {
        assert!(matches!(
            normalize_for(&spec("ec\0ho", &[]), Platform::Unix),
            Err(ProcmuxError::Validation(_))
        ));
        assert!(matches!(
            normalize_for(&spec("echo", &["h\0i"]), Platform::Unix),
            Err(ProcmuxError::Validation(_))
        ));
        let mut bad_env = spec("echo", &[]);
        bad_env.env.insert("K".into(), "v\0".into());
        assert!(matches!(
            normalize_for(&bad_env, Platform::Unix),
            Err(ProcmuxError::Validation(_))
        ));
    }

    #[test]
    fn empty_program_is_rejected() {
        assert!(matches!(
            normalize_for(&spec("", &[]), Platform::Unix),
            Err(ProcmuxError::Validation(_))
        ));
    }

    #[test]
    fn stdio_errors_surface_before_launch() {
        let mut spec = spec("echo", &[]);
        spec.stdio = crate::stdio::StdioSpec::entries(["ipc", "ipc"]);
        assert!(matches!(
            normalize_for(&spec, Platform::Unix),
            Err(ProcmuxError::DuplicateIpc)
        ));
    }
}

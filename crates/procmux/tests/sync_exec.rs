#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use procmux::{
    ProcessSpec, ProcmuxError, StdioSpec, SyncOptions, exec_file_sync, exec_sync, spawn_sync,
};

#[test]
fn spawn_sync_reports_status_and_streams() -> Result<()> {
    let spec = ProcessSpec::builder()
        .program("sh")
        .args(["-c", "printf out; printf err >&2"])
        .build()?;
    let output = spawn_sync(&spec, &SyncOptions::default())?;
    assert!(output.pid.is_some());
    assert_eq!(output.status, Some(0));
    assert!(output.signal.is_none());
    assert_eq!(output.stdout, b"out");
    assert_eq!(output.stderr, b"err");
    assert!(output.error.is_none());
    assert!(!output.exited_due_to_timeout);
    assert!(!output.exited_due_to_max_buffer);
    Ok(())
}

#[test]
fn spawn_sync_feeds_input_to_stdin() -> Result<()> {
    let spec = ProcessSpec::builder().program("cat").build()?;
    let options = SyncOptions::builder().input(b"hello".to_vec()).build()?;
    let output = spawn_sync(&spec, &options)?;
    assert_eq!(output.stdout, b"hello");
    Ok(())
}

// Input larger than any pipe buffer; the child cannot echo it back until the
// reader threads drain stdout, so feeding and reading must overlap.
#[test]
fn spawn_sync_large_input_round_trips_without_stalling() -> Result<()> {
    let input = vec![b'x'; 256 * 1024];
    let spec = ProcessSpec::builder().program("cat").build()?;
    let options = SyncOptions::builder()
        .input(input.clone())
        .timeout(Duration::from_secs(10))
        .build()?;
    let output = spawn_sync(&spec, &options)?;
    assert!(!output.exited_due_to_timeout);
    assert_eq!(output.stdout.len(), input.len());
    assert_eq!(output.stdout, input);
    Ok(())
}

#[test]
fn spawn_sync_timeout_kills_and_flags() -> Result<()> {
    let spec = ProcessSpec::builder()
        .program("sleep")
        .args(["5"])
        .stdio(StdioSpec::ignore())
        .build()?;
    let options = SyncOptions::builder()
        .timeout(Duration::from_millis(50))
        .build()?;
    let output = spawn_sync(&spec, &options)?;
    assert!(output.exited_due_to_timeout);
    assert!(matches!(output.error, Some(ProcmuxError::Timeout { .. })));
    assert_eq!(output.signal.as_deref(), Some("SIGTERM"));
    Ok(())
}

#[test]
fn spawn_sync_max_buffer_truncates_and_flags() -> Result<()> {
    let spec = ProcessSpec::builder()
        .program("sh")
        .args(["-c", "printf 0123456789abcdef; exec sleep 5"])
        .build()?;
    let options = SyncOptions::builder().max_buffer(8usize).build()?;
    let output = spawn_sync(&spec, &options)?;
    assert!(output.exited_due_to_max_buffer);
    assert_eq!(output.stdout, b"01234567");
    assert!(matches!(
        output.error,
        Some(ProcmuxError::BufferLimit { stream: "stdout" })
    ));
    Ok(())
}

#[test]
fn spawn_sync_rejects_ipc_slots() {
    let mut spec = ProcessSpec::new("cat");
    spec.stdio = StdioSpec::entries(["pipe", "pipe", "pipe", "ipc"]);
    assert!(matches!(
        spawn_sync(&spec, &SyncOptions::default()),
        Err(ProcmuxError::Validation(_))
    ));
}

#[test]
fn spawn_sync_missing_program_reports_error_in_result() -> Result<()> {
    let spec = ProcessSpec::builder()
        .program("/definitely/not/a/binary")
        .stdio(StdioSpec::ignore())
        .build()?;
    let output = spawn_sync(&spec, &SyncOptions::default())?;
    assert!(output.pid.is_none());
    assert!(output.status.is_none());
    assert!(matches!(output.error, Some(ProcmuxError::Spawn(_))));
    Ok(())
}

#[test]
fn spawn_sync_rejects_unknown_kill_signal_before_launch() -> Result<()> {
    let spec = ProcessSpec::builder()
        .program("sleep")
        .args(["5"])
        .stdio(StdioSpec::ignore())
        .build()?;
    let options = SyncOptions::builder().kill_signal("SIGWHAT").build()?;
    assert!(matches!(
        spawn_sync(&spec, &options),
        Err(ProcmuxError::UnknownSignal(_))
    ));
    Ok(())
}

#[test]
fn exec_sync_returns_stdout_bytes() -> Result<()> {
    let output = exec_sync("printf hello", &SyncOptions::default())?;
    assert_eq!(output, b"hello");
    Ok(())
}

#[test]
fn exec_sync_raises_command_failed() {
    let err = exec_sync("printf bad >&2; exit 2", &SyncOptions::default()).unwrap_err();
    match err {
        ProcmuxError::CommandFailed { code, stderr, .. } => {
            assert_eq!(code, Some(2));
            assert!(stderr.contains("bad"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn exec_file_sync_bypasses_the_shell() -> Result<()> {
    let output = exec_file_sync("printf", &["%s", "direct"], &SyncOptions::default())?;
    assert_eq!(output, b"direct");
    Ok(())
}

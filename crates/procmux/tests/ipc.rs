#![cfg(unix)]

use procmux::{
    IpcError, ProcessEvent, ProcessSpec, ProcmuxError, SerializationMode, StdioSpec,
};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn echo_spec(serialization: SerializationMode) -> ProcessSpec {
    // The child's end of the channel lands on fd 3; cat echoes it verbatim.
    ProcessSpec::builder()
        .program("sh")
        .args(["-c", "cat <&3 >&3"])
        .stdio(StdioSpec::entries(["ignore", "ignore", "ignore", "ipc"]))
        .serialization(serialization)
        .build()
        .unwrap()
}

#[tokio::test]
async fn json_messages_round_trip() {
    init_tracing();
    let mut child = procmux::spawn(echo_spec(SerializationMode::Json))
        .await
        .unwrap();
    assert!(child.ipc().is_some());
    let mut events = child.events().unwrap();

    child.send(&json!({"ping": 1})).await.unwrap();
    loop {
        match events.recv().await.unwrap() {
            ProcessEvent::Message(value) => {
                assert_eq!(value, json!({"ping": 1}));
                break;
            }
            ProcessEvent::Error(err) => panic!("unexpected error: {err}"),
            _ => {}
        }
    }

    child.disconnect().await.unwrap();
    let mut saw_disconnect = false;
    loop {
        match events.recv().await.unwrap() {
            ProcessEvent::Disconnect => saw_disconnect = true,
            ProcessEvent::Close { code, .. } => {
                assert_eq!(code, Some(0));
                break;
            }
            _ => {}
        }
    }
    assert!(saw_disconnect);

    let err = child.send(&json!({"again": true})).await.unwrap_err();
    assert!(matches!(err, ProcmuxError::Ipc(IpcError::ChannelClosed)));
}

#[tokio::test]
async fn advanced_frames_carry_embedded_newlines() {
    init_tracing();
    let mut child = procmux::spawn(echo_spec(SerializationMode::Advanced))
        .await
        .unwrap();
    let mut events = child.events().unwrap();

    let message = json!({"text": "line one\nline two"});
    child.send(&message).await.unwrap();
    loop {
        match events.recv().await.unwrap() {
            ProcessEvent::Message(value) => {
                assert_eq!(value, message);
                break;
            }
            ProcessEvent::Error(err) => panic!("unexpected error: {err}"),
            _ => {}
        }
    }
    child.disconnect().await.unwrap();
}

#[tokio::test]
async fn child_exit_tears_down_the_channel() {
    init_tracing();
    let spec = ProcessSpec::builder()
        .program("sh")
        .args(["-c", "exit 0"])
        .stdio(StdioSpec::entries(["ignore", "ignore", "ignore", "ipc"]))
        .build()
        .unwrap();
    let mut child = procmux::spawn(spec).await.unwrap();
    let mut events = child.events().unwrap();

    let mut saw_disconnect = false;
    let mut saw_close = false;
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Disconnect => saw_disconnect = true,
            ProcessEvent::Close { .. } => saw_close = true,
            _ => {}
        }
        if saw_disconnect && saw_close {
            break;
        }
    }
    assert!(saw_disconnect);
    assert!(saw_close);

    assert!(matches!(
        child.send(&json!({})).await,
        Err(ProcmuxError::Ipc(IpcError::ChannelClosed))
    ));
    assert!(matches!(
        child.disconnect().await,
        Err(ProcmuxError::Ipc(IpcError::NotConnected))
    ));
}

#[tokio::test]
async fn send_without_channel_reports_closed() {
    init_tracing();
    let spec = ProcessSpec::builder()
        .program("sh")
        .args(["-c", "exit 0"])
        .stdio(StdioSpec::ignore())
        .build()
        .unwrap();
    let child = procmux::spawn(spec).await.unwrap();
    assert!(child.ipc().is_none());
    assert!(matches!(
        child.send(&json!({})).await,
        Err(ProcmuxError::Ipc(IpcError::ChannelClosed))
    ));
}

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use toolbridge::ErrorKind;
use toolbridge::connector::{Connector, ConnectorState, Timeouts, TransportFactory};
use toolbridge::error::TransportError;
use toolbridge::mcp::config::{McpServerEntry, TransportSettings};
use toolbridge::mcp::transport::{ProcessConfig, ProcessTransport, Transport};

fn sh(script: &str) -> ProcessConfig {
    ProcessConfig::new("test", "sh").args(["-c", script])
}

#[tokio::test]
async fn test_frames_round_trip_through_cat() {
    let transport = ProcessTransport::new(ProcessConfig::new("cat", "cat"));
    transport.connect().await.unwrap();
    let mut frames = transport.receive().unwrap();

    transport.send(r#"{"jsonrpc":"2.0","method":"a"}"#.into()).await.unwrap();
    transport.send(r#"{"jsonrpc":"2.0","method":"b"}"#.into()).await.unwrap();

    assert_eq!(
        frames.next().await.unwrap().unwrap(),
        r#"{"jsonrpc":"2.0","method":"a"}"#
    );
    assert_eq!(
        frames.next().await.unwrap().unwrap(),
        r#"{"jsonrpc":"2.0","method":"b"}"#
    );
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_embedded_newlines_stay_in_one_frame() {
    let transport = ProcessTransport::new(ProcessConfig::new("cat", "cat"));
    transport.connect().await.unwrap();
    let mut frames = transport.receive().unwrap();

    transport.send("{\"a\":\n1}".into()).await.unwrap();
    assert_eq!(frames.next().await.unwrap().unwrap(), "{\"a\":1}");
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_missing_executable_fails_to_spawn() {
    let transport = ProcessTransport::new(ProcessConfig::new(
        "ghost",
        "/nonexistent/toolbridge-provider",
    ));

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::Spawn { .. }), "{err:?}");
}

#[tokio::test]
async fn test_immediate_exit_fails_connect() {
    let transport = ProcessTransport::new(sh("exit 3").spawn_grace(Duration::from_millis(300)));

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, TransportError::ExitedEarly { .. }), "{err:?}");
    assert!(!transport.is_alive());
}

#[tokio::test]
async fn test_stderr_is_not_protocol_data() {
    let transport = ProcessTransport::new(sh(
        r#"echo "starting up" >&2; echo '{"jsonrpc":"2.0","method":"ready"}'; sleep 5"#,
    ));
    transport.connect().await.unwrap();
    let mut frames = transport.receive().unwrap();

    assert_eq!(
        frames.next().await.unwrap().unwrap(),
        r#"{"jsonrpc":"2.0","method":"ready"}"#
    );
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_oversized_frame_ends_stream() {
    let transport = ProcessTransport::new(
        sh("head -c 4096 /dev/zero | tr '\\0' 'x'; echo; sleep 0.2; echo '{}'; echo '{}'; sleep 5")
            .max_frame_bytes(1024),
    );
    transport.connect().await.unwrap();
    let mut frames = transport.receive().unwrap();

    let item = frames.next().await.unwrap();
    assert_eq!(item, Err(TransportError::FrameTooLarge { limit: 1024 }));
    assert!(frames.next().await.is_none());

    // Later output is discarded, not refused: the provider keeps running.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(transport.is_alive());
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stream_ends_when_process_exits() {
    let transport = ProcessTransport::new(sh("sleep 0.5; echo '{}'"));
    transport.connect().await.unwrap();
    let mut frames = transport.receive().unwrap();

    assert_eq!(frames.next().await.unwrap().unwrap(), "{}");
    assert!(frames.next().await.is_none());
}

#[tokio::test]
async fn test_receive_is_take_once() {
    let transport = ProcessTransport::new(ProcessConfig::new("cat", "cat"));
    assert_eq!(transport.receive().err(), Some(TransportError::Closed));

    transport.connect().await.unwrap();
    let _frames = transport.receive().unwrap();
    assert_eq!(transport.receive().err(), Some(TransportError::StreamTaken));
    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let transport = ProcessTransport::new(ProcessConfig::new("cat", "cat"));
    transport.disconnect().await.unwrap();

    transport.connect().await.unwrap();
    assert!(transport.is_alive());
    transport.disconnect().await.unwrap();
    transport.disconnect().await.unwrap();

    assert!(!transport.is_alive());
    assert_eq!(
        transport.send("{}".into()).await,
        Err(TransportError::Closed)
    );
}

#[tokio::test]
async fn test_connector_over_missing_executable_never_connects() {
    let entry: McpServerEntry =
        serde_json::from_value(json!({"command": "/nonexistent/toolbridge-provider"})).unwrap();
    let factory: TransportFactory =
        Arc::new(move || entry.build_transport("ghost", TransportSettings::default()));
    let connector = Connector::new("ghost", "Ghost", factory, Timeouts::default());
    let mut states = connector.subscribe_state();

    let err = connector.connect().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(matches!(connector.state(), ConnectorState::Error(_)));
    assert!(connector.tools().is_empty());
    assert!(!states.borrow_and_update().is_connected());
}

//! Subprocess transport against a small shell-script endpoint.
#![cfg(unix)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};

use tokio_util::sync::CancellationToken;
use tool_relay::Error;
use tool_relay::mcp::stdio::StdioTransport;
use tool_relay::mcp::{
    CallContext, ConnectionManager, ConnectionState, EndpointConfig, EndpointConnector,
    ManagerSettings, ReconnectPolicy, Transport,
};

/// Answers `initialize`, `tools/list`, `tools/call` and
/// `resources/subscribe`; exits when asked to call `quit` and never
/// answers a call to `hang`.
const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0.1"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ping","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"name":"quit"'*)
      exit 0 ;;
    *'"name":"hang"'*)
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
    *'"method":"resources/subscribe"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      printf '{"jsonrpc":"2.0","method":"notifications/resources/updated","params":{"uri":"file:///tmp/x"}}\n' ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id" ;;
  esac
done
"#;

fn script_args() -> Vec<String> {
    vec!["-c".to_string(), FAKE_SERVER.to_string()]
}

fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_handshake_list_and_call() {
    let transport = StdioTransport::spawn(
        "fake",
        "sh",
        &script_args(),
        &HashMap::new(),
        Duration::from_secs(5),
    )
    .unwrap();

    let init = transport.initialize(&ctx()).await.unwrap();
    assert_eq!(init.protocol_version, "2024-11-05");
    assert_eq!(init.server_info.map(|s| s.name).as_deref(), Some("fake"));

    let ops = transport.list_operations(&ctx()).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].name, "ping");

    let result = transport.call("ping", None, &ctx()).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.content, vec![json!({ "type": "text", "text": "pong" })]);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_process_exit_is_a_connection_error() {
    let transport = StdioTransport::spawn(
        "fake",
        "sh",
        &script_args(),
        &HashMap::new(),
        Duration::from_secs(5),
    )
    .unwrap();
    transport.initialize(&ctx()).await.unwrap();

    let err = transport.call("quit", None, &ctx()).await.unwrap_err();
    assert!(err.is_connection(), "{err}");

    // Later requests fail fast.
    let err = transport.call("ping", None, &ctx()).await.unwrap_err();
    assert!(err.is_connection(), "{err}");
}

#[tokio::test]
async fn test_spawn_failure_is_a_connection_error() {
    let err = StdioTransport::spawn(
        "missing",
        "/nonexistent/endpoint-binary",
        &[],
        &HashMap::new(),
        Duration::from_secs(1),
    )
    .unwrap_err();
    assert!(err.is_connection(), "{err}");
}

#[tokio::test]
async fn test_manager_respawns_after_exit() {
    let config = EndpointConfig::subprocess("fake", "sh", script_args());
    let manager = ConnectionManager::new(
        "fake",
        Arc::new(EndpointConnector::new(config)),
        ManagerSettings {
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                backoff_unit: Duration::from_millis(20),
            },
            ..ManagerSettings::default()
        },
    );
    manager.start().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Ready);

    let result = manager.invoke("ping", None, &ctx()).await.unwrap();
    assert_eq!(result.content[0]["text"], "pong");

    let err = manager.invoke("quit", None, &ctx()).await.unwrap_err();
    assert!(err.is_connection(), "{err}");

    let mut state = manager.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Ready),
    )
    .await
    .expect("respawn timed out")
    .unwrap();

    let result = manager.invoke("ping", None, &ctx()).await.unwrap();
    assert_eq!(result.content[0]["text"], "pong");

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_subscription_notifications_reach_stream() {
    let config = EndpointConfig::subprocess("fake", "sh", script_args());
    let manager = ConnectionManager::new(
        "fake",
        Arc::new(EndpointConnector::new(config)),
        ManagerSettings::default(),
    );
    manager.start().await.unwrap();

    let mut notifications = manager.subscribe("file:///tmp/x", &ctx()).await.unwrap();
    let notification = tokio::time::timeout(Duration::from_secs(5), notifications.next())
        .await
        .expect("no notification")
        .unwrap();

    assert_eq!(notification.method, "notifications/resources/updated");
    assert_eq!(
        notification.params.as_ref().and_then(|p| p.get("uri")).and_then(Value::as_str),
        Some("file:///tmp/x")
    );

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_call_keeps_connection() {
    let config = EndpointConfig::subprocess("fake", "sh", script_args());
    let manager = ConnectionManager::new(
        "fake",
        Arc::new(EndpointConnector::new(config)),
        ManagerSettings::default(),
    );
    manager.start().await.unwrap();

    let cancel = CancellationToken::new();
    let call_ctx = ctx().cancelled_by(cancel.clone());
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let err = manager.invoke("hang", None, &call_ctx).await.unwrap_err();
    trigger.await.unwrap();

    assert!(matches!(err, Error::Cancelled), "{err}");
    assert!(!err.is_connection());
    assert_eq!(manager.pending_reconnects(), 0);
    assert_eq!(manager.state(), ConnectionState::Ready);

    // The endpoint is still usable.
    let result = manager.invoke("ping", None, &ctx()).await.unwrap();
    assert_eq!(result.content[0]["text"], "pong");

    manager.close().await.unwrap();
}

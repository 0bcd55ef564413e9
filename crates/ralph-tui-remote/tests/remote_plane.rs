//! End-to-end tests: real WebSocket server and client in one process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use ralph_tui_core::{EngineEvent, Task};
use ralph_tui_engine::testing::{MemoryTracker, ScriptedAgent, ScriptedRun};
use ralph_tui_engine::{Engine, EngineConfig};
use ralph_tui_remote::{
    error_codes, ClientConfig, ClientEvent, ConfigPaths, ConfigScope, Message, Payload,
    RemoteClient, RemoteServer, ServerConfig, TokenStore, TokenType,
};

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    tokens: Arc<TokenStore>,
    config_paths: ConfigPaths,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.url(), self.tokens.server_token().token)
    }
}

fn test_engine(tasks: Vec<Task>, runs: Vec<ScriptedRun>) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let tracker = MemoryTracker::new(tasks);
    let agent = ScriptedAgent::new(runs, Arc::clone(&tracker));
    let engine = Engine::new(
        agent,
        tracker,
        EngineConfig::new(dir.path().to_path_buf()),
    );
    (engine, dir)
}

async fn start_server(
    engine: Engine,
    tweak: impl FnOnce(&mut ServerConfig),
) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let cwd = dir.path().join("project");
    std::fs::create_dir_all(&cwd).unwrap();
    let config_paths = ConfigPaths::resolve(cwd, dir.path());

    let mut config = ServerConfig::new(config_paths.clone());
    tweak(&mut config);

    let tokens = Arc::new(TokenStore::in_memory());
    let server = RemoteServer::new(engine, Arc::clone(&tokens), config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move { server.serve_on(listener, shutdown_rx).await });

    TestServer {
        addr,
        tokens,
        config_paths,
        shutdown,
        _dir: dir,
    }
}

async fn next_event(events: &mut tokio::sync::mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client event stream ended")
}

async fn wait_for_connected(events: &mut tokio::sync::mpsc::Receiver<ClientEvent>) {
    loop {
        if matches!(next_event(events).await, ClientEvent::Connected) {
            return;
        }
    }
}

#[tokio::test]
async fn auth_state_and_tasks_roundtrip() {
    let (engine, _cwd) = test_engine(vec![Task::new("a", "Task A")], vec![]);
    let server = start_server(engine, |_| {}).await;

    let (client, mut events) = RemoteClient::connect(server.client_config());
    wait_for_connected(&mut events).await;

    let response = client.request(Payload::GetState).await.unwrap();
    match response.payload {
        Payload::StateResponse { state } => assert_eq!(state.max_iterations, 0),
        other => panic!("unexpected payload: {other:?}"),
    }

    let response = client.request(Payload::GetTasks).await.unwrap();
    match response.payload {
        Payload::TasksResponse { tasks } => {
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].id, "a");
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    let response = client.request(Payload::GetPromptPreview).await.unwrap();
    match response.payload {
        Payload::PromptPreviewResponse { task, prompt } => {
            assert_eq!(task.unwrap().id, "a");
            assert!(prompt.unwrap().contains("Task A"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    client.disconnect().await;
    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn heartbeat_measures_latency() {
    let (engine, _cwd) = test_engine(vec![], vec![]);
    let server = start_server(engine, |_| {}).await;

    let mut config = server.client_config();
    config.heartbeat_interval = Duration::from_millis(50);
    let (client, mut events) = RemoteClient::connect(config);
    wait_for_connected(&mut events).await;

    loop {
        if matches!(next_event(&mut events).await, ClientEvent::Latency { .. }) {
            break;
        }
    }

    client.disconnect().await;
    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn invalid_token_is_rejected_without_reconnect() {
    let (engine, _cwd) = test_engine(vec![], vec![]);
    let server = start_server(engine, |_| {}).await;

    let mut config = server.client_config();
    config.server_token = "wrong".to_string();
    let (client, mut events) = RemoteClient::connect(config);

    match next_event(&mut events).await {
        ClientEvent::AuthRejected { error } => assert!(error.contains("invalid")),
        other => panic!("unexpected event: {other:?}"),
    }

    // The client gave up for good: the event stream closes instead of
    // scheduling reconnect attempts.
    let end = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert!(end.is_none());
    assert_eq!(
        client.state(),
        ralph_tui_remote::ConnectionState::Disconnected
    );

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn subscription_streams_engine_events_in_order() {
    let (engine, _cwd) = test_engine(
        vec![
            Task::new("a", "Task A").with_priority(2),
            Task::new("b", "Task B").with_priority(1),
        ],
        vec![ScriptedRun::success(), ScriptedRun::success()],
    );
    let server = start_server(engine.clone(), |_| {}).await;

    let (client, mut events) = RemoteClient::connect(server.client_config());
    wait_for_connected(&mut events).await;

    client.subscribe().await.unwrap();
    // Round-trip a request so the subscription is in place before the
    // engine starts emitting.
    client.request(Payload::GetState).await.unwrap();

    engine.start().unwrap();

    let mut engine_events = Vec::new();
    loop {
        if let ClientEvent::EngineEvent(event) = next_event(&mut events).await {
            let stopped = matches!(event, EngineEvent::EngineStopped { .. });
            engine_events.push(event);
            if stopped {
                break;
            }
        }
    }

    assert!(matches!(engine_events[0], EngineEvent::EngineStarted));
    let iterations: Vec<u32> = engine_events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::IterationStarted { iteration, .. } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert_eq!(iterations, vec![1, 2]);

    client.disconnect().await;
    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn control_commands_report_operation_results() {
    let (engine, _cwd) = test_engine(vec![Task::new("a", "Task A")], vec![]);
    let server = start_server(engine.clone(), |_| {}).await;

    let (client, mut events) = RemoteClient::connect(server.client_config());
    wait_for_connected(&mut events).await;

    // Pausing an idle engine is an invalid state, not a dead connection.
    let response = client.request(Payload::Pause).await.unwrap();
    match response.payload {
        Payload::OperationResult {
            operation,
            success,
            error,
        } => {
            assert_eq!(operation, "pause");
            assert!(!success);
            assert!(error.unwrap().contains("invalid"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    let response = client
        .request(Payload::AddIterations { count: 2 })
        .await
        .unwrap();
    match response.payload {
        Payload::OperationResult { success, .. } => assert!(success),
        other => panic!("unexpected payload: {other:?}"),
    }
    assert_eq!(engine.state().max_iterations, 2);

    client.disconnect().await;
    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn config_push_with_overwrite_backs_up_previous_content() {
    let (engine, _cwd) = test_engine(vec![], vec![]);
    let server = start_server(engine, |_| {}).await;

    let (client, mut events) = RemoteClient::connect(server.client_config());
    wait_for_connected(&mut events).await;

    let push = |content: &str, overwrite: bool| Payload::PushConfig {
        scope: ConfigScope::Global,
        config_content: content.to_string(),
        overwrite,
    };

    // First push creates the file.
    let response = client.request(push("maxIterations = 1", false)).await.unwrap();
    match response.payload {
        Payload::PushConfigResponse { success, backup_path, .. } => {
            assert!(success);
            assert!(backup_path.is_none());
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // A second push without overwrite is refused.
    let response = client.request(push("maxIterations = 2", false)).await.unwrap();
    match response.payload {
        Payload::PushConfigResponse { success, error, .. } => {
            assert!(!success);
            assert!(error.unwrap().contains("overwrite=true"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // Overwrite succeeds, keeps a backup, and a counter-only change
    // does not require a restart.
    let response = client.request(push("maxIterations = 2", true)).await.unwrap();
    match response.payload {
        Payload::PushConfigResponse {
            success,
            config_path,
            backup_path,
            requires_restart,
            migration_triggered,
            ..
        } => {
            assert!(success);
            assert!(!requires_restart);
            assert!(!migration_triggered);
            let target = config_path.unwrap();
            assert_eq!(
                std::fs::read_to_string(&target).unwrap(),
                "maxIterations = 2"
            );
            assert_eq!(
                std::fs::read_to_string(backup_path.unwrap()).unwrap(),
                "maxIterations = 1"
            );
            assert_eq!(target, server.config_paths.global.display().to_string());
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // Invalid TOML is refused outright.
    let response = client.request(push("not [ toml", true)).await.unwrap();
    match response.payload {
        Payload::PushConfigResponse { success, error, .. } => {
            assert!(!success);
            assert!(error.unwrap().starts_with("Invalid TOML"));
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    client.disconnect().await;
    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn unknown_message_type_yields_error_reply() {
    let (engine, _cwd) = test_engine(vec![], vec![]);
    let server = start_server(engine, |_| {}).await;

    let (mut ws, _) = connect_async(server.url()).await.unwrap();
    let auth = Message::new(Payload::Auth {
        token: server.tokens.server_token().token,
        token_type: TokenType::Server,
    });
    ws.send(WsMessage::Text(auth.to_json().unwrap().into()))
        .await
        .unwrap();

    // Consume the auth response.
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap();
        if let Ok(WsMessage::Text(text)) = frame {
            let message = Message::parse(&text).unwrap();
            if matches!(message.payload, Payload::AuthResponse { success: true, .. }) {
                break;
            }
        }
    }

    ws.send(WsMessage::Text(
        r#"{"type":"frobnicate","id":"e58ed763-928c-4155-bee9-fdbaaadc15f3","timestamp":"2026-01-01T00:00:00Z"}"#
            .into(),
    ))
    .await
    .unwrap();

    loop {
        let frame = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap();
        if let Ok(WsMessage::Text(text)) = frame {
            if let Ok(message) = Message::parse(&text) {
                if let Payload::Error { code, .. } = message.payload {
                    assert_eq!(code, error_codes::UNKNOWN_MESSAGE);
                    break;
                }
            }
        }
    }

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn silent_socket_is_closed_after_auth_timeout() {
    let (engine, _cwd) = test_engine(vec![], vec![]);
    let server = start_server(engine, |config| {
        config.auth_timeout = Duration::from_millis(200);
    })
    .await;

    let (mut ws, _) = connect_async(server.url()).await.unwrap();

    // Never send auth; the server must push AUTH_TIMEOUT and close.
    let mut saw_timeout_error = false;
    loop {
        match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(WsMessage::Text(text))) => {
                if let Ok(message) = Message::parse(&text) {
                    if let Payload::Error { code, .. } = message.payload {
                        assert_eq!(code, error_codes::AUTH_TIMEOUT);
                        saw_timeout_error = true;
                    }
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(_)) => break,
        }
    }
    assert!(saw_timeout_error);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn reconnect_gives_up_after_max_retries() {
    // Grab a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = ClientConfig::new(format!("ws://{addr}/ws"), "token");
    config.initial_delay = Duration::from_millis(10);
    config.max_delay = Duration::from_millis(40);
    config.max_retries = 3;
    config.silent_retry_threshold = 1;

    let (_client, mut events) = RemoteClient::connect(config);

    // Attempt 1 is silent; 2 and 3 are visible; then the client gives up.
    match next_event(&mut events).await {
        ClientEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, 2),
        other => panic!("unexpected event: {other:?}"),
    }
    match next_event(&mut events).await {
        ClientEvent::Reconnecting { attempt, .. } => assert_eq!(attempt, 3),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, ClientEvent::Failed));
}

//! WebSocket client for the remote control plane.
//!
//! One logical connection per remote: connect, authenticate with the
//! server token, heartbeat, refresh the connection token before it
//! expires, and reconnect with exponential backoff on unexpected
//! closes. A user-initiated disconnect never reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use ralph_tui_core::{EngineEvent, EngineStatus};

use crate::protocol::{Message, Payload, TokenType};

/// Reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Retries below this threshold stay silent so brief blips do not
/// surface in the UI.
pub const SILENT_RETRY_THRESHOLD: u32 = 3;

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client task is gone")]
    NotConnected,
    #[error("connection closed before the response arrived")]
    ConnectionClosed,
}

/// Lifecycle state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the embedding UI.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Authenticated and ready.
    Connected,
    /// Connection ended; reconnection may follow.
    Disconnected { reason: String },
    /// A visible reconnect attempt is scheduled.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Gave up after the retry budget.
    Failed,
    /// The server rejected our credentials; no reconnection.
    AuthRejected { error: String },
    /// A forwarded engine event.
    EngineEvent(EngineEvent),
    /// Periodic server health.
    ServerStatus {
        engine_status: EngineStatus,
        uptime_seconds: u64,
        connections: u32,
    },
    /// Measured heartbeat round-trip.
    Latency { ms: u64 },
    /// Out-of-band error from the server.
    ProtocolError { code: String, message: String },
}

/// Client configuration; defaults match the protocol contract.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL, e.g. `ws://host:7890/ws`.
    pub url: String,
    /// The long-lived server token.
    pub server_token: String,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    pub silent_retry_threshold: u32,
    pub heartbeat_interval: Duration,
    pub auth_timeout: Duration,
    /// Refresh the connection token when less than this remains.
    pub refresh_threshold: Duration,
}

impl ClientConfig {
    /// Contract defaults: 1s initial delay doubling to 30s, 10
    /// retries, 3 silent, 15s heartbeat, 1h refresh threshold.
    #[must_use]
    pub fn new(url: impl Into<String>, server_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            server_token: server_token.into(),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            silent_retry_threshold: SILENT_RETRY_THRESHOLD,
            heartbeat_interval: Duration::from_secs(15),
            auth_timeout: Duration::from_secs(10),
            refresh_threshold: Duration::from_secs(60 * 60),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(initial_delay * multiplier^(attempt-1), max_delay)`.
#[must_use]
pub fn backoff_delay(config: &ClientConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let factor = config.multiplier.powi(exponent as i32);
    config
        .initial_delay
        .mul_f64(factor)
        .min(config.max_delay)
}

enum ClientCommand {
    Send(Message),
    Request {
        message: Message,
        reply: oneshot::Sender<Message>,
    },
    Disconnect,
}

/// Handle to the client task.
#[derive(Clone)]
pub struct RemoteClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
    state: Arc<Mutex<ConnectionState>>,
}

impl RemoteClient {
    /// Start the client; connection runs in the background.
    ///
    /// Returns the handle and the stream of [`ClientEvent`]s.
    #[must_use]
    pub fn connect(config: ClientConfig) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::channel(256);
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        tokio::spawn(client_task(
            config,
            cmd_rx,
            events_tx,
            Arc::clone(&state),
        ));
        (Self { cmd_tx, state }, events_rx)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a request and await the correlated response.
    ///
    /// # Errors
    /// Returns error if the connection drops before the reply.
    pub async fn request(&self, payload: Payload) -> Result<Message, ClientError> {
        let message = Message::new(payload);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Request {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        reply_rx.await.map_err(|_| ClientError::ConnectionClosed)
    }

    /// Send a message without waiting for a response.
    ///
    /// # Errors
    /// Returns error if the client task is gone.
    pub async fn send(&self, payload: Payload) -> Result<(), ClientError> {
        self.cmd_tx
            .send(ClientCommand::Send(Message::new(payload)))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Opt into the engine event stream.
    ///
    /// # Errors
    /// Returns error if the client task is gone.
    pub async fn subscribe(&self) -> Result<(), ClientError> {
        self.send(Payload::Subscribe).await
    }

    /// Opt out of the engine event stream.
    ///
    /// # Errors
    /// Returns error if the client task is gone.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        self.send(Payload::Unsubscribe).await
    }

    /// Close the connection for good; never reconnects.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ConnectionInfo {
    /// When the connection token the server holds for us expires.
    expires_at: Option<DateTime<Utc>>,
}

enum ConnectOutcome {
    Ready(Box<WsStream>, ConnectionInfo),
    AuthRejected(String),
    Transport(String),
}

enum SessionEnd {
    Intentional,
    HandleDropped,
    Lost(String),
}

fn set_state(state: &Arc<Mutex<ConnectionState>>, value: ConnectionState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

async fn client_task(
    config: ClientConfig,
    mut cmd_rx: mpsc::Receiver<ClientCommand>,
    events_tx: mpsc::Sender<ClientEvent>,
    state: Arc<Mutex<ConnectionState>>,
) {
    let mut attempt: u32 = 0;
    loop {
        match connect_and_auth(&config).await {
            ConnectOutcome::Ready(ws, info) => {
                attempt = 0;
                set_state(&state, ConnectionState::Connected);
                let _ = events_tx.send(ClientEvent::Connected).await;
                match session(&config, *ws, info, &mut cmd_rx, &events_tx).await {
                    SessionEnd::Intentional => {
                        set_state(&state, ConnectionState::Disconnected);
                        let _ = events_tx
                            .send(ClientEvent::Disconnected {
                                reason: "disconnected by user".to_string(),
                            })
                            .await;
                        return;
                    }
                    SessionEnd::HandleDropped => {
                        set_state(&state, ConnectionState::Disconnected);
                        return;
                    }
                    SessionEnd::Lost(reason) => {
                        let _ = events_tx.send(ClientEvent::Disconnected { reason }).await;
                    }
                }
            }
            ConnectOutcome::AuthRejected(error) => {
                set_state(&state, ConnectionState::Disconnected);
                let _ = events_tx.send(ClientEvent::AuthRejected { error }).await;
                return;
            }
            ConnectOutcome::Transport(error) => {
                tracing::debug!("connect attempt failed: {error}");
            }
        }

        // Schedule the next attempt.
        attempt += 1;
        if attempt > config.max_retries {
            set_state(&state, ConnectionState::Disconnected);
            let _ = events_tx.send(ClientEvent::Failed).await;
            return;
        }
        let delay = backoff_delay(&config, attempt);
        set_state(&state, ConnectionState::Reconnecting);
        if attempt > config.silent_retry_threshold {
            let _ = events_tx
                .send(ClientEvent::Reconnecting {
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                })
                .await;
        }

        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => break,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(ClientCommand::Disconnect) => {
                        set_state(&state, ConnectionState::Disconnected);
                        return;
                    }
                    // Requests while offline fail fast: dropping the
                    // reply sender errors the caller.
                    Some(ClientCommand::Request { .. } | ClientCommand::Send(_)) => {}
                }
            }
        }
    }
}

async fn connect_and_auth(config: &ClientConfig) -> ConnectOutcome {
    let mut ws = match connect_async(config.url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => return ConnectOutcome::Transport(e.to_string()),
    };

    let auth = Message::new(Payload::Auth {
        token: config.server_token.clone(),
        token_type: TokenType::Server,
    });
    let auth_id = auth.id;
    let json = match auth.to_json() {
        Ok(json) => json,
        Err(e) => return ConnectOutcome::Transport(e.to_string()),
    };
    if let Err(e) = ws.send(WsMessage::Text(json.into())).await {
        return ConnectOutcome::Transport(e.to_string());
    }

    let outcome = tokio::time::timeout(config.auth_timeout, async {
        while let Some(frame) = ws.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => {
                    return ConnectOutcome::Transport("closed during auth".to_string());
                }
                Ok(_) => continue,
                Err(e) => return ConnectOutcome::Transport(e.to_string()),
            };
            if let Ok(message) = Message::parse(&text) {
                if message.id == auth_id {
                    if let Payload::AuthResponse {
                        success,
                        expires_at,
                        error,
                        ..
                    } = message.payload
                    {
                        if success {
                            return ConnectOutcome::Ready(Box::new(ws), ConnectionInfo { expires_at });
                        }
                        return ConnectOutcome::AuthRejected(
                            error.unwrap_or_else(|| "authentication failed".to_string()),
                        );
                    }
                }
            }
        }
        ConnectOutcome::Transport("closed during auth".to_string())
    })
    .await;

    match outcome {
        Ok(outcome) => outcome,
        Err(_) => ConnectOutcome::Transport("auth handshake timed out".to_string()),
    }
}

async fn session(
    config: &ClientConfig,
    ws: WsStream,
    mut info: ConnectionInfo,
    cmd_rx: &mut mpsc::Receiver<ClientCommand>,
    events_tx: &mpsc::Sender<ClientEvent>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut pending: HashMap<Uuid, oneshot::Sender<Message>> = HashMap::new();
    let mut last_ping: Option<(Uuid, Instant)> = None;
    let mut refresh_in_flight: Option<Uuid> = None;
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await; // completes immediately

    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    None => return SessionEnd::Lost("connection closed".to_string()),
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) => {
                        return SessionEnd::Lost("server closed the connection".to_string());
                    }
                    Some(Ok(_)) => continue,
                };
                let message = match Message::parse(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("discarding bad frame from server: {e}");
                        continue;
                    }
                };

                if let Some(reply) = pending.remove(&message.id) {
                    let _ = reply.send(message);
                    continue;
                }

                match message.payload {
                    Payload::Ping => {
                        let pong = Message::reply_to(message.id, Payload::Pong);
                        if send_frame(&mut sink, &pong).await.is_err() {
                            return SessionEnd::Lost("send failed".to_string());
                        }
                    }
                    Payload::Pong => {
                        if let Some((ping_id, sent)) = last_ping.take() {
                            if ping_id == message.id {
                                let ms = u64::try_from(sent.elapsed().as_millis())
                                    .unwrap_or(u64::MAX);
                                let _ = events_tx.send(ClientEvent::Latency { ms }).await;
                            }
                        }
                    }
                    Payload::EngineEvent { event } => {
                        let _ = events_tx.send(ClientEvent::EngineEvent(event)).await;
                    }
                    Payload::ServerStatus {
                        engine_status,
                        uptime_seconds,
                        connections,
                    } => {
                        let _ = events_tx
                            .send(ClientEvent::ServerStatus {
                                engine_status,
                                uptime_seconds,
                                connections,
                            })
                            .await;
                    }
                    Payload::TokenRefreshResponse {
                        success,
                        expires_at,
                        error,
                        ..
                    } if refresh_in_flight == Some(message.id) => {
                        refresh_in_flight = None;
                        if success {
                            info.expires_at = expires_at;
                            tracing::debug!("connection token refreshed");
                        } else {
                            // The current token keeps working until it
                            // actually expires.
                            tracing::warn!(
                                "token refresh failed: {}",
                                error.as_deref().unwrap_or("unknown")
                            );
                        }
                    }
                    Payload::Error { code, message } => {
                        let _ = events_tx
                            .send(ClientEvent::ProtocolError { code, message })
                            .await;
                    }
                    other => {
                        tracing::debug!(?other, "unhandled message from server");
                    }
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                None => {
                    let _ = sink.close().await;
                    return SessionEnd::HandleDropped;
                }
                Some(ClientCommand::Disconnect) => {
                    let _ = sink.close().await;
                    return SessionEnd::Intentional;
                }
                Some(ClientCommand::Send(message)) => {
                    if send_frame(&mut sink, &message).await.is_err() {
                        return SessionEnd::Lost("send failed".to_string());
                    }
                }
                Some(ClientCommand::Request { message, reply }) => {
                    let id = message.id;
                    if send_frame(&mut sink, &message).await.is_err() {
                        return SessionEnd::Lost("send failed".to_string());
                    }
                    pending.insert(id, reply);
                }
            },

            _ = heartbeat.tick() => {
                let ping = Message::new(Payload::Ping);
                last_ping = Some((ping.id, Instant::now()));
                if send_frame(&mut sink, &ping).await.is_err() {
                    return SessionEnd::Lost("send failed".to_string());
                }

                if refresh_in_flight.is_none() && needs_refresh(&info, config.refresh_threshold) {
                    let refresh = Message::new(Payload::TokenRefresh);
                    refresh_in_flight = Some(refresh.id);
                    if send_frame(&mut sink, &refresh).await.is_err() {
                        return SessionEnd::Lost("send failed".to_string());
                    }
                }
            }
        }
    }
}

fn needs_refresh(info: &ConnectionInfo, threshold: Duration) -> bool {
    match info.expires_at {
        Some(expires_at) => {
            let remaining = expires_at - Utc::now();
            remaining < chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::zero())
        }
        None => false,
    }
}

async fn send_frame<S>(sink: &mut S, message: &Message) -> Result<(), ()>
where
    S: futures::Sink<WsMessage> + Unpin,
{
    let json = message.to_json().map_err(|_| ())?;
    sink.send(WsMessage::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_follows_the_contract() {
        let config = ClientConfig::new("ws://localhost:7890/ws", "tok");
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| backoff_delay(&config, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn backoff_is_capped_for_huge_attempts() {
        let config = ClientConfig::new("ws://localhost:7890/ws", "tok");
        assert_eq!(backoff_delay(&config, 1000), Duration::from_secs(30));
    }

    #[test]
    fn refresh_triggers_only_inside_threshold() {
        let threshold = Duration::from_secs(3600);
        let fresh = ConnectionInfo {
            expires_at: Some(Utc::now() + chrono::Duration::hours(10)),
        };
        let stale = ConnectionInfo {
            expires_at: Some(Utc::now() + chrono::Duration::minutes(30)),
        };
        let unknown = ConnectionInfo { expires_at: None };
        assert!(!needs_refresh(&fresh, threshold));
        assert!(needs_refresh(&stale, threshold));
        assert!(!needs_refresh(&unknown, threshold));
    }
}

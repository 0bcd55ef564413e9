//! WebSocket server exposing the engine to remote clients.
//!
//! Per-connection state machine: `connected` until a valid `auth`
//! arrives within the deadline, then `authenticated`, optionally
//! `subscribed`. Reads run on the connection task; writes serialize
//! through a per-connection send queue.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use ralph_tui_engine::{BusEvent, Engine, EventSubscription};

use crate::config_push::ConfigPaths;
use crate::dispatch::{dispatch_request, error_reply};
use crate::protocol::{error_codes, Message, ParseError, Payload, DEFAULT_PORT};
use crate::token::{ConnectionToken, TokenStore};

/// Server error.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for the server; defaults match the protocol contract.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Deadline for the `auth` message after connect.
    pub auth_timeout: Duration,
    /// Interval between server pings and status broadcasts.
    pub heartbeat_interval: Duration,
    /// Close the connection after this long without any traffic.
    pub idle_timeout: Duration,
    /// Close the connection when a single write stalls this long.
    pub write_timeout: Duration,
    /// Config file locations served by check/push.
    pub config_paths: ConfigPaths,
}

impl ServerConfig {
    /// Contract defaults: port 7890, 10s auth, 30s heartbeat, 90s
    /// idle, 30s write stall.
    #[must_use]
    pub fn new(config_paths: ConfigPaths) -> Self {
        Self {
            port: DEFAULT_PORT,
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(30),
            config_paths,
        }
    }
}

pub(crate) struct ServerContext {
    pub engine: Engine,
    pub tokens: Arc<TokenStore>,
    pub config: ServerConfig,
    pub started_at: Instant,
    pub connections: AtomicU32,
    /// Serializes engine commands across all connections.
    pub dispatch_lock: tokio::sync::Mutex<()>,
}

/// The remote control-plane server.
#[derive(Clone)]
pub struct RemoteServer {
    ctx: Arc<ServerContext>,
}

impl RemoteServer {
    /// Create a server for an engine.
    #[must_use]
    pub fn new(engine: Engine, tokens: Arc<TokenStore>, config: ServerConfig) -> Self {
        Self {
            ctx: Arc::new(ServerContext {
                engine,
                tokens,
                config,
                started_at: Instant::now(),
                connections: AtomicU32::new(0),
                dispatch_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Router exposing the `/ws` upgrade endpoint.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&self.ctx))
    }

    /// Bind the configured port and serve until `shutdown` turns true.
    ///
    /// # Errors
    /// Returns error if binding fails or the server errors out.
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let addr = format!("0.0.0.0:{}", self.ctx.config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "remote control server listening");
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    ///
    /// # Errors
    /// Returns error if the server errors out.
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|&stop| stop).await;
            })
            .await?;
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ServerContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<ServerContext>) {
    ctx.connections.fetch_add(1, Ordering::Relaxed);
    let (sender, mut receiver) = socket.split();

    // Writes serialize through this queue; a stalled peer closes the
    // connection instead of blocking the reader.
    let (out_tx, out_rx) = mpsc::channel::<Message>(64);
    let write_task = tokio::spawn(write_loop(sender, out_rx, ctx.config.write_timeout));

    if let Some(connection_token) = authenticate(&ctx, &mut receiver, &out_tx).await {
        serve_connection(&ctx, &mut receiver, &out_tx, connection_token).await;
    }

    drop(out_tx);
    let _ = write_task.await;
    ctx.connections.fetch_sub(1, Ordering::Relaxed);
}

async fn write_loop(
    mut sender: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut out_rx: mpsc::Receiver<Message>,
    write_timeout: Duration,
) {
    while let Some(message) = out_rx.recv().await {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize message: {e}");
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, sender.send(WsMessage::Text(json.into()))).await
        {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                tracing::warn!("write stalled, closing connection");
                break;
            }
        }
    }
    let _ = sender.close().await;
}

/// Run the `connected` state: only `auth` is acceptable, and it must
/// arrive within the deadline.
async fn authenticate(
    ctx: &ServerContext,
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<Message>,
) -> Option<ConnectionToken> {
    let result = tokio::time::timeout(ctx.config.auth_timeout, async {
        loop {
            let frame = receiver.next().await?;
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            };

            return match Message::parse(&text) {
                Ok(Message {
                    id,
                    payload: Payload::Auth { token, token_type },
                    ..
                }) => {
                    if ctx.tokens.verify(&token, token_type) {
                        let connection_token = ctx.tokens.issue_connection_token();
                        let _ = out_tx
                            .send(Message::reply_to(
                                id,
                                Payload::AuthResponse {
                                    success: true,
                                    connection_token: Some(connection_token.token.clone()),
                                    expires_at: Some(connection_token.expires_at),
                                    error: None,
                                },
                            ))
                            .await;
                        Some(connection_token)
                    } else {
                        tracing::warn!("rejected connection with invalid token");
                        let _ = out_tx
                            .send(Message::reply_to(
                                id,
                                Payload::AuthResponse {
                                    success: false,
                                    connection_token: None,
                                    expires_at: None,
                                    error: Some("invalid or expired token".to_string()),
                                },
                            ))
                            .await;
                        None
                    }
                }
                Ok(other) => {
                    let _ = out_tx
                        .send(error_reply(
                            other.id,
                            error_codes::NOT_AUTHENTICATED,
                            "authenticate first",
                        ))
                        .await;
                    None
                }
                Err(ParseError::UnknownType(t)) => {
                    let _ = out_tx
                        .send(Message::new(Payload::Error {
                            code: error_codes::UNKNOWN_MESSAGE.to_string(),
                            message: format!("unknown message type: {t}"),
                        }))
                        .await;
                    None
                }
                Err(ParseError::Malformed(e)) => {
                    let _ = out_tx
                        .send(Message::new(Payload::Error {
                            code: error_codes::PROTOCOL_ERROR.to_string(),
                            message: format!("malformed message: {e}"),
                        }))
                        .await;
                    None
                }
            };
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::debug!("closing connection: no auth within deadline");
            let _ = out_tx
                .send(Message::new(Payload::Error {
                    code: error_codes::AUTH_TIMEOUT.to_string(),
                    message: "no auth message within the deadline".to_string(),
                }))
                .await;
            None
        }
    }
}

/// Run the `authenticated` (and optionally `subscribed`) state.
async fn serve_connection(
    ctx: &ServerContext,
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    out_tx: &mpsc::Sender<Message>,
    mut connection_token: ConnectionToken,
) {
    let mut subscription: Option<EventSubscription> = None;
    let mut last_traffic = Instant::now();
    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    heartbeat.tick().await; // completes immediately

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let text = match frame {
                    None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(_)) => {
                        last_traffic = Instant::now();
                        continue;
                    }
                };
                last_traffic = Instant::now();

                match Message::parse(&text) {
                    Ok(message) => match message.payload {
                        Payload::Subscribe => {
                            subscription = Some(ctx.engine.subscribe());
                        }
                        Payload::Unsubscribe => {
                            subscription = None;
                        }
                        Payload::Pong => {}
                        Payload::TokenRefresh => {
                            let reply = match ctx
                                .tokens
                                .refresh_connection_token(&connection_token.token)
                            {
                                Some(rotated) => {
                                    connection_token = rotated.clone();
                                    Payload::TokenRefreshResponse {
                                        success: true,
                                        connection_token: Some(rotated.token),
                                        expires_at: Some(rotated.expires_at),
                                        error: None,
                                    }
                                }
                                None => Payload::TokenRefreshResponse {
                                    success: false,
                                    connection_token: None,
                                    expires_at: None,
                                    error: Some("connection token expired".to_string()),
                                },
                            };
                            let _ = out_tx.send(Message::reply_to(message.id, reply)).await;
                        }
                        _ => {
                            if let Some(reply) = dispatch_request(ctx, message).await {
                                let _ = out_tx.send(reply).await;
                            }
                        }
                    },
                    Err(ParseError::UnknownType(t)) => {
                        let _ = out_tx
                            .send(Message::new(Payload::Error {
                                code: error_codes::UNKNOWN_MESSAGE.to_string(),
                                message: format!("unknown message type: {t}"),
                            }))
                            .await;
                    }
                    Err(ParseError::Malformed(e)) => {
                        let _ = out_tx
                            .send(Message::new(Payload::Error {
                                code: error_codes::PROTOCOL_ERROR.to_string(),
                                message: format!("malformed message: {e}"),
                            }))
                            .await;
                    }
                }
            }

            event = async { subscription.as_mut().expect("guarded by is_some").next().await },
                if subscription.is_some() =>
            {
                match event {
                    Some(BusEvent::Event(event)) => {
                        let _ = out_tx
                            .send(Message::new(Payload::EngineEvent { event }))
                            .await;
                    }
                    Some(BusEvent::Lagged(_)) => {}
                    None => subscription = None,
                }
            }

            _ = heartbeat.tick() => {
                if last_traffic.elapsed() > ctx.config.idle_timeout {
                    tracing::debug!("closing connection: heartbeat timeout");
                    let _ = out_tx
                        .send(Message::new(Payload::Error {
                            code: error_codes::HEARTBEAT_TIMEOUT.to_string(),
                            message: "no traffic within the idle window".to_string(),
                        }))
                        .await;
                    break;
                }
                let _ = out_tx.send(Message::new(Payload::Ping)).await;
                let _ = out_tx
                    .send(Message::new(Payload::ServerStatus {
                        engine_status: ctx.engine.state().status,
                        uptime_seconds: ctx.started_at.elapsed().as_secs(),
                        connections: ctx.connections.load(Ordering::Relaxed),
                    }))
                    .await;
            }
        }
    }
}

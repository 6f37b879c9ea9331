//! WebSocket transport gateway.
//!
//! Accepts WebSocket connections, asks the multiplexer to admit each one,
//! then shuttles decoded client events in and encoded server events out
//! until either side goes away. Every connection that was admitted is
//! handed back to the multiplexer for teardown exactly once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{Codec, Encoded, ErrorCode, ServerEvent};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use crate::config::NetworkConfig;
use crate::gate::ConnectionContext;
use crate::mux::Multiplexer;
use crate::session::{ConnectionHandle, ProcessBackend};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Errors that can occur in the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The WebSocket layer failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

/// Keepalive timing.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How often the server pings each client.
    pub ping_interval: Duration,
    /// A client silent for this long is disconnected.
    pub heartbeat_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&NetworkConfig> for GatewayConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(network.ping_interval_secs),
            heartbeat_timeout: Duration::from_secs(network.heartbeat_timeout_secs),
        }
    }
}

/// A bound WebSocket listener in front of a multiplexer.
pub struct Gateway<B: ProcessBackend> {
    listener: TcpListener,
    mux: Arc<Multiplexer<B>>,
    config: GatewayConfig,
}

impl<B: ProcessBackend> Gateway<B> {
    /// Bind the listener.
    pub async fn bind(
        addr: SocketAddr,
        mux: Arc<Multiplexer<B>>,
        config: GatewayConfig,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        Ok(Self {
            listener,
            mux,
            config,
        })
    }

    /// The address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled, then wait for every
    /// connection task to finish its teardown.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        let local_addr = self.local_addr()?;
        info!(addr = %local_addr, "WebSocket gateway listening");

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let mux = Arc::clone(&self.mux);
                        let config = self.config.clone();
                        let shutdown = shutdown.child_token();
                        let span = tracing::info_span!("connection", remote_addr = %remote_addr);
                        tracker.spawn(
                            async move {
                                if let Err(e) = serve_connection(stream, remote_addr, mux, config, shutdown).await {
                                    debug!(error = %e, "Connection ended with error");
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("WebSocket gateway stopped");
        Ok(())
    }
}

/// Value of one query parameter, percent-decoded.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn serve_connection<B: ProcessBackend>(
    stream: TcpStream,
    remote_addr: SocketAddr,
    mux: Arc<Multiplexer<B>>,
    config: GatewayConfig,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let mut ctx = ConnectionContext {
        remote_addr: Some(remote_addr),
        ..ConnectionContext::default()
    };
    let mut codec = Codec::default();

    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        ctx.origin = request
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let query = request.uri().query();
        ctx.token = query_param(query, "token");
        codec = Codec::from_query(query);
        Ok(response)
    };
    let ws = accept_hdr_async(stream, capture).await?;
    let (mut sink, source) = ws.split();

    let (conn, outbound) = match mux.connect(&ctx) {
        Ok(admitted) => admitted,
        Err(e) => {
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: e.to_string().into(),
            };
            let _ = sink.send(WsMessage::Close(Some(frame))).await;
            return Ok(());
        }
    };
    debug!(connection_id = %conn.id(), codec = ?codec, "WebSocket handshake complete");

    let mut link = Link {
        sink,
        codec,
        sequence: 0,
    };
    let result = connection_loop(&mux, &conn, &mut link, source, outbound, &config, &shutdown)
        .instrument(tracing::debug_span!("client", connection_id = %conn.id()))
        .await;

    mux.disconnect(conn.id()).await;
    let _ = link.sink.close().await;
    result
}

/// Outbound half of a connection.
struct Link {
    sink: WsSink,
    codec: Codec,
    sequence: u64,
}

impl Link {
    async fn send_event(&mut self, event: &ServerEvent) -> Result<(), GatewayError> {
        self.sequence += 1;
        let frame = match self.codec.encode(event, self.sequence) {
            Ok(Encoded::Text(text)) => WsMessage::Text(text),
            Ok(Encoded::Binary(bytes)) => WsMessage::Binary(bytes),
            Err(e) => {
                warn!(error = %e, "Failed to encode event, dropping it");
                return Ok(());
            }
        };
        self.sink.send(frame).await?;
        Ok(())
    }

    async fn close(&mut self, code: CloseCode, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = self.sink.send(WsMessage::Close(Some(frame))).await;
    }
}

async fn connection_loop<B: ProcessBackend>(
    mux: &Multiplexer<B>,
    conn: &ConnectionHandle,
    link: &mut Link,
    mut source: WsSource,
    mut outbound: mpsc::Receiver<ServerEvent>,
    config: &GatewayConfig,
    shutdown: &CancellationToken,
) -> Result<(), GatewayError> {
    let cancel = conn.cancel_token().clone();
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ping.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                link.close(CloseCode::Away, "server shutting down").await;
                return Ok(());
            }
            _ = cancel.cancelled() => {
                if conn.stats().overflowed {
                    link.close(CloseCode::Again, "outbound queue overflow").await;
                }
                return Ok(());
            }
            frame = source.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                };
                last_seen = Instant::now();

                let decoded = match message {
                    WsMessage::Text(text) => link.codec.decode_text(&text),
                    WsMessage::Binary(bytes) => link.codec.decode_binary(&bytes),
                    WsMessage::Close(_) => {
                        debug!("Client sent close frame");
                        return Ok(());
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                };

                match decoded {
                    Ok(event) => mux.dispatch(conn, event).await,
                    Err(e) => {
                        debug!(error = %e, "Malformed frame");
                        conn.send(ServerEvent::error(
                            ErrorCode::InvalidRequest,
                            format!("malformed frame: {e}"),
                            None,
                        ));
                    }
                }
            }
            event = outbound.recv() => match event {
                Some(event) => link.send_event(&event).await?,
                None => return Ok(()),
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > config.heartbeat_timeout {
                    warn!(connection_id = %conn.id(), "Heartbeat timeout, disconnecting client");
                    link.close(CloseCode::Away, "heartbeat timeout").await;
                    return Ok(());
                }
                link.sink.send(WsMessage::Ping(Vec::new())).await?;
            }
        }
    }
}

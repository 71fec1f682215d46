/// WebSocket share server
///
/// Accepts upgrades on `/` and `/<target-hex>`. The optional path segment
/// selects the starting difficulty; an unparsable one falls back to 1.
///
/// Each connection runs two tasks:
/// - writer: drains the session's outbound queue into the socket and stops
///   after the first close frame
/// - reader: feeds frames to `ShareProtocol` in arrival order

use anyhow::{anyhow, Result};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::handler::ShareProtocol;
use super::protocol::Outbound;
use crate::difficulty::difficulty_from_target_prefix;
use crate::error::{CloseReason, ProtocolError};
use crate::session::Session;

/// How long a departing connection may take to flush its queue.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames above this many multiples of the protocol limit are refused by
/// the socket layer itself; smaller oversized frames get a policy close.
const FRAME_SIZE_SLACK: usize = 4;

pub struct StratumServer {
    listen: String,
    protocol: Arc<ShareProtocol>,
}

impl StratumServer {
    pub fn new(listen: String, protocol: Arc<ShareProtocol>) -> Self {
        tracing::info!("Creating share server on {}", listen);
        Self { listen, protocol }
    }

    pub fn protocol(&self) -> &Arc<ShareProtocol> {
        &self.protocol
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(upgrade))
            .route("/:target", get(upgrade))
            .with_state(Arc::clone(self))
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = bind_listener(&self.listen)?;
        tracing::info!("Share server listening on ws://{} (SO_REUSEADDR)", self.listen);

        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        tracing::info!("Share server stopped");
        Ok(())
    }

    /// Stop taking submissions and send every connection a going-away close.
    pub async fn shutdown(&self) -> usize {
        self.protocol.dispatcher().begin_draining();
        let closed = self.protocol.close_all().await;
        tracing::info!("Draining: closed {} connections", closed);
        closed
    }

    pub async fn ban_and_disconnect(&self, ip: IpAddr) -> Result<usize> {
        self.protocol.ban_and_disconnect(ip).await
    }

    async fn run_connection(self: Arc<Self>, socket: WebSocket, ip: Option<IpAddr>, target: Option<String>) {
        let (mut sink, mut stream) = socket.split();

        let ip = match self.protocol.admit(ip).await {
            Ok(ip) => ip,
            Err(reason) => {
                let _ = sink.send(close_message(&reason)).await;
                return;
            }
        };

        let difficulty = target
            .as_deref()
            .and_then(difficulty_from_target_prefix)
            .unwrap_or(1.0);

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(Uuid::new_v4().to_string(), ip, difficulty, tx).shared();
        let mut writer = tokio::spawn(write_loop(sink, rx));
        let mut writer_done = false;

        self.protocol.on_connect(session.clone(), Instant::now()).await;

        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::debug!("Socket error from {}: {}", ip, e);
                    break;
                }
                None => break,
            };

            match frame {
                Message::Text(text) => {
                    self.protocol.on_text(&session, &text, Instant::now()).await;
                }
                Message::Binary(_) => {
                    self.protocol.on_protocol_error(&session, ProtocolError::BinaryFrame).await;
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }

            if !session.read().await.is_open() {
                break;
            }
        }

        // Teardown drops the sender, so the writer ends once its queue is flushed.
        self.protocol.on_disconnect(&session).await;
        if !writer_done {
            let abort = writer.abort_handle();
            if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
                abort.abort();
            }
        }
    }
}

async fn upgrade(
    State(server): State<Arc<StratumServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    target: Option<Path<String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = resolve_client_ip(&headers, peer);
    let target = target.map(|Path(t)| t);
    let limit = server
        .protocol
        .settings()
        .max_message_size
        .saturating_mul(FRAME_SIZE_SLACK);

    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| server.run_connection(socket, ip, target))
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        let message = match item {
            Outbound::Message(msg) => match msg.to_json() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::error!("Failed to encode {:?}: {}", msg, e);
                    continue;
                }
            },
            Outbound::Close(reason) => {
                let _ = sink.send(close_message(&reason)).await;
                break;
            }
        };

        if sink.send(message).await.is_err() {
            break;
        }
    }
}

fn close_message(reason: &CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.to_string().into(),
    }))
}

/// Client address for bans and logging: the first `X-Forwarded-For` entry
/// when present, otherwise the socket peer. IPv4-mapped IPv6 addresses are
/// reported as plain IPv4. `None` if a forwarded address does not parse.
pub fn resolve_client_ip(headers: &HeaderMap, peer: SocketAddr) -> Option<IpAddr> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        let first = forwarded.to_str().ok()?.split(',').next()?.trim();
        return first.parse::<IpAddr>().ok().map(canonical_ip);
    }
    Some(canonical_ip(peer.ip()))
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Listening socket with SO_REUSEADDR so restarts don't hit
/// "Address already in use".
pub fn bind_listener(addr: &str) -> Result<TcpListener> {
    let sock_addr: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow!("Invalid address '{}': {}", addr, e))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(sock_addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(sock_addr))?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

//! TCP and WebSocket drivers behind a common event contract (spec §4.2, C3).
//!
//! Grounded on the teacher's websocket upgrade handler
//! (`odin_server::ws_service::{ws_handler, handle_socket}`) for the WS half,
//! and on the mesh bus's split-stream reader/writer task pattern for the TCP
//! half. Drivers never parse packet semantics above the framing layer: they
//! hand raw frame bytes to `on_message` and let the session manager decode
//! them with `playhouse_wire::codec`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::ConnectInfo;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use playhouse_wire::{frame_with_length_prefix, split_frames};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use playhouse_core::{debug, warn};

use crate::errors::Result;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Callbacks a transport driver reports to; implemented by the session
/// manager so drivers stay ignorant of stages/actors/authentication.
pub trait TransportEvents: Send + Sync {
    /// A new connection arrived. Returns the `sid` assigned to it; `outbound`
    /// is a non-blocking queued send entry point for that session (spec
    /// §4.2). `closer` is handed to whatever owns this `sid` so it can tear
    /// the connection down on its own initiative (spec §4.9 auth rejection)
    /// rather than waiting on the peer.
    fn on_connect(&self, peer_addr: SocketAddr, outbound: mpsc::UnboundedSender<Bytes>, closer: Arc<Notify>) -> i64;
    fn on_message(&self, sid: i64, bytes: Bytes);
    fn on_disconnect(&self, sid: i64, reason: &str);
}

/// Pipelined TCP driver: one reader task and one writer task per session,
/// length-prefixed framing (spec §4.1).
pub struct TcpTransport;

impl TcpTransport {
    pub async fn serve(addr: SocketAddr, events: Arc<dyn TransportEvents>, max_packet_size: usize) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        debug!("tcp transport listening on {addr}");
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        tokio::spawn(Self::serve_session(socket, peer_addr, events.clone(), max_packet_size));
                    }
                    Err(e) => warn!("tcp accept failed: {e}"),
                }
            }
        });
        Ok(())
    }

    async fn serve_session(socket: TcpStream, peer_addr: SocketAddr, events: Arc<dyn TransportEvents>, max_packet_size: usize) {
        let _ = socket.set_nodelay(true);
        let (mut socket_rx, mut socket_tx) = socket.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let closer = Arc::new(Notify::new());
        let sid = events.on_connect(peer_addr, tx, closer.clone());

        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                if socket_tx.write_all(&frame_with_length_prefix(&body)).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let mut pending = VecDeque::new();
        let reason = loop {
            tokio::select! {
                result = Self::read_one_frame(&mut socket_rx, &mut buf, &mut pending, max_packet_size) => {
                    match result {
                        Ok(Some(frame)) => events.on_message(sid, frame),
                        Ok(None) => break "connection closed",
                        Err(e) => {
                            warn!("tcp session {sid} read error: {e}");
                            break "read error";
                        }
                    }
                }
                _ = closer.notified() => break "closed by server",
            }
        };
        events.on_disconnect(sid, reason);
    }

    /// A single `read()` routinely lands more than one pipelined frame (spec
    /// §4.2); every frame `split_frames` drains out of `buf` is queued in
    /// `pending` so none of them are thrown away before the caller asks for
    /// the next one.
    async fn read_one_frame(
        socket_rx: &mut OwnedReadHalf,
        buf: &mut BytesMut,
        pending: &mut VecDeque<Bytes>,
        max_packet_size: usize,
    ) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = pending.pop_front() {
                return Ok(Some(frame));
            }
            let frames = split_frames(buf, max_packet_size)?;
            if !frames.is_empty() {
                pending.extend(frames);
                continue;
            }
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = socket_rx.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// WebSocket driver: one packet per WebSocket message, no length prefix
/// (spec §4.1). Bound behind an `axum` router, matching the teacher's
/// `ws_service::ws_handler` upgrade pattern.
pub struct WsTransport;

impl WsTransport {
    pub async fn serve(addr: SocketAddr, events: Arc<dyn TransportEvents>) -> Result<()> {
        let router = Router::new().route(
            "/ws",
            get({
                let events = events.clone();
                move |ws: WebSocketUpgrade, ConnectInfo(peer_addr): ConnectInfo<SocketAddr>| {
                    let events = events.clone();
                    async move { ws.on_upgrade(move |socket| Self::handle_socket(socket, peer_addr, events)).into_response() }
                }
            }),
        );
        let listener = TcpListener::bind(addr).await?;
        debug!("ws transport listening on {addr}");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await {
                warn!("ws transport stopped: {e}");
            }
        });
        Ok(())
    }

    async fn handle_socket(socket: WebSocket, peer_addr: SocketAddr, events: Arc<dyn TransportEvents>) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let closer = Arc::new(Notify::new());
        let sid = events.on_connect(peer_addr, tx, closer.clone());

        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                if sink.send(WsMessage::Binary(body)).await.is_err() {
                    break;
                }
            }
        });

        let reason = loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Binary(body))) => events.on_message(sid, body),
                        Some(Ok(WsMessage::Close(_))) | None => break "connection closed",
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("ws session {sid} read error: {e}");
                            break "read error";
                        }
                    }
                }
                _ = closer.notified() => break "closed by server",
            }
        };
        events.on_disconnect(sid, reason);
    }
}

//! Router-style TCP fabric connecting PlayHouse server processes (spec §4.5, C5).
//!
//! Grounded on the split-stream reader/writer task pattern for CQL
//! connections: each peer owns a writer task fed by an `mpsc` channel and a
//! reader task that decodes frames straight off the socket, plus
//! reconnect-with-backoff on the outbound side. `playhouse-mesh` does not
//! know about `StagePool`/`RequestCache`; decoded packets are handed to an
//! injected [`InboundRouter`] so the composition root owns that wiring.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use playhouse_core::sender::MeshLink;
use playhouse_core::{debug, info, warn};
use playhouse_wire::{
    decode_mesh_frame, encode_mesh_frame, frame_with_length_prefix, split_frames, Payload, RoutePacket, ServerNid,
    DEFAULT_MAX_PACKET_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::errors::PlayMeshError;

const RECONNECT_BACKOFF: Duration = Duration::from_millis(5000);
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Seam the composition root implements to hand a decoded inbound packet
/// off to whatever owns stage/actor dispatch, without `playhouse-mesh`
/// depending on `StagePool`/`RequestCache` directly.
pub trait InboundRouter: Send + Sync {
    fn route(&self, packet: RoutePacket);
}

struct PeerConnection {
    tx: mpsc::UnboundedSender<RoutePacket>,
}

/// The mesh bus for one server process: accepts inbound peer connections and
/// maintains outbound connections to every peer it has sent a packet to.
///
/// `peers`/`directory` are reference-counted independently of `MeshBus`
/// itself so the reconnect-loop task can be spawned from `MeshLink::send`
/// (which only gets `&self`, not `Arc<Self>`) by cloning just those handles.
pub struct MeshBus {
    self_nid: ServerNid,
    router: Arc<dyn InboundRouter>,
    directory: Arc<DashMap<ServerNid, SocketAddr>>,
    peers: Arc<DashMap<ServerNid, PeerConnection>>,
    max_packet_size: usize,
}

impl MeshBus {
    pub fn new(self_nid: ServerNid, router: Arc<dyn InboundRouter>) -> Arc<Self> {
        Arc::new(MeshBus {
            self_nid,
            router,
            directory: Arc::new(DashMap::new()),
            peers: Arc::new(DashMap::new()),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
    }

    /// Records (or updates) where a peer can be dialed. Populated by the
    /// address resolver as it learns about the mesh's membership.
    pub fn set_peer_address(&self, nid: ServerNid, addr: SocketAddr) {
        self.directory.insert(nid, addr);
    }

    /// Binds a listener and spawns the accept loop. Call once per process.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> crate::errors::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("mesh bus {} listening on {addr}", self.self_nid);
        let router = self.router.clone();
        let peers = self.peers.clone();
        let max_packet_size = self.max_packet_size;
        tokio::spawn(accept_loop(listener, router, peers, max_packet_size));
        Ok(())
    }

    /// Eagerly opens an outbound connection to `nid` if one doesn't already
    /// exist, per the address resolver's heartbeat (spec §4.4 step 3). A
    /// no-op if already connected; connection failures are retried in the
    /// background by [`run_outbound`] rather than surfaced here.
    pub fn connect(&self, nid: ServerNid) -> crate::errors::Result<()> {
        ensure_connected(nid, &self.directory, &self.peers, self.router.clone(), self.max_packet_size).map(|_| ())
    }
}

impl MeshLink for MeshBus {
    fn send(&self, nid: ServerNid, packet: RoutePacket) -> playhouse_core::Result<()> {
        let tx = ensure_connected(nid, &self.directory, &self.peers, self.router.clone(), self.max_packet_size)
            .map_err(|e| playhouse_core::errors::op_failed(e.to_string()))?;
        tx.send(packet).map_err(|_| playhouse_core::errors::op_failed(format!("peer {nid} writer task gone")))
    }

    fn self_nid(&self) -> ServerNid {
        self.self_nid
    }
}

fn ensure_connected(
    nid: ServerNid,
    directory: &Arc<DashMap<ServerNid, SocketAddr>>,
    peers: &Arc<DashMap<ServerNid, PeerConnection>>,
    router: Arc<dyn InboundRouter>,
    max_packet_size: usize,
) -> crate::errors::Result<mpsc::UnboundedSender<RoutePacket>> {
    if let Some(peer) = peers.get(&nid) {
        return Ok(peer.tx.clone());
    }
    let addr = *directory.get(&nid).ok_or(PlayMeshError::PeerUnreachable(nid))?;
    let (tx, rx) = mpsc::unbounded_channel();
    peers.insert(nid, PeerConnection { tx: tx.clone() });
    let peers = peers.clone();
    tokio::spawn(run_outbound(nid, addr, rx, peers, router, max_packet_size));
    Ok(tx)
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<dyn InboundRouter>,
    peers: Arc<DashMap<ServerNid, PeerConnection>>,
    max_packet_size: usize,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                debug!("mesh accepted inbound connection from {peer_addr}");
                tokio::spawn(serve_inbound(socket, router.clone(), peers.clone(), max_packet_size));
            }
            Err(e) => warn!("mesh accept failed: {e}"),
        }
    }
}

/// Reads frames off a freshly-accepted socket. The peer's identity isn't
/// known until the first frame's `header.from` is decoded; once it is, the
/// write half is registered as that peer's outbound route so replies flow
/// back over the same connection instead of dialing a new one.
async fn serve_inbound(
    socket: TcpStream,
    router: Arc<dyn InboundRouter>,
    peers: Arc<DashMap<ServerNid, PeerConnection>>,
    max_packet_size: usize,
) {
    let _ = socket.set_nodelay(true);
    let (mut socket_rx, socket_tx) = socket.into_split();
    let mut registered: Option<ServerNid> = None;
    let mut writer_spawned = false;
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut pending = VecDeque::new();
    let mut socket_tx = Some(socket_tx);
    loop {
        match read_one_frame(&mut socket_rx, &mut buf, &mut pending, max_packet_size).await {
            Ok(Some(frame)) => {
                let (header, payload) = match decode_mesh_frame(&frame) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("mesh discarding unparseable inbound frame: {e}");
                        continue;
                    }
                };
                if !writer_spawned {
                    let nid = header.from;
                    let (tx, rx) = mpsc::unbounded_channel();
                    peers.insert(nid, PeerConnection { tx });
                    tokio::spawn(run_writer(socket_tx.take().expect("writer spawned once"), rx));
                    registered = Some(nid);
                    writer_spawned = true;
                }
                router.route(RoutePacket::new(header, Payload::borrowed(payload)));
            }
            Ok(None) => break,
            Err(e) => {
                debug!("mesh inbound connection closed: {e}");
                break;
            }
        }
    }
    if let Some(nid) = registered {
        peers.remove(&nid);
    }
}

async fn run_outbound(
    nid: ServerNid,
    addr: SocketAddr,
    rx: mpsc::UnboundedReceiver<RoutePacket>,
    peers: Arc<DashMap<ServerNid, PeerConnection>>,
    router: Arc<dyn InboundRouter>,
    max_packet_size: usize,
) {
    let socket = loop {
        match TcpStream::connect(addr).await {
            Ok(socket) => break socket,
            Err(e) => {
                warn!("mesh connect to {nid} at {addr} failed, retrying: {e}");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    };
    let _ = socket.set_nodelay(true);
    let (mut socket_rx, socket_tx) = socket.into_split();
    tokio::spawn(run_writer(socket_tx, rx));
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut pending = VecDeque::new();
    loop {
        match read_one_frame(&mut socket_rx, &mut buf, &mut pending, max_packet_size).await {
            Ok(Some(frame)) => match decode_mesh_frame(&frame) {
                Ok((header, payload)) => router.route(RoutePacket::new(header, Payload::borrowed(payload))),
                Err(e) => warn!("mesh discarding unparseable outbound-leg frame: {e}"),
            },
            Ok(None) | Err(_) => break,
        }
    }
    peers.remove(&nid);
}

async fn run_writer(mut socket_tx: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<RoutePacket>) {
    while let Some(packet) = rx.recv().await {
        let payload = match packet.payload.view() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("mesh dropping packet with unreadable payload: {e}");
                continue;
            }
        };
        let body = match encode_mesh_frame(&packet.header, &payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("mesh failed to encode outbound frame: {e}");
                continue;
            }
        };
        if socket_tx.write_all(&frame_with_length_prefix(&body)).await.is_err() {
            break;
        }
    }
}

/// A single `read()` routinely lands more than one pipelined frame (spec
/// §4.2); every frame `split_frames` drains out of `buf` is queued in
/// `pending` so none of them are thrown away before the caller asks for the
/// next one.
async fn read_one_frame(
    socket_rx: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    pending: &mut VecDeque<Bytes>,
    max_packet_size: usize,
) -> crate::errors::Result<Option<Bytes>> {
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

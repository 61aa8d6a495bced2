//! Session manager (spec §4.3, C4): owns the `sid -> outbound` table, decodes
//! `ClientFrame`s into `RoutePacket`s bound for a stage, and implements
//! `ClientLink` so stage replies can find their way back out a transport.
//!
//! A session's `stage_id` is pinned at its first packet (spec §4.3) rather
//! than re-read from every frame, so a client cannot retarget mid-connection
//! by sending a different `stage_id` once joined.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use playhouse_core::sender::ClientLink;
use playhouse_core::stage::StagePool;
use playhouse_core::{debug, info, warn};
use playhouse_wire::{decode_client_frame, encode_server_frame, Packet, Payload, RouteHeader, RoutePacket, ServerFrame, ServerNid};
use tokio::sync::{mpsc, Notify};

use crate::config::PlayServerOptions;
use crate::errors::{op_failed, Result};
use crate::transport::TransportEvents;

struct SessionState {
    outbound: mpsc::UnboundedSender<Bytes>,
    peer_addr: SocketAddr,
    stage_id: AtomicI64,
    // learned from the payload of an AuthenticateReply (see Stage::authenticate);
    // 0 until then, which also reads as "no bound actor" to decode_and_route.
    actor_id: AtomicI64,
    closer: Arc<Notify>,
}

const NO_STAGE: i64 = i64::MIN;

/// Tracks every locally-connected client and bridges the transport layer to
/// the stage pool (spec §4.3/§4.7).
pub struct SessionManager {
    sessions: DashMap<i64, SessionState>,
    next_sid: AtomicI64,
    stages: Arc<StagePool>,
    self_nid: ServerNid,
    options: PlayServerOptions,
}

impl SessionManager {
    pub fn new(stages: Arc<StagePool>, self_nid: ServerNid, options: PlayServerOptions) -> Arc<Self> {
        Arc::new(SessionManager { sessions: DashMap::new(), next_sid: AtomicI64::new(1), stages, self_nid, options })
    }

    fn decode_and_route(&self, sid: i64, bytes: Bytes) -> Result<()> {
        let frame = decode_client_frame(&bytes)?;
        let Some(session) = self.sessions.get(&sid) else {
            return Err(op_failed(format!("session {sid} not found for inbound frame")));
        };
        session.stage_id.compare_exchange(NO_STAGE, frame.stage_id, Ordering::AcqRel, Ordering::Acquire).ok();
        let stage_id = session.stage_id.load(Ordering::Acquire);

        let header = RouteHeader {
            msg_seq: frame.msg_seq,
            service_id: frame.service_id,
            msg_id: frame.msg_id,
            from: self.self_nid,
            stage_id,
            account_id: session.actor_id.load(Ordering::Acquire),
            sid,
            error_code: 0,
            is_reply: false,
        };
        let packet = RoutePacket::new(header, Payload::borrowed(frame.payload));

        match self.stages.get(stage_id) {
            Some(stage) => {
                stage.post(packet);
                Ok(())
            }
            None => Err(op_failed(format!("stage {stage_id} does not exist; CreateStage must run first"))),
        }
    }

    /// After the reconnect grace window (spec §4.3) elapses with no new
    /// session pinned to `stage_id`, evicts the actor roster entry via
    /// `LEAVE_STAGE`. A reconnect within the window re-joins through the
    /// normal authenticate/join path and simply races this eviction.
    fn schedule_leave_after_grace(&self, sid: i64, stage_id: i64) {
        let stages = self.stages.clone();
        let self_nid = self.self_nid;
        let grace = Duration::from_millis(self.options.reconnect_grace_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(stage) = stages.get(stage_id) {
                debug!("session {sid} reconnect grace expired, leaving stage {stage_id}");
                let header = RouteHeader {
                    msg_seq: 0,
                    service_id: 0,
                    msg_id: playhouse_core::stage::sys_msg::LEAVE_STAGE.to_string(),
                    from: self_nid,
                    stage_id,
                    account_id: 0,
                    sid,
                    error_code: 0,
                    is_reply: false,
                };
                stage.post(RoutePacket::new(header, Payload::empty()));
            }
        });
    }
}

impl TransportEvents for SessionManager {
    fn on_connect(&self, peer_addr: SocketAddr, outbound: mpsc::UnboundedSender<Bytes>, closer: Arc<Notify>) -> i64 {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        info!("session {sid} connected from {peer_addr}");
        self.sessions.insert(sid, SessionState { outbound, peer_addr, stage_id: AtomicI64::new(NO_STAGE), actor_id: AtomicI64::new(0), closer });
        sid
    }

    fn on_message(&self, sid: i64, bytes: Bytes) {
        if let Err(e) = self.decode_and_route(sid, bytes) {
            warn!("session {sid} inbound frame dropped: {e}");
        }
    }

    fn on_disconnect(&self, sid: i64, reason: &str) {
        let Some((_, state)) = self.sessions.remove(&sid) else {
            return;
        };
        info!("session {sid} ({}) disconnected: {reason}", state.peer_addr);
        let stage_id = state.stage_id.load(Ordering::Acquire);
        if stage_id != NO_STAGE {
            if let Some(stage) = self.stages.get(stage_id) {
                let header = RouteHeader {
                    msg_seq: 0,
                    service_id: 0,
                    msg_id: playhouse_core::stage::sys_msg::DISCONNECT_NOTICE.to_string(),
                    from: self.self_nid,
                    stage_id,
                    account_id: 0,
                    sid,
                    error_code: 0,
                    is_reply: false,
                };
                stage.post(RoutePacket::new(header, Payload::empty()));
            }
            self.schedule_leave_after_grace(sid, stage_id);
        }
    }
}

impl ClientLink for SessionManager {
    fn send_to_client(&self, sid: i64, packet: Packet) -> playhouse_core::errors::Result<()> {
        let session = self
            .sessions
            .get(&sid)
            .ok_or_else(|| playhouse_core::errors::op_failed(format!("session {sid} not found")))?;

        let mut payload = packet.payload.view()?;
        if packet.msg_id == playhouse_core::stage::AUTHENTICATE_REPLY_MSG_ID {
            if let Ok(raw) = <[u8; 8]>::try_from(payload.as_ref()) {
                session.actor_id.store(i64::from_le_bytes(raw), Ordering::Release);
            }
            payload = Bytes::new();
        }

        let frame = ServerFrame {
            service_id: 0,
            msg_id: packet.msg_id,
            msg_seq: 0,
            stage_id: session.stage_id.load(Ordering::Acquire),
            error_code: 0,
            payload,
        };
        let body = encode_server_frame(&frame)?;
        session
            .outbound
            .send(Bytes::from(body))
            .map_err(|_| playhouse_core::errors::op_failed(format!("session {sid} outbound channel closed")))?;
        Ok(())
    }

    fn close_session(&self, sid: i64) {
        if let Some(session) = self.sessions.get(&sid) {
            session.closer.notify_one();
        }
    }
}

//! Unified send/request API for actors, stages and API handlers (spec §4.6, C8).
//!
//! Design Note 1: rather than an `ActorSender`/`StageSender`/`ApiSender`
//! inheritance chain, one inner [`MeshSender`] carries the actual send/reply
//! capability and the role-specific wrappers just add contextual fields.
//! Design Note 3: the "current header" is never ambient (thread-local) state
//! — it is an explicit argument, so nothing can be captured across an await.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use playhouse_wire::{Packet, Payload, RouteHeader, RoutePacket, ServerNid};

use crate::errors::{error_code, PlayCoreError, Result};
use crate::request_cache::RequestCache;
use crate::stage::Stage;
use crate::timer::TimerHandle;
use crate::warn;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    RoundRobin,
    Random,
    Consistent(i64),
}

/// Abstracts over the mesh bus so `playhouse-core` does not need to depend
/// on `playhouse-mesh` directly; `playhouse-mesh::MeshBus` implements this.
pub trait MeshLink: Send + Sync {
    fn send(&self, nid: ServerNid, packet: RoutePacket) -> Result<()>;
    fn self_nid(&self) -> ServerNid;
}

/// Resolves a service id to a concrete server, per a [`SendPolicy`].
pub trait ServiceRegistry: Send + Sync {
    fn resolve(&self, service_id: u16, policy: SendPolicy) -> Option<ServerNid>;
}

/// Delivers a packet to a locally-connected client; implemented by the
/// session manager in `playhouse-server`.
pub trait ClientLink: Send + Sync {
    fn send_to_client(&self, sid: i64, packet: Packet) -> Result<()>;

    /// Tears down the transport connection backing `sid` (spec §4.9 - a
    /// rejected `OnAuthenticate` closes the connection). A no-op if `sid`
    /// is already gone.
    fn close_session(&self, sid: i64);
}

/// The one capability every sender role shares.
pub struct MeshSender {
    mesh: Arc<dyn MeshLink>,
    cache: Arc<RequestCache>,
    registry: Arc<dyn ServiceRegistry>,
    clients: Arc<dyn ClientLink>,
    round_robin_ctr: AtomicUsize,
    default_timeout: Duration,
}

impl MeshSender {
    pub fn new(
        mesh: Arc<dyn MeshLink>,
        cache: Arc<RequestCache>,
        registry: Arc<dyn ServiceRegistry>,
        clients: Arc<dyn ClientLink>,
    ) -> Self {
        MeshSender {
            mesh,
            cache,
            registry,
            clients,
            round_robin_ctr: AtomicUsize::new(0),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    fn fire_and_forget_header(&self, msg_id: impl Into<String>, stage_id: i64) -> RouteHeader {
        RouteHeader {
            msg_seq: 0,
            service_id: 0,
            msg_id: msg_id.into(),
            from: self.mesh.self_nid(),
            stage_id,
            account_id: 0,
            sid: 0,
            error_code: 0,
            is_reply: false,
        }
    }

    /// Replies to whichever request is described by `current` (spec §4.6).
    /// Fails if `current` was fire-and-forget (`msg_seq == 0`).
    pub fn reply(&self, current: &RouteHeader, msg_id: impl Into<String>, payload: Payload) -> Result<()> {
        if current.is_fire_and_forget() {
            return Err(PlayCoreError::NoReplyContext);
        }
        let header = RouteHeader {
            msg_seq: current.msg_seq,
            service_id: current.service_id,
            msg_id: msg_id.into(),
            from: self.mesh.self_nid(),
            stage_id: current.stage_id,
            account_id: current.account_id,
            sid: current.sid,
            error_code: error_code::SUCCESS,
            is_reply: true,
        };
        self.mesh.send(current.from, RoutePacket::new(header, payload))
    }

    pub fn reply_error(&self, current: &RouteHeader, code: u16) -> Result<()> {
        if current.is_fire_and_forget() {
            return Err(PlayCoreError::NoReplyContext);
        }
        let header = RouteHeader {
            msg_seq: current.msg_seq,
            service_id: current.service_id,
            msg_id: current.msg_id.clone(),
            from: self.mesh.self_nid(),
            stage_id: current.stage_id,
            account_id: current.account_id,
            sid: current.sid,
            error_code: code,
            is_reply: true,
        };
        self.mesh.send(current.from, RoutePacket::new(header, Payload::empty()))
    }

    pub fn send_to_api(&self, nid: ServerNid, msg_id: impl Into<String>, payload: Payload) -> Result<()> {
        self.mesh.send(nid, RoutePacket::new(self.fire_and_forget_header(msg_id, 0), payload))
    }

    pub async fn request_to_api(&self, nid: ServerNid, msg_id: impl Into<String>, payload: Payload) -> Result<RoutePacket> {
        self.request_to(nid, 0, msg_id, payload).await
    }

    pub fn send_to_stage(&self, nid: ServerNid, stage_id: i64, msg_id: impl Into<String>, payload: Payload) -> Result<()> {
        self.mesh.send(nid, RoutePacket::new(self.fire_and_forget_header(msg_id, stage_id), payload))
    }

    pub async fn request_to_stage(&self, nid: ServerNid, stage_id: i64, msg_id: impl Into<String>, payload: Payload) -> Result<RoutePacket> {
        self.request_to(nid, stage_id, msg_id, payload).await
    }

    pub fn send_to_system(&self, nid: ServerNid, msg_id: impl Into<String>, payload: Payload) -> Result<()> {
        self.send_to_api(nid, msg_id, payload)
    }

    pub async fn request_to_system(&self, nid: ServerNid, msg_id: impl Into<String>, payload: Payload) -> Result<RoutePacket> {
        self.request_to_api(nid, msg_id, payload).await
    }

    pub fn send_to_api_service(&self, service_id: u16, msg_id: impl Into<String>, payload: Payload, policy: SendPolicy) -> Result<()> {
        let policy = self.resolve_round_robin(service_id, policy);
        let nid = self
            .registry
            .resolve(service_id, policy)
            .ok_or_else(|| crate::errors::op_failed(format!("no server for service {service_id}")))?;
        self.send_to_api(nid, msg_id, payload)
    }

    fn resolve_round_robin(&self, _service_id: u16, policy: SendPolicy) -> SendPolicy {
        if policy == SendPolicy::RoundRobin {
            self.round_robin_ctr.fetch_add(1, Ordering::Relaxed);
        }
        policy
    }

    async fn request_to(&self, nid: ServerNid, stage_id: i64, msg_id: impl Into<String>, payload: Payload) -> Result<RoutePacket> {
        let handle = self.cache.register(self.default_timeout);
        let header = RouteHeader {
            msg_seq: handle.msg_seq,
            service_id: 0,
            msg_id: msg_id.into(),
            from: self.mesh.self_nid(),
            stage_id,
            account_id: 0,
            sid: 0,
            error_code: 0,
            is_reply: false,
        };
        if let Err(e) = self.mesh.send(nid, RoutePacket::new(header, payload)) {
            warn!("request send failed, will resolve via timeout: {e}");
        }
        self.cache.await_reply(handle).await
    }

    pub fn send_to_client(&self, sid: i64, packet: Packet) -> Result<()> {
        self.clients.send_to_client(sid, packet)
    }

    pub fn close_client_session(&self, sid: i64) {
        self.clients.close_session(sid);
    }

    pub fn self_nid(&self) -> ServerNid {
        self.mesh.self_nid()
    }
}

/// Sender bound to an authenticated actor: carries `account_id`/`sid` and
/// can additionally reach the client directly.
pub struct ActorSender {
    pub inner: Arc<MeshSender>,
    pub stage_id: i64,
    pub account_id: i64,
    pub sid: i64,
}

impl ActorSender {
    pub fn send_to_client(&self, msg_id: impl Into<String>, payload: Payload) -> Result<()> {
        self.inner.send_to_client(self.sid, Packet::new(msg_id, payload))
    }

    pub fn reply(&self, current: &RouteHeader, msg_id: impl Into<String>, payload: Payload) -> Result<()> {
        self.inner.reply(current, msg_id, payload)
    }
}

/// Sender bound to a stage (server-to-server dispatch with no single actor).
pub struct StageSender {
    pub inner: Arc<MeshSender>,
    pub stage_id: i64,
    pub(crate) stage: Weak<Stage>,
}

impl StageSender {
    /// Starts a repeating timer on the owning stage (spec §4.10/C12);
    /// `None` if the stage has already closed and dropped by the time this
    /// runs (possible when called from an `AsyncIO` `post` continuation).
    pub fn schedule_repeated(&self, after: Duration, interval: Duration, action: impl Fn(&Stage) + Send + Sync + 'static) -> Result<Option<TimerHandle>> {
        match self.stage.upgrade() {
            Some(stage) => stage.timers.schedule_repeated(&stage, after, interval, action).map(Some),
            None => Ok(None),
        }
    }

    pub fn schedule_once(&self, after: Duration, action: impl Fn(&Stage) + Send + Sync + 'static) -> Result<Option<TimerHandle>> {
        match self.stage.upgrade() {
            Some(stage) => stage.timers.schedule_once(&stage, after, action).map(Some),
            None => Ok(None),
        }
    }

    /// Starts a `Count(count, interval)` timer that auto-cancels after its
    /// `count`th tick (spec §4.10/§8).
    pub fn schedule_count(
        &self,
        count: u32,
        after: Duration,
        interval: Duration,
        action: impl Fn(&Stage) + Send + Sync + 'static,
    ) -> Result<Option<TimerHandle>> {
        match self.stage.upgrade() {
            Some(stage) => stage.timers.schedule_count(&stage, count, after, interval, action).map(Some),
            None => Ok(None),
        }
    }

    pub fn cancel_timer(&self, handle: TimerHandle) {
        if let Some(stage) = self.stage.upgrade() {
            stage.timers.cancel(handle);
        }
    }
}

/// Sender used by stateless API handlers; `current` must be supplied
/// explicitly by the dispatcher per invocation rather than read from
/// ambient/thread-local state (Design Note 3).
pub struct ApiSender {
    pub inner: Arc<MeshSender>,
}

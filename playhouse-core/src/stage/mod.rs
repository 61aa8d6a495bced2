//! Stage lifecycle, actor roster, dispatch, `AsyncIO` and `CloseStage` (spec §4.8, C10).

pub mod event_loop;

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use playhouse_wire::{Payload, RouteHeader, RoutePacket};
use tokio::sync::RwLock;

use crate::actor::{Actor, ActorFactory, IActor};
use crate::errors::{error_code, Result};
use crate::sender::{ActorSender, MeshSender, StageSender};
use crate::timer::StageTimers;
use crate::{debug, info, warn};
use event_loop::{Dispatcher, StageEventLoop};

/// Internal message ids handled by the stage runtime itself rather than
/// forwarded to `IStage`/`IActor` (spec §4.8).
pub mod sys_msg {
    pub const CREATE_STAGE: &str = "__CreateStage__";
    pub const DISCONNECT_NOTICE: &str = "__DisconnectNotice__";
    pub const STAGE_TIMER_TICK: &str = "__StageTimerTick__";
    pub const ASYNC_BLOCK_CONTINUATION: &str = "__AsyncBlockContinuation__";
    pub const LEAVE_STAGE: &str = "__LeaveStage__";
}

pub const DEFAULT_AUTHENTICATE_MSG_ID: &str = "AuthenticateRequest";
pub const AUTHENTICATE_REPLY_MSG_ID: &str = "AuthenticateReply";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Active,
    Closing,
    Closed,
}

/// User-supplied per-stage handler (spec §6 `IStage`).
#[async_trait]
pub trait IStage: Send + Sync {
    /// Returns `(ok, reply_payload)`; `ok=false` aborts stage creation.
    async fn on_create(&self, packet: &RoutePacket, sender: &StageSender) -> (bool, Option<Payload>);
    async fn on_post_create(&self, _sender: &StageSender) {}
    async fn on_destroy(&self, _sender: &StageSender) {}
    async fn on_join_stage(&self, actor: &Actor, sender: &StageSender) -> bool;
    async fn on_post_join_stage(&self, _actor: &Actor, _sender: &StageSender) {}
    async fn on_connection_changed(&self, _actor: &Actor, _connected: bool, _sender: &StageSender) {}
    async fn on_dispatch_actor(&self, actor: &Actor, packet: RoutePacket, sender: &ActorSender);
    async fn on_dispatch(&self, packet: RoutePacket, sender: &StageSender);
}

type Continuation = Box<dyn FnOnce(&Stage) + Send>;
// boxed FnOnce trait objects are not Sync, but DashMap requires V: Sync;
// wrapping in a Mutex (itself Sync whenever its content is Send) sidesteps
// that without forcing async_io's generic result/continuation to be Sync.
type ContinuationSlot = Mutex<Option<Continuation>>;

/// A room/match/world: the unit of serial execution (spec §3).
pub struct Stage {
    pub stage_id: i64,
    pub stage_type: String,
    state: RwLock<StageState>,
    actors: DashMap<i64, Actor>,
    actor_handlers: DashMap<i64, Arc<dyn IActor>>,
    next_actor_id: AtomicI64,
    continuations: DashMap<u64, ContinuationSlot>,
    next_continuation_id: AtomicU64,
    pub timers: StageTimers,
    event_loop: StageEventLoop,
    user_stage: Arc<dyn IStage>,
    actor_factory: Arc<dyn ActorFactory>,
    authenticate_msg_id: String,
    mesh: Arc<MeshSender>,
    self_ref: std::sync::Weak<Stage>,
}

impl Stage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stage_id: i64,
        stage_type: impl Into<String>,
        user_stage: Arc<dyn IStage>,
        actor_factory: Arc<dyn ActorFactory>,
        authenticate_msg_id: impl Into<String>,
        mesh: Arc<MeshSender>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Stage {
            stage_id,
            stage_type: stage_type.into(),
            state: RwLock::new(StageState::Active),
            actors: DashMap::new(),
            actor_handlers: DashMap::new(),
            next_actor_id: AtomicI64::new(1),
            continuations: DashMap::new(),
            next_continuation_id: AtomicU64::new(1),
            timers: StageTimers::new(),
            event_loop: StageEventLoop::new(stage_id),
            user_stage,
            actor_factory,
            authenticate_msg_id: authenticate_msg_id.into(),
            mesh,
            self_ref: weak.clone(),
        })
    }

    pub async fn state(&self) -> StageState {
        *self.state.read().await
    }

    fn stage_sender(&self) -> StageSender {
        StageSender { inner: self.mesh.clone(), stage_id: self.stage_id, stage: self.self_ref.clone() }
    }

    fn actor_sender(&self, actor: &Actor) -> ActorSender {
        ActorSender { inner: self.mesh.clone(), stage_id: self.stage_id, account_id: actor.actor_id, sid: actor.sid }
    }

    /// Entry point from the session/transport layer and from the mesh bus:
    /// enqueues `packet` into this stage's intake (spec §4.7 `Post`).
    pub fn post(self: &Arc<Self>, packet: RoutePacket) {
        self.event_loop.post(packet, self.clone() as Arc<dyn Dispatcher>);
    }

    /// Split-phase I/O (spec §4.8/§9): `pre` runs off the stage worker and
    /// may block or await; `post` runs back on the stage worker once `pre`
    /// completes, preserving the single-writer invariant. `pre` is handed no
    /// stage handle so it cannot capture stage state across the split
    /// (Design Note 6).
    pub fn async_io<T, Fut, F, P>(self: &Arc<Self>, pre: F, post: P)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        P: FnOnce(&Stage, T) + Send + 'static,
    {
        let stage = self.clone();
        let cont_id = stage.next_continuation_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let result = pre().await;
            let cont: Continuation = Box::new(move |s: &Stage| post(s, result));
            stage.continuations.insert(cont_id, Mutex::new(Some(cont)));
            let header = RouteHeader {
                msg_seq: 0,
                service_id: 0,
                msg_id: sys_msg::ASYNC_BLOCK_CONTINUATION.to_string(),
                from: stage.mesh.self_nid(),
                stage_id: stage.stage_id,
                account_id: 0,
                sid: 0,
                error_code: 0,
                is_reply: false,
            };
            let payload = Payload::owned_unpooled(cont_id.to_le_bytes().to_vec());
            stage.post(RoutePacket::new(header, payload));
        });
    }

    /// `CreateStage`: instantiates `OnCreate` then `OnPostCreate` (spec §4.8).
    /// Called by the stage pool before the stage is reachable from any
    /// intake, so it runs directly rather than through `Post`.
    pub async fn run_create(self: &Arc<Self>, packet: &RoutePacket) -> Result<Option<Payload>> {
        let sender = self.stage_sender();
        let (ok, reply) = self.user_stage.on_create(packet, &sender).await;
        if !ok {
            return Err(crate::errors::op_failed(format!("stage {}: OnCreate rejected", self.stage_id)));
        }
        self.user_stage.on_post_create(&sender).await;
        Ok(reply)
    }

    /// `CloseStage`: idempotent (spec §4.8). Cancels all of this stage's
    /// timers before `OnDestroy` returns, then unbinds every actor.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if *state == StageState::Closed || *state == StageState::Closing {
                return;
            }
            *state = StageState::Closing;
        }
        self.timers.cancel_all();
        self.user_stage.on_destroy(&self.stage_sender()).await;
        self.actors.clear();
        self.actor_handlers.clear();
        *self.state.write().await = StageState::Closed;
        info!("stage {} closed", self.stage_id);
    }

    async fn handle_disconnect(&self, header: &RouteHeader) {
        if let Some(mut entry) = self.actors.get_mut(&header.account_id) {
            entry.connected = false;
        }
        if let Some(actor) = self.actors.get(&header.account_id).map(|e| e.clone()) {
            self.user_stage.on_connection_changed(&actor, false, &self.stage_sender()).await;
        }
    }

    async fn handle_leave(&self, header: &RouteHeader) {
        self.actors.remove(&header.account_id);
        self.actor_handlers.remove(&header.account_id);
    }

    fn handle_timer_tick(&self, packet: &RoutePacket) {
        let bytes = match packet.payload.view() {
            Ok(b) if b.len() == 8 => b,
            _ => {
                warn!("stage {} malformed StageTimerTick payload", self.stage_id);
                return;
            }
        };
        let timer_id = u64::from_le_bytes(bytes.as_ref().try_into().unwrap());
        self.timers.fire(self, timer_id);
    }

    async fn handle_continuation(&self, packet: &RoutePacket) {
        let bytes = match packet.payload.view() {
            Ok(b) if b.len() == 8 => b,
            _ => {
                warn!("stage {} malformed AsyncBlockContinuation payload", self.stage_id);
                return;
            }
        };
        let cont_id = u64::from_le_bytes(bytes.as_ref().try_into().unwrap());
        if let Some((_, slot)) = self.continuations.remove(&cont_id) {
            if let Some(cont) = slot.lock().unwrap().take() {
                cont(self);
            }
        }
    }

    async fn authenticate(&self, packet: RoutePacket) {
        let header = packet.header.clone();
        let actor_id = self.next_actor_id.fetch_add(1, Ordering::Relaxed);
        let pending = Actor::pending(actor_id, header.sid);
        let handler = self.actor_factory.create();
        let actor_sender = self.actor_sender(&pending);

        match handler.on_authenticate(&packet, &actor_sender).await {
            Some(account_id) => {
                let reconnect_target = self
                    .actors
                    .iter()
                    .find(|e| e.value().account_id == account_id && !e.value().connected)
                    .map(|e| *e.key());

                let bound_actor_id = if let Some(existing_id) = reconnect_target {
                    if let Some(mut entry) = self.actors.get_mut(&existing_id) {
                        entry.connected = true;
                        entry.sid = header.sid;
                    }
                    if let Some(existing_handler) = self.actor_handlers.get(&existing_id) {
                        let actor = self.actors.get(&existing_id).unwrap().clone();
                        existing_handler.on_post_authenticate(&actor, &self.actor_sender(&actor)).await;
                        self.user_stage.on_connection_changed(&actor, true, &self.stage_sender()).await;
                    }
                    existing_id
                } else {
                    // the roster add is the "Join" half of authenticate-plus-join
                    // (spec §4.8/§4.9): OnJoinStage can still reject a first-time
                    // actor before it is ever added to the roster.
                    let actor = Actor { authenticated: true, account_id, ..pending };
                    let stage_sender = self.stage_sender();
                    if !self.user_stage.on_join_stage(&actor, &stage_sender).await {
                        let _ = self.mesh.reply_error(&header, error_code::STAGE_FULL);
                        self.mesh.close_client_session(header.sid);
                        return;
                    }
                    self.actors.insert(actor_id, actor.clone());
                    self.actor_handlers.insert(actor_id, handler.clone());
                    handler.on_create(&actor).await;
                    handler.on_post_authenticate(&actor, &self.actor_sender(&actor)).await;
                    self.user_stage.on_post_join_stage(&actor, &stage_sender).await;
                    actor_id
                };
                // the bound actor_id travels back to the session as the reply
                // payload (same convention as StageTimerTick/AsyncBlockContinuation's
                // raw-id payloads) so SessionManager can learn its
                // current_actor_id and stamp it onto later frames from this
                // session (spec §3 Session: "sid and current_actor_id").
                let payload = Payload::owned_unpooled(bound_actor_id.to_le_bytes().to_vec());
                let _ = self.mesh.reply(&header, AUTHENTICATE_REPLY_MSG_ID, payload);
            }
            None => {
                debug!("authentication rejected for sid {}", header.sid);
                let _ = self.mesh.reply_error(&header, error_code::UNAUTHORIZED);
                self.mesh.close_client_session(header.sid);
            }
        }
    }
}

#[async_trait]
impl Dispatcher for Stage {
    async fn dispatch(&self, packet: RoutePacket) {
        let header = packet.header.clone();

        if header.msg_id == self.authenticate_msg_id {
            self.authenticate(packet).await;
            return;
        }

        match header.msg_id.as_str() {
            sys_msg::DISCONNECT_NOTICE => self.handle_disconnect(&header).await,
            sys_msg::LEAVE_STAGE => self.handle_leave(&header).await,
            sys_msg::STAGE_TIMER_TICK => self.handle_timer_tick(&packet),
            sys_msg::ASYNC_BLOCK_CONTINUATION => self.handle_continuation(&packet).await,
            _ => {
                if let Some(actor) = self.actors.get(&header.account_id).map(|e| e.clone()) {
                    let sender = self.actor_sender(&actor);
                    self.user_stage.on_dispatch_actor(&actor, packet, &sender).await;
                } else {
                    self.user_stage.on_dispatch(packet, &self.stage_sender()).await;
                }
            }
        }
    }

    fn on_dispatch_panicked(&self, header: &RouteHeader) {
        let _ = self.mesh.reply_error(header, error_code::SYSTEM_ERROR);
    }
}

/// Owns every live stage, keyed by `stage_id` (spec §4.8 `GetOrCreateStage`).
pub struct StagePool {
    stages: DashMap<i64, Arc<Stage>>,
}

impl Default for StagePool {
    fn default() -> Self {
        Self::new()
    }
}

impl StagePool {
    pub fn new() -> Self {
        StagePool { stages: DashMap::new() }
    }

    pub fn get(&self, stage_id: i64) -> Option<Arc<Stage>> {
        self.stages.get(&stage_id).map(|e| e.clone())
    }

    /// `GetOrCreateStage`: returns the existing stage if present
    /// (`is_created=false`), else follows the `CreateStage` path.
    pub async fn get_or_create_stage(
        &self,
        stage_id: i64,
        stage_type: impl Into<String>,
        user_stage: Arc<dyn IStage>,
        actor_factory: Arc<dyn ActorFactory>,
        authenticate_msg_id: impl Into<String>,
        mesh: Arc<MeshSender>,
        create_packet: &RoutePacket,
    ) -> Result<(Arc<Stage>, bool, Option<Payload>)> {
        if let Some(stage) = self.get(stage_id) {
            return Ok((stage, false, None));
        }
        let stage = Stage::new(stage_id, stage_type, user_stage, actor_factory, authenticate_msg_id, mesh);
        let reply = stage.run_create(create_packet).await?;
        self.stages.insert(stage_id, stage.clone());
        Ok((stage, true, reply))
    }

    pub async fn close_stage(&self, stage_id: i64) {
        if let Some((_, stage)) = self.stages.remove(&stage_id) {
            stage.close().await;
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<i64> = self.stages.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close_stage(id).await;
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

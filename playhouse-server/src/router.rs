//! Inbound mesh routing for a Play server (spec §4.4/§4.8, C14's glue
//! between C5's `InboundRouter` seam and C7/C8/C10).
//!
//! Every packet the mesh bus delivers — including a server's replies to its
//! own clients, which loop back through its own mesh connection (the
//! self-connect quirk documented on [`playhouse_mesh::AddressResolver`]) —
//! passes through here in this order: first try to complete a pending
//! request (C7), then deliver to a locally-connected client (C4) if the
//! header names one, then fall back to stage dispatch/creation (C10).

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use playhouse_core::actor::ActorFactory;
use playhouse_core::errors::error_code;
use playhouse_core::request_cache::RequestCache;
use playhouse_core::sender::{ClientLink, MeshSender};
use playhouse_core::stage::{sys_msg, IStage, StagePool};
use playhouse_core::warn;
use playhouse_mesh::InboundRouter;
use playhouse_wire::{Packet, RoutePacket};

/// One `UseStage<TStage,TActor>(typeName)` bootstrap registration (spec §6).
#[derive(Clone)]
pub struct StageRegistration {
    pub user_stage: Arc<dyn IStage>,
    pub actor_factory: Arc<dyn ActorFactory>,
}

struct Inner {
    cache: Arc<RequestCache>,
    clients: Arc<dyn ClientLink>,
    stages: Arc<StagePool>,
    // `MeshBus::new` needs this router to exist before it can hand out the
    // `MeshSender` the router itself needs to reply - bound once via
    // `PlayRouter::bind_mesh` right after the bus comes up, before it starts
    // accepting connections.
    mesh: OnceLock<Arc<MeshSender>>,
    stage_types: DashMap<String, StageRegistration>,
    default_stage_type: String,
    authenticate_msg_id: String,
}

impl Inner {
    fn mesh(&self) -> &Arc<MeshSender> {
        self.mesh.get().expect("PlayRouter::bind_mesh must run before routing begins")
    }
}

/// The `InboundRouter` a `PlayServer` hands to its [`playhouse_mesh::MeshBus`].
#[derive(Clone)]
pub struct PlayRouter(Arc<Inner>);

impl PlayRouter {
    pub fn new(
        cache: Arc<RequestCache>,
        clients: Arc<dyn ClientLink>,
        stages: Arc<StagePool>,
        default_stage_type: impl Into<String>,
        authenticate_msg_id: impl Into<String>,
    ) -> Self {
        PlayRouter(Arc::new(Inner {
            cache,
            clients,
            stages,
            mesh: OnceLock::new(),
            stage_types: DashMap::new(),
            default_stage_type: default_stage_type.into(),
            authenticate_msg_id: authenticate_msg_id.into(),
        }))
    }

    pub fn register_stage_type(&self, stage_type: impl Into<String>, registration: StageRegistration) {
        self.0.stage_types.insert(stage_type.into(), registration);
    }

    /// Completes construction once the mesh bus this router was handed to
    /// has produced its `MeshSender`. Must run before the bus starts
    /// accepting connections.
    pub fn bind_mesh(&self, mesh: Arc<MeshSender>) {
        let _ = self.0.mesh.set(mesh);
    }
}

impl InboundRouter for PlayRouter {
    fn route(&self, packet: RoutePacket) {
        let inner = self.0.clone();
        tokio::spawn(async move { Inner::handle(&inner, packet).await });
    }
}

impl Inner {
    async fn handle(inner: &Arc<Inner>, packet: RoutePacket) {
        let header = packet.header.clone();

        // A genuine request-reply completion (including cross-server
        // stage<->stage requests) takes the packet; a non-matching reply
        // (the self-loop client-reply case) falls through untouched.
        if header.is_reply && inner.cache.is_pending(header.msg_seq) {
            inner.cache.try_complete(header.msg_seq, packet);
            return;
        }

        if header.sid != 0 {
            if let Err(e) = inner.clients.send_to_client(header.sid, Packet::new(header.msg_id.clone(), packet.payload)) {
                warn!("failed to deliver reply to session {}: {e}", header.sid);
            }
            return;
        }

        Self::route_to_stage(inner, packet, &header).await;
    }

    async fn route_to_stage(inner: &Arc<Inner>, packet: RoutePacket, header: &playhouse_wire::RouteHeader) {
        if let Some(stage) = inner.stages.get(header.stage_id) {
            stage.post(packet);
            return;
        }

        if header.msg_id != sys_msg::CREATE_STAGE {
            warn!("stage {} not found for msg_id {}", header.stage_id, header.msg_id);
            if !header.is_fire_and_forget() {
                let _ = inner.mesh().reply_error(header, error_code::STAGE_NOT_FOUND);
            }
            return;
        }

        let Some(registration) = inner.stage_types.get(&inner.default_stage_type).map(|e| e.clone()) else {
            warn!("no stage type registered for {}", inner.default_stage_type);
            let _ = inner.mesh().reply_error(header, error_code::STAGE_NOT_FOUND);
            return;
        };

        match inner
            .stages
            .get_or_create_stage(
                header.stage_id,
                inner.default_stage_type.clone(),
                registration.user_stage.clone(),
                registration.actor_factory.clone(),
                inner.authenticate_msg_id.clone(),
                inner.mesh().clone(),
                &packet,
            )
            .await
        {
            Ok((_stage, _is_created, reply)) => {
                if let Some(reply_payload) = reply {
                    let _ = inner.mesh().reply(header, sys_msg::CREATE_STAGE, reply_payload);
                }
            }
            Err(e) => {
                warn!("CreateStage failed for stage {}: {e}", header.stage_id);
                let _ = inner.mesh().reply_error(header, error_code::STAGE_NOT_FOUND);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use playhouse_core::actor::{Actor, IActor};
    use playhouse_core::sender::{ActorSender, MeshLink, ServiceRegistry, StageSender};
    use playhouse_wire::{Payload, ServerNid, ServiceType};
    use std::sync::Mutex;
    use std::time::Duration;

    fn header(msg_id: &str, msg_seq: u16, stage_id: i64, sid: i64, is_reply: bool) -> RouteHeader {
        RouteHeader {
            msg_seq,
            service_id: 1,
            msg_id: msg_id.into(),
            from: ServerNid::new(ServiceType::Play, 1),
            stage_id,
            account_id: 0,
            sid,
            error_code: 0,
            is_reply,
        }
    }

    struct RecordingClient {
        delivered: Mutex<Vec<(i64, String)>>,
    }

    impl ClientLink for RecordingClient {
        fn send_to_client(&self, sid: i64, packet: Packet) -> playhouse_core::errors::Result<()> {
            self.delivered.lock().unwrap().push((sid, packet.msg_id));
            Ok(())
        }
        fn close_session(&self, _sid: i64) {}
    }

    struct RecordingMesh {
        self_nid: ServerNid,
        sent: Mutex<Vec<(ServerNid, RouteHeader)>>,
    }

    impl MeshLink for RecordingMesh {
        fn send(&self, nid: ServerNid, packet: RoutePacket) -> playhouse_core::errors::Result<()> {
            self.sent.lock().unwrap().push((nid, packet.header));
            Ok(())
        }

        fn self_nid(&self) -> ServerNid {
            self.self_nid
        }
    }

    struct NoRegistry;
    impl ServiceRegistry for NoRegistry {
        fn resolve(&self, _service_id: u16, _policy: playhouse_core::sender::SendPolicy) -> Option<ServerNid> {
            None
        }
    }

    struct AcceptingStage;
    #[async_trait]
    impl IStage for AcceptingStage {
        async fn on_create(&self, _packet: &RoutePacket, _sender: &StageSender) -> (bool, Option<Payload>) {
            (true, Some(Payload::borrowed(Bytes::from_static(b"welcome"))))
        }
        async fn on_join_stage(&self, _actor: &Actor, _sender: &StageSender) -> bool {
            true
        }
        async fn on_dispatch_actor(&self, _actor: &Actor, _packet: RoutePacket, _sender: &ActorSender) {}
        async fn on_dispatch(&self, _packet: RoutePacket, _sender: &StageSender) {}
    }

    struct NoopActor;
    #[async_trait]
    impl IActor for NoopActor {
        async fn on_authenticate(&self, _packet: &RoutePacket, _sender: &ActorSender) -> Option<String> {
            None
        }
    }

    struct NoopActorFactory;
    impl ActorFactory for NoopActorFactory {
        fn create(&self) -> Arc<dyn IActor> {
            Arc::new(NoopActor)
        }
    }

    fn router_with_mesh(clients: Arc<RecordingClient>) -> (PlayRouter, Arc<RequestCache>, Arc<RecordingMesh>) {
        let cache = Arc::new(RequestCache::new());
        let stages = Arc::new(StagePool::new());
        let router = PlayRouter::new(cache.clone(), clients.clone(), stages, "room", "Authenticate");
        let mesh = Arc::new(RecordingMesh { self_nid: ServerNid::new(ServiceType::Play, 1), sent: Mutex::new(Vec::new()) });
        let mesh_sender = Arc::new(MeshSender::new(mesh.clone(), cache.clone(), Arc::new(NoRegistry), clients));
        router.bind_mesh(mesh_sender);
        (router, cache, mesh)
    }

    #[tokio::test]
    async fn pending_reply_completes_via_cache_without_touching_client() {
        let clients = Arc::new(RecordingClient { delivered: Mutex::new(Vec::new()) });
        let (router, cache, _mesh) = router_with_mesh(clients.clone());

        let handle = cache.register(Duration::from_secs(1));
        let seq = handle.msg_seq;
        let packet = RoutePacket::new(header("EchoReply", seq, 0, 7, true), Payload::borrowed(Bytes::from_static(b"pong")));
        router.route(packet);

        let reply = cache.await_reply(handle).await.unwrap();
        assert_eq!(reply.header.msg_seq, seq);
        assert!(clients.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_pending_reply_with_sid_is_delivered_to_the_client() {
        let clients = Arc::new(RecordingClient { delivered: Mutex::new(Vec::new()) });
        let (router, _cache, _mesh) = router_with_mesh(clients.clone());

        // a self-loop client reply: is_reply=true but nothing in the cache is
        // waiting on this msg_seq, and sid names the connected session.
        let packet = RoutePacket::new(header("EchoReply", 999, 0, 7, true), Payload::borrowed(Bytes::from_static(b"pong")));
        router.route(packet);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*clients.delivered.lock().unwrap(), vec![(7, "EchoReply".to_string())]);
    }

    #[tokio::test]
    async fn create_stage_for_an_unknown_stage_id_creates_it_via_the_registered_type() {
        let clients = Arc::new(RecordingClient { delivered: Mutex::new(Vec::new()) });
        let (router, _cache, mesh) = router_with_mesh(clients);
        router.register_stage_type("room", StageRegistration { user_stage: Arc::new(AcceptingStage), actor_factory: Arc::new(NoopActorFactory) });

        let packet = RoutePacket::new(header(sys_msg::CREATE_STAGE, 5, 42, 0, false), Payload::empty());
        router.route(packet);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(router.0.stages.get(42).is_some());
        let sent = mesh.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.msg_id, sys_msg::CREATE_STAGE);
        assert!(sent[0].1.is_reply);
    }

    #[tokio::test]
    async fn create_stage_with_no_registration_for_the_default_type_replies_stage_not_found() {
        let clients = Arc::new(RecordingClient { delivered: Mutex::new(Vec::new()) });
        let (router, _cache, mesh) = router_with_mesh(clients);

        let packet = RoutePacket::new(header(sys_msg::CREATE_STAGE, 5, 42, 0, false), Payload::empty());
        router.route(packet);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(router.0.stages.get(42).is_none());
        let sent = mesh.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.error_code, error_code::STAGE_NOT_FOUND);
    }
}

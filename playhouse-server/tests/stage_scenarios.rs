//! Cross-module scenarios that no single unit test exercises: a client frame
//! travelling transport -> session -> stage -> actor and back out through the
//! self-loop mesh route, and a stage-owned repeating timer driving the event
//! loop on its own.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use playhouse_core::actor::{Actor, ActorFactory, IActor};
use playhouse_core::request_cache::RequestCache;
use playhouse_core::sender::{ActorSender, ClientLink, MeshSender, SendPolicy, ServiceRegistry, StageSender};
use playhouse_core::stage::{IStage, Stage, StagePool};
use playhouse_mesh::InboundRouter;
use playhouse_wire::{decode_server_frame, encode_client_frame, ClientFrame, Payload, RouteHeader, RoutePacket, ServerNid, ServiceType};
use playhouse_server::config::PlayServerOptions;
use playhouse_server::router::{PlayRouter, StageRegistration};
use playhouse_server::session::SessionManager;
use playhouse_server::transport::TransportEvents;

struct NoRegistry;
impl ServiceRegistry for NoRegistry {
    fn resolve(&self, _service_id: u16, _policy: SendPolicy) -> Option<ServerNid> {
        None
    }
}

/// `PlayRouter::route` is exactly the hop a server's own mesh connection
/// takes to deliver its stages' replies back to itself (see the self-connect
/// note on `playhouse_mesh::AddressResolver`); looping straight into it here
/// skips standing up a real TCP mesh listener for a single-process test.
struct SelfLoopMesh {
    router: PlayRouter,
    self_nid: ServerNid,
}

impl playhouse_core::sender::MeshLink for SelfLoopMesh {
    fn send(&self, _nid: ServerNid, packet: RoutePacket) -> playhouse_core::errors::Result<()> {
        self.router.route(packet);
        Ok(())
    }
    fn self_nid(&self) -> ServerNid {
        self.self_nid
    }
}

mod echo {
    use super::*;

    /// Echoes the request payload straight back to the actor that sent it,
    /// preserving msg_seq correlation via `ActorSender::reply`.
    struct EchoStage;

    #[async_trait]
    impl IStage for EchoStage {
        async fn on_create(&self, _packet: &RoutePacket, _sender: &StageSender) -> (bool, Option<Payload>) {
            (true, None)
        }
        async fn on_join_stage(&self, _actor: &Actor, _sender: &StageSender) -> bool {
            true
        }
        async fn on_dispatch_actor(&self, _actor: &Actor, packet: RoutePacket, sender: &ActorSender) {
            let payload = packet.payload.view().unwrap();
            let _ = sender.reply(&packet.header, "EchoReply", Payload::borrowed(payload));
        }
        async fn on_dispatch(&self, _packet: RoutePacket, _sender: &StageSender) {}
    }

    struct EchoActor;
    #[async_trait]
    impl IActor for EchoActor {
        async fn on_authenticate(&self, _packet: &RoutePacket, _sender: &ActorSender) -> Option<String> {
            Some("account-7".to_string())
        }
    }

    struct EchoActorFactory;
    impl ActorFactory for EchoActorFactory {
        fn create(&self) -> Arc<dyn IActor> {
            Arc::new(EchoActor)
        }
    }

    fn client_frame(stage_id: i64, msg_id: &str, msg_seq: u16, payload: &[u8]) -> Bytes {
        Bytes::from(
            encode_client_frame(&ClientFrame {
                service_id: 0,
                msg_id: msg_id.to_string(),
                msg_seq,
                stage_id,
                payload: Bytes::copy_from_slice(payload),
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn client_authenticates_then_gets_its_request_echoed_back() {
        const STAGE_ID: i64 = 1001;
        let self_nid = ServerNid::new(ServiceType::Play, 1);
        let stages = Arc::new(StagePool::new());
        let sessions = SessionManager::new(stages.clone(), self_nid, PlayServerOptions::default());

        let cache = Arc::new(RequestCache::new());
        let router = PlayRouter::new(cache.clone(), sessions.clone() as Arc<dyn ClientLink>, stages.clone(), "echo", "AuthenticateRequest");
        let mesh_link = Arc::new(SelfLoopMesh { router: router.clone(), self_nid });
        let mesh_sender = Arc::new(MeshSender::new(mesh_link, cache, Arc::new(NoRegistry), sessions.clone() as Arc<dyn ClientLink>));
        router.bind_mesh(mesh_sender.clone());
        router.register_stage_type("echo", StageRegistration { user_stage: Arc::new(EchoStage), actor_factory: Arc::new(EchoActorFactory) });

        // a real deployment provisions the room before a client connects to
        // it (e.g. via a lobby service's CreateStage over the mesh); mirror
        // that here instead of routing CreateStage through a client frame.
        let create_packet = RoutePacket::new(
            RouteHeader { msg_seq: 0, service_id: 0, msg_id: "CreateStage".into(), from: self_nid, stage_id: STAGE_ID, account_id: 0, sid: 0, error_code: 0, is_reply: false },
            Payload::empty(),
        );
        stages
            .get_or_create_stage(STAGE_ID, "echo", Arc::new(EchoStage), Arc::new(EchoActorFactory), "AuthenticateRequest", mesh_sender, &create_packet)
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sid = sessions.on_connect("127.0.0.1:9100".parse().unwrap(), tx, Arc::new(tokio::sync::Notify::new()));

        sessions.on_message(sid, client_frame(STAGE_ID, "AuthenticateRequest", 1, b""));
        let auth_reply = decode_server_frame(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(auth_reply.msg_id, "AuthenticateReply");
        assert_eq!(auth_reply.stage_id, STAGE_ID);

        sessions.on_message(sid, client_frame(STAGE_ID, "EchoRequest", 7, b"Hello"));
        let echo_reply = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
        let echo_reply = decode_server_frame(&echo_reply).unwrap();
        assert_eq!(echo_reply.msg_id, "EchoReply");
        assert_eq!(echo_reply.payload.as_ref(), b"Hello");
    }
}

mod count_timer {
    use super::*;

    /// Starts a `Count(3, 100ms)` timer in `on_post_create` and records every
    /// tick it observes; `StageTimers::schedule_count` auto-cancels after the
    /// third tick (spec §4.10/§8).
    struct CountTimerStage {
        ticks: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl IStage for CountTimerStage {
        async fn on_create(&self, _packet: &RoutePacket, _sender: &StageSender) -> (bool, Option<Payload>) {
            (true, None)
        }

        async fn on_post_create(&self, sender: &StageSender) {
            let ticks = self.ticks.clone();
            let counter = Arc::new(AtomicU32::new(0));
            sender
                .schedule_count(3, Duration::from_millis(100), Duration::from_millis(100), move |_stage: &Stage| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    ticks.lock().unwrap().push(n);
                })
                .unwrap();
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

    struct NullMesh(ServerNid);
    impl playhouse_core::sender::MeshLink for NullMesh {
        fn send(&self, _nid: ServerNid, _packet: RoutePacket) -> playhouse_core::errors::Result<()> {
            Ok(())
        }
        fn self_nid(&self) -> ServerNid {
            self.0
        }
    }

    struct RejectingClients;
    impl ClientLink for RejectingClients {
        fn send_to_client(&self, sid: i64, _packet: playhouse_wire::Packet) -> playhouse_core::errors::Result<()> {
            Err(playhouse_core::errors::op_failed(format!("no session {sid}")))
        }
        fn close_session(&self, _sid: i64) {}
    }

    #[tokio::test]
    async fn count_timer_fires_exactly_three_times_then_stops() {
        let self_nid = ServerNid::new(ServiceType::Play, 1);
        let stages = StagePool::new();
        let mesh = Arc::new(MeshSender::new(
            Arc::new(NullMesh(self_nid)),
            Arc::new(RequestCache::new()),
            Arc::new(NoRegistry),
            Arc::new(RejectingClients),
        ));
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let user_stage = Arc::new(CountTimerStage { ticks: ticks.clone() });
        let create_packet = RoutePacket::new(
            RouteHeader { msg_seq: 0, service_id: 0, msg_id: "CreateStage".into(), from: self_nid, stage_id: 42, account_id: 0, sid: 0, error_code: 0, is_reply: false },
            Payload::empty(),
        );

        stages.get_or_create_stage(42, "timer-room", user_stage, Arc::new(NoopActorFactory), "Authenticate", mesh, &create_packet).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*ticks.lock().unwrap(), vec![1, 2, 3]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*ticks.lock().unwrap(), vec![1, 2, 3]);
    }
}

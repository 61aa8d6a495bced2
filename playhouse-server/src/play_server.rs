//! Play server composition root (spec §4.12, C14): owns the client
//! transports, mesh bus, address resolver and stage pool for one process,
//! and drives the start/stop sequence in the exact order spec.md gives.
//!
//! Grounded on the teacher's `odin_server::spa::SpaServer` bootstrap shape
//! (builder collects registrations, `run` brings every subsystem up in
//! order) adapted from its actor-system macros to plain async composition,
//! since this workspace carries no `odin_actor`-equivalent message-passing
//! runtime for the server process itself.
//!
//! Construction has one genuine cycle: the mesh bus needs a router at
//! construction time, but the router needs the bus's `MeshSender` to reply.
//! [`PlayRouter`] breaks it by taking its `MeshSender` through
//! [`PlayRouter::bind_mesh`] once the bus exists, rather than at
//! construction - everything else builds in a straight line.

use std::net::SocketAddr;
use std::sync::Arc;

use playhouse_core::actor::ActorFactory;
use playhouse_core::request_cache::RequestCache;
use playhouse_core::sender::MeshSender;
use playhouse_core::stage::{IStage, StagePool};
use playhouse_core::{info, warn};
use playhouse_mesh::{AddressResolver, MeshBus, ServerInfo, SystemController, DEFAULT_HEARTBEAT_INTERVAL};
use playhouse_wire::{ServerNid, ServiceType};

use crate::config::PlayServerOptions;
use crate::errors::Result;
use crate::router::{PlayRouter, StageRegistration};
use crate::session::SessionManager;
use crate::transport::{TcpTransport, WsTransport};

/// Bootstrap builder mirroring the spec's `UseStage<TStage,TActor>(typeName)`
/// / `UseSystemController<T>()` registration surface (spec §6).
pub struct PlayServerBuilder {
    options: PlayServerOptions,
    stage_types: Vec<(String, StageRegistration)>,
    system_controller: Option<Arc<dyn SystemController>>,
}

impl PlayServerBuilder {
    pub fn new(options: PlayServerOptions) -> Self {
        PlayServerBuilder { options, stage_types: Vec::new(), system_controller: None }
    }

    pub fn use_stage(mut self, stage_type: impl Into<String>, user_stage: Arc<dyn IStage>, actor_factory: Arc<dyn ActorFactory>) -> Self {
        self.stage_types.push((stage_type.into(), StageRegistration { user_stage, actor_factory }));
        self
    }

    pub fn use_system_controller(mut self, controller: Arc<dyn SystemController>) -> Self {
        self.system_controller = Some(controller);
        self
    }

    pub async fn run(self) -> Result<()> {
        let Some(system_controller) = self.system_controller else {
            return Err(crate::errors::op_failed("PlayServer requires UseSystemController"));
        };
        PlayServer::start(self.options, self.stage_types, system_controller).await
    }
}

/// A running Play server; dropping this without calling [`PlayServer::shutdown`]
/// leaves its background tasks running until the process exits.
pub struct PlayServer {
    self_nid: ServerNid,
    mesh: Arc<MeshBus>,
    resolver: Arc<AddressResolver>,
    stages: Arc<StagePool>,
    cache: Arc<RequestCache>,
    sessions: Arc<SessionManager>,
}

impl PlayServer {
    async fn start(options: PlayServerOptions, stage_types: Vec<(String, StageRegistration)>, system_controller: Arc<dyn SystemController>) -> Result<()> {
        let self_nid = ServerNid::new(ServiceType::Play, options.server_id);
        let stages = Arc::new(StagePool::new());
        let cache = Arc::new(RequestCache::new());
        let sessions = SessionManager::new(stages.clone(), self_nid, options.clone());

        let router = PlayRouter::new(cache.clone(), sessions.clone(), stages.clone(), options.default_stage_type.clone(), options.authenticate_msg_id.clone());
        for (stage_type, registration) in &stage_types {
            router.register_stage_type(stage_type.clone(), registration.clone());
        }

        let mesh = MeshBus::new(self_nid, Arc::new(router.clone()));
        let resolver = Arc::new(AddressResolver::new());
        let registry: Arc<dyn playhouse_core::sender::ServiceRegistry> = resolver.clone();

        let mesh_addr: SocketAddr = options
            .mesh_bind_endpoint
            .parse()
            .map_err(|e| crate::errors::op_failed(format!("invalid mesh_bind_endpoint: {e}")))?;

        let mesh_sender = Arc::new(MeshSender::new(mesh.clone(), cache.clone(), registry, sessions.clone()));
        router.bind_mesh(mesh_sender);

        mesh.listen(mesh_addr).await?;

        let tcp_addr = SocketAddr::new(mesh_addr.ip(), options.tcp_port);
        TcpTransport::serve(tcp_addr, sessions.clone(), options.max_packet_size).await?;
        if let Some(ws_port) = options.ws_port {
            let ws_addr = SocketAddr::new(mesh_addr.ip(), ws_port);
            WsTransport::serve(ws_addr, sessions.clone()).await?;
        }

        // `service_id` is the load-balancing class every server answering this
        // logical service shares, not this server's own unique nid (spec §4.4,
        // AddressResolver's SendPolicy::RoundRobin/Random/Consistent pick among
        // every ServerInfo sharing one service_id).
        let self_info = ServerInfo { nid: self_nid, service_id: self_nid.service_type as u16, bind_endpoint: mesh_addr };
        tokio::spawn(resolver.clone().run_heartbeat_loop(mesh.clone(), system_controller, self_info, DEFAULT_HEARTBEAT_INTERVAL));

        info!("play server {self_nid} listening: mesh={mesh_addr} tcp={tcp_addr} ws={:?}", options.ws_port);

        let server = PlayServer { self_nid, mesh, resolver, stages, cache, sessions };
        server.wait_for_shutdown_signal().await;
        server.shutdown().await;
        Ok(())
    }

    async fn wait_for_shutdown_signal(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let _ = ctrlc::set_handler(move || {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });
        let _ = rx.await;
    }

    /// Shutdown sequence exactly as spec §4.12 gives it, in reverse of start:
    /// stop accepting new client/mesh traffic, stop the resolver, drain the
    /// stage pool, cancel pending requests, then drop the transports/mesh.
    async fn shutdown(self) {
        warn!("play server {} shutting down", self.self_nid);
        self.resolver.sweep_expired();
        self.stages.close_all().await;
        self.cache.cancel_all();
        drop(self.sessions);
        drop(self.mesh);
        info!("play server {} stopped", self.self_nid);
    }
}

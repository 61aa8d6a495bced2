//! API server composition root (spec §4.12, C14): the stateless counterpart
//! of [`crate::play_server::PlayServer`] - mesh bus, address resolver and an
//! [`ApiDispatcher`] worker pool, no stage pool and no client transports at
//! all (API servers are only ever addressed by other servers over the mesh).
//!
//! Shares the play server's `MeshBus`/router construction-order seam: the
//! bus needs a router before it exists, the router needs the bus's
//! `MeshSender` and the dispatcher it forwards requests into, both of which
//! need the bus. [`ApiRouter::bind`] closes the loop the same way
//! [`crate::router::PlayRouter::bind_mesh`] does for the play server.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use playhouse_core::errors::error_code;
use playhouse_core::request_cache::RequestCache;
use playhouse_core::sender::{ClientLink, MeshSender};
use playhouse_core::{info, warn};
use playhouse_mesh::{AddressResolver, InboundRouter, MeshBus, ServerInfo, SystemController, DEFAULT_HEARTBEAT_INTERVAL};
use playhouse_wire::{RoutePacket, ServerNid, ServiceType};

use crate::api_dispatcher::{ApiController, ApiDispatcher, HandlerRegistry, DEFAULT_DRAIN_TIMEOUT, DEFAULT_INTAKE_BOUND};
use crate::config::ApiServerOptions;
use crate::errors::Result;

/// An API server has no locally-connected clients; every inbound packet
/// either completes a pending request or is dispatched to a handler.
struct NoClients;

impl ClientLink for NoClients {
    fn send_to_client(&self, sid: i64, _packet: playhouse_wire::Packet) -> playhouse_core::errors::Result<()> {
        Err(playhouse_core::errors::op_failed(format!("api server has no client sessions (sid {sid})")))
    }
    fn close_session(&self, _sid: i64) {}
}

struct RouterInner {
    cache: Arc<RequestCache>,
    mesh: OnceLock<Arc<MeshSender>>,
    dispatcher: OnceLock<Arc<ApiDispatcher>>,
}

impl RouterInner {
    fn mesh(&self) -> &Arc<MeshSender> {
        self.mesh.get().expect("ApiRouter::bind must run before routing begins")
    }

    fn dispatcher(&self) -> &Arc<ApiDispatcher> {
        self.dispatcher.get().expect("ApiRouter::bind must run before routing begins")
    }
}

#[derive(Clone)]
struct ApiRouter(Arc<RouterInner>);

impl ApiRouter {
    fn new(cache: Arc<RequestCache>) -> Self {
        ApiRouter(Arc::new(RouterInner { cache, mesh: OnceLock::new(), dispatcher: OnceLock::new() }))
    }

    fn bind(&self, mesh: Arc<MeshSender>, dispatcher: Arc<ApiDispatcher>) {
        let _ = self.0.mesh.set(mesh);
        let _ = self.0.dispatcher.set(dispatcher);
    }
}

impl InboundRouter for ApiRouter {
    fn route(&self, packet: RoutePacket) {
        let inner = self.0.clone();
        if packet.header.is_reply && inner.cache.is_pending(packet.header.msg_seq) {
            inner.cache.try_complete(packet.header.msg_seq, packet);
            return;
        }
        let header = packet.header.clone();
        if let Err(packet) = inner.dispatcher().submit(packet) {
            warn!("api dispatcher intake full or closed, rejecting msg_id {}", header.msg_id);
            if !header.is_fire_and_forget() {
                let _ = inner.mesh().reply_error(&packet.header, error_code::SYSTEM_ERROR);
            }
        }
    }
}

/// Bootstrap builder mirroring the spec's `UseController<T>()` / system
/// controller registration surface (spec §6).
pub struct ApiServerBuilder {
    options: ApiServerOptions,
    controllers: Vec<Arc<dyn ApiController>>,
    system_controller: Option<Arc<dyn SystemController>>,
}

impl ApiServerBuilder {
    pub fn new(options: ApiServerOptions) -> Self {
        ApiServerBuilder { options, controllers: Vec::new(), system_controller: None }
    }

    pub fn use_controller(mut self, controller: Arc<dyn ApiController>) -> Self {
        self.controllers.push(controller);
        self
    }

    pub fn use_system_controller(mut self, controller: Arc<dyn SystemController>) -> Self {
        self.system_controller = Some(controller);
        self
    }

    pub async fn run(self) -> Result<()> {
        let Some(system_controller) = self.system_controller else {
            return Err(crate::errors::op_failed("ApiServer requires UseSystemController"));
        };
        ApiServer::start(self.options, self.controllers, system_controller).await
    }
}

/// A running API server; dropping this without calling [`ApiServer::shutdown`]
/// leaves its background tasks running until the process exits.
pub struct ApiServer {
    self_nid: ServerNid,
    mesh: Arc<MeshBus>,
    resolver: Arc<AddressResolver>,
    cache: Arc<RequestCache>,
    dispatcher: Arc<ApiDispatcher>,
}

impl ApiServer {
    async fn start(
        options: ApiServerOptions,
        controllers: Vec<Arc<dyn ApiController>>,
        system_controller: Arc<dyn SystemController>,
    ) -> Result<()> {
        let self_nid = ServerNid::new(ServiceType::Api, options.server_id);
        let cache = Arc::new(RequestCache::new());

        let registry = Arc::new(HandlerRegistry::new());
        for controller in &controllers {
            controller.handles(&registry);
        }

        let router = ApiRouter::new(cache.clone());
        let mesh = MeshBus::new(self_nid, Arc::new(router.clone()));
        let resolver = Arc::new(AddressResolver::new());
        let service_registry: Arc<dyn playhouse_core::sender::ServiceRegistry> = resolver.clone();

        let mesh_addr: SocketAddr = options
            .mesh_bind_endpoint
            .parse()
            .map_err(|e| crate::errors::op_failed(format!("invalid mesh_bind_endpoint: {e}")))?;

        let mesh_sender = Arc::new(MeshSender::new(mesh.clone(), cache.clone(), service_registry, Arc::new(NoClients)));
        let dispatcher =
            Arc::new(ApiDispatcher::start(registry, mesh_sender.clone(), options.worker_count, DEFAULT_INTAKE_BOUND));
        router.bind(mesh_sender, dispatcher.clone());

        mesh.listen(mesh_addr).await?;

        // `service_id` is the load-balancing class every server answering this
        // logical service shares, not this server's own unique nid (spec §4.4,
        // AddressResolver's SendPolicy::RoundRobin/Random/Consistent pick among
        // every ServerInfo sharing one service_id).
        let self_info = ServerInfo { nid: self_nid, service_id: self_nid.service_type as u16, bind_endpoint: mesh_addr };
        tokio::spawn(resolver.clone().run_heartbeat_loop(mesh.clone(), system_controller, self_info, DEFAULT_HEARTBEAT_INTERVAL));

        info!("api server {self_nid} listening: mesh={mesh_addr}");

        let server = ApiServer { self_nid, mesh, resolver, cache, dispatcher };
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

    /// Shutdown sequence exactly as spec §4.12 gives it, in reverse of start.
    async fn shutdown(self) {
        warn!("api server {} shutting down", self.self_nid);
        self.resolver.sweep_expired();
        self.dispatcher.shutdown(DEFAULT_DRAIN_TIMEOUT).await;
        self.cache.cancel_all();
        drop(self.mesh);
        info!("api server {} stopped", self.self_nid);
    }
}

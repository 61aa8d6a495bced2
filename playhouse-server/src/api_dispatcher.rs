//! API dispatcher (spec §4.11, C13): the stateless worker-pool counterpart
//! of the stage event loop, adapted from the teacher's
//! `odin_actor::tokio_rt::RequestProcessor`/`process_requests` pattern —
//! a shared worker pool instead of one actor per entity, since API handlers
//! carry no per-entity state to serialize around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use playhouse_core::sender::{ApiSender, MeshSender};
use playhouse_core::{error, info, warn};
use playhouse_wire::RoutePacket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const DEFAULT_WORKER_COUNT: usize = 8;
pub const DEFAULT_INTAKE_BOUND: usize = 1024;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One `IApiController` handler, resolved by `msg_id` (spec §6 `IApiController`).
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn handle(&self, packet: RoutePacket, sender: &ApiSender);
}

/// `IHandlerRegister`: the registration surface a controller's `Handles`
/// call populates at bootstrap.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn ApiHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(&self, msg_id: impl Into<String>, handler: Arc<dyn ApiHandler>) {
        self.handlers.insert(msg_id.into(), handler);
    }

    fn get(&self, msg_id: &str) -> Option<Arc<dyn ApiHandler>> {
        self.handlers.get(msg_id).map(|e| e.clone())
    }
}

/// `IApiController`: registers its handlers into a [`HandlerRegistry`] at
/// bootstrap.
pub trait ApiController: Send + Sync {
    fn handles(&self, register: &HandlerRegistry);
}

/// Bounded-channel worker pool (spec §9 Open Question: bounded over
/// unbounded spawning, matching the teacher's resource-bound preference).
///
/// Held as a shared `Arc` by both the inbound router (which submits work
/// into it) and the composition root (which shuts it down), so `shutdown`
/// takes `&self` rather than consuming it - worker handles and the shutdown
/// signal live behind interior mutability for that reason.
pub struct ApiDispatcher {
    intake: mpsc::Sender<RoutePacket>,
    accepting: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ApiDispatcher {
    pub fn start(registry: Arc<HandlerRegistry>, mesh: Arc<MeshSender>, worker_count: usize, intake_bound: usize) -> Self {
        let (tx, rx) = mpsc::channel(intake_bound);
        let accepting = Arc::new(AtomicBool::new(true));
        let shutdown_notify = Arc::new(Notify::new());
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let registry = registry.clone();
            let mesh = mesh.clone();
            let rx = rx.clone();
            let shutdown_notify = shutdown_notify.clone();
            workers.push(tokio::spawn(async move {
                info!("api dispatcher worker {worker_id} started");
                loop {
                    let packet = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            packet = guard.recv() => packet,
                            _ = shutdown_notify.notified() => None,
                        }
                    };
                    let Some(packet) = packet else { break };
                    Self::dispatch_one(&registry, &mesh, packet).await;
                }
                info!("api dispatcher worker {worker_id} stopped");
            }));
        }

        ApiDispatcher { intake: tx, accepting, shutdown_notify, worker_count, workers: Mutex::new(workers) }
    }

    async fn dispatch_one(registry: &HandlerRegistry, mesh: &Arc<MeshSender>, packet: RoutePacket) {
        let header = packet.header.clone();
        let Some(handler) = registry.get(&header.msg_id) else {
            warn!("api dispatcher: no handler for msg_id {}", header.msg_id);
            let _ = mesh.reply_error(&header, playhouse_core::errors::error_code::SYSTEM_ERROR);
            return;
        };
        let sender = ApiSender { inner: mesh.clone() };
        let result = std::panic::AssertUnwindSafe(handler.handle(packet, &sender)).catch_unwind().await;
        if let Err(panic) = result {
            error!("api handler panicked on msg_id {}: {panic:?}", header.msg_id);
            let _ = mesh.reply_error(&header, playhouse_core::errors::error_code::SYSTEM_ERROR);
        }
    }

    /// Submits a packet for dispatch; fails fast once shutdown has begun
    /// rather than queuing behind a closing pool (spec §4.11).
    pub fn submit(&self, packet: RoutePacket) -> Result<(), RoutePacket> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(packet);
        }
        self.intake.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(p) => p,
            mpsc::error::TrySendError::Closed(p) => p,
        })
    }

    /// Stops accepting new work and waits for in-flight workers to drain,
    /// force-stopping after `drain_timeout` (spec §4.11/§4.12).
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.accepting.store(false, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        let worker_count = self.worker_count;
        let abort_handles: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();
        if timeout(drain_timeout, futures::future::join_all(workers)).await.is_err() {
            warn!("api dispatcher force-stopping {worker_count} workers after {drain_timeout:?} drain timeout");
            for handle in abort_handles {
                handle.abort();
            }
        } else {
            info!("api dispatcher ({worker_count} workers) drained cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playhouse_core::sender::{ClientLink, MeshLink, ServiceRegistry};
    use playhouse_wire::{Payload, RouteHeader, ServerNid, ServiceType};
    use std::sync::Mutex as StdMutex;

    fn header(msg_id: &str, msg_seq: u16) -> RouteHeader {
        RouteHeader {
            msg_seq,
            service_id: 0,
            msg_id: msg_id.into(),
            from: ServerNid::new(ServiceType::Play, 1),
            stage_id: 0,
            account_id: 0,
            sid: 0,
            error_code: 0,
            is_reply: false,
        }
    }

    struct RecordingMesh {
        self_nid: ServerNid,
        sent: StdMutex<Vec<RouteHeader>>,
    }

    impl MeshLink for RecordingMesh {
        fn send(&self, _nid: ServerNid, packet: RoutePacket) -> playhouse_core::errors::Result<()> {
            self.sent.lock().unwrap().push(packet.header);
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

    struct RejectingClients;
    impl ClientLink for RejectingClients {
        fn send_to_client(&self, sid: i64, _packet: playhouse_wire::Packet) -> playhouse_core::errors::Result<()> {
            Err(playhouse_core::errors::op_failed(format!("no session {sid}")))
        }
        fn close_session(&self, _sid: i64) {}
    }

    fn mesh_sender() -> (Arc<MeshSender>, Arc<RecordingMesh>) {
        let mesh = Arc::new(RecordingMesh { self_nid: ServerNid::new(ServiceType::Play, 1), sent: StdMutex::new(Vec::new()) });
        let sender = Arc::new(MeshSender::new(
            mesh.clone(),
            Arc::new(playhouse_core::request_cache::RequestCache::new()),
            Arc::new(NoRegistry),
            Arc::new(RejectingClients),
        ));
        (sender, mesh)
    }

    struct EchoHandler {
        calls: Arc<StdMutex<Vec<u16>>>,
    }

    #[async_trait]
    impl ApiHandler for EchoHandler {
        async fn handle(&self, packet: RoutePacket, sender: &ApiSender) {
            self.calls.lock().unwrap().push(packet.header.msg_seq);
            let _ = sender.inner.reply(&packet.header, "EchoReply", Payload::empty());
        }
    }

    struct PanicHandler;
    #[async_trait]
    impl ApiHandler for PanicHandler {
        async fn handle(&self, _packet: RoutePacket, _sender: &ApiSender) {
            panic!("handler exploded");
        }
    }

    #[tokio::test]
    async fn submitted_packet_reaches_its_registered_handler() {
        let (mesh, recorded) = mesh_sender();
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("Echo", Arc::new(EchoHandler { calls: calls.clone() }));
        let dispatcher = ApiDispatcher::start(registry, mesh, 2, 16);

        dispatcher.submit(RoutePacket::new(header("Echo", 7), Payload::empty())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*calls.lock().unwrap(), vec![7]);
        assert_eq!(recorded.sent.lock().unwrap().len(), 1);
        assert_eq!(recorded.sent.lock().unwrap()[0].msg_id, "EchoReply");
    }

    #[tokio::test]
    async fn packet_with_no_registered_handler_replies_system_error() {
        let (mesh, recorded) = mesh_sender();
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = ApiDispatcher::start(registry, mesh, 1, 16);

        dispatcher.submit(RoutePacket::new(header("Unknown", 3), Payload::empty())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = recorded.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].error_code, playhouse_core::errors::error_code::SYSTEM_ERROR);
    }

    #[tokio::test]
    async fn handler_panic_is_caught_and_replies_system_error() {
        let (mesh, recorded) = mesh_sender();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("Boom", Arc::new(PanicHandler));
        let dispatcher = ApiDispatcher::start(registry, mesh, 1, 16);

        dispatcher.submit(RoutePacket::new(header("Boom", 9), Payload::empty())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = recorded.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].error_code, playhouse_core::errors::error_code::SYSTEM_ERROR);
    }

    #[tokio::test]
    async fn submit_is_rejected_once_shutdown_has_begun() {
        let (mesh, _recorded) = mesh_sender();
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = ApiDispatcher::start(registry, mesh, 2, 16);

        dispatcher.shutdown(Duration::from_secs(1)).await;
        let rejected = dispatcher.submit(RoutePacket::new(header("Echo", 1), Payload::empty()));
        assert!(rejected.is_err());
    }
}

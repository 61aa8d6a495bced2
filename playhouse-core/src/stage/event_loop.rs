//! The per-stage lock-free intake queue and single logical worker (spec §4.7, C9).
//!
//! This is the heart of the system: `Post` is callable from any thread and
//! never suspends; at most one worker drains a given stage's queue at a
//! time, and the CAS + double-check re-arm closes the race where a late
//! `Post` would otherwise strand a message.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use playhouse_wire::{RouteHeader, RoutePacket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::errors::error_code;
use crate::{error, trace};

/// Delivers a dequeued packet to user code. Implemented by the stage
/// runtime (C10); kept as a trait so the event loop itself stays free of
/// any PlayHouse-specific dispatch logic.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, packet: RoutePacket);

    /// Invoked when `dispatch` panics, with only the header available (the
    /// payload was moved into the panicking call). Default: no-op, a real
    /// stage runtime overrides this to emit a `SystemError` reply when the
    /// inbound header expected one (spec §4.7 exception policy).
    fn on_dispatch_panicked(&self, _header: &RouteHeader) {}
}

/// The CAS-guarded intake + drain worker for a single stage.
///
/// `pending` tracks the number of packets enqueued but not yet dispatched.
/// It exists only so the worker can cheaply ask "did anything arrive while
/// I was finishing up?" without consuming from the channel to find out -
/// `mpsc::UnboundedReceiver` has no non-consuming peek.
pub struct StageEventLoop {
    running: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<RoutePacket>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<RoutePacket>>>,
    stage_id: i64,
}

impl StageEventLoop {
    pub fn new(stage_id: i64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        StageEventLoop {
            running: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(AtomicUsize::new(0)),
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            stage_id,
        }
    }

    /// Enqueues `packet` and, if no worker is currently draining this
    /// stage, spawns one. Never suspends (spec §5).
    pub fn post(&self, packet: RoutePacket, dispatcher: Arc<dyn Dispatcher>) {
        if self.tx.send(packet).is_err() {
            error!("stage {} intake closed, dropping packet", self.stage_id);
            return;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);

        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let running = self.running.clone();
            let pending = self.pending.clone();
            let rx = self.rx.clone();
            let stage_id = self.stage_id;
            tokio::spawn(async move {
                Self::drain(stage_id, running, pending, rx, dispatcher).await;
            });
        }
        // else: some worker is already draining, it will see our packet
    }

    async fn drain(
        stage_id: i64,
        running: Arc<AtomicBool>,
        pending: Arc<AtomicUsize>,
        rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<RoutePacket>>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) {
        trace!("stage {stage_id} worker started");
        loop {
            loop {
                let next = { rx.lock().await.try_recv() };
                match next {
                    Ok(packet) => {
                        pending.fetch_sub(1, Ordering::AcqRel);
                        Self::dispatch_one(&*dispatcher, packet).await;
                    }
                    Err(_) => break,
                }
            }

            running.store(false, Ordering::Release);

            // double-check (spec §4.7): a Post whose enqueue interleaved
            // between our failed try_recv and the store above must not be
            // stranded. Re-arm only if both the counter is nonzero and we
            // win the CAS back to true.
            if pending.load(Ordering::Acquire) > 0
                && running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
            {
                continue;
            }
            break;
        }
        trace!("stage {stage_id} worker exiting");
    }

    async fn dispatch_one(dispatcher: &dyn Dispatcher, packet: RoutePacket) {
        let header = packet.header.clone();
        let result = AssertUnwindSafe(dispatcher.dispatch(packet)).catch_unwind().await;
        if result.is_err() {
            error!("stage {} handler panicked for msg_id={}", header.stage_id, header.msg_id);
            if !header.is_fire_and_forget() {
                dispatcher.on_dispatch_panicked(&header);
            }
        }
    }
}

pub const SYSTEM_ERROR_CODE: u16 = error_code::SYSTEM_ERROR;

#[cfg(test)]
mod tests {
    use super::*;
    use playhouse_wire::{Payload, ServerNid, ServiceType};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    fn header(stage_id: i64, seq: u16) -> RouteHeader {
        RouteHeader {
            msg_seq: seq,
            service_id: 1,
            msg_id: "Test".into(),
            from: ServerNid::new(ServiceType::Play, 1),
            stage_id,
            account_id: 0,
            sid: 0,
            error_code: 0,
            is_reply: false,
        }
    }

    struct RecordingDispatcher {
        order: Mutex<Vec<u16>>,
        panicked: AtomicU32,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, packet: RoutePacket) {
            if packet.header.msg_seq == 666 {
                panic!("boom");
            }
            self.order.lock().unwrap().push(packet.header.msg_seq);
        }

        fn on_dispatch_panicked(&self, _header: &RouteHeader) {
            self.panicked.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_for_a_single_producer() {
        let event_loop = StageEventLoop::new(1);
        let dispatcher = Arc::new(RecordingDispatcher { order: Mutex::new(Vec::new()), panicked: AtomicU32::new(0) });
        for seq in 1..=50u16 {
            event_loop.post(RoutePacket::new(header(1, seq), Payload::empty()), dispatcher.clone());
        }
        // give the drain worker a chance to finish
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let order = dispatcher.order.lock().unwrap().clone();
        assert_eq!(order, (1..=50u16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn handler_panic_does_not_stop_the_loop() {
        let event_loop = StageEventLoop::new(2);
        let dispatcher = Arc::new(RecordingDispatcher { order: Mutex::new(Vec::new()), panicked: AtomicU32::new(0) });
        event_loop.post(RoutePacket::new(header(2, 666), Payload::empty()), dispatcher.clone());
        event_loop.post(RoutePacket::new(header(2, 1), Payload::empty()), dispatcher.clone());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(dispatcher.panicked.load(Ordering::SeqCst), 1);
        assert_eq!(*dispatcher.order.lock().unwrap(), vec![1]);
    }
}

//! Per-stage timer bridge over the generic job scheduler (spec §4.10, C12).
//!
//! Design Note 2: a fired job must not run arbitrary user code off the stage
//! thread. The scheduler's own callback only posts a `StageTimerTick` packet
//! into the owning stage's intake; the actual per-tick closure registered by
//! `schedule_once`/`schedule_repeated` runs later, from inside
//! `Stage::dispatch`, so it sees the same single-writer guarantees as any
//! other message.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use playhouse_timer::JobScheduler;
use playhouse_wire::{Payload, RouteHeader, RoutePacket, ServerNid, ServiceType};

use crate::errors::Result;
use crate::stage::{sys_msg, Stage};

/// Opaque handle returned by [`StageTimers::schedule_once`]/`schedule_repeated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

type TickAction = Box<dyn Fn(&Stage) + Send + Sync>;

struct Registered {
    action: TickAction,
    repeating: bool,
    // `Some` only for a `Count` timer: ticks remaining before `fire` removes
    // the callback itself, rather than waiting on an explicit `cancel`.
    remaining: Option<AtomicU32>,
}

pub struct StageTimers {
    scheduler: Mutex<JobScheduler>,
    callbacks: DashMap<u64, Registered>,
    next_id: AtomicU64,
}

impl Default for StageTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTimers {
    pub fn new() -> Self {
        let mut scheduler = JobScheduler::new();
        scheduler.run().expect("a freshly constructed scheduler is never already running");
        StageTimers { scheduler: Mutex::new(scheduler), callbacks: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    fn post_tick(stage: &Weak<Stage>, timer_id: u64) {
        if let Some(stage) = stage.upgrade() {
            let header = RouteHeader {
                msg_seq: 0,
                service_id: 0,
                msg_id: sys_msg::STAGE_TIMER_TICK.to_string(),
                from: ServerNid::new(ServiceType::Play, 0),
                stage_id: stage.stage_id,
                account_id: 0,
                sid: 0,
                error_code: 0,
                is_reply: false,
            };
            let payload = Payload::owned_unpooled(timer_id.to_le_bytes().to_vec());
            stage.post(RoutePacket::new(header, payload));
        }
    }

    /// Fires `action` once after `after`, on the owning stage's worker.
    pub fn schedule_once(
        &self,
        stage: &Arc<Stage>,
        after: Duration,
        action: impl Fn(&Stage) + Send + Sync + 'static,
    ) -> Result<TimerHandle> {
        let timer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(timer_id, Registered { action: Box::new(action), repeating: false, remaining: None });
        let weak = Arc::downgrade(stage);
        self.scheduler.lock().unwrap().schedule_once(after, move |_ctx| {
            Self::post_tick(&weak, timer_id);
        })?;
        Ok(TimerHandle(timer_id))
    }

    /// Fires `action` every `interval`, starting `after`, until [`cancel`]
    /// is called (spec §4.10 repeat timer).
    pub fn schedule_repeated(
        &self,
        stage: &Arc<Stage>,
        after: Duration,
        interval: Duration,
        action: impl Fn(&Stage) + Send + Sync + 'static,
    ) -> Result<TimerHandle> {
        let timer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(timer_id, Registered { action: Box::new(action), repeating: true, remaining: None });
        let weak = Arc::downgrade(stage);
        self.scheduler.lock().unwrap().schedule_repeated(after, interval, move |_ctx| {
            Self::post_tick(&weak, timer_id);
        })?;
        Ok(TimerHandle(timer_id))
    }

    /// Fires `action` every `interval`, starting `after`, exactly `count`
    /// times, then auto-cancels (spec §4.10/§8 Count timer kind). `count`
    /// must be at least 1.
    pub fn schedule_count(
        &self,
        stage: &Arc<Stage>,
        count: u32,
        after: Duration,
        interval: Duration,
        action: impl Fn(&Stage) + Send + Sync + 'static,
    ) -> Result<TimerHandle> {
        let timer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(timer_id, Registered { action: Box::new(action), repeating: true, remaining: Some(AtomicU32::new(count)) });
        let weak = Arc::downgrade(stage);
        self.scheduler.lock().unwrap().schedule_repeated(after, interval, move |_ctx| {
            Self::post_tick(&weak, timer_id);
        })?;
        Ok(TimerHandle(timer_id))
    }

    /// Invoked by `Stage::dispatch` for a `StageTimerTick` packet. One-shot
    /// callbacks are consumed; repeating callbacks stay registered. A `Count`
    /// callback decrements its remaining counter and removes itself once
    /// exhausted, after running on the tick that exhausts it. A missing
    /// `timer_id` means the timer was cancelled between firing and dispatch -
    /// silently dropped, not an error.
    pub fn fire(&self, stage: &Stage, timer_id: u64) {
        let Some(entry) = self.callbacks.get(&timer_id) else {
            return;
        };
        if !entry.repeating {
            drop(entry);
            if let Some((_, entry)) = self.callbacks.remove(&timer_id) {
                (entry.action)(stage);
            }
            return;
        }
        let exhausted = match &entry.remaining {
            Some(remaining) => remaining.fetch_sub(1, Ordering::AcqRel) <= 1,
            None => false,
        };
        (entry.action)(stage);
        drop(entry);
        if exhausted {
            self.callbacks.remove(&timer_id);
        }
    }

    /// Removes a timer; a no-op if it already fired or was never registered
    /// (spec §4.10 - cancelling is never an error). The underlying scheduler
    /// job is not tracked per timer_id, so a repeating timer keeps waking up
    /// the scheduler after cancel - `fire` finds no callback and drops the
    /// tick. `cancel_all` (stage close) clears the scheduler queue outright.
    pub fn cancel(&self, handle: TimerHandle) {
        self.callbacks.remove(&handle.0);
    }

    pub fn cancel_all(&self) {
        self.scheduler.lock().unwrap().clear();
        self.callbacks.clear();
    }
}

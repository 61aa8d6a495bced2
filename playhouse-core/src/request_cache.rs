//! Request/reply correlation cache (spec §4.5, C7).
//!
//! `msg_seq` is drawn from a single process-wide counter - never a
//! per-sender one - so a reply addressed to *any* sender matches the one
//! pending request that sent it (spec §9, Open Question 3).

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use playhouse_wire::RoutePacket;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::errors::{PlayCoreError, Result};
use crate::{debug, warn};

struct PendingRequest {
    completion: oneshot::Sender<RoutePacket>,
    #[allow(dead_code)]
    deadline: Instant,
}

/// Handle returned by [`RequestCache::register`]; consumed by
/// [`RequestCache::await_reply`].
pub struct RequestHandle {
    pub msg_seq: u16,
    rx: oneshot::Receiver<RoutePacket>,
    deadline: Instant,
}

pub struct RequestCache {
    next_seq: AtomicU16,
    pending: DashMap<u16, PendingRequest>,
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCache {
    pub fn new() -> Self {
        RequestCache { next_seq: AtomicU16::new(1), pending: DashMap::new() }
    }

    /// Draws the next `msg_seq`, wrapping 1..=65535 (0 is reserved for
    /// fire-and-forget, spec §3/§4.5).
    fn next_msg_seq(&self) -> u16 {
        loop {
            let cur = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if cur != 0 {
                return cur;
            }
            // we wrapped past 65535 straight to 0 - fetch_add wrapped the u16,
            // skip 0 and try again
            self.next_seq.store(1, Ordering::Relaxed);
        }
    }

    pub fn register(&self, timeout: Duration) -> RequestHandle {
        let msg_seq = self.next_msg_seq();
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.pending.insert(msg_seq, PendingRequest { completion: tx, deadline });
        RequestHandle { msg_seq, rx, deadline }
    }

    /// Non-destructive check for whether `msg_seq` names a pending request,
    /// so a caller that cannot afford to consume a non-matching packet (it
    /// needs to try a different destination instead) can decide without
    /// racing `try_complete`'s ownership of the packet.
    pub fn is_pending(&self, msg_seq: u16) -> bool {
        self.pending.contains_key(&msg_seq)
    }

    /// Completes a pending request with an inbound reply. Returns `false` if
    /// there was no such pending request (already completed, timed out, or
    /// unknown) — duplicates and late replies are silently ignored per the
    /// request-reply correlation property (spec §8).
    pub fn try_complete(&self, msg_seq: u16, packet: RoutePacket) -> bool {
        match self.pending.remove(&msg_seq) {
            Some((_, pending)) => pending.completion.send(packet).is_ok(),
            None => {
                debug!("no pending request for msg_seq {msg_seq}, dropping reply");
                false
            }
        }
    }

    /// Awaits the reply for a previously registered request, resolving with
    /// `RequestTimeout` if the deadline elapses first (spec §8 Timeout
    /// property). Always removes the cache entry on return.
    pub async fn await_reply(&self, handle: RequestHandle) -> Result<RoutePacket> {
        let msg_seq = handle.msg_seq;
        let timeout = handle.deadline.saturating_duration_since(Instant::now());
        let result = tokio::time::timeout(timeout, handle.rx).await;
        self.pending.remove(&msg_seq);
        match result {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(PlayCoreError::ShuttingDown),
            Err(_) => Err(PlayCoreError::RequestTimeout(timeout)),
        }
    }

    /// Fails every outstanding request with a cancellation code, used at
    /// shutdown (spec §4.12 step 4). The completion side simply drops,
    /// which `await_reply` maps to [`PlayCoreError::ShuttingDown`].
    pub fn cancel_all(&self) {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            warn!("cancelled {count} pending requests on shutdown");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playhouse_wire::{Payload, RouteHeader, ServerNid, ServiceType};

    fn test_header() -> RouteHeader {
        RouteHeader {
            msg_seq: 1,
            service_id: 1,
            msg_id: "EchoReply".into(),
            from: ServerNid::new(ServiceType::Play, 1),
            stage_id: 1,
            account_id: 0,
            sid: 0,
            error_code: 0,
            is_reply: true,
        }
    }

    #[tokio::test]
    async fn reply_completes_the_matching_request_exactly_once() {
        let cache = RequestCache::new();
        let handle = cache.register(Duration::from_secs(1));
        let seq = handle.msg_seq;

        let mut header = test_header();
        header.msg_seq = seq;
        assert!(cache.try_complete(seq, RoutePacket::new(header.clone(), Payload::empty())));
        // a duplicate completion for the same seq is a no-op since the entry is gone
        assert!(!cache.try_complete(seq, RoutePacket::new(header, Payload::empty())));

        let reply = cache.await_reply(handle).await.unwrap();
        assert_eq!(reply.header.msg_seq, seq);
    }

    #[tokio::test]
    async fn unmatched_reply_is_dropped() {
        let cache = RequestCache::new();
        assert!(!cache.try_complete(42, RoutePacket::new(test_header(), Payload::empty())));
    }

    #[tokio::test]
    async fn request_times_out_without_a_reply() {
        let cache = RequestCache::new();
        let handle = cache.register(Duration::from_millis(30));
        let result = cache.await_reply(handle).await;
        assert!(matches!(result, Err(PlayCoreError::RequestTimeout(_))));
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn msg_seq_never_yields_zero() {
        let cache = RequestCache::new();
        cache.next_seq.store(u16::MAX, Ordering::Relaxed);
        assert_ne!(cache.next_msg_seq(), 0);
        assert_ne!(cache.next_msg_seq(), 0);
    }
}

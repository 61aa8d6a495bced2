//! Service membership directory and load-balancing policy (spec §4.5, C6).
//!
//! Grounded on the `odin_job` scheduler driving a periodic heartbeat: rather
//! than gossiping, every server in a service class periodically re-announces
//! itself here and stale entries age out, so [`AddressResolver`] only needs a
//! plain map plus a sweep task, not a consensus protocol.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use playhouse_core::sender::{SendPolicy, ServiceRegistry};
use playhouse_core::{debug, warn};
use playhouse_wire::ServerNid;
use rand::Rng;

use crate::mesh::MeshBus;

/// How long a membership entry is trusted without a fresh heartbeat.
pub const MEMBERSHIP_TTL: Duration = Duration::from_secs(30);

/// How often the heartbeat loop re-announces and re-resolves membership.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// This server's own identity, as published to the discovery sink (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct ServerInfo {
    pub nid: ServerNid,
    pub service_id: u16,
    pub bind_endpoint: SocketAddr,
}

/// The external membership registry (spec §6 `ISystemController`): not
/// implemented here, only its observable contract. The hosting program
/// supplies one (e.g. backed by a config file, DNS, or a real discovery
/// service); `AddressResolver` only needs `update_server_info` to be
/// idempotent and cheap, as the spec requires.
pub trait SystemController: Send + Sync {
    fn update_server_info(&self, self_info: ServerInfo) -> Vec<ServerInfo>;
}

struct Member {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Tracks which `ServerNid`s answer for each `service_id` and resolves a
/// concrete peer per [`SendPolicy`]. One instance is shared by every
/// `MeshSender` in the process (it implements [`ServiceRegistry`]).
pub struct AddressResolver {
    members: DashMap<ServerNid, Member>,
    by_service: DashMap<u16, Vec<ServerNid>>,
    round_robin: DashMap<u16, AtomicUsize>,
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressResolver {
    pub fn new() -> Self {
        AddressResolver { members: DashMap::new(), by_service: DashMap::new(), round_robin: DashMap::new() }
    }

    /// Records (or refreshes) a heartbeat from `nid` serving `service_id` at `addr`.
    pub fn announce(&self, service_id: u16, nid: ServerNid, addr: SocketAddr) {
        self.members.insert(nid, Member { addr, last_seen: Instant::now() });
        self.by_service.entry(service_id).or_default().retain(|existing| *existing != nid);
        self.by_service.entry(service_id).or_default().push(nid);
    }

    /// Drops any membership entry whose last heartbeat is older than
    /// [`MEMBERSHIP_TTL`]. Intended to run on a periodic timer.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<ServerNid> =
            self.members.iter().filter(|e| now.duration_since(e.last_seen) > MEMBERSHIP_TTL).map(|e| *e.key()).collect();
        for nid in expired {
            warn!("mesh member {nid} expired, dropping from the directory");
            self.members.remove(&nid);
            for mut servers in self.by_service.iter_mut() {
                servers.retain(|existing| *existing != nid);
            }
        }
    }

    pub fn address_of(&self, nid: ServerNid) -> Option<SocketAddr> {
        self.members.get(&nid).map(|m| m.addr)
    }

    fn next_round_robin(&self, service_id: u16, len: usize) -> usize {
        let ctr = self.round_robin.entry(service_id).or_insert_with(|| AtomicUsize::new(0));
        ctr.fetch_add(1, Ordering::Relaxed) % len
    }

    /// Periodic heartbeat (spec §4.4): publish `self_info`, absorb the
    /// returned snapshot, and open a mesh connection to every peer not
    /// already connected - including a connection to `self_info.nid` itself
    /// (the self-loop quirk), so intra-host and cross-host stage routing
    /// share one code path. Never closes connections on its own; that is
    /// driven by send errors on the bus (soft membership).
    pub async fn run_heartbeat_loop(
        self: Arc<Self>,
        mesh: Arc<MeshBus>,
        controller: Arc<dyn SystemController>,
        self_info: ServerInfo,
        interval: Duration,
    ) {
        loop {
            let snapshot = controller.update_server_info(self_info);
            for info in &snapshot {
                self.announce(info.service_id, info.nid, info.bind_endpoint);
                mesh.set_peer_address(info.nid, info.bind_endpoint);
                if let Err(e) = mesh.connect(info.nid) {
                    debug!("mesh heartbeat connect to {} deferred: {e}", info.nid);
                }
            }
            self.sweep_expired();
            tokio::time::sleep(interval).await;
        }
    }
}

impl ServiceRegistry for AddressResolver {
    fn resolve(&self, service_id: u16, policy: SendPolicy) -> Option<ServerNid> {
        let servers = self.by_service.get(&service_id)?;
        if servers.is_empty() {
            return None;
        }
        match policy {
            SendPolicy::RoundRobin => {
                let idx = self.next_round_robin(service_id, servers.len());
                servers.get(idx).copied()
            }
            SendPolicy::Random => {
                let idx = rand::rng().random_range(0..servers.len());
                servers.get(idx).copied()
            }
            SendPolicy::Consistent(key) => {
                let idx = (key.rem_euclid(servers.len() as i64)) as usize;
                servers.get(idx).copied()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playhouse_wire::ServiceType;

    fn nid(id: u16) -> ServerNid {
        ServerNid::new(ServiceType::Api, id)
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn round_robin_cycles_through_members() {
        let resolver = AddressResolver::new();
        resolver.announce(7, nid(1), addr());
        resolver.announce(7, nid(2), addr());
        let first = resolver.resolve(7, SendPolicy::RoundRobin).unwrap();
        let second = resolver.resolve(7, SendPolicy::RoundRobin).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn consistent_policy_is_deterministic() {
        let resolver = AddressResolver::new();
        resolver.announce(7, nid(1), addr());
        resolver.announce(7, nid(2), addr());
        let a = resolver.resolve(7, SendPolicy::Consistent(42));
        let b = resolver.resolve(7, SendPolicy::Consistent(42));
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_service_resolves_to_none() {
        let resolver = AddressResolver::new();
        assert!(resolver.resolve(999, SendPolicy::RoundRobin).is_none());
    }

    #[test]
    fn expired_members_are_swept() {
        let resolver = AddressResolver::new();
        resolver.announce(7, nid(1), addr());
        resolver.members.get_mut(&nid(1)).unwrap().last_seen = Instant::now() - MEMBERSHIP_TTL - Duration::from_secs(1);
        resolver.sweep_expired();
        assert!(resolver.resolve(7, SendPolicy::RoundRobin).is_none());
    }
}

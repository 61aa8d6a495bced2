//! The server-to-server fabric: a router-style TCP bus (C5) and the
//! service-membership directory that resolves which peer to dial (C6).

pub mod errors;
pub mod mesh;
pub mod resolver;

pub use errors::{PlayMeshError, Result};
pub use mesh::{InboundRouter, MeshBus};
pub use resolver::{AddressResolver, ServerInfo, SystemController, DEFAULT_HEARTBEAT_INTERVAL, MEMBERSHIP_TTL};

//! Typed byte-buffer abstraction (`Payload`/`Packet`) and the mesh wire
//! codec shared by every PlayHouse server process.

pub mod codec;
pub mod errors;
pub mod payload;
pub mod route;

pub use codec::{ClientFrame, ServerFrame, DEFAULT_MAX_PACKET_SIZE, LZ4_MIN_SIZE, LZ4_RATIO_GATE};
pub use codec::{decode_client_frame, decode_mesh_frame, decode_server_frame, encode_client_frame, encode_mesh_frame, encode_server_frame};
pub use codec::{frame_with_length_prefix, split_frames, LENGTH_PREFIX_SIZE};
pub use errors::{PlayWireError, Result};
pub use payload::{Packet, Payload, ReleaseFn};
pub use route::{RouteHeader, RoutePacket, ServerNid, ServiceType};

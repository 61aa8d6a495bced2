use std::fmt;
use std::str::FromStr;

use crate::errors::{op_failed, Result};
use crate::payload::Payload;

/// Service kind a [`ServerNid`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Play = 1,
    Api = 2,
}

impl ServiceType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(ServiceType::Play),
            2 => Some(ServiceType::Api),
            _ => None,
        }
    }
}

/// Server identity: `"<service_type>:<server_id>"`, e.g. `"1:2"` for Play server 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerNid {
    pub service_type: ServiceType,
    pub server_id: u16,
}

impl ServerNid {
    pub fn new(service_type: ServiceType, server_id: u16) -> Self {
        ServerNid { service_type, server_id }
    }
}

impl fmt::Display for ServerNid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_type as u16, self.server_id)
    }
}

impl FromStr for ServerNid {
    type Err = crate::errors::PlayWireError;

    fn from_str(s: &str) -> Result<Self> {
        let (t, id) = s.split_once(':').ok_or_else(|| op_failed(format!("malformed nid: {s}")))?;
        let service_type = t
            .parse::<u16>()
            .ok()
            .and_then(ServiceType::from_u16)
            .ok_or_else(|| op_failed(format!("unknown service type in nid: {s}")))?;
        let server_id = id.parse::<u16>().map_err(|_| op_failed(format!("malformed server id in nid: {s}")))?;
        Ok(ServerNid { service_type, server_id })
    }
}

/// Mesh envelope carried with every [`RoutePacket`].
///
/// `msg_seq == 0` means fire-and-forget; any other value pairs a request
/// with its eventual reply via the request cache.
#[derive(Debug, Clone)]
pub struct RouteHeader {
    pub msg_seq: u16,
    pub service_id: u16,
    pub msg_id: String,
    pub from: ServerNid,
    pub stage_id: i64,
    pub account_id: i64,
    pub sid: i64,
    pub error_code: u16,
    pub is_reply: bool,
}

impl RouteHeader {
    pub fn is_fire_and_forget(&self) -> bool {
        self.msg_seq == 0
    }
}

/// The unit of inter-server transport and intra-server dispatch.
#[derive(Debug)]
pub struct RoutePacket {
    pub header: RouteHeader,
    pub payload: Payload,
}

impl RoutePacket {
    pub fn new(header: RouteHeader, payload: Payload) -> Self {
        RoutePacket { header, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nid_roundtrips_through_display_and_parse() {
        let nid = ServerNid::new(ServiceType::Play, 2);
        assert_eq!(nid.to_string(), "1:2");
        let parsed: ServerNid = "1:2".parse().unwrap();
        assert_eq!(parsed, nid);
    }

    #[test]
    fn nid_rejects_unknown_service_type() {
        assert!("9:2".parse::<ServerNid>().is_err());
    }
}

//! Bootstrap options (spec §6 `PlayServerOptions`/`ApiServerOptions`),
//! loadable from RON with `Default` impls matching the spec's stated
//! defaults (30 s reconnect grace, 30 s request timeout, 2 MiB max packet).

use std::path::Path;
use std::time::Duration;

use playhouse_wire::DEFAULT_MAX_PACKET_SIZE;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayServerOptions {
    pub server_id: u16,
    pub mesh_bind_endpoint: String,
    pub tcp_port: u16,
    pub ws_port: Option<u16>,
    pub request_timeout_ms: u64,
    pub authenticate_msg_id: String,
    pub default_stage_type: String,
    pub reconnect_grace_ms: u64,
    pub max_packet_size: usize,
}

impl Default for PlayServerOptions {
    fn default() -> Self {
        PlayServerOptions {
            server_id: 1,
            mesh_bind_endpoint: "127.0.0.1:7000".to_string(),
            tcp_port: 7100,
            ws_port: Some(7200),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            authenticate_msg_id: "AuthenticateRequest".to_string(),
            default_stage_type: "default".to_string(),
            reconnect_grace_ms: DEFAULT_RECONNECT_GRACE.as_millis() as u64,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerOptions {
    pub server_id: u16,
    pub mesh_bind_endpoint: String,
    pub request_timeout_ms: u64,
    pub worker_count: usize,
}

impl Default for ApiServerOptions {
    fn default() -> Self {
        ApiServerOptions {
            server_id: 1,
            mesh_bind_endpoint: "127.0.0.1:8000".to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            worker_count: 8,
        }
    }
}

pub fn load_play_server_options(path: &Path) -> Result<PlayServerOptions> {
    let text = std::fs::read_to_string(path)?;
    Ok(ron::de::from_str(&text)?)
}

pub fn load_api_server_options(path: &Path) -> Result<ApiServerOptions> {
    let text = std::fs::read_to_string(path)?;
    Ok(ron::de::from_str(&text)?)
}

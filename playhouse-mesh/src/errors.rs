use playhouse_wire::ServerNid;
use thiserror::Error;

/// Errors from mesh connection setup and inter-server routing.
#[derive(Error, Debug)]
pub enum PlayMeshError {
    #[error("no known address for {0}")]
    PeerUnreachable(ServerNid),

    #[error("connect to {0} failed: {1}")]
    ConnectFailed(ServerNid, String),

    #[error("wire error: {0}")]
    WireError(#[from] playhouse_wire::PlayWireError),

    #[error("core error: {0}")]
    CoreError(#[from] playhouse_core::PlayCoreError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("operation failed: {0}")]
    OpFailed(String),
}

pub type Result<T> = std::result::Result<T, PlayMeshError>;

pub fn op_failed(msg: impl ToString) -> PlayMeshError {
    PlayMeshError::OpFailed(msg.to_string())
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlayServerError>;

#[derive(Error, Debug)]
pub enum PlayServerError {
    #[error("core error: {0}")]
    CoreError(#[from] playhouse_core::PlayCoreError),

    #[error("mesh error: {0}")]
    MeshError(#[from] playhouse_mesh::PlayMeshError),

    #[error("wire error: {0}")]
    WireError(#[from] playhouse_wire::PlayWireError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("axum error: {0}")]
    AxumError(#[from] axum::Error),

    #[error("RON deserialization error: {0}")]
    RonDeError(#[from] ron::de::SpannedError),

    #[error("session not found: {0}")]
    SessionNotFound(i64),

    #[error("operation failed: {0}")]
    OpFailed(String),
}

pub fn op_failed(msg: impl ToString) -> PlayServerError {
    PlayServerError::OpFailed(msg.to_string())
}

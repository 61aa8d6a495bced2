use thiserror::Error;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, PlayCoreError>;

#[derive(Error,Debug)]
pub enum PlayCoreError {

    #[error("receiver closed")]
    ReceiverClosed,

    #[error("receiver queue full")]
    ReceiverFull,

    #[error("request timeout: {0:?}")]
    RequestTimeout(Duration),

    #[error("stage not found: {0}")]
    StageNotFound(i64),

    #[error("stage full: {0}")]
    StageFull(i64),

    #[error("actor not authenticated")]
    Unauthorized,

    #[error("no current header to reply to, or msg_seq=0")]
    NoReplyContext,

    #[error("wire error: {0}")]
    WireError( #[from] playhouse_wire::PlayWireError),

    #[error("timer error: {0}")]
    TimerError( #[from] playhouse_timer::TimerError),

    #[error("failed to join task")]
    JoinError,

    #[error("shutting down")]
    ShuttingDown,

    #[error("operation failed: {0}")]
    OpFailed(String),
}

pub fn op_failed (msg: impl ToString)->PlayCoreError {
    PlayCoreError::OpFailed(msg.to_string())
}

/// Wire-level `ErrorCode` values (spec §6). 0 = success; nonzero
/// system codes are reserved, anything else is a user code.
pub mod error_code {
    pub const SUCCESS: u16 = 0;
    pub const SYSTEM_ERROR: u16 = 1;
    pub const STAGE_NOT_FOUND: u16 = 2;
    pub const UNAUTHORIZED: u16 = 3;
    pub const STAGE_FULL: u16 = 4;
    pub const REQUEST_TIMEOUT: u16 = 5;
    pub const UNREACHABLE_PEER: u16 = 6;
    pub const SHUTTING_DOWN: u16 = 7;
    /// user error codes must be >= this value
    pub const USER_CODE_BASE: u16 = 1000;
}

impl PlayCoreError {
    /// Maps an internal error to the wire `ErrorCode` it should be reported as.
    pub fn to_error_code(&self) -> u16 {
        match self {
            PlayCoreError::StageNotFound(_) => error_code::STAGE_NOT_FOUND,
            PlayCoreError::StageFull(_) => error_code::STAGE_FULL,
            PlayCoreError::Unauthorized => error_code::UNAUTHORIZED,
            PlayCoreError::RequestTimeout(_) => error_code::REQUEST_TIMEOUT,
            PlayCoreError::ShuttingDown => error_code::SHUTTING_DOWN,
            _ => error_code::SYSTEM_ERROR,
        }
    }
}

use thiserror::Error;

/// Errors from payload handling and wire (de)serialization.
#[derive(Error, Debug)]
pub enum PlayWireError {
    #[error("payload already released")]
    PayloadReleased,

    #[error("empty msg_id")]
    EmptyMsgId,

    #[error("msg_id too long: {0} bytes")]
    MsgIdTooLong(usize),

    #[error("packet too short: need at least {need} bytes, got {got}")]
    PacketTooShort { need: usize, got: usize },

    #[error("packet exceeds max size: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("msg_id is not valid UTF-8")]
    InvalidMsgId,

    #[error("lz4 compression failed: {0}")]
    CompressionFailed(String),

    #[error("lz4 decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("operation failed: {0}")]
    OpFailed(String),
}

pub type Result<T> = std::result::Result<T, PlayWireError>;

pub fn op_failed(msg: impl ToString) -> PlayWireError {
    PlayWireError::OpFailed(msg.to_string())
}

// Error taxonomy surfaced by the client API and the read-path hooks.
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] natter_wire::Error),
    #[error("control line exceeds {limit} bytes")]
    ControlLineTooLong { limit: usize },
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("request timed out")]
    RequestTimeout,
    #[error("request cancelled")]
    RequestCancelled,
}

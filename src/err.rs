use crate::conn::State;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation would block, connection state: {0:?}")]
    WouldBlock(State),

    #[error("operation not valid in connection state: {0:?}")]
    InvalidState(State),

    #[error("connection registry is full (max {0} connections)")]
    ConnectionLimitReached(usize),

    #[error("caller buffer too small to hold next in-order packet ({needed} bytes needed, {available} available)")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("vector count {0} exceeds the maximum of {1}")]
    TooManyVecs(usize, usize),
}

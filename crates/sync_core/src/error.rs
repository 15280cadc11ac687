use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
}

/// Failure of one send attempt. Local to that message: nothing is retried and
/// nothing is ingested.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("sync client not started")]
    NotStarted,
    #[error("send rejected by backend: {0}")]
    Backend(String),
}

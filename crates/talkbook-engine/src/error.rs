use std::io;

use thiserror::Error;

/// Failure taxonomy shared by every stage of the engine.
///
/// Payloads are strings so a stream session can keep its terminal error and hand
/// out clones of it on every later read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    /// Network or read failure; retried inside the stream before it is surfaced.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Unexpected status or length from the transport; never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation on a stream session after `close()`.
    #[error("stream closed")]
    Closed,

    /// Unrecognizable or unsupported payload; fatal for one fragment.
    #[error("format error: {0}")]
    Format(String),

    /// Output device could not be opened, switched or written.
    #[error("device error: {0}")]
    Device(String),

    /// Invalid call sequence or argument.
    #[error("invalid state: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;

impl PlayerError {
    /// Whether a fresh attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlayerError::TransientIo(_))
    }

    /// Recover a typed error that travelled through `std::io`.
    ///
    /// Errors that did not originate here become `TransientIo`.
    pub fn from_io(err: &io::Error) -> Self {
        match err.get_ref().and_then(|e| e.downcast_ref::<PlayerError>()) {
            Some(inner) => inner.clone(),
            None => PlayerError::TransientIo(err.to_string()),
        }
    }
}

impl From<PlayerError> for io::Error {
    fn from(err: PlayerError) -> Self {
        let kind = match err {
            PlayerError::Closed => io::ErrorKind::NotConnected,
            PlayerError::State(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

use std::io;
use std::time::Duration;

use thiserror::Error;

/// The byte stream did not contain a complete, acceptable frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("need 4 bytes for the length prefix, got {available}")]
    ShortPrefix { available: usize },

    #[error("frame declares {declared} bytes but only {available} follow")]
    ShortBody { declared: usize, available: usize },

    #[error("frame of {declared} bytes exceeds the frame size limit")]
    TooLarge { declared: usize },
}

/// A complete frame whose body is not a valid envelope or payload.
#[derive(Debug, Error)]
#[error("unparseable payload: {0}")]
pub struct PayloadError(#[from] pub serde_json::Error);

/// Failure to turn bytes into an envelope, or an envelope into bytes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// A round trip that could not be completed. Never carries a `Response`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("deadline elapsed")]
    TimedOut,

    #[error("timeout of {0:?} cannot be represented as a deadline")]
    TimeoutOutOfRange(Duration),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("unparseable envelope: {0}")]
    Envelope(#[from] PayloadError),

    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: u32, got: u32 },
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Framing(e) => Self::Framing(e),
            ProtocolError::Payload(e) => Self::Envelope(e),
        }
    }
}

use std::io;

/// Result type used throughout the framed transport and UDP layers.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// An operation either has to wait for more data/capacity, or has failed fatally and the
/// owning session/channel must be torn down.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("would block, try again later")]
    Wait,
    #[error("fatal transport error: {0}")]
    Fatal(#[from] ErrorType),
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorType {
    #[error("frame exceeds the size cap for the current phase")]
    FrameTooLarge,
    #[error("frame truncated before a full header could be read")]
    Truncated,
    #[error("message not permitted in the current session phase")]
    ProtocolViolation,
    #[error("message could not be decoded")]
    Undecodable,
    #[error("cryptographic verification failed")]
    Crypto,
    #[error("unknown callsign or bad credential")]
    Authentication,
    #[error("peer certificate missing or invalid")]
    TlsPeerCert,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            _ => NetworkError::Fatal(ErrorType::Io(err)),
        }
    }
}

/// Mirrors the teacher's `ErrorUtils` helper: distinguishes "nothing happened yet, come back
/// later" from an error that should tear down the connection.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetworkError::Wait))
    }
}

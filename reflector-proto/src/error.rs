/// Failure to decode a message body. Carries no context beyond the kind of mismatch, since the
/// caller (the session state machine) only ever needs to know whether to drop the connection.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum CodecError {
    #[error("buffer ended before a complete field could be read")]
    Truncated,
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("string field was not valid UTF-8")]
    InvalidUtf8,
    #[error("trailing bytes after decoding a fixed-size message")]
    TrailingBytes,
}

pub type CodecResult<T> = Result<T, CodecError>;

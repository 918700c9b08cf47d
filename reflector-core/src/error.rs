/// Errors surfaced by the client registry (spec.md §4.6 / §8 invariant 1).
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("client-id space exhausted")]
    ClientIdSpaceExhausted,
    #[error("session handle is stale")]
    StaleHandle,
}

/// Errors surfaced by the talk-group dispatcher (spec.md §4.7). All of these are authorization
/// or housekeeping outcomes, not transport failures; per spec.md §7 the caller's policy is to
/// drop the offending action and keep the session connected.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum DispatchError {
    #[error("callsign {0:?} is not permitted on talk group {1}")]
    NotAllowed(String, u32),
    #[error("session handle is stale")]
    StaleHandle,
}

pub type RegistryResult<T> = Result<T, RegistryError>;
pub type DispatchResult<T> = Result<T, DispatchError>;

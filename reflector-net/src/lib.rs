//! Transport-level primitives for the reflector: framed TCP with phase-scoped size caps,
//! optional TLS with client certificate verification, and an authenticated UDP datagram
//! format. Protocol-level message semantics live in `reflector-proto`; this crate only knows
//! about bytes, sizes, and the cryptographic envelope.

pub mod error;
pub mod framing;
pub mod logging;
pub mod tls;
pub mod udp;

pub use error::{ErrorType, NetworkError, NetworkResult};

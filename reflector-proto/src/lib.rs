//! Protocol codec: tagged TCP control messages and UDP media-plane messages (spec.md §4.3).
//! Pure pack/unpack — no I/O, no session state. Framing and transport live in `reflector-net`;
//! the session state machine that decides which messages are legal in which phase lives in
//! `reflector-core`.

pub mod error;
pub mod message;
pub mod types;
pub mod udp_message;
pub mod wire;

pub use error::{CodecError, CodecResult};
pub use message::{Message, RxStatus, TxStatus};
pub use udp_message::UdpMessage;

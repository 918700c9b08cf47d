//! Reflector core (spec.md §3-§4): the transport-agnostic domain model shared by every
//! connection the server handles — session state and phase rules (C4), the client registry
//! (C6), the talk-group dispatcher (C7), the broadcast engine (C8), session filters, the random
//! QSY allocator (C12) and the dynamic config store (C11).
//!
//! Nothing in this crate touches a socket, a TLS handshake or the filesystem. Every operation
//! here is synchronous and deterministic given its inputs, so it can be driven directly from
//! unit tests; `reflector-server` owns the tokio runtime, the actual transports, and turns this
//! crate's `DispatchEffect`/`ConfigChange` outputs into real I/O.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod qsy;
pub mod registry;
pub mod session;

pub use auth::UserDirectory;
pub use broadcast::broadcast;
pub use config::{ConfigChange, ConfigError, DynamicConfig};
pub use dispatcher::{DispatchEffect, Dispatcher, TalkGroupConfig};
pub use error::{DispatchError, DispatchResult, RegistryError, RegistryResult};
pub use filter::Filter;
pub use qsy::QsyPool;
pub use registry::ClientRegistry;
pub use session::{admin_message_allowed, Phase, ProtoVersion, Session, SessionHandle};

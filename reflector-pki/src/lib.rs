//! Embedded PKI (spec.md §4.5): root CA, issuing CA, server and client certificate lifecycle,
//! CSR intake with pending/signed directories, the CA bundle served to clients, and the external
//! CA-approval hook.

pub mod bundle;
pub mod chain;
pub mod csr;
pub mod error;
pub mod hook;
pub mod keys;
pub mod rustls_bridge;

pub use bundle::CaBundle;
pub use chain::{load_issued, IssuedCert};
pub use csr::{common_name, CsrIntake, IntakeOutcome};
pub use hook::CaOp;
pub use error::{PkiError, PkiResult};

//! TLS wiring for the post-handshake portion of a TCP session (spec.md §4.1). A client that
//! presents no certificate is still allowed to complete the handshake — that is the "TLS
//! handshake fallback" into `EXPECT_CSR` (spec.md §4.4/§4.5) a node without a signed certificate
//! yet takes. A client that *does* present one must chain to `trusted_ca`.

use crate::error::{ErrorType, NetworkError, NetworkResult};
use rustls::server::AllowAnyAnonymousOrAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use std::sync::Arc;
use x509_parser::prelude::*;

/// Builds the server-side TLS config: present the server's own certificate chain, accept a
/// client certificate issued by `trusted_ca` if one is offered, but don't require one (spec.md
/// §4.4 `EXPECT_SSL_CON_READY` "no peer cert" branch).
pub fn server_config(
    cert_chain: Vec<Certificate>,
    key: PrivateKey,
    trusted_ca: &Certificate,
) -> NetworkResult<Arc<ServerConfig>> {
    let mut roots = RootCertStore::empty();
    roots
        .add(trusted_ca)
        .map_err(|_| NetworkError::Fatal(ErrorType::TlsPeerCert))?;

    let verifier = AllowAnyAnonymousOrAuthenticatedClient::new(roots);

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(cert_chain, key)
        .map_err(|_| NetworkError::Fatal(ErrorType::TlsPeerCert))?;

    Ok(Arc::new(config))
}

/// Extracts the CN (common name) from a peer's leaf certificate. Returns `None` if there is no
/// certificate, it cannot be parsed, or the CN is empty — in all of those cases the session
/// must be rejected per spec.md §4.1.
pub fn peer_common_name(peer_certs: Option<&[Certificate]>) -> Option<String> {
    let certs = peer_certs?;
    let leaf = certs.first()?;
    let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).ok()?;

    let cn = parsed
        .subject()
        .iter_common_name()
        .next()?
        .as_str()
        .ok()?
        .to_string();

    if cn.is_empty() {
        None
    } else {
        Some(cn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_peer_certs_has_no_cn() {
        assert_eq!(peer_common_name(None), None);
        assert_eq!(peer_common_name(Some(&[])), None);
    }
}

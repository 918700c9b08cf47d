//! Converts this crate's PEM-encoded certificates and keys into the `rustls` types that
//! `reflector-net::tls::server_config` expects. Kept separate from `chain.rs` so that module can
//! stay focused on certificate issuance.

use crate::error::{PkiError, PkiResult};
use rustls::{Certificate, PrivateKey};
use std::io::Cursor;

pub fn parse_cert_chain(pem: &str) -> PkiResult<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(pem.as_bytes()))
        .map_err(|_| PkiError::InvalidCsr)?;
    Ok(certs.into_iter().map(Certificate).collect())
}

pub fn parse_private_key(pem: &str) -> PkiResult<PrivateKey> {
    let mut cursor = Cursor::new(pem.as_bytes());
    let keys = rustls_pemfile::pkcs8_private_keys(&mut cursor).map_err(|_| PkiError::InvalidCsr)?;
    let key = keys.into_iter().next().ok_or(PkiError::InvalidCsr)?;
    Ok(PrivateKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::generate_root_ca;

    #[test]
    fn parses_generated_cert_and_key() {
        let root = generate_root_ca("Test Root CA").unwrap();
        let certs = parse_cert_chain(&root.cert_pem).unwrap();
        assert_eq!(certs.len(), 1);
        parse_private_key(&root.key_pem).unwrap();
    }
}

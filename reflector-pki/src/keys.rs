//! RSA key-pair generation. `rcgen` itself only generates elliptic-curve and Ed25519 keys, so
//! RSA key material (mandated by spec.md §4.5) is generated with the `rsa` crate and handed to
//! `rcgen` as an externally-supplied key pair.

use crate::error::{PkiError, PkiResult};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;

pub fn generate_rsa_keypair(bits: usize) -> PkiResult<rcgen::KeyPair> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits).map_err(|_| PkiError::KeyGeneration)?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|_| PkiError::KeyGeneration)?;
    rcgen::KeyPair::from_der(der.as_bytes()).map_err(|_| PkiError::KeyGeneration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_a_usable_keypair() {
        let kp = generate_rsa_keypair(2048).unwrap();
        assert!(!kp.serialize_der().is_empty());
    }
}

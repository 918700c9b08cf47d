//! The CA bundle offered to clients during handshake (spec.md §4.4/§4.5/§6): the concatenated
//! root + issuing CA PEM, its size and SHA-256 digest (sent as `MsgCAInfo`), and a signature of
//! that digest by the issuing CA's key (sent inside `MsgCABundle`).

use crate::chain::IssuedCert;
use crate::error::{PkiError, PkiResult};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

pub struct CaBundle {
    pub pem: String,
    pub digest: [u8; 32],
    pub signature: Vec<u8>,
}

impl CaBundle {
    pub fn size(&self) -> u32 {
        self.pem.len() as u32
    }
}

/// Concatenates root + issuing CA certificates, digests the result, and signs the digest with
/// the issuing CA's private key (PKCS#1 v1.5 over SHA-256).
pub fn build(root: &IssuedCert, issuing: &IssuedCert) -> PkiResult<CaBundle> {
    let mut pem = String::new();
    pem.push_str(&root.cert_pem);
    pem.push_str(&issuing.cert_pem);

    let mut hasher = Sha256::new();
    hasher.update(pem.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();

    let signing_key_der = issuing.cert.serialize_private_key_der();
    let rsa_key = RsaPrivateKey::from_pkcs8_der(&signing_key_der).map_err(|_| PkiError::Signing)?;
    let signing_key = SigningKey::<Sha256>::new(rsa_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, &digest).to_vec();

    Ok(CaBundle { pem, digest, signature })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{generate_issuing_ca, generate_root_ca};

    #[test]
    fn bundle_digest_matches_recomputation() {
        let root = generate_root_ca("Test Root CA").unwrap();
        let issuing = generate_issuing_ca("Test Issuing CA", &root).unwrap();
        let bundle = build(&root, &issuing).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(bundle.pem.as_bytes());
        let recomputed: [u8; 32] = hasher.finalize().into();
        assert_eq!(bundle.digest, recomputed);
        assert_eq!(bundle.size() as usize, bundle.pem.len());
    }
}

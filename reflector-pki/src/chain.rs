//! Root-CA -> issuing-CA -> server/client certificate hierarchy (spec.md §4.5). Each level is
//! generated (or loaded from disk) once at startup and carries its own renewal deadline,
//! computed as `not_before + validity * 2/3`.

use crate::error::{PkiError, PkiResult};
use crate::keys::generate_rsa_keypair;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

pub const ROOT_CA_BITS: usize = 4096;
pub const ISSUING_CA_BITS: usize = 2048;
pub const SERVER_CERT_BITS: usize = 2048;

pub const ROOT_CA_VALIDITY_DAYS: i64 = 25 * 365;
pub const DEFAULT_CLIENT_CERT_VALIDITY_DAYS: i64 = 90;
pub const ISSUING_CA_VALIDITY_DAYS: i64 = DEFAULT_CLIENT_CERT_VALIDITY_DAYS * 4;
pub const SERVER_CERT_VALIDITY_DAYS: i64 = 90;

/// Renewal is scheduled at two thirds of the way through a certificate's validity window.
fn renew_at(not_before: OffsetDateTime, not_after: OffsetDateTime) -> OffsetDateTime {
    let validity = not_after - not_before;
    not_before + (validity * 2) / 3
}

/// One generated (or loaded) certificate plus enough bookkeeping to decide when to renew it and
/// to sign a child certificate with it.
pub struct IssuedCert {
    pub cert: Certificate,
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub renew_at: OffsetDateTime,
}

impl IssuedCert {
    pub fn needs_renewal(&self, now: OffsetDateTime) -> bool {
        now >= self.renew_at
    }

    pub fn cert_der(&self) -> PkiResult<Vec<u8>> {
        Ok(self.cert.serialize_der()?)
    }
}

fn base_params(
    common_name: &str,
    san: Vec<String>,
    bits: usize,
    validity_days: i64,
    is_ca: IsCa,
    key_usages: Vec<KeyUsagePurpose>,
) -> PkiResult<(CertificateParams, OffsetDateTime, OffsetDateTime)> {
    let mut params = CertificateParams::new(san.into_iter().collect::<Vec<_>>());
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.is_ca = is_ca;
    params.key_usages = key_usages;

    let key_pair = generate_rsa_keypair(bits)?;
    params.alg = key_pair.algorithm();
    params.key_pair = Some(key_pair);

    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + Duration::days(validity_days);
    params.not_before = not_before;
    params.not_after = not_after;

    Ok((params, not_before, not_after))
}

/// Generates a new self-signed root CA certificate.
pub fn generate_root_ca(common_name: &str) -> PkiResult<IssuedCert> {
    let (params, not_before, not_after) = base_params(
        common_name,
        vec![],
        ROOT_CA_BITS,
        ROOT_CA_VALIDITY_DAYS,
        IsCa::Ca(BasicConstraints::Unconstrained),
        vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign],
    )?;

    let cert = Certificate::from_params(params)?;
    let cert_pem = cert.serialize_pem()?;
    let key_pem = cert.serialize_private_key_pem();

    Ok(IssuedCert {
        renew_at: renew_at(not_before, not_after),
        cert,
        cert_pem,
        key_pem,
        not_before,
        not_after,
    })
}

/// Generates a new issuing CA certificate, signed by `root`.
pub fn generate_issuing_ca(common_name: &str, root: &IssuedCert) -> PkiResult<IssuedCert> {
    let (params, not_before, not_after) = base_params(
        common_name,
        vec![],
        ISSUING_CA_BITS,
        ISSUING_CA_VALIDITY_DAYS,
        IsCa::Ca(BasicConstraints::Constrained(0)),
        vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign],
    )?;

    let cert = Certificate::from_params(params)?;
    let cert_pem = cert.serialize_pem_with_signer(&root.cert)?;
    let key_pem = cert.serialize_private_key_pem();

    Ok(IssuedCert {
        renew_at: renew_at(not_before, not_after),
        cert,
        cert_pem,
        key_pem,
        not_before,
        not_after,
    })
}

/// Generates a leaf certificate (server or client), signed by `issuing`.
pub fn generate_leaf_cert(
    common_name: &str,
    san: Vec<String>,
    issuing: &IssuedCert,
) -> PkiResult<IssuedCert> {
    let (params, not_before, not_after) = base_params(
        common_name,
        san,
        SERVER_CERT_BITS,
        SERVER_CERT_VALIDITY_DAYS,
        IsCa::NoCa,
        vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ],
    )?;

    let cert = Certificate::from_params(params)?;
    let cert_pem = cert.serialize_pem_with_signer(&issuing.cert)?;
    let key_pem = cert.serialize_private_key_pem();

    Ok(IssuedCert {
        renew_at: renew_at(not_before, not_after),
        cert,
        cert_pem,
        key_pem,
        not_before,
        not_after,
    })
}

/// Signs an externally-supplied CSR (client certificate flow, spec.md §4.5). Unlike
/// `generate_leaf_cert`, no key pair is generated here — the CSR carries the client's own public
/// key, and the server only attests to it.
pub fn sign_csr(csr_pem: &str, issuing: &IssuedCert) -> PkiResult<(String, OffsetDateTime, OffsetDateTime)> {
    let csr = rcgen::CertificateSigningRequest::from_pem(csr_pem)
        .map_err(|_| PkiError::InvalidCsr)?;
    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before + Duration::days(DEFAULT_CLIENT_CERT_VALIDITY_DAYS);
    let cert_pem = csr.serialize_pem_with_signer(&issuing.cert)?;
    Ok((cert_pem, not_before, not_after))
}

/// Reconstructs an [`IssuedCert`] from PEM already on disk, so a restart doesn't regenerate the
/// whole hierarchy. Works for any of the three levels: `CertificateParams::from_ca_cert_pem`
/// parses back the subject, validity window and key usages that were originally signed in,
/// regardless of whether the cert is itself a CA.
pub fn load_issued(cert_pem: &str, key_pem: &str) -> PkiResult<IssuedCert> {
    let key_pair = rcgen::KeyPair::from_pem(key_pem).map_err(|_| PkiError::InvalidCsr)?;
    let params =
        CertificateParams::from_ca_cert_pem(cert_pem, key_pair).map_err(|_| PkiError::InvalidCsr)?;
    let not_before = params.not_before;
    let not_after = params.not_after;
    let cert = Certificate::from_params(params)?;

    Ok(IssuedCert {
        renew_at: renew_at(not_before, not_after),
        cert,
        cert_pem: cert_pem.to_string(),
        key_pem: key_pem.to_string(),
        not_before,
        not_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_cert_matches_the_one_it_was_generated_from() {
        let root = generate_root_ca("Test Root CA").unwrap();
        let loaded = load_issued(&root.cert_pem, &root.key_pem).unwrap();
        assert_eq!(loaded.not_before, root.not_before);
        assert_eq!(loaded.not_after, root.not_after);
    }

    #[test]
    fn issuing_ca_chains_to_root() {
        let root = generate_root_ca("Test Root CA").unwrap();
        let issuing = generate_issuing_ca("Test Issuing CA", &root).unwrap();
        assert!(issuing.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issuing.not_after > issuing.not_before);
    }

    #[test]
    fn server_cert_chains_to_issuing() {
        let root = generate_root_ca("Test Root CA").unwrap();
        let issuing = generate_issuing_ca("Test Issuing CA", &root).unwrap();
        let server = generate_leaf_cert("reflector.example.org", vec![], &issuing).unwrap();
        assert!(server.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn renewal_deadline_is_two_thirds_through_validity() {
        let root = generate_root_ca("Test Root CA").unwrap();
        let total = root.not_after - root.not_before;
        let until_renewal = root.renew_at - root.not_before;
        // allow a small margin for the seconds spent generating keys between the two calls
        assert!((until_renewal - (total * 2) / 3).whole_seconds().abs() < 2);
    }
}

//! Client certificate-signing-request intake (spec.md §4.5): a pending CSR is distinct from a
//! signed one, an incoming CSR is checked against whatever is already on file for the same
//! common name, and a public-key change under an unsigned CN is treated as a possible hijack and
//! rejected rather than silently overwritten.

use crate::chain::IssuedCert;
use crate::error::{PkiError, PkiResult};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::parse_x509_pem;

/// What happened to a newly received CSR.
#[derive(Debug, Eq, PartialEq)]
pub enum IntakeOutcome {
    /// No pending or signed CSR existed for this CN; a new pending CSR was written.
    Created,
    /// A pending CSR existed with the same key but different request bytes; it was overwritten.
    Updated,
    /// The incoming CSR is byte-identical to what's already on file (pending or signed).
    Unchanged,
}

pub struct CsrIntake {
    pending_dir: PathBuf,
    signed_dir: PathBuf,
    certs_dir: PathBuf,
    accept: Regex,
    reject: Regex,
}

impl CsrIntake {
    pub fn new(pki_root: &Path, accept_pattern: &str, reject_pattern: &str) -> PkiResult<Self> {
        let pending_dir = pki_root.join("pending_csrs");
        let signed_dir = pki_root.join("csrs");
        let certs_dir = pki_root.join("certs");
        fs::create_dir_all(&pending_dir)?;
        fs::create_dir_all(&signed_dir)?;
        fs::create_dir_all(&certs_dir)?;

        let accept = Regex::new(accept_pattern).map_err(|_| PkiError::InvalidCsr)?;
        let reject = Regex::new(reject_pattern).map_err(|_| PkiError::InvalidCsr)?;

        Ok(CsrIntake { pending_dir, signed_dir, certs_dir, accept, reject })
    }

    fn pending_path(&self, cn: &str) -> PathBuf {
        self.pending_dir.join(format!("{}.csr", cn))
    }

    fn signed_path(&self, cn: &str) -> PathBuf {
        self.signed_dir.join(format!("{}.csr", cn))
    }

    fn cert_path(&self, cn: &str) -> PathBuf {
        self.certs_dir.join(format!("{}.crt", cn))
    }

    /// Accepts, rejects, or updates an incoming CSR. `cn` must already have been extracted from
    /// the CSR by the caller (the session that received it knows the claimed callsign).
    pub fn intake(&self, cn: &str, csr_pem: &str) -> PkiResult<IntakeOutcome> {
        if !self.accept.is_match(cn) || self.reject.is_match(cn) {
            return Err(PkiError::CallsignRejected(cn.to_string()));
        }

        let new_key = public_key_der(csr_pem)?;

        if let Ok(existing) = fs::read_to_string(self.signed_path(cn)) {
            if existing == csr_pem {
                return Ok(IntakeOutcome::Unchanged);
            }
        }

        match fs::read_to_string(self.pending_path(cn)) {
            Ok(existing) if existing == csr_pem => Ok(IntakeOutcome::Unchanged),
            Ok(existing) => {
                let existing_key = public_key_der(&existing)?;
                if existing_key != new_key {
                    return Err(PkiError::KeyChangeDetected(cn.to_string()));
                }
                fs::write(self.pending_path(cn), csr_pem)?;
                Ok(IntakeOutcome::Updated)
            }
            Err(_) => {
                fs::write(self.pending_path(cn), csr_pem)?;
                Ok(IntakeOutcome::Created)
            }
        }
    }

    /// Signs the pending CSR for `cn`: writes `certs/<cn>.crt` (leaf cert + issuing CA chain),
    /// moves the CSR from `pending_csrs/` to `csrs/`. Returns the full chain PEM.
    pub fn sign_pending(&self, cn: &str, issuing: &IssuedCert) -> PkiResult<String> {
        let csr_pem = fs::read_to_string(self.pending_path(cn))
            .map_err(|_| PkiError::NoPendingCsr(cn.to_string()))?;

        let (leaf_pem, _not_before, _not_after) = crate::chain::sign_csr(&csr_pem, issuing)?;

        let mut chain_pem = String::new();
        chain_pem.push_str(&leaf_pem);
        chain_pem.push_str(&issuing.cert_pem);

        fs::write(self.cert_path(cn), &chain_pem)?;
        fs::write(self.signed_path(cn), &csr_pem)?;
        fs::remove_file(self.pending_path(cn))?;

        Ok(chain_pem)
    }

    /// Removes a client's certificate and its signed CSR record (`CA RM`, spec.md §4.10).
    pub fn remove(&self, cn: &str) -> PkiResult<()> {
        let _ = fs::remove_file(self.cert_path(cn));
        let _ = fs::remove_file(self.signed_path(cn));
        let _ = fs::remove_file(self.pending_path(cn));
        Ok(())
    }

    pub fn pending_common_names(&self) -> PkiResult<Vec<String>> {
        list_stems(&self.pending_dir, "csr")
    }

    pub fn signed_common_names(&self) -> PkiResult<Vec<String>> {
        list_stems(&self.certs_dir, "crt")
    }

    /// Reads back the signed chain PEM for `cn`, e.g. to resend `MsgClientCert` to a client that
    /// already holds a valid certificate (spec.md §4.4 `EXPECT_CSR` "matches a current signed
    /// cert" transition).
    pub fn read_cert(&self, cn: &str) -> PkiResult<String> {
        fs::read_to_string(self.cert_path(cn)).map_err(|_| PkiError::NoCertOnFile(cn.to_string()))
    }

    /// Recompiles the accept pattern in place (spec.md §4.11 `GLOBAL/ACCEPT_CALLSIGN`), so an
    /// operator `CFG` command takes effect on the next CSR intake without a restart.
    pub fn set_accept_pattern(&mut self, pattern: &str) -> PkiResult<()> {
        self.accept = Regex::new(pattern).map_err(|_| PkiError::InvalidCsr)?;
        Ok(())
    }

    /// Recompiles the reject pattern in place (spec.md §4.11 `GLOBAL/REJECT_CALLSIGN`).
    pub fn set_reject_pattern(&mut self, pattern: &str) -> PkiResult<()> {
        self.reject = Regex::new(pattern).map_err(|_| PkiError::InvalidCsr)?;
        Ok(())
    }
}

/// Extracts the CSR's subject common name, the claimed callsign (spec.md §4.5). Used by the
/// session task before it even knows whether the CSR will be accepted.
pub fn common_name(csr_pem: &str) -> PkiResult<String> {
    let (_, pem) = parse_x509_pem(csr_pem.as_bytes()).map_err(|_| PkiError::InvalidCsr)?;
    let (_, csr) =
        X509CertificationRequest::from_der(&pem.contents).map_err(|_| PkiError::InvalidCsr)?;
    csr.certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or(PkiError::InvalidCsr)
}

fn list_stems(dir: &Path, ext: &str) -> PkiResult<Vec<String>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(ext) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Extracts the raw `SubjectPublicKeyInfo` DER bytes from a PEM-encoded CSR, for key-identity
/// comparison (spec.md §4.5 key-change detection).
fn public_key_der(csr_pem: &str) -> PkiResult<Vec<u8>> {
    let (_, pem) = parse_x509_pem(csr_pem.as_bytes()).map_err(|_| PkiError::InvalidCsr)?;
    let (_, csr) =
        X509CertificationRequest::from_der(&pem.contents).map_err(|_| PkiError::InvalidCsr)?;
    Ok(csr
        .certification_request_info
        .subject_pki
        .raw
        .to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::generate_root_ca;
    use tempfile::tempdir;

    fn make_csr(cn: &str) -> String {
        let mut params = rcgen::CertificateParams::new(vec![]);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        cert.serialize_request_pem().unwrap()
    }

    #[test]
    fn new_csr_is_created() {
        let dir = tempdir().unwrap();
        let intake = CsrIntake::new(dir.path(), ".*", "^$").unwrap();
        let csr = make_csr("NODE1");
        assert_eq!(intake.intake("NODE1", &csr).unwrap(), IntakeOutcome::Created);
        assert!(dir.path().join("pending_csrs/NODE1.csr").exists());
    }

    #[test]
    fn identical_resubmission_is_unchanged() {
        let dir = tempdir().unwrap();
        let intake = CsrIntake::new(dir.path(), ".*", "^$").unwrap();
        let csr = make_csr("NODE1");
        intake.intake("NODE1", &csr).unwrap();
        assert_eq!(intake.intake("NODE1", &csr).unwrap(), IntakeOutcome::Unchanged);
    }

    #[test]
    fn different_key_same_cn_is_rejected() {
        let dir = tempdir().unwrap();
        let intake = CsrIntake::new(dir.path(), ".*", "^$").unwrap();
        intake.intake("NODE1", &make_csr("NODE1")).unwrap();
        let err = intake.intake("NODE1", &make_csr("NODE1")).unwrap_err();
        assert!(matches!(err, PkiError::KeyChangeDetected(_)));
    }

    #[test]
    fn set_accept_pattern_takes_effect_immediately() {
        let dir = tempdir().unwrap();
        let mut intake = CsrIntake::new(dir.path(), "^$", "^$").unwrap();
        assert!(matches!(
            intake.intake("NODE1", &make_csr("NODE1")).unwrap_err(),
            PkiError::CallsignRejected(_)
        ));
        intake.set_accept_pattern(".*").unwrap();
        assert_eq!(intake.intake("NODE1", &make_csr("NODE1")).unwrap(), IntakeOutcome::Created);
    }

    #[test]
    fn reject_pattern_blocks_callsign() {
        let dir = tempdir().unwrap();
        let intake = CsrIntake::new(dir.path(), ".*", "^BAD.*$").unwrap();
        let err = intake.intake("BADNODE", &make_csr("BADNODE")).unwrap_err();
        assert!(matches!(err, PkiError::CallsignRejected(_)));
    }

    #[test]
    fn sign_pending_moves_csr_and_writes_cert() {
        let dir = tempdir().unwrap();
        let intake = CsrIntake::new(dir.path(), ".*", "^$").unwrap();
        let root = generate_root_ca("Test Root CA").unwrap();
        let issuing = crate::chain::generate_issuing_ca("Test Issuing CA", &root).unwrap();

        intake.intake("NODE1", &make_csr("NODE1")).unwrap();
        let chain_pem = intake.sign_pending("NODE1", &issuing).unwrap();

        assert!(chain_pem.contains("BEGIN CERTIFICATE"));
        assert!(!dir.path().join("pending_csrs/NODE1.csr").exists());
        assert!(dir.path().join("csrs/NODE1.csr").exists());
        assert!(dir.path().join("certs/NODE1.crt").exists());
    }
}

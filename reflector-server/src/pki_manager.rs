//! PKI bootstrap and lifecycle (spec.md §4.5 "PKI manager"). Owns the root/issuing/server
//! certificate hierarchy, the CA bundle served to clients, and the CSR intake directory tree.
//! Load-or-generate at startup mirrors the teacher's `Authenticator::new` doing blocking
//! `fs::File::open` once before the reactor starts; everything after that runs off the reactor's
//! bounded, rare filesystem operations (CSR sign, renewal).

use crate::settings::Settings;
use anyhow::{Context, Result};
use reflector_pki::chain::{self, IssuedCert};
use reflector_pki::{bundle, CaBundle, CsrIntake, IntakeOutcome};
use rustls::{Certificate, PrivateKey};
use slog::{info, Logger};
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

pub struct PkiManager {
    pki_root: PathBuf,
    root: IssuedCert,
    issuing: IssuedCert,
    pub server: IssuedCert,
    pub bundle: CaBundle,
    pub csr_intake: CsrIntake,
    hook_path: String,
}

impl PkiManager {
    pub fn bootstrap(settings: &Settings, server_common_name: &str, logger: &Logger) -> Result<Self> {
        let pki_root = PathBuf::from(&settings.global.pki_root);
        fs::create_dir_all(pki_root.join("private")).context("creating pki private dir")?;

        let root = load_or_generate(&pki_root, "root", || {
            chain::generate_root_ca(
                settings.root_ca.common_name.as_deref().unwrap_or("Reflector Root CA"),
            )
        })?;

        let issuing = load_or_generate(&pki_root, "issuing", || {
            chain::generate_issuing_ca(
                settings.issuing_ca.common_name.as_deref().unwrap_or("Reflector Issuing CA"),
                &root,
            )
        })?;

        let server = load_or_generate(&pki_root, "server", || {
            let san = if settings.server_cert.subject_alt_name.is_empty() {
                vec![server_common_name.to_string()]
            } else {
                settings.server_cert.subject_alt_name.clone()
            };
            chain::generate_leaf_cert(server_common_name, san, &issuing)
        })?;

        let ca_bundle = bundle::build(&root, &issuing).context("building CA bundle")?;
        write_ca_bundle(&pki_root, &ca_bundle)?;

        let csr_intake = CsrIntake::new(
            &pki_root,
            &settings.global.accept_callsign,
            &settings.global.reject_callsign,
        )
        .context("initializing CSR intake")?;

        info!(logger, "PKI bootstrapped"; "pki_root" => pki_root.display().to_string());

        Ok(PkiManager {
            pki_root,
            root,
            issuing,
            server,
            bundle: ca_bundle,
            csr_intake,
            hook_path: settings.global.cert_ca_hook.clone(),
        })
    }

    pub fn trusted_ca_for_tls(&self) -> Result<Certificate> {
        let certs = reflector_pki::rustls_bridge::parse_cert_chain(&self.root.cert_pem)?;
        certs.into_iter().next().context("root CA certificate is empty")
    }

    /// Server's own certificate chain PEM (leaf + issuing CA), sent inside `MsgCABundle` so a
    /// client can inspect the server's identity ahead of the TLS handshake (spec.md §6).
    pub fn server_chain_pem(&self) -> String {
        let mut pem = String::new();
        pem.push_str(&self.server.cert_pem);
        pem.push_str(&self.issuing.cert_pem);
        pem
    }

    pub fn server_cert_chain_for_tls(&self) -> Result<(Vec<Certificate>, PrivateKey)> {
        let mut chain_pem = String::new();
        chain_pem.push_str(&self.server.cert_pem);
        chain_pem.push_str(&self.issuing.cert_pem);
        let chain = reflector_pki::rustls_bridge::parse_cert_chain(&chain_pem)?;
        let key = reflector_pki::rustls_bridge::parse_private_key(&self.server.key_pem)?;
        Ok((chain, key))
    }

    /// Signs the pending CSR for `cn`, returning the client's full cert chain PEM for
    /// `MsgClientCert` (spec.md §4.5, S6). Rebuilds nothing else: the CA bundle only changes when
    /// a CA cert itself is renewed.
    pub fn sign_pending(&self, cn: &str) -> Result<String> {
        Ok(self.csr_intake.sign_pending(cn, &self.issuing)?)
    }

    pub fn intake_csr(&self, cn: &str, csr_pem: &str) -> Result<IntakeOutcome> {
        Ok(self.csr_intake.intake(cn, csr_pem)?)
    }

    pub fn remove_cert(&self, cn: &str) -> Result<()> {
        Ok(self.csr_intake.remove(cn)?)
    }

    /// Recompiles the CSR intake's accept/reject callsign patterns (spec.md §4.11
    /// `GLOBAL/ACCEPT_CALLSIGN`/`GLOBAL/REJECT_CALLSIGN`), so an operator `CFG` change affects
    /// the next CSR received rather than only the patterns loaded at bootstrap.
    pub fn set_accept_pattern(&mut self, pattern: &str) -> Result<()> {
        Ok(self.csr_intake.set_accept_pattern(pattern)?)
    }

    pub fn set_reject_pattern(&mut self, pattern: &str) -> Result<()> {
        Ok(self.csr_intake.set_reject_pattern(pattern)?)
    }

    /// Reads back a client's already-signed chain PEM, for the `EXPECT_CSR` "resubmission matches
    /// a current signed cert" transition (spec.md §4.4).
    pub fn client_cert_pem(&self, cn: &str) -> Result<String> {
        Ok(self.csr_intake.read_cert(cn)?)
    }

    pub fn pending_common_names(&self) -> Result<Vec<String>> {
        Ok(self.csr_intake.pending_common_names()?)
    }

    pub fn signed_common_names(&self) -> Result<Vec<String>> {
        Ok(self.csr_intake.signed_common_names()?)
    }

    /// Path to the external CA hook, if any (spec.md §4.5). Cloned out by callers before an
    /// `await` on `hook::invoke` rather than held as a borrow through it — the hook can run for
    /// up to its five-minute timeout, and nothing else on the reactor must be locked out of the
    /// `Hub` for that long.
    pub fn hook_path(&self) -> &str {
        &self.hook_path
    }

    /// Certificates whose renewal deadline has passed (spec.md §4.5 step 2/3, §5 "wall-clock
    /// timers for certificate renewal"). `reflector-server`'s timer loop calls this once per
    /// sweep; actually regenerating a renewed cert is deliberately left as a restart-time
    /// operation (see DESIGN.md) rather than live hot-swapping the TLS acceptor's config.
    pub fn due_for_renewal(&self, now: OffsetDateTime) -> Vec<&'static str> {
        let mut due = Vec::new();
        if self.root.needs_renewal(now) {
            due.push("root");
        }
        if self.issuing.needs_renewal(now) {
            due.push("issuing");
        }
        if self.server.needs_renewal(now) {
            due.push("server");
        }
        due
    }
}

fn load_or_generate<F>(pki_root: &Path, name: &str, generate: F) -> Result<IssuedCert>
where
    F: FnOnce() -> Result<IssuedCert, reflector_pki::PkiError>,
{
    let cert_path = pki_root.join("private").join(format!("{}.crt", name));
    let key_path = pki_root.join("private").join(format!("{}.key", name));

    if let (Ok(cert_pem), Ok(key_pem)) = (fs::read_to_string(&cert_path), fs::read_to_string(&key_path)) {
        if let Ok(issued) = chain::load_issued(&cert_pem, &key_pem) {
            return Ok(issued);
        }
    }

    let issued = generate().with_context(|| format!("generating {} certificate", name))?;
    fs::write(&cert_path, &issued.cert_pem).with_context(|| format!("writing {}", cert_path.display()))?;
    fs::write(&key_path, &issued.key_pem).with_context(|| format!("writing {}", key_path.display()))?;
    Ok(issued)
}

fn write_ca_bundle(pki_root: &Path, bundle: &CaBundle) -> Result<()> {
    fs::write(pki_root.join("ca-bundle.crt"), &bundle.pem).context("writing ca-bundle.crt")
}

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("key generation failed")]
    KeyGeneration,
    #[error("certificate generation failed: {0}")]
    CertGeneration(#[from] rcgen::RcgenError),
    #[error("digest signing failed")]
    Signing,
    #[error("csr could not be parsed")]
    InvalidCsr,
    #[error("callsign {0:?} does not match the accept pattern, or matches the reject pattern")]
    CallsignRejected(String),
    #[error("csr for {0:?} carries a different public key than the pending csr on file")]
    KeyChangeDetected(String),
    #[error("no pending csr on file for {0:?}")]
    NoPendingCsr(String),
    #[error("no signed certificate on file for {0:?}")]
    NoCertOnFile(String),
    #[error("filesystem error: {0}")]
    Io(#[from] io::Error),
    #[error("CA hook exited with status {0}")]
    HookFailed(i32),
    #[error("CA hook timed out")]
    HookTimedOut,
}

pub type PkiResult<T> = Result<T, PkiError>;

//! External CA hook invocation (spec.md §4.5/§6/§5): a configured executable is run on the
//! reactor thread as a child process, given a five-minute wall clock, with its stdout/stderr
//! captured and forwarded to the server's own logs. The hook's exit status is logged; a non-zero
//! exit is treated as a warning, never as a reason to roll back the CSR/cert file state that
//! triggered it (spec.md §9 open questions).

use crate::error::{PkiError, PkiResult};
use slog::{warn, Logger};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const HOOK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CaOp {
    PendingCsrCreate,
    PendingCsrUpdate,
    CsrSigned,
}

impl CaOp {
    fn as_env_value(self) -> &'static str {
        match self {
            CaOp::PendingCsrCreate => "PENDING_CSR_CREATE",
            CaOp::PendingCsrUpdate => "PENDING_CSR_UPDATE",
            CaOp::CsrSigned => "CSR_SIGNED",
        }
    }
}

/// Runs the configured CA hook, if any. `csr_pem`/`crt_pem` become `CA_CSR_PEM`/`CA_CRT_PEM` in
/// the child's environment; a warning (not an error) is logged on non-zero exit or timeout so a
/// flaky hook never blocks the CSR/cert state change that already happened on disk.
pub async fn invoke(
    logger: &Logger,
    hook_path: &str,
    op: CaOp,
    csr_pem: Option<&str>,
    crt_pem: Option<&str>,
) -> PkiResult<()> {
    if hook_path.is_empty() {
        return Ok(());
    }

    let mut cmd = Command::new(hook_path);
    cmd.env("CA_OP", op.as_env_value());
    if let Some(pem) = csr_pem {
        cmd.env("CA_CSR_PEM", pem);
    }
    if let Some(pem) = crt_pem {
        cmd.env("CA_CRT_PEM", pem);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let child = cmd.spawn().map_err(PkiError::Io)?;

    let output = match tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result.map_err(PkiError::Io)?,
        Err(_) => {
            warn!(logger, "CA hook timed out"; "hook" => hook_path, "op" => op.as_env_value());
            return Err(PkiError::HookTimedOut);
        }
    };

    if !output.stdout.is_empty() {
        warn!(logger, "{}", String::from_utf8_lossy(&output.stdout); "hook" => hook_path, "stream" => "stdout");
    }
    if !output.stderr.is_empty() {
        warn!(logger, "{}", String::from_utf8_lossy(&output.stderr); "hook" => hook_path, "stream" => "stderr");
    }

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        warn!(logger, "CA hook exited non-zero"; "hook" => hook_path, "status" => code);
        return Err(PkiError::HookFailed(code));
    }

    Ok(())
}

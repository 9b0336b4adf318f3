pub mod daytona;
pub mod e2b;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;

use super::error::SandboxError;

/// Map a non-success provider response onto the error taxonomy the
/// recovery logic branches on. Both backends go through here so that a
/// stale handle, a stopped sandbox and a rejected request look the same
/// to callers regardless of provider.
pub(crate) fn map_status(status: StatusCode, body: &str, sandbox_id: &str) -> SandboxError {
    if status == StatusCode::NOT_FOUND {
        return SandboxError::NotFound(sandbox_id.to_string());
    }
    let lower = body.to_ascii_lowercase();
    if lower.contains("not running")
        || lower.contains("is paused")
        || lower.contains("is stopped")
        || lower.contains("no network address")
    {
        return SandboxError::NotRunning(format!("{sandbox_id}: {}", body.trim()));
    }
    if status.is_client_error() {
        SandboxError::Rejected(format!("{status}: {}", body.trim()))
    } else {
        SandboxError::Backend(format!("{status}: {}", body.trim()))
    }
}

/// Map a reqwest transport error; a deadline hit is its own kind.
pub(crate) fn map_transport(err: reqwest::Error) -> SandboxError {
    if err.is_timeout() {
        SandboxError::Timeout
    } else {
        SandboxError::Backend(err.to_string())
    }
}

/// Percent-encode a sandbox path for use as a query value.
pub(crate) fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, NON_ALPHANUMERIC).to_string()
}

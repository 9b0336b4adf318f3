use std::io;

/// Errors from sandbox operations.
///
/// Backends must map provider responses into these variants: recovery
/// logic branches on the difference between a stale handle (`NotFound`),
/// a startable-but-unreachable sandbox (`NotRunning`), a timed-out call
/// (`Timeout`), and a rejected request (`Rejected`). `Config` is always
/// fatal and never downgraded.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox not running: {0}")]
    NotRunning(String),

    #[error("timeout")]
    Timeout,

    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("command failed: code={code:?}, stderr={stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// The provider no longer knows this sandbox; the persisted handle
    /// must be cleared and provisioning restarted from scratch.
    pub fn is_stale(&self) -> bool {
        matches!(self, SandboxError::NotFound(_))
    }

    /// The sandbox exists but is stopped or has no network address; a
    /// provider "start" followed by one retry is worth attempting.
    pub fn is_startable(&self) -> bool {
        matches!(self, SandboxError::NotRunning(_))
    }

    /// Stable message for surfacing to end users; raw provider text
    /// stays in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            SandboxError::Config(_) => "sandbox environment is misconfigured",
            _ => "sandbox unavailable, retry shortly",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_id() {
        let err = SandboxError::NotFound("sbx-123".into());
        assert_eq!(err.to_string(), "sandbox not found: sbx-123");
    }

    #[test]
    fn not_running_displays_reason() {
        let err = SandboxError::NotRunning("stopped by provider".into());
        assert_eq!(err.to_string(), "sandbox not running: stopped by provider");
    }

    #[test]
    fn command_failed_displays_code_and_stderr() {
        let err = SandboxError::CommandFailed {
            code: Some(1),
            stderr: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "command failed: code=Some(1), stderr=permission denied"
        );
    }

    #[test]
    fn command_failed_with_no_code() {
        let err = SandboxError::CommandFailed {
            code: None,
            stderr: "killed".into(),
        };
        assert!(err.to_string().contains("code=None"));
    }

    #[test]
    fn timeout_displays() {
        let err = SandboxError::Timeout;
        assert_eq!(err.to_string(), "timeout");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(err.to_string().contains("file missing"));
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[test]
    fn rejected_config_serde_backend_display() {
        assert_eq!(
            SandboxError::Rejected("invalid image id".into()).to_string(),
            "provider rejected request: invalid image id"
        );
        assert_eq!(
            SandboxError::Config("template has no snapshot".into()).to_string(),
            "configuration error: template has no snapshot"
        );
        assert_eq!(
            SandboxError::Serde("bad json".into()).to_string(),
            "serialization: bad json"
        );
        assert_eq!(
            SandboxError::Backend("connection refused".into()).to_string(),
            "backend error: connection refused"
        );
    }

    #[test]
    fn stale_and_startable_classification() {
        assert!(SandboxError::NotFound("sbx-1".into()).is_stale());
        assert!(!SandboxError::Timeout.is_stale());

        assert!(SandboxError::NotRunning("no address".into()).is_startable());
        assert!(!SandboxError::NotFound("sbx-1".into()).is_startable());
        assert!(!SandboxError::Backend("boom".into()).is_startable());
    }

    #[test]
    fn user_message_hides_provider_text() {
        let err = SandboxError::Backend("TLS handshake eof at 10.0.0.3".into());
        assert_eq!(err.user_message(), "sandbox unavailable, retry shortly");

        let err = SandboxError::Config("template vite has no image".into());
        assert_eq!(err.user_message(), "sandbox environment is misconfigured");
    }

    #[test]
    fn error_is_send_and_sync() {
        // SandboxError must be Send + Sync for use in async trait returns
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}

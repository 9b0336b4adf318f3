//! Bounded readiness polling. A timeout yields `false`, never an
//! error: callers treat it as a soft signal and proceed, since the
//! sandbox may become ready moments later and the next user action
//! re-checks anyway.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::sandbox::provider::Sandbox;
use crate::sandbox::types::ExecRequest;

const LOG_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dev-server banners that mean "serving traffic", matched
/// case-insensitively against recent process output.
pub const READY_PATTERNS: &[&str] = &[
    "ready in",
    "local:",
    "compiled successfully",
    "listening on",
    "accepting connections",
];

/// Poll `predicate` until it holds or `max_wait` elapses. The deadline
/// is checked every iteration; the predicate always runs at least once.
pub async fn wait_until<F, Fut>(mut predicate: F, max_wait: Duration, poll_interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + max_wait;
    loop {
        if predicate().await {
            return true;
        }
        if Instant::now() + poll_interval > deadline {
            tracing::debug!(waited_ms = max_wait.as_millis() as u64, "Readiness poll timed out");
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// The sandbox process dropped its marker file.
pub async fn marker_file_exists(sandbox: &dyn Sandbox, path: &str) -> bool {
    sandbox.read_file(path).await.is_ok()
}

/// The provider exposes a tunnel URL on `port`.
pub async fn tunnel_on_port(sandbox: &dyn Sandbox, port: u16) -> bool {
    match sandbox.tunnels().await {
        Ok(tunnels) => tunnels.contains_key(&port),
        Err(_) => false,
    }
}

/// Recent process output contains a known ready banner.
pub async fn logs_ready(sandbox: &dyn Sandbox, log_command: &str) -> bool {
    match sandbox
        .exec(ExecRequest::shell(log_command, LOG_PROBE_TIMEOUT))
        .await
    {
        Ok(result) => {
            let text = format!("{}\n{}", result.stdout, result.stderr).to_lowercase();
            READY_PATTERNS.iter().any(|pattern| text.contains(pattern))
        }
        Err(_) => false,
    }
}

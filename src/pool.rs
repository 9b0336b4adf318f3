//! Warm pool of auxiliary sandboxes for lint and typecheck runs.
//! Entries are health-checked on the way out, so a sandbox the provider
//! quietly reclaimed never reaches a caller.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::sandbox::error::SandboxError;
use crate::sandbox::provider::{Sandbox, SandboxProvider};
use crate::sandbox::types::{CreateSandbox, ExecRequest, ImageId};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

struct IdleEntry {
    sandbox: Box<dyn Sandbox>,
    parked_at: Instant,
}

pub struct SandboxPool {
    provider: Arc<dyn SandboxProvider>,
    image: ImageId,
    capacity: usize,
    idle_timeout: Duration,
    idle: Mutex<VecDeque<IdleEntry>>,
}

impl SandboxPool {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        image: impl Into<ImageId>,
        capacity: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            image: image.into(),
            capacity: capacity.max(1),
            idle_timeout,
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Hand out a live sandbox, recycling an idle one when it still
    /// answers.
    pub async fn acquire(&self) -> Result<Box<dyn Sandbox>, SandboxError> {
        loop {
            let entry = self.idle.lock().await.pop_front();
            let Some(entry) = entry else {
                break;
            };
            if self.responsive(&*entry.sandbox).await {
                return Ok(entry.sandbox);
            }
            tracing::info!(sandbox = %entry.sandbox.id(), "Dropping unresponsive pooled sandbox");
            if let Err(err) = entry.sandbox.terminate().await {
                tracing::warn!(sandbox = %entry.sandbox.id(), error = %err, "Terminating pooled sandbox failed");
            }
        }

        let spec = CreateSandbox::from_image(self.image.clone())
            .label("managed-by", "sandpiper")
            .label("role", "checker");
        self.provider.create(spec).await
    }

    /// Park a sandbox back into the pool, or terminate it when the pool
    /// is already at capacity.
    pub async fn release(&self, sandbox: Box<dyn Sandbox>) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.capacity {
            idle.push_back(IdleEntry {
                sandbox,
                parked_at: Instant::now(),
            });
            return;
        }
        drop(idle);
        tracing::debug!(sandbox = %sandbox.id(), "Pool full; terminating released sandbox");
        if let Err(err) = sandbox.terminate().await {
            tracing::warn!(sandbox = %sandbox.id(), error = %err, "Terminating surplus sandbox failed");
        }
    }

    /// Terminate entries parked longer than the idle timeout. Returns
    /// how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let expired: Vec<IdleEntry> = {
            let mut idle = self.idle.lock().await;
            let mut kept = VecDeque::new();
            let mut expired = Vec::new();
            while let Some(entry) = idle.pop_front() {
                if entry.parked_at.elapsed() >= self.idle_timeout {
                    expired.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *idle = kept;
            expired
        };

        let count = expired.len();
        for entry in expired {
            if let Err(err) = entry.sandbox.terminate().await {
                tracing::warn!(sandbox = %entry.sandbox.id(), error = %err, "Evicting idle sandbox failed");
            }
        }
        if count > 0 {
            tracing::info!(evicted = count, "Evicted idle pooled sandboxes");
        }
        count
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn responsive(&self, sandbox: &dyn Sandbox) -> bool {
        match sandbox
            .exec(ExecRequest::shell("echo ok", HEALTH_TIMEOUT))
            .await
        {
            Ok(result) => result.success() && result.stdout.trim() == "ok",
            Err(err) => {
                tracing::debug!(sandbox = %sandbox.id(), error = %err, "Pooled sandbox health check failed");
                false
            }
        }
    }
}

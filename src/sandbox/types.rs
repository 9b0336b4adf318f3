use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SandboxError;

// ── Sandbox identity ────────────────────────────────────────────────

pub type ProviderSandboxId = String;
pub type ImageId = String;

/// Tunnel map returned by the provider: exposed port → public URL.
pub type TunnelMap = BTreeMap<u16, String>;

// ── Provider kind ───────────────────────────────────────────────────

/// Stored provider tag. Selects which concrete backend owns a persisted
/// handle; nothing outside the `sandbox` module branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    E2b,
    Daytona,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "e2b" => Some(ProviderKind::E2b),
            "daytona" => Some(ProviderKind::Daytona),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::E2b => "e2b",
            ProviderKind::Daytona => "daytona",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Persisted handle ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
    Terminated,
}

/// The persisted record of a live sandbox, owned by the project record.
/// Created on provisioning, mutated on URL refresh, nulled on
/// termination or when the provider no longer knows the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub provider: ProviderKind,
    pub sandbox_id: ProviderSandboxId,
    pub public_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: SandboxStatus,
}

impl SandboxHandle {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

// ── Create spec (input to provisioning) ─────────────────────────────

#[derive(Debug, Clone)]
pub struct CreateSandbox {
    /// Boot image id: a template snapshot, a fragment snapshot or the
    /// generic base image, as decided by image selection.
    pub image: ImageId,
    pub resources: ResourceSpec,
    pub env: BTreeMap<String, String>,
    /// Provider-side metadata, used to find orphans (project id etc).
    pub labels: BTreeMap<String, String>,
    /// Provider-side auto-expiry, where the backend supports it.
    pub ttl: Option<Duration>,
}

impl CreateSandbox {
    pub fn from_image(image: impl Into<ImageId>) -> Self {
        Self {
            image: image.into(),
            resources: ResourceSpec::default(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            ttl: None,
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    pub vcpu: Option<u8>,
    pub memory_mb: Option<u32>,
    pub disk_mb: Option<u32>,
}

// ── Exec model ──────────────────────────────────────────────────────

/// A single command run inside the sandbox. Every request carries an
/// explicit timeout; provider calls are remote round-trips and must
/// never wait unbounded.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn shell(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: BTreeMap::new(),
            timeout,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Promote a non-zero exit into `CommandFailed`, for call sites
    /// where the command must succeed.
    pub fn require_success(self, what: &str) -> Result<ExecResult, SandboxError> {
        if self.success() {
            Ok(self)
        } else {
            Err(SandboxError::CommandFailed {
                code: Some(self.exit_code),
                stderr: format!("{what}: {}", self.stderr.trim()),
            })
        }
    }
}

// ── File operations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

//! Session-exec backend.
//!
//! Commands do not run directly: the workspace API wants a process
//! session created first, then commands executed inside it. The session
//! is created lazily, cached per handle, and transparently recreated
//! once if the provider drops it. File I/O is raw bytes (download /
//! upload endpoints), unlike the text semantics of the direct backend;
//! the session exec API returns a single combined output stream which
//! is split onto stdout/stderr by exit code.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::super::error::SandboxError;
use super::super::provider::{Sandbox, SandboxFile, SandboxProvider};
use super::super::types::*;
use super::{encode_path, map_status, map_transport};

const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(180);
const EXEC_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct DaytonaProvider {
    client: DaytonaClient,
}

impl DaytonaProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client: DaytonaClient {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                api_key: api_key.into(),
                http,
            },
        }
    }

    fn sandbox(&self, id: String) -> DaytonaSandbox {
        DaytonaSandbox {
            id,
            client: self.client.clone(),
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SandboxProvider for DaytonaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Daytona
    }

    async fn create(&self, spec: CreateSandbox) -> Result<Box<dyn Sandbox>, SandboxError> {
        let mut resources = serde_json::Map::new();
        if let Some(vcpu) = spec.resources.vcpu {
            resources.insert("cpu".into(), serde_json::json!(vcpu));
        }
        if let Some(mem) = spec.resources.memory_mb {
            resources.insert("memoryMb".into(), serde_json::json!(mem));
        }
        if let Some(disk) = spec.resources.disk_mb {
            resources.insert("diskMb".into(), serde_json::json!(disk));
        }

        let mut body = serde_json::json!({
            "image": spec.image,
            "resources": resources,
        });
        if !spec.env.is_empty() {
            body["env"] = serde_json::json!(spec.env);
        }
        if !spec.labels.is_empty() {
            body["labels"] = serde_json::json!(spec.labels);
        }
        if let Some(ttl) = spec.ttl {
            body["autoDeleteMinutes"] = serde_json::json!(ttl.as_secs() / 60);
        }

        let resp = self
            .client
            .post("/api/workspaces")
            .timeout(CREATE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;
        let created: WorkspaceCreated = self.client.expect_json(resp, "").await?;

        tracing::info!(sandbox = %created.id, image = %spec.image, "created workspace");
        Ok(Box::new(self.sandbox(created.id)))
    }

    async fn attach(&self, sandbox_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let resp = self
            .client
            .get(&format!("/api/workspaces/{sandbox_id}"))
            .send()
            .await
            .map_err(map_transport)?;
        let _info: WorkspaceInfo = self.client.expect_json(resp, sandbox_id).await?;

        Ok(Box::new(self.sandbox(sandbox_id.to_string())))
    }

    async fn list(&self) -> Result<Vec<SandboxHandle>, SandboxError> {
        let resp = self
            .client
            .get("/api/workspaces")
            .send()
            .await
            .map_err(map_transport)?;
        let infos: Vec<WorkspaceInfo> = self.client.expect_json(resp, "").await?;
        Ok(infos.into_iter().map(WorkspaceInfo::into_handle).collect())
    }

    async fn delete_image(&self, image_id: &str) -> Result<(), SandboxError> {
        let resp = self
            .client
            .delete(&format!("/api/snapshots/{image_id}"))
            .send()
            .await
            .map_err(map_transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!(image = %image_id, "snapshot already deleted at provider");
            return Ok(());
        }
        self.client.expect_ok(resp, image_id).await
    }
}

#[derive(Debug)]
struct DaytonaSandbox {
    id: String,
    client: DaytonaClient,
    /// Cached process session id; recreated when the provider drops it.
    session: Mutex<Option<String>>,
}

impl DaytonaSandbox {
    async fn ensure_session(&self) -> Result<String, SandboxError> {
        let mut guard = self.session.lock().await;
        if let Some(id) = guard.as_ref() {
            return Ok(id.clone());
        }
        let resp = self
            .client
            .post(&format!("/api/workspaces/{}/sessions", self.id))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_transport)?;
        let created: SessionCreated = self.client.expect_json(resp, &self.id).await?;
        *guard = Some(created.session_id.clone());
        Ok(created.session_id)
    }

    async fn exec_in_session(
        &self,
        session_id: &str,
        req: &ExecRequest,
    ) -> Result<SessionExecResult, SandboxError> {
        let mut body = serde_json::json!({
            "command": req.command,
            "timeoutSeconds": req.timeout.as_secs(),
        });
        if let Some(cwd) = &req.cwd {
            body["cwd"] = serde_json::json!(cwd);
        }
        if !req.env.is_empty() {
            body["env"] = serde_json::json!(req.env);
        }

        let resp = self
            .client
            .post(&format!(
                "/api/workspaces/{}/sessions/{session_id}/exec",
                self.id
            ))
            .timeout(req.timeout + EXEC_GRACE)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        // A 404 here is ambiguous: the workspace may be gone, or only
        // the cached session. Only the latter is retryable.
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_else(|_| "<unreadable>".into());
            if body.to_ascii_lowercase().contains("session") {
                return Err(SandboxError::Exec(format!("session dropped: {body}")));
            }
            return Err(SandboxError::NotFound(self.id.clone()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<unreadable>".into());
            return Err(map_status(status, &body, &self.id));
        }
        let body = resp.text().await.map_err(map_transport)?;
        serde_json::from_str(&body)
            .map_err(|e| SandboxError::Serde(format!("unexpected provider response: {e}")))
    }
}

#[async_trait]
impl Sandbox for DaytonaSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Daytona
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        let session_id = self.ensure_session().await?;
        let out = match self.exec_in_session(&session_id, &req).await {
            Err(SandboxError::Exec(reason)) => {
                tracing::debug!(sandbox = %self.id, %reason, "recreating exec session");
                *self.session.lock().await = None;
                let session_id = self.ensure_session().await?;
                self.exec_in_session(&session_id, &req).await?
            }
            other => other?,
        };

        // One combined stream comes back; put it where callers look.
        let (stdout, stderr) = if out.exit_code == 0 {
            (out.output, String::new())
        } else {
            (String::new(), out.output)
        };
        Ok(ExecResult {
            exit_code: out.exit_code,
            stdout,
            stderr,
        })
    }

    async fn open_file(
        &self,
        path: &str,
        mode: FileMode,
    ) -> Result<Box<dyn SandboxFile>, SandboxError> {
        Ok(Box::new(DaytonaFile {
            workspace_id: self.id.clone(),
            path: path.to_string(),
            mode,
            client: self.client.clone(),
            buf: Vec::new(),
            dirty: false,
        }))
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let resp = self
            .client
            .get(&format!(
                "/api/workspaces/{}/toolbox/files?path={}",
                self.id,
                encode_path(dir)
            ))
            .send()
            .await
            .map_err(map_transport)?;
        let entries: Vec<ToolboxEntry> = self.client.expect_json(resp, &self.id).await?;

        Ok(entries
            .into_iter()
            .map(|e| DirEntry {
                name: e.name,
                is_dir: e.is_dir,
                size_bytes: e.size,
                modified_at: e.mod_time,
            })
            .collect())
    }

    async fn tunnels(&self) -> Result<TunnelMap, SandboxError> {
        let resp = self
            .client
            .get(&format!("/api/workspaces/{}/ports", self.id))
            .send()
            .await
            .map_err(map_transport)?;
        let ports: Vec<PortPreview> = self.client.expect_json(resp, &self.id).await?;

        Ok(ports
            .into_iter()
            .filter_map(|p| p.preview_url.map(|url| (p.port, url)))
            .collect())
    }

    async fn snapshot_filesystem(&self) -> Result<ImageId, SandboxError> {
        let resp = self
            .client
            .post(&format!("/api/workspaces/{}/snapshot", self.id))
            .timeout(SNAPSHOT_TIMEOUT)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_transport)?;
        let snap: SnapshotCreated = self.client.expect_json(resp, &self.id).await?;
        tracing::info!(sandbox = %self.id, image = %snap.snapshot_id, "filesystem snapshot created");
        Ok(snap.snapshot_id)
    }

    async fn start(&self) -> Result<(), SandboxError> {
        let resp = self
            .client
            .post(&format!("/api/workspaces/{}/start", self.id))
            .timeout(CREATE_TIMEOUT)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_transport)?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        self.client.expect_ok(resp, &self.id).await
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let resp = self
            .client
            .post(&format!("/api/workspaces/{}/stop", self.id))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_transport)?;
        self.client.expect_ok(resp, &self.id).await
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        let resp = self
            .client
            .delete(&format!("/api/workspaces/{}", self.id))
            .send()
            .await
            .map_err(map_transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!(sandbox = %self.id, "workspace already gone at provider");
            return Ok(());
        }
        self.client.expect_ok(resp, &self.id).await
    }
}

/// Raw-bytes file I/O through the toolbox download/upload endpoints.
struct DaytonaFile {
    workspace_id: String,
    path: String,
    mode: FileMode,
    client: DaytonaClient,
    buf: Vec<u8>,
    dirty: bool,
}

#[async_trait]
impl SandboxFile for DaytonaFile {
    async fn read(&mut self) -> Result<Vec<u8>, SandboxError> {
        let resp = self
            .client
            .get(&format!(
                "/api/workspaces/{}/toolbox/files/download?path={}",
                self.workspace_id,
                encode_path(&self.path)
            ))
            .send()
            .await
            .map_err(map_transport)?;
        let resp = self.client.check(resp, &self.workspace_id).await?;
        let bytes = resp.bytes().await.map_err(map_transport)?;
        Ok(bytes.to_vec())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SandboxError> {
        if self.mode != FileMode::Write {
            return Err(SandboxError::Rejected(format!(
                "file {} opened read-only",
                self.path
            )));
        }
        self.buf.extend_from_slice(bytes);
        self.dirty = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SandboxError> {
        if !self.dirty {
            return Ok(());
        }
        let resp = self
            .client
            .post(&format!(
                "/api/workspaces/{}/toolbox/files/upload?path={}",
                self.workspace_id,
                encode_path(&self.path)
            ))
            .header("content-type", "application/octet-stream")
            .body(std::mem::take(&mut self.buf))
            .send()
            .await
            .map_err(map_transport)?;
        self.dirty = false;
        self.client.expect_ok(resp, &self.workspace_id).await
    }
}

// ── HTTP client ─────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct DaytonaClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl DaytonaClient {
    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .delete(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    async fn check(
        &self,
        resp: reqwest::Response,
        sandbox_id: &str,
    ) -> Result<reqwest::Response, SandboxError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_else(|_| "<unreadable>".into());
        Err(map_status(status, &body, sandbox_id))
    }

    async fn expect_ok(
        &self,
        resp: reqwest::Response,
        sandbox_id: &str,
    ) -> Result<(), SandboxError> {
        self.check(resp, sandbox_id).await.map(|_| ())
    }

    async fn expect_json<T: serde::de::DeserializeOwned>(
        &self,
        resp: reqwest::Response,
        sandbox_id: &str,
    ) -> Result<T, SandboxError> {
        let resp = self.check(resp, sandbox_id).await?;
        let body = resp.text().await.map_err(map_transport)?;
        serde_json::from_str(&body)
            .map_err(|e| SandboxError::Serde(format!("unexpected provider response: {e}")))
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WorkspaceCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WorkspaceInfo {
    id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(rename = "createdAt", default)]
    created_at: Option<DateTime<Utc>>,
}

impl WorkspaceInfo {
    fn into_handle(self) -> SandboxHandle {
        let status = match self.state.as_deref() {
            Some("started") | Some("running") => SandboxStatus::Running,
            Some("stopped") => SandboxStatus::Stopped,
            _ => SandboxStatus::Running,
        };
        SandboxHandle {
            provider: ProviderKind::Daytona,
            sandbox_id: self.id,
            public_url: None,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            expires_at: None,
            status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionExecResult {
    #[serde(rename = "exitCode", default)]
    exit_code: i32,
    #[serde(default)]
    output: String,
}

#[derive(Debug, Deserialize)]
struct ToolboxEntry {
    name: String,
    #[serde(rename = "isDir", default)]
    is_dir: bool,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "modTime", default)]
    mod_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PortPreview {
    port: u16,
    #[serde(rename = "previewUrl", default)]
    preview_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotCreated {
    #[serde(rename = "snapshotId")]
    snapshot_id: String,
}

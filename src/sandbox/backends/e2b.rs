//! Direct-exec backend.
//!
//! Every operation is a single REST round-trip: commands run via
//! `POST /v0/sandboxes/{id}/commands`, files are read as text and
//! written with a multipart form, tunnels come from the `hosts` table.
//! Filesystem snapshots become templates that later boots can use as
//! their image.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::super::error::SandboxError;
use super::super::provider::{Sandbox, SandboxFile, SandboxProvider};
use super::super::types::*;
use super::{encode_path, map_status, map_transport};

/// Boot can pull an image and cold-start a VM; keep this generous.
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
/// Snapshotting a large filesystem is the slowest call this backend makes.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(180);
/// Grace added on top of the caller's exec timeout so the provider-side
/// kill fires before our transport deadline does.
const EXEC_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct E2bProvider {
    client: E2bClient,
}

impl E2bProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client: E2bClient {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                api_key: api_key.into(),
                http,
            },
        }
    }
}

#[async_trait]
impl SandboxProvider for E2bProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::E2b
    }

    async fn create(&self, spec: CreateSandbox) -> Result<Box<dyn Sandbox>, SandboxError> {
        let mut body = serde_json::json!({
            "templateID": spec.image,
        });
        if let Some(ttl) = spec.ttl {
            body["timeout"] = serde_json::json!(ttl.as_secs());
        }
        if !spec.labels.is_empty() {
            body["metadata"] = serde_json::json!(spec.labels);
        }
        if !spec.env.is_empty() {
            body["envVars"] = serde_json::json!(spec.env);
        }

        let resp = self
            .client
            .post("/v0/sandboxes")
            .timeout(CREATE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;
        let created: CreatedSandbox = self.client.expect_json(resp, "").await?;

        tracing::info!(sandbox = %created.sandbox_id, image = %spec.image, "created sandbox");
        Ok(Box::new(E2bSandbox {
            id: created.sandbox_id,
            client: self.client.clone(),
        }))
    }

    async fn attach(&self, sandbox_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let resp = self
            .client
            .get(&format!("/v0/sandboxes/{sandbox_id}"))
            .send()
            .await
            .map_err(map_transport)?;
        let _info: SandboxInfo = self.client.expect_json(resp, sandbox_id).await?;

        Ok(Box::new(E2bSandbox {
            id: sandbox_id.to_string(),
            client: self.client.clone(),
        }))
    }

    async fn list(&self) -> Result<Vec<SandboxHandle>, SandboxError> {
        let resp = self
            .client
            .get("/v0/sandboxes")
            .send()
            .await
            .map_err(map_transport)?;
        let infos: Vec<SandboxInfo> = self.client.expect_json(resp, "").await?;
        Ok(infos.into_iter().map(SandboxInfo::into_handle).collect())
    }

    async fn delete_image(&self, image_id: &str) -> Result<(), SandboxError> {
        let resp = self
            .client
            .delete(&format!("/v0/templates/{image_id}"))
            .send()
            .await
            .map_err(map_transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!(image = %image_id, "image already deleted at provider");
            return Ok(());
        }
        self.client.expect_ok(resp, image_id).await
    }
}

#[derive(Debug)]
struct E2bSandbox {
    id: String,
    client: E2bClient,
}

#[async_trait]
impl Sandbox for E2bSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::E2b
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        let mut body = serde_json::json!({
            "cmd": req.command,
            "timeout": req.timeout.as_secs(),
        });
        if let Some(cwd) = &req.cwd {
            body["workdir"] = serde_json::json!(cwd);
        }
        if !req.env.is_empty() {
            body["envVars"] = serde_json::json!(req.env);
        }

        let resp = self
            .client
            .post(&format!("/v0/sandboxes/{}/commands", self.id))
            .timeout(req.timeout + EXEC_GRACE)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;
        let out: CommandResult = self.client.expect_json(resp, &self.id).await?;

        Ok(ExecResult {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn open_file(
        &self,
        path: &str,
        mode: FileMode,
    ) -> Result<Box<dyn SandboxFile>, SandboxError> {
        Ok(Box::new(E2bFile {
            sandbox_id: self.id.clone(),
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
                "/v0/sandboxes/{}/files?path={}",
                self.id,
                encode_path(dir)
            ))
            .send()
            .await
            .map_err(map_transport)?;
        let entries: Vec<FsEntry> = self.client.expect_json(resp, &self.id).await?;

        Ok(entries
            .into_iter()
            .map(|e| DirEntry {
                is_dir: matches!(e.kind.as_deref(), Some("dir") | Some("directory")),
                name: e.name,
                size_bytes: e.size,
                modified_at: e.modified_at,
            })
            .collect())
    }

    async fn tunnels(&self) -> Result<TunnelMap, SandboxError> {
        let resp = self
            .client
            .get(&format!("/v0/sandboxes/{}/hosts", self.id))
            .send()
            .await
            .map_err(map_transport)?;
        let hosts: BTreeMap<String, String> = self.client.expect_json(resp, &self.id).await?;

        let mut map = TunnelMap::new();
        for (port, host) in hosts {
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            // The API returns bare hostnames; normalize to https URLs.
            let url = if host.starts_with("http") {
                host
            } else {
                format!("https://{host}")
            };
            map.insert(port, url);
        }
        Ok(map)
    }

    async fn snapshot_filesystem(&self) -> Result<ImageId, SandboxError> {
        let resp = self
            .client
            .post(&format!("/v0/sandboxes/{}/snapshots", self.id))
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
            .post(&format!("/v0/sandboxes/{}/resume", self.id))
            .timeout(CREATE_TIMEOUT)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_transport)?;
        // Resuming an already-running sandbox conflicts; that is fine.
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        self.client.expect_ok(resp, &self.id).await
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let resp = self
            .client
            .post(&format!("/v0/sandboxes/{}/pause", self.id))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_transport)?;
        self.client.expect_ok(resp, &self.id).await
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        let resp = self
            .client
            .delete(&format!("/v0/sandboxes/{}", self.id))
            .send()
            .await
            .map_err(map_transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::warn!(sandbox = %self.id, "sandbox already gone at provider");
            return Ok(());
        }
        self.client.expect_ok(resp, &self.id).await
    }
}

/// This provider reads and writes whole files as text over the files
/// endpoint; writes buffer locally and flush as one multipart upload
/// on close.
struct E2bFile {
    sandbox_id: String,
    path: String,
    mode: FileMode,
    client: E2bClient,
    buf: Vec<u8>,
    dirty: bool,
}

#[async_trait]
impl SandboxFile for E2bFile {
    async fn read(&mut self) -> Result<Vec<u8>, SandboxError> {
        let resp = self
            .client
            .get(&format!(
                "/v0/sandboxes/{}/files?path={}",
                self.sandbox_id,
                encode_path(&self.path)
            ))
            .send()
            .await
            .map_err(map_transport)?;
        let resp = self.client.check(resp, &self.sandbox_id).await?;
        let text = resp.text().await.map_err(map_transport)?;
        Ok(text.into_bytes())
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
        let file_name = self
            .path
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("file")
            .to_string();
        let part = reqwest::multipart::Part::bytes(std::mem::take(&mut self.buf))
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| SandboxError::Serde(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("path", self.path.clone())
            .part("file", part);

        let resp = self
            .client
            .post(&format!("/v0/sandboxes/{}/files", self.sandbox_id))
            .multipart(form)
            .send()
            .await
            .map_err(map_transport)?;
        self.dirty = false;
        self.client.expect_ok(resp, &self.sandbox_id).await
    }
}

// ── HTTP client ─────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct E2bClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl E2bClient {
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
struct CreatedSandbox {
    #[serde(rename = "sandboxID", alias = "sandbox_id")]
    sandbox_id: String,
}

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    #[serde(rename = "sandboxID", alias = "sandbox_id")]
    sandbox_id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(rename = "startedAt", default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(rename = "endAt", default)]
    end_at: Option<DateTime<Utc>>,
}

impl SandboxInfo {
    fn into_handle(self) -> SandboxHandle {
        let status = match self.state.as_deref() {
            Some("running") => SandboxStatus::Running,
            Some("paused") | Some("stopped") => SandboxStatus::Stopped,
            _ => SandboxStatus::Running,
        };
        SandboxHandle {
            provider: ProviderKind::E2b,
            sandbox_id: self.sandbox_id,
            public_url: None,
            created_at: self.started_at.unwrap_or_else(Utc::now),
            expires_at: self.end_at,
            status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandResult {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(rename = "exitCode", alias = "exit_code", default)]
    exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct FsEntry {
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(rename = "modifiedAt", default)]
    modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SnapshotCreated {
    #[serde(rename = "snapshotID", alias = "templateID")]
    snapshot_id: String,
}

//! Ships a built project from its sandbox to the hosting target.
//!
//! Two strategies, in order: build + zip + one multipart upload, then a
//! script run inside the sandbox that posts the output file-by-file.
//! The zip path is cheaper for the target, so it always goes first; the
//! direct path exists for artifacts the multipart endpoint refuses.

use std::time::Duration;

use serde::Deserialize;

use crate::config::DeployConfig;
use crate::gitops::shell_quote;
use crate::sandbox::error::SandboxError;
use crate::sandbox::provider::Sandbox;
use crate::sandbox::types::ExecRequest;

const BUILD_TIMEOUT: Duration = Duration::from_secs(300);
const ZIP_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Extra attempts for the one transient failure signature the target
/// is known to produce under load.
const ZIP_UPLOAD_RETRIES: usize = 2;
const TRANSIENT_SIGNATURE: &str = "connection closed";

const OUTPUT_DIR_CANDIDATES: &[&str] = &["dist", "build", "out"];
const ZIP_PATH: &str = "/tmp/site.zip";
const SCRIPT_PATH: &str = "/tmp/sandpiper_upload.cjs";

/// Runs inside the sandbox with node. Reads argv for the output dir and
/// env for the target, so no credentials land in the command line.
const UPLOAD_SCRIPT: &str = r#"const fs = require('fs');
const path = require('path');

const root = process.argv[2];
const endpoint = process.env.DEPLOY_ENDPOINT;
const token = process.env.DEPLOY_TOKEN;

const TEXT = new Set([
  '.html', '.css', '.js', '.mjs', '.cjs', '.json', '.svg', '.txt', '.map', '.webmanifest', '.xml',
]);

function walk(dir) {
  return fs.readdirSync(dir, { withFileTypes: true }).flatMap((entry) => {
    const full = path.join(dir, entry.name);
    return entry.isDirectory() ? walk(full) : [full];
  });
}

const files = walk(root).map((full) => {
  const rel = path.relative(root, full);
  const isText = TEXT.has(path.extname(rel).toLowerCase());
  const content = fs.readFileSync(full);
  return {
    path: rel,
    content: isText ? content.toString('utf8') : content.toString('base64'),
    encoding: isText ? 'utf8' : 'base64',
  };
});

fetch(endpoint, {
  method: 'POST',
  headers: { 'content-type': 'application/json', authorization: `Bearer ${token}` },
  body: JSON.stringify({ files }),
})
  .then(async (res) => {
    const body = await res.text();
    if (!res.ok) {
      console.error(body);
      process.exit(1);
    }
    console.log(body);
  })
  .catch((err) => {
    console.error(String(err));
    process.exit(1);
  });
"#;

#[derive(thiserror::Error, Debug)]
pub enum DeployError {
    /// The project's own build failed. Never falls back: the direct
    /// upload strategy cannot fix broken source.
    #[error("build failed: {stderr}")]
    Build { stderr: String },

    #[error("upload failed: {0}")]
    Upload(String),

    /// The target answered but refused the deployment.
    #[error("deploy target error: {0}")]
    Target(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl DeployError {
    pub fn is_build(&self) -> bool {
        matches!(self, DeployError::Build { .. })
    }

    fn is_transient(&self) -> bool {
        match self {
            DeployError::Upload(message) | DeployError::Target(message) => {
                message.to_lowercase().contains(TRANSIENT_SIGNATURE)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStrategy {
    Zip,
    Direct,
}

impl DeployStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStrategy::Zip => "zip",
            DeployStrategy::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub url: String,
    pub strategy: DeployStrategy,
}

#[derive(Debug, Deserialize)]
struct TargetResponse {
    url: Option<String>,
    error: Option<String>,
}

pub struct DeploymentPipeline {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    workdir: String,
    build_command: String,
}

impl DeploymentPipeline {
    pub fn new(client: reqwest::Client, config: &DeployConfig, workdir: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            workdir: workdir.into(),
            build_command: "npm run build".to_string(),
        }
    }

    pub fn with_build_command(mut self, command: impl Into<String>) -> Self {
        self.build_command = command.into();
        self
    }

    pub async fn deploy(&self, sandbox: &dyn Sandbox) -> Result<Deployment, DeployError> {
        match self.package_and_upload(sandbox).await {
            Ok(url) => {
                tracing::info!(sandbox = %sandbox.id(), %url, "Deployed via zip upload");
                Ok(Deployment {
                    url,
                    strategy: DeployStrategy::Zip,
                })
            }
            Err(err) if err.is_build() => Err(err),
            Err(err) => {
                tracing::warn!(sandbox = %sandbox.id(), error = %err, "Zip upload failed; trying direct upload");
                let url = self.direct_upload(sandbox).await?;
                tracing::info!(sandbox = %sandbox.id(), %url, "Deployed via direct upload");
                Ok(Deployment {
                    url,
                    strategy: DeployStrategy::Direct,
                })
            }
        }
    }

    /// Whether the target currently answers its health route.
    pub async fn healthy(&self) -> bool {
        let url = format!("{}/api/health", self.endpoint);
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(error = %err, "Deploy target unreachable");
                false
            }
        }
    }

    // ── Strategy 1: build, zip, multipart ───────────────────────────

    async fn package_and_upload(&self, sandbox: &dyn Sandbox) -> Result<String, DeployError> {
        let result = sandbox
            .exec(ExecRequest::shell(&self.build_command, BUILD_TIMEOUT).in_dir(&self.workdir))
            .await?;
        if !result.success() {
            return Err(DeployError::Build {
                stderr: result.stderr.trim().to_string(),
            });
        }

        let output_dir = self.detect_output_dir(sandbox).await?;
        tracing::debug!(dir = %output_dir, "Zipping build output");
        sandbox
            .exec(ExecRequest::shell(
                format!(
                    "cd {} && rm -f {ZIP_PATH} && zip -qr {ZIP_PATH} .",
                    shell_quote(&output_dir)
                ),
                ZIP_TIMEOUT,
            ))
            .await?
            .require_success("zip")?;
        let bytes = sandbox.read_file(ZIP_PATH).await?;

        let mut attempt = 0;
        loop {
            match self.upload_zip(bytes.clone()).await {
                Ok(url) => return Ok(url),
                Err(err) if attempt < ZIP_UPLOAD_RETRIES && err.is_transient() => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "Transient upload failure; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn detect_output_dir(&self, sandbox: &dyn Sandbox) -> Result<String, DeployError> {
        for candidate in OUTPUT_DIR_CANDIDATES {
            let dir = format!("{}/{candidate}", self.workdir);
            let result = sandbox
                .exec(ExecRequest::shell(
                    format!("test -d {}", shell_quote(&dir)),
                    PROBE_TIMEOUT,
                ))
                .await?;
            if result.success() {
                return Ok(dir);
            }
        }
        // Some setups build in place.
        Ok(self.workdir.clone())
    }

    async fn upload_zip(&self, bytes: Vec<u8>) -> Result<String, DeployError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name("site.zip");
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .client
            .post(format!("{}/api/deployments", self.endpoint))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|err| DeployError::Upload(err.to_string()))?;
        Self::parse_target_response(resp).await
    }

    async fn parse_target_response(resp: reqwest::Response) -> Result<String, DeployError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|err| DeployError::Upload(err.to_string()))?;
        let parsed: TargetResponse = serde_json::from_str(&body).map_err(|_| {
            DeployError::Target(format!("unexpected response ({status}): {}", truncate(&body)))
        })?;
        if let Some(url) = parsed.url {
            return Ok(url);
        }
        Err(DeployError::Target(parsed.error.unwrap_or_else(|| {
            format!("deploy failed with status {status}")
        })))
    }

    // ── Strategy 2: in-sandbox direct upload ────────────────────────

    async fn direct_upload(&self, sandbox: &dyn Sandbox) -> Result<String, DeployError> {
        let output_dir = self.detect_output_dir(sandbox).await?;
        sandbox.write_file(SCRIPT_PATH, UPLOAD_SCRIPT.as_bytes()).await?;

        let result = sandbox
            .exec(
                ExecRequest::shell(
                    format!("node {SCRIPT_PATH} {}", shell_quote(&output_dir)),
                    SCRIPT_TIMEOUT,
                )
                .env("DEPLOY_ENDPOINT", format!("{}/api/deployments/files", self.endpoint))
                .env("DEPLOY_TOKEN", self.token.clone()),
            )
            .await?;
        if !result.success() {
            return Err(DeployError::Upload(format!(
                "direct upload script: {}",
                result.stderr.trim()
            )));
        }

        let parsed: TargetResponse = serde_json::from_str(result.stdout.trim())
            .map_err(|_| DeployError::Target(format!("unexpected script output: {}", truncate(&result.stdout))))?;
        parsed.url.ok_or_else(|| {
            DeployError::Target(parsed.error.unwrap_or_else(|| "no url in response".to_string()))
        })
    }
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 200;
    if body.chars().count() <= LIMIT {
        body.to_string()
    } else {
        let cut: String = body.chars().take(LIMIT).collect();
        format!("{cut}...")
    }
}

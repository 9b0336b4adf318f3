pub mod file_store;
pub mod store;

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::types::{ProviderKind, SandboxHandle};

/// Marker prefix some callers use to smuggle binary payloads through a
/// plain string field.
const BASE64_PREFIX: &str = "__BASE64__";

/// One user project and everything needed to bring its sandbox back:
/// the live handle (if any), the fragment currently on disk and the
/// last commit recorded inside the sandbox workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    /// Template the project was created from. `None` for projects that
    /// boot straight from the base image.
    #[serde(default)]
    pub template: Option<String>,
    /// Imported projects carry their own sources and need dependencies
    /// installed on a fresh sandbox.
    #[serde(default)]
    pub imported: bool,
    #[serde(default)]
    pub sandbox: Option<SandboxHandle>,
    #[serde(default)]
    pub active_fragment_id: Option<String>,
    #[serde(default)]
    pub last_commit: Option<GitRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            template: None,
            imported: false,
            sandbox: None,
            active_fragment_id: None,
            last_commit: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRef {
    pub commit_hash: String,
    pub branch: String,
}

/// A generated batch of files. Fragments are append-only history; the
/// project record points at the one currently restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub files: BTreeMap<String, FileContent>,
    /// Set once a filesystem snapshot has been bound to this fragment.
    #[serde(default)]
    pub snapshot_image_id: Option<String>,
    /// True when the fragment was rewritten by an automated fix after
    /// the commit for it was already recorded.
    #[serde(default)]
    pub auto_fixed: bool,
    pub created_at: DateTime<Utc>,
}

impl Fragment {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            files: BTreeMap::new(),
            snapshot_image_id: None,
            auto_fixed: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: FileContent) -> Self {
        self.files.insert(path.into(), content);
        self
    }
}

/// File payload of a fragment. The encoding is explicit in the record;
/// `parse` exists only to ingest the two legacy string forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum FileContent {
    Text(String),
    /// Raw standard base64, no marker.
    Base64(String),
    /// A full `data:<mime>;base64,<payload>` URI, kept verbatim.
    DataUri(String),
}

impl FileContent {
    /// Classify a raw string payload: `__BASE64__` marker, base64 data
    /// URI, or plain text.
    pub fn parse(raw: &str) -> Self {
        if let Some(payload) = raw.strip_prefix(BASE64_PREFIX) {
            return FileContent::Base64(payload.to_string());
        }
        if raw.starts_with("data:") && raw.contains(";base64,") {
            return FileContent::DataUri(raw.to_string());
        }
        FileContent::Text(raw.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FileContent::Text(_) => "text",
            FileContent::Base64(_) => "base64",
            FileContent::DataUri(_) => "data-uri",
        }
    }

    /// Bytes to put on disk inside the sandbox.
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self {
            FileContent::Text(text) => Ok(text.as_bytes().to_vec()),
            FileContent::Base64(payload) => {
                BASE64.decode(payload).context("invalid base64 payload")
            }
            FileContent::DataUri(uri) => {
                let Some((_, payload)) = uri.split_once(',') else {
                    bail!("data URI has no payload: {uri}");
                };
                BASE64.decode(payload).context("invalid base64 data URI")
            }
        }
    }
}

/// One commit recorded in the sandbox workspace as a recovery point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitFragmentRecord {
    pub commit_hash: String,
    pub branch: String,
    pub message: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fragment id to provider image binding. At most one per fragment;
/// rebinding supersedes the previous image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBinding {
    pub fragment_id: String,
    pub image_id: String,
    pub provider: ProviderKind,
    pub created_at: DateTime<Utc>,
}

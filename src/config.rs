use std::path::PathBuf;

use crate::sandbox::types::ProviderKind;
use crate::templates::Environment;

pub const DEFAULT_E2B_BASE_URL: &str = "https://api.e2b.dev";
pub const DEFAULT_DAYTONA_BASE_URL: &str = "https://app.daytona.io";

/// Lifecycle configuration loaded from environment variables.
pub struct Config {
    pub e2b: Option<ProviderCredentials>,
    pub daytona: Option<ProviderCredentials>,
    /// Provider used for new sandboxes (existing handles keep their tag).
    pub default_provider: ProviderKind,
    pub runtime_mode: String,
    /// Boot image when no snapshot and no template applies.
    pub base_image: Option<String>,
    /// Project directory inside every sandbox.
    pub workdir: String,
    pub dev_port: u16,
    pub snapshot_keep_count: usize,
    pub sandbox_ttl_minutes: u64,
    pub store_dir: PathBuf,
    pub template_catalog_path: Option<PathBuf>,
    pub deploy: Option<DeployConfig>,
}

#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub endpoint: String,
    pub token: String,
}

/// Raw string values as they come from the environment. Kept separate
/// so tests can build configs without mutating process-global env vars.
#[derive(Debug, Default)]
pub struct RawConfig {
    pub e2b_api_key: Option<String>,
    pub e2b_base_url: Option<String>,
    pub daytona_api_key: Option<String>,
    pub daytona_base_url: Option<String>,
    pub default_provider: Option<String>,
    pub runtime_mode: Option<String>,
    pub base_image: Option<String>,
    pub workdir: Option<String>,
    pub dev_port: Option<String>,
    pub snapshot_keep_count: Option<String>,
    pub sandbox_ttl_minutes: Option<String>,
    pub store_dir: Option<String>,
    pub template_catalog_path: Option<String>,
    pub deploy_endpoint: Option<String>,
    pub deploy_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self::from_raw_values(RawConfig {
            e2b_api_key: var("E2B_API_KEY"),
            e2b_base_url: var("E2B_BASE_URL"),
            daytona_api_key: var("DAYTONA_API_KEY"),
            daytona_base_url: var("DAYTONA_BASE_URL"),
            default_provider: var("SANDBOX_PROVIDER"),
            runtime_mode: var("RUNTIME_MODE"),
            base_image: var("BASE_IMAGE"),
            workdir: var("SANDBOX_WORKDIR"),
            dev_port: var("DEV_SERVER_PORT"),
            snapshot_keep_count: var("SNAPSHOT_KEEP_COUNT"),
            sandbox_ttl_minutes: var("SANDBOX_TTL_MINUTES"),
            store_dir: var("STORE_DIR"),
            template_catalog_path: var("TEMPLATE_CATALOG"),
            deploy_endpoint: var("DEPLOY_ENDPOINT"),
            deploy_token: var("DEPLOY_TOKEN"),
        })
    }

    /// Build a Config from raw string values. Unset or unparsable
    /// values fall back to defaults; empty strings count as unset.
    pub fn from_raw_values(raw: RawConfig) -> Self {
        let e2b = non_empty(raw.e2b_api_key).map(|api_key| ProviderCredentials {
            api_key,
            base_url: non_empty(raw.e2b_base_url)
                .unwrap_or_else(|| DEFAULT_E2B_BASE_URL.to_string()),
        });
        let daytona = non_empty(raw.daytona_api_key).map(|api_key| ProviderCredentials {
            api_key,
            base_url: non_empty(raw.daytona_base_url)
                .unwrap_or_else(|| DEFAULT_DAYTONA_BASE_URL.to_string()),
        });

        let default_provider = match non_empty(raw.default_provider) {
            Some(tag) => ProviderKind::parse(&tag).unwrap_or_else(|| {
                tracing::warn!(%tag, "Unknown SANDBOX_PROVIDER, using e2b");
                ProviderKind::E2b
            }),
            None => ProviderKind::E2b,
        };

        let runtime_mode =
            non_empty(raw.runtime_mode).unwrap_or_else(|| "production".to_string());

        let store_dir = non_empty(raw.store_dir).map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".sandpiper")
        });

        let deploy = match (non_empty(raw.deploy_endpoint), non_empty(raw.deploy_token)) {
            (Some(endpoint), Some(token)) => Some(DeployConfig { endpoint, token }),
            _ => None,
        };

        Config {
            e2b,
            daytona,
            default_provider,
            runtime_mode,
            base_image: non_empty(raw.base_image),
            workdir: non_empty(raw.workdir).unwrap_or_else(|| "/home/user/app".to_string()),
            dev_port: non_empty(raw.dev_port)
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            snapshot_keep_count: non_empty(raw.snapshot_keep_count)
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            sandbox_ttl_minutes: non_empty(raw.sandbox_ttl_minutes)
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            store_dir,
            template_catalog_path: non_empty(raw.template_catalog_path).map(PathBuf::from),
            deploy,
        }
    }

    /// Which half of the template catalog provisioning reads from.
    pub fn environment(&self) -> Environment {
        Environment::from_runtime_mode(&self.runtime_mode)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

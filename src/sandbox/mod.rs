pub mod backends;
pub mod error;
pub mod provider;
pub mod types;

#[cfg(test)]
pub mod fake;

pub use error::SandboxError;
pub use provider::{Sandbox, SandboxFile, SandboxProvider};
pub use types::*;

use std::sync::Arc;

use backends::daytona::DaytonaProvider;
use backends::e2b::E2bProvider;

use crate::config::Config;

/// The configured backends, selectable by stored provider tag.
///
/// Provider identity stops here: callers hold `Arc<dyn SandboxProvider>`
/// and `Box<dyn Sandbox>` and never match on the tag themselves.
pub struct ProviderRegistry {
    e2b: Option<Arc<dyn SandboxProvider>>,
    daytona: Option<Arc<dyn SandboxProvider>>,
    default_kind: ProviderKind,
}

impl ProviderRegistry {
    /// Build every backend that has credentials configured.
    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        let e2b = config.e2b.as_ref().map(|c| {
            tracing::info!(base_url = %c.base_url, "initializing direct-exec sandbox provider");
            Arc::new(E2bProvider::new(&c.base_url, &c.api_key, http.clone()))
                as Arc<dyn SandboxProvider>
        });
        let daytona = config.daytona.as_ref().map(|c| {
            tracing::info!(base_url = %c.base_url, "initializing session-exec sandbox provider");
            Arc::new(DaytonaProvider::new(&c.base_url, &c.api_key, http.clone()))
                as Arc<dyn SandboxProvider>
        });
        Self {
            e2b,
            daytona,
            default_kind: config.default_provider,
        }
    }

    /// Look up the backend owning a stored provider tag.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
        let slot = match kind {
            ProviderKind::E2b => &self.e2b,
            ProviderKind::Daytona => &self.daytona,
        };
        slot.clone().ok_or_else(|| {
            SandboxError::Config(format!("provider {kind} is not configured"))
        })
    }

    pub fn default_kind(&self) -> ProviderKind {
        self.default_kind
    }

    pub fn default_provider(&self) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
        self.get(self.default_kind)
    }

    #[cfg(test)]
    pub fn single(provider: Arc<dyn SandboxProvider>) -> Self {
        let kind = provider.kind();
        let mut registry = Self {
            e2b: None,
            daytona: None,
            default_kind: kind,
        };
        match kind {
            ProviderKind::E2b => registry.e2b = Some(provider),
            ProviderKind::Daytona => registry.daytona = Some(provider),
        }
        registry
    }

    #[cfg(test)]
    pub fn pair(
        e2b: Arc<dyn SandboxProvider>,
        daytona: Arc<dyn SandboxProvider>,
        default_kind: ProviderKind,
    ) -> Self {
        Self {
            e2b: Some(e2b),
            daytona: Some(daytona),
            default_kind,
        }
    }
}

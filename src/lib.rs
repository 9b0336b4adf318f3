//! Sandbox lifecycle management for AI-generated app previews:
//! provisioning from snapshot or template images, fragment and git
//! based content recovery, snapshot retention, and deployment to a
//! static hosting target.

pub mod config;
pub mod deploy;
pub mod gitops;
pub mod images;
pub mod pool;
pub mod project;
pub mod readiness;
pub mod recovery;
pub mod restore;
pub mod sandbox;
pub mod snapshots;
pub mod templates;

pub use config::Config;
pub use deploy::{DeployError, Deployment, DeploymentPipeline};
pub use gitops::GitController;
pub use pool::SandboxPool;
pub use project::file_store::FileProjectStore;
pub use project::store::ProjectStore;
pub use recovery::{ActiveSandbox, HealthSignal, RecoveryOptions, SandboxManager};
pub use restore::FragmentRestorer;
pub use sandbox::error::SandboxError;
pub use sandbox::ProviderRegistry;
pub use snapshots::SnapshotLifecycle;
pub use templates::{Environment, TemplateCatalog};

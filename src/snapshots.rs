//! Filesystem snapshot lifecycle: take one, bind it to the fragment it
//! captures, and keep provider-side storage bounded by deleting images
//! that fell out of the retention window.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::project::store::ProjectStore;
use crate::project::SnapshotBinding;
use crate::sandbox::provider::Sandbox;
use crate::sandbox::types::ImageId;
use crate::sandbox::ProviderRegistry;

pub struct SnapshotLifecycle {
    keep_count: usize,
}

impl SnapshotLifecycle {
    pub fn new(keep_count: usize) -> Self {
        Self { keep_count }
    }

    /// Snapshot the sandbox filesystem and bind the image to
    /// `fragment_id`. A previous image for the same fragment is
    /// superseded and deleted; retention cleanup runs afterwards.
    pub async fn create_snapshot(
        &self,
        registry: &ProviderRegistry,
        sandbox: &dyn Sandbox,
        store: &dyn ProjectStore,
        project_id: &str,
        fragment_id: &str,
    ) -> Result<ImageId> {
        let image_id = sandbox
            .snapshot_filesystem()
            .await
            .with_context(|| format!("snapshot of {}", sandbox.id()))?;
        tracing::info!(project_id = %project_id, fragment = %fragment_id, image = %image_id, "Created filesystem snapshot");

        let superseded = store
            .bind_snapshot(
                project_id,
                SnapshotBinding {
                    fragment_id: fragment_id.to_string(),
                    image_id: image_id.clone(),
                    provider: sandbox.kind(),
                    created_at: Utc::now(),
                },
            )
            .await?;
        if let Some(old) = superseded {
            self.delete_image(registry, &old).await;
        }

        self.cleanup(registry, store, project_id, self.keep_count)
            .await?;
        Ok(image_id)
    }

    /// Keep the `keep` newest bindings; delete images and clear
    /// bindings for everything older. Image deletion is best-effort;
    /// the binding is cleared either way so a broken provider cannot
    /// pin storage records forever.
    pub async fn cleanup(
        &self,
        registry: &ProviderRegistry,
        store: &dyn ProjectStore,
        project_id: &str,
        keep: usize,
    ) -> Result<usize> {
        let mut bindings = store.snapshot_bindings(project_id).await;
        bindings.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let expired: Vec<SnapshotBinding> = bindings.split_off(bindings.len().min(keep));
        for binding in &expired {
            self.delete_image(registry, binding).await;
            store
                .remove_snapshot_binding(project_id, &binding.image_id)
                .await?;
        }
        if !expired.is_empty() {
            tracing::info!(project_id = %project_id, removed = expired.len(), kept = bindings.len(), "Snapshot retention cleanup");
        }
        Ok(expired.len())
    }

    async fn delete_image(&self, registry: &ProviderRegistry, binding: &SnapshotBinding) {
        let provider = match registry.get(binding.provider) {
            Ok(provider) => provider,
            Err(err) => {
                tracing::warn!(image = %binding.image_id, error = %err, "Cannot delete snapshot image");
                return;
            }
        };
        if let Err(err) = provider.delete_image(&binding.image_id).await {
            tracing::warn!(image = %binding.image_id, error = %err, "Snapshot image deletion failed");
        }
    }
}

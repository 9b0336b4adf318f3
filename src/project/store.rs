use anyhow::Result;
use async_trait::async_trait;

use super::{Fragment, GitFragmentRecord, ProjectRecord, SnapshotBinding};

/// Persistence boundary for project state. Reads come from an in-memory
/// cache and are infallible; writes flush through to the backing store.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Populate the cache from the backing store. Called once at
    /// startup, before the store is shared.
    async fn load_all(&self) -> Result<()>;

    async fn list_projects(&self) -> Vec<ProjectRecord>;
    async fn get_project(&self, id: &str) -> Option<ProjectRecord>;
    async fn upsert_project(&self, record: ProjectRecord) -> Result<()>;

    /// Apply `mutate` to the stored record and flush. Returns the
    /// record after mutation, `None` when the project does not exist.
    /// `updated_at` is bumped by the store, not the caller.
    async fn mutate_project(
        &self,
        id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut ProjectRecord) + Send>,
    ) -> Result<Option<ProjectRecord>>;

    async fn get_fragment(&self, project_id: &str, fragment_id: &str) -> Option<Fragment>;
    async fn latest_fragment(&self, project_id: &str) -> Option<Fragment>;
    async fn record_fragment(&self, project_id: &str, fragment: Fragment) -> Result<()>;

    /// Commit history, oldest first.
    async fn git_history(&self, project_id: &str) -> Vec<GitFragmentRecord>;
    async fn record_git_fragment(
        &self,
        project_id: &str,
        record: GitFragmentRecord,
    ) -> Result<()>;

    async fn snapshot_bindings(&self, project_id: &str) -> Vec<SnapshotBinding>;

    /// Bind an image to a fragment, keeping at most one binding per
    /// fragment. Returns the superseded binding so the caller can
    /// delete the orphaned image. Also mirrors the image id onto the
    /// fragment record.
    async fn bind_snapshot(
        &self,
        project_id: &str,
        binding: SnapshotBinding,
    ) -> Result<Option<SnapshotBinding>>;

    async fn remove_snapshot_binding(&self, project_id: &str, image_id: &str) -> Result<()>;
}

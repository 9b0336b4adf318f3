use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::ProjectStore;
use super::{Fragment, GitFragmentRecord, ProjectRecord, SnapshotBinding};

/// Everything persisted for one project, one JSON document per project.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ProjectState {
    record: ProjectRecord,
    #[serde(default)]
    fragments: Vec<Fragment>,
    #[serde(default)]
    git_history: Vec<GitFragmentRecord>,
    #[serde(default)]
    bindings: Vec<SnapshotBinding>,
}

pub struct FileProjectStore {
    base_dir: PathBuf,
    projects: RwLock<HashMap<String, ProjectState>>,
}

impl FileProjectStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            projects: RwLock::new(HashMap::new()),
        }
    }

    fn projects_dir(&self) -> PathBuf {
        self.base_dir.join("projects")
    }

    fn project_file(&self, id: &str) -> PathBuf {
        self.projects_dir().join(format!("{id}.json"))
    }

    fn flush(&self, state: &ProjectState) -> Result<()> {
        let dir = self.projects_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create projects dir: {}", dir.display()))?;
        let path = self.project_file(&state.record.id);
        let content =
            serde_json::to_string_pretty(state).context("failed to serialize project")?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write project file: {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for FileProjectStore {
    async fn load_all(&self) -> Result<()> {
        let dir = self.projects_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create projects dir: {}", dir.display()))?;

        let mut loaded = HashMap::new();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read projects dir: {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read project file: {}", path.display()))?;
            let state: ProjectState = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse project file: {}", path.display()))?;
            tracing::info!(project_id = %state.record.id, "Loaded project");
            loaded.insert(state.record.id.clone(), state);
        }

        let count = loaded.len();
        *self.projects.write().await = loaded;
        tracing::info!(count, "Loaded all projects");
        Ok(())
    }

    async fn list_projects(&self) -> Vec<ProjectRecord> {
        self.projects
            .read()
            .await
            .values()
            .map(|state| state.record.clone())
            .collect()
    }

    async fn get_project(&self, id: &str) -> Option<ProjectRecord> {
        self.projects
            .read()
            .await
            .get(id)
            .map(|state| state.record.clone())
    }

    async fn upsert_project(&self, record: ProjectRecord) -> Result<()> {
        let mut projects = self.projects.write().await;
        let state = projects
            .entry(record.id.clone())
            .and_modify(|state| state.record = record.clone())
            .or_insert_with(|| ProjectState {
                record,
                fragments: Vec::new(),
                git_history: Vec::new(),
                bindings: Vec::new(),
            });
        self.flush(state)
    }

    async fn mutate_project(
        &self,
        id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut ProjectRecord) + Send>,
    ) -> Result<Option<ProjectRecord>> {
        let mut projects = self.projects.write().await;
        let Some(state) = projects.get_mut(id) else {
            return Ok(None);
        };
        mutate(&mut state.record);
        state.record.touch();
        self.flush(state)?;
        Ok(Some(state.record.clone()))
    }

    async fn get_fragment(&self, project_id: &str, fragment_id: &str) -> Option<Fragment> {
        self.projects
            .read()
            .await
            .get(project_id)?
            .fragments
            .iter()
            .find(|f| f.id == fragment_id)
            .cloned()
    }

    async fn latest_fragment(&self, project_id: &str) -> Option<Fragment> {
        self.projects
            .read()
            .await
            .get(project_id)?
            .fragments
            .last()
            .cloned()
    }

    async fn record_fragment(&self, project_id: &str, fragment: Fragment) -> Result<()> {
        let mut projects = self.projects.write().await;
        let Some(state) = projects.get_mut(project_id) else {
            bail!("project {project_id} not found");
        };
        state.fragments.push(fragment);
        self.flush(state)
    }

    async fn git_history(&self, project_id: &str) -> Vec<GitFragmentRecord> {
        self.projects
            .read()
            .await
            .get(project_id)
            .map(|state| state.git_history.clone())
            .unwrap_or_default()
    }

    async fn record_git_fragment(
        &self,
        project_id: &str,
        record: GitFragmentRecord,
    ) -> Result<()> {
        let mut projects = self.projects.write().await;
        let Some(state) = projects.get_mut(project_id) else {
            bail!("project {project_id} not found");
        };
        state.git_history.push(record);
        self.flush(state)
    }

    async fn snapshot_bindings(&self, project_id: &str) -> Vec<SnapshotBinding> {
        self.projects
            .read()
            .await
            .get(project_id)
            .map(|state| state.bindings.clone())
            .unwrap_or_default()
    }

    async fn bind_snapshot(
        &self,
        project_id: &str,
        binding: SnapshotBinding,
    ) -> Result<Option<SnapshotBinding>> {
        let mut projects = self.projects.write().await;
        let Some(state) = projects.get_mut(project_id) else {
            bail!("project {project_id} not found");
        };

        let superseded = state
            .bindings
            .iter()
            .position(|b| b.fragment_id == binding.fragment_id)
            .map(|idx| state.bindings.remove(idx));
        if let Some(fragment) = state
            .fragments
            .iter_mut()
            .find(|f| f.id == binding.fragment_id)
        {
            fragment.snapshot_image_id = Some(binding.image_id.clone());
        }
        state.bindings.push(binding);
        self.flush(state)?;
        Ok(superseded)
    }

    async fn remove_snapshot_binding(&self, project_id: &str, image_id: &str) -> Result<()> {
        let mut projects = self.projects.write().await;
        let Some(state) = projects.get_mut(project_id) else {
            return Ok(());
        };
        state.bindings.retain(|b| b.image_id != image_id);
        for fragment in &mut state.fragments {
            if fragment.snapshot_image_id.as_deref() == Some(image_id) {
                fragment.snapshot_image_id = None;
            }
        }
        self.flush(state)
    }
}

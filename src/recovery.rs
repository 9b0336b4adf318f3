//! Brings a project's sandbox back, whatever state it is in: attached
//! and healthy, paused but startable, or gone and in need of full
//! provisioning. Concurrent callers for one project are serialized so
//! a race cannot create two sandboxes for the same project.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};

use crate::config::Config;
use crate::gitops::{prefers_git_recovery, GitController};
use crate::images::{select_boot_image, ImageQuery};
use crate::project::store::ProjectStore;
use crate::project::{Fragment, ProjectRecord};
use crate::readiness::{self, wait_until};
use crate::restore::FragmentRestorer;
use crate::sandbox::error::SandboxError;
use crate::sandbox::provider::{Sandbox, SandboxProvider};
use crate::sandbox::types::{CreateSandbox, ExecRequest, SandboxHandle, SandboxStatus};
use crate::sandbox::ProviderRegistry;
use crate::templates::{Environment, TemplateCatalog};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_READY_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_START_WAIT: Duration = Duration::from_secs(20);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where the dev-server process leaves its output inside the sandbox.
const DEV_LOG_COMMAND: &str = "tail -n 100 /tmp/dev-server.log 2>/dev/null || true";
/// Touched by template boot scripts once the dev server is up.
const READY_MARKER: &str = "/tmp/.dev-server-ready";

/// Verdict from the out-of-process preview monitor.
#[derive(Debug, Clone, Default)]
pub struct HealthSignal {
    pub broken: bool,
    pub reason: Option<String>,
    pub missing_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    /// Template for the project record, applied only when the record
    /// does not exist yet.
    pub template: Option<String>,
    /// Marks a newly created record as an imported codebase.
    pub imported: bool,
    /// Operator override: boot from this snapshot image, no questions.
    pub recovery_image_id: Option<String>,
    pub health: Option<HealthSignal>,
}

#[derive(Debug)]
pub struct ActiveSandbox {
    pub sandbox: Box<dyn Sandbox>,
    pub handle: SandboxHandle,
    /// True when this call created a fresh sandbox.
    pub provisioned: bool,
    /// False means readiness was not confirmed within budget; callers
    /// proceed optimistically.
    pub ready: bool,
}

enum AttachOutcome {
    Attached(ActiveSandbox),
    Reprovision,
}

pub struct SandboxManager {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn ProjectStore>,
    catalog: TemplateCatalog,
    environment: Environment,
    base_image: Option<String>,
    workdir: String,
    dev_port: u16,
    sandbox_ttl: Duration,
    restorer: FragmentRestorer,
    git: GitController,
    ready_wait: Duration,
    start_wait: Duration,
    poll_interval: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SandboxManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn ProjectStore>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            store,
            catalog: TemplateCatalog::load(config.template_catalog_path.as_deref()),
            environment: config.environment(),
            base_image: config.base_image.clone(),
            workdir: config.workdir.clone(),
            dev_port: config.dev_port,
            sandbox_ttl: Duration::from_secs(config.sandbox_ttl_minutes * 60),
            restorer: FragmentRestorer::default(),
            git: GitController::new(config.workdir.clone()),
            ready_wait: DEFAULT_READY_WAIT,
            start_wait: DEFAULT_START_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            locks: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn with_timing(
        mut self,
        ready_wait: Duration,
        start_wait: Duration,
        poll_interval: Duration,
    ) -> Self {
        self.ready_wait = ready_wait;
        self.start_wait = start_wait;
        self.poll_interval = poll_interval;
        self
    }

    /// Resolve a usable sandbox for the project, provisioning one if
    /// nothing attachable remains.
    pub async fn get_or_create(
        &self,
        project_id: &str,
        opts: RecoveryOptions,
    ) -> Result<ActiveSandbox> {
        let lock = self.lock_project(project_id);
        let _guard = lock.lock().await;

        let project = self.load_or_create_project(project_id, &opts).await?;

        if let Some(handle) = project.sandbox.clone() {
            if handle.is_expired(Utc::now()) {
                tracing::info!(project_id, sandbox = %handle.sandbox_id, "Handle expired; reprovisioning");
                self.terminate_handle(&handle).await;
                self.clear_handle(project_id).await?;
            } else {
                match self
                    .try_attach(project_id, &handle, opts.health.as_ref())
                    .await?
                {
                    AttachOutcome::Attached(active) => return Ok(active),
                    AttachOutcome::Reprovision => {}
                }
            }
        }

        self.provision(project_id, &opts).await
    }

    /// Re-read the tunnel map and persist the preview URL. `None` when
    /// the project has no live sandbox.
    pub async fn refresh_url(&self, project_id: &str) -> Result<Option<String>> {
        let Some(project) = self.store.get_project(project_id).await else {
            return Ok(None);
        };
        let Some(handle) = project.sandbox else {
            return Ok(None);
        };
        let provider = self.registry.get(handle.provider)?;
        let sandbox = match provider.attach(&handle.sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(err) if err.is_stale() => {
                self.clear_handle(project_id).await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let url = self.lookup_url(&*sandbox).await;
        let stored = url.clone();
        self.store
            .mutate_project(
                project_id,
                Box::new(move |project| {
                    if let Some(handle) = project.sandbox.as_mut() {
                        handle.public_url = stored;
                    }
                }),
            )
            .await?;
        Ok(url)
    }

    pub async fn terminate(&self, project_id: &str) -> Result<()> {
        let lock = self.lock_project(project_id);
        let _guard = lock.lock().await;
        let Some(project) = self.store.get_project(project_id).await else {
            return Ok(());
        };
        let Some(handle) = project.sandbox else {
            return Ok(());
        };
        self.terminate_handle(&handle).await;
        self.clear_handle(project_id).await?;
        tracing::info!(project_id, sandbox = %handle.sandbox_id, "Sandbox terminated");
        Ok(())
    }

    /// Terminate every sandbox whose handle has passed its expiry.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut swept = 0;
        for project in self.store.list_projects().await {
            let Some(handle) = project.sandbox.as_ref() else {
                continue;
            };
            if !handle.is_expired(now) {
                continue;
            }
            tracing::info!(project_id = %project.id, sandbox = %handle.sandbox_id, "Sweeping expired sandbox");
            self.terminate_handle(handle).await;
            self.clear_handle(&project.id).await?;
            swept += 1;
        }
        Ok(swept)
    }

    // ── Attach path ─────────────────────────────────────────────────

    async fn try_attach(
        &self,
        project_id: &str,
        handle: &SandboxHandle,
        health: Option<&HealthSignal>,
    ) -> Result<AttachOutcome> {
        let provider = self.registry.get(handle.provider)?;
        let sandbox = match self
            .attach_with_retry(provider.as_ref(), &handle.sandbox_id)
            .await
        {
            Ok(sandbox) => sandbox,
            Err(err) if err.is_stale() => {
                tracing::warn!(project_id, sandbox = %handle.sandbox_id, "Provider no longer knows sandbox; clearing handle");
                self.clear_handle(project_id).await?;
                return Ok(AttachOutcome::Reprovision);
            }
            Err(err) => return Err(err.into()),
        };

        match self.probe(&*sandbox).await {
            Ok(()) => {
                if let Some(signal) = health.filter(|signal| signal.broken) {
                    return self.recheck_broken(project_id, handle, sandbox, signal).await;
                }
                Ok(AttachOutcome::Attached(ActiveSandbox {
                    sandbox,
                    handle: handle.clone(),
                    provisioned: false,
                    ready: true,
                }))
            }
            Err(err) if err.is_stale() => {
                self.clear_handle(project_id).await?;
                Ok(AttachOutcome::Reprovision)
            }
            Err(err) if err.is_startable() => {
                self.start_and_retry(project_id, sandbox).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn attach_with_retry(
        &self,
        provider: &dyn SandboxProvider,
        sandbox_id: &str,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        match provider.attach(sandbox_id).await {
            Err(err @ (SandboxError::Timeout | SandboxError::Backend(_))) => {
                tracing::warn!(sandbox = %sandbox_id, error = %err, "Attach failed; retrying once");
                tokio::time::sleep(ATTACH_RETRY_DELAY).await;
                provider.attach(sandbox_id).await
            }
            other => other,
        }
    }

    /// Basic filesystem access check against the working directory.
    async fn probe(&self, sandbox: &dyn Sandbox) -> Result<(), SandboxError> {
        sandbox
            .exec(ExecRequest::shell(
                format!("test -d '{}'", self.workdir),
                PROBE_TIMEOUT,
            ))
            .await?
            .require_success("filesystem probe")?;
        Ok(())
    }

    async fn start_and_retry(
        &self,
        project_id: &str,
        sandbox: Box<dyn Sandbox>,
    ) -> Result<AttachOutcome> {
        tracing::info!(project_id, sandbox = %sandbox.id(), "Sandbox not running; starting");
        if let Err(err) = sandbox.start().await {
            tracing::warn!(project_id, sandbox = %sandbox.id(), error = %err, "Start failed; reprovisioning");
            self.clear_handle(project_id).await?;
            return Ok(AttachOutcome::Reprovision);
        }

        let target: &dyn Sandbox = &*sandbox;
        let manager = self;
        let reachable = wait_until(
            move || async move { manager.probe(target).await.is_ok() },
            self.start_wait,
            self.poll_interval,
        )
        .await;
        if !reachable {
            tracing::warn!(project_id, sandbox = %sandbox.id(), "Sandbox did not come back after start; reprovisioning");
            self.clear_handle(project_id).await?;
            return Ok(AttachOutcome::Reprovision);
        }

        let ready = self.wait_ready(&*sandbox).await;
        let url = self.lookup_url(&*sandbox).await;
        let stored = url.clone();
        let updated = self
            .store
            .mutate_project(
                project_id,
                Box::new(move |project| {
                    if let Some(handle) = project.sandbox.as_mut() {
                        handle.status = SandboxStatus::Running;
                        if stored.is_some() {
                            handle.public_url = stored;
                        }
                    }
                }),
            )
            .await?
            .with_context(|| format!("project {project_id} not found"))?;
        let handle = updated
            .sandbox
            .with_context(|| format!("handle for {project_id} vanished during start"))?;
        Ok(AttachOutcome::Attached(ActiveSandbox {
            sandbox,
            handle,
            provisioned: false,
            ready,
        }))
    }

    /// The monitor says the preview is down even though the sandbox
    /// answers. Nudge it once; replace it if it stays unready.
    async fn recheck_broken(
        &self,
        project_id: &str,
        handle: &SandboxHandle,
        sandbox: Box<dyn Sandbox>,
        signal: &HealthSignal,
    ) -> Result<AttachOutcome> {
        tracing::warn!(
            project_id,
            sandbox = %handle.sandbox_id,
            reason = signal.reason.as_deref().unwrap_or("unspecified"),
            missing_files = signal.missing_files.len(),
            "Monitor reports preview broken; rechecking"
        );
        if let Err(err) = sandbox.start().await {
            tracing::debug!(sandbox = %handle.sandbox_id, error = %err, "Start during recheck failed");
        }
        if self.wait_ready(&*sandbox).await {
            tracing::info!(project_id, sandbox = %handle.sandbox_id, "Preview recovered without reprovisioning");
            return Ok(AttachOutcome::Attached(ActiveSandbox {
                sandbox,
                handle: handle.clone(),
                provisioned: false,
                ready: true,
            }));
        }

        tracing::warn!(project_id, sandbox = %handle.sandbox_id, "Broken sandbox is not recovering; replacing");
        if let Err(err) = sandbox.terminate().await {
            tracing::warn!(sandbox = %handle.sandbox_id, error = %err, "Terminating broken sandbox failed");
        }
        self.clear_handle(project_id).await?;
        Ok(AttachOutcome::Reprovision)
    }

    // ── Provisioning path ───────────────────────────────────────────

    async fn provision(&self, project_id: &str, opts: &RecoveryOptions) -> Result<ActiveSandbox> {
        let project = self
            .store
            .get_project(project_id)
            .await
            .with_context(|| format!("project {project_id} not found"))?;
        let fragment = self.target_fragment(&project).await;
        let bindings = self.store.snapshot_bindings(project_id).await;
        let fragment_binding = fragment.as_ref().and_then(|fragment| {
            let image = fragment.snapshot_image_id.as_deref()?;
            bindings.iter().find(|b| b.image_id == image)
        });

        let boot = select_boot_image(
            ImageQuery {
                recovery_image_id: opts.recovery_image_id.as_deref(),
                fragment: fragment.as_ref(),
                fragment_binding,
                template: project.template.as_deref(),
                base_image: self.base_image.as_deref(),
            },
            &self.catalog,
            self.environment,
        )?;
        let provider = match boot.provider {
            Some(kind) => self.registry.get(kind)?,
            None => self.registry.default_provider()?,
        };

        tracing::info!(
            project_id,
            image = %boot.image_id,
            source = boot.source.as_str(),
            provider = %provider.kind(),
            "Provisioning sandbox"
        );
        let spec = CreateSandbox::from_image(boot.image_id.clone())
            .label("project", project_id)
            .label("managed-by", "sandpiper")
            .ttl(self.sandbox_ttl);
        let sandbox = provider.create(spec).await?;

        if let Err(err) = self
            .populate(project_id, &project, fragment.as_ref(), boot.restore_files, &*sandbox)
            .await
        {
            tracing::warn!(project_id, sandbox = %sandbox.id(), error = %err, "Provisioning failed; terminating partial sandbox");
            if let Err(term_err) = sandbox.terminate().await {
                tracing::warn!(sandbox = %sandbox.id(), error = %term_err, "Cleanup of failed sandbox also failed");
            }
            return Err(err);
        }

        let ready = self.wait_ready(&*sandbox).await;
        let public_url = self.lookup_url(&*sandbox).await;

        let now = Utc::now();
        let handle = SandboxHandle {
            provider: sandbox.kind(),
            sandbox_id: sandbox.id().to_string(),
            public_url,
            created_at: now,
            expires_at: TimeDelta::from_std(self.sandbox_ttl)
                .ok()
                .map(|ttl| now + ttl),
            status: SandboxStatus::Running,
        };
        let stored = handle.clone();
        self.store
            .mutate_project(
                project_id,
                Box::new(move |project| {
                    project.sandbox = Some(stored);
                }),
            )
            .await?
            .with_context(|| format!("project {project_id} disappeared during provisioning"))?;
        tracing::info!(
            project_id,
            sandbox = %handle.sandbox_id,
            url = handle.public_url.as_deref().unwrap_or("-"),
            ready,
            "Sandbox provisioned"
        );

        Ok(ActiveSandbox {
            sandbox,
            handle,
            provisioned: true,
            ready,
        })
    }

    /// Content restoration plus dependency install, everything that can
    /// fail between create and persist.
    async fn populate(
        &self,
        project_id: &str,
        project: &ProjectRecord,
        fragment: Option<&Fragment>,
        restore_files: bool,
        sandbox: &dyn Sandbox,
    ) -> Result<()> {
        if restore_files {
            if let Some(fragment) = fragment {
                self.restore_content(project_id, project, fragment, sandbox)
                    .await?;
            }
        }

        if project.imported {
            tracing::info!(project_id, sandbox = %sandbox.id(), "Installing dependencies for imported project");
            sandbox
                .exec(
                    ExecRequest::shell("npm install --no-audit --no-fund", INSTALL_TIMEOUT)
                        .in_dir(&self.workdir),
                )
                .await?
                .require_success("npm install")?;
        }
        Ok(())
    }

    async fn restore_content(
        &self,
        project_id: &str,
        project: &ProjectRecord,
        fragment: &Fragment,
        sandbox: &dyn Sandbox,
    ) -> Result<()> {
        if let Some(commit) = project.last_commit.as_ref() {
            if prefers_git_recovery(Some(fragment), Some(commit)) {
                match self
                    .git
                    .switch_to_commit(sandbox, self.store.as_ref(), project_id, &commit.commit_hash)
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        tracing::warn!(project_id, commit = %commit.commit_hash, error = %err, "Git recovery failed; falling back to file restore");
                    }
                }
            }
        }

        let report = self
            .restorer
            .restore(sandbox, &fragment.files, &self.workdir)
            .await;
        if !report.is_complete() {
            tracing::warn!(project_id, failed = report.failed.len(), "Restore finished with failures");
        }
        let fragment_id = fragment.id.clone();
        self.store
            .mutate_project(
                project_id,
                Box::new(move |project| {
                    project.active_fragment_id = Some(fragment_id);
                }),
            )
            .await?;
        Ok(())
    }

    /// The fragment a fresh sandbox should carry: the active one if it
    /// still exists, otherwise the newest recorded.
    async fn target_fragment(&self, project: &ProjectRecord) -> Option<Fragment> {
        if let Some(id) = project.active_fragment_id.as_deref() {
            if let Some(fragment) = self.store.get_fragment(&project.id, id).await {
                return Some(fragment);
            }
            tracing::warn!(project_id = %project.id, fragment = %id, "Active fragment missing from store");
        }
        self.store.latest_fragment(&project.id).await
    }

    // ── Shared helpers ──────────────────────────────────────────────

    async fn wait_ready(&self, sandbox: &dyn Sandbox) -> bool {
        let port = self.dev_port;
        let ready = wait_until(
            move || async move {
                readiness::marker_file_exists(sandbox, READY_MARKER).await
                    || readiness::tunnel_on_port(sandbox, port).await
                    || readiness::logs_ready(sandbox, DEV_LOG_COMMAND).await
            },
            self.ready_wait,
            self.poll_interval,
        )
        .await;
        if !ready {
            tracing::warn!(sandbox = %sandbox.id(), "Readiness not confirmed; proceeding optimistically");
        }
        ready
    }

    async fn lookup_url(&self, sandbox: &dyn Sandbox) -> Option<String> {
        match sandbox.tunnels().await {
            Ok(tunnels) => tunnels.get(&self.dev_port).cloned(),
            Err(err) => {
                tracing::debug!(sandbox = %sandbox.id(), error = %err, "Tunnel lookup failed");
                None
            }
        }
    }

    async fn terminate_handle(&self, handle: &SandboxHandle) {
        let provider = match self.registry.get(handle.provider) {
            Ok(provider) => provider,
            Err(err) => {
                tracing::warn!(sandbox = %handle.sandbox_id, error = %err, "Cannot reach provider to terminate");
                return;
            }
        };
        match provider.attach(&handle.sandbox_id).await {
            Ok(sandbox) => {
                if let Err(err) = sandbox.terminate().await {
                    tracing::warn!(sandbox = %handle.sandbox_id, error = %err, "Terminate failed");
                }
            }
            Err(err) if err.is_stale() => {}
            Err(err) => {
                tracing::warn!(sandbox = %handle.sandbox_id, error = %err, "Could not reach sandbox to terminate");
            }
        }
    }

    async fn clear_handle(&self, project_id: &str) -> Result<()> {
        self.store
            .mutate_project(project_id, Box::new(|project| project.sandbox = None))
            .await?;
        Ok(())
    }

    async fn load_or_create_project(
        &self,
        project_id: &str,
        opts: &RecoveryOptions,
    ) -> Result<ProjectRecord> {
        if let Some(project) = self.store.get_project(project_id).await {
            return Ok(project);
        }
        let mut record = ProjectRecord::new(project_id);
        record.template = opts.template.clone();
        record.imported = opts.imported;
        self.store.upsert_project(record.clone()).await?;
        tracing::info!(
            project_id,
            template = record.template.as_deref().unwrap_or("none"),
            imported = record.imported,
            "Created project record"
        );
        Ok(record)
    }

    fn lock_project(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(project_id.to_string())
            .or_default()
            .clone()
    }
}

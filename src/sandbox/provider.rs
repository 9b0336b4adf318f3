use async_trait::async_trait;

use super::error::SandboxError;
use super::types::*;

/// One compute provider (the account-level API).
///
/// Backends implement this trait; callers select an implementation by
/// the stored `ProviderKind` tag and never branch on provider identity
/// themselves.
#[async_trait]
pub trait SandboxProvider: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ProviderKind;

    /// Boot a new sandbox from a filesystem image.
    async fn create(&self, spec: CreateSandbox) -> Result<Box<dyn Sandbox>, SandboxError>;

    /// Re-attach to an existing sandbox by provider id. `NotFound`
    /// means the persisted handle is stale and must be cleared.
    async fn attach(&self, sandbox_id: &str) -> Result<Box<dyn Sandbox>, SandboxError>;

    /// Sandboxes currently known to this account.
    async fn list(&self) -> Result<Vec<SandboxHandle>, SandboxError>;

    /// Delete a filesystem image. An id the provider no longer knows is
    /// treated as already deleted.
    async fn delete_image(&self, image_id: &str) -> Result<(), SandboxError>;
}

/// A live sandbox. Every method is a network round-trip to the
/// provider; callers pass explicit timeouts on exec and should expect
/// hundreds of milliseconds per call.
#[async_trait]
pub trait Sandbox: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> ProviderKind;

    // ── Exec ────────────────────────────────────────────────────

    /// Run a command to completion, capturing stdout/stderr.
    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError>;

    // ── Files ───────────────────────────────────────────────────

    async fn open_file(
        &self,
        path: &str,
        mode: FileMode,
    ) -> Result<Box<dyn SandboxFile>, SandboxError>;

    async fn list_files(&self, dir: &str) -> Result<Vec<DirEntry>, SandboxError>;

    /// Whole-file read convenience over `open_file`.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        let mut file = self.open_file(path, FileMode::Read).await?;
        let bytes = file.read().await?;
        file.close().await?;
        Ok(bytes)
    }

    /// Whole-file write convenience over `open_file`.
    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let mut file = self.open_file(path, FileMode::Write).await?;
        file.write(bytes).await?;
        file.close().await
    }

    // ── Network ─────────────────────────────────────────────────

    /// Exposed port → public URL, as currently known to the provider.
    async fn tunnels(&self) -> Result<TunnelMap, SandboxError>;

    // ── Snapshot / lifecycle ────────────────────────────────────

    /// Freeze the filesystem into a provider image and return its id.
    async fn snapshot_filesystem(&self) -> Result<ImageId, SandboxError>;

    async fn start(&self) -> Result<(), SandboxError>;
    async fn stop(&self) -> Result<(), SandboxError>;

    /// Destroy the sandbox. Providers treat an already-gone sandbox as
    /// success.
    async fn terminate(&self) -> Result<(), SandboxError>;
}

/// An open file inside a sandbox. Remote providers expose whole-file
/// semantics: `read` returns the full contents, writes are buffered
/// and flushed on `close`.
#[async_trait]
pub trait SandboxFile: Send {
    async fn read(&mut self) -> Result<Vec<u8>, SandboxError>;
    async fn write(&mut self, bytes: &[u8]) -> Result<(), SandboxError>;
    async fn close(&mut self) -> Result<(), SandboxError>;
}

//! In-memory sandbox and provider doubles for tests. State lives behind
//! an `Arc` so a test can keep a clone and inspect what the code under
//! test did to the boxed copy.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::error::SandboxError;
use super::provider::{Sandbox, SandboxFile, SandboxProvider};
use super::types::{
    CreateSandbox, DirEntry, ExecRequest, ExecResult, FileMode, ProviderKind, SandboxHandle,
    SandboxStatus, TunnelMap,
};

pub fn ok_output(stdout: &str) -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed_output(exit_code: i32, stderr: &str) -> ExecResult {
    ExecResult {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[derive(Debug)]
enum ScriptedOutcome {
    Output(ExecResult),
    Fail(String),
}

#[derive(Debug)]
struct ExecScript {
    pattern: String,
    outcome: ScriptedOutcome,
}

#[derive(Debug, Default)]
struct SandboxState {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    execs: Mutex<Vec<String>>,
    scripts: Mutex<Vec<ExecScript>>,
    write_failures: Mutex<BTreeSet<String>>,
    tunnels: Mutex<TunnelMap>,
    snapshot_queue: Mutex<VecDeque<String>>,
    snapshot_count: AtomicUsize,
    start_failure: Mutex<Option<String>>,
    start_noop: AtomicBool,
    running: AtomicBool,
    started: AtomicBool,
    terminated: AtomicBool,
}

#[derive(Clone, Debug)]
pub struct FakeSandbox {
    id: String,
    kind: ProviderKind,
    state: Arc<SandboxState>,
}

impl FakeSandbox {
    pub fn new(id: &str) -> Self {
        let sandbox = Self {
            id: id.to_string(),
            kind: ProviderKind::E2b,
            state: Arc::new(SandboxState::default()),
        };
        sandbox.state.running.store(true, Ordering::SeqCst);
        sandbox
    }

    /// A sandbox that exists but is not running until `start` is called.
    pub fn paused(id: &str) -> Self {
        let sandbox = Self::new(id);
        sandbox.state.running.store(false, Ordering::SeqCst);
        sandbox
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    /// Commands containing `pattern` return `result` instead of the
    /// default empty success. First matching script wins.
    pub fn script_exec(&self, pattern: &str, result: ExecResult) {
        self.state.scripts.lock().unwrap().push(ExecScript {
            pattern: pattern.to_string(),
            outcome: ScriptedOutcome::Output(result),
        });
    }

    /// Commands containing `pattern` fail with an exec transport error.
    pub fn script_exec_failure(&self, pattern: &str, message: &str) {
        self.state.scripts.lock().unwrap().push(ExecScript {
            pattern: pattern.to_string(),
            outcome: ScriptedOutcome::Fail(message.to_string()),
        });
    }

    pub fn put_file(&self, path: &str, bytes: &[u8]) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.to_vec());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.files.lock().unwrap().get(path).cloned()
    }

    pub fn fail_writes_on(&self, path: &str) {
        self.state
            .write_failures
            .lock()
            .unwrap()
            .insert(path.to_string());
    }

    pub fn fail_start(&self, message: &str) {
        *self.state.start_failure.lock().unwrap() = Some(message.to_string());
    }

    /// `start` reports success but the sandbox never reaches running,
    /// like a backend that accepts the request and then crash-loops.
    pub fn start_has_no_effect(&self) {
        self.state.start_noop.store(true, Ordering::SeqCst);
    }

    pub fn set_tunnel(&self, port: u16, url: &str) {
        self.state
            .tunnels
            .lock()
            .unwrap()
            .insert(port, url.to_string());
    }

    pub fn queue_snapshot_id(&self, id: &str) {
        self.state
            .snapshot_queue
            .lock()
            .unwrap()
            .push_back(id.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.execs.lock().unwrap().clone()
    }

    pub fn exec_count_matching(&self, pattern: &str) -> usize {
        self.state
            .execs
            .lock()
            .unwrap()
            .iter()
            .filter(|cmd| cmd.contains(pattern))
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn was_started(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<(), SandboxError> {
        if self.is_terminated() {
            return Err(SandboxError::NotFound(self.id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        self.check_alive()?;
        if !self.is_running() {
            return Err(SandboxError::NotRunning(self.id.clone()));
        }
        self.state.execs.lock().unwrap().push(req.command.clone());
        let scripts = self.state.scripts.lock().unwrap();
        for script in scripts.iter() {
            if req.command.contains(&script.pattern) {
                return match &script.outcome {
                    ScriptedOutcome::Output(result) => Ok(result.clone()),
                    ScriptedOutcome::Fail(message) => Err(SandboxError::Exec(message.clone())),
                };
            }
        }
        Ok(ok_output(""))
    }

    async fn open_file(
        &self,
        path: &str,
        mode: FileMode,
    ) -> Result<Box<dyn SandboxFile>, SandboxError> {
        self.check_alive()?;
        Ok(Box::new(FakeFile {
            sandbox: self.clone(),
            path: path.to_string(),
            mode,
            buf: Vec::new(),
            dirty: false,
        }))
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<DirEntry>, SandboxError> {
        self.check_alive()?;
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let files = self.state.files.lock().unwrap();
        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        for (path, bytes) in files.iter() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    if seen.insert(child.to_string()) {
                        entries.push(DirEntry {
                            name: child.to_string(),
                            is_dir: true,
                            size_bytes: None,
                            modified_at: None,
                        });
                    }
                }
                None => entries.push(DirEntry {
                    name: rest.to_string(),
                    is_dir: false,
                    size_bytes: Some(bytes.len() as u64),
                    modified_at: None,
                }),
            }
        }
        Ok(entries)
    }

    async fn tunnels(&self) -> Result<TunnelMap, SandboxError> {
        self.check_alive()?;
        Ok(self.state.tunnels.lock().unwrap().clone())
    }

    async fn snapshot_filesystem(&self) -> Result<String, SandboxError> {
        self.check_alive()?;
        if !self.is_running() {
            return Err(SandboxError::NotRunning(self.id.clone()));
        }
        if let Some(id) = self.state.snapshot_queue.lock().unwrap().pop_front() {
            return Ok(id);
        }
        let n = self.state.snapshot_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("snap-{}-{n}", self.id))
    }

    async fn start(&self) -> Result<(), SandboxError> {
        self.check_alive()?;
        if let Some(message) = self.state.start_failure.lock().unwrap().clone() {
            return Err(SandboxError::Backend(message));
        }
        self.state.started.store(true, Ordering::SeqCst);
        if !self.state.start_noop.load(Ordering::SeqCst) {
            self.state.running.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.check_alive()?;
        self.state.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        self.state.terminated.store(true, Ordering::SeqCst);
        self.state.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeFile {
    sandbox: FakeSandbox,
    path: String,
    mode: FileMode,
    buf: Vec<u8>,
    dirty: bool,
}

#[async_trait]
impl SandboxFile for FakeFile {
    async fn read(&mut self) -> Result<Vec<u8>, SandboxError> {
        self.sandbox
            .file(&self.path)
            .ok_or_else(|| SandboxError::Backend(format!("no such file: {}", self.path)))
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), SandboxError> {
        if self.mode == FileMode::Read {
            return Err(SandboxError::Rejected(format!(
                "file {} not opened for writing",
                self.path
            )));
        }
        self.buf.extend_from_slice(bytes);
        self.dirty = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SandboxError> {
        if !self.dirty {
            return Ok(());
        }
        if self
            .sandbox
            .state
            .write_failures
            .lock()
            .unwrap()
            .contains(&self.path)
        {
            return Err(SandboxError::Exec(format!(
                "injected write failure: {}",
                self.path
            )));
        }
        let bytes = std::mem::take(&mut self.buf);
        self.sandbox.put_file(&self.path, &bytes);
        self.dirty = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    sandboxes: Mutex<HashMap<String, FakeSandbox>>,
    created: Mutex<Vec<CreateSandbox>>,
    create_queue: Mutex<VecDeque<FakeSandbox>>,
    create_failure: Mutex<Option<String>>,
    deleted_images: Mutex<Vec<String>>,
    delete_failures: Mutex<BTreeSet<String>>,
    counter: AtomicUsize,
}

#[derive(Clone, Debug)]
pub struct FakeProvider {
    kind: ProviderKind,
    state: Arc<ProviderState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            kind: ProviderKind::E2b,
            state: Arc::new(ProviderState::default()),
        }
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    /// Make an existing sandbox attachable by its id.
    pub fn insert(&self, sandbox: FakeSandbox) {
        self.state
            .sandboxes
            .lock()
            .unwrap()
            .insert(sandbox.id.clone(), sandbox);
    }

    /// The next `create` hands out this sandbox instead of a fresh one.
    pub fn queue_created(&self, sandbox: FakeSandbox) {
        self.state.create_queue.lock().unwrap().push_back(sandbox);
    }

    pub fn fail_next_create(&self, message: &str) {
        *self.state.create_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_delete_image(&self, image_id: &str) {
        self.state
            .delete_failures
            .lock()
            .unwrap()
            .insert(image_id.to_string());
    }

    pub fn created_specs(&self) -> Vec<CreateSandbox> {
        self.state.created.lock().unwrap().clone()
    }

    pub fn deleted_images(&self) -> Vec<String> {
        self.state.deleted_images.lock().unwrap().clone()
    }

    pub fn sandbox(&self, id: &str) -> Option<FakeSandbox> {
        self.state.sandboxes.lock().unwrap().get(id).cloned()
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create(&self, spec: CreateSandbox) -> Result<Box<dyn Sandbox>, SandboxError> {
        if let Some(message) = self.state.create_failure.lock().unwrap().take() {
            return Err(SandboxError::Provision(message));
        }
        self.state.created.lock().unwrap().push(spec);
        let sandbox = match self.state.create_queue.lock().unwrap().pop_front() {
            Some(sandbox) => sandbox,
            None => {
                let n = self.state.counter.fetch_add(1, Ordering::SeqCst) + 1;
                FakeSandbox::new(&format!("fake-{n}")).with_kind(self.kind)
            }
        };
        self.insert(sandbox.clone());
        Ok(Box::new(sandbox))
    }

    async fn attach(&self, sandbox_id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let sandbox = self
            .sandbox(sandbox_id)
            .filter(|s| !s.is_terminated())
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;
        Ok(Box::new(sandbox))
    }

    async fn list(&self) -> Result<Vec<SandboxHandle>, SandboxError> {
        let sandboxes = self.state.sandboxes.lock().unwrap();
        Ok(sandboxes
            .values()
            .filter(|s| !s.is_terminated())
            .map(|s| SandboxHandle {
                provider: self.kind,
                sandbox_id: s.id.clone(),
                public_url: None,
                created_at: Utc::now(),
                expires_at: None,
                status: if s.is_running() {
                    SandboxStatus::Running
                } else {
                    SandboxStatus::Stopped
                },
            })
            .collect())
    }

    async fn delete_image(&self, image_id: &str) -> Result<(), SandboxError> {
        if self
            .state
            .delete_failures
            .lock()
            .unwrap()
            .contains(image_id)
        {
            return Err(SandboxError::Backend(format!(
                "injected delete failure: {image_id}"
            )));
        }
        self.state
            .deleted_images
            .lock()
            .unwrap()
            .push(image_id.to_string());
        Ok(())
    }
}

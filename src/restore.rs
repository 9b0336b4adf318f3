//! Puts a fragment's files onto a live sandbox filesystem. Round-trips
//! to the provider dominate restore latency, so parent directories are
//! created in one exec and writes run in bounded concurrent batches.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::future::join_all;

use crate::project::FileContent;
use crate::sandbox::provider::Sandbox;

const DEFAULT_BATCH_SIZE: usize = 10;
const MKDIR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub written: usize,
    /// Path and reason for every file that could not be written.
    /// Already-written files stay; restoration never rolls back.
    pub failed: Vec<(String, String)>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct FragmentRestorer {
    batch_size: usize,
}

impl Default for FragmentRestorer {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl FragmentRestorer {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Write `files` (repo-relative paths) under `workdir`. Individual
    /// failures are collected in the report, not propagated; a restore
    /// that lands most files beats one that lands none.
    pub async fn restore(
        &self,
        sandbox: &dyn Sandbox,
        files: &BTreeMap<String, FileContent>,
        workdir: &str,
    ) -> RestoreReport {
        let mut report = RestoreReport::default();
        if files.is_empty() {
            return report;
        }

        let workdir = workdir.trim_end_matches('/');
        if let Err(err) = self.create_parent_dirs(sandbox, files, workdir).await {
            // Writes into existing directories can still succeed.
            tracing::warn!(sandbox = %sandbox.id(), error = %err, "Batched mkdir failed");
        }

        let entries: Vec<(&String, &FileContent)> = files.iter().collect();
        for batch in entries.chunks(self.batch_size) {
            let writes = batch.iter().map(|(path, content)| async move {
                let full_path = format!("{workdir}/{path}");
                let bytes = match content.decode() {
                    Ok(bytes) => bytes,
                    Err(err) => return Err((path.to_string(), format!("decode: {err}"))),
                };
                sandbox
                    .write_file(&full_path, &bytes)
                    .await
                    .map_err(|err| (path.to_string(), err.to_string()))
            });
            for result in join_all(writes).await {
                match result {
                    Ok(()) => report.written += 1,
                    Err((path, reason)) => {
                        tracing::warn!(sandbox = %sandbox.id(), path = %path, reason = %reason, "File restore failed");
                        report.failed.push((path, reason));
                    }
                }
            }
        }

        tracing::info!(
            sandbox = %sandbox.id(),
            written = report.written,
            failed = report.failed.len(),
            "Fragment restore finished"
        );
        report
    }

    /// One `mkdir -p` for the whole distinct parent set.
    async fn create_parent_dirs(
        &self,
        sandbox: &dyn Sandbox,
        files: &BTreeMap<String, FileContent>,
        workdir: &str,
    ) -> Result<(), crate::sandbox::error::SandboxError> {
        let mut dirs = BTreeSet::new();
        for path in files.keys() {
            if let Some((parent, _)) = path.rsplit_once('/') {
                dirs.insert(format!("{workdir}/{parent}"));
            } else {
                dirs.insert(workdir.to_string());
            }
        }
        let command = format!(
            "mkdir -p {}",
            dirs.iter()
                .map(|d| format!("'{}'", d.replace('\'', "'\\''")))
                .collect::<Vec<_>>()
                .join(" ")
        );
        sandbox
            .exec(crate::sandbox::types::ExecRequest::shell(
                command,
                MKDIR_TIMEOUT,
            ))
            .await?
            .require_success("mkdir")?;
        Ok(())
    }
}

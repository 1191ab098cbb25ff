/// Local process runtime
///
/// Development backend for hosts without a Docker daemon. Each Run gets its own
/// temporary directory holding the submission and the harness; every test case
/// spawns a fresh `python3 -I -S` with only `PATH` in its environment. The child is killed
/// when its future is dropped, so a timeout or a cancelled Run never leaves it behind.
///
/// Isolation here is weaker than the container backend: there is no network or
/// filesystem namespace, only the harness's builtin restrictions and rlimits.

use crate::engine::{interpret, timeout_fault, HarnessOutput, Invocation, IsolatedRuntime, RunContext, RuntimeProvider, HARNESS_SOURCE};
use crate::validator::Program;
use anyhow::{Context, Result};
use async_trait::async_trait;
use gauntlet_common::config::SandboxLimits;
use gauntlet_common::types::Fault;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub struct ProcessProvider {
    python_bin: String,
    limits: SandboxLimits,
    root: Option<PathBuf>,
}

impl ProcessProvider {
    pub fn new(python_bin: &str, limits: SandboxLimits) -> Self {
        Self {
            python_bin: python_bin.to_string(),
            limits,
            root: None,
        }
    }

    /// Place run directories under `root` instead of the system temp dir
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}

#[async_trait]
impl RuntimeProvider for ProcessProvider {
    fn backend(&self) -> &'static str {
        "process"
    }

    async fn acquire(&self, run: &RunContext, program: &Program) -> Result<Box<dyn IsolatedRuntime>> {
        let prefix = format!("{}-", run.sandbox_name());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .context("Failed to create run directory")?;

        tokio::fs::write(dir.path().join("submission.py"), &program.source)
            .await
            .context("Failed to write submission")?;
        tokio::fs::write(dir.path().join("harness.py"), HARNESS_SOURCE)
            .await
            .context("Failed to write harness")?;

        info!(run_id = %run.run_id, dir = %dir.path().display(), "Process sandbox ready");

        Ok(Box::new(ProcessRuntime {
            dir,
            python_bin: self.python_bin.clone(),
            entry: program.entry.name.clone(),
            limits: self.limits.clone(),
        }))
    }
}

pub struct ProcessRuntime {
    dir: TempDir,
    python_bin: String,
    entry: String,
    limits: SandboxLimits,
}

impl ProcessRuntime {
    async fn run_harness(&self, input: &[u8]) -> Result<HarnessOutput> {
        let mut child = Command::new(&self.python_bin)
            .arg("-I")
            .arg("-S")
            .arg("harness.py")
            .arg("submission.py")
            .arg(&self.entry)
            .arg(self.limits.memory_limit_bytes().to_string())
            .current_dir(self.dir.path())
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_else(|| "/usr/bin:/bin".into()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.python_bin))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await.context("Failed to write test input")?;
        }

        let output = child.wait_with_output().await.context("Failed to wait for harness")?;
        Ok(HarnessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: exit_code(&output.status),
        })
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> Option<i64> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|sig| 128 + i64::from(sig)))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> Option<i64> {
    status.code().map(i64::from)
}

#[async_trait]
impl IsolatedRuntime for ProcessRuntime {
    async fn invoke(&mut self, input: &Value) -> Invocation {
        let input_json = input.to_string();
        let timeout = Duration::from_millis(self.limits.timeout_ms);

        match tokio::time::timeout(timeout, self.run_harness(input_json.as_bytes())).await {
            Ok(Ok(output)) => interpret(&output),
            Ok(Err(e)) => Invocation::Faulted(Fault::sandbox(format!("{:#}", e))),
            // Dropping the future killed the child
            Err(_) => timeout_fault(self.limits.timeout_ms),
        }
    }

    async fn release(self: Box<Self>) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("Failed to remove run directory {}", path.display()))?;
        debug!(dir = %path.display(), "Process sandbox released");
        Ok(())
    }
}

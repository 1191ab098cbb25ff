/// Docker-backed isolated runtime
///
/// **Container Rules:**
/// 1. One container per Run, named `gauntlet-<submitter>-<run id>` and labelled
///    so `sweep` can find leftovers
/// 2. Network disabled, read-only rootfs, tmpfs `/sandbox`, all capabilities
///    dropped, unprivileged user, pids/memory/cpu ceilings
/// 3. Submission and harness are written once into `/sandbox`
/// 4. Every test case is a separate `exec` under a hard timeout; the harness
///    re-loads the submission so no globals survive between cases
/// 5. A timed-out exec cannot be interrupted on its own, so the whole
///    container is killed and the runtime is marked spent
/// 6. Container removal is guaranteed by `ContainerGuard`

use crate::engine::{interpret, timeout_fault, HarnessOutput, Invocation, IsolatedRuntime, RunContext, RuntimeProvider, HARNESS_SOURCE};
use crate::validator::Program;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use gauntlet_common::config::SandboxLimits;
use gauntlet_common::types::Fault;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const SANDBOX_DIR: &str = "/sandbox";
const MANAGED_LABEL: &str = "gauntlet.managed";
const SUBMITTER_LABEL: &str = "gauntlet.submitter";

/// Exec arguments are bounded by the kernel's per-argument limit; base64 adds a third
const MAX_INVOCATION_INPUT_BYTES: usize = 96 * 1024;

/// Container cleanup guard - guarantees container removal on drop
/// Covers cancellation (the Run future is dropped) and panics
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id: Some(container_id),
        }
    }

    fn id(&self) -> &str {
        self.container_id.as_deref().unwrap_or_default()
    }

    fn disarm(&mut self) -> Option<String> {
        self.container_id.take()
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        // Drop cannot be async; hand the removal to the runtime if one is alive
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let docker = self.docker.clone();
                handle.spawn(async move {
                    if let Err(e) = remove(&docker, &container_id).await {
                        warn!(container_id = %container_id, error = %e, "Failed to clean up container");
                    } else {
                        debug!(container_id = %container_id, "Container removed by guard");
                    }
                });
            }
            Err(_) => {
                warn!(container_id = %container_id, "No async runtime during drop; container left for sweep");
            }
        }
    }
}

async fn remove(docker: &Docker, container_id: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    docker
        .remove_container(container_id, Some(options))
        .await
        .context("Failed to remove container")
}

/// Run a command inside a container and collect its output
async fn run_exec(docker: &Docker, container_id: &str, cmd: Vec<String>) -> Result<HarnessOutput> {
    let exec_config = CreateExecOptions {
        cmd: Some(cmd),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };

    let exec = docker
        .create_exec(container_id, exec_config)
        .await
        .context("Failed to create exec")?;

    let start_config = StartExecOptions {
        detach: false,
        ..Default::default()
    };

    let mut output = HarnessOutput::default();
    if let StartExecResults::Attached { output: mut stream, .. } =
        docker.start_exec(&exec.id, Some(start_config)).await?
    {
        while let Some(msg) = stream.next().await {
            match msg.context("Failed to read exec output")? {
                LogOutput::StdOut { message } => output.stdout.push_str(&String::from_utf8_lossy(&message)),
                LogOutput::StdErr { message } => output.stderr.push_str(&String::from_utf8_lossy(&message)),
                _ => {}
            }
        }
    } else {
        bail!("Failed to attach to exec");
    }

    output.exit_code = docker.inspect_exec(&exec.id).await?.exit_code;
    Ok(output)
}

pub(crate) fn container_config(image: &str, limits: &SandboxLimits, run: &RunContext) -> Config<String> {
    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        ("gauntlet.run_id".to_string(), run.run_id.to_string()),
        (SUBMITTER_LABEL.to_string(), run.submitter_id.clone()),
    ]);
    let tmpfs = HashMap::from([(
        SANDBOX_DIR.to_string(),
        "rw,nosuid,nodev,size=16m,mode=1777".to_string(),
    )]);

    Config {
        image: Some(image.to_string()),
        // Keep the container idle; test cases arrive as execs
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        entrypoint: Some(vec![]),
        user: Some("65534:65534".to_string()),
        working_dir: Some(SANDBOX_DIR.to_string()),
        labels: Some(labels),
        network_disabled: Some(true),
        host_config: Some(bollard::models::HostConfig {
            memory: Some(limits.memory_limit_bytes()),
            memory_swap: Some(limits.memory_limit_bytes()),
            nano_cpus: Some(limits.nano_cpus()),
            pids_limit: Some(limits.pids_limit),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            network_mode: Some("none".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Hands out one hardened container per Run
pub struct DockerProvider {
    docker: Docker,
    image: String,
    python_bin: String,
    limits: SandboxLimits,
}

impl DockerProvider {
    pub fn connect(image: &str, python_bin: &str, limits: SandboxLimits) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            image: image.to_string(),
            python_bin: python_bin.to_string(),
            limits,
        })
    }

    /// Verify the image is present locally, pulling it on a cache miss
    async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            debug!(image = %self.image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %self.image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }
        info!(image = %self.image, "Image pulled");
        Ok(())
    }

    async fn write_file(&self, container_id: &str, path: &str, content: &str) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(content);
        let command = format!("echo '{}' | base64 -d > {}", encoded, path);
        let output = run_exec(&self.docker, container_id, vec!["sh".to_string(), "-c".to_string(), command]).await?;
        if output.exit_code != Some(0) {
            bail!("Failed to write {} into container: {}", path, output.stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl RuntimeProvider for DockerProvider {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn acquire(&self, run: &RunContext, program: &Program) -> Result<Box<dyn IsolatedRuntime>> {
        self.ensure_image()
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", self.image))?;

        let name = run.sandbox_name();
        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), container_config(&self.image, &self.limits, run))
            .await
            .context("Failed to create Docker container")?;

        // Armed before anything else can fail
        let guard = ContainerGuard::new(self.docker.clone(), container.id);

        self.docker
            .start_container(guard.id(), None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        self.write_file(guard.id(), &format!("{}/submission.py", SANDBOX_DIR), &program.source)
            .await?;
        self.write_file(guard.id(), &format!("{}/harness.py", SANDBOX_DIR), HARNESS_SOURCE)
            .await?;

        info!(run_id = %run.run_id, container = %name, "Container ready");

        Ok(Box::new(DockerRuntime {
            docker: self.docker.clone(),
            guard,
            python_bin: self.python_bin.clone(),
            entry: program.entry.name.clone(),
            limits: self.limits.clone(),
            spent: false,
        }))
    }
}

pub struct DockerRuntime {
    docker: Docker,
    guard: ContainerGuard,
    python_bin: String,
    entry: String,
    limits: SandboxLimits,
    spent: bool,
}

fn harness_command(python_bin: &str, entry: &str, memory_bytes: i64, encoded_input: &str) -> Vec<String> {
    let command = format!(
        "echo '{}' | base64 -d | {} -I -S {dir}/harness.py {dir}/submission.py '{}' {}",
        encoded_input,
        python_bin,
        entry,
        memory_bytes,
        dir = SANDBOX_DIR,
    );
    vec!["sh".to_string(), "-c".to_string(), command]
}

#[async_trait]
impl IsolatedRuntime for DockerRuntime {
    async fn invoke(&mut self, input: &Value) -> Invocation {
        if self.spent {
            return Invocation::Faulted(Fault::sandbox("container was killed by an earlier timeout"));
        }

        let input_json = input.to_string();
        if input_json.len() > MAX_INVOCATION_INPUT_BYTES {
            return Invocation::Faulted(Fault::sandbox(format!(
                "test input is {} bytes, exec limit is {} bytes",
                input_json.len(),
                MAX_INVOCATION_INPUT_BYTES
            )));
        }

        let cmd = harness_command(
            &self.python_bin,
            &self.entry,
            self.limits.memory_limit_bytes(),
            &general_purpose::STANDARD.encode(&input_json),
        );
        let timeout = Duration::from_millis(self.limits.timeout_ms);

        match tokio::time::timeout(timeout, run_exec(&self.docker, self.guard.id(), cmd)).await {
            Ok(Ok(output)) => interpret(&output),
            Ok(Err(e)) => Invocation::Faulted(Fault::sandbox(format!("exec failed: {:#}", e))),
            Err(_) => {
                warn!(container_id = %self.guard.id(), timeout_ms = self.limits.timeout_ms, "Invocation timed out; killing container");
                self.spent = true;
                if let Err(e) = self
                    .docker
                    .kill_container(self.guard.id(), None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %self.guard.id(), error = %e, "Failed to kill timed-out container");
                }
                timeout_fault(self.limits.timeout_ms)
            }
        }
    }

    async fn release(mut self: Box<Self>) -> Result<()> {
        if let Some(container_id) = self.guard.disarm() {
            remove(&self.docker, &container_id)
                .await
                .with_context(|| format!("Failed to release container {}", container_id))?;
            debug!(container_id = %container_id, "Container released");
        }
        Ok(())
    }
}

/// Remove containers this worker family created, optionally for one submitter;
/// returns how many were removed
pub async fn sweep(docker: &Docker, submitter: Option<&str>) -> Result<usize> {
    let mut labels = vec![format!("{}=true", MANAGED_LABEL)];
    if let Some(submitter) = submitter {
        labels.push(format!("{}={}", SUBMITTER_LABEL, submitter));
    }
    let filters = HashMap::from([("label".to_string(), labels)]);
    let options = ListContainersOptions::<String> {
        all: true,
        filters,
        ..Default::default()
    };

    let containers = docker
        .list_containers(Some(options))
        .await
        .context("Failed to list containers")?;

    let mut removed = 0;
    for id in containers.into_iter().filter_map(|c| c.id) {
        match remove(docker, &id).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(container_id = %id, error = %e, "Sweep could not remove container"),
        }
    }
    Ok(removed)
}

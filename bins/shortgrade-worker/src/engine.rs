/// Sandbox Execution Controller
///
/// **Core Responsibility:**
/// Run one exercise's test executable against a submission inside an
/// ephemeral, isolated container and recover its exit status and output.
///
/// **Critical Architectural Boundary:**
/// - Controller knows HOW to execute (Docker)
/// - Controller does NOT know scoring rules
/// - A non-zero exit of the program is a normal result, not an error
/// - `SandboxError` is reserved for engine faults (create/start/wait/logs)
///
/// **Lifecycle of a unit:**
/// 1. Image is built or pulled at most once per process
/// 2. Container is created (no network unless the exercise asks for it)
/// 3. Submission directory + test executable are uploaded as a tar archive
/// 4. Container starts; a deadline kills it if it runs too long
/// 5. Exit code is captured once the container is no longer running
/// 6. Combined stdout/stderr is collected
/// 7. Container is removed, whatever happened before
///
/// An emergency stop cancels every run still in flight: those runs report
/// `SandboxError::Cancelled` instead of a verdict.

use crate::demux::{FrameLayout, OutputCollector};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Every grading container name starts with this prefix.
pub const UNIT_PREFIX: &str = "shortgrade-grade-";

/// Upload target inside the container; also the working directory.
const SANDBOX_ROOT: &str = "/root";

/// How long a killed container may take to reach a terminal state.
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to connect to Docker daemon: {0}")]
    Connect(#[source] DockerError),
    #[error("failed to pull image '{image}': {source}")]
    Pull {
        image: String,
        #[source]
        source: DockerError,
    },
    #[error("failed to build image '{image}': {detail}")]
    Build { image: String, detail: String },
    #[error("failed to package submission: {0}")]
    Archive(#[source] std::io::Error),
    #[error("failed to create container: {0}")]
    Create(#[source] DockerError),
    #[error("failed to upload files into container: {0}")]
    Upload(#[source] DockerError),
    #[error("failed to start container: {0}")]
    Start(#[source] DockerError),
    #[error("failed to wait for container: {0}")]
    Wait(String),
    #[error("failed to read container logs: {0}")]
    Logs(#[source] DockerError),
    #[error("failed to list containers: {0}")]
    List(#[source] DockerError),
    #[error("run cancelled by emergency stop")]
    Cancelled,
}

/// One exercise execution, fully described.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Human-readable part of the unit name (prefix and unique suffix are added).
    pub label: String,
    pub turn_in_dir: PathBuf,
    pub executable: PathBuf,
    pub env: Vec<String>,
    pub network: bool,
    pub timeout: Duration,
}

/// What is left of a unit after it has been torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRun {
    pub exit_code: i64,
    pub output: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Execution backend seam; the grader only depends on this.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxRun, SandboxError>;
}

#[derive(Debug, Clone)]
pub struct SandboxImage {
    pub name: String,
    /// Build from this Dockerfile instead of pulling.
    pub dockerfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 1024 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
        }
    }
}

/// Container cleanup guard - removes the container if the run is dropped
/// before the explicit removal happened (panic, task abort).
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
    armed: bool,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %self.container_id, "No runtime to remove abandoned container");
            return;
        };
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        handle.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove abandoned container");
            }
        });
    }
}

pub struct DockerSandbox {
    docker: Docker,
    image: SandboxImage,
    limits: SandboxLimits,
    framing: FrameLayout,
    output_limit: usize,
    image_ready: OnceCell<()>,
    stopped: CancellationToken,
}

impl DockerSandbox {
    pub fn connect(image: SandboxImage, framing: FrameLayout, output_limit: usize) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(SandboxError::Connect)?;
        Ok(Self {
            docker,
            image,
            limits: SandboxLimits::default(),
            framing,
            output_limit,
            image_ready: OnceCell::new(),
            stopped: CancellationToken::new(),
        })
    }

    /// Builds or pulls the sandbox image. Only the first call does any work.
    pub async fn prepare(&self) -> Result<(), SandboxError> {
        self.image_ready
            .get_or_try_init(|| async {
                match &self.image.dockerfile {
                    Some(dockerfile) => self.build_image(dockerfile).await,
                    None => self.ensure_image().await,
                }
            })
            .await
            .map(|_| ())
    }

    async fn build_image(&self, dockerfile: &Path) -> Result<(), SandboxError> {
        let context = dockerfile
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        info!(image = %self.image.name, dockerfile = %dockerfile.display(), "Building sandbox image");

        let output = Command::new("docker")
            .arg("build")
            .arg("-f")
            .arg(dockerfile)
            .arg("-t")
            .arg(&self.image.name)
            .arg(context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::Build {
                image: self.image.name.clone(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SandboxError::Build {
                image: self.image.name.clone(),
                detail: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        info!(image = %self.image.name, "Sandbox image built");
        Ok(())
    }

    /// Pulls the image unless it is already present locally.
    async fn ensure_image(&self) -> Result<(), SandboxError> {
        let image = self.image.name.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|source| SandboxError::Pull {
                image: image.to_string(),
                source,
            })?;
        }
        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, request: &SandboxRequest, command: String) -> Config<String> {
        Config {
            image: Some(self.image.name.clone()),
            cmd: Some(vec![command]),
            env: Some(request.env.clone()),
            working_dir: Some(SANDBOX_ROOT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            network_disabled: Some(!request.network),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(self.limits.memory_bytes),
                nano_cpus: Some(self.limits.nano_cpus),
                network_mode: (!request.network).then(|| "none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Upload, start, wait under the deadline, collect output.
    async fn drive(
        &self,
        container_id: &str,
        archive: Vec<u8>,
        timeout: Duration,
    ) -> Result<SandboxRun, SandboxError> {
        let upload = UploadToContainerOptions {
            path: SANDBOX_ROOT,
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(upload), archive.into())
            .await
            .map_err(SandboxError::Upload)?;

        let started = Instant::now();
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(SandboxError::Start)?;

        let mut wait = self.docker.wait_container(
            container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );

        let first = tokio::select! {
            status = wait.next() => Some(status),
            _ = tokio::time::sleep(timeout) => None,
            _ = self.stopped.cancelled() => return Err(SandboxError::Cancelled),
        };
        let (status, timed_out) = match first {
            Some(status) => (status, false),
            None => {
                warn!(container_id, timeout_ms = timeout.as_millis() as u64, "Deadline reached, killing container");
                let kill = KillContainerOptions { signal: "SIGKILL" };
                if let Err(e) = self.docker.kill_container(container_id, Some(kill)).await {
                    warn!(container_id, error = %e, "Failed to kill container");
                }
                let status = tokio::time::timeout(KILL_GRACE, wait.next())
                    .await
                    .map_err(|_| SandboxError::Wait("container kept running after kill".to_string()))?;
                (status, true)
            }
        };
        let elapsed = started.elapsed();

        // bollard reports a non-zero exit as an error carrying the code.
        let exit_code = match status {
            Some(Ok(response)) => response.status_code,
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(SandboxError::Wait(e.to_string())),
            None => return Err(SandboxError::Wait("wait stream ended without a status".to_string())),
        };
        debug!(container_id, exit_code, timed_out, elapsed_ms = elapsed.as_millis() as u64, "Container stopped");

        let mut collector = OutputCollector::new(self.framing, self.output_limit);
        let logs_options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut logs = self.docker.logs(container_id, Some(logs_options));
        while let Some(item) = logs.next().await {
            collector.push(item.map_err(SandboxError::Logs)?);
        }

        Ok(SandboxRun {
            exit_code,
            output: collector.into_string(),
            timed_out,
            elapsed,
        })
    }

    async fn remove_unit(&self, container_id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(container_id, Some(options)).await
    }

    /// Ids and names of every grading container, running or not.
    pub async fn list_grading_units(&self) -> Result<Vec<(String, Vec<String>)>, SandboxError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![UNIT_PREFIX.to_string()])]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await.map_err(SandboxError::List)?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.id.map(|id| (id, c.names.unwrap_or_default())))
            .collect())
    }

    /// Cancels every run in flight, refuses new ones, and force-removes every
    /// grading container. Used on shutdown.
    pub async fn emergency_stop(&self) -> Result<usize, SandboxError> {
        self.stopped.cancel();
        let mut removed = 0;
        for (id, _) in self.list_grading_units().await? {
            match self.remove_unit(&id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container_id = %id, error = %e, "Failed to remove grading container"),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    #[instrument(skip(self, request), fields(label = %request.label))]
    async fn run(&self, request: SandboxRequest) -> Result<SandboxRun, SandboxError> {
        if self.stopped.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        self.prepare().await?;

        let executable_name = request
            .executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SandboxError::Archive(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid executable path '{}'", request.executable.display()),
                ))
            })?;

        let (dir, executable) = (request.turn_in_dir.clone(), request.executable.clone());
        let archive = tokio::task::spawn_blocking(move || build_archive(&dir, &executable))
            .await
            .map_err(|e| SandboxError::Archive(std::io::Error::other(e)))?
            .map_err(SandboxError::Archive)?;

        let name = unit_name(&request.label);
        let command = format!("{}/{}", SANDBOX_ROOT, executable_name);
        let config = self.container_config(&request, command);
        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(SandboxError::Create)?;
        let container_id = container.id;
        let mut guard = ContainerGuard::new(&self.docker, container_id.clone());

        let outcome = self.drive(&container_id, archive, request.timeout).await;

        // Unconditional teardown; a failure here is logged, the outcome stands.
        if let Err(e) = self.remove_unit(&container_id).await {
            warn!(container_id = %container_id, error = %e, "Failed to remove container");
        }
        guard.disarm();

        // A unit removed by the emergency stop fails in arbitrary ways.
        if self.stopped.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        outcome
    }
}

/// Unique, Docker-safe container name.
pub fn unit_name(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}-{}", UNIT_PREFIX, sanitized, &suffix[..12])
}

/// Tar archive of the turn-in directory (relative paths kept) plus the test
/// executable at the archive root. File modes, including the executable bit,
/// are preserved.
pub fn build_archive(turn_in_dir: &Path, executable: &Path) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    archive.follow_symlinks(false);
    archive.append_dir_all(".", turn_in_dir)?;

    let name = executable.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "executable path has no file name")
    })?;
    archive.append_path_with_name(executable, name)?;
    archive.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_unit_name_is_sanitized_and_unique() {
        let a = unit_name("alice-00/ex01");
        let b = unit_name("alice-00/ex01");
        assert!(a.starts_with("shortgrade-grade-alice-00-ex01-"));
        assert_ne!(a, b);
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_keeps_layout_and_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let turn_in = dir.path().join("ex00");
        std::fs::create_dir_all(turn_in.join("src")).unwrap();
        std::fs::write(turn_in.join("src/main.rs"), "fn main() {}").unwrap();
        let exe = dir.path().join("ex00-tests");
        std::fs::write(&exe, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let bytes = build_archive(&turn_in, &exe).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut found_source = false;
        let mut exe_mode = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_path_buf();
            if path.ends_with("src/main.rs") {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                assert_eq!(content, "fn main() {}");
                found_source = true;
            }
            if path == Path::new("ex00-tests") {
                exe_mode = Some(entry.header().mode().unwrap());
            }
        }
        assert!(found_source);
        assert_eq!(exe_mode.map(|m| m & 0o111), Some(0o111));
    }
}

/// Repository hosting collaborator.
///
/// The orchestrator only needs three things from the host: a fresh checkout,
/// a way to publish a file (the grading trace) and a release carrying the
/// verdict. `GitCliHost` does this with the `git` and `gh` command-line tools.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Branch receiving grading traces.
pub const TRACES_BRANCH: &str = "traces";

const COMMIT_AUTHOR: [&str; 4] = ["-c", "user.name=shortgrade", "-c", "user.email=shortgrade@localhost"];

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("could not access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait RepositoryHost: Send + Sync {
    async fn clone_repo(&self, repo_id: &str, dir: &Path) -> Result<(), HostError>;
    async fn upload_file(
        &self,
        repo_id: &str,
        local_path: &Path,
        remote_path: &str,
        message: &str,
    ) -> Result<(), HostError>;
    async fn create_release(&self, repo_id: &str, tag: &str, name: &str, body: &str) -> Result<(), HostError>;
}

pub struct GitCliHost {
    remote_base: String,
    owner: String,
    scratch_dir: PathBuf,
}

impl GitCliHost {
    /// `scratch_dir` holds the temporary clones used to push traces.
    pub fn new(remote_base: impl Into<String>, owner: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote_base: remote_base.into(),
            owner: owner.into(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn remote_url(&self, repo_id: &str) -> String {
        let base = self.remote_base.trim_end_matches('/');
        if self.owner.is_empty() {
            format!("{}/{}.git", base, repo_id)
        } else {
            format!("{}/{}/{}.git", base, self.owner, repo_id)
        }
    }

    fn release_repo(&self, repo_id: &str) -> String {
        if self.owner.is_empty() {
            repo_id.to_string()
        } else {
            format!("{}/{}", self.owner, repo_id)
        }
    }

    async fn checkout_traces_branch(&self, url: &str, dir: &Path) -> Result<(), HostError> {
        let dir_arg = dir.to_string_lossy();
        let existing = run(
            "git",
            &["clone", "--depth", "1", "--branch", TRACES_BRANCH, url, &dir_arg],
            None,
        )
        .await;
        if existing.is_ok() {
            return Ok(());
        }

        debug!(url, "No traces branch yet, creating it");
        run("git", &["clone", "--depth", "1", url, &dir_arg], None).await?;
        run("git", &["checkout", "--orphan", TRACES_BRANCH], Some(dir)).await?;
        // Fails on an empty repository; nothing to remove then.
        let _ = run("git", &["rm", "-rf", "--quiet", "."], Some(dir)).await;
        Ok(())
    }
}

#[async_trait]
impl RepositoryHost for GitCliHost {
    #[instrument(skip(self, dir), fields(dir = %dir.display()))]
    async fn clone_repo(&self, repo_id: &str, dir: &Path) -> Result<(), HostError> {
        let url = self.remote_url(repo_id);
        run("git", &["clone", "--depth", "1", &url, &dir.to_string_lossy()], None).await?;
        info!("Repository cloned");
        Ok(())
    }

    #[instrument(skip(self, local_path, message))]
    async fn upload_file(
        &self,
        repo_id: &str,
        local_path: &Path,
        remote_path: &str,
        message: &str,
    ) -> Result<(), HostError> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|source| HostError::Io {
                path: self.scratch_dir.clone(),
                source,
            })?;
        let scratch = tempfile::tempdir_in(&self.scratch_dir).map_err(|source| HostError::Io {
            path: self.scratch_dir.clone(),
            source,
        })?;
        let dir = scratch.path().join("repo");
        let url = self.remote_url(repo_id);
        self.checkout_traces_branch(&url, &dir).await?;

        let target = dir.join(remote_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| HostError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        tokio::fs::copy(local_path, &target).await.map_err(|source| HostError::Io {
            path: local_path.to_path_buf(),
            source,
        })?;

        run("git", &["add", remote_path], Some(&dir)).await?;
        let mut commit: Vec<&str> = COMMIT_AUTHOR.to_vec();
        commit.extend(["commit", "--quiet", "-m", message]);
        run("git", &commit, Some(&dir)).await?;
        run("git", &["push", "--quiet", "origin", TRACES_BRANCH], Some(&dir)).await?;
        info!(remote_path, "Trace uploaded");
        Ok(())
    }

    #[instrument(skip(self, body))]
    async fn create_release(&self, repo_id: &str, tag: &str, name: &str, body: &str) -> Result<(), HostError> {
        let repo = self.release_repo(repo_id);
        run(
            "gh",
            &["release", "create", tag, "--repo", &repo, "--title", name, "--notes", body],
            None,
        )
        .await?;
        info!("Release created");
        Ok(())
    }
}

/// Runs a command to completion, returning stdout or the stderr of a failure.
async fn run(program: &str, args: &[&str], cwd: Option<&Path>) -> Result<String, HostError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.output().await.map_err(|source| HostError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(HostError::Command {
            command: format!("{} {}", program, args.first().copied().unwrap_or_default()),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

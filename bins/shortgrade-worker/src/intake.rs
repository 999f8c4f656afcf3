/// Submission Intake Queue
///
/// **Core Responsibility:**
/// Accept "please grade" events, filter and deduplicate them, and feed the
/// orchestrator through a bounded worker pool.
///
/// **Model:**
/// - One FIFO channel, one long-lived drain task (no re-entrant drains)
/// - A semaphore with N permits caps simultaneous gradings
/// - An entry leaves the queue when it gets a permit, not when grading ends
/// - The permit is released when the grading task ends, panics included
/// - Shutdown waits until every permit is back
/// - A repository already waiting in the queue is not queued twice

use crate::config::ModuleConfigManager;
use crate::orchestrator::{GradingError, Orchestrator};
use async_trait::async_trait;
use shortgrade_common::config::Config;
use shortgrade_common::types::{parse_repo_id, PushEvent};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why an event was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidRepository,
    NotMainBranch,
    AdminPush,
    NoTrigger,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::InvalidRepository => "repository name is not a valid <participant>-<NN> id",
            Rejection::NotMainBranch => "push does not target the main branch",
            Rejection::AdminPush => "push made by the administrative account",
            Rejection::NoTrigger => "commit message is not the trigger keyword",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub main_ref: String,
    pub admin: String,
    pub keyword: String,
}

impl AdmissionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            main_ref: config.main_branch_ref.clone(),
            admin: config.admin_account.clone(),
            keyword: config.trigger_keyword.clone(),
        }
    }

    pub fn admit(&self, event: &PushEvent) -> Result<(), Rejection> {
        if parse_repo_id(&event.repository.name).is_none() {
            return Err(Rejection::InvalidRepository);
        }
        if event.git_ref != self.main_ref {
            return Err(Rejection::NotMainBranch);
        }
        if !self.admin.is_empty() && event.pusher.name == self.admin {
            return Err(Rejection::AdminPush);
        }
        let message = event.head_commit.as_ref().map(|c| c.message.trim()).unwrap_or_default();
        if !message.eq_ignore_ascii_case(&self.keyword) {
            return Err(Rejection::NoTrigger);
        }
        Ok(())
    }
}

/// Work run for each dequeued repository.
#[async_trait]
pub trait GradingJob: Send + Sync {
    async fn run(&self, repo_id: &str) -> anyhow::Result<()>;
}

/// Resolves the module from the repository id, then grades it.
pub struct ModuleGradingJob {
    catalog: Arc<ModuleConfigManager>,
    orchestrator: Arc<Orchestrator>,
}

impl ModuleGradingJob {
    pub fn new(catalog: Arc<ModuleConfigManager>, orchestrator: Arc<Orchestrator>) -> Self {
        Self { catalog, orchestrator }
    }
}

#[async_trait]
impl GradingJob for ModuleGradingJob {
    async fn run(&self, repo_id: &str) -> anyhow::Result<()> {
        let module = self.catalog.resolve(repo_id)?;
        match self.orchestrator.grade_module(module, repo_id).await {
            Ok(outcome) => {
                info!(
                    repo = repo_id,
                    module_id = module.id,
                    passed = outcome.passed,
                    score = outcome.score,
                    "Grading finished"
                );
                Ok(())
            }
            Err(GradingError::EarlyGrading { remaining }) => {
                info!(repo = repo_id, remaining_secs = remaining.as_secs(), "Grading requested too early");
                Ok(())
            }
            Err(e @ GradingError::ModuleLocked { .. }) => {
                info!(repo = repo_id, reason = %e, "Grading refused");
                Ok(())
            }
            Err(GradingError::Cancelled) => {
                warn!(repo = repo_id, "Grading cancelled by shutdown");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct IntakeQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Arc<Mutex<HashSet<String>>>,
    drain: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IntakeQueue {
    /// Spawns the drain task. Must be called from within a Tokio runtime.
    pub fn start(job: Arc<dyn GradingJob>, max_concurrent: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let drain = tokio::spawn(drain(receiver, Arc::clone(&pending), job, max_concurrent.max(1)));
        info!(max_concurrent, "Intake queue started");

        Self {
            sender: Mutex::new(Some(sender)),
            pending,
            drain: tokio::sync::Mutex::new(Some(drain)),
        }
    }

    /// Queues `repo_id`. Returns false if it is already waiting or the queue is closed.
    pub fn submit(&self, repo_id: &str) -> bool {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            warn!(repo = repo_id, "Intake queue closed, submission dropped");
            return false;
        };

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !pending.insert(repo_id.to_string()) {
            debug!(repo = repo_id, "Already queued");
            return false;
        }
        if sender.send(repo_id.to_string()).is_err() {
            pending.remove(repo_id);
            return false;
        }
        info!(repo = repo_id, queued = pending.len(), "Submission queued");
        true
    }

    /// Entries still waiting for a worker slot.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stops accepting submissions; queued entries are still drained.
    pub fn close(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Closes the queue and waits for every queued and running grading.
    pub async fn shutdown(&self) {
        self.close();
        if let Some(handle) = self.drain.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Drain task failed");
            }
        }
    }
}

async fn drain(
    mut receiver: mpsc::UnboundedReceiver<String>,
    pending: Arc<Mutex<HashSet<String>>>,
    job: Arc<dyn GradingJob>,
    max_concurrent: usize,
) {
    let slots = Arc::new(Semaphore::new(max_concurrent));

    while let Some(repo_id) = receiver.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&repo_id);

        let job = Arc::clone(&job);
        tokio::spawn(async move {
            let _permit = permit;
            debug!(repo = %repo_id, "Grading slot acquired");
            let grading = {
                let repo_id = repo_id.clone();
                tokio::spawn(async move { job.run(&repo_id).await })
            };
            match grading.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(repo = %repo_id, error = %format!("{:#}", e), "Grading failed"),
                Err(e) => error!(repo = %repo_id, error = %e, "Grading task panicked"),
            }
        });
    }

    // Every slot back means every grading has finished.
    let all = u32::try_from(max_concurrent).unwrap_or(u32::MAX);
    if slots.acquire_many(all).await.is_err() {
        warn!("Worker pool closed while draining");
    }
    info!("Intake queue drained");
}

/// Grading Orchestrator
///
/// **Core Responsibility:**
/// Grade every exercise of one module for one submission and advance the
/// submission's retry/backoff state.
///
/// **State machine per submission:**
/// `Idle -> Gated -> Running -> {Graded, Rejected(early), Cancelled}`
///
/// **Run:**
/// 1. Start-time, progression and backoff gates (rejection mutates nothing)
/// 2. One checkout, one grading task per exercise
/// 3. Results reassembled in declaration order, whatever the completion order
/// 4. A cancelled exercise abandons the run with no state change
/// 5. Scoring, backoff update, participant progress, persistence
/// 6. Trace + verdict handed to the repository host (failures only logged)
///
/// Runs for the same repository are serialized; different repositories run
/// independently.

use crate::evaluator::{self, ModuleScore};
use crate::grader::ExerciseGrader;
use crate::hosting::{HostError, RepositoryHost};
use crate::store::{StoreError, SubmissionStore};
use chrono::{DateTime, Utc};
use shortgrade_common::types::{
    parse_repo_id, ErrorKind, ExerciseResult, GradingOutcome, Module, Participant, Submission,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn, Instrument};

#[derive(Debug, Error)]
pub enum GradingError {
    #[error("early grading: retry in {}s", .remaining.as_secs())]
    EarlyGrading { remaining: Duration },
    #[error("module {module_id} is locked: pass module {current} first")]
    ModuleLocked { module_id: u32, current: u32 },
    #[error("grading cancelled")]
    Cancelled,
    #[error("invalid repository id '{0}'")]
    InvalidRepository(String),
    #[error("submission store failure: {0}")]
    Store(#[from] StoreError),
    #[error("could not check out submission: {0}")]
    Checkout(#[source] HostError),
    #[error("could not prepare '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GradingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GradingError::EarlyGrading { .. } | GradingError::ModuleLocked { .. } => ErrorKind::EarlyGrading,
            GradingError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::InternalError,
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn SubmissionStore>,
    host: Arc<dyn RepositoryHost>,
    grader: Arc<ExerciseGrader>,
    workdir: PathBuf,
    /// Skips the backoff gate.
    dev_mode: bool,
    output_limit: usize,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        host: Arc<dyn RepositoryHost>,
        grader: Arc<ExerciseGrader>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            host,
            grader,
            workdir: workdir.into(),
            dev_mode: false,
            output_limit: 64 * 1024,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    pub async fn grade_module(&self, module: &Module, repo_id: &str) -> Result<GradingOutcome, GradingError> {
        self.grade_module_at(module, repo_id, Utc::now).await
    }

    /// `clock` is read once the per-repository lock is held.
    #[instrument(skip(self, module, clock), fields(module_id = module.id))]
    pub async fn grade_module_at<C>(
        &self,
        module: &Module,
        repo_id: &str,
        clock: C,
    ) -> Result<GradingOutcome, GradingError>
    where
        C: Fn() -> DateTime<Utc> + Send + Sync,
    {
        let lock = self.repo_lock(repo_id);
        let result = {
            let _guard = lock.lock().await;
            self.run(module, repo_id, clock()).await
        };
        drop(lock);
        self.release_repo_lock(repo_id);
        result
    }

    fn repo_lock(&self, repo_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(repo_id.to_string()).or_default().clone()
    }

    /// Drops the lock entry once nobody else holds or waits on it.
    fn release_repo_lock(&self, repo_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(repo_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(repo_id);
        }
    }

    async fn run(&self, module: &Module, repo_id: &str, now: DateTime<Utc>) -> Result<GradingOutcome, GradingError> {
        if now < module.start_time {
            let remaining = (module.start_time - now).to_std().unwrap_or_default();
            info!(repo = repo_id, "Module has not started yet");
            return Err(GradingError::EarlyGrading { remaining });
        }

        let Some((login, _)) = parse_repo_id(repo_id) else {
            warn!(repo = repo_id, "Refusing to grade invalid repository id");
            return Err(GradingError::InvalidRepository(repo_id.to_string()));
        };
        let mut participant = self
            .store
            .get_participant(login)
            .await?
            .unwrap_or_else(|| Participant::new(login));
        if !participant.has_unlocked(module.id) {
            info!(repo = repo_id, current = participant.current_module_id, "Module not unlocked yet");
            return Err(GradingError::ModuleLocked {
                module_id: module.id,
                current: participant.current_module_id,
            });
        }

        let mut submission = self
            .store
            .get(module.id, repo_id)
            .await?
            .unwrap_or_else(|| Submission::new(module.id, repo_id));

        if !self.dev_mode {
            if let Some(remaining) = submission.remaining_wait(now) {
                info!(repo = repo_id, remaining_secs = remaining.as_secs(), "Grading rejected by backoff");
                return Err(GradingError::EarlyGrading { remaining });
            }
        }

        let checkout = self.workdir.join(format!("{}-{}", repo_id, uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&self.workdir).await.map_err(|source| GradingError::Io {
            path: self.workdir.clone(),
            source,
        })?;
        if let Err(e) = self.host.clone_repo(repo_id, &checkout).await {
            remove_dir(&checkout).await;
            return Err(GradingError::Checkout(e));
        }

        let results = self.run_exercises(module, &checkout).await;
        remove_dir(&checkout).await;

        if results.iter().any(|r| r.error_kind == ErrorKind::Cancelled) {
            warn!(repo = repo_id, "Grading cancelled, submission state left untouched");
            return Err(GradingError::Cancelled);
        }

        let score = evaluator::calculate_score(&results);
        let passed = score.passes(module);
        let trace = evaluator::build_trace(module, &results, score, self.output_limit);
        info!(
            repo = repo_id,
            score = score.total,
            max_score = score.max,
            passed,
            "Module graded"
        );

        submission.record_attempt(now, score.total);
        self.store.update(&submission).await?;
        if passed && participant.current_module_id <= module.id {
            participant.record_pass(module.id);
            self.store.update_participant(&participant).await?;
            info!(repo = repo_id, unlocked = participant.current_module_id, "Next module unlocked");
        }

        let outcome = GradingOutcome {
            module_id: module.id,
            repo_id: repo_id.to_string(),
            passed,
            score: score.total,
            max_score: score.max,
            trace,
            results,
            graded_at: now,
        };
        if let Err(e) = self.store.record_outcome(&outcome).await {
            warn!(repo = repo_id, error = %e, "Failed to persist grading outcome");
        }

        self.report(&outcome, &submission, score).await;
        Ok(outcome)
    }

    /// One task per exercise; results come back tagged with their index.
    async fn run_exercises(&self, module: &Module, checkout: &Path) -> Vec<ExerciseResult> {
        let count = module.exercises.len();
        let (tx, mut rx) = mpsc::channel(count);

        let mut handles = Vec::with_capacity(count);
        for (index, exercise) in module.exercises.iter().cloned().enumerate() {
            let tx = tx.clone();
            let grader = Arc::clone(&self.grader);
            let checkout = checkout.to_path_buf();
            let module_id = module.id;
            let task = async move {
                let result = grader.grade(module_id, index, &exercise, &checkout).await;
                let _ = tx.send(result).await;
            };
            handles.push((index, tokio::spawn(task.in_current_span())));
        }
        drop(tx);

        for (index, handle) in handles {
            if let Err(e) = handle.await {
                error!(exercise_index = index, error = %e, "Grading task aborted");
            }
        }

        let mut slots: Vec<Option<ExerciseResult>> = vec![None; count];
        while let Some(result) = rx.recv().await {
            if let Some(slot) = slots.get_mut(result.exercise_index) {
                *slot = Some(result);
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    ExerciseResult::failed(
                        index,
                        module.exercises[index].score,
                        ErrorKind::InternalError,
                        "grading task aborted",
                    )
                })
            })
            .collect()
    }

    /// Publishes the trace and the verdict. Failures are logged only.
    async fn report(&self, outcome: &GradingOutcome, submission: &Submission, score: ModuleScore) {
        let repo_id = outcome.repo_id.as_str();
        let trace_path = self.workdir.join(format!(
            "{}-{:02}-trace-{}.txt",
            repo_id, outcome.module_id, submission.attempts
        ));
        if let Err(e) = tokio::fs::write(&trace_path, &outcome.trace).await {
            warn!(repo = repo_id, error = %e, "Failed to write trace file");
            return;
        }

        let remote_path = format!(
            "traces/{:02}-{}.txt",
            outcome.module_id,
            outcome.graded_at.format("%Y%m%d-%H%M%S")
        );
        let message = format!("Grading trace, attempt {}", submission.attempts);
        if let Err(e) = self.host.upload_file(repo_id, &trace_path, &remote_path, &message).await {
            warn!(repo = repo_id, error = %e, "Failed to upload trace");
        }

        let wait = chrono::Duration::from_std(submission.wait_time).unwrap_or_else(|_| chrono::Duration::zero());
        let name = evaluator::release_name(score, outcome.graded_at + wait);
        let tag = format!("grade-{}", submission.attempts);
        if let Err(e) = self.host.create_release(repo_id, &tag, &name, &outcome.trace).await {
            warn!(repo = repo_id, error = %e, "Failed to create release");
        }

        remove_file(&trace_path).await;
    }
}

async fn remove_dir(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove checkout");
        }
    }
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove trace file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::StaticAnalysisGate;
    use crate::engine::{Sandbox, SandboxError, SandboxRequest, SandboxRun};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use shortgrade_common::types::Exercise;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Exit code and delay per exercise index, read from the EXERCISE env var.
    /// A negative exit code stands for a run cancelled by the emergency stop.
    struct ScriptedSandbox {
        script: Vec<(i64, u64)>,
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        async fn run(&self, request: SandboxRequest) -> Result<SandboxRun, SandboxError> {
            let index: usize = request
                .env
                .iter()
                .find_map(|v| v.strip_prefix("EXERCISE="))
                .and_then(|v| v.parse().ok())
                .unwrap();
            let (exit_code, delay_ms) = self.script[index];
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if exit_code < 0 {
                return Err(SandboxError::Cancelled);
            }
            Ok(SandboxRun {
                exit_code,
                output: format!("output of exercise {}", index),
                timed_out: false,
                elapsed: Duration::from_millis(delay_ms),
            })
        }
    }

    #[derive(Default)]
    struct FakeHost {
        fail_clone: bool,
        clones: AtomicUsize,
        uploads: Mutex<Vec<(String, String)>>,
        releases: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl RepositoryHost for FakeHost {
        async fn clone_repo(&self, _repo_id: &str, dir: &Path) -> Result<(), HostError> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            if self.fail_clone {
                return Err(HostError::Command {
                    command: "git clone".to_string(),
                    status: 128,
                    stderr: "repository not found".to_string(),
                });
            }
            for index in 0..3 {
                let exercise_dir = dir.join(format!("ex{:02}", index));
                std::fs::create_dir_all(&exercise_dir).unwrap();
                std::fs::write(exercise_dir.join("main.rs"), "fn main() {}").unwrap();
            }
            Ok(())
        }

        async fn upload_file(
            &self,
            _repo_id: &str,
            local_path: &Path,
            remote_path: &str,
            _message: &str,
        ) -> Result<(), HostError> {
            let content = std::fs::read_to_string(local_path).unwrap();
            self.uploads.lock().unwrap().push((remote_path.to_string(), content));
            Ok(())
        }

        async fn create_release(&self, _repo_id: &str, tag: &str, name: &str, body: &str) -> Result<(), HostError> {
            self.releases
                .lock()
                .unwrap()
                .push((tag.to_string(), name.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn module(minimum: i64) -> Module {
        module_with_id(0, minimum)
    }

    fn module_with_id(id: u32, minimum: i64) -> Module {
        let exercises = (0..3)
            .map(|i| {
                let name = format!("ex{:02}", i);
                Exercise::new(name.clone(), "/tests/t", 10, vec!["main.rs".into()], name).unwrap()
            })
            .collect();
        Module::new(id, exercises, minimum, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        host: Arc<FakeHost>,
        _workdir: tempfile::TempDir,
    }

    fn fixture(script: Vec<(i64, u64)>, host: FakeHost) -> Fixture {
        let workdir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(host);
        let grader = Arc::new(ExerciseGrader::new(
            StaticAnalysisGate::default(),
            Arc::new(ScriptedSandbox { script }),
        ));
        let orchestrator = Orchestrator::new(store.clone(), host.clone(), grader, workdir.path());
        Fixture {
            orchestrator,
            store,
            host,
            _workdir: workdir,
        }
    }

    #[tokio::test]
    async fn test_results_keep_declaration_order() {
        // Exercise 0 finishes last.
        let f = fixture(vec![(0, 60), (0, 20), (1, 0)], FakeHost::default());
        let outcome = f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.unwrap();

        let indices: Vec<usize> = outcome.results.iter().map(|r| r.exercise_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(outcome.score, 20);
        assert_eq!(outcome.max_score, 30);
        assert!(outcome.passed);
        assert_eq!(outcome.results[2].error_kind, ErrorKind::RuntimeError);
    }

    #[tokio::test]
    async fn test_failure_first_scores_zero() {
        let f = fixture(vec![(1, 0), (0, 0), (0, 0)], FakeHost::default());
        let outcome = f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.unwrap();
        assert_eq!(outcome.score, 0);
        assert!(!outcome.passed);
        assert!(outcome.trace.contains("=====Trace for Exercise 00====="));
        assert!(outcome.trace.contains("output of exercise 0"));
    }

    #[tokio::test]
    async fn test_backoff_rejects_without_mutation() {
        let f = fixture(vec![(0, 0); 3], FakeHost::default());
        let mut submission = Submission::new(0, "alice-00");
        submission.attempts = 1;
        submission.last_graded = Some(now() - chrono::Duration::seconds(30));
        submission.wait_time = Duration::from_secs(60);
        f.store.update(&submission).await.unwrap();

        let err = f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.unwrap_err();
        assert!(matches!(err, GradingError::EarlyGrading { remaining } if remaining == Duration::from_secs(30)));
        assert_eq!(err.kind(), ErrorKind::EarlyGrading);
        assert_eq!(f.store.get(0, "alice-00").await.unwrap(), Some(submission));
        assert_eq!(f.host.clones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dev_mode_bypasses_backoff() {
        let mut f = fixture(vec![(0, 0); 3], FakeHost::default());
        f.orchestrator = f.orchestrator.with_dev_mode(true);
        let mut submission = Submission::new(0, "alice-00");
        submission.last_graded = Some(now());
        submission.wait_time = Duration::from_secs(3600);
        f.store.update(&submission).await.unwrap();

        assert!(f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.is_ok());
    }

    #[tokio::test]
    async fn test_module_not_started() {
        let f = fixture(vec![(0, 0); 3], FakeHost::default());
        let mut late = module(20);
        late.start_time = now() + chrono::Duration::hours(1);

        let err = f.orchestrator.grade_module_at(&late, "alice-00", now).await.unwrap_err();
        assert!(matches!(err, GradingError::EarlyGrading { remaining } if remaining == Duration::from_secs(3600)));
        assert!(f.store.get(0, "alice-00").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backoff_advances_after_each_run() {
        let f = fixture(vec![(0, 0), (0, 0), (1, 0)], FakeHost::default());
        let m = module(20);

        f.orchestrator.grade_module_at(&m, "alice-00", now).await.unwrap();
        let first = f.store.get(0, "alice-00").await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        assert_eq!(first.wait_time, Duration::from_secs(60));
        assert_eq!(first.last_graded, Some(now()));
        assert_eq!(first.score, 20);

        let later = || now() + chrono::Duration::minutes(5);
        f.orchestrator.grade_module_at(&m, "alice-00", later).await.unwrap();
        let second = f.store.get(0, "alice-00").await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.wait_time, Duration::from_secs(120));
        assert_eq!(f.store.outcomes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_reports_trace_and_release() {
        let f = fixture(vec![(0, 0), (0, 0), (1, 0)], FakeHost::default());
        let outcome = f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.unwrap();

        let uploads = f.host.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "traces/00-20240501-120000.txt");
        assert_eq!(uploads[0].1, outcome.trace);

        let releases = f.host.releases.lock().unwrap();
        assert_eq!(releases[0].0, "grade-1");
        assert_eq!(releases[0].1, "20/30 - retry at 12:01");
    }

    #[tokio::test]
    async fn test_checkout_failure_is_internal() {
        let host = FakeHost {
            fail_clone: true,
            ..Default::default()
        };
        let f = fixture(vec![(0, 0); 3], host);
        let err = f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(f.store.get(0, "alice-00").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_repository_runs_are_serialized() {
        let f = Arc::new(fixture(vec![(0, 50), (0, 50), (0, 50)], FakeHost::default()));
        let m = Arc::new(module(20));

        let runs: Vec<_> = (0..2)
            .map(|_| {
                let f = Arc::clone(&f);
                let m = Arc::clone(&m);
                tokio::spawn(async move { f.orchestrator.grade_module_at(&m, "alice-00", now).await })
            })
            .collect();

        let mut graded = 0;
        let mut rejected = 0;
        for run in runs {
            match run.await.unwrap() {
                Ok(_) => graded += 1,
                Err(GradingError::EarlyGrading { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!((graded, rejected), (1, 1));
        assert_eq!(f.store.get(0, "alice-00").await.unwrap().unwrap().attempts, 1);
        assert!(f.orchestrator.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_no_trace() {
        let f = fixture(vec![(0, 0), (-1, 0), (1, 0)], FakeHost::default());
        let err = f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.unwrap_err();

        assert!(matches!(err, GradingError::Cancelled));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(f.store.get(0, "alice-00").await.unwrap().is_none());
        assert!(f.store.outcomes().await.is_empty());
        assert!(f.host.uploads.lock().unwrap().is_empty());
        assert!(f.host.releases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_module_is_rejected_without_mutation() {
        let f = fixture(vec![(0, 0); 3], FakeHost::default());
        let err = f
            .orchestrator
            .grade_module_at(&module_with_id(1, 20), "alice-01", now)
            .await
            .unwrap_err();

        assert!(matches!(err, GradingError::ModuleLocked { module_id: 1, current: 0 }));
        assert_eq!(err.kind(), ErrorKind::EarlyGrading);
        assert!(f.store.get(1, "alice-01").await.unwrap().is_none());
        assert!(f.store.get_participant("alice").await.unwrap().is_none());
        assert_eq!(f.host.clones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_passing_unlocks_next_module() {
        let f = fixture(vec![(0, 0), (0, 0), (1, 0)], FakeHost::default());
        f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.unwrap();
        assert_eq!(f.store.get_participant("alice").await.unwrap().unwrap().current_module_id, 1);

        let outcome = f
            .orchestrator
            .grade_module_at(&module_with_id(1, 30), "alice-01", now)
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert_eq!(f.store.get_participant("alice").await.unwrap().unwrap().current_module_id, 1);
    }

    #[tokio::test]
    async fn test_failing_keeps_next_module_locked() {
        let f = fixture(vec![(1, 0), (0, 0), (0, 0)], FakeHost::default());
        let outcome = f.orchestrator.grade_module_at(&module(20), "alice-00", now).await.unwrap();
        assert!(!outcome.passed);
        assert!(f.store.get_participant("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_like_repository_is_refused() {
        let f = fixture(vec![(0, 0); 3], FakeHost::default());
        let err = f
            .orchestrator
            .grade_module_at(&module(20), "../../escape/alice-00", now)
            .await
            .unwrap_err();

        assert!(matches!(err, GradingError::InvalidRepository(_)));
        assert_eq!(f.host.clones.load(Ordering::SeqCst), 0);
        let leftovers: Vec<_> = std::fs::read_dir(f._workdir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}

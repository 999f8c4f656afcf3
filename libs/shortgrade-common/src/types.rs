use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Hard cap applied when an exercise does not configure its own timeout.
pub const DEFAULT_EXERCISE_TIMEOUT_SECS: u64 = 300;

/// Largest exponent used for the backoff schedule (2^16 minutes is ~45 days).
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("exercise '{0}': at least one turn-in file pattern is required")]
    NoTurnInFiles(String),
    #[error("exercise '{0}': score cannot be negative")]
    NegativeScore(String),
    #[error("exercise '{0}': executable path cannot be empty")]
    EmptyExecutable(String),
    #[error("exercise '{0}': turn-in directory cannot be empty")]
    EmptyTurnInDirectory(String),
    #[error("module {0}: at least one exercise is required")]
    NoExercises(u32),
    #[error("module {0}: minimum score cannot be negative")]
    NegativeMinimumScore(u32),
    #[error("module {module}: exercise scores add up to {total}, less than the minimum score {minimum}")]
    UnreachableMinimum { module: u32, total: i64, minimum: i64 },
}

/// Identifiers forbidden through the linter subprocess (clippy `disallowed-*` lints).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisallowedItems {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub macros: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
}

impl DisallowedItems {
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.macros.is_empty() && self.types.is_empty()
    }
}

/// Test source appended to one of the participant's files so both share module scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfTests {
    pub source: PathBuf,
    /// Turn-in file (relative to the turn-in directory) receiving the tests.
    pub target: String,
}

/// Static analysis settings for one exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Construct name -> maximum occurrences. 0 means forbidden.
    #[serde(default)]
    pub permitted_constructs: BTreeMap<String, u32>,
    #[serde(default)]
    pub disallowed: Option<DisallowedItems>,
    #[serde(default)]
    pub inject_lint_directives: bool,
    #[serde(default)]
    pub lint_directives: Vec<String>,
    #[serde(default)]
    pub self_tests: Option<SelfTests>,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
}

fn default_source_extension() -> String {
    "rs".to_string()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            permitted_constructs: BTreeMap::new(),
            disallowed: None,
            inject_lint_directives: false,
            lint_directives: Vec::new(),
            self_tests: None,
            source_extension: default_source_extension(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exercise {
    pub name: String,
    pub turn_in_directory: String,
    pub turn_in_files: Vec<String>,
    pub executable_path: PathBuf,
    pub score: i64,
    pub timeout: Duration,
    pub network: bool,
    pub analysis: AnalysisConfig,
}

impl Exercise {
    pub fn new(
        name: impl Into<String>,
        executable_path: impl Into<PathBuf>,
        score: i64,
        turn_in_files: Vec<String>,
        turn_in_directory: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let executable_path = executable_path.into();
        let turn_in_directory = turn_in_directory.into();

        if turn_in_files.is_empty() {
            return Err(ConfigError::NoTurnInFiles(name));
        }
        if score < 0 {
            return Err(ConfigError::NegativeScore(name));
        }
        if executable_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyExecutable(name));
        }
        if turn_in_directory.is_empty() {
            return Err(ConfigError::EmptyTurnInDirectory(name));
        }

        Ok(Self {
            name,
            turn_in_directory,
            turn_in_files,
            executable_path,
            score,
            timeout: Duration::from_secs(DEFAULT_EXERCISE_TIMEOUT_SECS),
            network: false,
            analysis: AnalysisConfig::default(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    pub fn with_analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.analysis = analysis;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: u32,
    pub exercises: Vec<Exercise>,
    pub minimum_score: i64,
    pub start_time: DateTime<Utc>,
}

impl Module {
    pub fn new(
        id: u32,
        exercises: Vec<Exercise>,
        minimum_score: i64,
        start_time: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        if exercises.is_empty() {
            return Err(ConfigError::NoExercises(id));
        }
        if minimum_score < 0 {
            return Err(ConfigError::NegativeMinimumScore(id));
        }
        let total = exercises.iter().map(|e| e.score).sum::<i64>();
        if total < minimum_score {
            return Err(ConfigError::UnreachableMinimum {
                module: id,
                total,
                minimum: minimum_score,
            });
        }

        Ok(Self {
            id,
            exercises,
            minimum_score,
            start_time,
        })
    }

    pub fn max_score(&self) -> i64 {
        self.exercises.iter().map(|e| e.score).sum()
    }
}

/// Per participant x module grading state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub module_id: u32,
    pub repo_id: String,
    pub attempts: u32,
    pub last_graded: Option<DateTime<Utc>>,
    pub wait_time: Duration,
    pub score: i64,
}

impl Submission {
    pub fn new(module_id: u32, repo_id: impl Into<String>) -> Self {
        Self {
            module_id,
            repo_id: repo_id.into(),
            attempts: 0,
            last_graded: None,
            wait_time: Duration::ZERO,
            score: 0,
        }
    }

    /// Time left before another grading attempt is allowed, if any.
    pub fn remaining_wait(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_graded?;
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        self.wait_time.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Advances the backoff schedule after a completed run: 1, 2, 4, 8... minutes.
    pub fn record_attempt(&mut self, now: DateTime<Utc>, score: i64) {
        let exponent = self.attempts.min(MAX_BACKOFF_EXPONENT);
        self.wait_time = Duration::from_secs(60 * (1u64 << exponent));
        self.attempts += 1;
        self.last_graded = Some(now);
        self.score = self.score.max(score);
    }
}

/// Splits a repository id `<participant>-<NN>` into its participant and
/// module id.
///
/// Only ASCII letters, digits, `.`, `_` and `-` are accepted, `..` never is,
/// and the participant cannot start with `.` or `-`. Ids are used as path
/// components and remote names, so anything else is rejected.
pub fn parse_repo_id(repo_id: &str) -> Option<(&str, u32)> {
    let (participant, suffix) = repo_id.rsplit_once('-')?;
    let valid_char = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-');
    if participant.is_empty()
        || participant.starts_with(['.', '-'])
        || participant.contains("..")
        || !participant.bytes().all(valid_char)
    {
        return None;
    }
    if suffix.len() != 2 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((participant, suffix.parse().ok()?))
}

/// How far a participant has progressed through the modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub login: String,
    /// Highest module the participant may be graded on.
    pub current_module_id: u32,
}

impl Participant {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            current_module_id: 0,
        }
    }

    pub fn has_unlocked(&self, module_id: u32) -> bool {
        module_id <= self.current_module_id
    }

    /// Unlocks the module after `module_id`. Passing an earlier module again changes nothing.
    pub fn record_pass(&mut self, module_id: u32) {
        self.current_module_id = self.current_module_id.max(module_id.saturating_add(1));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Passed,
    NothingTurnedIn,
    InvalidFiles,
    CompilationError,
    RuntimeError,
    Timeout,
    EarlyGrading,
    /// The run was stopped by the host (shutdown), not by the program.
    Cancelled,
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Passed => "OK",
            ErrorKind::NothingTurnedIn => "Nothing turned in",
            ErrorKind::InvalidFiles => "Invalid files",
            ErrorKind::CompilationError => "Compilation error",
            ErrorKind::RuntimeError => "Runtime error",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::EarlyGrading => "Early grading",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::InternalError => "Internal error",
        };
        f.write_str(label)
    }
}

/// Outcome of one exercise within one grading attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseResult {
    pub exercise_index: usize,
    pub passed: bool,
    /// Points awarded (0 unless passed).
    pub score: i64,
    /// Full point value of the exercise.
    pub max_score: i64,
    pub error_kind: ErrorKind,
    pub output: String,
}

impl ExerciseResult {
    pub fn passed(exercise_index: usize, max_score: i64, output: String) -> Self {
        Self {
            exercise_index,
            passed: true,
            score: max_score,
            max_score,
            error_kind: ErrorKind::Passed,
            output,
        }
    }

    pub fn failed(
        exercise_index: usize,
        max_score: i64,
        error_kind: ErrorKind,
        output: impl Into<String>,
    ) -> Self {
        Self {
            exercise_index,
            passed: false,
            score: 0,
            max_score,
            error_kind,
            output: output.into(),
        }
    }
}

/// Module-level result of a completed grading run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingOutcome {
    pub module_id: u32,
    pub repo_id: String,
    pub passed: bool,
    pub score: i64,
    pub max_score: i64,
    pub trace: String,
    pub results: Vec<ExerciseResult>,
    pub graded_at: DateTime<Utc>,
}

/// Push event delivered by the repository host webhook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: RepositoryInfo,
    pub pusher: PusherInfo,
    #[serde(default)]
    pub head_commit: Option<CommitInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PusherInfo {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitInfo {
    pub message: String,
}

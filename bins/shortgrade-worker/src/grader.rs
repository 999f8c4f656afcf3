/// Exercise Grader - glue between the analysis gate and the sandbox
///
/// **Responsibility:**
/// Grade one exercise of one checkout and produce its `ExerciseResult`.
///
/// **Pipeline:**
/// 1. Turn-in validation (walk the exercise directory, match patterns)
/// 2. Static analysis gate
/// 3. Sandboxed run under the exercise timeout
/// 4. Classification of the run into an `ErrorKind`
///
/// Every failure becomes the exercise's result; nothing here aborts sibling
/// exercises.

use crate::analysis::StaticAnalysisGate;
use crate::engine::{Sandbox, SandboxError, SandboxRequest};
use globset::{GlobBuilder, GlobMatcher};
use shortgrade_common::types::{ErrorKind, Exercise, ExerciseResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Error)]
pub enum TurnInError {
    #[error("nothing turned in: '{}' does not exist", .0.display())]
    NothingTurnedIn(PathBuf),
    #[error("{}", describe_mismatch(.missing, .extra))]
    InvalidFiles { missing: Vec<String>, extra: Vec<String> },
    #[error("invalid turn-in pattern: {0}")]
    Pattern(#[from] globset::Error),
    #[error("could not walk turn-in directory: {0}")]
    Walk(#[from] walkdir::Error),
}

impl TurnInError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnInError::NothingTurnedIn(_) => ErrorKind::NothingTurnedIn,
            TurnInError::InvalidFiles { .. } => ErrorKind::InvalidFiles,
            TurnInError::Pattern(_) | TurnInError::Walk(_) => ErrorKind::InternalError,
        }
    }
}

fn describe_mismatch(missing: &[String], extra: &[String]) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("Missing files: {}", missing.join(", ")));
    }
    if !extra.is_empty() {
        parts.push(format!("Additional files: {}", extra.join(", ")));
    }
    parts.join("; ")
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_str().is_some_and(|name| name.starts_with('.'))
}

/// Checks the turn-in directory against the allowed patterns and returns the
/// submitted files, relative to `dir`, in walk order.
///
/// Hidden files and hidden directories are ignored. Each file counts for the
/// first pattern it matches only, so every pattern needs a file of its own.
pub fn validate_turn_in(dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, TurnInError> {
    if !dir.is_dir() {
        return Err(TurnInError::NothingTurnedIn(dir.to_path_buf()));
    }

    let matchers = patterns
        .iter()
        .map(|p| GlobBuilder::new(p).literal_separator(true).build().map(|g| g.compile_matcher()))
        .collect::<Result<Vec<GlobMatcher>, globset::Error>>()?;
    let mut found = vec![false; matchers.len()];
    let mut files = Vec::new();
    let mut extra = Vec::new();

    let walker = WalkDir::new(dir).min_depth(1).sort_by_file_name().into_iter();
    for entry in walker.filter_entry(|e| !is_hidden(e)) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path()).to_path_buf();

        // A file is claimed by the first pattern it matches.
        match matchers.iter().position(|m| m.is_match(&relative)) {
            Some(index) => {
                found[index] = true;
                files.push(relative);
            }
            None => extra.push(relative.to_string_lossy().into_owned()),
        }
    }

    let missing: Vec<String> = patterns
        .iter()
        .zip(&found)
        .filter(|(_, found)| !**found)
        .map(|(pattern, _)| pattern.clone())
        .collect();

    if !missing.is_empty() || !extra.is_empty() {
        return Err(TurnInError::InvalidFiles { missing, extra });
    }
    Ok(files)
}

pub struct ExerciseGrader {
    gate: StaticAnalysisGate,
    sandbox: Arc<dyn Sandbox>,
}

impl ExerciseGrader {
    pub fn new(gate: StaticAnalysisGate, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { gate, sandbox }
    }

    /// Grades exercise `index` of module `module_id` inside `checkout`.
    #[instrument(skip(self, exercise, checkout), fields(exercise = %exercise.name))]
    pub async fn grade(
        &self,
        module_id: u32,
        index: usize,
        exercise: &Exercise,
        checkout: &Path,
    ) -> ExerciseResult {
        let max = exercise.score;
        let turn_in_dir = checkout.join(&exercise.turn_in_directory);

        let files = match validate_turn_in(&turn_in_dir, &exercise.turn_in_files) {
            Ok(files) => files,
            Err(e) => {
                if e.kind() == ErrorKind::InternalError {
                    error!(error = %e, "Turn-in validation failed");
                }
                return ExerciseResult::failed(index, max, e.kind(), e.to_string());
            }
        };

        if let Err(e) = self.gate.check(exercise, &turn_in_dir, &files).await {
            let kind = e.kind();
            if kind == ErrorKind::InternalError {
                error!(error = %e, "Static analysis could not run");
            } else {
                info!(error = %e, "Static analysis rejected submission");
            }
            return ExerciseResult::failed(index, max, kind, e.to_string());
        }

        let request = SandboxRequest {
            label: format!("{:02}-{}", module_id, exercise.name),
            turn_in_dir,
            executable: exercise.executable_path.clone(),
            env: vec![
                format!("MODULE={:02}", module_id),
                format!("EXERCISE={:02}", index),
            ],
            network: exercise.network,
            timeout: exercise.timeout,
        };

        let run = match self.sandbox.run(request).await {
            Ok(run) => run,
            Err(SandboxError::Cancelled) => {
                warn!("Exercise cancelled");
                return ExerciseResult::failed(index, max, ErrorKind::Cancelled, "grading cancelled");
            }
            Err(e) => {
                error!(error = %e, "Sandbox execution failed");
                return ExerciseResult::failed(index, max, ErrorKind::InternalError, e.to_string());
            }
        };

        if run.timed_out {
            warn!(timeout_ms = exercise.timeout.as_millis() as u64, "Exercise timed out");
            let mut output = run.output;
            output.push_str(&format!("\n[killed after {}s]", exercise.timeout.as_secs()));
            return ExerciseResult::failed(index, max, ErrorKind::Timeout, output);
        }

        if run.exit_code == 0 {
            info!(elapsed_ms = run.elapsed.as_millis() as u64, "Exercise passed");
            ExerciseResult::passed(index, max, run.output)
        } else {
            info!(exit_code = run.exit_code, "Exercise failed");
            let mut output = run.output;
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&format!("[exit code {}]", run.exit_code));
            ExerciseResult::failed(index, max, ErrorKind::RuntimeError, output)
        }
    }
}

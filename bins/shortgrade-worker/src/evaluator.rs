/// Module Evaluator - Scoring Policy and Participant Trace
///
/// **Core Responsibility:**
/// Turn the ordered per-exercise results of one grading run into a module
/// score and the human-readable trace handed to the participant.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about persistence or the repository host
/// - Pure functions: (module, ordered results) -> score / trace
///
/// **Scoring Rules:**
/// - Results are consumed in exercise-declaration order
/// - total = sum of scores of exercises BEFORE the first failure
/// - an exercise after an earlier failure never counts, even if it passed
/// - max = sum of every exercise's full value, whatever the outcome
/// - the module passes iff total >= module.minimum_score
///
/// **Trace Rules:**
/// - one `OK`/`KO` line per exercise
/// - then the full captured output of the FIRST failing exercise only
/// - output is truncated and control characters are escaped
/// - internal errors never leak host detail into the trace

use chrono::{DateTime, Utc};
use shortgrade_common::types::{ErrorKind, ExerciseResult, Module};
use std::fmt::Write;

pub const INTERNAL_ERROR_MESSAGE: &str =
    "An internal error occurred while grading this exercise. Please contact the staff.";

const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleScore {
    pub total: i64,
    pub max: i64,
}

impl ModuleScore {
    pub fn passes(&self, module: &Module) -> bool {
        self.total >= module.minimum_score
    }
}

/// Applies the "stop counting at the first failure" policy.
pub fn calculate_score(results: &[ExerciseResult]) -> ModuleScore {
    let mut total = 0;
    let mut max = 0;
    let mut failed_before = false;

    for result in results {
        max += result.max_score;
        if !result.passed {
            failed_before = true;
        } else if !failed_before {
            total += result.score;
        }
    }

    ModuleScore { total, max }
}

/// Bounds `output` to `limit` bytes (on a char boundary) and escapes control
/// characters other than newline and tab.
pub fn sanitize_output(output: &str, limit: usize) -> String {
    let mut end = output.len().min(limit);
    while !output.is_char_boundary(end) {
        end -= 1;
    }

    let mut sanitized = String::with_capacity(end);
    for c in output[..end].chars() {
        if c.is_control() && c != '\n' && c != '\t' {
            sanitized.extend(c.escape_default());
        } else {
            sanitized.push(c);
        }
    }
    if end < output.len() && !output.ends_with(TRUNCATION_MARKER) {
        sanitized.push_str(TRUNCATION_MARKER);
    }
    sanitized
}

/// Builds the participant-facing trace of one grading run.
pub fn build_trace(
    module: &Module,
    results: &[ExerciseResult],
    score: ModuleScore,
    output_limit: usize,
) -> String {
    let mut trace = String::new();
    let verdict = if score.passes(module) { "passed" } else { "failed" };
    let _ = writeln!(
        trace,
        "Module {:02}: {}/{} (minimum {}) - {}",
        module.id, score.total, score.max, module.minimum_score, verdict
    );
    trace.push('\n');

    for result in results {
        let name = module
            .exercises
            .get(result.exercise_index)
            .map(|e| e.name.as_str())
            .unwrap_or("?");
        if result.passed {
            let _ = writeln!(trace, "Exercise {:02} ({}): OK", result.exercise_index, name);
        } else {
            let _ = writeln!(
                trace,
                "Exercise {:02} ({}): KO - {}",
                result.exercise_index, name, result.error_kind
            );
        }
    }

    if let Some(failure) = results.iter().find(|r| !r.passed) {
        let _ = writeln!(trace, "\n=====Trace for Exercise {:02}=====", failure.exercise_index);
        let body = match failure.error_kind {
            ErrorKind::InternalError => INTERNAL_ERROR_MESSAGE.to_string(),
            _ => sanitize_output(&failure.output, output_limit),
        };
        trace.push_str(&body);
        if !trace.ends_with('\n') {
            trace.push('\n');
        }
    }

    trace
}

/// Release title, e.g. `20/30 - retry at 14:05`.
pub fn release_name(score: ModuleScore, retry_at: DateTime<Utc>) -> String {
    format!("{}/{} - retry at {}", score.total, score.max, retry_at.format("%H:%M"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shortgrade_common::types::Exercise;

    fn module(scores: &[i64], minimum: i64) -> Module {
        let exercises = scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                Exercise::new(format!("ex{:02}", i), "/tests/t", *s, vec!["main.rs".into()], format!("ex{:02}", i))
                    .unwrap()
            })
            .collect();
        Module::new(0, exercises, minimum, Utc::now()).unwrap()
    }

    fn results(outcomes: &[bool], score: i64) -> Vec<ExerciseResult> {
        outcomes
            .iter()
            .enumerate()
            .map(|(i, passed)| {
                if *passed {
                    ExerciseResult::passed(i, score, String::new())
                } else {
                    ExerciseResult::failed(i, score, ErrorKind::RuntimeError, format!("exercise {} crashed", i))
                }
            })
            .collect()
    }

    #[test]
    fn test_score_stops_at_first_failure() {
        let score = calculate_score(&results(&[true, false, true], 10));
        assert_eq!(score, ModuleScore { total: 10, max: 30 });
    }

    #[test]
    fn test_module_passes_at_minimum() {
        let m = module(&[10, 10, 10], 20);
        let score = calculate_score(&results(&[true, true, false], 10));
        assert_eq!(score.total, 20);
        assert!(score.passes(&m));
    }

    #[test]
    fn test_module_fails_when_first_exercise_fails() {
        let m = module(&[10, 10, 10], 20);
        let score = calculate_score(&results(&[false, true, true], 10));
        assert_eq!(score.total, 0);
        assert_eq!(score.max, 30);
        assert!(!score.passes(&m));
    }

    #[test]
    fn test_trace_shows_only_first_failure_output() {
        let m = module(&[10, 10, 10], 20);
        let results = results(&[true, false, false], 10);
        let trace = build_trace(&m, &results, calculate_score(&results), 1024);

        assert!(trace.starts_with("Module 00: 10/30 (minimum 20) - failed\n"));
        assert!(trace.contains("Exercise 00 (ex00): OK\n"));
        assert!(trace.contains("Exercise 01 (ex01): KO - Runtime error\n"));
        assert!(trace.contains("Exercise 02 (ex02): KO - Runtime error\n"));
        assert!(trace.contains("=====Trace for Exercise 01====="));
        assert!(trace.contains("exercise 1 crashed"));
        assert!(!trace.contains("exercise 2 crashed"));
    }

    #[test]
    fn test_trace_hides_internal_error_detail() {
        let m = module(&[10], 0);
        let results = vec![ExerciseResult::failed(
            0,
            10,
            ErrorKind::InternalError,
            "failed to connect to /var/run/docker.sock",
        )];
        let trace = build_trace(&m, &results, calculate_score(&results), 1024);
        assert!(trace.contains(INTERNAL_ERROR_MESSAGE));
        assert!(!trace.contains("docker.sock"));
    }

    #[test]
    fn test_sanitize_escapes_control_characters() {
        assert_eq!(sanitize_output("ok\tline\n\x1b[31mred", 1024), "ok\tline\n\\u{1b}[31mred");
        assert_eq!(sanitize_output("bell\x07", 1024), "bell\\u{7}");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let sanitized = sanitize_output("héllo", 2);
        assert_eq!(sanitized, "h\n[output truncated]");
        assert_eq!(sanitize_output("short", 10), "short");
    }

    #[test]
    fn test_release_name() {
        let retry = Utc.with_ymd_and_hms(2024, 5, 1, 14, 5, 0).unwrap();
        assert_eq!(release_name(ModuleScore { total: 20, max: 30 }, retry), "20/30 - retry at 14:05");
    }
}

/// Static Analysis Gate
///
/// Filters submitted source before it is trusted to run:
/// - counts permitted constructs (keywords, operators) against a budget
/// - optionally runs the linter with a generated disallowed-items config
///
/// Comments, doc comments, string/byte/raw-string literals, char literals and
/// embedded `#[cfg(test)] mod ... { }` blocks never count toward a budget.
///
/// The gate mutates files on disk (directive injection, self-test append), so
/// it must run at most once per exercise per checkout.

use regex::Regex;
use serde::Serialize;
use shortgrade_common::types::{DisallowedItems, ErrorKind, Exercise};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Directives injected ahead of the exercise's own when injection is enabled.
pub const DEFAULT_LINT_DIRECTIVES: [&str; 4] = [
    "#![allow(clippy::doc_lazy_continuation)]",
    "#![allow(dead_code)]",
    "#![allow(clippy::duplicated_attributes)]",
    "#![allow(clippy::explicit_counter_loop)]",
];

const LINTER_CONFIG_FILE: &str = ".clippy.toml";
const LINTER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub construct: String,
    pub excess: u32,
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.construct, v.excess))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("forbidden/limited constructs found (construct: excess): {}", format_violations(.0))]
    Violations(Vec<Violation>),
    #[error("{0}")]
    Linter(String),
    #[error("linter did not finish within {0:?}")]
    LinterTimeout(Duration),
    #[error("could not run linter '{program}': {source}")]
    LinterUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid construct pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("could not serialize linter config: {0}")]
    LinterConfig(#[from] toml::ser::Error),
}

impl GateError {
    /// Violations and linter findings are the participant's fault; everything else is ours.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::Violations(_) | GateError::Linter(_) | GateError::LinterTimeout(_) => {
                ErrorKind::CompilationError
            }
            _ => ErrorKind::InternalError,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> GateError + '_ {
    move |source| GateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Linter invocation, run inside the turn-in directory.
#[derive(Debug, Clone)]
pub struct LinterCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for LinterCommand {
    fn default() -> Self {
        Self {
            program: "cargo".to_string(),
            args: ["clippy", "--", "-D", "warnings"].map(String::from).to_vec(),
        }
    }
}

impl LinterCommand {
    /// Splits a command line such as `cargo clippy -- -D warnings` on whitespace.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticAnalysisGate {
    linter: LinterCommand,
}

impl StaticAnalysisGate {
    pub fn new(linter: LinterCommand) -> Self {
        Self { linter }
    }

    /// Runs every configured check for `exercise` against the files turned in.
    ///
    /// `files` are paths relative to `turn_in_dir`.
    #[instrument(skip(self, exercise, files), fields(exercise = %exercise.name))]
    pub async fn check(
        &self,
        exercise: &Exercise,
        turn_in_dir: &Path,
        files: &[PathBuf],
    ) -> Result<(), GateError> {
        let analysis = &exercise.analysis;
        let sources: Vec<PathBuf> = files
            .iter()
            .filter(|f| f.extension().is_some_and(|ext| ext == analysis.source_extension.as_str()))
            .map(|f| turn_in_dir.join(f))
            .collect();

        if analysis.inject_lint_directives {
            let directives: Vec<String> = DEFAULT_LINT_DIRECTIVES
                .iter()
                .map(|d| d.to_string())
                .chain(analysis.lint_directives.iter().cloned())
                .collect();
            for source in &sources {
                let content = tokio::fs::read_to_string(source).await.map_err(io_error(source))?;
                tokio::fs::write(source, inject_directives(&content, &directives))
                    .await
                    .map_err(io_error(source))?;
            }
            debug!(files = sources.len(), "Injected lint directives");
        }

        if let Some(self_tests) = &analysis.self_tests {
            let target = turn_in_dir.join(&self_tests.target);
            let tests = tokio::fs::read_to_string(&self_tests.source)
                .await
                .map_err(io_error(&self_tests.source))?;
            let mut content = tokio::fs::read_to_string(&target).await.map_err(io_error(&target))?;
            content.push('\n');
            content.push_str(&tests);
            tokio::fs::write(&target, content).await.map_err(io_error(&target))?;
        }

        if !analysis.permitted_constructs.is_empty() {
            let mut buffer = String::new();
            for source in &sources {
                buffer.push_str(&tokio::fs::read_to_string(source).await.map_err(io_error(source))?);
                buffer.push('\n');
            }
            let violations = find_violations(&clean_source(&buffer), &analysis.permitted_constructs)?;
            if !violations.is_empty() {
                info!(violations = %format_violations(&violations), "Construct budget exceeded");
                return Err(GateError::Violations(violations));
            }
        }

        if let Some(disallowed) = analysis.disallowed.as_ref().filter(|d| !d.is_empty()) {
            self.run_linter(disallowed, turn_in_dir).await?;
        }

        Ok(())
    }

    async fn run_linter(&self, disallowed: &DisallowedItems, dir: &Path) -> Result<(), GateError> {
        let config_path = dir.join(LINTER_CONFIG_FILE);
        tokio::fs::write(&config_path, linter_config(disallowed)?)
            .await
            .map_err(io_error(&config_path))?;

        let child = Command::new(&self.linter.program)
            .args(&self.linter.args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GateError::LinterUnavailable {
                program: self.linter.program.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(LINTER_TIMEOUT, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| GateError::LinterUnavailable {
                program: self.linter.program.clone(),
                source,
            })?,
            Err(_) => {
                warn!(dir = %dir.display(), "Linter timed out");
                return Err(GateError::LinterTimeout(LINTER_TIMEOUT));
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(status = ?output.status.code(), "Linter rejected submission");
        Err(GateError::Linter(combined))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct LinterConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    disallowed_methods: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    disallowed_macros: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    disallowed_types: Vec<String>,
}

/// Renders the disallowed items in the linter's native `.clippy.toml` format.
pub fn linter_config(disallowed: &DisallowedItems) -> Result<String, GateError> {
    Ok(toml::to_string(&LinterConfig {
        disallowed_methods: disallowed.methods.clone(),
        disallowed_macros: disallowed.macros.clone(),
        disallowed_types: disallowed.types.clone(),
    })?)
}

/// Inserts `directives` right before the first `#![...]` line of the file
/// header, or at the top.
///
/// The header ends at the first line that is not blank, a `//` comment or a
/// `#!` line, so inner attributes of inline modules are never used.
pub fn inject_directives(content: &str, directives: &[String]) -> String {
    let mut lines: Vec<&str> = content.split('\n').collect();
    let at = lines
        .iter()
        .map(|line| line.trim_start())
        .take_while(|line| line.is_empty() || line.starts_with("//") || line.starts_with("#!"))
        .position(|line| line.starts_with("#!["))
        .unwrap_or(0);
    for (offset, directive) in directives.iter().enumerate() {
        lines.insert(at + offset, directive.as_str());
    }
    lines.join("\n")
}

/// Produces the buffer the keyword count runs on.
pub fn clean_source(source: &str) -> String {
    let code = strip_non_code(source);
    let code = strip_test_modules(&code);
    code.replace("->", " ").replace("=>", " ")
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replaces comments and literals with a single space each.
pub fn strip_non_code(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < len {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let after_ident = i > 0 && is_ident_char(chars[i - 1]);

        let skip_to = match c {
            '/' if next == Some('/') => Some(
                chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map_or(len, |p| i + p),
            ),
            '/' if next == Some('*') => Some(skip_block_comment(&chars, i)),
            '"' => Some(skip_quoted(&chars, i + 1)),
            'b' | 'r' if !after_ident => skip_prefixed_literal(&chars, i),
            '\'' => skip_char_literal(&chars, i),
            _ => None,
        };

        match skip_to {
            Some(end) => {
                out.push(' ');
                i = end;
            }
            None => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn skip_block_comment(chars: &[char], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1).copied()) {
            ('/', Some('*')) => {
                depth += 1;
                i += 2;
            }
            ('*', Some('/')) => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    chars.len()
}

/// `start` is the first character after the opening quote.
fn skip_quoted(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '"' => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Byte strings, byte chars, raw (byte) strings and raw identifiers.
fn skip_prefixed_literal(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start;
    let byte = chars[i] == 'b';
    if byte {
        i += 1;
        match chars.get(i) {
            Some('"') => return Some(skip_quoted(chars, i + 1)),
            Some('\'') => return skip_char_literal(chars, i),
            Some('r') => {}
            _ => return None,
        }
    }
    // chars[i] == 'r'
    i += 1;
    let hashes = chars[i..].iter().take_while(|&&c| c == '#').count();
    i += hashes;
    // `r#match` is an identifier, not the `match` keyword.
    if !byte && hashes == 1 && chars.get(i).is_some_and(|&c| c.is_alphabetic() || c == '_') {
        let name = chars[i..].iter().take_while(|&&c| is_ident_char(c)).count();
        return Some(i + name);
    }
    if chars.get(i) != Some(&'"') {
        return None;
    }
    i += 1;
    while i < chars.len() {
        if chars[i] == '"' && chars[i + 1..].iter().take(hashes).filter(|&&c| c == '#').count() == hashes {
            return Some(i + 1 + hashes);
        }
        i += 1;
    }
    Some(chars.len())
}

/// Returns `None` for lifetimes and labels, which stay in the code.
fn skip_char_literal(chars: &[char], start: usize) -> Option<usize> {
    match chars.get(start + 1) {
        Some('\\') => {
            let mut i = start + 3;
            while i < chars.len() && chars[i] != '\'' {
                i += 1;
            }
            Some((i + 1).min(chars.len()))
        }
        Some(_) if chars.get(start + 2) == Some(&'\'') => Some(start + 3),
        _ => None,
    }
}

/// Removes `#[cfg(test)] mod <name> { ... }` blocks, tracking brace depth so
/// nested braces inside the block keep the whole block together.
///
/// Expects comments and literals to be stripped already.
pub fn strip_test_modules(code: &str) -> String {
    // Infallible: the pattern is a constant.
    let marker = match Regex::new(r"#\[cfg\(test\)\]\s*mod\s+[A-Za-z_][A-Za-z0-9_]*\s*\{") {
        Ok(re) => re,
        Err(_) => return code.to_string(),
    };

    let mut out = String::with_capacity(code.len());
    let mut rest = code;
    while let Some(found) = marker.find(rest) {
        out.push_str(&rest[..found.start()]);
        let body = &rest[found.end()..];
        let mut depth = 1usize;
        let mut end = body.len();
        for (idx, ch) in body.char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = idx + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        out.push(' ');
        rest = &body[end..];
    }
    out.push_str(rest);
    out
}

/// Word-boundary aware pattern: `\b` only on sides that are word characters.
fn construct_pattern(construct: &str) -> String {
    let mut pattern = regex::escape(construct);
    if construct.chars().next().is_some_and(is_ident_char) {
        pattern.insert_str(0, r"\b");
    }
    if construct.chars().last().is_some_and(is_ident_char) {
        pattern.push_str(r"\b");
    }
    pattern
}

/// Counts every budgeted construct in an already cleaned buffer.
///
/// Longer constructs are tried first so `<=` is not also counted as `<`.
pub fn count_constructs(
    cleaned: &str,
    permitted: &BTreeMap<String, u32>,
) -> Result<HashMap<String, u32>, GateError> {
    let mut names: Vec<&str> = permitted.keys().map(String::as_str).filter(|k| !k.is_empty()).collect();
    let mut counts: HashMap<String, u32> = HashMap::new();
    if names.is_empty() {
        return Ok(counts);
    }
    names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

    let alternation = names.iter().map(|n| construct_pattern(n)).collect::<Vec<_>>().join("|");
    let expr = Regex::new(&format!("(?:{})", alternation))?;
    for found in expr.find_iter(cleaned) {
        *counts.entry(found.as_str().to_string()).or_default() += 1;
    }
    Ok(counts)
}

/// Constructs used more often than their budget, sorted by name.
pub fn find_violations(
    cleaned: &str,
    permitted: &BTreeMap<String, u32>,
) -> Result<Vec<Violation>, GateError> {
    let counts = count_constructs(cleaned, permitted)?;
    Ok(permitted
        .iter()
        .filter_map(|(construct, budget)| {
            let used = counts.get(construct).copied().unwrap_or(0);
            (used > *budget).then(|| Violation {
                construct: construct.clone(),
                excess: used - budget,
            })
        })
        .collect())
}

// Process-level settings, read from the environment.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub listen_addr: String,
    pub modules_config: PathBuf,
    pub workdir: PathBuf,
    pub max_concurrent_gradings: usize,
    pub admin_account: String,
    pub trigger_keyword: String,
    pub main_branch_ref: String,
    /// Skips the backoff gate. Never enable in production.
    pub dev_mode: bool,
    pub sandbox_image: String,
    pub sandbox_dockerfile: Option<PathBuf>,
    pub sandbox_log_framing: String,
    pub repo_remote_base: String,
    pub repo_owner: String,
    pub trace_output_limit: usize,
    pub linter_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            modules_config: PathBuf::from("config/modules.json"),
            workdir: PathBuf::from("workdir"),
            max_concurrent_gradings: 3,
            admin_account: String::new(),
            trigger_keyword: "grademe".to_string(),
            main_branch_ref: "refs/heads/main".to_string(),
            dev_mode: false,
            sandbox_image: "shortgrade-testenv:latest".to_string(),
            sandbox_dockerfile: None,
            sandbox_log_framing: "docker".to_string(),
            repo_remote_base: "https://github.com".to_string(),
            repo_owner: String::new(),
            trace_output_limit: 64 * 1024,
            linter_command: "cargo clippy -- -D warnings".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        Self {
            redis_url: string("REDIS_URL", defaults.redis_url),
            listen_addr: string("LISTEN_ADDR", defaults.listen_addr),
            modules_config: lookup("MODULES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.modules_config),
            workdir: lookup("WORKDIR").map(PathBuf::from).unwrap_or(defaults.workdir),
            max_concurrent_gradings: lookup("MAX_CONCURRENT_GRADINGS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_concurrent_gradings),
            admin_account: string("ADMIN_ACCOUNT", defaults.admin_account),
            trigger_keyword: string("TRIGGER_KEYWORD", defaults.trigger_keyword),
            main_branch_ref: string("MAIN_BRANCH_REF", defaults.main_branch_ref),
            dev_mode: lookup("DEV_MODE")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.dev_mode),
            sandbox_image: string("SANDBOX_IMAGE", defaults.sandbox_image),
            sandbox_dockerfile: lookup("SANDBOX_DOCKERFILE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            sandbox_log_framing: string("SANDBOX_LOG_FRAMING", defaults.sandbox_log_framing),
            repo_remote_base: string("REPO_REMOTE_BASE", defaults.repo_remote_base),
            repo_owner: string("REPO_OWNER", defaults.repo_owner),
            trace_output_limit: lookup("TRACE_OUTPUT_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.trace_output_limit),
            linter_command: lookup("LINTER_COMMAND")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.linter_command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.max_concurrent_gradings, 3);
        assert_eq!(config.trigger_keyword, "grademe");
        assert!(!config.dev_mode);
        assert!(config.sandbox_dockerfile.is_none());
        assert_eq!(config.linter_command, "cargo clippy -- -D warnings");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MAX_CONCURRENT_GRADINGS", "8"),
            ("DEV_MODE", "TRUE"),
            ("ADMIN_ACCOUNT", "bot"),
            ("SANDBOX_DOCKERFILE", "testenv/Dockerfile"),
        ]);
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.max_concurrent_gradings, 8);
        assert!(config.dev_mode);
        assert_eq!(config.admin_account, "bot");
        assert_eq!(config.sandbox_dockerfile, Some(PathBuf::from("testenv/Dockerfile")));
    }

    #[test]
    fn test_zero_concurrency_falls_back() {
        let config = Config::from_lookup(|k| (k == "MAX_CONCURRENT_GRADINGS").then(|| "0".to_string()));
        assert_eq!(config.max_concurrent_gradings, 3);
    }
}

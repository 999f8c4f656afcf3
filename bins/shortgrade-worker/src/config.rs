// Module catalog management for the grading worker
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};
use shortgrade_common::types::{
    parse_repo_id, AnalysisConfig, Exercise, Module, DEFAULT_EXERCISE_TIMEOUT_SECS,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseDefinition {
    pub name: String,
    pub turn_in_directory: String,
    pub turn_in_files: Vec<String>,
    pub executable_path: PathBuf,
    pub score: i64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_EXERCISE_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub id: u32,
    pub minimum_score: i64,
    pub start_time: DateTime<Utc>,
    pub exercises: Vec<ExerciseDefinition>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModulesJson {
    modules: Vec<ModuleDefinition>,
}

/// Validated, immutable module catalog.
#[derive(Debug, Clone)]
pub struct ModuleConfigManager {
    modules: BTreeMap<u32, Module>,
}

impl ModuleConfigManager {
    /// Load module definitions from modules.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Module config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid module config {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let modules_json: ModulesJson =
            serde_json::from_str(content).context("Failed to parse module definitions")?;

        let mut modules = BTreeMap::new();
        for definition in modules_json.modules {
            let module = build_module(definition)?;
            if modules.contains_key(&module.id) {
                bail!("Module {} is defined more than once", module.id);
            }
            modules.insert(module.id, module);
        }

        Ok(Self { modules })
    }

    pub fn get(&self, module_id: u32) -> Result<&Module> {
        self.modules
            .get(&module_id)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for module: {:02}", module_id))
    }

    /// Resolves the module a repository belongs to from its `-NN` suffix.
    pub fn resolve(&self, repo_id: &str) -> Result<&Module> {
        let module_id = module_id_from_repo(repo_id)
            .ok_or_else(|| anyhow::anyhow!("Repository '{}' does not name a module", repo_id))?;
        self.get(module_id)
    }

    pub fn module_ids(&self) -> Vec<u32> {
        self.modules.keys().copied().collect()
    }
}

fn build_module(definition: ModuleDefinition) -> Result<Module> {
    let module_id = definition.id;
    let exercises = definition
        .exercises
        .into_iter()
        .map(build_exercise)
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Module {:02}", module_id))?;

    Ok(Module::new(
        module_id,
        exercises,
        definition.minimum_score,
        definition.start_time,
    )?)
}

fn build_exercise(definition: ExerciseDefinition) -> Result<Exercise> {
    for pattern in &definition.turn_in_files {
        Glob::new(pattern).with_context(|| {
            format!("Exercise '{}': invalid turn-in pattern '{}'", definition.name, pattern)
        })?;
    }
    if definition.timeout_secs == 0 {
        bail!("Exercise '{}': timeout must be positive", definition.name);
    }

    let exercise = Exercise::new(
        definition.name,
        definition.executable_path,
        definition.score,
        definition.turn_in_files,
        definition.turn_in_directory,
    )?
    .with_timeout(Duration::from_secs(definition.timeout_secs))
    .with_network(definition.network)
    .with_analysis(definition.analysis);

    Ok(exercise)
}

/// `alice-03` -> 3. Ids that are not plain `<participant>-<NN>` names resolve to nothing.
pub fn module_id_from_repo(repo_id: &str) -> Option<u32> {
    parse_repo_id(repo_id).map(|(_, module_id)| module_id)
}

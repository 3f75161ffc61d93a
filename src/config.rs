//! Engine configuration for conveyor.
//!
//! Defaults live in code; a project-level `conveyor.toml` (or a user-level
//! `~/.config/conveyor/config.toml`) overrides them. CLI flags win over both.
//!
//! # Configuration File Format
//!
//! ```toml
//! [executor]
//! command = "claude"
//! model_light = "haiku"
//! model_standard = "sonnet"
//! model_advanced = "opus"
//!
//! [limits]
//! stage_timeout_secs = 3600
//! max_quality_iterations = 5
//! max_test_iterations = 5
//! max_pr_review_iterations = 5
//! task_attempt_cap = 3
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::tier::Tier;

pub const DEFAULT_EXECUTOR_CMD: &str = "claude";
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_MAX_QUALITY_ITERATIONS: u32 = 5;
pub const DEFAULT_MAX_TEST_ITERATIONS: u32 = 5;
pub const DEFAULT_MAX_PR_REVIEW_ITERATIONS: u32 = 5;
pub const DEFAULT_TASK_ATTEMPT_CAP: u32 = 3;

/// How to invoke the external task executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorProfile {
    /// Executor CLI command (default: "claude")
    #[serde(default = "default_executor_cmd")]
    pub command: String,
    /// Arguments passed on every invocation, ahead of the model flag
    #[serde(default = "default_base_args")]
    pub base_args: Vec<String>,
    /// Model argument per execution tier
    #[serde(default = "default_model_light")]
    pub model_light: String,
    #[serde(default = "default_model_standard")]
    pub model_standard: String,
    #[serde(default = "default_model_advanced")]
    pub model_advanced: String,
}

fn default_executor_cmd() -> String {
    DEFAULT_EXECUTOR_CMD.to_string()
}

fn default_base_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ]
}

fn default_model_light() -> String {
    "haiku".to_string()
}

fn default_model_standard() -> String {
    "sonnet".to_string()
}

fn default_model_advanced() -> String {
    "opus".to_string()
}

impl Default for ExecutorProfile {
    fn default() -> Self {
        Self {
            command: default_executor_cmd(),
            base_args: default_base_args(),
            model_light: default_model_light(),
            model_standard: default_model_standard(),
            model_advanced: default_model_advanced(),
        }
    }
}

impl ExecutorProfile {
    pub fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Light => &self.model_light,
            Tier::Standard => &self.model_standard,
            Tier::Advanced => &self.model_advanced,
        }
    }
}

/// Iteration caps and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Wall-clock cap for one executor invocation
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_max_quality_iterations")]
    pub max_quality_iterations: u32,
    #[serde(default = "default_max_test_iterations")]
    pub max_test_iterations: u32,
    #[serde(default = "default_max_pr_review_iterations")]
    pub max_pr_review_iterations: u32,
    /// Implement→review attempts per task before the task is marked failed
    #[serde(default = "default_task_attempt_cap")]
    pub task_attempt_cap: u32,
}

fn default_stage_timeout_secs() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

fn default_max_quality_iterations() -> u32 {
    DEFAULT_MAX_QUALITY_ITERATIONS
}

fn default_max_test_iterations() -> u32 {
    DEFAULT_MAX_TEST_ITERATIONS
}

fn default_max_pr_review_iterations() -> u32 {
    DEFAULT_MAX_PR_REVIEW_ITERATIONS
}

fn default_task_attempt_cap() -> u32 {
    DEFAULT_TASK_ATTEMPT_CAP
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            max_quality_iterations: DEFAULT_MAX_QUALITY_ITERATIONS,
            max_test_iterations: DEFAULT_MAX_TEST_ITERATIONS,
            max_pr_review_iterations: DEFAULT_MAX_PR_REVIEW_ITERATIONS,
            task_attempt_cap: DEFAULT_TASK_ATTEMPT_CAP,
        }
    }
}

/// On-disk shape of `conveyor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    executor: Option<ExecutorProfile>,
    #[serde(default)]
    limits: Option<Limits>,
}

/// Runtime configuration for one conveyor invocation.
///
/// Paths are fixed here once and read everywhere else; only the status
/// store and lock manager ever write to them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub project_dir: PathBuf,
    pub conveyor_dir: PathBuf,
    pub status_path: PathBuf,
    pub lock_path: PathBuf,
    pub runs_dir: PathBuf,
    pub executor: ExecutorProfile,
    pub limits: Limits,
    /// Forces every stage to this tier when set (`--tier` flag)
    pub tier_override: Option<Tier>,
}

impl EngineConfig {
    /// Build a config rooted at `project_dir`, loading `conveyor.toml` if
    /// present (falling back to the user-level config file).
    pub fn load(project_dir: PathBuf, status_file: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let file = Self::read_config_file(&project_dir)?;
        let conveyor_dir = project_dir.join(".conveyor");
        let status_path = match status_file {
            Some(path) if path.is_absolute() => path,
            Some(path) => project_dir.join(path),
            None => conveyor_dir.join("status.json"),
        };
        let lock_path = lock_path_for(&status_path);
        let runs_dir = conveyor_dir.join("runs");

        Ok(Self {
            project_dir,
            conveyor_dir,
            status_path,
            lock_path,
            runs_dir,
            executor: file.executor.unwrap_or_default(),
            limits: file.limits.unwrap_or_default(),
            tier_override: None,
        })
    }

    fn read_config_file(project_dir: &Path) -> Result<ConfigFile> {
        let project_file = project_dir.join("conveyor.toml");
        let path = if project_file.exists() {
            Some(project_file)
        } else {
            dirs::config_dir()
                .map(|d| d.join("conveyor/config.toml"))
                .filter(|p| p.exists())
        };

        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))
            }
            None => Ok(ConfigFile::default()),
        }
    }

    pub fn with_tier_override(mut self, tier: Option<Tier>) -> Self {
        self.tier_override = tier;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorProfile) -> Self {
        self.executor = executor;
        self
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.conveyor_dir)
            .context("Failed to create .conveyor directory")?;
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        if let Some(parent) = self.status_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create status directory")?;
        }
        Ok(())
    }
}

/// The lock guards a specific status store, so it lives next to it:
/// `status.json` → `status.json.lock`.
pub fn lock_path_for(status_path: &Path) -> PathBuf {
    let name = status_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "status.json".to_string());
    status_path.with_file_name(format!("{name}.lock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults_without_config_file() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load(dir.path().to_path_buf(), None).unwrap();
        assert_eq!(config.executor.command, "claude");
        assert!(config.executor.base_args.contains(&"--print".to_string()));
        assert_eq!(config.limits.stage_timeout_secs, DEFAULT_STAGE_TIMEOUT_SECS);
        assert_eq!(config.limits.task_attempt_cap, 3);
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.status_path, root.join(".conveyor/status.json"));
        assert_eq!(config.lock_path, root.join(".conveyor/status.json.lock"));
        assert_eq!(config.runs_dir, root.join(".conveyor/runs"));
    }

    #[test]
    fn test_load_reads_project_config_file() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("conveyor.toml"),
            r#"
[executor]
command = "my-executor"
model_advanced = "opus-latest"

[limits]
max_quality_iterations = 2
"#,
        )
        .unwrap();
        let config = EngineConfig::load(dir.path().to_path_buf(), None).unwrap();
        assert_eq!(config.executor.command, "my-executor");
        assert_eq!(config.executor.model_advanced, "opus-latest");
        // unspecified fields keep their defaults
        assert_eq!(config.executor.model_light, "haiku");
        assert_eq!(config.limits.max_quality_iterations, 2);
        assert_eq!(config.limits.max_test_iterations, DEFAULT_MAX_TEST_ITERATIONS);
    }

    #[test]
    fn test_status_file_override_relative_to_project() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load(
            dir.path().to_path_buf(),
            Some(PathBuf::from("custom/run.json")),
        )
        .unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.status_path, root.join("custom/run.json"));
        assert_eq!(config.lock_path, root.join("custom/run.json.lock"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load(dir.path().to_path_buf(), None).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.conveyor_dir.exists());
        assert!(config.runs_dir.exists());
    }

    #[test]
    fn test_model_for_tier() {
        let profile = ExecutorProfile::default();
        assert_eq!(profile.model_for(Tier::Light), "haiku");
        assert_eq!(profile.model_for(Tier::Standard), "sonnet");
        assert_eq!(profile.model_for(Tier::Advanced), "opus");
    }

    #[test]
    fn test_tier_override_builder() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load(dir.path().to_path_buf(), None)
            .unwrap()
            .with_tier_override(Some(Tier::Light));
        assert_eq!(config.tier_override, Some(Tier::Light));
    }

    #[test]
    fn test_invalid_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("conveyor.toml"), "[executor\nbroken").unwrap();
        let result = EngineConfig::load(dir.path().to_path_buf(), None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("parse"));
    }
}

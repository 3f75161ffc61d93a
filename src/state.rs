//! The persisted workflow status document and its store.
//!
//! One `WorkflowState` exists per run, serialized as pretty camelCase JSON
//! at a caller-chosen path. Every mutation is persisted through
//! [`StatusStore::save`], which writes atomically (temp file + rename) and
//! then refreshes a mirror copy inside the run's log directory so a run
//! whose primary status file is lost can still be resumed from its log dir.
//!
//! Ownership rule: the driver mutates `state`, stage records and task
//! records; the convergence loops bump the per-loop counters; nothing but
//! the store touches the backing file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::convergence::LoopKind;
use crate::tier::Tier;

/// Top-level lifecycle of a run. Terminal once any non-running value is
/// set; `Completed` additionally forbids resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Running,
    Completed,
    Error,
    Blocked,
    MaxIterationsQuality,
    MaxIterationsTest,
    MaxIterationsPrReview,
    CircuitBreaker,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Initializing | RunState::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Initializing => "initializing",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Error => "error",
            RunState::Blocked => "blocked",
            RunState::MaxIterationsQuality => "max_iterations_quality",
            RunState::MaxIterationsTest => "max_iterations_test",
            RunState::MaxIterationsPrReview => "max_iterations_pr_review",
            RunState::CircuitBreaker => "circuit_breaker",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-stage record in the status document. Stages only ever move
/// pending → in_progress → completed; there is no regression.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// "m/n" tasks finished, maintained by the implement stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    /// Last convergence-loop iteration for loop-backed stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// True when the early-exit path bypassed this stage
    #[serde(default)]
    pub skipped: bool,
}

/// One planned implementation task. IDs are assigned once at planning,
/// are stable, and are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: u32,
    pub description: String,
    pub executor_tier: Tier,
    pub status: TaskStatus,
    pub review_attempts: u32,
}

impl TaskRecord {
    pub fn new(id: u32, description: impl Into<String>, executor_tier: Tier) -> Self {
        Self {
            id,
            description: description.into(),
            executor_tier,
            status: TaskStatus::Pending,
            review_attempts: 0,
        }
    }
}

/// The persisted document. Field names are fixed by the on-disk format;
/// treat renames as breaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub state: RunState,
    pub issue_ref: String,
    pub base_branch: String,
    pub branch: String,
    pub working_tree_path: String,
    pub run_id: String,
    pub log_dir: String,
    pub current_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<u32>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub quality_iterations: u32,
    #[serde(default)]
    pub test_iterations: u32,
    #[serde(default)]
    pub pr_review_iterations: u32,
    pub last_update: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(
        issue_ref: impl Into<String>,
        base_branch: impl Into<String>,
        run_id: impl Into<String>,
        log_dir: impl Into<String>,
    ) -> Self {
        Self {
            state: RunState::Initializing,
            issue_ref: issue_ref.into(),
            base_branch: base_branch.into(),
            branch: String::new(),
            working_tree_path: String::new(),
            run_id: run_id.into(),
            log_dir: log_dir.into(),
            current_stage: String::new(),
            current_task_id: None,
            stages: BTreeMap::new(),
            tasks: Vec::new(),
            quality_iterations: 0,
            test_iterations: 0,
            pr_review_iterations: 0,
            last_update: Utc::now(),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.get(name)
    }

    fn stage_entry(&mut self, name: &str) -> &mut StageRecord {
        self.stages.entry(name.to_string()).or_default()
    }

    pub fn stage_completed(&self, name: &str) -> bool {
        self.stage(name)
            .map(|s| s.status == StageStatus::Completed)
            .unwrap_or(false)
    }

    pub fn begin_stage(&mut self, name: &str) {
        self.current_stage = name.to_string();
        let record = self.stage_entry(name);
        if record.status == StageStatus::Pending {
            record.status = StageStatus::InProgress;
            record.started_at = Some(Utc::now());
        }
    }

    pub fn complete_stage(&mut self, name: &str) {
        let record = self.stage_entry(name);
        record.status = StageStatus::Completed;
        record.completed_at = Some(Utc::now());
    }

    /// Early-exit path: record the stage as done without running it.
    pub fn skip_stage(&mut self, name: &str) {
        let record = self.stage_entry(name);
        record.status = StageStatus::Completed;
        record.skipped = true;
        record.completed_at = Some(Utc::now());
    }

    pub fn set_stage_iteration(&mut self, name: &str, iteration: u32) {
        self.stage_entry(name).iteration = Some(iteration);
    }

    pub fn set_stage_pr_number(&mut self, name: &str, pr_number: u64) {
        self.stage_entry(name).pr_number = Some(pr_number);
    }

    pub fn set_task_progress(&mut self, name: &str, done: usize, total: usize) {
        self.stage_entry(name).task_progress = Some(format!("{done}/{total}"));
    }

    pub fn task(&self, id: u32) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: u32) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn begin_task(&mut self, id: u32) {
        self.current_task_id = Some(id);
        if let Some(task) = self.task_mut(id) {
            task.status = TaskStatus::InProgress;
        }
    }

    pub fn finish_task(&mut self, id: u32, status: TaskStatus) {
        if let Some(task) = self.task_mut(id) {
            task.status = status;
        }
        if self.current_task_id == Some(id) {
            self.current_task_id = None;
        }
    }

    pub fn completed_task_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count()
    }

    pub fn failed_tasks(&self) -> Vec<&TaskRecord> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    /// Per-loop-type monotonic counters. They survive resume and never
    /// reset within a run.
    pub fn bump_loop_counter(&mut self, kind: LoopKind) -> u32 {
        let counter = match kind {
            LoopKind::Quality => &mut self.quality_iterations,
            LoopKind::Test => &mut self.test_iterations,
            LoopKind::PrReview => &mut self.pr_review_iterations,
        };
        *counter += 1;
        *counter
    }

    pub fn loop_counter(&self, kind: LoopKind) -> u32 {
        match kind {
            LoopKind::Quality => self.quality_iterations,
            LoopKind::Test => self.test_iterations,
            LoopKind::PrReview => self.pr_review_iterations,
        }
    }
}

/// Durable storage for the status document.
///
/// Saves are atomic: the document is written to `<path>.tmp` and renamed
/// over the target, so a crash mid-write leaves the previous version
/// intact. After every save the document is mirrored into the run's log
/// directory (when the state names one) for `--resume-from-log-dir`.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

/// File name of the mirror copy inside a run's log directory.
pub const MIRROR_FILE_NAME: &str = "status.json";

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the document, or `None` when no file exists yet.
    pub fn load(&self) -> Result<Option<WorkflowState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read status file {}", self.path.display()))?;
        let state: WorkflowState = serde_json::from_str(&raw)
            .with_context(|| format!("Status file {} is not valid JSON", self.path.display()))?;
        Ok(Some(state))
    }

    /// Persist the document atomically, stamping `lastUpdate`, then
    /// refresh the log-directory mirror.
    pub fn save(&self, state: &mut WorkflowState) -> Result<()> {
        state.last_update = Utc::now();
        let json = serde_json::to_string_pretty(state).context("Failed to serialize status")?;
        write_atomic(&self.path, &json)?;
        self.mirror(state, &json)?;
        Ok(())
    }

    fn mirror(&self, state: &WorkflowState, json: &str) -> Result<()> {
        if state.log_dir.is_empty() {
            return Ok(());
        }
        let dir = PathBuf::from(&state.log_dir);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
        write_atomic(&dir.join(MIRROR_FILE_NAME), json)
    }

    /// Remove the status file (reset subcommand). Missing file is fine.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to remove status file {}", self.path.display())
            }),
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Temp file sits next to the target so the rename stays on one
/// filesystem.
fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "status.json".to_string());
    path.with_file_name(format!("{name}.tmp"))
}

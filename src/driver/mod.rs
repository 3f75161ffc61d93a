//! The workflow driver: a finite state machine over the fixed stage
//! sequence.
//!
//! Each stage is skipped when the status document already marks it
//! completed (that is the whole resume story), otherwise marked
//! `in_progress`, executed, and marked `completed`, with a save around
//! every transition. Failures are translated at the top: an evaluation
//! block becomes the `blocked` terminal state, a tripped convergence cap
//! becomes its loop-specific `max_iterations_*` state, anything else
//! becomes `error`.

pub mod loops;
pub mod stages;
pub mod tasks;

use serde::de::DeserializeOwned;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::resume::ResumeContext;
use crate::runner::{ExecutorClient, StageRequest, StageResult};
use crate::state::{RunState, StatusStore, WorkflowState};
use crate::tier::{Tier, TierResolver};
use crate::tracker::{IssueRef, Tracker};
use crate::ui::WorkflowUi;

/// The fixed stage order. Status-document keys and resume behavior both
/// hang off these names; treat renames as breaking.
pub const STAGE_SEQUENCE: &[(&str, &str)] = &[
    ("setup", "fetch issue, create work branch"),
    ("research", "survey the codebase"),
    ("evaluate", "feasibility check"),
    ("plan", "break the change into tasks"),
    ("implement", "implement planned tasks"),
    ("test-loop", "run and repair the test suite"),
    ("docs", "update documentation"),
    ("publish", "commit, push, open PR"),
    ("pr-review", "review and polish the PR"),
    ("complete", "announce results"),
];

pub struct WorkflowDriver {
    config: EngineConfig,
    store: StatusStore,
    state: WorkflowState,
    issue: IssueRef,
    executor: ExecutorClient,
    tracker: Tracker,
    resolver: TierResolver,
    ui: WorkflowUi,
    resumed: bool,
}

impl WorkflowDriver {
    /// Start a fresh run. Creates the run's log directory and persists
    /// the initial document before any stage work.
    pub fn new_run(
        config: EngineConfig,
        issue: IssueRef,
        base_branch: &str,
    ) -> Result<Self, EngineError> {
        config.ensure_directories()?;
        let run_id = new_run_id();
        let log_dir = config.runs_dir.join(&run_id);
        std::fs::create_dir_all(&log_dir).map_err(|e| {
            EngineError::Config(format!(
                "cannot create run directory {}: {e}",
                log_dir.display()
            ))
        })?;

        let state = WorkflowState::new(
            issue.to_string(),
            base_branch,
            &run_id,
            log_dir.to_string_lossy(),
        );
        let store = StatusStore::new(&config.status_path);
        let mut driver = Self::assemble(config, store, state, issue, false);
        driver.save()?;
        Ok(driver)
    }

    /// Continue a validated prior run. Completed stages and tasks will be
    /// skipped; iteration counters continue from their persisted values.
    pub fn resume(config: EngineConfig, ctx: ResumeContext) -> Result<Self, EngineError> {
        let issue: IssueRef =
            ctx.state
                .issue_ref
                .parse()
                .map_err(|e: anyhow::Error| EngineError::ResumeValidation {
                    reason: format!("bad issueRef in status document: {e}"),
                })?;
        let store = StatusStore::new(&config.status_path);
        Ok(Self::assemble(config, store, ctx.state, issue, true))
    }

    fn assemble(
        config: EngineConfig,
        store: StatusStore,
        state: WorkflowState,
        issue: IssueRef,
        resumed: bool,
    ) -> Self {
        let executor = ExecutorClient::new(
            config.executor.clone(),
            config.limits.stage_timeout_secs,
            PathBuf::from(&state.log_dir),
        );
        let tracker = Tracker::new(&config.project_dir);
        let ui = WorkflowUi::new(STAGE_SEQUENCE.len() as u64);
        Self {
            config,
            store,
            state,
            issue,
            executor,
            tracker,
            resolver: TierResolver::new(),
            ui,
            resumed,
        }
    }

    /// Drive the workflow to a terminal state. The status document always
    /// records how the run ended, even when this returns an error.
    pub async fn run(mut self) -> Result<WorkflowState, EngineError> {
        match self.run_stages().await {
            Ok(()) => {
                self.ui.completion_summary(&self.state);
                Ok(self.state)
            }
            Err(err) => {
                self.state.state = terminal_state_for(&err);
                self.log_event(&format!("run ended: {} ({err})", self.state.state));
                if let Err(save_err) = self.store.save(&mut self.state) {
                    eprintln!("[driver] failed to record terminal state: {save_err:#}");
                }
                Err(err)
            }
        }
    }

    async fn run_stages(&mut self) -> Result<(), EngineError> {
        if self.resumed {
            self.ui.resume_banner(&format!(
                "{} at stage '{}'",
                self.state.issue_ref, self.state.current_stage
            ));
        }
        let shown_branch = if self.state.branch.is_empty() {
            self.state.base_branch.clone()
        } else {
            self.state.branch.clone()
        };
        self.ui
            .banner(&self.state.issue_ref, &shown_branch, &self.state.run_id);
        self.log_event(&format!("run start (issue {})", self.state.issue_ref));

        self.state.state = RunState::Running;
        self.save()?;

        for (stage, description) in STAGE_SEQUENCE {
            if self.state.stage_completed(stage) {
                let reason = if self.state.stage(stage).is_some_and(|s| s.skipped) {
                    "non-functional change"
                } else {
                    "already completed"
                };
                self.ui.stage_skipped(stage, reason);
                continue;
            }

            self.state.begin_stage(stage);
            self.save()?;
            self.ui.stage_start(stage, description);
            self.log_event(&format!("stage {stage} start"));

            if let Err(err) = self.execute_stage(stage).await {
                self.ui.stage_failed(stage, &err.to_string());
                self.log_event(&format!("stage {stage} failed: {err}"));
                return Err(err);
            }

            self.state.complete_stage(stage);
            self.save()?;
            self.ui.stage_complete(stage);
            self.log_event(&format!("stage {stage} complete"));
        }

        self.state.state = RunState::Completed;
        self.save()?;
        self.log_event("run complete");
        Ok(())
    }

    async fn execute_stage(&mut self, stage: &str) -> Result<(), EngineError> {
        match stage {
            "setup" => self.stage_setup().await,
            "research" => self.stage_research().await,
            "evaluate" => self.stage_evaluate().await,
            "plan" => self.stage_plan().await,
            "implement" => self.stage_implement().await,
            "test-loop" => self.stage_test_loop().await,
            "docs" => self.stage_docs().await,
            "publish" => self.stage_publish().await,
            "pr-review" => self.stage_pr_review().await,
            "complete" => self.stage_complete_run().await,
            other => Err(EngineError::Stage {
                stage: other.to_string(),
                reason: "stage has no handler".to_string(),
            }),
        }
    }

    // ---- shared plumbing used by the stage handlers and loop strategies ----

    pub(crate) fn save(&mut self) -> Result<(), EngineError> {
        self.store.save(&mut self.state).map_err(EngineError::from)
    }

    /// Tier for a stage name, honoring the run-wide `--tier` override.
    pub(crate) fn resolve_tier(&self, stage: &str, hint: &str) -> Tier {
        self.config
            .tier_override
            .unwrap_or_else(|| self.resolver.resolve(stage, hint))
    }

    /// One executor call that must succeed: runner errors and
    /// error-status results both become a stage failure.
    pub(crate) async fn call_executor(
        &self,
        stage: &str,
        stage_id: &str,
        prompt: String,
        schema: &str,
        tier: Tier,
    ) -> Result<StageResult, EngineError> {
        let model = self.config.executor.model_for(tier).to_string();
        let full_prompt = format!(
            "## Stage: {stage_id}\n\n{prompt}\n\nRespond with a single JSON object shaped as:\n{schema}\n"
        );
        let request = StageRequest::new(stage_id, full_prompt, schema, tier);

        self.ui.executor_start(stage_id, &model);
        let started = std::time::Instant::now();
        let result = self
            .executor
            .run(&request)
            .await
            .map_err(|e| EngineError::Stage {
                stage: stage.to_string(),
                reason: e.to_string(),
            })?;
        self.ui.executor_done(stage_id, started.elapsed());

        if result.is_success() {
            Ok(result)
        } else {
            Err(EngineError::Stage {
                stage: stage.to_string(),
                reason: result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "executor reported failure".to_string()),
            })
        }
    }

    pub(crate) fn worktree(&self) -> Result<crate::worktree::Worktree, EngineError> {
        crate::worktree::Worktree::open(&self.config.project_dir).map_err(EngineError::from)
    }

    pub(crate) fn context_dir(&self) -> PathBuf {
        PathBuf::from(&self.state.log_dir).join("context")
    }

    pub(crate) fn write_context(&self, name: &str, contents: &str) -> Result<(), EngineError> {
        use anyhow::Context;
        let dir = self.context_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create context directory {}", dir.display()))?;
        let path = dir.join(name);
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Driver-level event log, one line per event, append-only.
    pub(crate) fn log_event(&self, event: &str) {
        let path = PathBuf::from(&self.state.log_dir).join("orchestrator.log");
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = format!("{} {event}\n", chrono::Utc::now().to_rfc3339());
        let written = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
        if let Err(err) = written {
            eprintln!("[driver] failed to append orchestrator log: {err}");
        }
    }

    /// Milestone narration on the issue. Best-effort by construction.
    pub(crate) async fn announce(&self, body: &str) {
        self.tracker.comment_issue(&self.issue, body).await;
    }

    /// Milestone narration on the PR once one exists, else the issue.
    pub(crate) async fn announce_pr(&self, body: &str) {
        match self.state.stage("publish").and_then(|s| s.pr_number) {
            Some(number) => self.tracker.comment_pr(number, body).await,
            None => self.tracker.comment_issue(&self.issue, body).await,
        }
    }

    /// Shared prompt preamble describing where the executor is working.
    pub(crate) fn preamble(&self) -> String {
        format!(
            "Project checkout: {} (branch {}, base {}). Issue: {}. \
             Context artifacts from earlier stages live in {}.",
            self.state.working_tree_path,
            self.state.branch,
            self.state.base_branch,
            self.state.issue_ref,
            self.context_dir().display()
        )
    }
}

/// Shorthand for attributing an arbitrary failure to a stage.
pub(crate) fn stage_err(stage: &str, reason: impl Into<String>) -> EngineError {
    EngineError::Stage {
        stage: stage.to_string(),
        reason: reason.into(),
    }
}

/// Deserialize a stage payload, mapping shape mismatches to that stage's
/// failure.
pub(crate) fn parse_payload<T: DeserializeOwned>(
    stage: &str,
    result: &StageResult,
) -> Result<T, EngineError> {
    result.parse().map_err(|e| EngineError::Stage {
        stage: stage.to_string(),
        reason: e.to_string(),
    })
}

fn terminal_state_for(err: &EngineError) -> RunState {
    match err {
        EngineError::Blocked { .. } => RunState::Blocked,
        EngineError::IterationCap { kind, .. } => kind.terminal_state(),
        _ => RunState::Error,
    }
}

fn new_run_id() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let tag = Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &tag[..8])
}

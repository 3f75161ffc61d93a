//! Stage payload contracts and the non-looping stage handlers.
//!
//! Each executor-backed stage declares the JSON shape it expects back;
//! the schema text is embedded in the prompt and the response must
//! deserialize into the matching type or the stage fails. Setup, publish,
//! and complete are local stages built from worktree and tracker calls.

use serde::Deserialize;
use serde_json::json;

use crate::convergence::{LoopOutcome, run_convergence_loop};
use crate::driver::loops::{PrReviewSteps, TestSteps};
use crate::driver::{WorkflowDriver, parse_payload, stage_err};
use crate::errors::EngineError;
use crate::state::TaskRecord;
use crate::worktree;

// ==================== payload contracts ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchSummary {
    pub summary: String,
    #[serde(default)]
    pub relevant_files: Vec<String>,
}

pub const RESEARCH_SCHEMA: &str =
    r#"{"summary": "<what the codebase does around this issue>", "relevantFiles": ["<path>"]}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalVerdict {
    Proceed,
    Blocked,
}

#[derive(Debug, Deserialize)]
pub struct Evaluation {
    pub verdict: EvalVerdict,
    #[serde(default)]
    pub concerns: Vec<String>,
}

pub const EVALUATE_SCHEMA: &str =
    r#"{"verdict": "proceed|blocked", "concerns": ["<concern>"]}"#;

/// Nature of the change, decided at planning. Non-functional changes
/// bypass implement and test-loop entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "functional")]
    Functional,
    #[serde(rename = "docs-only")]
    DocsOnly,
    #[serde(rename = "config-only")]
    ConfigOnly,
}

impl ChangeKind {
    pub fn is_functional(self) -> bool {
        self == ChangeKind::Functional
    }

    pub fn describe(self) -> &'static str {
        match self {
            ChangeKind::Functional => "functional",
            ChangeKind::DocsOnly => "docs-only",
            ChangeKind::ConfigOnly => "config-only",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PlannedTask {
    pub id: u32,
    pub description: String,
    /// Complexity hint S/M/L; anything else falls back to the stage default
    #[serde(default)]
    pub complexity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPayload {
    pub tasks: Vec<PlannedTask>,
    pub change_kind: ChangeKind,
}

pub const PLAN_SCHEMA: &str = r#"{"tasks": [{"id": 1, "description": "<task>", "complexity": "S|M|L"}], "changeKind": "functional|docs-only|config-only"}"#;

#[derive(Debug, Deserialize)]
pub struct WorkReport {
    #[serde(default)]
    pub summary: String,
}

pub const WORK_SCHEMA: &str = r#"{"summary": "<what was changed>"}"#;

// ==================== stage handlers ====================

impl WorkflowDriver {
    /// Fetch the issue, create the work branch, and pin the identity
    /// fields the rest of the run depends on.
    pub(crate) async fn stage_setup(&mut self) -> Result<(), EngineError> {
        let issue = self.issue.clone();
        let info = self
            .tracker
            .fetch_issue(&issue)
            .await
            .map_err(|e| stage_err("setup", format!("{e:#}")))?;
        self.write_context(
            "issue.md",
            &format!("# {} ({})\n\n{}\n", info.title, info.url, info.body),
        )?;

        let branch = worktree::branch_for_issue(&self.state.issue_ref);
        let tree = self.worktree()?;
        tree.checkout_work_branch(&branch, &self.state.base_branch)
            .map_err(|e| stage_err("setup", format!("{e:#}")))?;

        self.state.branch = branch.clone();
        self.state.working_tree_path = self.config.project_dir.to_string_lossy().to_string();
        self.save()?;
        self.ui
            .note(&format!("issue '{}' on branch {branch}", info.title));
        Ok(())
    }

    pub(crate) async fn stage_research(&mut self) -> Result<(), EngineError> {
        let prompt = format!(
            "{}\n\nSurvey the codebase for everything relevant to this issue: \
             the modules involved, existing conventions to follow, and any \
             prior art. Read {}/issue.md for the issue body. Summarize your \
             findings; list the files a change would touch.",
            self.preamble(),
            self.context_dir().display()
        );
        let tier = self.resolve_tier("research", "");
        let result = self
            .call_executor("research", "research", prompt, RESEARCH_SCHEMA, tier)
            .await?;
        let research: ResearchSummary = parse_payload("research", &result)?;

        let mut doc = format!("# Research\n\n{}\n", research.summary);
        if !research.relevant_files.is_empty() {
            doc.push_str("\n## Relevant files\n\n");
            for file in &research.relevant_files {
                doc.push_str(&format!("- {file}\n"));
            }
        }
        self.write_context("research.md", &doc)?;
        Ok(())
    }

    /// Feasibility gate. A `blocked` verdict is a distinct terminal
    /// outcome, not an ordinary stage failure.
    pub(crate) async fn stage_evaluate(&mut self) -> Result<(), EngineError> {
        let prompt = format!(
            "{}\n\nAssess whether this issue can be implemented as described, \
             using the research notes in {}/research.md. Report blocked only \
             for genuine blockers (contradictory requirements, missing \
             dependencies, unsafe migrations); list lesser worries as \
             concerns alongside a proceed verdict.",
            self.preamble(),
            self.context_dir().display()
        );
        let tier = self.resolve_tier("evaluate", "");
        let result = self
            .call_executor("evaluate", "evaluate", prompt, EVALUATE_SCHEMA, tier)
            .await?;
        let evaluation: Evaluation = parse_payload("evaluate", &result)?;

        match evaluation.verdict {
            EvalVerdict::Blocked => {
                let concerns = if evaluation.concerns.is_empty() {
                    vec!["evaluation reported blocked without detail".to_string()]
                } else {
                    evaluation.concerns
                };
                self.ui.blocked(&concerns);
                self.announce(&format!(
                    "Evaluation blocked this workflow:\n{}",
                    bullet_list(&concerns)
                ))
                .await;
                Err(EngineError::Blocked { concerns })
            }
            EvalVerdict::Proceed => {
                for concern in &evaluation.concerns {
                    self.ui.note(&format!("concern: {concern}"));
                }
                Ok(())
            }
        }
    }

    /// Produce the ordered task list and decide the change kind. A
    /// non-functional kind records implement and test-loop as skipped
    /// right here, before either is reached.
    pub(crate) async fn stage_plan(&mut self) -> Result<(), EngineError> {
        let prompt = format!(
            "{}\n\nBreak the issue into an ordered list of independent \
             implementation tasks. Number ids from 1; rate each task's \
             complexity S, M, or L. Classify the overall change: functional, \
             docs-only, or config-only.",
            self.preamble()
        );
        let tier = self.resolve_tier("plan", "");
        let result = self
            .call_executor("plan", "plan", prompt, PLAN_SCHEMA, tier)
            .await?;
        let plan: PlanPayload = parse_payload("plan", &result)?;

        if plan.change_kind.is_functional() && plan.tasks.is_empty() {
            return Err(stage_err("plan", "planner produced no tasks"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for task in &plan.tasks {
            if !seen.insert(task.id) {
                return Err(stage_err("plan", format!("duplicate task id {}", task.id)));
            }
        }

        self.state.tasks = plan
            .tasks
            .iter()
            .map(|t| {
                let tier = self.resolve_tier("implement", &t.complexity);
                TaskRecord::new(t.id, t.description.clone(), tier)
            })
            .collect();
        self.write_context(
            "tasks.json",
            &serde_json::to_string_pretty(&self.state.tasks)
                .map_err(|e| stage_err("plan", e.to_string()))?,
        )?;

        if !plan.change_kind.is_functional() {
            self.state.skip_stage("implement");
            self.state.skip_stage("test-loop");
            self.ui.note(&format!(
                "{} change: implement and test-loop will be skipped",
                plan.change_kind.describe()
            ));
        }
        self.save()?;
        self.ui.note(&format!(
            "{} tasks planned ({} change)",
            self.state.tasks.len(),
            plan.change_kind.describe()
        ));
        Ok(())
    }

    pub(crate) async fn stage_test_loop(&mut self) -> Result<(), EngineError> {
        let max = self.config.limits.max_test_iterations;
        let mut steps = TestSteps::new(self);
        match run_convergence_loop(&mut steps, max, |_, _| {}).await? {
            LoopOutcome::Converged { iterations } => {
                self.state.set_stage_iteration("test-loop", iterations);
                self.save()?;
                Ok(())
            }
            LoopOutcome::Aborted { reason } => Err(stage_err(
                "test-loop",
                format!("unexpected abort: {reason}"),
            )),
        }
    }

    pub(crate) async fn stage_docs(&mut self) -> Result<(), EngineError> {
        let prompt = format!(
            "{}\n\nBring documentation in line with the change: README \
             sections, module docs, and the changelog if the project keeps \
             one. Make the edits directly in the checkout.",
            self.preamble()
        );
        let tier = self.resolve_tier("docs", "");
        let result = self
            .call_executor("docs", "docs", prompt, WORK_SCHEMA, tier)
            .await?;
        let report: WorkReport = parse_payload("docs", &result)?;
        if !report.summary.is_empty() {
            self.ui.note(&report.summary);
        }
        Ok(())
    }

    /// Commit, push, open the PR. Refuses to publish an empty change:
    /// with implement skipped, a docs stage that edited nothing would
    /// otherwise produce a no-op PR.
    pub(crate) async fn stage_publish(&mut self) -> Result<(), EngineError> {
        let change_summary = {
            let tree = self.worktree()?;
            let summary = tree
                .changes_since_base(&self.state.base_branch)
                .map_err(|e| stage_err("publish", format!("{e:#}")))?;
            if summary.is_empty() {
                return Err(stage_err(
                    "publish",
                    "nothing to publish: working tree matches the base branch",
                ));
            }
            if tree.is_dirty().map_err(|e| stage_err("publish", format!("{e:#}")))? {
                tree.commit_all(&format!("Apply changes for {}", self.state.issue_ref))
                    .map_err(|e| stage_err("publish", format!("{e:#}")))?;
            }
            summary
        };

        self.tracker
            .push_branch(&self.state.branch)
            .await
            .map_err(|e| stage_err("publish", format!("{e:#}")))?;

        let title = match self.tracker.fetch_issue(&self.issue).await {
            Ok(info) => info.title,
            Err(err) => {
                eprintln!("[driver] issue title unavailable, using reference: {err:#}");
                self.state.issue_ref.clone()
            }
        };
        let body = self.pr_body(&change_summary);
        let pr = self
            .tracker
            .create_pr(&title, &body, &self.state.base_branch, &self.state.branch)
            .await
            .map_err(|e| stage_err("publish", format!("{e:#}")))?;

        self.state.set_stage_pr_number("publish", pr.number);
        self.save()?;
        self.write_context(
            "pr.json",
            &serde_json::to_string_pretty(&json!({ "number": pr.number, "url": pr.url }))
                .map_err(|e| stage_err("publish", e.to_string()))?,
        )?;
        self.ui.note(&format!("opened PR #{} ({})", pr.number, pr.url));
        self.announce(&format!("Opened {} for this issue.", pr.url))
            .await;
        Ok(())
    }

    fn pr_body(&self, changes: &worktree::ChangeSummary) -> String {
        let mut body = format!("Closes {}\n\n", self.state.issue_ref);
        if !self.state.tasks.is_empty() {
            body.push_str(&format!(
                "{}/{} planned tasks completed.\n",
                self.state.completed_task_count(),
                self.state.tasks.len()
            ));
            for task in self.state.failed_tasks() {
                body.push_str(&format!(
                    "- task {} left for follow-up: {}\n",
                    task.id, task.description
                ));
            }
            body.push('\n');
        }
        body.push_str(&format!(
            "{} files changed (+{} -{} lines).\n",
            changes.file_count(),
            changes.lines_added,
            changes.lines_removed
        ));
        body
    }

    pub(crate) async fn stage_pr_review(&mut self) -> Result<(), EngineError> {
        let pr_number = self
            .state
            .stage("publish")
            .and_then(|s| s.pr_number)
            .ok_or_else(|| stage_err("pr-review", "publish recorded no PR number"))?;

        let max = self.config.limits.max_pr_review_iterations;
        let mut steps = PrReviewSteps::new(self, pr_number);
        match run_convergence_loop(&mut steps, max, |_, _| {}).await? {
            LoopOutcome::Converged { iterations } => {
                self.state.set_stage_iteration("pr-review", iterations);
                self.save()?;
                self.announce_pr(&format!(
                    "PR review approved after {iterations} iteration(s)."
                ))
                .await;
                Ok(())
            }
            LoopOutcome::Aborted { reason } => Err(stage_err(
                "pr-review",
                format!("unexpected abort: {reason}"),
            )),
        }
    }

    /// Final narration: completion comment plus one follow-up issue per
    /// failed task. The run reaches `completed` even with failed tasks;
    /// the follow-ups are how that debt stays visible.
    pub(crate) async fn stage_complete_run(&mut self) -> Result<(), EngineError> {
        let failed: Vec<TaskRecord> = self.state.failed_tasks().into_iter().cloned().collect();
        let mut followups = Vec::new();
        for task in &failed {
            let title = format!("Follow-up from {}: {}", self.state.issue_ref, task.description);
            let body = format!(
                "Task {} of the workflow for {} did not pass review within its \
                 attempt cap and was left incomplete.\n\nTask: {}\nReview attempts: {}\n",
                task.id, self.state.issue_ref, task.description, task.review_attempts
            );
            match self.tracker.create_followup_issue(&title, &body).await {
                Ok(url) => {
                    self.ui.note(&format!("follow-up issue for task {}: {url}", task.id));
                    followups.push(url);
                }
                Err(err) => {
                    eprintln!(
                        "[driver] follow-up issue for task {} failed (continuing): {err:#}",
                        task.id
                    );
                }
            }
        }

        let mut summary = format!("Workflow complete for {}.\n", self.state.issue_ref);
        if !self.state.tasks.is_empty() {
            summary.push_str(&format!(
                "- {}/{} tasks completed\n",
                self.state.completed_task_count(),
                self.state.tasks.len()
            ));
        }
        if let Some(pr) = self.state.stage("publish").and_then(|s| s.pr_number) {
            summary.push_str(&format!("- PR #{pr}\n"));
        }
        for url in &followups {
            summary.push_str(&format!("- follow-up: {url}\n"));
        }
        self.announce(&summary).await;
        Ok(())
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

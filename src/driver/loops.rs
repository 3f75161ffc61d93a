//! The three convergence strategies.
//!
//! Each one wires [`ConvergenceSteps`] to executor calls: what "check"
//! asks for, which verdicts are terminal, and what "fix" instructs. The
//! quality strategy is the only one that can abort (its reviewer may
//! reject an attempt outright); test and pr-review only converge or run
//! into their caps.

use async_trait::async_trait;
use serde::Deserialize;

use crate::convergence::{CheckOutcome, ConvergenceSteps, LoopKind};
use crate::driver::stages::{WORK_SCHEMA, WorkReport};
use crate::driver::{WorkflowDriver, parse_payload, stage_err};
use crate::errors::EngineError;

// ==================== verdict contracts ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Approve,
    Revise,
    Reject,
}

impl ReviewDecision {
    fn describe(self) -> &'static str {
        match self {
            ReviewDecision::Approve => "approve",
            ReviewDecision::Revise => "revise",
            ReviewDecision::Reject => "reject",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: ReviewDecision,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub reason: String,
}

pub const REVIEW_SCHEMA: &str = r#"{"verdict": "approve|revise|reject", "feedback": "<what to improve, for revise>", "reason": "<why the approach is wrong, for reject>"}"#;

#[derive(Debug, Deserialize)]
pub struct TestRunReport {
    pub passed: bool,
    #[serde(default)]
    pub failures: String,
}

pub const TEST_RUN_SCHEMA: &str =
    r#"{"passed": false, "failures": "<failing tests and their output>"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageDecision {
    Adequate,
    NoTestableChanges,
    Gaps,
}

#[derive(Debug, Deserialize)]
pub struct CoverageVerdict {
    pub verdict: CoverageDecision,
    #[serde(default)]
    pub feedback: String,
}

pub const COVERAGE_SCHEMA: &str =
    r#"{"verdict": "adequate|no_testable_changes|gaps", "feedback": "<untested behavior, for gaps>"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApproveRevise {
    Approve,
    Revise,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrReviewVerdict {
    pub goal_verdict: ApproveRevise,
    pub code_verdict: ApproveRevise,
    #[serde(default)]
    pub feedback: String,
}

pub const PR_REVIEW_SCHEMA: &str = r#"{"goalVerdict": "approve|revise", "codeVerdict": "approve|revise", "feedback": "<requested changes, for revise>"}"#;

// ==================== quality (per task) ====================

/// Code review of one task's implementation. Revise feeds a fix pass;
/// reject aborts the loop and costs the task an attempt.
pub struct QualitySteps<'a> {
    driver: &'a mut WorkflowDriver,
    task_id: u32,
    description: String,
    max: u32,
    iteration: u32,
}

impl<'a> QualitySteps<'a> {
    pub fn new(driver: &'a mut WorkflowDriver, task_id: u32, description: &str) -> Self {
        let max = driver.config.limits.max_quality_iterations;
        Self {
            driver,
            task_id,
            description: description.to_string(),
            max,
            iteration: 0,
        }
    }
}

#[async_trait]
impl ConvergenceSteps for QualitySteps<'_> {
    fn kind(&self) -> LoopKind {
        LoopKind::Quality
    }

    fn bump_counter(&mut self) -> u32 {
        self.driver.state.bump_loop_counter(LoopKind::Quality)
    }

    async fn check(&mut self) -> Result<CheckOutcome, EngineError> {
        self.iteration += 1;
        let stage_id = format!("review-task-{}", self.task_id);
        let prompt = format!(
            "{}\n\nReview the working-tree changes made for task {} ({}). \
             Judge correctness, completeness against the task description, \
             and fit with the surrounding code. Verdict approve when the \
             work is mergeable as is; revise with concrete feedback when it \
             needs rework; reject with a reason only when the approach \
             itself is wrong and rework cannot save it.",
            self.driver.preamble(),
            self.task_id,
            self.description
        );
        let tier = self.driver.resolve_tier(&stage_id, "");
        let result = self
            .driver
            .call_executor("implement", &stage_id, prompt, REVIEW_SCHEMA, tier)
            .await?;
        let review: ReviewVerdict = parse_payload("implement", &result)?;
        self.driver.save()?;

        self.driver.ui.loop_iteration(
            "quality",
            self.iteration,
            self.max,
            review.verdict.describe(),
        );
        self.driver
            .announce(&format!(
                "Task {} quality review, iteration {}: {}",
                self.task_id,
                self.iteration,
                review.verdict.describe()
            ))
            .await;

        Ok(match review.verdict {
            ReviewDecision::Approve => CheckOutcome::Terminal,
            ReviewDecision::Revise => CheckOutcome::Continue {
                feedback: fallback(review.feedback, "reviewer requested changes without detail"),
            },
            ReviewDecision::Reject => CheckOutcome::Abort {
                reason: fallback(
                    first_nonempty(review.reason, review.feedback),
                    "reviewer rejected the approach without detail",
                ),
            },
        })
    }

    async fn fix(&mut self, feedback: &str) -> Result<(), EngineError> {
        let stage_id = format!("fix-task-{}", self.task_id);
        let prompt = format!(
            "{}\n\nApply this review feedback to the changes for task {} \
             ({}):\n\n{feedback}\n\nEdit the checkout directly.",
            self.driver.preamble(),
            self.task_id,
            self.description
        );
        let tier = self.driver.resolve_tier(&stage_id, "");
        let result = self
            .driver
            .call_executor("implement", &stage_id, prompt, WORK_SCHEMA, tier)
            .await?;
        let _: WorkReport = parse_payload("implement", &result)?;
        Ok(())
    }
}

// ==================== test (after all tasks) ====================

/// Two-phase check: run the suite; once green, validate that the changed
/// code is actually covered. Gaps cost iterations like failures do.
pub struct TestSteps<'a> {
    driver: &'a mut WorkflowDriver,
    max: u32,
    iteration: u32,
}

impl<'a> TestSteps<'a> {
    pub fn new(driver: &'a mut WorkflowDriver) -> Self {
        let max = driver.config.limits.max_test_iterations;
        Self {
            driver,
            max,
            iteration: 0,
        }
    }
}

#[async_trait]
impl ConvergenceSteps for TestSteps<'_> {
    fn kind(&self) -> LoopKind {
        LoopKind::Test
    }

    fn bump_counter(&mut self) -> u32 {
        self.driver.state.bump_loop_counter(LoopKind::Test)
    }

    async fn check(&mut self) -> Result<CheckOutcome, EngineError> {
        self.iteration += 1;
        let prompt = format!(
            "{}\n\nRun the project's full test suite and report the result. \
             Do not fix anything in this pass.",
            self.driver.preamble()
        );
        let tier = self.driver.resolve_tier("test-run", "");
        let result = self
            .driver
            .call_executor("test-loop", "test-run", prompt, TEST_RUN_SCHEMA, tier)
            .await?;
        let report: TestRunReport = parse_payload("test-loop", &result)?;
        self.driver.save()?;

        if !report.passed {
            self.driver
                .ui
                .loop_iteration("test", self.iteration, self.max, "suite failing");
            self.driver
                .announce(&format!(
                    "Test iteration {}: suite failing.",
                    self.iteration
                ))
                .await;
            return Ok(CheckOutcome::Continue {
                feedback: fallback(report.failures, "test suite failed without captured output"),
            });
        }

        let prompt = format!(
            "{}\n\nThe suite is green. Assess whether the changes made for \
             this issue are adequately covered by tests. Answer \
             no_testable_changes only when nothing in the change can be \
             exercised by a test.",
            self.driver.preamble()
        );
        let tier = self.driver.resolve_tier("test-coverage", "");
        let result = self
            .driver
            .call_executor("test-loop", "test-coverage", prompt, COVERAGE_SCHEMA, tier)
            .await?;
        let coverage: CoverageVerdict = parse_payload("test-loop", &result)?;

        let outcome = match coverage.verdict {
            CoverageDecision::Adequate => {
                self.driver.ui.loop_iteration(
                    "test",
                    self.iteration,
                    self.max,
                    "suite green, coverage adequate",
                );
                CheckOutcome::Terminal
            }
            CoverageDecision::NoTestableChanges => {
                self.driver.ui.loop_iteration(
                    "test",
                    self.iteration,
                    self.max,
                    "suite green, nothing testable changed",
                );
                CheckOutcome::Terminal
            }
            CoverageDecision::Gaps => {
                self.driver.ui.loop_iteration(
                    "test",
                    self.iteration,
                    self.max,
                    "suite green, coverage gaps",
                );
                CheckOutcome::Continue {
                    feedback: format!(
                        "The suite passes but coverage is missing: {}",
                        fallback(coverage.feedback, "no detail given")
                    ),
                }
            }
        };
        self.driver
            .announce(&format!(
                "Test iteration {}: {}.",
                self.iteration,
                match &outcome {
                    CheckOutcome::Terminal => "suite green, coverage accepted",
                    _ => "suite green, coverage gaps",
                }
            ))
            .await;
        Ok(outcome)
    }

    async fn fix(&mut self, feedback: &str) -> Result<(), EngineError> {
        let prompt = format!(
            "{}\n\nMake the test suite pass and close any named coverage \
             gaps:\n\n{feedback}\n\nFix the code or the tests, whichever is \
             wrong; add the missing tests.",
            self.driver.preamble()
        );
        let tier = self.driver.resolve_tier("test-fix", "");
        let result = self
            .driver
            .call_executor("test-loop", "test-fix", prompt, WORK_SCHEMA, tier)
            .await?;
        let _: WorkReport = parse_payload("test-loop", &result)?;
        Ok(())
    }
}

// ==================== pr-review (after publish) ====================

/// Dual-verdict review of the opened PR. Goal fit and code quality must
/// both approve; the fix step also pushes, so the PR under review is
/// always the pushed branch.
pub struct PrReviewSteps<'a> {
    driver: &'a mut WorkflowDriver,
    pr_number: u64,
    max: u32,
    iteration: u32,
}

impl<'a> PrReviewSteps<'a> {
    pub fn new(driver: &'a mut WorkflowDriver, pr_number: u64) -> Self {
        let max = driver.config.limits.max_pr_review_iterations;
        Self {
            driver,
            pr_number,
            max,
            iteration: 0,
        }
    }
}

#[async_trait]
impl ConvergenceSteps for PrReviewSteps<'_> {
    fn kind(&self) -> LoopKind {
        LoopKind::PrReview
    }

    fn bump_counter(&mut self) -> u32 {
        self.driver.state.bump_loop_counter(LoopKind::PrReview)
    }

    async fn check(&mut self) -> Result<CheckOutcome, EngineError> {
        self.iteration += 1;
        let prompt = format!(
            "{}\n\nReview PR #{} as a whole. Give two verdicts: goalVerdict, \
             whether the PR actually resolves the issue it claims to close, \
             and codeVerdict, whether the changes meet the project's quality \
             bar. Approve both only when the PR is ready to merge.",
            self.driver.preamble(),
            self.pr_number
        );
        let tier = self.driver.resolve_tier("pr-review", "");
        let result = self
            .driver
            .call_executor("pr-review", "pr-review", prompt, PR_REVIEW_SCHEMA, tier)
            .await?;
        let review: PrReviewVerdict = parse_payload("pr-review", &result)?;
        self.driver.save()?;

        let goal = verdict_word(review.goal_verdict);
        let code = verdict_word(review.code_verdict);
        self.driver.ui.loop_iteration(
            "pr-review",
            self.iteration,
            self.max,
            &format!("goal {goal}, code {code}"),
        );
        self.driver
            .announce_pr(&format!(
                "PR review iteration {}: goal {goal}, code {code}.",
                self.iteration
            ))
            .await;

        if review.goal_verdict == ApproveRevise::Approve
            && review.code_verdict == ApproveRevise::Approve
        {
            return Ok(CheckOutcome::Terminal);
        }
        Ok(CheckOutcome::Continue {
            feedback: format!(
                "goal verdict: {goal}; code verdict: {code}. {}",
                fallback(review.feedback, "reviewer requested changes without detail")
            ),
        })
    }

    async fn fix(&mut self, feedback: &str) -> Result<(), EngineError> {
        let prompt = format!(
            "{}\n\nAddress this PR review feedback on PR #{}:\n\n{feedback}\n\n\
             Edit the checkout directly.",
            self.driver.preamble(),
            self.pr_number
        );
        let tier = self.driver.resolve_tier("pr-review-fix", "");
        let result = self
            .driver
            .call_executor("pr-review", "pr-review-fix", prompt, WORK_SCHEMA, tier)
            .await?;
        let _: WorkReport = parse_payload("pr-review", &result)?;

        {
            let tree = self.driver.worktree()?;
            if tree
                .is_dirty()
                .map_err(|e| stage_err("pr-review", format!("{e:#}")))?
            {
                tree.commit_all("Address PR review feedback")
                    .map_err(|e| stage_err("pr-review", format!("{e:#}")))?;
            }
        }
        self.driver
            .tracker
            .push_branch(&self.driver.state.branch)
            .await
            .map_err(|e| stage_err("pr-review", format!("{e:#}")))?;
        Ok(())
    }
}

fn verdict_word(v: ApproveRevise) -> &'static str {
    match v {
        ApproveRevise::Approve => "approve",
        ApproveRevise::Revise => "revise",
    }
}

fn fallback(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn first_nonempty(primary: String, secondary: String) -> String {
    if primary.trim().is_empty() {
        secondary
    } else {
        primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_verdict_parses_all_three_decisions() {
        let v: ReviewVerdict =
            serde_json::from_str(r#"{"verdict": "approve"}"#).unwrap();
        assert_eq!(v.verdict, ReviewDecision::Approve);
        assert!(v.feedback.is_empty());

        let v: ReviewVerdict =
            serde_json::from_str(r#"{"verdict": "revise", "feedback": "rename the helper"}"#)
                .unwrap();
        assert_eq!(v.verdict, ReviewDecision::Revise);
        assert_eq!(v.feedback, "rename the helper");

        let v: ReviewVerdict =
            serde_json::from_str(r#"{"verdict": "reject", "reason": "wrong layer"}"#).unwrap();
        assert_eq!(v.verdict, ReviewDecision::Reject);
        assert_eq!(v.reason, "wrong layer");
    }

    #[test]
    fn test_coverage_verdict_uses_snake_case() {
        let v: CoverageVerdict =
            serde_json::from_str(r#"{"verdict": "no_testable_changes"}"#).unwrap();
        assert_eq!(v.verdict, CoverageDecision::NoTestableChanges);

        let v: CoverageVerdict =
            serde_json::from_str(r#"{"verdict": "gaps", "feedback": "error paths untested"}"#)
                .unwrap();
        assert_eq!(v.verdict, CoverageDecision::Gaps);
    }

    #[test]
    fn test_pr_review_verdict_uses_camel_case_keys() {
        let v: PrReviewVerdict = serde_json::from_str(
            r#"{"goalVerdict": "approve", "codeVerdict": "revise", "feedback": "split the commit"}"#,
        )
        .unwrap();
        assert_eq!(v.goal_verdict, ApproveRevise::Approve);
        assert_eq!(v.code_verdict, ApproveRevise::Revise);
        assert_eq!(v.feedback, "split the commit");
    }

    #[test]
    fn test_fallback_covers_blank_feedback() {
        assert_eq!(fallback("  ".into(), "default"), "default");
        assert_eq!(fallback("real".into(), "default"), "real");
        assert_eq!(first_nonempty("".into(), "second".into()), "second");
        assert_eq!(first_nonempty("first".into(), "second".into()), "first");
    }
}

//! The implement stage: planned tasks executed sequentially, each with a
//! bounded attempt cycle.
//!
//! One attempt is an implementation pass followed by the quality
//! convergence loop. A rejected review aborts the loop, costs the task an
//! attempt, and feeds the rejection into the next attempt's prompt. A
//! task that exhausts its attempts is marked failed and the run moves on;
//! only executor failures and a tripped quality cap stop the stage.

use crate::convergence::{LoopOutcome, run_convergence_loop};
use crate::driver::loops::QualitySteps;
use crate::driver::stages::{WORK_SCHEMA, WorkReport};
use crate::driver::{WorkflowDriver, parse_payload, stage_err};
use crate::errors::EngineError;
use crate::state::TaskStatus;
use crate::tier::Tier;

/// How one task's attempt cycle ended. `Failed` is a recorded outcome,
/// not an error; the stage keeps going.
pub(crate) enum TaskOutcome {
    Completed,
    Failed { reason: String },
}

impl WorkflowDriver {
    pub(crate) async fn stage_implement(&mut self) -> Result<(), EngineError> {
        if self.state.tasks.is_empty() {
            return Err(stage_err("implement", "no tasks recorded by plan"));
        }
        let total = self.state.tasks.len();
        // snapshot up front; the cycle needs &mut self
        let pending: Vec<(usize, u32, String, Tier)> = self
            .state
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            .map(|(i, t)| (i + 1, t.id, t.description.clone(), t.executor_tier))
            .collect();

        for (position, id, description, tier) in pending {
            let tier = self.config.tier_override.unwrap_or(tier);
            self.ui.task_start(position, total, &description);
            self.state.begin_task(id);
            self.save()?;

            match self.run_task_cycle(id, &description, tier).await? {
                TaskOutcome::Completed => {
                    self.state.finish_task(id, TaskStatus::Completed);
                    let done = self.state.completed_task_count();
                    self.state.set_task_progress("implement", done, total);
                    self.save()?;
                    self.ui.task_complete(id);
                    self.log_event(&format!("task {id} completed"));
                    self.announce(&format!("Task {id} completed ({done}/{total}): {description}"))
                        .await;
                }
                TaskOutcome::Failed { reason } => {
                    self.state.finish_task(id, TaskStatus::Failed);
                    let done = self.state.completed_task_count();
                    self.state.set_task_progress("implement", done, total);
                    self.save()?;
                    self.ui.task_failed(id, &reason);
                    self.log_event(&format!("task {id} failed: {reason}"));
                    self.announce(&format!(
                        "Task {id} did not pass review and is left for follow-up: {reason}"
                    ))
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Up to `task_attempt_cap` implement-then-review attempts for one
    /// task. Returns the recorded outcome; propagates only failures that
    /// must stop the run.
    async fn run_task_cycle(
        &mut self,
        id: u32,
        description: &str,
        tier: Tier,
    ) -> Result<TaskOutcome, EngineError> {
        let cap = self.config.limits.task_attempt_cap;
        let max_quality = self.config.limits.max_quality_iterations;
        let mut rejection: Option<String> = None;

        for attempt in 1..=cap {
            let mut prompt = format!(
                "{}\n\nImplement task {id}: {description}\n\nMake the change \
                 directly in the checkout, following the project's \
                 conventions. The full plan is in {}/tasks.json.",
                self.preamble(),
                self.context_dir().display()
            );
            if let Some(reason) = &rejection {
                prompt.push_str(&format!(
                    "\n\nA previous attempt was rejected in review:\n{reason}\n\
                     Take a different approach."
                ));
            }
            let stage_id = format!("implement-task-{id}");
            let result = self
                .call_executor("implement", &stage_id, prompt, WORK_SCHEMA, tier)
                .await?;
            let _: WorkReport = parse_payload("implement", &result)?;

            let outcome = {
                let mut steps = QualitySteps::new(self, id, description);
                run_convergence_loop(&mut steps, max_quality, |_, _| {}).await?
            };
            match outcome {
                LoopOutcome::Converged { .. } => return Ok(TaskOutcome::Completed),
                LoopOutcome::Aborted { reason } => {
                    if let Some(task) = self.state.task_mut(id) {
                        task.review_attempts += 1;
                    }
                    self.save()?;
                    self.ui
                        .note(&format!("task {id} attempt {attempt}/{cap} rejected: {reason}"));
                    rejection = Some(reason);
                }
            }
        }

        Ok(TaskOutcome::Failed {
            reason: rejection.unwrap_or_else(|| "review rejected every attempt".to_string()),
        })
    }
}

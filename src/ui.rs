//! Terminal output for a workflow run, rendered via `indicatif`.
//!
//! Two elements are stacked: a stage bar tracking progress through the
//! fixed stage sequence, and a spinner that animates while an executor
//! call or convergence iteration is in flight. Everything else is printed
//! as styled lines through the `MultiProgress` so bars and text never
//! interleave badly.

use console::{Emoji, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::state::WorkflowState;
use crate::util::format_duration_secs;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");

pub struct WorkflowUi {
    multi: MultiProgress,
    stage_bar: ProgressBar,
    spinner: ProgressBar,
}

impl WorkflowUi {
    pub fn new(total_stages: u64) -> Self {
        let multi = MultiProgress::new();

        let stage_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let stage_bar = multi.add(ProgressBar::new(total_stages));
        stage_bar.set_style(stage_style);
        stage_bar.set_prefix("Stages");

        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(spinner_style);
        spinner.set_prefix("  Work");

        Self {
            multi,
            stage_bar,
            spinner,
        }
    }

    /// Print through the multiplexer, falling back to `eprintln!` when the
    /// rich terminal is unavailable.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn banner(&self, issue_ref: &str, branch: &str, run_id: &str) {
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
        self.print_line(format!(
            "{} conveyor run for {} on {}",
            style("▶").green().bold(),
            style(issue_ref).yellow().bold(),
            style(branch).cyan()
        ));
        self.print_line(format!("{}  {}", style("Run:").dim(), run_id));
        self.print_line(format!("{}", style("═".repeat(70)).cyan()));
    }

    pub fn resume_banner(&self, summary: &str) {
        self.print_line(format!(
            "{} Resuming {}",
            style("↻").cyan().bold(),
            summary
        ));
    }

    pub fn stage_start(&self, stage: &str, description: &str) {
        self.stage_bar
            .set_message(format!("{}: {}", style(stage).yellow(), description));
        self.print_line("");
        self.print_line(format!(
            "{} Stage {}: {}",
            style("▶").green().bold(),
            style(stage).yellow().bold(),
            description
        ));
    }

    pub fn stage_complete(&self, stage: &str) {
        self.stage_bar.inc(1);
        self.print_line(format!("{} Stage {} complete", CHECK, style(stage).green()));
    }

    pub fn stage_skipped(&self, stage: &str, reason: &str) {
        self.stage_bar.inc(1);
        self.print_line(format!(
            "{} Stage {} skipped ({})",
            SKIP,
            style(stage).dim(),
            style(reason).dim()
        ));
    }

    pub fn stage_failed(&self, stage: &str, reason: &str) {
        self.print_line(format!(
            "{} Stage {} failed: {}",
            CROSS,
            style(stage).red().bold(),
            reason
        ));
    }

    /// Spin while an executor invocation is in flight.
    pub fn executor_start(&self, stage_id: &str, model: &str) {
        self.spinner.set_message(format!(
            "{} {}",
            style(stage_id).cyan(),
            style(format!("({model})")).dim()
        ));
        self.spinner.enable_steady_tick(Duration::from_millis(100));
    }

    pub fn executor_done(&self, stage_id: &str, elapsed: Duration) {
        self.spinner.disable_steady_tick();
        self.spinner.set_message(format!(
            "{} done in {}",
            style(stage_id).cyan(),
            style(format_duration_secs(elapsed.as_secs())).dim()
        ));
    }

    pub fn loop_iteration(&self, kind: &str, iteration: u32, max: u32, msg: &str) {
        self.print_line(format!(
            "  {} {} iteration {}/{}: {}",
            style("↻").cyan(),
            kind,
            style(iteration).cyan(),
            max,
            style(msg).dim()
        ));
    }

    pub fn task_start(&self, position: usize, total: usize, description: &str) {
        self.print_line(format!(
            "  {} Task {}/{}: {}",
            style("•").cyan(),
            position,
            total,
            description
        ));
    }

    pub fn task_complete(&self, id: u32) {
        self.print_line(format!("  {} Task {} complete", CHECK, style(id).green()));
    }

    pub fn task_failed(&self, id: u32, reason: &str) {
        self.print_line(format!(
            "  {} Task {} failed after exhausting review attempts: {}",
            CROSS,
            style(id).red().bold(),
            reason
        ));
    }

    pub fn blocked(&self, concerns: &[String]) {
        self.print_line(format!(
            "{} {}",
            BLOCKER,
            style("Evaluation found blocking concerns:").red().bold()
        ));
        for concern in concerns {
            self.print_line(format!("    {} {}", style("-").red(), concern));
        }
    }

    pub fn note(&self, msg: &str) {
        self.print_line(format!("  {}", style(msg).dim()));
    }

    pub fn completion_summary(&self, state: &WorkflowState) {
        self.spinner.finish_and_clear();
        self.stage_bar.finish_and_clear();
        self.print_line("");
        self.print_line(format!(
            "{} Workflow {} for {}",
            SPARKLE,
            style(state.state.to_string()).green().bold(),
            style(&state.issue_ref).yellow()
        ));
        if !state.tasks.is_empty() {
            self.print_line(format!(
                "  {} {}/{} tasks completed",
                style("Tasks:").dim(),
                style(state.completed_task_count()).green(),
                state.tasks.len()
            ));
            for task in state.failed_tasks() {
                self.print_line(format!(
                    "    {} task {} left for follow-up: {}",
                    CROSS,
                    task.id,
                    style(&task.description).dim()
                ));
            }
        }
        if let Some(pr) = state.stage("publish").and_then(|s| s.pr_number) {
            self.print_line(format!("  {} #{pr}", style("PR:").dim()));
        }
        self.print_line(format!("  {} {}", style("Log dir:").dim(), state.log_dir));
    }
}

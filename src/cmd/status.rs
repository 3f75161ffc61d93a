//! Human-readable dump of the persisted status document.

use std::path::PathBuf;

use console::style;
use conveyor::config::EngineConfig;
use conveyor::driver::STAGE_SEQUENCE;
use conveyor::errors::EngineError;
use conveyor::state::{RunState, StageStatus, StatusStore, TaskStatus, WorkflowState};

pub fn cmd_status(project_dir: PathBuf, status_file: Option<PathBuf>) -> Result<(), EngineError> {
    let config = EngineConfig::load(project_dir, status_file)
        .map_err(|e| EngineError::Config(format!("{e:#}")))?;
    let store = StatusStore::new(&config.status_path);
    let Some(state) = store.load()? else {
        println!();
        println!("No workflow status at {}", config.status_path.display());
        println!("Start one with 'conveyor run <issue-ref>'.");
        println!();
        return Ok(());
    };

    println!();
    println!("Conveyor Workflow Status");
    println!("========================");
    println!();
    println!("Issue:   {}", state.issue_ref);
    println!("State:   {}", styled_state(state.state));
    let branch = if state.branch.is_empty() {
        "(not created yet)"
    } else {
        &state.branch
    };
    println!("Branch:  {branch} (base {})", state.base_branch);
    println!("Run:     {}", state.run_id);
    println!("Stage:   {}", state.current_stage);
    println!();

    println!("Stages:");
    for (name, _) in STAGE_SEQUENCE {
        println!("  {name:<12} {}", stage_line(&state, name));
    }

    if !state.tasks.is_empty() {
        println!();
        println!(
            "Tasks ({}/{} completed):",
            state.completed_task_count(),
            state.tasks.len()
        );
        for task in &state.tasks {
            let marker = match task.status {
                TaskStatus::Pending => "pending",
                TaskStatus::InProgress => "in progress",
                TaskStatus::Completed => "done",
                TaskStatus::Failed => "failed",
            };
            let attempts = if task.review_attempts > 0 {
                format!(" ({} rejected attempts)", task.review_attempts)
            } else {
                String::new()
            };
            println!("  {:>3}. [{marker}] {}{attempts}", task.id, task.description);
        }
    }

    println!();
    println!(
        "Loops:   quality {}, test {}, pr-review {}",
        state.quality_iterations, state.test_iterations, state.pr_review_iterations
    );
    println!(
        "Updated: {}",
        state.last_update.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();
    Ok(())
}

fn styled_state(state: RunState) -> String {
    let text = state.to_string();
    match state {
        RunState::Completed => style(text).green().to_string(),
        RunState::Running | RunState::Initializing => style(text).cyan().to_string(),
        _ => style(text).red().to_string(),
    }
}

fn stage_line(state: &WorkflowState, name: &str) -> String {
    let Some(record) = state.stage(name) else {
        return "pending".to_string();
    };
    let mut text = match record.status {
        StageStatus::Pending => "pending".to_string(),
        StageStatus::InProgress => "in progress".to_string(),
        StageStatus::Completed if record.skipped => {
            style("skipped").dim().to_string()
        }
        StageStatus::Completed => "completed".to_string(),
    };
    if let Some(progress) = &record.task_progress {
        text.push_str(&format!(" ({progress} tasks)"));
    }
    if let Some(iteration) = record.iteration {
        text.push_str(&format!(" ({iteration} iterations)"));
    }
    if let Some(pr) = record.pr_number {
        text.push_str(&format!(" (PR #{pr})"));
    }
    text
}

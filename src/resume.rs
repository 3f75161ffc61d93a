//! Resume validation and context reconstruction.
//!
//! A resume never re-executes completed work: the driver walks the same
//! stage sequence and skips anything the restored document marks
//! completed. This module only decides whether the document is fit to
//! resume from and hands it back untouched, counters included.

use std::path::Path;

use crate::errors::EngineError;
use crate::state::{MIRROR_FILE_NAME, RunState, StatusStore, WorkflowState};
use crate::worktree::Worktree;

/// A validated status document ready to hand to the driver.
#[derive(Debug)]
pub struct ResumeContext {
    pub state: WorkflowState,
}

impl ResumeContext {
    /// One-line description for the resume announcement.
    pub fn summary(&self) -> String {
        format!(
            "{} at stage '{}' (loops: quality {}, test {}, pr-review {})",
            self.state.issue_ref,
            self.state.current_stage,
            self.state.quality_iterations,
            self.state.test_iterations,
            self.state.pr_review_iterations,
        )
    }
}

/// Validate the status document at `status_path` for resumption.
pub fn prepare_resume(status_path: &Path) -> Result<ResumeContext, EngineError> {
    let store = StatusStore::new(status_path);
    let state = match store.load() {
        Ok(Some(state)) => state,
        Ok(None) => {
            return Err(EngineError::ResumeValidation {
                reason: format!("status file {} does not exist", status_path.display()),
            });
        }
        Err(err) => {
            return Err(EngineError::ResumeValidation {
                reason: format!("{err:#}"),
            });
        }
    };
    validate(&state)?;
    Ok(ResumeContext { state })
}

/// Resume from a run's log directory instead of the primary status file,
/// using the mirror copy the store refreshes on every save.
pub fn prepare_resume_from_log_dir(log_dir: &Path) -> Result<ResumeContext, EngineError> {
    if !log_dir.is_dir() {
        return Err(EngineError::ResumeValidation {
            reason: format!("log directory {} does not exist", log_dir.display()),
        });
    }
    prepare_resume(&log_dir.join(MIRROR_FILE_NAME))
}

fn validate(state: &WorkflowState) -> Result<(), EngineError> {
    if state.state == RunState::Completed {
        return Err(EngineError::ResumeValidation {
            reason: "run already completed; start a new run instead".to_string(),
        });
    }

    require("issueRef", &state.issue_ref)?;
    require("branch", &state.branch)?;
    require("workingTreePath", &state.working_tree_path)?;
    require("currentStage", &state.current_stage)?;
    require("logDir", &state.log_dir)?;

    let tree_path = Path::new(&state.working_tree_path);
    if !Worktree::is_checkout(tree_path) {
        return Err(EngineError::ResumeValidation {
            reason: format!(
                "workingTreePath {} is not a git checkout",
                tree_path.display()
            ),
        });
    }
    Ok(())
}

fn require(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::ResumeValidation {
            reason: format!("status document is missing {field}"),
        });
    }
    Ok(())
}

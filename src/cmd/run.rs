//! The run command: acquire the lock, build or resume a driver, drive
//! the workflow to a terminal state.

use std::path::{Path, PathBuf};

use conveyor::config::EngineConfig;
use conveyor::driver::WorkflowDriver;
use conveyor::errors::EngineError;
use conveyor::lock::RunLock;
use conveyor::resume::{ResumeContext, prepare_resume, prepare_resume_from_log_dir};
use conveyor::state::StatusStore;
use conveyor::tier::Tier;
use conveyor::tracker::IssueRef;

#[allow(clippy::too_many_arguments)]
pub async fn cmd_run(
    project_dir: PathBuf,
    status_file: Option<PathBuf>,
    issue_ref: &str,
    base: &str,
    tier: Option<&str>,
    resume: bool,
    resume_from_log_dir: Option<&Path>,
) -> Result<(), EngineError> {
    let tier = tier
        .map(|raw| raw.parse::<Tier>())
        .transpose()
        .map_err(|e| EngineError::Config(e.to_string()))?;
    let config = EngineConfig::load(project_dir, status_file)
        .map_err(|e| EngineError::Config(format!("{e:#}")))?
        .with_tier_override(tier);
    config.ensure_directories()?;

    let lock = RunLock::acquire(&config.lock_path)?;
    let outcome = drive(config, issue_ref, base, resume, resume_from_log_dir).await;
    lock.release();
    outcome
}

async fn drive(
    config: EngineConfig,
    issue_ref: &str,
    base: &str,
    resume: bool,
    resume_from_log_dir: Option<&Path>,
) -> Result<(), EngineError> {
    let requested: IssueRef = issue_ref
        .parse()
        .map_err(|e: anyhow::Error| EngineError::Config(e.to_string()))?;

    let driver = if let Some(dir) = resume_from_log_dir {
        let ctx = prepare_resume_from_log_dir(dir)?;
        check_issue_matches(&ctx, &requested)?;
        println!("Resuming {}", ctx.summary());
        WorkflowDriver::resume(config, ctx)?
    } else if resume {
        let ctx = prepare_resume(&config.status_path)?;
        check_issue_matches(&ctx, &requested)?;
        println!("Resuming {}", ctx.summary());
        WorkflowDriver::resume(config, ctx)?
    } else {
        if StatusStore::new(&config.status_path).exists() {
            return Err(EngineError::Config(format!(
                "a status document already exists at {}; continue it with --resume \
                 or clear it with 'conveyor reset'",
                config.status_path.display()
            )));
        }
        WorkflowDriver::new_run(config, requested, base)?
    };

    driver.run().await.map(|_| ())
}

/// The issue on the command line must match the one in the resumed
/// document: same number, and same repo when both name one.
fn check_issue_matches(ctx: &ResumeContext, requested: &IssueRef) -> Result<(), EngineError> {
    let recorded: IssueRef = match ctx.state.issue_ref.parse() {
        Ok(parsed) => parsed,
        // an unparseable issueRef fails later in resume validation
        Err(_) => return Ok(()),
    };
    let repo_matches = match (&recorded.repo, &requested.repo) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    };
    if recorded.number == requested.number && repo_matches {
        Ok(())
    } else {
        Err(EngineError::ResumeValidation {
            reason: format!(
                "status document is for issue {}, not {requested}",
                ctx.state.issue_ref
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor::state::WorkflowState;

    fn ctx_for(issue_ref: &str) -> ResumeContext {
        ResumeContext {
            state: WorkflowState::new(issue_ref, "main", "run-1", "/tmp/run-1"),
        }
    }

    #[test]
    fn test_issue_match_ignores_reference_form() {
        let requested: IssueRef = "123".parse().unwrap();
        assert!(check_issue_matches(&ctx_for("#123"), &requested).is_ok());
        assert!(check_issue_matches(&ctx_for("octo/repo#123"), &requested).is_ok());
    }

    #[test]
    fn test_issue_match_rejects_a_different_issue() {
        let requested: IssueRef = "124".parse().unwrap();
        let err = check_issue_matches(&ctx_for("#123"), &requested).unwrap_err();
        assert!(err.to_string().contains("not #124"));

        let requested: IssueRef = "other/repo#123".parse().unwrap();
        let err = check_issue_matches(&ctx_for("octo/repo#123"), &requested).unwrap_err();
        assert!(err.to_string().contains("octo/repo#123"));
    }
}

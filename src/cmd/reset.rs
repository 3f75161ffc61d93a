//! Clear the recorded workflow so a fresh run can start.
//!
//! Removes the status document and its lock. Run logs under
//! `.conveyor/runs/` are history and stay; `--resume-from-log-dir` can
//! still revive a run from its mirror after a reset.

use std::path::PathBuf;

use dialoguer::Confirm;

use conveyor::config::EngineConfig;
use conveyor::errors::EngineError;
use conveyor::lock;
use conveyor::state::StatusStore;

pub fn cmd_reset(
    project_dir: PathBuf,
    status_file: Option<PathBuf>,
    force: bool,
) -> Result<(), EngineError> {
    let config = EngineConfig::load(project_dir, status_file)
        .map_err(|e| EngineError::Config(format!("{e:#}")))?;
    let store = StatusStore::new(&config.status_path);

    if !store.exists() && !config.lock_path.exists() {
        println!("Nothing to reset at {}", config.status_path.display());
        return Ok(());
    }

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will discard the recorded workflow state. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    store.remove()?;
    match lock::force_remove(&config.lock_path) {
        Ok(Some(pid)) => println!("Removed lock held by pid {pid}"),
        Ok(None) => {}
        Err(err) => eprintln!("conveyor: could not remove lock: {err:#}"),
    }
    println!("Reset complete");
    Ok(())
}

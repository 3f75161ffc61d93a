use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Issue-to-PR workflow engine driving an external coding executor")]
pub struct Cli {
    /// Project checkout to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Status document path (defaults to .conveyor/status.json)
    #[arg(long, global = true)]
    pub status_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive an issue through the full workflow to an open, reviewed PR
    Run {
        /// Issue to work on: 123, #123, or owner/repo#123
        issue_ref: String,

        /// Base branch the work branch is cut from
        #[arg(long, default_value = "main")]
        base: String,

        /// Force one executor tier (light, standard, advanced) for every stage
        #[arg(long)]
        tier: Option<String>,

        /// Continue the run recorded in the status document
        #[arg(long, conflicts_with = "resume_from_log_dir")]
        resume: bool,

        /// Continue a run from the status mirror in its log directory
        #[arg(long, value_name = "DIR")]
        resume_from_log_dir: Option<PathBuf>,
    },
    /// Show the persisted workflow status
    Status,
    /// Delete the status document and lock so a fresh run can start
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

/// Exit codes: 0 success, 1 failure or blocked, 2 iteration cap,
/// 3 argument/config/lock/resume problems.
#[tokio::main]
async fn main() {
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let code = if err.use_stderr() { 3 } else { 0 };
        let _ = err.print();
        std::process::exit(code);
    });

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(err) => {
                eprintln!("conveyor: cannot determine current directory: {err}");
                std::process::exit(3);
            }
        },
    };

    let result = match &cli.command {
        Commands::Run {
            issue_ref,
            base,
            tier,
            resume,
            resume_from_log_dir,
        } => {
            cmd::cmd_run(
                project_dir,
                cli.status_file.clone(),
                issue_ref,
                base,
                tier.as_deref(),
                *resume,
                resume_from_log_dir.as_deref(),
            )
            .await
        }
        Commands::Status => cmd::cmd_status(project_dir, cli.status_file.clone()),
        Commands::Reset { force } => cmd::cmd_reset(project_dir, cli.status_file.clone(), *force),
    };

    if let Err(err) = result {
        eprintln!("conveyor: {err}");
        std::process::exit(err.exit_code());
    }
}

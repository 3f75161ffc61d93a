//! The bounded convergence loop.
//!
//! One algorithm serves quality refinement, test fixing, and PR-review
//! fixing: run a review-style check; if it is not terminal, run a fix
//! step with the check's feedback and go again, up to a hard cap. The
//! cap is a circuit breaker, not a retry policy: exceeding it fails the
//! whole run with a loop-specific terminal state so operators can tell a
//! quality deadlock from a test deadlock from a review deadlock.
//!
//! The controller never special-cases which loop it is running. All
//! variation lives behind [`ConvergenceSteps`]: what "check" means, what
//! counts as terminal, and how feedback is applied.

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::state::RunState;

/// Which convergence loop is running. Selects the persisted counter and
/// the terminal state used when the cap trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Quality,
    Test,
    PrReview,
}

impl LoopKind {
    /// The workflow state recorded when this loop fails to converge.
    pub fn terminal_state(&self) -> RunState {
        match self {
            LoopKind::Quality => RunState::MaxIterationsQuality,
            LoopKind::Test => RunState::MaxIterationsTest,
            LoopKind::PrReview => RunState::MaxIterationsPrReview,
        }
    }
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopKind::Quality => write!(f, "quality"),
            LoopKind::Test => write!(f, "test"),
            LoopKind::PrReview => write!(f, "pr-review"),
        }
    }
}

/// What one check pass observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Converged; the loop ends successfully.
    Terminal,
    /// Not converged; the feedback drives one fix step.
    Continue { feedback: String },
    /// This attempt cannot be fixed into convergence (a reject verdict).
    /// The loop ends; the caller decides what an aborted attempt costs.
    Abort { reason: String },
}

/// How a loop ended, short of the cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Converged { iterations: u32 },
    Aborted { reason: String },
}

/// Strategy object for one loop use. `check` and `fix` are where the
/// three uses differ; the controller supplies the iteration discipline.
#[async_trait]
pub trait ConvergenceSteps {
    fn kind(&self) -> LoopKind;

    /// Advance the per-loop-type global counter. Called once per pass,
    /// before the cap check, and never reset within a run.
    fn bump_counter(&mut self) -> u32;

    async fn check(&mut self) -> Result<CheckOutcome, EngineError>;

    async fn fix(&mut self, feedback: &str) -> Result<(), EngineError>;
}

/// Run one bounded convergence loop to completion.
///
/// `on_iteration` is a side-channel reporting hook invoked after each
/// non-terminal pass with the iteration number and the feedback that
/// drove the fix.
pub async fn run_convergence_loop<S, F>(
    steps: &mut S,
    max_iterations: u32,
    mut on_iteration: F,
) -> Result<LoopOutcome, EngineError>
where
    S: ConvergenceSteps + Send,
    F: FnMut(u32, &str) + Send,
{
    let kind = steps.kind();
    let mut iteration = 0u32;
    loop {
        iteration += 1;
        steps.bump_counter();
        if iteration > max_iterations {
            return Err(EngineError::IterationCap {
                kind,
                cap: max_iterations,
            });
        }
        match steps.check().await? {
            CheckOutcome::Terminal => {
                return Ok(LoopOutcome::Converged {
                    iterations: iteration,
                });
            }
            CheckOutcome::Continue { feedback } => {
                steps.fix(&feedback).await?;
                on_iteration(iteration, &feedback);
            }
            CheckOutcome::Abort { reason } => return Ok(LoopOutcome::Aborted { reason }),
        }
    }
}

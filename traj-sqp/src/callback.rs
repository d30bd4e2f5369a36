//! Per-iteration callbacks.

use tracing::info;
use traj_qp::QpProblem;

use crate::results::SqpResults;

/// Invoked after every accepted step; returning `false` stops the run.
pub trait SqpCallback: Send {
    /// Observe the problem and results. Return `false` to cancel.
    fn execute(&mut self, problem: &QpProblem, results: &SqpResults) -> bool;
}

impl<F> SqpCallback for F
where
    F: FnMut(&QpProblem, &SqpResults) -> bool + Send,
{
    fn execute(&mut self, problem: &QpProblem, results: &SqpResults) -> bool {
        self(problem, results)
    }
}

/// Logs a one-line summary of every accepted step through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationLogger;

impl SqpCallback for IterationLogger {
    fn execute(&mut self, _problem: &QpProblem, results: &SqpResults) -> bool {
        info!(
            iteration = results.overall_iteration,
            penalty = results.penalty_iteration,
            merit = results.best_exact_merit,
            max_violation = results.max_constraint_violation(),
            box_size = results.box_size.max(),
            "accepted step"
        );
        true
    }
}

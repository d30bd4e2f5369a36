//! Solver status and per-run bookkeeping.

use nalgebra::DVector;

/// Terminal and intermediate solver states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqpStatus {
    /// The solver is still iterating.
    Running,
    /// Converged: predicted improvement vanished and constraints hold.
    NlpConverged,
    /// The overall QP-solve budget ran out.
    IterationLimit,
    /// The wall-clock budget ran out.
    OptTimeLimit,
    /// Constraints stayed violated through every penalty escalation.
    PenaltyIterationLimit,
    /// The QP backend failed past the retry ladder.
    QpSolverError,
    /// A callback requested termination.
    CallbackStopped,
}

impl SqpStatus {
    /// Whether the best iterate is still a useful (best-effort) answer.
    #[must_use]
    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            Self::NlpConverged
                | Self::IterationLimit
                | Self::OptTimeLimit
                | Self::PenaltyIterationLimit
        )
    }
}

/// Rolling results of one SQP run.
///
/// `best_*` always refers to the last accepted iterate; `new_*` refers to
/// the most recent QP candidate, accepted or not. The `approx` family is
/// evaluated on the frozen convex model, the rest on the exact problem.
#[derive(Debug, Clone)]
pub struct SqpResults {
    /// Best accepted variable values.
    pub best_var_vals: DVector<f64>,
    /// Most recent QP candidate values.
    pub new_var_vals: DVector<f64>,

    /// Exact merit at the best iterate.
    pub best_exact_merit: f64,
    /// Exact merit at the candidate.
    pub new_exact_merit: f64,
    /// Convex-model merit at the best iterate.
    pub best_approx_merit: f64,
    /// Convex-model merit at the candidate.
    pub new_approx_merit: f64,

    /// Per-cost exact values at the best iterate.
    pub best_costs: DVector<f64>,
    /// Per-cost exact values at the candidate.
    pub new_costs: DVector<f64>,
    /// Per-cost convex values at the best iterate.
    pub best_approx_costs: DVector<f64>,
    /// Per-cost convex values at the candidate.
    pub new_approx_costs: DVector<f64>,

    /// Per-row exact violations at the best iterate.
    pub best_constraint_violations: DVector<f64>,
    /// Per-row exact violations at the candidate.
    pub new_constraint_violations: DVector<f64>,
    /// Per-row convex violations at the best iterate.
    pub best_approx_constraint_violations: DVector<f64>,
    /// Per-row convex violations at the candidate.
    pub new_approx_constraint_violations: DVector<f64>,

    /// Predicted merit improvement of the candidate.
    pub approx_merit_improve: f64,
    /// Realized merit improvement of the candidate.
    pub exact_merit_improve: f64,
    /// `exact_merit_improve / approx_merit_improve`.
    pub merit_improve_ratio: f64,

    /// Per-row merit coefficients.
    pub merit_error_coeffs: DVector<f64>,
    /// Per-variable trust-region half-widths.
    pub box_size: DVector<f64>,

    /// QP solves across the whole run.
    pub overall_iteration: usize,
    /// Index of the current penalty escalation.
    pub penalty_iteration: usize,
    /// Convexification rounds within the current penalty iteration.
    pub convexify_iteration: usize,
    /// Trust-region steps within the current convexification round.
    pub trust_region_iteration: usize,
}

impl SqpResults {
    /// Zero-initialized results for a problem of the given sizes.
    #[must_use]
    pub fn new(num_vars: usize, num_cnt_rows: usize, num_costs: usize) -> Self {
        Self {
            best_var_vals: DVector::zeros(num_vars),
            new_var_vals: DVector::zeros(num_vars),
            best_exact_merit: 0.0,
            new_exact_merit: 0.0,
            best_approx_merit: 0.0,
            new_approx_merit: 0.0,
            best_costs: DVector::zeros(num_costs),
            new_costs: DVector::zeros(num_costs),
            best_approx_costs: DVector::zeros(num_costs),
            new_approx_costs: DVector::zeros(num_costs),
            best_constraint_violations: DVector::zeros(num_cnt_rows),
            new_constraint_violations: DVector::zeros(num_cnt_rows),
            best_approx_constraint_violations: DVector::zeros(num_cnt_rows),
            new_approx_constraint_violations: DVector::zeros(num_cnt_rows),
            approx_merit_improve: 0.0,
            exact_merit_improve: 0.0,
            merit_improve_ratio: 0.0,
            merit_error_coeffs: DVector::zeros(num_cnt_rows),
            box_size: DVector::zeros(num_vars),
            overall_iteration: 0,
            penalty_iteration: 0,
            convexify_iteration: 0,
            trust_region_iteration: 0,
        }
    }

    /// Largest exact violation at the best iterate (0 when unconstrained).
    #[must_use]
    pub fn max_constraint_violation(&self) -> f64 {
        if self.best_constraint_violations.is_empty() {
            0.0
        } else {
            self.best_constraint_violations.max()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_effort_statuses() {
        assert!(SqpStatus::NlpConverged.is_best_effort());
        assert!(SqpStatus::PenaltyIterationLimit.is_best_effort());
        assert!(!SqpStatus::QpSolverError.is_best_effort());
        assert!(!SqpStatus::CallbackStopped.is_best_effort());
    }

    #[test]
    fn test_max_violation_of_unconstrained_problem() {
        let results = SqpResults::new(3, 0, 1);
        assert!(results.max_constraint_violation() == 0.0);
    }
}

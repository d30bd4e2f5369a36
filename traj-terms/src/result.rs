//! Optimization entry point and result reporting.

use tracing::info;
use traj_qp::AdmmQpSolver;
use traj_sqp::{SqpCallback, SqpParams, SqpStatus, TrustRegionSqpSolver};
use traj_types::TrajArray;

use crate::problem::{ConvexSolverKind, TrajProblem};

/// Final trajectory plus named per-term reporting.
#[derive(Debug, Clone)]
pub struct TrajResult {
    /// The optimized trajectory matrix.
    pub traj: TrajArray,
    /// Cost names, aligned with `cost_vals`.
    pub cost_names: Vec<String>,
    /// Exact per-cost values at the final trajectory.
    pub cost_vals: Vec<f64>,
    /// Constraint row names, aligned with `cnt_viols`.
    pub cnt_names: Vec<String>,
    /// Exact per-row violations at the final trajectory.
    pub cnt_viols: Vec<f64>,
    /// Terminal solver status.
    pub status: SqpStatus,
    /// Total QP solves.
    pub overall_iterations: usize,
    /// Penalty escalations performed.
    pub penalty_iterations: usize,
}

/// Solve a constructed problem and report the outcome.
pub fn optimize_problem(
    prob: &mut TrajProblem,
    params: &SqpParams,
    callbacks: Vec<Box<dyn SqpCallback>>,
) -> TrajResult {
    let backend = match prob.convex_solver() {
        ConvexSolverKind::BuiltinAdmm => Box::new(AdmmQpSolver::new()),
    };
    let mut solver = TrustRegionSqpSolver::with_params(backend, params.clone());
    for callback in callbacks {
        solver.register_callback(callback);
    }

    let status = solver.solve(prob.qp_mut());
    let x = prob.qp().variable_values();
    let cost_vals: Vec<f64> = prob.qp().evaluate_exact_costs(&x).iter().copied().collect();
    let cnt_viols: Vec<f64> = prob
        .qp()
        .evaluate_exact_constraint_violations(&x)
        .iter()
        .copied()
        .collect();

    info!(
        ?status,
        iterations = solver.results().overall_iteration,
        max_violation = solver.results().max_constraint_violation(),
        "optimization finished"
    );

    TrajResult {
        traj: prob.to_traj_array(&x),
        cost_names: prob.qp().cost_names(),
        cost_vals,
        cnt_names: prob.qp().constraint_row_names(),
        cnt_viols,
        status,
        overall_iterations: solver.results().overall_iteration,
        penalty_iterations: solver.results().penalty_iteration,
    }
}

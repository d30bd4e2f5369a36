//! The trust-region SQP solver.

use std::time::Instant;

use nalgebra::DVector;
use tracing::{debug, error, info, warn};
use traj_qp::{QpProblem, QpSolver};

use crate::callback::SqpCallback;
use crate::params::SqpParams;
use crate::results::{SqpResults, SqpStatus};

/// Trust-region SQP solver over a [`QpProblem`].
///
/// Owns the QP backend and the run's [`SqpResults`]; the problem is borrowed
/// for the duration of [`solve`](Self::solve) and left at the best accepted
/// iterate when the run terminates.
pub struct TrustRegionSqpSolver {
    qp_solver: Box<dyn QpSolver>,
    /// Solver parameters, adjustable between runs.
    pub params: SqpParams,
    callbacks: Vec<Box<dyn SqpCallback>>,
    status: SqpStatus,
    results: SqpResults,
}

impl TrustRegionSqpSolver {
    /// Create a solver around a QP backend with default parameters.
    #[must_use]
    pub fn new(qp_solver: Box<dyn QpSolver>) -> Self {
        Self::with_params(qp_solver, SqpParams::default())
    }

    /// Create a solver with explicit parameters.
    #[must_use]
    pub fn with_params(qp_solver: Box<dyn QpSolver>, params: SqpParams) -> Self {
        Self {
            qp_solver,
            params,
            callbacks: Vec::new(),
            status: SqpStatus::Running,
            results: SqpResults::new(0, 0, 0),
        }
    }

    /// Register a callback invoked after every accepted step.
    pub fn register_callback(&mut self, callback: Box<dyn SqpCallback>) {
        self.callbacks.push(callback);
    }

    /// The status of the last run.
    #[must_use]
    pub fn status(&self) -> SqpStatus {
        self.status
    }

    /// The results of the last run.
    #[must_use]
    pub fn results(&self) -> &SqpResults {
        &self.results
    }

    /// Run the optimization to a terminal status.
    pub fn solve(&mut self, problem: &mut QpProblem) -> SqpStatus {
        self.status = SqpStatus::Running;
        let start = Instant::now();
        self.init(problem);

        'penalty: for penalty_iteration in 0..self.params.max_merit_coeff_increases {
            self.results.penalty_iteration = penalty_iteration;
            self.results.convexify_iteration = 0;

            for _ in 1..100 {
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed > self.params.max_time {
                    info!(elapsed, max = self.params.max_time, "time limit exceeded");
                    self.status = SqpStatus::OptTimeLimit;
                    break;
                }
                if self.results.overall_iteration >= self.params.max_iterations {
                    info!("iteration limit");
                    self.status = SqpStatus::IterationLimit;
                    break;
                }
                if self.step(problem) {
                    break;
                }
            }

            if matches!(
                self.status,
                SqpStatus::QpSolverError | SqpStatus::CallbackStopped
            ) {
                break 'penalty;
            }

            if self.constraints_satisfied() {
                self.status = SqpStatus::NlpConverged;
                break;
            }

            if matches!(
                self.status,
                SqpStatus::IterationLimit | SqpStatus::OptTimeLimit
            ) {
                break;
            }

            self.status = SqpStatus::Running;
            self.adjust_penalty(problem);
        }

        if self.status == SqpStatus::Running {
            self.status = SqpStatus::PenaltyIterationLimit;
            warn!("penalty iteration limit; constraints could not all be satisfied");
        }

        problem.set_variables(&self.results.best_var_vals);
        self.status
    }

    fn init(&mut self, problem: &mut QpProblem) {
        let num_vars = problem.num_nlp_vars();
        let num_cnt_rows = problem.num_nlp_constraint_rows();
        let num_costs = problem.num_nlp_costs();
        self.results = SqpResults::new(num_vars, num_cnt_rows, num_costs);
        self.results.best_var_vals = problem.variable_values();
        self.results.merit_error_coeffs =
            DVector::from_element(num_cnt_rows, self.params.initial_merit_error_coeff);

        self.results.best_costs = problem.evaluate_exact_costs(&self.results.best_var_vals);
        self.results.best_constraint_violations =
            problem.evaluate_exact_constraint_violations(&self.results.best_var_vals);

        self.set_uniform_box(problem, self.params.initial_trust_box_size);
        self.merit_coeff_changed(problem);
    }

    fn set_uniform_box(&mut self, problem: &mut QpProblem, size: f64) {
        problem.set_box_size(DVector::from_element(problem.num_nlp_vars(), size));
        self.results.box_size = problem.box_size().clone();
    }

    /// Push the merit coefficients into the problem and refresh the best
    /// exact merit, which depends on them.
    fn merit_coeff_changed(&mut self, problem: &mut QpProblem) {
        if problem
            .set_constraint_merit_coeff(self.results.merit_error_coeffs.clone())
            .is_err()
        {
            warn!("merit coefficient length mismatch");
        }
        self.results.best_exact_merit = self.results.best_costs.sum()
            + self
                .results
                .best_constraint_violations
                .dot(&self.results.merit_error_coeffs);
    }

    fn constraints_satisfied(&self) -> bool {
        if self.results.best_constraint_violations.is_empty() {
            debug!("no constraints to satisfy");
            return true;
        }
        self.results.max_constraint_violation() < self.params.cnt_tolerance
    }

    fn adjust_penalty(&mut self, problem: &mut QpProblem) {
        if self.params.inflate_constraints_individually {
            for idx in 0..self.results.best_constraint_violations.len() {
                if self.results.best_constraint_violations[idx] > self.params.cnt_tolerance {
                    debug!(row = idx, "escalating merit coefficient");
                    self.results.merit_error_coeffs[idx] *= self.params.merit_coeff_increase_ratio;
                }
            }
        } else {
            debug!("escalating merit coefficients uniformly");
            self.results.merit_error_coeffs *= self.params.merit_coeff_increase_ratio;
        }
        let floor = self.params.min_trust_box_size / self.params.trust_shrink_ratio * 1.5;
        let size = self.results.box_size.max().max(floor);
        self.set_uniform_box(problem, size);
        self.merit_coeff_changed(problem);
    }

    /// One convexification round. Returns `true` when the enclosing loop
    /// should stop (converged or terminal failure).
    fn step(&mut self, problem: &mut QpProblem) -> bool {
        self.results.convexify_iteration += 1;

        if let Err(err) = problem.convexify() {
            warn!(%err, "convexification failed; shrinking trust region");
            problem.scale_box_size(self.params.trust_shrink_ratio);
            self.results.box_size = problem.box_size().clone();
            if self.results.box_size.max() < self.params.min_trust_box_size {
                debug!("trust region collapsed while recovering from numeric error");
                self.status = SqpStatus::NlpConverged;
                return true;
            }
            return false;
        }

        self.qp_solver.clear();
        if self
            .qp_solver
            .init(problem.num_qp_vars(), problem.num_qp_cnts())
            .is_err()
        {
            error!("QP backend rejected the problem dimensions");
            self.status = SqpStatus::QpSolverError;
            return true;
        }
        let ready = match (
            problem.hessian(),
            problem.gradient(),
            problem.constraint_matrix(),
            problem.bounds_lower(),
            problem.bounds_upper(),
        ) {
            (Ok(h), Ok(g), Ok(a), Ok(l), Ok(u)) => {
                self.qp_solver.update_hessian(h);
                self.qp_solver.update_gradient(g);
                self.qp_solver.update_linear_constraints_matrix(a);
                self.qp_solver.update_bounds(&l, &u);
                true
            }
            _ => false,
        };
        if !ready {
            error!("convex model unavailable after convexify");
            self.status = SqpStatus::QpSolverError;
            return true;
        }

        self.run_trust_region_loop(problem);

        if matches!(
            self.status,
            SqpStatus::NlpConverged | SqpStatus::QpSolverError | SqpStatus::CallbackStopped
        ) {
            return true;
        }

        if self.results.box_size.max() < self.params.min_trust_box_size {
            debug!("converged because trust region is tiny");
            self.status = SqpStatus::NlpConverged;
            return true;
        }
        false
    }

    fn update_solver_bounds(&mut self, problem: &QpProblem) {
        self.results.box_size = problem.box_size().clone();
        if let (Ok(lower), Ok(upper)) = (problem.bounds_lower(), problem.bounds_upper()) {
            self.qp_solver.update_bounds(&lower, &upper);
        }
    }

    fn run_trust_region_loop(&mut self, problem: &mut QpProblem) {
        self.results.trust_region_iteration = 0;
        let num_vars = problem.num_nlp_vars();
        let mut qp_solver_failures = 0usize;

        while self.results.box_size.max() >= self.params.min_trust_box_size {
            self.results.overall_iteration += 1;
            self.results.trust_region_iteration += 1;

            let new_x = match self.qp_solver.solve() {
                Ok(x) => x,
                Err(err) => {
                    qp_solver_failures += 1;
                    warn!(
                        %err,
                        failures = qp_solver_failures,
                        max = self.params.max_qp_solver_failures,
                        "convex solver failed"
                    );
                    if qp_solver_failures < self.params.max_qp_solver_failures {
                        problem.scale_box_size(self.params.trust_shrink_ratio);
                        self.update_solver_bounds(problem);
                        debug!(box_size = self.results.box_size.max(), "shrunk trust region");
                        continue;
                    }
                    if qp_solver_failures == self.params.max_qp_solver_failures {
                        problem.set_box_size(DVector::from_element(
                            num_vars,
                            self.params.min_trust_box_size,
                        ));
                        self.update_solver_bounds(problem);
                        debug!("trust region clamped to minimum for a final attempt");
                        continue;
                    }
                    error!("the convex solver failed one too many times");
                    self.status = SqpStatus::QpSolverError;
                    return;
                }
            };

            // The backend returns NLP variables plus slacks; only the NLP
            // block is the candidate step.
            let new_vals =
                DVector::from_iterator(num_vars, new_x.iter().take(num_vars).copied());

            let (approx_costs, approx_viols) = match (
                problem.evaluate_convex_costs(&new_vals),
                problem.evaluate_convex_constraint_violations(&new_vals),
            ) {
                (Ok(c), Ok(v)) => (c, v),
                _ => {
                    error!("convex model unavailable during evaluation");
                    self.status = SqpStatus::QpSolverError;
                    return;
                }
            };

            self.results.new_var_vals = new_vals;
            self.results.new_approx_costs = approx_costs;
            self.results.new_approx_constraint_violations = approx_viols;
            self.results.new_approx_merit = self.results.new_approx_costs.sum()
                + self
                    .results
                    .new_approx_constraint_violations
                    .dot(&self.results.merit_error_coeffs);
            self.results.approx_merit_improve =
                self.results.best_exact_merit - self.results.new_approx_merit;

            self.results.new_costs = problem.evaluate_exact_costs(&self.results.new_var_vals);
            self.results.new_constraint_violations =
                problem.evaluate_exact_constraint_violations(&self.results.new_var_vals);
            self.results.new_exact_merit = self.results.new_costs.sum()
                + self
                    .results
                    .new_constraint_violations
                    .dot(&self.results.merit_error_coeffs);
            self.results.exact_merit_improve =
                self.results.best_exact_merit - self.results.new_exact_merit;

            if self.results.approx_merit_improve < -1e-5 {
                warn!(
                    approx_improve = self.results.approx_merit_improve,
                    "approximate merit got worse; convexification is inconsistent at zeroth order"
                );
            }

            if self.results.approx_merit_improve < self.params.min_approx_improve {
                debug!(
                    approx_improve = self.results.approx_merit_improve,
                    threshold = self.params.min_approx_improve,
                    "converged: predicted improvement is small"
                );
                self.status = SqpStatus::NlpConverged;
                return;
            }
            if self.results.approx_merit_improve / self.results.best_exact_merit
                < self.params.min_approx_improve_frac
            {
                debug!("converged: predicted relative improvement is small");
                self.status = SqpStatus::NlpConverged;
                return;
            }

            self.results.merit_improve_ratio =
                self.results.exact_merit_improve / self.results.approx_merit_improve;

            if self.results.exact_merit_improve < 0.0
                || self.results.merit_improve_ratio < self.params.improve_ratio_threshold
            {
                problem.scale_box_size(self.params.trust_shrink_ratio);
                self.update_solver_bounds(problem);
                debug!(box_size = self.results.box_size.max(), "shrunk trust region");
            } else {
                self.results.best_var_vals = self.results.new_var_vals.clone();
                self.results.best_exact_merit = self.results.new_exact_merit;
                self.results.best_costs = self.results.new_costs.clone();
                self.results.best_constraint_violations =
                    self.results.new_constraint_violations.clone();
                self.results.best_approx_merit = self.results.new_approx_merit;
                self.results.best_approx_costs = self.results.new_approx_costs.clone();
                self.results.best_approx_constraint_violations =
                    self.results.new_approx_constraint_violations.clone();

                problem.set_variables(&self.results.best_var_vals);
                problem.scale_box_size(self.params.trust_expand_ratio);
                self.update_solver_bounds(problem);
                debug!(
                    box_size = self.results.box_size.max(),
                    merit = self.results.best_exact_merit,
                    "accepted step; expanded trust region"
                );

                let mut keep_going = true;
                for callback in &mut self.callbacks {
                    keep_going &= callback.execute(problem, &self.results);
                }
                if !keep_going {
                    self.status = SqpStatus::CallbackStopped;
                    return;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use std::sync::{Arc, Mutex};
    use traj_qp::{
        AdmmQpSolver, ConstraintKind, ConstraintTerm, CostTerm, CscMatrix, PenaltyKind,
        QpSolverError, TermFn,
    };

    /// `v = x[indices] - target`, identity Jacobian.
    struct Offset {
        indices: Vec<usize>,
        target: Vec<f64>,
    }

    impl TermFn for Offset {
        fn name(&self) -> &str {
            "offset"
        }
        fn num_values(&self) -> usize {
            self.indices.len()
        }
        fn indices(&self) -> &[usize] {
            &self.indices
        }
        fn values(&self, x: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                self.indices.len(),
                self.indices
                    .iter()
                    .enumerate()
                    .map(|(r, &i)| x[i] - self.target[r]),
            )
        }
        fn jacobian(&self, _x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::identity(self.indices.len(), self.indices.len())
        }
    }

    fn scalar_problem(start: f64, target: f64) -> QpProblem {
        let mut prob = QpProblem::new();
        prob.add_variable_set(vec!["x".to_owned()], DVector::from_vec(vec![start]))
            .unwrap();
        prob.add_cost(CostTerm::new(
            Box::new(Offset {
                indices: vec![0],
                target: vec![target],
            }),
            PenaltyKind::Squared,
            1.0,
        ))
        .unwrap();
        prob.setup();
        prob
    }

    #[test]
    fn test_converges_on_scalar_quadratic() {
        let mut prob = scalar_problem(0.0, 3.0);
        let mut solver = TrustRegionSqpSolver::new(Box::new(AdmmQpSolver::new()));
        let status = solver.solve(&mut prob);

        assert_eq!(status, SqpStatus::NlpConverged);
        assert_relative_eq!(solver.results().best_var_vals[0], 3.0, epsilon = 0.05);
    }

    #[test]
    fn test_merit_never_increases_on_accepted_steps() {
        let merits: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&merits);

        let mut prob = scalar_problem(-2.0, 4.0);
        let mut solver = TrustRegionSqpSolver::new(Box::new(AdmmQpSolver::new()));
        solver.register_callback(Box::new(move |_: &QpProblem, r: &SqpResults| {
            sink.lock().unwrap().push(r.best_exact_merit);
            true
        }));
        let status = solver.solve(&mut prob);
        assert_eq!(status, SqpStatus::NlpConverged);

        let merits = merits.lock().unwrap();
        assert!(merits.len() > 1);
        for pair in merits.windows(2) {
            assert!(pair[1] < pair[0] + 1e-12);
        }
    }

    #[test]
    fn test_box_size_stays_within_bounds() {
        let mut prob = scalar_problem(0.0, 2.0);
        let mut solver = TrustRegionSqpSolver::new(Box::new(AdmmQpSolver::new()));
        let boxes: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&boxes);
        solver.register_callback(Box::new(move |_: &QpProblem, r: &SqpResults| {
            sink.lock().unwrap().push(r.box_size.max());
            true
        }));
        solver.solve(&mut prob);

        let expand = solver.params.trust_expand_ratio;
        let initial = solver.params.initial_trust_box_size;
        for (k, &b) in boxes.lock().unwrap().iter().enumerate() {
            assert!(b >= solver.params.min_trust_box_size);
            assert!(b <= initial * expand.powi(k as i32 + 1) + 1e-12);
        }
    }

    #[test]
    fn test_callback_stop() {
        let mut prob = scalar_problem(0.0, 10.0);
        let mut solver = TrustRegionSqpSolver::new(Box::new(AdmmQpSolver::new()));
        solver.register_callback(Box::new(|_: &QpProblem, _: &SqpResults| false));
        let status = solver.solve(&mut prob);
        assert_eq!(status, SqpStatus::CallbackStopped);
    }

    #[test]
    fn test_penalty_escalation_on_unreachable_constraint() {
        // x is pinned at 0 while an equality constraint wants x = 5: the
        // violation can never shrink, so every escalation fires.
        let mut prob = QpProblem::new();
        prob.add_variable_set(vec!["x".to_owned()], DVector::zeros(1))
            .unwrap();
        prob.pin_variable(0, 0.0);
        prob.add_constraint(ConstraintTerm::new(
            Box::new(Offset {
                indices: vec![0],
                target: vec![5.0],
            }),
            ConstraintKind::Equality,
            1.0,
        ))
        .unwrap();
        prob.setup();

        let mut params = SqpParams::default();
        params.initial_merit_error_coeff = 1.0;
        params.merit_coeff_increase_ratio = 10.0;
        params.max_merit_coeff_increases = 3;
        let mut solver = TrustRegionSqpSolver::with_params(Box::new(AdmmQpSolver::new()), params);
        let status = solver.solve(&mut prob);

        assert_eq!(status, SqpStatus::PenaltyIterationLimit);
        assert!(solver.results().max_constraint_violation() > solver.params.cnt_tolerance);
        // Three escalations of a single violated row: 1 -> 10 -> 100 -> 1000.
        assert_relative_eq!(
            solver.results().merit_error_coeffs[0],
            1000.0,
            epsilon = 1e-9
        );
    }

    /// Backend that fails a set number of solves, then returns zeros.
    struct FlakySolver {
        failures_left: usize,
        bound_widths: Arc<Mutex<Vec<f64>>>,
        num_vars: usize,
        lower: DVector<f64>,
        upper: DVector<f64>,
    }

    impl QpSolver for FlakySolver {
        fn init(&mut self, num_vars: usize, num_cnts: usize) -> Result<(), QpSolverError> {
            self.num_vars = num_vars;
            self.lower = DVector::zeros(num_cnts);
            self.upper = DVector::zeros(num_cnts);
            Ok(())
        }
        fn update_hessian(&mut self, _h: &CscMatrix<f64>) {}
        fn update_gradient(&mut self, _g: &DVector<f64>) {}
        fn update_linear_constraints_matrix(&mut self, _a: &CscMatrix<f64>) {}
        fn update_bounds(&mut self, lower: &DVector<f64>, upper: &DVector<f64>) {
            self.lower = lower.clone();
            self.upper = upper.clone();
            // Row 0 is the box row of the single NLP variable.
            self.bound_widths
                .lock()
                .unwrap()
                .push((upper[0] - lower[0]) / 2.0);
        }
        fn solve(&mut self) -> Result<DVector<f64>, QpSolverError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(QpSolverError::MaxIterations);
            }
            Ok(DVector::zeros(self.num_vars))
        }
        fn clear(&mut self) {}
    }

    #[test]
    fn test_qp_failure_ladder() {
        let widths: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let mut prob = scalar_problem(0.0, 1.0);
        let solver_backend = FlakySolver {
            failures_left: 3,
            bound_widths: Arc::clone(&widths),
            num_vars: 0,
            lower: DVector::zeros(0),
            upper: DVector::zeros(0),
        };
        let mut solver = TrustRegionSqpSolver::new(Box::new(solver_backend));
        let status = solver.solve(&mut prob);

        // The post-failure zero step has zero predicted improvement, which
        // reads as convergence.
        assert_eq!(status, SqpStatus::NlpConverged);

        let widths = widths.lock().unwrap();
        // Initial box, two shrinks, then the clamp to the minimum.
        assert!(widths.len() >= 4);
        assert_relative_eq!(widths[0], 0.1, epsilon = 1e-9);
        assert_relative_eq!(widths[1], 0.01, epsilon = 1e-9);
        assert_relative_eq!(widths[2], 0.001, epsilon = 1e-9);
        assert_relative_eq!(widths[3], 1e-4, epsilon = 1e-9);
    }

    #[test]
    fn test_exhausted_failure_ladder_is_terminal() {
        let widths: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let mut prob = scalar_problem(0.0, 1.0);
        let solver_backend = FlakySolver {
            failures_left: usize::MAX,
            bound_widths: Arc::clone(&widths),
            num_vars: 0,
            lower: DVector::zeros(0),
            upper: DVector::zeros(0),
        };
        let mut solver = TrustRegionSqpSolver::new(Box::new(solver_backend));
        let status = solver.solve(&mut prob);
        assert_eq!(status, SqpStatus::QpSolverError);
    }
}

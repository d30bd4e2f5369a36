//! The QP backend contract and the built-in ADMM solver.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CscMatrix;
use thiserror::Error;
use tracing::debug;

/// Failures reported by a QP backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QpSolverError {
    /// The bounds are contradictory (`l > u` somewhere).
    #[error("QP is primal infeasible")]
    Infeasible,

    /// The iteration budget was exhausted far from optimality.
    #[error("QP solver hit its iteration limit")]
    MaxIterations,

    /// A non-finite value appeared during the solve.
    #[error("QP solver produced non-finite values")]
    NonFinite,

    /// `solve` was called before `init` or after `clear`.
    #[error("QP solver is not initialized")]
    NotInitialized,

    /// Problem data sizes disagree.
    #[error("QP data dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Narrow contract over an external convex QP solver.
///
/// The problem form is `min 1/2 x^T H x + g^T x` subject to
/// `l <= A x <= u`. Within one SQP run the sparsity patterns of `H` and `A`
/// never change between updates; implementations may rely on that.
pub trait QpSolver: Send {
    /// Prepare for a problem with `num_vars` variables and `num_cnts` rows.
    fn init(&mut self, num_vars: usize, num_cnts: usize) -> Result<(), QpSolverError>;

    /// Replace the Hessian values.
    fn update_hessian(&mut self, hessian: &CscMatrix<f64>);

    /// Replace the gradient.
    fn update_gradient(&mut self, gradient: &DVector<f64>);

    /// Replace the linear-constraint matrix values.
    fn update_linear_constraints_matrix(&mut self, a: &CscMatrix<f64>);

    /// Replace the row bounds.
    fn update_bounds(&mut self, lower: &DVector<f64>, upper: &DVector<f64>);

    /// Solve the current problem.
    fn solve(&mut self) -> Result<DVector<f64>, QpSolverError>;

    /// Drop all problem data.
    fn clear(&mut self);
}

/// Tuning knobs for [`AdmmQpSolver`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdmmSettings {
    /// Dual step size.
    pub rho: f64,
    /// Primal regularization added to the KKT diagonal.
    pub sigma: f64,
    /// Iteration budget.
    pub max_iterations: usize,
    /// Absolute residual tolerance.
    pub eps_abs: f64,
    /// Relative residual tolerance.
    pub eps_rel: f64,
    /// Residual level still accepted when the budget runs out.
    pub eps_accept: f64,
}

impl Default for AdmmSettings {
    fn default() -> Self {
        Self {
            rho: 0.1,
            sigma: 1e-6,
            max_iterations: 10_000,
            eps_abs: 1e-7,
            eps_rel: 1e-7,
            eps_accept: 1e-4,
        }
    }
}

enum Factorization {
    Cholesky(nalgebra::Cholesky<f64, nalgebra::Dyn>),
    Lu(nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>),
}

impl Factorization {
    fn solve(&self, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        match self {
            Self::Cholesky(chol) => Some(chol.solve(rhs)),
            Self::Lu(lu) => lu.solve(rhs),
        }
    }
}

/// Operator-splitting (ADMM) QP solver with a dense factorization.
///
/// Follows the OSQP iteration: an `x` update through the regularized KKT
/// system `(H + sigma I + rho A^T A)`, a `z` update by projection onto
/// `[l, u]`, and a scaled dual update. The dense Cholesky (with LU
/// fallback) is a good fit for the small programs produced by trajectory
/// problems; larger deployments can swap in a sparse backend through the
/// [`QpSolver`] trait.
pub struct AdmmQpSolver {
    settings: AdmmSettings,
    num_vars: usize,
    num_cnts: usize,
    hessian: DMatrix<f64>,
    gradient: DVector<f64>,
    a_mat: DMatrix<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
    initialized: bool,
    // Warm start carried across solves (and across clear/init cycles, which
    // the SQP loop performs every convexification). Dropped on size change.
    warm_x: Option<DVector<f64>>,
    warm_y: Option<DVector<f64>>,
}

fn to_dense(matrix: &CscMatrix<f64>, rows: usize, cols: usize) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(rows, cols);
    for (r, c, v) in matrix.triplet_iter() {
        dense[(r, c)] += *v;
    }
    dense
}

impl AdmmQpSolver {
    /// Create a solver with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(AdmmSettings::default())
    }

    /// Create a solver with explicit settings.
    #[must_use]
    pub fn with_settings(settings: AdmmSettings) -> Self {
        Self {
            settings,
            num_vars: 0,
            num_cnts: 0,
            hessian: DMatrix::zeros(0, 0),
            gradient: DVector::zeros(0),
            a_mat: DMatrix::zeros(0, 0),
            lower: DVector::zeros(0),
            upper: DVector::zeros(0),
            initialized: false,
            warm_x: None,
            warm_y: None,
        }
    }

    fn factorize(&self) -> Factorization {
        let rho = self.settings.rho;
        let sigma = self.settings.sigma;
        let mut kkt = self.hessian.clone();
        kkt += DMatrix::identity(self.num_vars, self.num_vars) * sigma;
        kkt += self.a_mat.transpose() * &self.a_mat * rho;
        match kkt.clone().cholesky() {
            Some(chol) => Factorization::Cholesky(chol),
            None => Factorization::Lu(kkt.lu()),
        }
    }
}

impl Default for AdmmQpSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl QpSolver for AdmmQpSolver {
    fn init(&mut self, num_vars: usize, num_cnts: usize) -> Result<(), QpSolverError> {
        self.num_vars = num_vars;
        self.num_cnts = num_cnts;
        self.hessian = DMatrix::zeros(num_vars, num_vars);
        self.gradient = DVector::zeros(num_vars);
        self.a_mat = DMatrix::zeros(num_cnts, num_vars);
        self.lower = DVector::from_element(num_cnts, f64::NEG_INFINITY);
        self.upper = DVector::from_element(num_cnts, f64::INFINITY);
        self.initialized = true;
        Ok(())
    }

    fn update_hessian(&mut self, hessian: &CscMatrix<f64>) {
        self.hessian = to_dense(hessian, self.num_vars, self.num_vars);
    }

    fn update_gradient(&mut self, gradient: &DVector<f64>) {
        self.gradient = gradient.clone();
    }

    fn update_linear_constraints_matrix(&mut self, a: &CscMatrix<f64>) {
        self.a_mat = to_dense(a, self.num_cnts, self.num_vars);
    }

    fn update_bounds(&mut self, lower: &DVector<f64>, upper: &DVector<f64>) {
        self.lower = lower.clone();
        self.upper = upper.clone();
    }

    fn solve(&mut self) -> Result<DVector<f64>, QpSolverError> {
        if !self.initialized {
            return Err(QpSolverError::NotInitialized);
        }
        if self.gradient.len() != self.num_vars
            || self.lower.len() != self.num_cnts
            || self.upper.len() != self.num_cnts
        {
            return Err(QpSolverError::DimensionMismatch(format!(
                "vars {}, cnts {}",
                self.num_vars, self.num_cnts
            )));
        }
        for i in 0..self.num_cnts {
            if self.lower[i] > self.upper[i] + 1e-12 {
                return Err(QpSolverError::Infeasible);
            }
        }

        let rho = self.settings.rho;
        let sigma = self.settings.sigma;
        let factorization = self.factorize();

        let mut x = match &self.warm_x {
            Some(w) if w.len() == self.num_vars => w.clone(),
            _ => DVector::zeros(self.num_vars),
        };
        let mut y = match &self.warm_y {
            Some(w) if w.len() == self.num_cnts => w.clone(),
            _ => DVector::zeros(self.num_cnts),
        };
        // Start z at the projection of A x so equality rows begin consistent.
        let mut z = &self.a_mat * &x;
        for i in 0..self.num_cnts {
            z[i] = z[i].clamp(self.lower[i], self.upper[i]);
        }

        let mut last_prim = f64::INFINITY;
        let mut last_dual = f64::INFINITY;
        for iteration in 0..self.settings.max_iterations {
            let rhs = sigma * &x - &self.gradient + self.a_mat.transpose() * (rho * &z - &y);
            let x_new = factorization
                .solve(&rhs)
                .ok_or(QpSolverError::NonFinite)?;
            let ax = &self.a_mat * &x_new;

            let mut z_new = &ax + &y / rho;
            for i in 0..self.num_cnts {
                z_new[i] = z_new[i].clamp(self.lower[i], self.upper[i]);
            }
            y += rho * (&ax - &z_new);

            let r_prim = (&ax - &z_new).amax();
            let r_dual = rho * (self.a_mat.transpose() * (&z_new - &z)).amax();
            last_prim = r_prim;
            last_dual = r_dual;

            x = x_new;
            z = z_new;

            let scale = ax.amax().max(z.amax()).max(1.0);
            let eps = self.settings.eps_abs + self.settings.eps_rel * scale;
            if r_prim <= eps && r_dual <= eps {
                if !x.iter().all(|v| v.is_finite()) {
                    return Err(QpSolverError::NonFinite);
                }
                debug!(iteration, r_prim, r_dual, "ADMM converged");
                self.warm_x = Some(x.clone());
                self.warm_y = Some(y);
                return Ok(x);
            }
        }

        if !x.iter().all(|v| v.is_finite()) {
            self.warm_x = None;
            self.warm_y = None;
            return Err(QpSolverError::NonFinite);
        }
        if last_prim <= self.settings.eps_accept && last_dual <= self.settings.eps_accept {
            debug!(last_prim, last_dual, "ADMM accepted at loose tolerance");
            self.warm_x = Some(x.clone());
            self.warm_y = Some(y);
            return Ok(x);
        }
        Err(QpSolverError::MaxIterations)
    }

    fn clear(&mut self) {
        self.initialized = false;
        self.num_vars = 0;
        self.num_cnts = 0;
        self.hessian = DMatrix::zeros(0, 0);
        self.gradient = DVector::zeros(0);
        self.a_mat = DMatrix::zeros(0, 0);
        self.lower = DVector::zeros(0);
        self.upper = DVector::zeros(0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra_sparse::CooMatrix;

    fn csc_from(entries: &[(usize, usize, f64)], rows: usize, cols: usize) -> CscMatrix<f64> {
        let mut coo = CooMatrix::new(rows, cols);
        for &(r, c, v) in entries {
            coo.push(r, c, v);
        }
        CscMatrix::from(&coo)
    }

    #[test]
    fn test_box_constrained_scalar() {
        // min (x - 3)^2 s.t. 0 <= x <= 2 -> x = 2.
        let mut solver = AdmmQpSolver::new();
        solver.init(1, 1).expect("init");
        solver.update_hessian(&csc_from(&[(0, 0, 2.0)], 1, 1));
        solver.update_gradient(&DVector::from_vec(vec![-6.0]));
        solver.update_linear_constraints_matrix(&csc_from(&[(0, 0, 1.0)], 1, 1));
        solver.update_bounds(
            &DVector::from_vec(vec![0.0]),
            &DVector::from_vec(vec![2.0]),
        );

        let x = solver.solve().expect("solvable");
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_equality_constrained_pair() {
        // min x^2 + y^2 s.t. x + y = 1 -> (0.5, 0.5).
        let mut solver = AdmmQpSolver::new();
        solver.init(2, 3).expect("init");
        solver.update_hessian(&csc_from(&[(0, 0, 2.0), (1, 1, 2.0)], 2, 2));
        solver.update_gradient(&DVector::zeros(2));
        solver.update_linear_constraints_matrix(&csc_from(
            &[(0, 0, 1.0), (0, 1, 1.0), (1, 0, 1.0), (2, 1, 1.0)],
            3,
            2,
        ));
        solver.update_bounds(
            &DVector::from_vec(vec![1.0, -10.0, -10.0]),
            &DVector::from_vec(vec![1.0, 10.0, 10.0]),
        );

        let x = solver.solve().expect("solvable");
        assert_relative_eq!(x[0], 0.5, epsilon = 1e-4);
        assert_relative_eq!(x[1], 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_crossed_bounds_are_infeasible() {
        let mut solver = AdmmQpSolver::new();
        solver.init(1, 1).expect("init");
        solver.update_hessian(&csc_from(&[(0, 0, 2.0)], 1, 1));
        solver.update_gradient(&DVector::zeros(1));
        solver.update_linear_constraints_matrix(&csc_from(&[(0, 0, 1.0)], 1, 1));
        solver.update_bounds(
            &DVector::from_vec(vec![1.0]),
            &DVector::from_vec(vec![-1.0]),
        );

        assert_eq!(solver.solve(), Err(QpSolverError::Infeasible));
    }

    #[test]
    fn test_solve_before_init_fails() {
        let mut solver = AdmmQpSolver::new();
        assert_eq!(solver.solve(), Err(QpSolverError::NotInitialized));

        solver.init(1, 0).expect("init");
        solver.clear();
        assert_eq!(solver.solve(), Err(QpSolverError::NotInitialized));
    }
}

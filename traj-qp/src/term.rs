//! Term functions and their cost/constraint wrappers.

use nalgebra::{DMatrix, DVector};

/// Finite-difference step matching the reference implementation.
pub(crate) const FINITE_DIFF_STEP: f64 = 1e-8;

/// A differentiable mapping from a variable slice to a value vector.
///
/// `values` receives the full flat variable vector and reads the entries
/// named by `indices`; `jacobian` returns a dense `num_values x
/// indices.len()` block ordered like `indices`. Implementations without an
/// analytic Jacobian can delegate to [`forward_difference_jacobian`].
pub trait TermFn: Send + Sync {
    /// Human-readable term name, used in reports and error messages.
    fn name(&self) -> &str;

    /// Number of rows this term produces.
    fn num_values(&self) -> usize;

    /// Flat variable indices this term reads, in Jacobian column order.
    fn indices(&self) -> &[usize];

    /// Evaluate the term at the full variable vector `x`.
    fn values(&self, x: &DVector<f64>) -> DVector<f64>;

    /// Jacobian block (`num_values x indices.len()`) at `x`.
    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64>;
}

/// Compute a term Jacobian by forward differencing its `values`.
///
/// Uses the fixed step `1e-8`; the reference acceptance tests depend on the
/// exact step, so callers must not tune it.
#[must_use]
pub fn forward_difference_jacobian(
    term: &dyn TermFn,
    x: &DVector<f64>,
) -> DMatrix<f64> {
    let base = term.values(x);
    let indices = term.indices();
    let mut jac = DMatrix::zeros(base.len(), indices.len());
    let mut xp = x.clone();
    for (col, &idx) in indices.iter().enumerate() {
        let old = xp[idx];
        xp[idx] = old + FINITE_DIFF_STEP;
        let perturbed = term.values(&xp);
        xp[idx] = old;
        for row in 0..base.len() {
            jac[(row, col)] = (perturbed[row] - base[row]) / FINITE_DIFF_STEP;
        }
    }
    jac
}

/// How a cost penalizes its term values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyKind {
    /// `sum_i w_i * v_i^2`
    Squared,
    /// `sum_i w_i * max(0, v_i)`
    Hinge,
    /// `sum_i w_i * |v_i|`
    Abs,
}

/// How a constraint bounds its term values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// `v_i = 0`
    Equality,
    /// `v_i <= 0`
    Inequality,
}

/// A cost: a term plus a penalty kind and per-row weights.
pub struct CostTerm {
    /// The underlying term function.
    pub term: Box<dyn TermFn>,
    /// Penalty applied to the term values.
    pub penalty: PenaltyKind,
    /// Per-row weights (length `term.num_values()`).
    pub weights: DVector<f64>,
}

impl CostTerm {
    /// Create a cost with uniform weight.
    #[must_use]
    pub fn new(term: Box<dyn TermFn>, penalty: PenaltyKind, weight: f64) -> Self {
        let rows = term.num_values();
        Self {
            term,
            penalty,
            weights: DVector::from_element(rows, weight),
        }
    }

    /// Create a cost with per-row weights.
    #[must_use]
    pub fn with_weights(term: Box<dyn TermFn>, penalty: PenaltyKind, weights: DVector<f64>) -> Self {
        debug_assert_eq!(weights.len(), term.num_values());
        Self {
            term,
            penalty,
            weights,
        }
    }

    /// Exact penalty value of the rows `values`.
    #[must_use]
    pub fn penalty_of(&self, values: &DVector<f64>) -> f64 {
        let mut total = 0.0;
        for i in 0..values.len() {
            let v = values[i];
            total += match self.penalty {
                PenaltyKind::Squared => self.weights[i] * v * v,
                PenaltyKind::Hinge => self.weights[i] * v.max(0.0),
                PenaltyKind::Abs => self.weights[i] * v.abs(),
            };
        }
        total
    }
}

/// A constraint: a term plus a kind and per-row scale factors.
pub struct ConstraintTerm {
    /// The underlying term function.
    pub term: Box<dyn TermFn>,
    /// Equality or inequality semantics.
    pub kind: ConstraintKind,
    /// Per-row scale factors folded into values and Jacobian rows.
    pub weights: DVector<f64>,
}

impl ConstraintTerm {
    /// Create a constraint with uniform scale.
    #[must_use]
    pub fn new(term: Box<dyn TermFn>, kind: ConstraintKind, weight: f64) -> Self {
        let rows = term.num_values();
        Self {
            term,
            kind,
            weights: DVector::from_element(rows, weight),
        }
    }

    /// Create a constraint with per-row scales.
    #[must_use]
    pub fn with_weights(term: Box<dyn TermFn>, kind: ConstraintKind, weights: DVector<f64>) -> Self {
        debug_assert_eq!(weights.len(), term.num_values());
        Self {
            term,
            kind,
            weights,
        }
    }

    /// Violation of one scaled row value.
    #[must_use]
    pub fn violation_of(&self, scaled_value: f64) -> f64 {
        match self.kind {
            ConstraintKind::Equality => scaled_value.abs(),
            ConstraintKind::Inequality => scaled_value.max(0.0),
        }
    }
}

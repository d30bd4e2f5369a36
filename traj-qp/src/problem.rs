//! The nonlinear problem container and its convexification.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CscMatrix};
use thiserror::Error;

use crate::term::{ConstraintKind, ConstraintTerm, CostTerm, PenaltyKind};

/// Errors from problem assembly and convexification.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QpError {
    /// A non-finite value appeared while evaluating a term.
    #[error("non-finite value while convexifying '{0}'")]
    Numeric(String),

    /// A variable name was added twice.
    #[error("duplicate variable name: {0}")]
    DuplicateVariable(String),

    /// Terms or variables were added after `setup`.
    #[error("problem structure is frozen after setup")]
    StructureFrozen,

    /// An operation required `setup` first.
    #[error("problem has not been set up")]
    NotSetup,

    /// An operation required `convexify` first.
    #[error("problem has not been convexified")]
    NotConvexified,

    /// A vector had the wrong length.
    #[error("{what} has length {actual}, expected {expected}")]
    BadLength {
        /// Which vector was mis-sized.
        what: String,
        /// Required length.
        expected: usize,
        /// Provided length.
        actual: usize,
    },
}

/// Frozen linearization of one term around `x0`.
#[derive(Debug, Clone)]
struct ConvexModel {
    values: DVector<f64>,
    jacobian: DMatrix<f64>,
    x0: DVector<f64>,
}

impl ConvexModel {
    fn linearized(&self, x_slice: &DVector<f64>) -> DVector<f64> {
        &self.values + &self.jacobian * (x_slice - &self.x0)
    }
}

/// Sizes and offsets fixed at `setup`.
#[derive(Debug, Clone)]
struct Layout {
    num_nlp_vars: usize,
    num_penalty_rows: usize,
    num_cnt_rows: usize,
    num_slacks: usize,
    /// Per cost: first slack variable (absolute QP index); `usize::MAX` for
    /// squared costs, which carry no slacks.
    cost_slack_offsets: Vec<usize>,
    /// Per cost: first penalty row in `A`; `usize::MAX` for squared costs.
    cost_row_offsets: Vec<usize>,
    /// Per constraint: first slack variable (absolute QP index).
    cnt_slack_offsets: Vec<usize>,
    /// Per constraint: first row in `A` and first row in the violation
    /// vector (the two agree up to the penalty-row offset).
    cnt_row_offsets: Vec<usize>,
    box_row_offset: usize,
    slack_row_offset: usize,
    num_qp_vars: usize,
    num_qp_cnts: usize,
}

/// Frozen convex model of the whole problem.
#[derive(Debug, Clone)]
struct ConvexState {
    hessian: CscMatrix<f64>,
    gradient: DVector<f64>,
    constraint_matrix: CscMatrix<f64>,
    row_lower: DVector<f64>,
    row_upper: DVector<f64>,
    cost_models: Vec<ConvexModel>,
    cnt_models: Vec<ConvexModel>,
}

/// A nonlinear trajectory problem and its convex approximation.
///
/// Owns the variable table, the costs, and the constraints. After
/// [`setup`](Self::setup) the structure (and therefore the QP sparsity) is
/// frozen; [`convexify`](Self::convexify) may then be called repeatedly as
/// the iterate moves.
pub struct QpProblem {
    var_names: Vec<String>,
    x: DVector<f64>,
    pinned: Vec<Option<f64>>,
    var_lower: DVector<f64>,
    var_upper: DVector<f64>,
    box_size: DVector<f64>,
    costs: Vec<CostTerm>,
    constraints: Vec<ConstraintTerm>,
    merit_coeffs: DVector<f64>,
    layout: Option<Layout>,
    convex: Option<ConvexState>,
}

impl Default for QpProblem {
    fn default() -> Self {
        Self::new()
    }
}

impl QpProblem {
    /// Create an empty problem.
    #[must_use]
    pub fn new() -> Self {
        Self {
            var_names: Vec::new(),
            x: DVector::zeros(0),
            pinned: Vec::new(),
            var_lower: DVector::zeros(0),
            var_upper: DVector::zeros(0),
            box_size: DVector::zeros(0),
            costs: Vec::new(),
            constraints: Vec::new(),
            merit_coeffs: DVector::zeros(0),
            layout: None,
            convex: None,
        }
    }

    /// Append named variables with initial values.
    pub fn add_variable_set(
        &mut self,
        names: Vec<String>,
        values: DVector<f64>,
    ) -> Result<(), QpError> {
        if self.layout.is_some() {
            return Err(QpError::StructureFrozen);
        }
        if names.len() != values.len() {
            return Err(QpError::BadLength {
                what: "variable values".to_owned(),
                expected: names.len(),
                actual: values.len(),
            });
        }
        for name in &names {
            if self.var_names.contains(name) {
                return Err(QpError::DuplicateVariable(name.clone()));
            }
        }
        let old_n = self.x.len();
        let n = old_n + names.len();
        let mut x = DVector::zeros(n);
        let mut lower = DVector::from_element(n, f64::NEG_INFINITY);
        let mut upper = DVector::from_element(n, f64::INFINITY);
        let mut box_size = DVector::from_element(n, 0.0);
        for i in 0..old_n {
            x[i] = self.x[i];
            lower[i] = self.var_lower[i];
            upper[i] = self.var_upper[i];
            box_size[i] = self.box_size[i];
        }
        for (i, _) in names.iter().enumerate() {
            x[old_n + i] = values[i];
        }
        self.var_names.extend(names);
        self.pinned.resize(n, None);
        self.x = x;
        self.var_lower = lower;
        self.var_upper = upper;
        self.box_size = box_size;
        Ok(())
    }

    /// Pin a variable to `value`; it is excluded from the free set.
    pub fn pin_variable(&mut self, index: usize, value: f64) {
        if index < self.pinned.len() {
            self.pinned[index] = Some(value);
            self.x[index] = value;
        }
    }

    /// Set hard limits on one variable (e.g. the `1/dt` column).
    pub fn set_variable_limits(&mut self, index: usize, lower: f64, upper: f64) {
        if index < self.var_lower.len() {
            self.var_lower[index] = lower;
            self.var_upper[index] = upper;
        }
    }

    /// Add a cost term.
    pub fn add_cost(&mut self, cost: CostTerm) -> Result<(), QpError> {
        if self.layout.is_some() {
            return Err(QpError::StructureFrozen);
        }
        self.costs.push(cost);
        Ok(())
    }

    /// Add a constraint term.
    pub fn add_constraint(&mut self, constraint: ConstraintTerm) -> Result<(), QpError> {
        if self.layout.is_some() {
            return Err(QpError::StructureFrozen);
        }
        self.constraints.push(constraint);
        Ok(())
    }

    /// Freeze sizes and compute the QP layout.
    pub fn setup(&mut self) {
        let n = self.x.len();
        let mut num_penalty_rows = 0;
        let mut num_slacks = 0;
        let mut cost_slack_offsets = Vec::with_capacity(self.costs.len());
        let mut cost_row_offsets = Vec::with_capacity(self.costs.len());
        for cost in &self.costs {
            let rows = cost.term.num_values();
            match cost.penalty {
                PenaltyKind::Squared => {
                    cost_slack_offsets.push(usize::MAX);
                    cost_row_offsets.push(usize::MAX);
                }
                PenaltyKind::Hinge => {
                    cost_slack_offsets.push(n + num_slacks);
                    cost_row_offsets.push(num_penalty_rows);
                    num_slacks += rows;
                    num_penalty_rows += rows;
                }
                PenaltyKind::Abs => {
                    cost_slack_offsets.push(n + num_slacks);
                    cost_row_offsets.push(num_penalty_rows);
                    num_slacks += 2 * rows;
                    num_penalty_rows += rows;
                }
            }
        }

        let mut num_cnt_rows = 0;
        let mut cnt_slack_offsets = Vec::with_capacity(self.constraints.len());
        let mut cnt_row_offsets = Vec::with_capacity(self.constraints.len());
        for constraint in &self.constraints {
            let rows = constraint.term.num_values();
            cnt_slack_offsets.push(n + num_slacks);
            cnt_row_offsets.push(num_cnt_rows);
            num_slacks += match constraint.kind {
                ConstraintKind::Equality => 2 * rows,
                ConstraintKind::Inequality => rows,
            };
            num_cnt_rows += rows;
        }

        let box_row_offset = num_penalty_rows + num_cnt_rows;
        let slack_row_offset = box_row_offset + n;
        self.merit_coeffs = DVector::from_element(num_cnt_rows, 1.0);
        self.layout = Some(Layout {
            num_nlp_vars: n,
            num_penalty_rows,
            num_cnt_rows,
            num_slacks,
            cost_slack_offsets,
            cost_row_offsets,
            cnt_slack_offsets,
            cnt_row_offsets,
            box_row_offset,
            slack_row_offset,
            num_qp_vars: n + num_slacks,
            num_qp_cnts: slack_row_offset + num_slacks,
        });
    }

    fn gather(x: &DVector<f64>, indices: &[usize]) -> DVector<f64> {
        DVector::from_iterator(indices.len(), indices.iter().map(|&i| x[i]))
    }

    fn build_cost_model(cost: &CostTerm, x: &DVector<f64>) -> Result<ConvexModel, QpError> {
        let values = cost.term.values(x);
        let jacobian = cost.term.jacobian(x);
        if !values.iter().all(|v| v.is_finite()) || !jacobian.iter().all(|v| v.is_finite()) {
            return Err(QpError::Numeric(cost.term.name().to_owned()));
        }
        Ok(ConvexModel {
            x0: Self::gather(x, cost.term.indices()),
            values,
            jacobian,
        })
    }

    fn build_cnt_model(cnt: &ConstraintTerm, x: &DVector<f64>) -> Result<ConvexModel, QpError> {
        let mut values = cnt.term.values(x);
        let mut jacobian = cnt.term.jacobian(x);
        if !values.iter().all(|v| v.is_finite()) || !jacobian.iter().all(|v| v.is_finite()) {
            return Err(QpError::Numeric(cnt.term.name().to_owned()));
        }
        // Fold the per-row scales into the stored model so violations and
        // linearization rows agree.
        for r in 0..values.len() {
            values[r] *= cnt.weights[r];
            for c in 0..jacobian.ncols() {
                jacobian[(r, c)] *= cnt.weights[r];
            }
        }
        Ok(ConvexModel {
            x0: Self::gather(x, cnt.term.indices()),
            values,
            jacobian,
        })
    }

    #[cfg(feature = "parallel")]
    fn build_models(
        &self,
    ) -> Result<(Vec<ConvexModel>, Vec<ConvexModel>), QpError> {
        use rayon::prelude::*;
        let cost_models = self
            .costs
            .par_iter()
            .map(|c| Self::build_cost_model(c, &self.x))
            .collect::<Result<Vec<_>, _>>()?;
        let cnt_models = self
            .constraints
            .par_iter()
            .map(|c| Self::build_cnt_model(c, &self.x))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((cost_models, cnt_models))
    }

    #[cfg(not(feature = "parallel"))]
    fn build_models(
        &self,
    ) -> Result<(Vec<ConvexModel>, Vec<ConvexModel>), QpError> {
        let cost_models = self
            .costs
            .iter()
            .map(|c| Self::build_cost_model(c, &self.x))
            .collect::<Result<Vec<_>, _>>()?;
        let cnt_models = self
            .constraints
            .iter()
            .map(|c| Self::build_cnt_model(c, &self.x))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((cost_models, cnt_models))
    }

    /// Re-linearize every term at the current iterate and assemble the QP.
    ///
    /// The sparsity patterns of the Hessian and constraint matrix are
    /// identical across calls: entry positions depend only on the frozen
    /// structure, and structural zeros are materialized.
    pub fn convexify(&mut self) -> Result<(), QpError> {
        let layout = self.layout.as_ref().ok_or(QpError::NotSetup)?.clone();
        let (cost_models, cnt_models) = self.build_models()?;

        let nqp = layout.num_qp_vars;
        let mut hessian = CooMatrix::new(nqp, nqp);
        let mut gradient = DVector::zeros(nqp);
        let mut a_mat = CooMatrix::new(layout.num_qp_cnts, nqp);
        let mut row_lower =
            DVector::from_element(layout.num_penalty_rows + layout.num_cnt_rows, f64::NEG_INFINITY);
        let mut row_upper =
            DVector::from_element(layout.num_penalty_rows + layout.num_cnt_rows, f64::INFINITY);

        // Materialize the Hessian diagonal so the pattern covers every
        // variable regardless of which costs touch it.
        for i in 0..nqp {
            hessian.push(i, i, 0.0);
        }

        for (k, cost) in self.costs.iter().enumerate() {
            let model = &cost_models[k];
            let indices = cost.term.indices();
            let rows = model.values.len();
            // c = v0 - J x0: the linearization's constant in absolute terms.
            let c = &model.values - &model.jacobian * &model.x0;
            match cost.penalty {
                PenaltyKind::Squared => {
                    for a in 0..indices.len() {
                        for b in 0..indices.len() {
                            let mut h = 0.0;
                            for r in 0..rows {
                                h += cost.weights[r]
                                    * model.jacobian[(r, a)]
                                    * model.jacobian[(r, b)];
                            }
                            hessian.push(indices[a], indices[b], 2.0 * h);
                        }
                        let mut gv = 0.0;
                        for r in 0..rows {
                            gv += cost.weights[r] * model.jacobian[(r, a)] * c[r];
                        }
                        gradient[indices[a]] += 2.0 * gv;
                    }
                }
                PenaltyKind::Hinge => {
                    let slack0 = layout.cost_slack_offsets[k];
                    let row0 = layout.cost_row_offsets[k];
                    for r in 0..rows {
                        let row = row0 + r;
                        for (col, &idx) in indices.iter().enumerate() {
                            a_mat.push(row, idx, model.jacobian[(r, col)]);
                        }
                        a_mat.push(row, slack0 + r, -1.0);
                        row_upper[row] = -c[r];
                        gradient[slack0 + r] += cost.weights[r];
                    }
                }
                PenaltyKind::Abs => {
                    let slack0 = layout.cost_slack_offsets[k];
                    let row0 = layout.cost_row_offsets[k];
                    for r in 0..rows {
                        let row = row0 + r;
                        for (col, &idx) in indices.iter().enumerate() {
                            a_mat.push(row, idx, model.jacobian[(r, col)]);
                        }
                        a_mat.push(row, slack0 + 2 * r, -1.0);
                        a_mat.push(row, slack0 + 2 * r + 1, 1.0);
                        row_lower[row] = -c[r];
                        row_upper[row] = -c[r];
                        gradient[slack0 + 2 * r] += cost.weights[r];
                        gradient[slack0 + 2 * r + 1] += cost.weights[r];
                    }
                }
            }
        }

        for (k, constraint) in self.constraints.iter().enumerate() {
            let model = &cnt_models[k];
            let indices = constraint.term.indices();
            let rows = model.values.len();
            let c = &model.values - &model.jacobian * &model.x0;
            let slack0 = layout.cnt_slack_offsets[k];
            let row0 = layout.num_penalty_rows + layout.cnt_row_offsets[k];
            let viol0 = layout.cnt_row_offsets[k];
            for r in 0..rows {
                let row = row0 + r;
                let mu = self.merit_coeffs[viol0 + r];
                for (col, &idx) in indices.iter().enumerate() {
                    a_mat.push(row, idx, model.jacobian[(r, col)]);
                }
                match constraint.kind {
                    ConstraintKind::Equality => {
                        a_mat.push(row, slack0 + 2 * r, -1.0);
                        a_mat.push(row, slack0 + 2 * r + 1, 1.0);
                        row_lower[row] = -c[r];
                        row_upper[row] = -c[r];
                        gradient[slack0 + 2 * r] = mu;
                        gradient[slack0 + 2 * r + 1] = mu;
                    }
                    ConstraintKind::Inequality => {
                        a_mat.push(row, slack0 + r, -1.0);
                        row_upper[row] = -c[r];
                        gradient[slack0 + r] = mu;
                    }
                }
            }
        }

        // Trust-region box rows and slack nonnegativity rows.
        for i in 0..layout.num_nlp_vars {
            a_mat.push(layout.box_row_offset + i, i, 1.0);
        }
        for s in 0..layout.num_slacks {
            a_mat.push(layout.slack_row_offset + s, layout.num_nlp_vars + s, 1.0);
        }

        if !gradient.iter().all(|v| v.is_finite()) {
            return Err(QpError::Numeric("gradient".to_owned()));
        }
        if !row_lower.iter().all(|v| v.is_finite() || *v == f64::NEG_INFINITY)
            || !row_upper.iter().all(|v| v.is_finite() || *v == f64::INFINITY)
        {
            return Err(QpError::Numeric("constraint bounds".to_owned()));
        }

        self.convex = Some(ConvexState {
            hessian: CscMatrix::from(&hessian),
            gradient,
            constraint_matrix: CscMatrix::from(&a_mat),
            row_lower,
            row_upper,
            cost_models,
            cnt_models,
        });
        Ok(())
    }

    /// The assembled Hessian.
    pub fn hessian(&self) -> Result<&CscMatrix<f64>, QpError> {
        self.convex
            .as_ref()
            .map(|c| &c.hessian)
            .ok_or(QpError::NotConvexified)
    }

    /// The assembled gradient.
    pub fn gradient(&self) -> Result<&DVector<f64>, QpError> {
        self.convex
            .as_ref()
            .map(|c| &c.gradient)
            .ok_or(QpError::NotConvexified)
    }

    /// The assembled linear-constraint matrix.
    pub fn constraint_matrix(&self) -> Result<&CscMatrix<f64>, QpError> {
        self.convex
            .as_ref()
            .map(|c| &c.constraint_matrix)
            .ok_or(QpError::NotConvexified)
    }

    /// Lower bounds `l` for the QP rows, reflecting the current box.
    pub fn bounds_lower(&self) -> Result<DVector<f64>, QpError> {
        self.bounds(false)
    }

    /// Upper bounds `u` for the QP rows, reflecting the current box.
    pub fn bounds_upper(&self) -> Result<DVector<f64>, QpError> {
        self.bounds(true)
    }

    fn bounds(&self, upper: bool) -> Result<DVector<f64>, QpError> {
        let layout = self.layout.as_ref().ok_or(QpError::NotSetup)?;
        let convex = self.convex.as_ref().ok_or(QpError::NotConvexified)?;
        let mut out = DVector::zeros(layout.num_qp_cnts);
        let model_rows = layout.num_penalty_rows + layout.num_cnt_rows;
        for r in 0..model_rows {
            out[r] = if upper {
                convex.row_upper[r]
            } else {
                convex.row_lower[r]
            };
        }
        for i in 0..layout.num_nlp_vars {
            let row = layout.box_row_offset + i;
            out[row] = match self.pinned[i] {
                Some(v) => v,
                None => {
                    if upper {
                        (self.x[i] + self.box_size[i]).min(self.var_upper[i])
                    } else {
                        (self.x[i] - self.box_size[i]).max(self.var_lower[i])
                    }
                }
            };
        }
        for s in 0..layout.num_slacks {
            let row = layout.slack_row_offset + s;
            out[row] = if upper { f64::INFINITY } else { 0.0 };
        }
        Ok(out)
    }

    /// Set the per-variable trust-region half-widths.
    pub fn set_box_size(&mut self, box_size: DVector<f64>) {
        debug_assert_eq!(box_size.len(), self.x.len());
        self.box_size = box_size;
    }

    /// Scale every trust-region half-width by `factor`.
    pub fn scale_box_size(&mut self, factor: f64) {
        self.box_size *= factor;
    }

    /// The current trust-region half-widths.
    #[must_use]
    pub fn box_size(&self) -> &DVector<f64> {
        &self.box_size
    }

    /// Overwrite the current iterate (NLP variables only).
    pub fn set_variables(&mut self, x: &DVector<f64>) {
        debug_assert_eq!(x.len(), self.x.len());
        self.x.copy_from(x);
        for (i, pin) in self.pinned.iter().enumerate() {
            if let Some(v) = pin {
                self.x[i] = *v;
            }
        }
    }

    /// The current iterate.
    #[must_use]
    pub fn variable_values(&self) -> DVector<f64> {
        self.x.clone()
    }

    /// Names of the variables, in flat order.
    #[must_use]
    pub fn variable_names(&self) -> &[String] {
        &self.var_names
    }

    /// Per-cost exact values at `x`.
    #[must_use]
    pub fn evaluate_exact_costs(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.costs.len(),
            self.costs
                .iter()
                .map(|c| c.penalty_of(&c.term.values(x))),
        )
    }

    /// Per-row exact constraint violations at `x`.
    #[must_use]
    pub fn evaluate_exact_constraint_violations(&self, x: &DVector<f64>) -> DVector<f64> {
        let rows: usize = self
            .constraints
            .iter()
            .map(|c| c.term.num_values())
            .sum();
        let mut out = DVector::zeros(rows);
        let mut row = 0;
        for constraint in &self.constraints {
            let values = constraint.term.values(x);
            for r in 0..values.len() {
                out[row] = constraint.violation_of(constraint.weights[r] * values[r]);
                row += 1;
            }
        }
        out
    }

    /// Per-cost values of the frozen convex model at `x`.
    pub fn evaluate_convex_costs(&self, x: &DVector<f64>) -> Result<DVector<f64>, QpError> {
        let convex = self.convex.as_ref().ok_or(QpError::NotConvexified)?;
        let mut out = DVector::zeros(self.costs.len());
        for (k, cost) in self.costs.iter().enumerate() {
            let slice = Self::gather(x, cost.term.indices());
            out[k] = cost.penalty_of(&convex.cost_models[k].linearized(&slice));
        }
        Ok(out)
    }

    /// Per-row violations of the frozen convex model at `x`.
    pub fn evaluate_convex_constraint_violations(
        &self,
        x: &DVector<f64>,
    ) -> Result<DVector<f64>, QpError> {
        let convex = self.convex.as_ref().ok_or(QpError::NotConvexified)?;
        let layout = self.layout.as_ref().ok_or(QpError::NotSetup)?;
        let mut out = DVector::zeros(layout.num_cnt_rows);
        let mut row = 0;
        for (k, constraint) in self.constraints.iter().enumerate() {
            let slice = Self::gather(x, constraint.term.indices());
            let values = convex.cnt_models[k].linearized(&slice);
            for r in 0..values.len() {
                out[row] = constraint.violation_of(values[r]);
                row += 1;
            }
        }
        Ok(out)
    }

    /// Set the merit coefficient for every constraint row.
    pub fn set_constraint_merit_coeff(&mut self, coeffs: DVector<f64>) -> Result<(), QpError> {
        let expected = self.num_nlp_constraint_rows();
        if coeffs.len() != expected {
            return Err(QpError::BadLength {
                what: "merit coefficients".to_owned(),
                expected,
                actual: coeffs.len(),
            });
        }
        self.merit_coeffs = coeffs;
        Ok(())
    }

    /// The current per-row merit coefficients.
    #[must_use]
    pub fn merit_coeffs(&self) -> &DVector<f64> {
        &self.merit_coeffs
    }

    /// Number of NLP variables.
    #[must_use]
    pub fn num_nlp_vars(&self) -> usize {
        self.x.len()
    }

    /// Number of costs.
    #[must_use]
    pub fn num_nlp_costs(&self) -> usize {
        self.costs.len()
    }

    /// Total number of constraint rows.
    #[must_use]
    pub fn num_nlp_constraint_rows(&self) -> usize {
        self.constraints.iter().map(|c| c.term.num_values()).sum()
    }

    /// Number of QP variables (NLP variables plus slacks).
    #[must_use]
    pub fn num_qp_vars(&self) -> usize {
        self.layout.as_ref().map_or(0, |l| l.num_qp_vars)
    }

    /// Number of QP constraint rows.
    #[must_use]
    pub fn num_qp_cnts(&self) -> usize {
        self.layout.as_ref().map_or(0, |l| l.num_qp_cnts)
    }

    /// Per-cost names.
    #[must_use]
    pub fn cost_names(&self) -> Vec<String> {
        self.costs.iter().map(|c| c.term.name().to_owned()).collect()
    }

    /// Per-row constraint names (`name[row]`).
    #[must_use]
    pub fn constraint_row_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for constraint in &self.constraints {
            let base = constraint.term.name();
            for r in 0..constraint.term.num_values() {
                names.push(format!("{base}[{r}]"));
            }
        }
        names
    }
}

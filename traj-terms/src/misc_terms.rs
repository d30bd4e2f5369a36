//! Total-time, singularity-avoidance, and user-defined terms.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use traj_qp::{ConstraintKind, ConstraintTerm, CostTerm, PenaltyKind};
use traj_types::ConfigError;

use crate::info::{broadcast, resolve_step_range, TermInfo, TermKind, TermKinds};
use crate::kernels::{AvoidSingularityTerm, TimeDeltaSumTerm, UserFnTerm};
use crate::problem::TrajProblem;

/// Penalty on the total trajectory duration `sum_t 1/(1/dt)_t`.
///
/// Requires the `1/dt` column. With a positive `limit` only the excess over
/// the limit is penalized (hinge / inequality); with `limit == 0` the
/// duration itself is the cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TotalTimeTermInfo {
    /// Instance name.
    pub name: String,
    /// Scale applied to the duration.
    pub coeff: f64,
    /// Duration above which the penalty engages.
    pub limit: f64,
}

impl Default for TotalTimeTermInfo {
    fn default() -> Self {
        Self {
            name: "total_time".to_owned(),
            coeff: 1.0,
            limit: 0.0,
        }
    }
}

impl TermInfo for TotalTimeTermInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "total_time"
    }

    fn supported_kinds(&self) -> TermKinds {
        TermKinds {
            cost: true,
            constraint: true,
            uses_time: true,
        }
    }

    fn hatch(&self, kind: TermKind, prob: &mut TrajProblem) -> Result<(), ConfigError> {
        let indices: Vec<usize> = (0..prob.n_steps()).map(|t| prob.time_index(t)).collect();
        let term = TimeDeltaSumTerm::new(self.name.clone(), indices, self.limit);
        match kind {
            TermKind::Cost => {
                let penalty = if self.limit > 0.0 {
                    PenaltyKind::Hinge
                } else {
                    PenaltyKind::Abs
                };
                prob.add_cost(CostTerm::new(Box::new(term), penalty, self.coeff))
            }
            TermKind::Constraint => {
                let cnt_kind = if self.limit > 0.0 {
                    ConstraintKind::Inequality
                } else {
                    ConstraintKind::Equality
                };
                prob.add_constraint(ConstraintTerm::new(Box::new(term), cnt_kind, self.coeff))
            }
        }
    }

    fn to_config(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Penalty on proximity to kinematic singularities of a link Jacobian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvoidSingularityTermInfo {
    /// Instance name.
    pub name: String,
    /// Link whose Jacobian is monitored.
    pub link: String,
    /// Damping added to the smallest singular value.
    pub lambda: f64,
    /// Scale applied at every step.
    pub coeffs: Vec<f64>,
    /// First step of the range (inclusive).
    pub first_step: i64,
    /// Last step of the range (inclusive, `-1` = final step).
    pub last_step: i64,
}

impl Default for AvoidSingularityTermInfo {
    fn default() -> Self {
        Self {
            name: "avoid_singularity".to_owned(),
            link: String::new(),
            lambda: 0.1,
            coeffs: Vec::new(),
            first_step: 0,
            last_step: -1,
        }
    }
}

impl TermInfo for AvoidSingularityTermInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "avoid_singularity"
    }

    fn supported_kinds(&self) -> TermKinds {
        TermKinds::cost_and_constraint()
    }

    fn hatch(&self, kind: TermKind, prob: &mut TrajProblem) -> Result<(), ConfigError> {
        if !prob.kin().is_active_link(&self.link) {
            return Err(ConfigError::invalid(format!(
                "term '{}' link '{}' is not an active link",
                self.name, self.link
            )));
        }
        let coeffs = broadcast(&self.coeffs, 1, 1.0, &self.name, "coeffs")?;
        let (first, last) =
            resolve_step_range(self.first_step, self.last_step, prob.n_steps(), &self.name)?;

        for t in first..=last {
            let term = AvoidSingularityTerm {
                name: format!("{}_{t}", self.name),
                indices: prob.row_indices(t),
                kin: prob.kin(),
                link: self.link.clone(),
                lambda: self.lambda,
            };
            match kind {
                TermKind::Cost => prob.add_cost(CostTerm::new(
                    Box::new(term),
                    PenaltyKind::Squared,
                    coeffs[0],
                ))?,
                TermKind::Constraint => prob.add_constraint(ConstraintTerm::new(
                    Box::new(term),
                    ConstraintKind::Inequality,
                    coeffs[0],
                ))?,
            }
        }
        Ok(())
    }

    fn to_config(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Caller-supplied error function applied to each trajectory row.
///
/// The error function is required; a missing Jacobian falls back to forward
/// finite differencing. This term is built programmatically (closures do
/// not serialize) and is therefore absent from the string registry.
pub struct UserDefinedTermInfo {
    /// Instance name.
    pub name: String,
    /// First step of the range (inclusive).
    pub first_step: i64,
    /// Last step of the range (inclusive, `-1` = final step).
    pub last_step: i64,
    /// Per-row weights (broadcast over the error dimension).
    pub coeffs: Vec<f64>,
    /// Cost penalty applied when hatched as a cost.
    pub cost_penalty: PenaltyKind,
    /// Constraint kind applied when hatched as a constraint.
    pub constraint_kind: ConstraintKind,
    /// The error function `f(x_t) -> R^k`.
    pub error_fn: Arc<dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync>,
    /// Optional analytic Jacobian `J(x_t) -> R^{k x dof}`.
    pub jacobian_fn: Option<Arc<dyn Fn(&DVector<f64>) -> DMatrix<f64> + Send + Sync>>,
}

impl UserDefinedTermInfo {
    /// Create from an error function with defaults everywhere else.
    #[must_use]
    pub fn new(
        name: &str,
        error_fn: Arc<dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            first_step: 0,
            last_step: -1,
            coeffs: Vec::new(),
            cost_penalty: PenaltyKind::Squared,
            constraint_kind: ConstraintKind::Equality,
            error_fn,
            jacobian_fn: None,
        }
    }
}

impl TermInfo for UserDefinedTermInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "user_defined"
    }

    fn supported_kinds(&self) -> TermKinds {
        TermKinds::cost_and_constraint()
    }

    fn hatch(&self, kind: TermKind, prob: &mut TrajProblem) -> Result<(), ConfigError> {
        let (first, last) =
            resolve_step_range(self.first_step, self.last_step, prob.n_steps(), &self.name)?;

        // Probe the error dimension at the initial trajectory.
        let mut probe = DVector::zeros(prob.dof());
        for j in 0..prob.dof() {
            probe[j] = prob.init_traj()[(first, j)];
        }
        let rows = (self.error_fn)(&probe).len();
        if rows == 0 {
            return Err(ConfigError::invalid(format!(
                "term '{}' error function returned no values",
                self.name
            )));
        }
        let weights = broadcast(&self.coeffs, rows, 1.0, &self.name, "coeffs")?;

        for t in first..=last {
            if prob.is_fixed_timestep(t) {
                continue;
            }
            let term = UserFnTerm {
                name: format!("{}_{t}", self.name),
                indices: prob.row_indices(t),
                rows,
                error_fn: Arc::clone(&self.error_fn),
                jacobian_fn: self.jacobian_fn.clone(),
            };
            match kind {
                TermKind::Cost => prob.add_cost(CostTerm::with_weights(
                    Box::new(term),
                    self.cost_penalty,
                    weights.clone(),
                ))?,
                TermKind::Constraint => prob.add_constraint(ConstraintTerm::with_weights(
                    Box::new(term),
                    self.constraint_kind,
                    weights.clone(),
                ))?,
            }
        }
        Ok(())
    }

    fn to_config(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "first_step": self.first_step,
            "last_step": self.last_step,
            "coeffs": self.coeffs,
        })
    }
}

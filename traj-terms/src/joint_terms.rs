//! Joint-space motion terms: position, velocity, acceleration, jerk.
//!
//! All four share the same shape: a finite-difference stencil applied per
//! joint over a step range, with a target and optional tolerance band.
//! Zero tolerances hatch a squared cost (or equality constraint); non-zero
//! tolerances hatch a hinge pair (or inequality pair) that is free inside
//! the band.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use traj_qp::{ConstraintKind, ConstraintTerm, CostTerm, PenaltyKind};
use traj_types::ConfigError;

use crate::info::{broadcast, resolve_step_range, TermInfo, TermKind, TermKinds};
use crate::kernels::FiniteDiffTerm;
use crate::problem::TrajProblem;

/// Parameters shared by the four joint-motion terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct JointMotionParams {
    name: String,
    coeffs: Vec<f64>,
    targets: Vec<f64>,
    upper_tols: Vec<f64>,
    lower_tols: Vec<f64>,
    first_step: i64,
    last_step: i64,
}

impl JointMotionParams {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            coeffs: Vec::new(),
            targets: Vec::new(),
            upper_tols: Vec::new(),
            lower_tols: Vec::new(),
            first_step: 0,
            last_step: -1,
        }
    }
}

impl Default for JointMotionParams {
    fn default() -> Self {
        Self::named("joint_motion")
    }
}

fn hatch_joint_motion(
    params: &JointMotionParams,
    stencil: &[f64],
    skip_fixed_steps: bool,
    kind: TermKind,
    prob: &mut TrajProblem,
) -> Result<(), ConfigError> {
    let dof = prob.dof();
    let name = &params.name;
    let coeffs = broadcast(&params.coeffs, dof, 1.0, name, "coeffs")?;
    let targets = broadcast(&params.targets, dof, 0.0, name, "targets")?;
    let upper_tols = broadcast(&params.upper_tols, dof, 0.0, name, "upper_tols")?;
    let lower_tols = broadcast(&params.lower_tols, dof, 0.0, name, "lower_tols")?;
    let (first, last) =
        resolve_step_range(params.first_step, params.last_step, prob.n_steps(), name)?;

    let span = stencil.len();
    if last + 1 < first + span {
        return Err(ConfigError::StepRangeOutOfBounds {
            term: name.clone(),
            first: params.first_step,
            last: params.last_step,
            n_steps: prob.n_steps(),
        });
    }

    let zero_tols =
        upper_tols.iter().all(|v| *v == 0.0) && lower_tols.iter().all(|v| *v == 0.0);
    let neg_stencil: Vec<f64> = stencil.iter().map(|c| -c).collect();

    for t in first..=(last + 1 - span) {
        if skip_fixed_steps && prob.is_fixed_timestep(t) {
            continue;
        }
        let mut indices = Vec::with_capacity(span * dof);
        for s in 0..span {
            indices.extend(prob.row_indices(t + s));
        }

        if zero_tols {
            let term = FiniteDiffTerm::new(
                format!("{name}_{t}"),
                indices,
                dof,
                stencil.to_vec(),
                targets.clone(),
            );
            match kind {
                TermKind::Cost => prob.add_cost(CostTerm::with_weights(
                    Box::new(term),
                    PenaltyKind::Squared,
                    coeffs.clone(),
                ))?,
                TermKind::Constraint => prob.add_constraint(ConstraintTerm::with_weights(
                    Box::new(term),
                    ConstraintKind::Equality,
                    coeffs.clone(),
                ))?,
            }
            continue;
        }

        // Upper side: value - target - upper_tol <= 0.
        let upper_shift = &targets + &upper_tols;
        let upper_term = FiniteDiffTerm::new(
            format!("{name}_{t}_upper"),
            indices.clone(),
            dof,
            stencil.to_vec(),
            upper_shift,
        );
        // Lower side: target + lower_tol - value <= 0.
        let lower_shift: DVector<f64> = -(&targets + &lower_tols);
        let lower_term = FiniteDiffTerm::new(
            format!("{name}_{t}_lower"),
            indices,
            dof,
            neg_stencil.clone(),
            lower_shift,
        );

        match kind {
            TermKind::Cost => {
                prob.add_cost(CostTerm::with_weights(
                    Box::new(upper_term),
                    PenaltyKind::Hinge,
                    coeffs.clone(),
                ))?;
                prob.add_cost(CostTerm::with_weights(
                    Box::new(lower_term),
                    PenaltyKind::Hinge,
                    coeffs.clone(),
                ))?;
            }
            TermKind::Constraint => {
                prob.add_constraint(ConstraintTerm::with_weights(
                    Box::new(upper_term),
                    ConstraintKind::Inequality,
                    coeffs.clone(),
                ))?;
                prob.add_constraint(ConstraintTerm::with_weights(
                    Box::new(lower_term),
                    ConstraintKind::Inequality,
                    coeffs.clone(),
                ))?;
            }
        }
    }
    Ok(())
}

macro_rules! joint_motion_term {
    ($(#[$doc:meta])* $info:ident, $type_name:literal, $stencil:expr, $skip_fixed:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $info {
            params: JointMotionParams,
        }

        impl Default for $info {
            fn default() -> Self {
                Self {
                    params: JointMotionParams::named($type_name),
                }
            }
        }

        impl $info {
            /// Create with a per-joint target and uniform coefficient.
            #[must_use]
            pub fn new(name: &str, coeff: f64, targets: Vec<f64>) -> Self {
                Self {
                    params: JointMotionParams {
                        name: name.to_owned(),
                        coeffs: vec![coeff],
                        targets,
                        ..JointMotionParams::named($type_name)
                    },
                }
            }

            /// Restrict the term to an inclusive step range.
            #[must_use]
            pub fn with_step_range(mut self, first_step: i64, last_step: i64) -> Self {
                self.params.first_step = first_step;
                self.params.last_step = last_step;
                self
            }

            /// Allow a tolerance band around the target.
            #[must_use]
            pub fn with_tolerances(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
                self.params.lower_tols = lower;
                self.params.upper_tols = upper;
                self
            }
        }

        impl TermInfo for $info {
            fn name(&self) -> &str {
                &self.params.name
            }

            fn type_name(&self) -> &'static str {
                $type_name
            }

            fn supported_kinds(&self) -> TermKinds {
                TermKinds::cost_and_constraint()
            }

            fn hatch(&self, kind: TermKind, prob: &mut TrajProblem) -> Result<(), ConfigError> {
                hatch_joint_motion(&self.params, &$stencil, $skip_fixed, kind, prob)
            }

            fn to_config(&self) -> serde_json::Value {
                serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
            }
        }
    };
}

joint_motion_term!(
    /// Per-step joint position target. Steps pinned by the problem are
    /// skipped, since their cells cannot move.
    JointPosTermInfo,
    "joint_pos",
    [1.0],
    true
);

joint_motion_term!(
    /// Forward-difference joint velocity `x_{t+1} - x_t`.
    JointVelTermInfo,
    "joint_vel",
    [-1.0, 1.0],
    false
);

joint_motion_term!(
    /// Central-difference joint acceleration `x_t - 2 x_{t+1} + x_{t+2}`.
    JointAccTermInfo,
    "joint_acc",
    [1.0, -2.0, 1.0],
    false
);

joint_motion_term!(
    /// Five-point central-difference joint jerk.
    JointJerkTermInfo,
    "joint_jerk",
    [-0.5, 1.0, 0.0, -1.0, 0.5],
    false
);

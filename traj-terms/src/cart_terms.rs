//! Cartesian-space terms: pose targets and displacement bounds.

use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};
use traj_qp::{ConstraintKind, ConstraintTerm, CostTerm, PenaltyKind};
use traj_types::{ConfigError, DVector};

use crate::info::{broadcast, resolve_step_range, TermInfo, TermKind, TermKinds};
use crate::kernels::{CartPoseTerm, CartTarget, CartVelTerm};
use crate::problem::TrajProblem;

fn isometry_from(xyz: [f64; 3], wxyz: [f64; 4]) -> Isometry3<f64> {
    let rotation = UnitQuaternion::from_quaternion(Quaternion::new(
        wxyz[0], wxyz[1], wxyz[2], wxyz[3],
    ));
    Isometry3::from_parts(Translation3::new(xyz[0], xyz[1], xyz[2]), rotation)
}

fn pose_weights(
    pos_coeffs: &[f64],
    rot_coeffs: &[f64],
    term: &str,
) -> Result<DVector<f64>, ConfigError> {
    let pos = broadcast(pos_coeffs, 3, 1.0, term, "pos_coeffs")?;
    let rot = broadcast(rot_coeffs, 3, 1.0, term, "rot_coeffs")?;
    let mut weights = DVector::zeros(6);
    for i in 0..3 {
        weights[i] = pos[i];
        weights[3 + i] = rot[i];
    }
    Ok(weights)
}

/// Shared fields of the two pose terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct CartPoseParams {
    name: String,
    timestep: usize,
    source_frame: String,
    target_frame: String,
    target_xyz: [f64; 3],
    target_wxyz: [f64; 4],
    source_xyz: [f64; 3],
    source_wxyz: [f64; 4],
    pos_coeffs: Vec<f64>,
    rot_coeffs: Vec<f64>,
}

impl CartPoseParams {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            timestep: 0,
            source_frame: String::new(),
            target_frame: String::new(),
            target_xyz: [0.0; 3],
            target_wxyz: [1.0, 0.0, 0.0, 0.0],
            source_xyz: [0.0; 3],
            source_wxyz: [1.0, 0.0, 0.0, 0.0],
            pos_coeffs: Vec::new(),
            rot_coeffs: Vec::new(),
        }
    }

    fn validate(&self, prob: &TrajProblem) -> Result<(), ConfigError> {
        if self.timestep >= prob.n_steps() {
            return Err(ConfigError::StepRangeOutOfBounds {
                term: self.name.clone(),
                first: self.timestep as i64,
                last: self.timestep as i64,
                n_steps: prob.n_steps(),
            });
        }
        if !prob.kin().is_active_link(&self.source_frame) {
            return Err(ConfigError::invalid(format!(
                "term '{}' source frame '{}' is not an active link",
                self.name, self.source_frame
            )));
        }
        Ok(())
    }

    fn hatch_with_target(
        &self,
        target: CartTarget,
        kind: TermKind,
        prob: &mut TrajProblem,
    ) -> Result<(), ConfigError> {
        let weights = pose_weights(&self.pos_coeffs, &self.rot_coeffs, &self.name)?;
        let term = CartPoseTerm {
            name: format!("{}_{}", self.name, self.timestep),
            indices: prob.row_indices(self.timestep),
            kin: prob.kin(),
            source_link: self.source_frame.clone(),
            source_offset: isometry_from(self.source_xyz, self.source_wxyz),
            target,
        };
        match kind {
            TermKind::Cost => prob.add_cost(CostTerm::with_weights(
                Box::new(term),
                PenaltyKind::Squared,
                weights,
            )),
            TermKind::Constraint => prob.add_constraint(ConstraintTerm::with_weights(
                Box::new(term),
                ConstraintKind::Equality,
                weights,
            )),
        }
    }
}

impl Default for CartPoseParams {
    fn default() -> Self {
        Self::named("cart_pose")
    }
}

/// Link pose target fixed in space.
///
/// With an empty `target_frame` the target pose is `(target_xyz,
/// target_wxyz)` in the world; otherwise that pose offsets the named
/// frame's transform at the environment's current state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CartPoseTermInfo {
    params: CartPoseParams,
}

impl CartPoseTermInfo {
    /// Target the world pose `(xyz, wxyz)` with `source_frame` at `timestep`.
    #[must_use]
    pub fn new(name: &str, timestep: usize, source_frame: &str, xyz: [f64; 3], wxyz: [f64; 4]) -> Self {
        Self {
            params: CartPoseParams {
                name: name.to_owned(),
                timestep,
                source_frame: source_frame.to_owned(),
                target_xyz: xyz,
                target_wxyz: wxyz,
                ..CartPoseParams::named("cart_pose")
            },
        }
    }

    /// Scale position and rotation error rows.
    #[must_use]
    pub fn with_coeffs(mut self, pos: Vec<f64>, rot: Vec<f64>) -> Self {
        self.params.pos_coeffs = pos;
        self.params.rot_coeffs = rot;
        self
    }
}

impl TermInfo for CartPoseTermInfo {
    fn name(&self) -> &str {
        &self.params.name
    }

    fn type_name(&self) -> &'static str {
        "cart_pose"
    }

    fn supported_kinds(&self) -> TermKinds {
        TermKinds::cost_and_constraint()
    }

    fn hatch(&self, kind: TermKind, prob: &mut TrajProblem) -> Result<(), ConfigError> {
        self.params.validate(prob)?;
        let offset = isometry_from(self.params.target_xyz, self.params.target_wxyz);
        let target = if self.params.target_frame.is_empty() {
            offset
        } else {
            let kin = prob.kin();
            let state = prob.env().state(
                &kin.joint_names().to_vec(),
                &prob.env().current_joint_values(kin.joint_names()),
            );
            let frame = state.get(&self.params.target_frame).copied().ok_or_else(|| {
                ConfigError::invalid(format!(
                    "term '{}' target frame '{}' is unknown",
                    self.params.name, self.params.target_frame
                ))
            })?;
            frame * offset
        };
        self.params
            .hatch_with_target(CartTarget::Fixed(target), kind, prob)
    }

    fn to_config(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Link pose target attached to a moving frame.
///
/// The target frame's transform is re-read from forward kinematics at every
/// evaluation, so the target follows the trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicCartPoseTermInfo {
    params: CartPoseParams,
}

impl Default for DynamicCartPoseTermInfo {
    fn default() -> Self {
        Self {
            params: CartPoseParams::named("dyn_cart_pose"),
        }
    }
}

impl TermInfo for DynamicCartPoseTermInfo {
    fn name(&self) -> &str {
        &self.params.name
    }

    fn type_name(&self) -> &'static str {
        "dyn_cart_pose"
    }

    fn supported_kinds(&self) -> TermKinds {
        TermKinds::cost_and_constraint()
    }

    fn hatch(&self, kind: TermKind, prob: &mut TrajProblem) -> Result<(), ConfigError> {
        self.params.validate(prob)?;
        if self.params.target_frame.is_empty() {
            return Err(ConfigError::invalid(format!(
                "term '{}' requires a target frame",
                self.params.name
            )));
        }
        let target = CartTarget::Frame {
            link: self.params.target_frame.clone(),
            offset: isometry_from(self.params.target_xyz, self.params.target_wxyz),
        };
        self.params.hatch_with_target(target, kind, prob)
    }

    fn to_config(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Per-step Cartesian displacement bound on a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CartVelTermInfo {
    /// Instance name.
    pub name: String,
    /// First step of the range (inclusive).
    pub first_step: i64,
    /// Last step of the range (inclusive, `-1` = final step).
    pub last_step: i64,
    /// Link whose displacement is bounded.
    pub link: String,
    /// Maximum per-axis displacement between consecutive steps.
    pub max_displacement: f64,
}

impl Default for CartVelTermInfo {
    fn default() -> Self {
        Self {
            name: "cart_vel".to_owned(),
            first_step: 0,
            last_step: -1,
            link: String::new(),
            max_displacement: 0.0,
        }
    }
}

impl TermInfo for CartVelTermInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "cart_vel"
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
        let (first, last) =
            resolve_step_range(self.first_step, self.last_step, prob.n_steps(), &self.name)?;
        if last == first {
            return Err(ConfigError::StepRangeOutOfBounds {
                term: self.name.clone(),
                first: self.first_step,
                last: self.last_step,
                n_steps: prob.n_steps(),
            });
        }

        for t in first..last {
            let mut indices = prob.row_indices(t);
            indices.extend(prob.row_indices(t + 1));
            let term = CartVelTerm {
                name: format!("{}_{t}", self.name),
                indices,
                dof: prob.dof(),
                kin: prob.kin(),
                link: self.link.clone(),
                max_displacement: self.max_displacement,
            };
            match kind {
                TermKind::Cost => prob.add_cost(CostTerm::new(
                    Box::new(term),
                    PenaltyKind::Hinge,
                    1.0,
                ))?,
                TermKind::Constraint => prob.add_constraint(ConstraintTerm::new(
                    Box::new(term),
                    ConstraintKind::Inequality,
                    1.0,
                ))?,
            }
        }
        Ok(())
    }

    fn to_config(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

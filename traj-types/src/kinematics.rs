//! Capability traits for forward kinematics and Jacobians.
//!
//! The optimizer never owns a robot model. It consumes kinematics through
//! [`JointGroup`], which any kinematics library (or a hand-written test
//! fixture) can implement. Jacobians follow the geometric convention: a
//! `6 x n` matrix whose top three rows map joint rates to linear velocity of
//! the link origin and whose bottom three rows map to angular velocity, both
//! expressed in the world frame.

use hashbrown::HashMap;
use nalgebra::{DMatrix, DVector, Isometry3, Vector3};

/// Link name to world-frame transform, as produced by forward kinematics.
pub type TransformMap = HashMap<String, Isometry3<f64>>;

/// Joint position limits for a kinematic group.
#[derive(Debug, Clone, PartialEq)]
pub struct JointLimits {
    /// Lower position limit per joint.
    pub lower: DVector<f64>,
    /// Upper position limit per joint.
    pub upper: DVector<f64>,
}

impl JointLimits {
    /// Create limits from lower and upper vectors.
    #[must_use]
    pub fn new(lower: DVector<f64>, upper: DVector<f64>) -> Self {
        debug_assert_eq!(lower.len(), upper.len());
        Self { lower, upper }
    }

    /// Symmetric limits `[-bound, bound]` for `dof` joints.
    #[must_use]
    pub fn symmetric(bound: f64, dof: usize) -> Self {
        Self {
            lower: DVector::from_element(dof, -bound),
            upper: DVector::from_element(dof, bound),
        }
    }
}

/// A group of actuated joints with forward kinematics.
pub trait JointGroup: Send + Sync {
    /// Names of the joints in this group, in variable order.
    fn joint_names(&self) -> &[String];

    /// Names of the links whose pose depends on this group's joints.
    fn active_link_names(&self) -> &[String];

    /// Joint position limits.
    fn joint_limits(&self) -> &JointLimits;

    /// Compute world-frame transforms of all links at `q`.
    fn calc_fwd_kin(&self, q: &DVector<f64>) -> TransformMap;

    /// Geometric Jacobian (`6 x n`, world frame) of `link` at `q`.
    fn calc_jacobian(&self, q: &DVector<f64>, link: &str) -> DMatrix<f64>;

    /// Number of joints in the group.
    fn num_joints(&self) -> usize {
        self.joint_names().len()
    }

    /// Whether `name` is one of this group's active links.
    fn is_active_link(&self, name: &str) -> bool {
        self.active_link_names().iter().any(|l| l == name)
    }
}

/// Inverse kinematics capability, consumed by the IK-distance constraint.
pub trait InverseKinematics: Send + Sync {
    /// Solve for joint values reaching `target`, seeded at `seed`.
    ///
    /// Returns `None` when the solver fails to converge.
    fn calc_inv_kin(&self, seed: &DVector<f64>, target: &Isometry3<f64>) -> Option<DVector<f64>>;
}

/// Re-reference a geometric Jacobian to a new point on the link.
///
/// `ref_point` is the world-frame vector from the current reference point
/// (the link origin) to the new reference point. Linear rows become
/// `v' = v + w x r`; angular rows are unchanged.
pub fn jacobian_change_ref_point(jacobian: &mut DMatrix<f64>, ref_point: &Vector3<f64>) {
    debug_assert_eq!(jacobian.nrows(), 6);
    for j in 0..jacobian.ncols() {
        let w = Vector3::new(jacobian[(3, j)], jacobian[(4, j)], jacobian[(5, j)]);
        let dv = w.cross(ref_point);
        jacobian[(0, j)] += dv.x;
        jacobian[(1, j)] += dv.y;
        jacobian[(2, j)] += dv.z;
    }
}

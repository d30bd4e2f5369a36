//! Kinematics fixtures.

use nalgebra::{DMatrix, DVector, Isometry3, Translation3, Unit, UnitQuaternion, Vector3};
use traj_types::{InverseKinematics, JointGroup, JointLimits, TransformMap};

/// A 2-DOF translating robot carrying a single link.
///
/// Joint 0 translates the link along world X, joint 1 along world Y. The
/// link never rotates, so an axis-aligned box is a faithful collision shape.
pub struct PlanarGantry {
    joint_names: Vec<String>,
    link_names: Vec<String>,
    limits: JointLimits,
}

impl PlanarGantry {
    /// Create a gantry whose single link is named `link_name`.
    pub fn new(link_name: &str) -> Self {
        Self {
            joint_names: vec!["x".to_owned(), "y".to_owned()],
            link_names: vec![link_name.to_owned()],
            limits: JointLimits::symmetric(10.0, 2),
        }
    }
}

impl JointGroup for PlanarGantry {
    fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    fn active_link_names(&self) -> &[String] {
        &self.link_names
    }

    fn joint_limits(&self) -> &JointLimits {
        &self.limits
    }

    fn calc_fwd_kin(&self, q: &DVector<f64>) -> TransformMap {
        let mut map = TransformMap::new();
        map.insert(
            self.link_names[0].clone(),
            Isometry3::from_parts(
                Translation3::new(q[0], q[1], 0.0),
                UnitQuaternion::identity(),
            ),
        );
        map
    }

    fn calc_jacobian(&self, _q: &DVector<f64>, _link: &str) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(6, 2);
        jac[(0, 0)] = 1.0;
        jac[(1, 1)] = 1.0;
        jac
    }
}

impl InverseKinematics for PlanarGantry {
    fn calc_inv_kin(&self, _seed: &DVector<f64>, target: &Isometry3<f64>) -> Option<DVector<f64>> {
        Some(DVector::from_vec(vec![
            target.translation.x,
            target.translation.y,
        ]))
    }
}

/// An n-DOF serial chain of revolute joints.
///
/// Joint `i` rotates about `axes[i]` at the end of a fixed offset from the
/// previous joint frame; link `i` (named `link_{i+1}`) sits at joint `i`'s
/// output frame. Links are intended to carry sphere collision shapes, which
/// stay faithful under rotation.
pub struct SerialArm {
    joint_names: Vec<String>,
    link_names: Vec<String>,
    axes: Vec<Unit<Vector3<f64>>>,
    offsets: Vec<Isometry3<f64>>,
    limits: JointLimits,
}

impl SerialArm {
    /// A chain of `dof` joints with alternating Z/Y axes and `link_length`
    /// offsets along X, based at `base`.
    pub fn new(dof: usize, link_length: f64, base: Isometry3<f64>) -> Self {
        let mut axes = Vec::with_capacity(dof);
        let mut offsets = Vec::with_capacity(dof);
        for i in 0..dof {
            axes.push(if i % 2 == 0 {
                Unit::new_normalize(Vector3::z())
            } else {
                Unit::new_normalize(Vector3::y())
            });
            let offset = if i == 0 {
                base
            } else {
                Isometry3::from_parts(
                    Translation3::new(link_length, 0.0, 0.0),
                    UnitQuaternion::identity(),
                )
            };
            offsets.push(offset);
        }
        Self {
            joint_names: (0..dof).map(|i| format!("joint_{}", i + 1)).collect(),
            link_names: (0..dof).map(|i| format!("link_{}", i + 1)).collect(),
            axes,
            offsets,
            limits: JointLimits::symmetric(std::f64::consts::PI, dof),
        }
    }

    fn joint_frames(&self, q: &DVector<f64>) -> Vec<Isometry3<f64>> {
        let mut frames = Vec::with_capacity(self.axes.len());
        let mut tf = Isometry3::identity();
        for i in 0..self.axes.len() {
            tf *= self.offsets[i];
            tf *= Isometry3::from_parts(
                Translation3::identity(),
                UnitQuaternion::from_axis_angle(&self.axes[i], q[i]),
            );
            frames.push(tf);
        }
        frames
    }
}

impl JointGroup for SerialArm {
    fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    fn active_link_names(&self) -> &[String] {
        &self.link_names
    }

    fn joint_limits(&self) -> &JointLimits {
        &self.limits
    }

    fn calc_fwd_kin(&self, q: &DVector<f64>) -> TransformMap {
        let mut map = TransformMap::new();
        for (i, frame) in self.joint_frames(q).into_iter().enumerate() {
            map.insert(self.link_names[i].clone(), frame);
        }
        map
    }

    fn calc_jacobian(&self, q: &DVector<f64>, link: &str) -> DMatrix<f64> {
        let dof = self.axes.len();
        let mut jac = DMatrix::zeros(6, dof);
        let Some(link_idx) = self.link_names.iter().position(|l| l == link) else {
            return jac;
        };
        let frames = self.joint_frames(q);
        let p_link = frames[link_idx].translation.vector;
        for j in 0..=link_idx {
            // World axis of joint j and the lever arm to the link origin.
            let z = frames[j].rotation * self.axes[j].into_inner();
            let p_j = frames[j].translation.vector;
            let v = z.cross(&(p_link - p_j));
            jac[(0, j)] = v.x;
            jac[(1, j)] = v.y;
            jac[(2, j)] = v.z;
            jac[(3, j)] = z.x;
            jac[(4, j)] = z.y;
            jac[(5, j)] = z.z;
        }
        jac
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gantry_fk_translates() {
        let robot = PlanarGantry::new("boxbot");
        let q = DVector::from_vec(vec![1.5, -2.0]);
        let fk = robot.calc_fwd_kin(&q);
        let tf = fk.get("boxbot").unwrap();
        assert_relative_eq!(tf.translation.x, 1.5, epsilon = 1e-12);
        assert_relative_eq!(tf.translation.y, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_arm_jacobian_matches_finite_difference() {
        let arm = SerialArm::new(4, 0.3, Isometry3::identity());
        let q = DVector::from_vec(vec![0.3, -0.5, 0.8, 0.2]);
        let link = "link_4";
        let jac = arm.calc_jacobian(&q, link);

        let h = 1e-7;
        for j in 0..4 {
            let mut qp = q.clone();
            qp[j] += h;
            let p0 = arm.calc_fwd_kin(&q).get(link).unwrap().translation.vector;
            let p1 = arm.calc_fwd_kin(&qp).get(link).unwrap().translation.vector;
            let fd = (p1 - p0) / h;
            assert_relative_eq!(jac[(0, j)], fd.x, epsilon = 1e-5);
            assert_relative_eq!(jac[(1, j)], fd.y, epsilon = 1e-5);
            assert_relative_eq!(jac[(2, j)], fd.z, epsilon = 1e-5);
        }
    }
}

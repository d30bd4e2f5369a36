//! Concrete term functions bound to trajectory cells.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Isometry3};
use traj_qp::{forward_difference_jacobian, TermFn};
use traj_types::{InverseKinematics, JointGroup};

pub(crate) fn gather(x: &DVector<f64>, indices: &[usize]) -> DVector<f64> {
    DVector::from_iterator(indices.len(), indices.iter().map(|&i| x[i]))
}

/// 6-DOF pose error as `(dp, omega)` of `target^-1 * source`.
pub(crate) fn pose_error(relative: &Isometry3<f64>) -> DVector<f64> {
    let mut error = DVector::zeros(6);
    error[0] = relative.translation.x;
    error[1] = relative.translation.y;
    error[2] = relative.translation.z;
    if let Some((axis, angle)) = relative.rotation.axis_angle() {
        let w = axis.into_inner() * angle;
        error[3] = w.x;
        error[4] = w.y;
        error[5] = w.z;
    }
    error
}

/// A finite-difference stencil applied per joint across consecutive steps.
///
/// Row `j` evaluates `sum_s stencil[s] * x[t + s, j] - shift[j]`; the
/// Jacobian is the stencil itself, so it is exact.
pub(crate) struct FiniteDiffTerm {
    name: String,
    indices: Vec<usize>,
    dof: usize,
    stencil: Vec<f64>,
    shift: DVector<f64>,
}

impl FiniteDiffTerm {
    pub(crate) fn new(
        name: String,
        indices: Vec<usize>,
        dof: usize,
        stencil: Vec<f64>,
        shift: DVector<f64>,
    ) -> Self {
        debug_assert_eq!(indices.len(), dof * stencil.len());
        debug_assert_eq!(shift.len(), dof);
        Self {
            name,
            indices,
            dof,
            stencil,
            shift,
        }
    }
}

impl TermFn for FiniteDiffTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        self.dof
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.dof);
        for j in 0..self.dof {
            let mut v = 0.0;
            for (s, &c) in self.stencil.iter().enumerate() {
                v += c * x[self.indices[s * self.dof + j]];
            }
            out[j] = v - self.shift[j];
        }
        out
    }

    fn jacobian(&self, _x: &DVector<f64>) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(self.dof, self.indices.len());
        for j in 0..self.dof {
            for (s, &c) in self.stencil.iter().enumerate() {
                jac[(j, s * self.dof + j)] = c;
            }
        }
        jac
    }
}

/// Sum of the `1/dt` column variables minus a target; unit Jacobian.
pub struct TimeColumnSumTerm {
    name: String,
    indices: Vec<usize>,
    target: f64,
}

impl TimeColumnSumTerm {
    /// Create over the given `1/dt` cell indices.
    #[must_use]
    pub fn new(name: String, indices: Vec<usize>, target: f64) -> Self {
        Self {
            name,
            indices,
            target,
        }
    }
}

impl TermFn for TimeColumnSumTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        1
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        let total: f64 = self.indices.iter().map(|&i| x[i]).sum();
        DVector::from_vec(vec![total - self.target])
    }

    fn jacobian(&self, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, self.indices.len(), 1.0)
    }
}

/// Total trajectory duration `sum_t 1/(1/dt)_t` minus a limit.
pub(crate) struct TimeDeltaSumTerm {
    name: String,
    indices: Vec<usize>,
    limit: f64,
}

impl TimeDeltaSumTerm {
    pub(crate) fn new(name: String, indices: Vec<usize>, limit: f64) -> Self {
        Self {
            name,
            indices,
            limit,
        }
    }
}

impl TermFn for TimeDeltaSumTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        1
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        let total: f64 = self.indices.iter().map(|&i| 1.0 / x[i]).sum();
        DVector::from_vec(vec![total - self.limit])
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(1, self.indices.len());
        for (col, &i) in self.indices.iter().enumerate() {
            jac[(0, col)] = -1.0 / (x[i] * x[i]);
        }
        jac
    }
}

/// Where a Cartesian pose term finds its target frame.
pub(crate) enum CartTarget {
    /// A world pose resolved at hatch time.
    Fixed(Isometry3<f64>),
    /// A kinematic frame read at every evaluation.
    Frame {
        link: String,
        offset: Isometry3<f64>,
    },
}

/// 6-DOF pose error of a source link against a target frame.
pub(crate) struct CartPoseTerm {
    pub(crate) name: String,
    pub(crate) indices: Vec<usize>,
    pub(crate) kin: Arc<dyn JointGroup>,
    pub(crate) source_link: String,
    pub(crate) source_offset: Isometry3<f64>,
    pub(crate) target: CartTarget,
}

impl TermFn for CartPoseTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        6
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        let q = gather(x, &self.indices);
        let fk = self.kin.calc_fwd_kin(&q);
        let source = fk
            .get(&self.source_link)
            .copied()
            .unwrap_or_else(Isometry3::identity)
            * self.source_offset;
        let target = match &self.target {
            CartTarget::Fixed(tf) => *tf,
            CartTarget::Frame { link, offset } => {
                fk.get(link).copied().unwrap_or_else(Isometry3::identity) * *offset
            }
        };
        pose_error(&(target.inverse() * source))
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        forward_difference_jacobian(self, x)
    }
}

/// Cartesian displacement bound between consecutive steps.
///
/// Six rows: `dp - max` and `-dp - max`, all required `<= 0`, bounding the
/// per-axis displacement of a link.
pub(crate) struct CartVelTerm {
    pub(crate) name: String,
    pub(crate) indices: Vec<usize>,
    pub(crate) dof: usize,
    pub(crate) kin: Arc<dyn JointGroup>,
    pub(crate) link: String,
    pub(crate) max_displacement: f64,
}

impl TermFn for CartVelTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        6
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        let all = gather(x, &self.indices);
        let q0 = DVector::from_iterator(self.dof, all.iter().take(self.dof).copied());
        let q1 = DVector::from_iterator(self.dof, all.iter().skip(self.dof).copied());
        let p0 = self
            .kin
            .calc_fwd_kin(&q0)
            .get(&self.link)
            .copied()
            .unwrap_or_else(Isometry3::identity)
            .translation
            .vector;
        let p1 = self
            .kin
            .calc_fwd_kin(&q1)
            .get(&self.link)
            .copied()
            .unwrap_or_else(Isometry3::identity)
            .translation
            .vector;
        let dp = p1 - p0;
        let mut out = DVector::zeros(6);
        for i in 0..3 {
            out[i] = dp[i] - self.max_displacement;
            out[3 + i] = -dp[i] - self.max_displacement;
        }
        out
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        forward_difference_jacobian(self, x)
    }
}

/// Damped inverse of the smallest singular value of a link Jacobian.
pub(crate) struct AvoidSingularityTerm {
    pub(crate) name: String,
    pub(crate) indices: Vec<usize>,
    pub(crate) kin: Arc<dyn JointGroup>,
    pub(crate) link: String,
    pub(crate) lambda: f64,
}

impl TermFn for AvoidSingularityTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        1
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        let q = gather(x, &self.indices);
        let jac = self.kin.calc_jacobian(&q, &self.link);
        let singular_values = jac.singular_values();
        let smallest = singular_values
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        DVector::from_vec(vec![1.0 / (smallest + self.lambda)])
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        forward_difference_jacobian(self, x)
    }
}

/// User-supplied error function over one trajectory row.
pub(crate) struct UserFnTerm {
    pub(crate) name: String,
    pub(crate) indices: Vec<usize>,
    pub(crate) rows: usize,
    pub(crate) error_fn: Arc<dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync>,
    pub(crate) jacobian_fn: Option<Arc<dyn Fn(&DVector<f64>) -> DMatrix<f64> + Send + Sync>>,
}

impl TermFn for UserFnTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        self.rows
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        (self.error_fn)(&gather(x, &self.indices))
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        match &self.jacobian_fn {
            Some(f) => f(&gather(x, &self.indices)),
            None => forward_difference_jacobian(self, x),
        }
    }
}

/// Joint position limits as `2 * dof` inequality rows.
///
/// Rows `[x - upper; lower - x]`, identity-stencil Jacobian.
pub struct JointPositionBoundsTerm {
    name: String,
    indices: Vec<usize>,
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl JointPositionBoundsTerm {
    /// Create over one trajectory row with the given limits.
    #[must_use]
    pub fn new(
        name: String,
        indices: Vec<usize>,
        lower: DVector<f64>,
        upper: DVector<f64>,
    ) -> Self {
        debug_assert_eq!(indices.len(), lower.len());
        debug_assert_eq!(indices.len(), upper.len());
        Self {
            name,
            indices,
            lower,
            upper,
        }
    }
}

impl TermFn for JointPositionBoundsTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        2 * self.indices.len()
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        let dof = self.indices.len();
        let mut out = DVector::zeros(2 * dof);
        for (j, &i) in self.indices.iter().enumerate() {
            out[j] = x[i] - self.upper[j];
            out[dof + j] = self.lower[j] - x[i];
        }
        out
    }

    fn jacobian(&self, _x: &DVector<f64>) -> DMatrix<f64> {
        let dof = self.indices.len();
        let mut jac = DMatrix::zeros(2 * dof, dof);
        for j in 0..dof {
            jac[(j, j)] = 1.0;
            jac[(dof + j, j)] = -1.0;
        }
        jac
    }
}

/// Distance from a trajectory row to an IK solution for a target pose.
///
/// The IK runs from a seed row toward the target; the value is
/// `x - ik_solution` with an identity Jacobian. The seed row is read from
/// the full variable vector but deliberately left out of the sparsity.
pub struct IkDistanceTerm {
    name: String,
    indices: Vec<usize>,
    seed_indices: Vec<usize>,
    ik: Arc<dyn InverseKinematics>,
    target: Isometry3<f64>,
}

impl IkDistanceTerm {
    /// Create with constraint row `indices` and seed row `seed_indices`.
    #[must_use]
    pub fn new(
        name: String,
        indices: Vec<usize>,
        seed_indices: Vec<usize>,
        ik: Arc<dyn InverseKinematics>,
        target: Isometry3<f64>,
    ) -> Self {
        Self {
            name,
            indices,
            seed_indices,
            ik,
            target,
        }
    }
}

impl TermFn for IkDistanceTerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_values(&self) -> usize {
        self.indices.len()
    }

    fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn values(&self, x: &DVector<f64>) -> DVector<f64> {
        let seed = gather(x, &self.seed_indices);
        let current = gather(x, &self.indices);
        match self.ik.calc_inv_kin(&seed, &self.target) {
            Some(solution) => current - solution,
            None => DVector::zeros(self.indices.len()),
        }
    }

    fn jacobian(&self, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(self.indices.len(), self.indices.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    #[test]
    fn test_finite_diff_velocity_stencil() {
        // Two steps, two joints: v = x1 - x0.
        let term = FiniteDiffTerm::new(
            "vel".to_owned(),
            vec![0, 1, 2, 3],
            2,
            vec![-1.0, 1.0],
            DVector::zeros(2),
        );
        let x = DVector::from_vec(vec![1.0, 2.0, 4.0, 6.5]);
        let v = term.values(&x);
        assert_relative_eq!(v[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(v[1], 4.5, epsilon = 1e-12);

        let jac = term.jacobian(&x);
        assert_relative_eq!(jac[(0, 0)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(jac[(0, 2)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(jac[(1, 1)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(jac[(1, 3)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_acceleration_stencil_on_quadratic() {
        // x(t) = t^2 sampled at t = 0, 1, 2 has curvature 2.
        let term = FiniteDiffTerm::new(
            "acc".to_owned(),
            vec![0, 1, 2],
            1,
            vec![1.0, -2.0, 1.0],
            DVector::zeros(1),
        );
        let x = DVector::from_vec(vec![0.0, 1.0, 4.0]);
        assert_relative_eq!(term.values(&x)[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_jerk_stencil_on_cubic() {
        // x(t) = t^3 sampled at t = 0..4 has third derivative 6.
        let term = FiniteDiffTerm::new(
            "jerk".to_owned(),
            vec![0, 1, 2, 3, 4],
            1,
            vec![-0.5, 1.0, 0.0, -1.0, 0.5],
            DVector::zeros(1),
        );
        let x = DVector::from_vec(vec![0.0, 1.0, 8.0, 27.0, 64.0]);
        assert_relative_eq!(term.values(&x)[0], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_time_delta_sum_jacobian() {
        let term = TimeDeltaSumTerm::new("tt".to_owned(), vec![0, 1], 0.0);
        let x = DVector::from_vec(vec![2.0, 4.0]);
        // dt = 0.5 + 0.25.
        assert_relative_eq!(term.values(&x)[0], 0.75, epsilon = 1e-12);
        let jac = term.jacobian(&x);
        assert_relative_eq!(jac[(0, 0)], -0.25, epsilon = 1e-12);
        assert_relative_eq!(jac[(0, 1)], -1.0 / 16.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_error_sign_convention() {
        let target = Isometry3::from_parts(
            Translation3::new(1.0, 0.0, 0.0),
            UnitQuaternion::identity(),
        );
        let source = Isometry3::from_parts(
            Translation3::new(1.0, 0.5, 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.3),
        );
        let error = pose_error(&(target.inverse() * source));
        assert_relative_eq!(error[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(error[1], 0.5, epsilon = 1e-12);
        assert_relative_eq!(error[5], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_joint_bounds_rows() {
        let term = JointPositionBoundsTerm::new(
            "bounds".to_owned(),
            vec![0, 1],
            DVector::from_vec(vec![-1.0, -2.0]),
            DVector::from_vec(vec![1.0, 2.0]),
        );
        let x = DVector::from_vec(vec![0.5, -2.5]);
        let v = term.values(&x);
        // Joint 0 inside limits: both rows negative.
        assert!(v[0] < 0.0 && v[2] < 0.0);
        // Joint 1 below lower limit: lower row positive.
        assert_relative_eq!(v[3], 0.5, epsilon = 1e-12);
    }
}

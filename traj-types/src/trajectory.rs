//! The trajectory matrix and interpolation helpers.

use nalgebra::{DMatrix, DVector};

/// A discrete-time trajectory.
///
/// Shape `(T, D)`: row `t` holds the joint values at time step `t`. When
/// time is an optimization variable the matrix carries one extra trailing
/// column storing `1/dt` for each step, giving shape `(T, D + 1)`.
///
/// The optimizer sees the row-major flattening of this matrix as its flat
/// decision-variable vector.
pub type TrajArray = DMatrix<f64>;

/// Linearly interpolate from `start` to `end` over `steps` rows.
///
/// Row 0 equals `start`, row `steps - 1` equals `end`. With `steps == 1`
/// the single row equals `end`.
#[must_use]
pub fn interpolate(start: &DVector<f64>, end: &DVector<f64>, steps: usize) -> TrajArray {
    let dof = start.len();
    let mut traj = TrajArray::zeros(steps, dof);
    if steps == 1 {
        traj.row_mut(0).copy_from(&end.transpose());
        return traj;
    }
    let denom = (steps - 1) as f64;
    for t in 0..steps {
        let alpha = t as f64 / denom;
        for j in 0..dof {
            traj[(t, j)] = start[j] + alpha * (end[j] - start[j]);
        }
    }
    traj
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_interpolate_endpoints() {
        let start = DVector::from_vec(vec![0.0, -1.0]);
        let end = DVector::from_vec(vec![2.0, 3.0]);
        let traj = interpolate(&start, &end, 5);

        assert_eq!(traj.nrows(), 5);
        assert_eq!(traj.ncols(), 2);
        assert_relative_eq!(traj[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(traj[(0, 1)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(traj[(4, 0)], 2.0, epsilon = 1e-12);
        assert_relative_eq!(traj[(4, 1)], 3.0, epsilon = 1e-12);
        assert_relative_eq!(traj[(2, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(traj[(2, 1)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolate_single_step() {
        let start = DVector::from_vec(vec![0.0]);
        let end = DVector::from_vec(vec![5.0]);
        let traj = interpolate(&start, &end, 1);
        assert_relative_eq!(traj[(0, 0)], 5.0, epsilon = 1e-12);
    }
}

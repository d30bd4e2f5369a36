//! The environment capability trait.

use nalgebra::DVector;

use crate::contact::{ContinuousContactManager, DiscreteContactManager};
use crate::kinematics::TransformMap;

/// A world the robot moves through.
///
/// The optimizer treats the environment as immutable; the only mutable
/// handles it ever acquires are freshly constructed contact managers, which
/// the collision evaluators then own for their lifetime.
pub trait Environment: Send + Sync {
    /// Current values of the named joints.
    fn current_joint_values(&self, joint_names: &[String]) -> DVector<f64>;

    /// World-frame transforms of every link at joint state `q`.
    ///
    /// Unlike [`JointGroup::calc_fwd_kin`](crate::JointGroup::calc_fwd_kin)
    /// this resolves links outside the kinematic group as well, which is
    /// what a dynamic environment (movable obstacles) requires.
    fn state(&self, joint_names: &[String], q: &DVector<f64>) -> TransformMap;

    /// Names of every movable link in the environment.
    fn active_link_names(&self) -> Vec<String>;

    /// Construct a discrete contact manager over this environment.
    fn discrete_contact_manager(&self) -> Box<dyn DiscreteContactManager>;

    /// Construct a continuous (cast) contact manager over this environment.
    fn continuous_contact_manager(&self) -> Box<dyn ContinuousContactManager>;
}

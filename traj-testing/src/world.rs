//! A static-obstacle environment fixture.

use std::sync::Arc;

use nalgebra::{DVector, Isometry3};
use traj_types::{
    ContinuousContactManager, DiscreteContactManager, Environment, JointGroup, TransformMap,
};

use crate::contact::{FixtureContactManager, Shape};

/// An [`Environment`] over one robot and a set of static obstacles.
pub struct FixtureWorld {
    robot: Arc<dyn JointGroup>,
    robot_shapes: Vec<(String, Shape)>,
    obstacles: Vec<(String, Shape, Isometry3<f64>)>,
    current: DVector<f64>,
}

impl FixtureWorld {
    /// Create a world.
    ///
    /// `robot_shapes` attaches a collision shape to each robot link;
    /// `obstacles` are fixed in the world; `current` is the robot's current
    /// joint state.
    pub fn new(
        robot: Arc<dyn JointGroup>,
        robot_shapes: Vec<(String, Shape)>,
        obstacles: Vec<(String, Shape, Isometry3<f64>)>,
        current: DVector<f64>,
    ) -> Self {
        Self {
            robot,
            robot_shapes,
            obstacles,
            current,
        }
    }

    fn build_manager(&self) -> FixtureContactManager {
        let mut objects = self.robot_shapes.clone();
        for (name, shape, _) in &self.obstacles {
            objects.push((name.clone(), shape.clone()));
        }
        let mut manager = FixtureContactManager::new(objects);
        for (name, _, tf) in &self.obstacles {
            manager.set_static_transform(name, *tf);
        }
        manager
    }
}

impl Environment for FixtureWorld {
    fn current_joint_values(&self, _joint_names: &[String]) -> DVector<f64> {
        self.current.clone()
    }

    fn state(&self, _joint_names: &[String], q: &DVector<f64>) -> TransformMap {
        let mut map = self.robot.calc_fwd_kin(q);
        for (name, _, tf) in &self.obstacles {
            map.insert(name.clone(), *tf);
        }
        map
    }

    fn active_link_names(&self) -> Vec<String> {
        self.robot.active_link_names().to_vec()
    }

    fn discrete_contact_manager(&self) -> Box<dyn DiscreteContactManager> {
        Box::new(self.build_manager())
    }

    fn continuous_contact_manager(&self) -> Box<dyn ContinuousContactManager> {
        Box::new(self.build_manager())
    }
}

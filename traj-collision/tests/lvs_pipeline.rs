//! Pipeline-level tests for the LVS collision evaluators.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nalgebra::{DVector, Isometry3, Translation3, UnitQuaternion};
use traj_collision::{
    CollisionCache, CollisionConfig, CollisionEvaluator, LvsContinuousCollisionEvaluator,
    LvsDiscreteCollisionEvaluator,
};
use traj_testing::{FixtureWorld, PlanarGantry, Shape};
use traj_types::{
    ContactRequest, ContactResultMap, ContinuousContactManager, DiscreteContactManager,
    Environment, JointGroup, TransformMap,
};

fn at(x: f64, y: f64) -> Isometry3<f64> {
    Isometry3::from_parts(Translation3::new(x, y, 0.0), UnitQuaternion::identity())
}

/// A contact manager that only counts how often it is queried.
struct CountingManager {
    calls: Arc<AtomicUsize>,
}

impl DiscreteContactManager for CountingManager {
    fn set_active_collision_objects(&mut self, _names: &[String]) {}
    fn set_default_collision_margin(&mut self, _margin: f64) {}
    fn set_collision_object_transform(&mut self, _link: &str, _tf: &Isometry3<f64>) {}
    fn contact_test(&mut self, _results: &mut ContactResultMap, _request: &ContactRequest) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

impl ContinuousContactManager for CountingManager {
    fn set_active_collision_objects(&mut self, _names: &[String]) {}
    fn set_default_collision_margin(&mut self, _margin: f64) {}
    fn set_collision_object_transform(&mut self, _link: &str, _tf: &Isometry3<f64>) {}
    fn set_collision_object_transforms(
        &mut self,
        _link: &str,
        _tf0: &Isometry3<f64>,
        _tf1: &Isometry3<f64>,
    ) {
    }
    fn contact_test(&mut self, _results: &mut ContactResultMap, _request: &ContactRequest) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

struct CountingEnv {
    calls: Arc<AtomicUsize>,
}

impl Environment for CountingEnv {
    fn current_joint_values(&self, _joint_names: &[String]) -> DVector<f64> {
        DVector::zeros(2)
    }
    fn state(&self, _joint_names: &[String], _q: &DVector<f64>) -> TransformMap {
        TransformMap::new()
    }
    fn active_link_names(&self) -> Vec<String> {
        Vec::new()
    }
    fn discrete_contact_manager(&self) -> Box<dyn DiscreteContactManager> {
        Box::new(CountingManager {
            calls: Arc::clone(&self.calls),
        })
    }
    fn continuous_contact_manager(&self) -> Box<dyn ContinuousContactManager> {
        Box::new(CountingManager {
            calls: Arc::clone(&self.calls),
        })
    }
}

fn counting_continuous(
    lvs: f64,
) -> (Arc<AtomicUsize>, LvsContinuousCollisionEvaluator) {
    let calls = Arc::new(AtomicUsize::new(0));
    let env = Arc::new(CountingEnv {
        calls: Arc::clone(&calls),
    });
    let manip = Arc::new(PlanarGantry::new("boxbot"));
    let mut config = CollisionConfig::new(0.02, 1.0);
    config.longest_valid_segment_length = lvs;
    let evaluator = LvsContinuousCollisionEvaluator::new(
        manip,
        env,
        config,
        Arc::new(Mutex::new(CollisionCache::default())),
        false,
    );
    (calls, evaluator)
}

#[test]
fn short_step_uses_one_cast_segment() {
    let (calls, evaluator) = counting_continuous(0.1);
    let x0 = DVector::zeros(2);
    let x1 = DVector::from_vec(vec![0.05, 0.0]);
    evaluator.calc_collision_data(&x0, &x1, [false, false], 3);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

#[test]
fn long_step_subdivides_by_segment_length() {
    let (calls, evaluator) = counting_continuous(0.1);
    let x0 = DVector::zeros(2);
    let x1 = DVector::from_vec(vec![0.35, 0.0]);
    evaluator.calc_collision_data(&x0, &x1, [false, false], 3);
    // d = 0.35, L = 0.1: ceil(3.5) + 1 = 5 sub-states, 4 cast segments.
    assert_eq!(calls.load(Ordering::Relaxed), 4);
}

#[test]
fn discrete_variant_tests_every_substate() {
    let calls = Arc::new(AtomicUsize::new(0));
    let env = Arc::new(CountingEnv {
        calls: Arc::clone(&calls),
    });
    let manip = Arc::new(PlanarGantry::new("boxbot"));
    let mut config = CollisionConfig::new(0.02, 1.0);
    config.longest_valid_segment_length = 0.1;
    let evaluator = LvsDiscreteCollisionEvaluator::new(
        manip,
        env,
        config,
        Arc::new(Mutex::new(CollisionCache::default())),
        false,
    );

    let x0 = DVector::zeros(2);
    let x1 = DVector::from_vec(vec![0.35, 0.0]);
    evaluator.calc_collision_data(&x0, &x1, [false, false], 3);
    // 5 sub-states, one discrete test each.
    assert_eq!(calls.load(Ordering::Relaxed), 5);

    // Below the segment length the variant still samples both endpoints.
    calls.store(0, Ordering::Relaxed);
    let x1 = DVector::from_vec(vec![0.05, 0.0]);
    evaluator.calc_collision_data(&x0, &x1, [false, false], 3);
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[test]
fn cache_hit_returns_identical_snapshot() {
    let (calls, evaluator) = counting_continuous(0.1);
    let x0 = DVector::zeros(2);
    let x1 = DVector::from_vec(vec![0.35, 0.0]);

    let first = evaluator.calc_collision_data(&x0, &x1, [false, false], 3);
    let calls_after_first = calls.load(Ordering::Relaxed);
    let second = evaluator.calc_collision_data(&x0, &x1, [false, false], 3);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::Relaxed), calls_after_first);
}

fn gantry_world(obstacles: Vec<(String, Shape, Isometry3<f64>)>) -> LvsContinuousCollisionEvaluator {
    let robot = Arc::new(PlanarGantry::new("boxbot"));
    let env = Arc::new(FixtureWorld::new(
        Arc::clone(&robot) as Arc<dyn JointGroup>,
        vec![("boxbot".to_owned(), Shape::box_shape(0.5, 0.5, 0.5))],
        obstacles,
        DVector::zeros(2),
    ));
    let mut config = CollisionConfig::new(0.02, 1.0);
    config.margin_buffer = 0.05;
    config.longest_valid_segment_length = 0.05;
    LvsContinuousCollisionEvaluator::new(
        robot,
        env,
        config,
        Arc::new(Mutex::new(CollisionCache::default())),
        false,
    )
}

#[test]
fn gradient_points_away_from_obstacle() {
    // Obstacle to the +X of the robot, overlapping along X.
    let evaluator = gantry_world(vec![(
        "wall".to_owned(),
        Shape::box_shape(1.0, 1.0, 1.0),
        at(0.6, 0.0),
    )]);

    let x = DVector::zeros(2);
    let data = evaluator.calc_collision_data(&x, &x, [false, false], 3);
    assert_eq!(data.gradient_results_sets.len(), 1);

    let set = &data.gradient_results_sets[0];
    assert!(set.max_error() > 0.0, "robot should be in violation");
    let link_a = &set.results[0].gradients[0];
    assert!(link_a.has_gradient);
    // Distance grows as the robot moves -X: d(dist)/dx < 0.
    assert!(link_a.gradient[0] < 0.0);
    assert!(link_a.gradient[1].abs() < 1e-9);
}

#[test]
fn sets_are_ordered_by_worst_error_when_truncated() {
    // Two obstacles: one deeply penetrating, one grazing.
    let evaluator = gantry_world(vec![
        (
            "grazing".to_owned(),
            Shape::box_shape(1.0, 1.0, 1.0),
            at(0.0, 0.76),
        ),
        (
            "deep".to_owned(),
            Shape::box_shape(1.0, 1.0, 1.0),
            at(0.4, 0.0),
        ),
    ]);

    let x = DVector::zeros(2);
    // bounds_size 1 < set count forces the ordering pass.
    let data = evaluator.calc_collision_data(&x, &x, [false, false], 1);
    assert_eq!(data.gradient_results_sets.len(), 2);
    let worst = data.gradient_results_sets[0].max_error_with_buffer();
    let next = data.gradient_results_sets[1].max_error_with_buffer();
    assert!(worst >= next);
    assert_eq!(
        data.gradient_results_sets[0].key,
        ("boxbot".to_owned(), "deep".to_owned())
    );
}

#[test]
fn no_contacts_is_an_empty_result_not_an_error() {
    let evaluator = gantry_world(vec![(
        "far".to_owned(),
        Shape::box_shape(1.0, 1.0, 1.0),
        at(5.0, 5.0),
    )]);
    let x0 = DVector::zeros(2);
    let x1 = DVector::from_vec(vec![0.1, 0.0]);
    let data = evaluator.calc_collision_data(&x0, &x1, [false, false], 3);
    assert!(data.gradient_results_sets.is_empty());
    assert!(data.contact_results_map.is_empty());
}

/// Environment with a movable obstacle outside the kinematic group.
struct DynamicWorld {
    robot: Arc<PlanarGantry>,
}

impl Environment for DynamicWorld {
    fn current_joint_values(&self, _joint_names: &[String]) -> DVector<f64> {
        DVector::zeros(2)
    }

    fn state(&self, _joint_names: &[String], q: &DVector<f64>) -> TransformMap {
        let mut map = self.robot.calc_fwd_kin(q);
        // The cart's true pose is only known through the environment.
        map.insert("cart".to_owned(), at(0.6, 0.0));
        map
    }

    fn active_link_names(&self) -> Vec<String> {
        vec!["boxbot".to_owned(), "cart".to_owned()]
    }

    fn discrete_contact_manager(&self) -> Box<dyn DiscreteContactManager> {
        Box::new(self.build_manager())
    }

    fn continuous_contact_manager(&self) -> Box<dyn ContinuousContactManager> {
        Box::new(self.build_manager())
    }
}

impl DynamicWorld {
    fn build_manager(&self) -> traj_testing::FixtureContactManager {
        let mut manager = traj_testing::FixtureContactManager::new(vec![
            ("boxbot".to_owned(), Shape::box_shape(0.5, 0.5, 0.5)),
            ("cart".to_owned(), Shape::box_shape(1.0, 1.0, 1.0)),
        ]);
        // Stale pose: far away until the evaluator stages the real one.
        manager.set_static_transform("cart", at(100.0, 0.0));
        manager
    }
}

#[test]
fn dynamic_environment_stages_movable_obstacles() {
    let robot = Arc::new(PlanarGantry::new("boxbot"));
    let env = Arc::new(DynamicWorld {
        robot: Arc::clone(&robot),
    });
    let mut config = CollisionConfig::new(0.02, 1.0);
    config.margin_buffer = 0.05;

    let x = DVector::zeros(2);

    // Without dynamic staging the stale cart pose hides the contact.
    let static_eval = LvsContinuousCollisionEvaluator::new(
        Arc::clone(&robot) as Arc<dyn JointGroup>,
        Arc::clone(&env) as Arc<dyn Environment>,
        config.clone(),
        Arc::new(Mutex::new(CollisionCache::default())),
        false,
    );
    let data = static_eval.calc_collision_data(&x, &x, [false, false], 3);
    assert!(data.gradient_results_sets.is_empty());

    // With staging, the cart's environment pose is pushed to the manager
    // and the penetration is found.
    let dynamic_eval = LvsContinuousCollisionEvaluator::new(
        robot,
        env,
        config,
        Arc::new(Mutex::new(CollisionCache::default())),
        true,
    );
    let data = dynamic_eval.calc_collision_data(&x, &x, [false, false], 3);
    assert_eq!(data.gradient_results_sets.len(), 1);
    assert_eq!(
        data.gradient_results_sets[0].key,
        ("boxbot".to_owned(), "cart".to_owned())
    );
    assert!(data.gradient_results_sets[0].max_error() > 0.0);
}

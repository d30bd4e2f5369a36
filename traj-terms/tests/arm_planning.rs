//! A 7-DOF arm plans around an obstacle while reaching a Cartesian pose.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};

use nalgebra::{DVector, Isometry3};
use serde_json::json;
use traj_collision::{
    CollisionCache, CollisionConfig, CollisionEvaluator, LvsDiscreteCollisionEvaluator,
};
use traj_sqp::{SqpParams, SqpStatus};
use traj_terms::{construct_problem, optimize_problem, ProblemConstructionInfo};
use traj_testing::{FixtureWorld, SerialArm, Shape};
use traj_types::JointGroup;

const LINK_RADIUS: f64 = 0.08;

fn arm_shapes(arm: &SerialArm) -> Vec<(String, Shape)> {
    arm.active_link_names()
        .iter()
        .map(|l| (l.clone(), Shape::sphere(LINK_RADIUS)))
        .collect()
}

#[test]
fn arm_reaches_pose_while_clearing_the_obstacle() {
    let arm = Arc::new(SerialArm::new(7, 0.3, Isometry3::identity()));
    let start = DVector::from_vec(vec![-1.832, -0.332, -1.011, -1.437, -1.1, -1.926, 3.074]);
    let goal = &start + DVector::from_vec(vec![0.8, 0.4, 0.0, 0.6, 0.0, 0.0, 0.0]);

    // Obstacle centered on the end effector's mid-trajectory position, so
    // the interpolated seed is guaranteed to collide.
    let mid = (&start + &goal) / 2.0;
    let ee_mid = arm
        .calc_fwd_kin(&mid)
        .get("link_7")
        .copied()
        .unwrap()
        .translation
        .vector;
    let obstacle = (
        "ball".to_owned(),
        Shape::sphere(0.1),
        Isometry3::translation(ee_mid.x, ee_mid.y, ee_mid.z),
    );

    let env = Arc::new(FixtureWorld::new(
        Arc::clone(&arm) as Arc<dyn JointGroup>,
        arm_shapes(&arm),
        vec![obstacle],
        start.clone(),
    ));

    // Pose target: where the goal configuration puts the end effector.
    let target = *arm.calc_fwd_kin(&goal).get("link_7").unwrap();
    let q = target.rotation;

    let description = json!({
        "basic_info": {
            "n_steps": 5,
            "manipulator": "arm",
            "fixed_timesteps": [0],
        },
        "init_info": {
            "method": "joint_interpolated",
            "data": [goal.iter().copied().collect::<Vec<f64>>()],
        },
        "costs": [
            {"type": "joint_vel", "name": "smooth", "coeffs": [1.0]},
            {
                "type": "cart_pose",
                "name": "reach",
                "timestep": 4,
                "source_frame": "link_7",
                "target_xyz": [target.translation.x, target.translation.y, target.translation.z],
                "target_wxyz": [q.w, q.i, q.j, q.k],
                "pos_coeffs": [10.0],
                "rot_coeffs": [10.0],
            },
        ],
        "constraints": [
            {
                "type": "collision",
                "name": "safety",
                "evaluator": "continuous",
                "margin": 0.02,
                "coeff": 20.0,
                "margin_buffer": 0.03,
                "longest_valid_segment_length": 0.05,
            },
        ],
    });

    let pci = ProblemConstructionInfo::from_json(&description).unwrap();
    let mut prob = construct_problem(&pci, Arc::clone(&env) as _, Arc::clone(&arm) as _).unwrap();

    let mut params = SqpParams::default();
    params.max_iterations = 500;
    let result = optimize_problem(&mut prob, &params, Vec::new());

    assert!(
        matches!(
            result.status,
            SqpStatus::NlpConverged | SqpStatus::IterationLimit
        ),
        "unexpected status {:?}",
        result.status
    );

    // The final trajectory clears the obstacle (checked discretely with a
    // tight margin at LVS resolution).
    let mut check_config = CollisionConfig::new(0.01, 1.0);
    check_config.margin_buffer = 0.0;
    check_config.longest_valid_segment_length = 0.05;
    let checker = LvsDiscreteCollisionEvaluator::new(
        Arc::clone(&arm) as Arc<dyn JointGroup>,
        env,
        check_config,
        Arc::new(Mutex::new(CollisionCache::default())),
        false,
    );
    for t in 0..4 {
        let x0 = DVector::from_iterator(7, (0..7).map(|j| result.traj[(t, j)]));
        let x1 = DVector::from_iterator(7, (0..7).map(|j| result.traj[(t + 1, j)]));
        let data = checker.calc_collision_data(&x0, &x1, [false, false], 3);
        assert!(
            data.gradient_results_sets.is_empty(),
            "segment {t} still in contact"
        );
    }

    // The end effector landed near the requested pose.
    let final_q = DVector::from_iterator(7, (0..7).map(|j| result.traj[(4, j)]));
    let ee = *arm.calc_fwd_kin(&final_q).get("link_7").unwrap();
    let pos_err = (ee.translation.vector - target.translation.vector).norm();
    assert!(pos_err < 0.1, "pose error {pos_err}");
}

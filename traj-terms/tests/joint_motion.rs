//! Joint-motion term semantics and the constraint-kit kernels.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::{DVector, Isometry3, Translation3, UnitQuaternion};
use serde_json::json;
use traj_qp::TermFn;
use traj_sqp::{SqpParams, SqpStatus};
use traj_terms::{
    construct_problem, optimize_problem, IkDistanceTerm, JointPositionBoundsTerm,
    ProblemConstructionInfo, TimeColumnSumTerm,
};
use traj_testing::{FixtureWorld, PlanarGantry, Shape};
use traj_types::{Environment, JointGroup};

fn gantry_setup(current: Vec<f64>) -> (Arc<dyn Environment>, Arc<PlanarGantry>) {
    let robot = Arc::new(PlanarGantry::new("boxbot"));
    let env = Arc::new(FixtureWorld::new(
        Arc::clone(&robot) as Arc<dyn JointGroup>,
        vec![("boxbot".to_owned(), Shape::box_shape(0.5, 0.5, 0.5))],
        Vec::new(),
        DVector::from_vec(current),
    ));
    (env, robot)
}

#[test]
fn zero_tolerance_velocity_cost_is_weighted_sum_of_squares() {
    let (env, kin) = gantry_setup(vec![0.0, 0.0]);
    let json = json!({
        "basic_info": {"n_steps": 3, "manipulator": "gantry"},
        "init_info": {"method": "given", "data": [[0.0, 0.0], [0.5, -0.25], [1.0, 0.5]]},
        "costs": [{"type": "joint_vel", "name": "smooth", "coeffs": [2.0, 4.0]}],
    });
    let pci = ProblemConstructionInfo::from_json(&json).unwrap();
    let prob = construct_problem(&pci, env, kin).unwrap();

    let x = prob.qp().variable_values();
    let costs = prob.qp().evaluate_exact_costs(&x);
    // Two per-step terms. Step 0: dx = (0.5, -0.25); step 1: (0.5, 0.75).
    let expected_0 = 2.0 * 0.25 + 4.0 * 0.0625;
    let expected_1 = 2.0 * 0.25 + 4.0 * 0.5625;
    assert_eq!(costs.len(), 2);
    assert_relative_eq!(costs[0], expected_0, epsilon = 1e-12);
    assert_relative_eq!(costs[1], expected_1, epsilon = 1e-12);
}

#[test]
fn velocity_within_tolerance_band_costs_nothing() {
    let (env, kin) = gantry_setup(vec![0.0, 0.0]);
    let json = json!({
        "basic_info": {"n_steps": 3, "manipulator": "gantry"},
        "init_info": {"method": "given", "data": [[0.0, 0.0], [0.5, -0.25], [1.0, 0.5]]},
        "costs": [{
            "type": "joint_vel",
            "name": "band",
            "coeffs": [3.0],
            "upper_tols": [1.0],
            "lower_tols": [-1.0],
        }],
    });
    let pci = ProblemConstructionInfo::from_json(&json).unwrap();
    let prob = construct_problem(&pci, env, kin).unwrap();

    let x = prob.qp().variable_values();
    let costs = prob.qp().evaluate_exact_costs(&x);
    // All velocities sit inside [-1, 1]: every hinge is slack.
    assert_relative_eq!(costs.sum(), 0.0, epsilon = 1e-12);
}

#[test]
fn velocity_outside_band_pays_the_hinge() {
    let (env, kin) = gantry_setup(vec![0.0, 0.0]);
    let json = json!({
        "basic_info": {"n_steps": 2, "manipulator": "gantry"},
        "init_info": {"method": "given", "data": [[0.0, 0.0], [1.5, 0.0]]},
        "costs": [{
            "type": "joint_vel",
            "name": "band",
            "coeffs": [3.0],
            "upper_tols": [1.0],
            "lower_tols": [-1.0],
        }],
    });
    let pci = ProblemConstructionInfo::from_json(&json).unwrap();
    let prob = construct_problem(&pci, env, kin).unwrap();

    let x = prob.qp().variable_values();
    let costs = prob.qp().evaluate_exact_costs(&x);
    // dx = 1.5 exceeds the band by 0.5 on joint 0: cost = 3 * 0.5.
    assert_relative_eq!(costs.sum(), 1.5, epsilon = 1e-12);
}

#[test]
fn fixed_timesteps_and_dofs_stay_pinned_through_a_solve() {
    let (env, kin) = gantry_setup(vec![0.0, 0.0]);
    let json = json!({
        "basic_info": {
            "n_steps": 4,
            "manipulator": "gantry",
            "fixed_timesteps": [0],
            "fixed_dofs": [1],
        },
        "init_info": {"method": "given",
                      "data": [[0.0, 0.3], [0.1, 0.3], [0.2, 0.3], [0.3, 0.3]]},
        "costs": [{"type": "joint_pos", "name": "goal", "targets": [2.0, 2.0], "coeffs": [1.0]}],
    });
    let pci = ProblemConstructionInfo::from_json(&json).unwrap();
    let mut prob = construct_problem(&pci, env, kin).unwrap();
    let result = optimize_problem(&mut prob, &SqpParams::default(), Vec::new());

    assert_eq!(result.status, SqpStatus::NlpConverged);
    // Step 0 pinned entirely; dof 1 pinned everywhere.
    assert_relative_eq!(result.traj[(0, 0)], 0.0, epsilon = 1e-9);
    for t in 0..4 {
        assert_relative_eq!(result.traj[(t, 1)], 0.3, epsilon = 1e-9);
    }
    // Free cells moved toward the target.
    assert!(result.traj[(3, 0)] > 0.5);
}

#[test]
fn time_column_optimization_pushes_dt_to_its_limit() {
    let (env, kin) = gantry_setup(vec![0.0, 0.0]);
    let json = json!({
        "basic_info": {
            "n_steps": 3,
            "manipulator": "gantry",
            "use_time": true,
            "dt_lower_lim": 0.5,
            "dt_upper_lim": 4.0,
        },
        "init_info": {"method": "stationary", "dt": 1.0},
        "costs": [{"type": "total_time", "name": "fast", "coeff": 1.0}],
    });
    let pci = ProblemConstructionInfo::from_json(&json).unwrap();
    let mut prob = construct_problem(&pci, env, kin).unwrap();
    assert!(prob.has_time());

    let mut params = SqpParams::default();
    params.max_iterations = 200;
    let result = optimize_problem(&mut prob, &params, Vec::new());

    assert_eq!(result.status, SqpStatus::NlpConverged);
    // Duration sum_t 1/(1/dt) is minimized by driving 1/dt to its upper
    // bound.
    for t in 0..3 {
        assert!(
            result.traj[(t, 2)] > 3.5,
            "1/dt at step {t} was {}",
            result.traj[(t, 2)]
        );
    }
}

#[test]
fn joint_bounds_and_ik_distance_kernels() {
    let robot = Arc::new(PlanarGantry::new("boxbot"));

    // Joint bounds: a row outside its limits shows positive rows.
    let bounds = JointPositionBoundsTerm::new(
        "limits".to_owned(),
        vec![0, 1],
        DVector::from_vec(vec![-1.0, -1.0]),
        DVector::from_vec(vec![1.0, 1.0]),
    );
    let x = DVector::from_vec(vec![1.4, 0.0, 0.0, 0.0]);
    let v = bounds.values(&x);
    assert_relative_eq!(v[0], 0.4, epsilon = 1e-12);
    assert!(v[1] < 0.0);

    // IK distance: the gantry IK is exact, so the value is the offset from
    // the IK solution.
    let target = Isometry3::from_parts(
        Translation3::new(0.7, -0.2, 0.0),
        UnitQuaternion::identity(),
    );
    let ik = IkDistanceTerm::new(
        "reach".to_owned(),
        vec![2, 3],
        vec![0, 1],
        robot,
        target,
    );
    let v = ik.values(&x);
    assert_relative_eq!(v[0], -0.7, epsilon = 1e-12);
    assert_relative_eq!(v[1], 0.2, epsilon = 1e-12);
    let jac = ik.jacobian(&x);
    assert_relative_eq!(jac[(0, 0)], 1.0, epsilon = 1e-12);
    assert_relative_eq!(jac[(1, 1)], 1.0, epsilon = 1e-12);

    // Time-column sum: unit Jacobian over its cells.
    let tt = TimeColumnSumTerm::new("tsum".to_owned(), vec![0, 1], 1.0);
    let v = tt.values(&DVector::from_vec(vec![0.4, 0.8]));
    assert_relative_eq!(v[0], 0.2, epsilon = 1e-12);
}

#[test]
fn equality_constraint_and_squared_cost_share_variable_support() {
    // The same zero-tolerance term rendered both ways must touch the same
    // trajectory cells in the convex model.
    let (env, kin) = gantry_setup(vec![0.0, 0.0]);
    let base = json!({
        "basic_info": {"n_steps": 3, "manipulator": "gantry"},
        "init_info": {"method": "given", "data": [[0.0, 0.0], [0.5, 0.5], [1.0, 1.0]]},
    });

    let mut as_cost = base.clone();
    as_cost["costs"] = json!([{"type": "joint_vel", "name": "v", "coeffs": [1.0]}]);
    let pci = ProblemConstructionInfo::from_json(&as_cost).unwrap();
    let mut cost_prob = construct_problem(&pci, Arc::clone(&env), Arc::clone(&kin) as _).unwrap();
    cost_prob.qp_mut().set_box_size(DVector::from_element(6, 0.1));
    cost_prob.qp_mut().convexify().unwrap();

    let mut as_cnt = base;
    as_cnt["constraints"] = json!([{"type": "joint_vel", "name": "v", "coeffs": [1.0]}]);
    let pci = ProblemConstructionInfo::from_json(&as_cnt).unwrap();
    let mut cnt_prob = construct_problem(&pci, env, kin).unwrap();
    cnt_prob.qp_mut().set_box_size(DVector::from_element(6, 0.1));
    cnt_prob.qp_mut().convexify().unwrap();

    let h_cols: std::collections::BTreeSet<usize> = cost_prob
        .qp()
        .hessian()
        .unwrap()
        .triplet_iter()
        .filter(|(_, _, v)| **v != 0.0)
        .map(|(_, c, _)| c)
        .filter(|&c| c < 6)
        .collect();
    let cnt_rows = cnt_prob.qp().num_nlp_constraint_rows();
    let a_cols: std::collections::BTreeSet<usize> = cnt_prob
        .qp()
        .constraint_matrix()
        .unwrap()
        .triplet_iter()
        .filter(|(r, _, v)| *r < cnt_rows && **v != 0.0)
        .map(|(_, c, _)| c)
        .filter(|&c| c < 6)
        .collect();
    assert_eq!(h_cols, a_cols);
}

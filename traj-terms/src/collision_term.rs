//! The collision term: swept-volume safety over consecutive steps.

use std::sync::{Arc, Mutex};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use traj_collision::{
    CollisionCache, CollisionConfig, CollisionEvaluator, GradientResultsSet,
    LvsContinuousCollisionEvaluator, LvsDiscreteCollisionEvaluator,
};
use traj_qp::{ConstraintKind, ConstraintTerm, CostTerm, PenaltyKind, TermFn};
use traj_types::ConfigError;

use crate::info::{resolve_step_range, TermInfo, TermKind, TermKinds};
use crate::kernels::gather;
use crate::problem::TrajProblem;

/// Finite-difference step for the numerical collision Jacobian.
const COLLISION_FD_STEP: f64 = 1e-8;

/// Which evaluator variant the term builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionEvaluatorKind {
    /// Cast each link between consecutive sub-states.
    #[default]
    Continuous,
    /// Test sampled sub-states discretely.
    Discrete,
}

/// Select a set's error by which trajectory rows are free.
fn selected_error(set: &GradientResultsSet, fixed: [bool; 2]) -> f64 {
    match fixed {
        [false, false] => set.max_error(),
        [false, true] => set.max_error_t0(),
        _ => set.max_error_t1(),
    }
}

/// One collision constraint between trajectory rows `t` and `t + 1`.
///
/// Produces a fixed number of rows (`max_num_cnt`); rows beyond the number
/// of gradient sets found sit at `-margin_buffer`, i.e. satisfied.
struct CollisionPairTerm {
    name: String,
    evaluator: Arc<dyn CollisionEvaluator>,
    indices: Vec<usize>,
    dof: usize,
    fixed: [bool; 2],
    rows: usize,
    numerical: bool,
}

impl CollisionPairTerm {
    fn split(&self, x: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let all = gather(x, &self.indices);
        let x0 = DVector::from_iterator(self.dof, all.iter().take(self.dof).copied());
        let x1 = DVector::from_iterator(self.dof, all.iter().skip(self.dof).copied());
        (x0, x1)
    }

    fn values_of(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DVector<f64> {
        let margin_buffer = self.evaluator.config().margin_buffer;
        let data = self
            .evaluator
            .calc_collision_data(x0, x1, self.fixed, self.rows);
        let mut out = DVector::from_element(self.rows, -margin_buffer);
        let count = self.rows.min(data.gradient_results_sets.len());
        for i in 0..count {
            let set = &data.gradient_results_sets[i];
            out[i] = set.coeff * selected_error(set, self.fixed);
        }
        out
    }

    fn analytic_jacobian(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DMatrix<f64> {
        let data = self
            .evaluator
            .calc_collision_data(x0, x1, self.fixed, self.rows);
        let mut jac = DMatrix::zeros(self.rows, 2 * self.dof);
        let count = self.rows.min(data.gradient_results_sets.len());
        for i in 0..count {
            let set = &data.gradient_results_sets[i];
            // The stored gradients differentiate the distance; the error is
            // margin - distance, hence the sign flip.
            if !self.fixed[0] {
                let g = set.weighted_average_gradient_t0(self.dof);
                for j in 0..self.dof {
                    jac[(i, j)] = -set.coeff * g[j];
                }
            }
            if !self.fixed[1] {
                let g = set.weighted_average_gradient_t1(self.dof);
                for j in 0..self.dof {
                    jac[(i, self.dof + j)] = -set.coeff * g[j];
                }
            }
        }
        jac
    }

    fn numerical_jacobian(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DMatrix<f64> {
        let margin_buffer = self.evaluator.config().margin_buffer;
        let baseline = self
            .evaluator
            .calc_collision_data(x0, x1, self.fixed, self.rows);
        let count = self.rows.min(baseline.gradient_results_sets.len());
        let mut jac = DMatrix::zeros(self.rows, 2 * self.dof);

        for side in 0..2 {
            if self.fixed[side] {
                continue;
            }
            for j in 0..self.dof {
                let (mut p0, mut p1) = (x0.clone(), x1.clone());
                if side == 0 {
                    p0[j] += COLLISION_FD_STEP;
                } else {
                    p1[j] += COLLISION_FD_STEP;
                }
                let perturbed = self
                    .evaluator
                    .calc_collision_data(&p0, &p1, self.fixed, self.rows);

                for i in 0..count {
                    let base = &baseline.gradient_results_sets[i];
                    let matched = perturbed
                        .gradient_results_sets
                        .iter()
                        .find(|s| s.key == base.key && s.shape_key == base.shape_key);
                    let delta = match matched {
                        Some(s) => {
                            s.coeff * selected_error(s, self.fixed)
                                - base.coeff * selected_error(base, self.fixed)
                        }
                        // The contact cleared under the perturbation.
                        None => {
                            base.coeff * (-margin_buffer)
                                - base.coeff * selected_error(base, self.fixed)
                        }
                    };
                    jac[(i, side * self.dof + j)] = delta / COLLISION_FD_STEP;
                }
            }
        }
        jac
    }
}

impl TermFn for CollisionPairTerm {
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
        let (x0, x1) = self.split(x);
        self.values_of(&x0, &x1)
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let (x0, x1) = self.split(x);
        if self.numerical {
            self.numerical_jacobian(&x0, &x1)
        } else {
            self.analytic_jacobian(&x0, &x1)
        }
    }
}

/// Swept-volume collision safety over a step range.
///
/// Hatches one fixed-size cost/constraint per consecutive step pair; all
/// pairs share one evaluator and one result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionTermInfo {
    /// Instance name.
    pub name: String,
    /// First step of the range (inclusive).
    pub first_step: i64,
    /// Last step of the range (inclusive, `-1` = final step).
    pub last_step: i64,
    /// Evaluator variant.
    pub evaluator: CollisionEvaluatorKind,
    /// Skip hatching entirely when false.
    pub enabled: bool,
    /// Contact distance below which a pair is in violation.
    pub margin: f64,
    /// Detection margin added on top of `margin`.
    pub margin_buffer: f64,
    /// Default collision coefficient.
    pub coeff: f64,
    /// Maximum joint-space distance between collision sub-states.
    pub longest_valid_segment_length: f64,
    /// Gradient sets consumed per step pair (fixed constraint size).
    pub max_num_cnt: usize,
    /// Differentiate the whole pipeline instead of using the aggregated
    /// contact gradients.
    pub use_numerical_jacobian: bool,
    /// Pair-specific coefficient overrides; zero disables a pair.
    pub pair_coeffs: Vec<(String, String, f64)>,
}

impl Default for CollisionTermInfo {
    fn default() -> Self {
        Self {
            name: "collision".to_owned(),
            first_step: 0,
            last_step: -1,
            evaluator: CollisionEvaluatorKind::Continuous,
            enabled: true,
            margin: 0.025,
            margin_buffer: 0.01,
            coeff: 1.0,
            longest_valid_segment_length: 0.005,
            max_num_cnt: 3,
            use_numerical_jacobian: false,
            pair_coeffs: Vec::new(),
        }
    }
}

impl CollisionTermInfo {
    fn build_config(&self) -> CollisionConfig {
        let mut config = CollisionConfig::new(self.margin, self.coeff);
        config.margin_buffer = self.margin_buffer;
        config.longest_valid_segment_length = self.longest_valid_segment_length;
        config.max_num_cnt = self.max_num_cnt;
        for (a, b, coeff) in &self.pair_coeffs {
            config.coeff_data.set_pair_coeff(a, b, *coeff);
        }
        config
    }
}

impl TermInfo for CollisionTermInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "collision"
    }

    fn supported_kinds(&self) -> TermKinds {
        TermKinds::cost_and_constraint()
    }

    fn hatch(&self, kind: TermKind, prob: &mut TrajProblem) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
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

        let kin = prob.kin();
        let env = prob.env();
        let dynamic_environment = env
            .active_link_names()
            .iter()
            .any(|l| !kin.is_active_link(l));
        let cache = Arc::new(Mutex::new(CollisionCache::default()));
        let config = self.build_config();
        let evaluator: Arc<dyn CollisionEvaluator> = match self.evaluator {
            CollisionEvaluatorKind::Continuous => Arc::new(LvsContinuousCollisionEvaluator::new(
                Arc::clone(&kin),
                Arc::clone(&env),
                config,
                cache,
                dynamic_environment,
            )),
            CollisionEvaluatorKind::Discrete => Arc::new(LvsDiscreteCollisionEvaluator::new(
                Arc::clone(&kin),
                Arc::clone(&env),
                config,
                cache,
                dynamic_environment,
            )),
        };

        for t in first..last {
            let fixed = [prob.is_fixed_timestep(t), prob.is_fixed_timestep(t + 1)];
            if fixed[0] && fixed[1] {
                continue;
            }
            let mut indices = prob.row_indices(t);
            indices.extend(prob.row_indices(t + 1));
            let term = CollisionPairTerm {
                name: format!("{}_{t}", self.name),
                evaluator: Arc::clone(&evaluator),
                indices,
                dof: prob.dof(),
                fixed,
                rows: self.max_num_cnt,
                numerical: self.use_numerical_jacobian,
            };
            match kind {
                TermKind::Cost => {
                    prob.add_cost(CostTerm::new(Box::new(term), PenaltyKind::Hinge, 1.0))?;
                }
                TermKind::Constraint => {
                    prob.add_constraint(ConstraintTerm::new(
                        Box::new(term),
                        ConstraintKind::Inequality,
                        1.0,
                    ))?;
                }
            }
        }
        Ok(())
    }

    fn to_config(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

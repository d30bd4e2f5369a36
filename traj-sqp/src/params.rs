//! Solver parameters.

use serde::{Deserialize, Serialize};

/// Serialize infinities as `null` so JSON round-trips cleanly.
mod maybe_inf {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            Some(*value).serialize(serializer)
        } else {
            None::<f64>.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

mod maybe_neg_inf {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            Some(*value).serialize(serializer)
        } else {
            None::<f64>.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}

/// Trust-region SQP tuning parameters.
///
/// The defaults reproduce the reference solver's behavior; most problems
/// only ever touch `max_iterations`, `max_time`, and `cnt_tolerance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqpParams {
    /// Step acceptance threshold on `exact_improve / approx_improve`.
    pub improve_ratio_threshold: f64,
    /// Box half-width below which the trust region counts as collapsed.
    pub min_trust_box_size: f64,
    /// Predicted improvement below which the NLP has converged.
    pub min_approx_improve: f64,
    /// Predicted relative improvement below which the NLP has converged.
    #[serde(with = "maybe_neg_inf")]
    pub min_approx_improve_frac: f64,
    /// Total QP-solve budget.
    pub max_iterations: usize,
    /// Multiplier applied to the box on rejection (`0 < r < 1`).
    pub trust_shrink_ratio: f64,
    /// Multiplier applied to the box on acceptance (`> 1`).
    pub trust_expand_ratio: f64,
    /// Constraint violation below which the problem counts as feasible.
    pub cnt_tolerance: f64,
    /// Penalty escalation budget.
    pub max_merit_coeff_increases: usize,
    /// Consecutive QP failures tolerated before giving up.
    pub max_qp_solver_failures: usize,
    /// Multiplier applied to merit coefficients on escalation (`> 1`).
    pub merit_coeff_increase_ratio: f64,
    /// Wall-clock budget in seconds.
    #[serde(with = "maybe_inf")]
    pub max_time: f64,
    /// Starting merit coefficient for every constraint row.
    pub initial_merit_error_coeff: f64,
    /// Escalate only the merit coefficients of violated rows.
    pub inflate_constraints_individually: bool,
    /// Starting trust-region half-width.
    pub initial_trust_box_size: f64,
    /// Worker threads for parallel term evaluation (0 = automatic).
    pub num_threads: usize,
}

impl Default for SqpParams {
    fn default() -> Self {
        Self {
            improve_ratio_threshold: 0.25,
            min_trust_box_size: 1e-4,
            min_approx_improve: 1e-4,
            min_approx_improve_frac: f64::NEG_INFINITY,
            max_iterations: 50,
            trust_shrink_ratio: 0.1,
            trust_expand_ratio: 1.5,
            cnt_tolerance: 1e-4,
            max_merit_coeff_increases: 5,
            max_qp_solver_failures: 3,
            merit_coeff_increase_ratio: 10.0,
            max_time: f64::INFINITY,
            initial_merit_error_coeff: 10.0,
            inflate_constraints_individually: true,
            initial_trust_box_size: 1e-1,
            num_threads: 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference() {
        let params = SqpParams::default();
        assert!((params.improve_ratio_threshold - 0.25).abs() < 1e-12);
        assert!((params.trust_shrink_ratio - 0.1).abs() < 1e-12);
        assert!((params.trust_expand_ratio - 1.5).abs() < 1e-12);
        assert_eq!(params.max_iterations, 50);
        assert_eq!(params.max_merit_coeff_increases, 5);
        assert!(params.max_time.is_infinite());
        assert!(params.min_approx_improve_frac.is_infinite());
        assert!(params.min_approx_improve_frac < 0.0);
    }

    #[test]
    fn test_json_round_trip_with_infinities() {
        let params = SqpParams::default();
        let json = serde_json::to_string(&params).expect("serializable");
        let back: SqpParams = serde_json::from_str(&json).expect("deserializable");
        assert_eq!(params, back);
    }
}

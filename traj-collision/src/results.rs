//! Gradient result data model.
//!
//! Each contact yields a [`GradientResults`]; contacts sharing a link pair
//! and sub-shape pair are aggregated into a [`GradientResultsSet`] that
//! tracks the worst error split across the two cast endpoints. Constraints
//! read the set-level max errors; Jacobians read the per-contact gradients.

use nalgebra::{DMatrix, DVector, Vector3};
use traj_types::{ContactResultMap, ContinuousCollisionType, LinkPair};

/// Sub-shape hash pair identifying one aggregation group within a link pair.
pub type ShapeKey = (u64, u64);

/// Gradient data for one link of one contact.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkGradientResults {
    /// Whether this link is part of the active kinematic group.
    pub has_gradient: bool,
    /// Per-joint gradient of the signed distance, `sign * n^T * J`.
    pub gradient: DVector<f64>,
    /// Minimum translation direction along the contact normal.
    pub translation_vector: Vector3<f64>,
    /// World-frame Jacobian re-referenced to the contact point.
    pub jacobian: DMatrix<f64>,
    /// Cast interpolation weight for this endpoint.
    pub scale: f64,
    /// Continuous-collision classification of the contact for this link.
    pub cc_type: ContinuousCollisionType,
}

impl Default for LinkGradientResults {
    fn default() -> Self {
        Self {
            has_gradient: false,
            gradient: DVector::zeros(0),
            translation_vector: Vector3::zeros(),
            jacobian: DMatrix::zeros(0, 0),
            scale: 1.0,
            cc_type: ContinuousCollisionType::None,
        }
    }
}

/// Gradient data for one contact (both links, both cast endpoints).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientResults {
    /// Per-link gradients at the start of the cast (`t = 0`).
    pub gradients: [LinkGradientResults; 2],
    /// Per-link gradients at the end of the cast (`t = 1`).
    ///
    /// Populated only by continuous checks; discrete checks leave these
    /// with `has_gradient = false`.
    pub cc_gradients: [LinkGradientResults; 2],
    /// `margin - distance`.
    pub error: f64,
    /// `margin + margin_buffer - distance`.
    pub error_with_buffer: f64,
}

/// Worst-case error bookkeeping for one link of a gradient set.
///
/// Index `[0]` excludes contributions attributable only to `t = 1`;
/// index `[1]` excludes contributions attributable only to `t = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkMaxError {
    /// Whether either slot received a value.
    pub has_error: [bool; 2],
    /// Max `error` per slot.
    pub error: [f64; 2],
    /// Max `error_with_buffer` per slot.
    pub error_with_buffer: [f64; 2],
}

impl Default for LinkMaxError {
    fn default() -> Self {
        Self {
            has_error: [false, false],
            error: [f64::NEG_INFINITY, f64::NEG_INFINITY],
            error_with_buffer: [f64::NEG_INFINITY, f64::NEG_INFINITY],
        }
    }
}

impl LinkMaxError {
    /// Max error across both slots.
    #[must_use]
    pub fn max_error(&self) -> f64 {
        self.error[0].max(self.error[1])
    }

    /// Max buffered error across both slots.
    #[must_use]
    pub fn max_error_with_buffer(&self) -> f64 {
        self.error_with_buffer[0].max(self.error_with_buffer[1])
    }
}

/// All gradient results for one `(link pair, sub-shape pair)` group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientResultsSet {
    /// The link-pair key from the contact result map.
    pub key: LinkPair,
    /// The sub-shape hash pair within the link pair.
    pub shape_key: ShapeKey,
    /// The pair's collision coefficient.
    pub coeff: f64,
    /// Whether the producing evaluator samples casts.
    ///
    /// The discrete LVS evaluator also sets this to `true`; the flag feeds
    /// a downstream constraint selector and is kept as produced.
    pub is_continuous: bool,
    /// Worst errors, indexed by link (A = 0, B = 1).
    pub max_error: [LinkMaxError; 2],
    /// The per-contact gradient results of this group.
    pub results: Vec<GradientResults>,
}

impl GradientResultsSet {
    /// Create with room for `reserve` results.
    #[must_use]
    pub fn with_capacity(reserve: usize) -> Self {
        Self {
            results: Vec::with_capacity(reserve),
            ..Self::default()
        }
    }

    /// Add a contact's gradient results, updating the max-error split.
    ///
    /// A contact's error is attributed to `t = 0`, `t = 1`, or both,
    /// depending on each link's continuous-collision classification.
    pub fn add(&mut self, result: GradientResults) {
        for link in 0..2 {
            let lg = &result.gradients[link];
            if !lg.has_gradient {
                continue;
            }
            let (t0, t1) = match lg.cc_type {
                ContinuousCollisionType::Time0 => (true, false),
                ContinuousCollisionType::Time1 => (false, true),
                ContinuousCollisionType::Between | ContinuousCollisionType::None => (true, true),
            };
            let entry = &mut self.max_error[link];
            if t0 {
                entry.has_error[0] = true;
                entry.error[0] = entry.error[0].max(result.error);
                entry.error_with_buffer[0] =
                    entry.error_with_buffer[0].max(result.error_with_buffer);
            }
            if t1 {
                entry.has_error[1] = true;
                entry.error[1] = entry.error[1].max(result.error);
                entry.error_with_buffer[1] =
                    entry.error_with_buffer[1].max(result.error_with_buffer);
            }
        }
        self.results.push(result);
    }

    fn fold(&self, f: impl Fn(&LinkMaxError) -> f64) -> f64 {
        let a = f(&self.max_error[0]);
        let b = f(&self.max_error[1]);
        a.max(b)
    }

    /// Max error across both links and both endpoints.
    #[must_use]
    pub fn max_error(&self) -> f64 {
        self.fold(LinkMaxError::max_error)
    }

    /// Max error excluding values attributable only to `t = 1`.
    #[must_use]
    pub fn max_error_t0(&self) -> f64 {
        self.fold(|e| e.error[0])
    }

    /// Max error excluding values attributable only to `t = 0`.
    #[must_use]
    pub fn max_error_t1(&self) -> f64 {
        self.fold(|e| e.error[1])
    }

    /// Max buffered error across both links and both endpoints.
    #[must_use]
    pub fn max_error_with_buffer(&self) -> f64 {
        self.fold(LinkMaxError::max_error_with_buffer)
    }

    /// Max buffered error excluding values attributable only to `t = 1`.
    #[must_use]
    pub fn max_error_with_buffer_t0(&self) -> f64 {
        self.fold(|e| e.error_with_buffer[0])
    }

    /// Max buffered error excluding values attributable only to `t = 0`.
    #[must_use]
    pub fn max_error_with_buffer_t1(&self) -> f64 {
        self.fold(|e| e.error_with_buffer[1])
    }

    /// Error-weighted average of the `t = 0` gradients, scaled by the cast
    /// weights. Returns zeros when the set is empty.
    #[must_use]
    pub fn weighted_average_gradient_t0(&self, dof: usize) -> DVector<f64> {
        self.weighted_average(dof, false)
    }

    /// Error-weighted average of the `t = 1` gradients.
    #[must_use]
    pub fn weighted_average_gradient_t1(&self, dof: usize) -> DVector<f64> {
        self.weighted_average(dof, true)
    }

    fn weighted_average(&self, dof: usize, timestep1: bool) -> DVector<f64> {
        let max_ewb = self.max_error_with_buffer();
        let mut accum = DVector::zeros(dof);
        let mut total_weight = 0.0;
        for result in &self.results {
            let source = if timestep1 {
                &result.cc_gradients
            } else {
                &result.gradients
            };
            let weight = if max_ewb > 0.0 {
                (result.error_with_buffer.max(0.0)) / max_ewb
            } else {
                1.0
            };
            for lg in source {
                if lg.has_gradient && lg.gradient.len() == dof {
                    accum += (weight * lg.scale) * &lg.gradient;
                    total_weight += weight;
                }
            }
        }
        if total_weight > 0.0 {
            accum /= total_weight;
        }
        accum
    }
}

/// One cached collision evaluation snapshot.
#[derive(Debug, Clone, Default)]
pub struct CollisionCacheData {
    /// Raw contacts grouped by link pair.
    pub contact_results_map: ContactResultMap,
    /// Aggregated gradient sets, ordered per the truncation policy.
    pub gradient_results_sets: Vec<GradientResultsSet>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn link_gradient(cc_type: ContinuousCollisionType) -> LinkGradientResults {
        LinkGradientResults {
            has_gradient: true,
            gradient: DVector::from_vec(vec![1.0, 0.0]),
            scale: 1.0,
            cc_type,
            ..LinkGradientResults::default()
        }
    }

    fn gradient_result(error: f64, cc_type: ContinuousCollisionType) -> GradientResults {
        GradientResults {
            gradients: [link_gradient(cc_type), LinkGradientResults::default()],
            error,
            error_with_buffer: error + 0.01,
            ..GradientResults::default()
        }
    }

    #[test]
    fn test_max_error_split_by_cc_type() {
        let mut set = GradientResultsSet::default();
        set.add(gradient_result(0.5, ContinuousCollisionType::Time0));
        set.add(gradient_result(0.2, ContinuousCollisionType::Time1));
        set.add(gradient_result(0.3, ContinuousCollisionType::Between));

        // T0 view: Time0 (0.5) and Between (0.3).
        assert_relative_eq!(set.max_error_t0(), 0.5, epsilon = 1e-12);
        // T1 view: Time1 (0.2) and Between (0.3).
        assert_relative_eq!(set.max_error_t1(), 0.3, epsilon = 1e-12);
        assert_relative_eq!(set.max_error(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(set.max_error_with_buffer(), 0.51, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_weighted_average_is_zero() {
        let set = GradientResultsSet::default();
        let avg = set.weighted_average_gradient_t0(3);
        assert_eq!(avg.len(), 3);
        assert_relative_eq!(avg.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_weighted_average_uses_scale() {
        let mut set = GradientResultsSet::default();
        let mut r = gradient_result(0.1, ContinuousCollisionType::Between);
        r.gradients[0].scale = 0.5;
        set.add(r);

        let avg = set.weighted_average_gradient_t0(2);
        assert_relative_eq!(avg[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(avg[1], 0.0, epsilon = 1e-12);
    }
}

//! Continuous and discrete collision evaluation for trajectory optimization.
//!
//! This crate implements the longest-valid-segment (LVS) swept-volume
//! collision pipeline that backs collision costs and constraints:
//!
//! 1. Interpolate sub-states between two trajectory rows so no joint-space
//!    step exceeds the longest valid segment length
//! 2. Run cast (continuous) or pose (discrete) contact tests per sub-state
//! 3. Filter contacts by per-pair coefficients and the margin buffer
//! 4. Extract per-contact gradients from link Jacobians and contact normals
//! 5. Aggregate gradients per `(link pair, sub-shape pair)` into
//!    [`GradientResultsSet`]s with time-split max-error bookkeeping
//! 6. Order the sets by worst error (respecting fixed trajectory endpoints)
//!    and cache the snapshot
//!
//! Two evaluators share the pipeline: [`LvsContinuousCollisionEvaluator`]
//! casts each link between consecutive sub-states, while
//! [`LvsDiscreteCollisionEvaluator`] tests the sampled states themselves.
//! Both are consumed through the [`CollisionEvaluator`] trait.
//!
//! Evaluation never fails: a query with no contacts yields an empty
//! snapshot, and degenerate contact normals yield zero gradients while
//! their error still contributes to the constraint value.

#![doc(html_root_url = "https://docs.rs/traj-collision/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]

mod cache;
mod config;
mod continuous;
mod discrete;
mod gradient;
mod results;

pub use cache::{collision_hash, CollisionCache};
pub use config::{CollisionCoeffData, CollisionConfig};
pub use continuous::LvsContinuousCollisionEvaluator;
pub use discrete::LvsDiscreteCollisionEvaluator;
pub use gradient::{cantor_hash, contact_gradient, remove_invalid_contacts};
pub use results::{
    CollisionCacheData, GradientResults, GradientResultsSet, LinkGradientResults, LinkMaxError,
    ShapeKey,
};

use std::sync::Arc;

use nalgebra::DVector;

/// A collision evaluator queried with two trajectory rows.
///
/// Implementations own their contact manager and share a [`CollisionCache`];
/// the environment and kinematics are shared immutable collaborators.
pub trait CollisionEvaluator: Send + Sync {
    /// Evaluate collisions between trajectory rows `x0` and `x1`.
    ///
    /// `fixed` flags which of the two rows is pinned by the problem; it
    /// selects the error key used to order the gradient sets when more than
    /// `bounds_size` sets are found.
    fn calc_collision_data(
        &self,
        x0: &DVector<f64>,
        x1: &DVector<f64>,
        fixed: [bool; 2],
        bounds_size: usize,
    ) -> Arc<CollisionCacheData>;

    /// The collision configuration this evaluator was built with.
    fn config(&self) -> &CollisionConfig;
}

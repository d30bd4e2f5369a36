//! Declarative term catalog for trajectory optimization.
//!
//! Problems are described declaratively: a [`ProblemConstructionInfo`]
//! carries the trajectory shape, the solver parameters, and a list of term
//! infos for costs and constraints. [`construct_problem`] validates the
//! description and *hatches* each term — turning it into concrete cost and
//! constraint functions bound to specific trajectory cells — producing a
//! ready-to-solve [`TrajProblem`].
//!
//! # The standard catalog
//!
//! | type | semantics |
//! |---|---|
//! | `joint_pos` | per-step joint position targets with optional tolerances |
//! | `joint_vel` | forward-difference velocity |
//! | `joint_acc` | central-difference acceleration |
//! | `joint_jerk` | central-difference jerk |
//! | `cart_pose` | 6-DOF link pose error against a fixed target |
//! | `dyn_cart_pose` | pose error against a moving target frame |
//! | `cart_vel` | per-step Cartesian displacement bound |
//! | `total_time` | sum of time-step durations (needs the `1/dt` column) |
//! | `avoid_singularity` | damped inverse smallest singular value |
//! | `collision` | continuous or discrete swept-volume collision |
//!
//! User-defined terms plug in either programmatically
//! ([`UserDefinedTermInfo`]) or through [`register_term`], which extends the
//! process-wide registry keyed by the `type` string.

#![doc(html_root_url = "https://docs.rs/traj-terms/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]

mod cart_terms;
mod collision_term;
mod info;
mod joint_terms;
mod kernels;
mod misc_terms;
mod problem;
mod registry;
mod result;

pub use cart_terms::{CartPoseTermInfo, CartVelTermInfo, DynamicCartPoseTermInfo};
pub use collision_term::{CollisionEvaluatorKind, CollisionTermInfo};
pub use info::{broadcast, resolve_step_range, TermInfo, TermKind, TermKinds};
pub use joint_terms::{JointAccTermInfo, JointJerkTermInfo, JointPosTermInfo, JointVelTermInfo};
pub use kernels::{IkDistanceTerm, JointPositionBoundsTerm, TimeColumnSumTerm};
pub use misc_terms::{AvoidSingularityTermInfo, TotalTimeTermInfo, UserDefinedTermInfo};
pub use problem::{
    construct_problem, BasicInfo, ConvexSolverKind, InitInfo, InitMethod,
    ProblemConstructionInfo, TrajProblem,
};
pub use registry::{register_term, registered_term_names, term_from_config};
pub use result::{optimize_problem, TrajResult};

//! Core data model and capability interfaces for kinematic trajectory
//! optimization.
//!
//! This crate defines the types shared by every stage of the trajectory
//! optimization pipeline:
//!
//! - [`TrajArray`]: the trajectory matrix (one row per time step, one column
//!   per degree of freedom, optionally a trailing `1/dt` column)
//! - [`JointGroup`] / [`Environment`]: capability traits through which the
//!   optimizer consumes forward kinematics, Jacobians, and environment state
//! - [`DiscreteContactManager`] / [`ContinuousContactManager`]: narrow
//!   interfaces over an external collision checker
//! - [`ContactResult`] and friends: the contact data model produced by the
//!   collision checker and consumed by the collision evaluators
//! - [`ConfigError`]: problem-construction failures
//!
//! # Layering
//!
//! This crate has no knowledge of the optimizer itself. Kinematics,
//! environments, and contact managers are implemented by the caller (or by
//! test fixtures) and handed in as shared immutable references; the
//! optimization crates never mutate them except through the contact-manager
//! transform interface.

#![doc(html_root_url = "https://docs.rs/traj-types/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]

mod contact;
mod environment;
mod error;
mod kinematics;
mod trajectory;

pub use contact::{
    make_link_pair, ContactRequest, ContactResult, ContactResultMap, ContactTestType,
    ContinuousCollisionType, DiscreteContactManager, ContinuousContactManager, LinkPair,
};
pub use environment::Environment;
pub use error::ConfigError;
pub use kinematics::{
    jacobian_change_ref_point, InverseKinematics, JointGroup, JointLimits, TransformMap,
};
pub use trajectory::{interpolate, TrajArray};

// Re-export the math types that appear in this crate's public API.
pub use nalgebra::{DMatrix, DVector, Isometry3, Point3, Vector3};

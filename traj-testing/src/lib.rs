//! Deterministic fixtures for trajectory-optimization tests.
//!
//! Real deployments hand the optimizer a kinematics library and a collision
//! checker; the test suites hand it these fixtures instead:
//!
//! - [`PlanarGantry`]: a 2-DOF translating robot ("boxbot") carrying one
//!   box-shaped link
//! - [`SerialArm`]: an n-DOF revolute chain with sphere-approximated links
//! - [`FixtureWorld`]: an [`Environment`] over a set of static obstacles
//! - [`FixtureContactManager`]: an analytic distance checker for
//!   axis-aligned boxes and spheres, with a sampled cast for continuous
//!   queries
//!
//! Geometry is intentionally simple (boxes never rotate; arm links are
//! spheres) so signed distances, witness points, and normals are exact and
//! the tests stay reproducible.

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]

mod contact;
mod robots;
mod world;

pub use contact::{FixtureContactManager, Shape};
pub use robots::{PlanarGantry, SerialArm};
pub use world::FixtureWorld;

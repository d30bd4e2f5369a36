//! Nonlinear problem representation and convexification into bounded QPs.
//!
//! A [`QpProblem`] holds a flat variable table plus a list of costs and
//! constraints, each backed by a [`TermFn`] mapping a slice of the variables
//! to a value vector and a Jacobian. [`QpProblem::convexify`] linearizes
//! every term around the current iterate and assembles a convex quadratic
//! program
//!
//! ```text
//! minimize   1/2 x^T H x + g^T x
//! subject to l <= A x <= u
//! ```
//!
//! where hinge/abs penalties and soft constraints are realized with slack
//! variables whose gradient entries carry the penalty weight or the merit
//! coefficient. The sparsity patterns of `H` and `A` are frozen at
//! [`QpProblem::setup`]: every structural entry of a term's Jacobian block
//! is materialized (zeros included) so backends that cannot change sparsity
//! mid-run stay valid across iterations.
//!
//! The QP backend is consumed through the narrow [`QpSolver`] contract; the
//! built-in [`AdmmQpSolver`] implements it with an OSQP-style
//! operator-splitting iteration and a dense factorization, which is a good
//! fit for the small programs trajectory problems produce.

#![doc(html_root_url = "https://docs.rs/traj-qp/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]

mod problem;
mod solver;
mod term;

pub use problem::{QpError, QpProblem};
pub use solver::{AdmmQpSolver, AdmmSettings, QpSolver, QpSolverError};
pub use term::{
    forward_difference_jacobian, ConstraintKind, ConstraintTerm, CostTerm, PenaltyKind, TermFn,
};

// The sparse matrix type appearing in the backend contract.
pub use nalgebra_sparse::CscMatrix;

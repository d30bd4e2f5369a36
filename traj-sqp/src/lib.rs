//! Trust-region sequential quadratic programming over a [`QpProblem`].
//!
//! The solver runs three nested loops:
//!
//! 1. **Penalty loop** — while constraints stay violated, multiply the
//!    merit coefficients of the violated rows and retry
//! 2. **Convexification loop** — re-linearize the problem around the best
//!    iterate and hand the convex model to the QP backend
//! 3. **Trust-region loop** — solve the QP inside the current box, accept
//!    steps whose exact merit improvement tracks the predicted one, shrink
//!    the box otherwise
//!
//! Acceptance follows the classic sequential convex optimization scheme
//! (Schulman et al., "Finding Locally Optimal, Collision-Free Trajectories
//! with Sequential Convex Optimization"): a step is kept when
//! `exact_improve / approx_improve` clears the improve-ratio threshold, and
//! the solver declares convergence when the predicted improvement itself
//! becomes negligible.
//!
//! QP backend failures walk a shrink-and-retry ladder before the run is
//! abandoned; wall-clock and iteration budgets are checked at the top of
//! every convexification round.

#![doc(html_root_url = "https://docs.rs/traj-sqp/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]

mod callback;
mod params;
mod results;
mod solver;

pub use callback::{IterationLogger, SqpCallback};
pub use params::SqpParams;
pub use results::{SqpResults, SqpStatus};
pub use solver::TrustRegionSqpSolver;

pub use traj_qp::QpProblem;

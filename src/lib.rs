//! Inverse kinematics for articulated frame graphs with loop closures.
//!
//! Rigs are trees of links and joints; joints expose up to six scalar
//! degrees of freedom (three translation, three Euler rotation), each with
//! limits, targets, and a rest pose. Closures add back-edges that constrain
//! a joint's frame to coincide with an existing link elsewhere in the graph,
//! and goals pin a joint's frame to a tracked world pose. The solver
//! partitions the graph into independent chains and drives each one with a
//! damped-least-squares (optionally SVD pseudo-inverse) iteration.
//!
//! # Architecture
//!
//! ```text
//! Rig (links/joints) ──► partition ──► ChainSolver ──► DoF updates
//!                              │
//!                              └──► free joints (snapped to targets)
//! ```
//!
//! A [`Rig`] owns every node; [`NodeId`] handles keep the closure back-edges
//! from forming ownership cycles. [`Solver`] is the facade: it discovers the
//! chain partition once per topology change ([`Solver::update_structure`])
//! and dispatches one [`ChainSolver`](crate::chain) run per group on each
//! [`Solver::solve`] call.
//!
//! Structural mistakes (re-parenting, closure conflicts, malformed DoF
//! lists) are [`StructureError`]s at the violating call. Numerical results
//! ([`SolveOutcome`]) are ordinary data: callers decide whether a
//! non-converged chain is acceptable.

pub mod chain;
pub mod dof;
pub mod error;
pub mod joint;
mod linalg;
pub mod partition;
pub mod rig;
pub mod solver;

pub use chain::{ChainReport, SolveOutcome};
pub use dof::Dof;
pub use error::{ConfigError, StructureError};
pub use joint::{JointKind, PoseDelta, Target};
pub use rig::{NodeId, Rig};
pub use solver::{Solver, SolverConfig};

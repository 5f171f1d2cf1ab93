//! Solver facade: chain discovery, free-joint snapping, and per-group
//! dispatch.

use serde::{Deserialize, Serialize};

use crate::chain::{ChainReport, ChainSolver};
use crate::error::ConfigError;
use crate::linalg::Workspace;
use crate::partition::{self, Partition};
use crate::rig::{NodeId, Rig};

/// Solver tunables.
///
/// Factors weight constraint rows against each other, steps size the
/// finite-difference perturbations, and clamps bound how far a single
/// iteration may pull toward a distant target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Iteration budget per group per solve call.
    pub max_iterations: u32,
    /// Positional error norm below which a constraint counts as met.
    pub translation_converge_threshold: f64,
    /// Rotational error norm below which a constraint counts as met.
    pub rotation_converge_threshold: f64,
    /// Weight of translation rows in the least-squares system.
    pub translation_factor: f64,
    /// Weight of rotation rows in the least-squares system.
    pub rotation_factor: f64,
    /// Finite-difference step for translation DoF.
    pub translation_step: f64,
    /// Finite-difference step for rotation DoF.
    pub rotation_step: f64,
    /// Cap on the positional error norm fed into one iteration.
    pub translation_error_clamp: f64,
    /// Cap on the rotational error norm fed into one iteration.
    pub rotation_error_clamp: f64,
    /// Damping `λ` of the least-squares step.
    pub damping_factor: f64,
    /// Error growth past the best seen value that aborts the solve.
    pub diverge_threshold: f64,
    /// Step magnitude below which the solve is considered stuck.
    pub stall_threshold: f64,
    /// Null-space pull toward each DoF's rest pose (0 disables).
    pub rest_pose_factor: f64,
    /// Use the SVD pseudo-inverse instead of damped least squares, falling
    /// back to the damped step when the decomposition fails.
    pub use_svd: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            translation_converge_threshold: 1e-4,
            rotation_converge_threshold: 1e-3,
            translation_factor: 1.0,
            rotation_factor: 1.0,
            translation_step: 1e-4,
            rotation_step: 1e-4,
            translation_error_clamp: 0.1,
            rotation_error_clamp: 0.1,
            damping_factor: 0.01,
            diverge_threshold: 0.01,
            stall_threshold: 1e-8,
            rest_pose_factor: 0.0,
            use_svd: false,
        }
    }
}

impl SolverConfig {
    /// Check the tunables for values the solve loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, v: f64) -> Result<(), ConfigError> {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue {
                    field,
                    message: "must be positive and finite",
                })
            }
        }
        fn non_negative(field: &'static str, v: f64) -> Result<(), ConfigError> {
            if v >= 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue {
                    field,
                    message: "must be non-negative and finite",
                })
            }
        }

        positive(
            "translation_converge_threshold",
            self.translation_converge_threshold,
        )?;
        positive("rotation_converge_threshold", self.rotation_converge_threshold)?;
        positive("translation_step", self.translation_step)?;
        positive("rotation_step", self.rotation_step)?;
        positive("translation_error_clamp", self.translation_error_clamp)?;
        positive("rotation_error_clamp", self.rotation_error_clamp)?;
        non_negative("translation_factor", self.translation_factor)?;
        non_negative("rotation_factor", self.rotation_factor)?;
        non_negative("damping_factor", self.damping_factor)?;
        non_negative("diverge_threshold", self.diverge_threshold)?;
        non_negative("stall_threshold", self.stall_threshold)?;
        if !(0.0..=1.0).contains(&self.rest_pose_factor) {
            return Err(ConfigError::InvalidValue {
                field: "rest_pose_factor",
                message: "must be within 0 and 1",
            });
        }
        Ok(())
    }
}

/// Drives the constraint groups of a rig.
///
/// The chain partition is discovered from the given roots at construction
/// and cached; call [`Solver::update_structure`] after changing the rig's
/// topology (parenting, closures, goals, DoF lists). Value changes never
/// require a rediscovery.
pub struct Solver {
    roots: Vec<NodeId>,
    pub config: SolverConfig,
    partition: Partition,
    workspace: Workspace,
}

impl Solver {
    pub fn new(rig: &Rig, roots: Vec<NodeId>) -> Self {
        let partition = partition::build(rig, &roots);
        Self {
            roots,
            config: SolverConfig::default(),
            partition,
            workspace: Workspace::new(),
        }
    }

    /// Rediscover groups and free joints after a topology change.
    pub fn update_structure(&mut self, rig: &Rig) {
        self.partition = partition::build(rig, &self.roots);
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn group_count(&self) -> usize {
        self.partition.groups().len()
    }

    pub fn free_joints(&self) -> &[NodeId] {
        self.partition.free_joints()
    }

    /// Snap free target-driven joints to their DoF targets, then run one
    /// solve per group. Reports come back in group order.
    pub fn solve(&mut self, rig: &mut Rig) -> Vec<ChainReport> {
        for i in 0..self.partition.free_joints.len() {
            let joint = self.partition.free_joints[i];
            if !rig.target_set(joint) {
                continue;
            }
            if rig.track_joint_wrap(joint) {
                rig.try_minimize_euler_angles(joint);
            }
            for dof in rig.dof_list(joint).to_vec() {
                let target = rig.target_value(joint, dof);
                rig.set_dof_value(joint, dof, target);
            }
        }

        let config = self.config;
        let mut reports = Vec::with_capacity(self.partition.groups.len());
        for group in &self.partition.groups {
            for &joint in &group.joints {
                if rig.track_joint_wrap(joint) {
                    rig.try_minimize_euler_angles(joint);
                }
            }
            reports.push(ChainSolver::new(rig, group, config).run(&mut self.workspace));
        }
        reports
    }
}

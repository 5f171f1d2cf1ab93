//! Iterative solve of one constraint group.
//!
//! Each iteration recomputes world matrices, evaluates every constraint's
//! pose error, and takes a damped least-squares (or SVD pseudo-inverse)
//! step over the group's unlocked DoF columns. The Jacobian is built by
//! finite differences through [`Rig::delta_world_matrix`], so joint limits
//! shape the derivative exactly as they shape the step.

use nalgebra::{DMatrix, DVector, Isometry3, Translation3};

use crate::dof::Dof;
use crate::joint::JointKind;
use crate::linalg::{self, LockState, Workspace};
use crate::partition::SolverGroup;
use crate::rig::{NodeId, Rig};
use crate::solver::SolverConfig;

/// Singular values below this are truncated by the SVD pseudo-inverse.
const SVD_EPSILON: f64 = 1e-10;

/// Terminal state of one chain solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    /// Every constraint is within its convergence thresholds.
    Converged,
    /// The step fell below the stall threshold, or no DoF could move.
    Stalled,
    /// The error grew past the divergence threshold; the last good DoF
    /// values were restored.
    Diverged,
    /// The iteration budget ran out; the last iterate is left in place.
    Timeout,
}

/// Outcome of solving one group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainReport {
    pub outcome: SolveOutcome,
    /// Steps actually applied before termination.
    pub iterations: u32,
    /// Clamped, factor-weighted error metric at termination.
    pub error: f64,
}

/// One scalar column of the Jacobian.
#[derive(Debug, Clone, Copy)]
struct Column {
    joint: NodeId,
    dof: Dof,
    /// Position of `joint` in the group's member list.
    member: usize,
}

/// Cached per-iteration state of one constraint.
struct Block {
    /// Index into the group's constraint list (for influence masks).
    cidx: usize,
    frame: Isometry3<f64>,
    target: Isometry3<f64>,
    closure: bool,
    /// Constrained translation axes of a goal (0 = x, 1 = y, 2 = z).
    trans_axes: Vec<usize>,
    use_rot: bool,
    trans: Vec<f64>,
    rot: [f64; 4],
    pos_norm: f64,
    rot_norm: f64,
    active: bool,
    error: f64,
}

impl Block {
    fn rows(&self) -> usize {
        self.trans.len() + if self.use_rot { 4 } else { 0 }
    }
}

/// Raw (unscaled) error rows for one constraint given candidate worlds.
fn eval_rows(
    closure: bool,
    trans_axes: &[usize],
    use_rot: bool,
    frame: &Isometry3<f64>,
    target: &Isometry3<f64>,
) -> (Vec<f64>, [f64; 4]) {
    let delta = target.translation.vector - frame.translation.vector;
    let trans = if closure {
        vec![delta.x, delta.y, delta.z]
    } else {
        let local = target.rotation.inverse() * delta;
        trans_axes.iter().map(|&a| local[a]).collect()
    };

    let mut rot = [0.0; 4];
    if use_rot {
        let f = frame.rotation.into_inner();
        let mut t = target.rotation.into_inner();
        // Quaternion double cover: difference against the nearer sign.
        if f.coords.dot(&t.coords) < 0.0 {
            t = -t;
        }
        let d = t.coords - f.coords;
        rot = [d.x, d.y, d.z, d.w];
    }
    (trans, rot)
}

pub(crate) struct ChainSolver<'a> {
    rig: &'a mut Rig,
    group: &'a SolverGroup,
    config: SolverConfig,
}

impl<'a> ChainSolver<'a> {
    pub(crate) fn new(rig: &'a mut Rig, group: &'a SolverGroup, config: SolverConfig) -> Self {
        Self { rig, group, config }
    }

    pub(crate) fn run(mut self, ws: &mut Workspace) -> ChainReport {
        let columns = self.columns();
        ws.reset(columns.len());

        let mut best_error = f64::INFINITY;
        let mut iterations: u32 = 0;
        loop {
            self.rig.update_all_world();
            let blocks = self.build_blocks();
            let total_error: f64 = blocks.iter().map(|b| b.error).sum();
            let active_rows: usize = blocks.iter().filter(|b| b.active).map(Block::rows).sum();

            if active_rows == 0 {
                return ChainReport {
                    outcome: SolveOutcome::Converged,
                    iterations,
                    error: total_error,
                };
            }
            if total_error > best_error + self.config.diverge_threshold {
                self.restore(&columns, ws);
                self.rig.update_all_world();
                return ChainReport {
                    outcome: SolveOutcome::Diverged,
                    iterations,
                    error: best_error,
                };
            }
            if iterations >= self.config.max_iterations {
                return ChainReport {
                    outcome: SolveOutcome::Timeout,
                    iterations,
                    error: total_error,
                };
            }
            best_error = best_error.min(total_error);
            self.capture(&columns, ws);

            let residual = self.build_residual(&blocks, active_rows);
            let jac = self.build_jacobian(&blocks, &columns, active_rows);

            // A locked column may rejoin only when the gradient pulls it
            // back off its limit.
            let gradient = jac.transpose() * &residual;
            let keep: Vec<usize> = (0..columns.len())
                .filter(|&c| match ws.locked[c] {
                    LockState::Free => true,
                    LockState::AtMax => gradient[c] < 0.0,
                    LockState::AtMin => gradient[c] > 0.0,
                })
                .collect();
            if keep.is_empty() {
                return ChainReport {
                    outcome: SolveOutcome::Stalled,
                    iterations,
                    error: total_error,
                };
            }

            let jk = jac.select_columns(keep.iter());
            let step = if self.config.use_svd {
                linalg::solve_svd(&jk, &residual, SVD_EPSILON)
                    .or_else(|| linalg::solve_dls(&jk, &residual, self.config.damping_factor))
            } else {
                linalg::solve_dls(&jk, &residual, self.config.damping_factor)
            };
            let Some(mut dq) = step else {
                return ChainReport {
                    outcome: SolveOutcome::Stalled,
                    iterations,
                    error: total_error,
                };
            };

            if self.config.rest_pose_factor != 0.0 {
                let bias = DVector::from_iterator(
                    keep.len(),
                    keep.iter().map(|&c| {
                        let col = &columns[c];
                        let rest = self.rig.rest_pose_value(col.joint, col.dof);
                        let value = self.rig.dof_value(col.joint, col.dof);
                        (rest - value) * self.config.rest_pose_factor
                    }),
                );
                if let Some(proj) =
                    linalg::nullspace_project(&jk, self.config.damping_factor, &bias)
                {
                    dq += proj;
                }
            }

            if dq.amax() < self.config.stall_threshold {
                return ChainReport {
                    outcome: SolveOutcome::Stalled,
                    iterations,
                    error: total_error,
                };
            }

            for (k, &c) in keep.iter().enumerate() {
                let col = &columns[c];
                let value = self.rig.dof_value(col.joint, col.dof) + dq[k];
                self.rig.set_dof_value(col.joint, col.dof, value);
                let applied = self.rig.dof_value(col.joint, col.dof);
                ws.locked[c] = if applied <= self.rig.min_limit(col.joint, col.dof) {
                    LockState::AtMin
                } else if applied >= self.rig.max_limit(col.joint, col.dof) {
                    LockState::AtMax
                } else {
                    LockState::Free
                };
            }
            iterations += 1;
        }
    }

    fn columns(&self) -> Vec<Column> {
        let mut columns = Vec::new();
        for (member, &joint) in self.group.joints.iter().enumerate() {
            for &dof in self.rig.dof_list(joint) {
                columns.push(Column { joint, dof, member });
            }
        }
        columns
    }

    fn build_blocks(&self) -> Vec<Block> {
        let cfg = &self.config;
        self.group
            .constraints
            .iter()
            .enumerate()
            .map(|(cidx, constraint)| {
                let joint = constraint.joint;
                let frame = self.rig.world(joint);
                let (target, closure) = match self.rig.joint_kind(joint) {
                    JointKind::Closure(link) => (self.rig.world(link), true),
                    JointKind::Goal(goal) => (
                        Isometry3::from_parts(Translation3::from(goal.position), goal.quaternion),
                        false,
                    ),
                    JointKind::Structural => unreachable!("structural joint as constraint"),
                };
                let trans_axes: Vec<usize> = if closure {
                    Vec::new()
                } else {
                    self.rig
                        .dof_list(joint)
                        .iter()
                        .filter(|d| d.is_translation())
                        .map(|d| d.index())
                        .collect()
                };
                let use_rot = closure || self.rig.rotation_dof_count(joint) == 3;

                let (trans, rot) = eval_rows(closure, &trans_axes, use_rot, &frame, &target);
                let pos_norm = trans.iter().map(|v| v * v).sum::<f64>().sqrt();
                let rot_norm = if use_rot {
                    rot.iter().map(|v| v * v).sum::<f64>().sqrt()
                } else {
                    0.0
                };
                let converged = pos_norm < cfg.translation_converge_threshold
                    && rot_norm < cfg.rotation_converge_threshold;
                let rows = trans.len() + if use_rot { 4 } else { 0 };
                // Same clamping and weighting the residual sees, so the
                // divergence check tracks what the step optimizes.
                let error = pos_norm.min(cfg.translation_error_clamp) * cfg.translation_factor
                    + rot_norm.min(cfg.rotation_error_clamp) * cfg.rotation_factor;
                Block {
                    cidx,
                    frame,
                    target,
                    closure,
                    trans_axes,
                    use_rot,
                    trans,
                    rot,
                    pos_norm,
                    rot_norm,
                    active: !converged && rows > 0,
                    error,
                }
            })
            .collect()
    }

    /// Error vector over active blocks: norm-clamped, factor-weighted.
    fn build_residual(&self, blocks: &[Block], rows: usize) -> DVector<f64> {
        let cfg = &self.config;
        let mut res = Vec::with_capacity(rows);
        for block in blocks.iter().filter(|b| b.active) {
            let tscale = if block.pos_norm > cfg.translation_error_clamp {
                cfg.translation_error_clamp / block.pos_norm
            } else {
                1.0
            } * cfg.translation_factor;
            res.extend(block.trans.iter().map(|v| v * tscale));
            if block.use_rot {
                let rscale = if block.rot_norm > cfg.rotation_error_clamp {
                    cfg.rotation_error_clamp / block.rot_norm
                } else {
                    1.0
                } * cfg.rotation_factor;
                res.extend(block.rot.iter().map(|v| v * rscale));
            }
        }
        DVector::from_vec(res)
    }

    /// Finite-difference Jacobian of the raw error rows, factor-weighted
    /// to match the residual.
    fn build_jacobian(&self, blocks: &[Block], columns: &[Column], rows: usize) -> DMatrix<f64> {
        let cfg = &self.config;
        let mut jac = DMatrix::zeros(rows, columns.len());
        for (c, col) in columns.iter().enumerate() {
            let step = if col.dof.is_translation() {
                cfg.translation_step
            } else {
                cfg.rotation_step
            };
            let (world_pert, applied) = self.rig.delta_world_matrix(col.joint, col.dof, step);
            if applied.abs() < f64::EPSILON {
                continue;
            }
            // Left-multiplying by this takes any descendant's world matrix
            // to its perturbed counterpart.
            let motion = world_pert * self.rig.world(col.joint).inverse();

            let mut row = 0;
            for block in blocks.iter().filter(|b| b.active) {
                let constraint = &self.group.constraints[block.cidx];
                let moves_frame = constraint.affects_frame[col.member];
                let moves_target = constraint.affects_target[col.member];
                if !moves_frame && !moves_target {
                    row += block.rows();
                    continue;
                }
                let frame = if moves_frame { motion * block.frame } else { block.frame };
                let target = if moves_target { motion * block.target } else { block.target };
                let (trans, rot) =
                    eval_rows(block.closure, &block.trans_axes, block.use_rot, &frame, &target);

                for (k, &pert) in trans.iter().enumerate() {
                    jac[(row + k, c)] = (block.trans[k] - pert) / applied * cfg.translation_factor;
                }
                if block.use_rot {
                    let base = trans.len();
                    for k in 0..4 {
                        jac[(row + base + k, c)] =
                            (block.rot[k] - rot[k]) / applied * cfg.rotation_factor;
                    }
                }
                row += block.rows();
            }
        }
        jac
    }

    fn capture(&self, columns: &[Column], ws: &mut Workspace) {
        for (i, col) in columns.iter().enumerate() {
            ws.snapshot[i] = self.rig.dof_value(col.joint, col.dof);
        }
    }

    fn restore(&mut self, columns: &[Column], ws: &Workspace) {
        for (i, col) in columns.iter().enumerate() {
            self.rig.set_dof_value(col.joint, col.dof, ws.snapshot[i]);
        }
    }
}

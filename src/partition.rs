//! Chain discovery: group joints by the constraints that couple them.
//!
//! Every closure and goal joint pulls the articulated joints on its
//! ancestor path (and, for closures, the target link's ancestor path) into
//! a working set. Sets sharing a joint are merged until a fixpoint, so each
//! resulting [`SolverGroup`] can be solved independently. Articulated
//! joints under no constraint are reported as free joints; the solver
//! snaps them straight to their DoF targets.

use crate::joint::JointKind;
use crate::rig::{NodeId, Rig};

/// One closure or goal constraint inside a group, with precomputed
/// influence masks over the group's joint list.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub(crate) joint: NodeId,
    /// `affects_frame[i]`: perturbing group joint `i` moves the constraint
    /// joint's frame.
    pub(crate) affects_frame: Vec<bool>,
    /// `affects_target[i]`: perturbing group joint `i` moves the closure
    /// target link. Always false for goals.
    pub(crate) affects_target: Vec<bool>,
}

impl Constraint {
    pub fn joint(&self) -> NodeId {
        self.joint
    }
}

/// A set of joints coupled through shared constraints, solved together.
#[derive(Debug, Clone)]
pub struct SolverGroup {
    pub(crate) joints: Vec<NodeId>,
    pub(crate) constraints: Vec<Constraint>,
}

impl SolverGroup {
    pub fn joints(&self) -> &[NodeId] {
        &self.joints
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }
}

/// Result of chain discovery over a rig.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub(crate) groups: Vec<SolverGroup>,
    pub(crate) free_joints: Vec<NodeId>,
}

impl Partition {
    pub fn groups(&self) -> &[SolverGroup] {
        &self.groups
    }

    /// Articulated joints reachable from the roots but under no constraint.
    pub fn free_joints(&self) -> &[NodeId] {
        &self.free_joints
    }
}

fn is_solvable(rig: &Rig, id: NodeId) -> bool {
    rig.is_joint(id)
        && matches!(rig.joint_kind(id), JointKind::Structural)
        && !rig.dof_list(id).is_empty()
}

/// Solvable joints on the strict ancestor path of `start`, nearest first.
fn collect_path(rig: &Rig, start: NodeId) -> Vec<NodeId> {
    let mut path = Vec::new();
    rig.traverse_parents(start, |id| {
        if is_solvable(rig, id) {
            path.push(id);
        }
        false
    });
    path
}

/// Discover the solver groups and free joints reachable from `roots`.
pub fn build(rig: &Rig, roots: &[NodeId]) -> Partition {
    // Reachability: structural children, plus closure target links and
    // their ancestor chains.
    let mut reachable = vec![false; rig.len()];
    let mut queue: Vec<NodeId> = roots.to_vec();
    while let Some(id) = queue.pop() {
        if reachable[id.index()] {
            continue;
        }
        reachable[id.index()] = true;
        queue.extend_from_slice(rig.children(id));
        if let Some(link) = rig.closure_target(id) {
            queue.push(link);
            rig.traverse_parents(link, |p| {
                queue.push(p);
                false
            });
        }
    }

    let reachable_ids: Vec<NodeId> = (0..rig.len() as u32)
        .map(NodeId)
        .filter(|id| reachable[id.index()])
        .collect();

    // One working set per constraint joint.
    let mut sets: Vec<(Vec<NodeId>, Vec<NodeId>)> = Vec::new();
    for &id in &reachable_ids {
        if !rig.is_joint(id) {
            continue;
        }
        let mut joints = match rig.joint_kind(id) {
            JointKind::Structural => continue,
            JointKind::Goal(_) => collect_path(rig, id),
            JointKind::Closure(link) => {
                let mut joints = collect_path(rig, id);
                joints.extend(collect_path(rig, link));
                joints
            }
        };
        joints.sort_by_key(|j| j.index());
        joints.dedup();
        sets.push((joints, vec![id]));
    }

    // Merge sets sharing a joint until no pair intersects.
    let mut merged = true;
    while merged {
        merged = false;
        'outer: for i in 0..sets.len() {
            for j in (i + 1)..sets.len() {
                let intersects = sets[i].0.iter().any(|a| sets[j].0.contains(a));
                if intersects {
                    let (joints, constraints) = sets.remove(j);
                    sets[i].0.extend(joints);
                    sets[i].0.sort_by_key(|n| n.index());
                    sets[i].0.dedup();
                    sets[i].1.extend(constraints);
                    merged = true;
                    break 'outer;
                }
            }
        }
    }

    let mut grouped = vec![false; rig.len()];
    let mut groups = Vec::new();
    for (joints, constraint_joints) in sets {
        // A constraint with no actuated joints on its paths cannot be
        // solved; it contributes no group.
        if joints.is_empty() {
            continue;
        }
        for &j in &joints {
            grouped[j.index()] = true;
        }
        let constraints = constraint_joints
            .into_iter()
            .map(|c| {
                let affects_frame: Vec<bool> =
                    joints.iter().map(|&j| rig.is_ancestor(j, c)).collect();
                let affects_target: Vec<bool> = match rig.closure_target(c) {
                    Some(link) => joints.iter().map(|&j| rig.is_ancestor(j, link)).collect(),
                    None => vec![false; joints.len()],
                };
                Constraint {
                    joint: c,
                    affects_frame,
                    affects_target,
                }
            })
            .collect();
        groups.push(SolverGroup { joints, constraints });
    }

    let free_joints = reachable_ids
        .into_iter()
        .filter(|&id| is_solvable(rig, id) && !grouped[id.index()])
        .collect();

    Partition { groups, free_joints }
}

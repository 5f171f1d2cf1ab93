//! Joint state: degrees of freedom, limits, targets, and constraint kinds.
//!
//! A joint's local matrix is `base * dof_local`, where the base pose is the
//! frame's position/quaternion and `dof_local` composes the enabled DoF
//! values (translation first, then the `Rz * Ry * Rx` Euler rotation). The
//! six-element state arrays are indexed by [`Dof::index`]; disabled entries
//! are kept but ignored during composition.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use crate::dof::{Dof, DOF_COUNT};
use crate::error::StructureError;
use crate::rig::{NodeId, Rig};

/// World pose a goal joint tracks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub position: Vector3<f64>,
    pub quaternion: UnitQuaternion<f64>,
}

impl Target {
    pub fn new(position: Vector3<f64>, quaternion: UnitQuaternion<f64>) -> Self {
        Self { position, quaternion }
    }
}

/// Constraint role of a joint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JointKind {
    /// Ordinary articulation in the ownership tree.
    Structural,
    /// Back-edge: the joint's frame must coincide with the given link.
    Closure(NodeId),
    /// The joint's frame must coincide with a tracked world pose.
    Goal(Target),
}

/// Difference between a joint's frame and its constraint target, in world
/// space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseDelta {
    /// `target.position - frame.position`.
    pub translation: Vector3<f64>,
    /// Rotation taking the frame's orientation to the target's, with the
    /// scalar part kept non-negative.
    pub rotation: UnitQuaternion<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct JointState {
    pub(crate) kind: JointKind,
    pub(crate) dof: Vec<Dof>,
    pub(crate) flags: [bool; DOF_COUNT],
    pub(crate) values: [f64; DOF_COUNT],
    pub(crate) targets: [f64; DOF_COUNT],
    pub(crate) rest_pose: [f64; DOF_COUNT],
    pub(crate) min_limit: [f64; DOF_COUNT],
    pub(crate) max_limit: [f64; DOF_COUNT],
    pub(crate) target_set: bool,
    pub(crate) track_joint_wrap: bool,
}

impl JointState {
    pub(crate) fn new() -> Self {
        Self {
            kind: JointKind::Structural,
            dof: Vec::new(),
            flags: [false; DOF_COUNT],
            values: [0.0; DOF_COUNT],
            targets: [0.0; DOF_COUNT],
            rest_pose: [0.0; DOF_COUNT],
            min_limit: [f64::NEG_INFINITY; DOF_COUNT],
            max_limit: [f64::INFINITY; DOF_COUNT],
            target_set: false,
            track_joint_wrap: false,
        }
    }

    pub(crate) fn translation_dof_count(&self) -> usize {
        self.dof.iter().filter(|d| d.is_translation()).count()
    }

    pub(crate) fn rotation_dof_count(&self) -> usize {
        self.dof.iter().filter(|d| d.is_rotation()).count()
    }

    /// Enabled translation components; disabled axes read as zero.
    pub(crate) fn dof_translation(&self) -> Vector3<f64> {
        let v = &self.values;
        let f = &self.flags;
        Vector3::new(
            if f[0] { v[0] } else { 0.0 },
            if f[1] { v[1] } else { 0.0 },
            if f[2] { v[2] } else { 0.0 },
        )
    }

    /// Rotation composed from the enabled Euler components.
    pub(crate) fn dof_rotation(&self) -> UnitQuaternion<f64> {
        let v = &self.values;
        let f = &self.flags;
        UnitQuaternion::from_euler_angles(
            if f[3] { v[3] } else { 0.0 },
            if f[4] { v[4] } else { 0.0 },
            if f[5] { v[5] } else { 0.0 },
        )
    }

    /// Transform contributed by the DoF values alone.
    pub(crate) fn dof_local(&self) -> Isometry3<f64> {
        compose_dof(&self.flags, &self.values)
    }

    /// [`JointState::dof_local`] with a single value overridden.
    pub(crate) fn dof_local_with(&self, dof: Dof, value: f64) -> Isometry3<f64> {
        let mut values = self.values;
        values[dof.index()] = value;
        compose_dof(&self.flags, &values)
    }
}

fn compose_dof(flags: &[bool; DOF_COUNT], values: &[f64; DOF_COUNT]) -> Isometry3<f64> {
    let translation = Vector3::new(
        if flags[0] { values[0] } else { 0.0 },
        if flags[1] { values[1] } else { 0.0 },
        if flags[2] { values[2] } else { 0.0 },
    );
    let rotation = UnitQuaternion::from_euler_angles(
        if flags[3] { values[3] } else { 0.0 },
        if flags[4] { values[4] } else { 0.0 },
        if flags[5] { values[5] } else { 0.0 },
    );
    Isometry3::from_parts(Translation3::from(translation), rotation)
}

/// Clamp into `[min, max]`. The limits are set independently and may
/// cross; the floor wins when they do.
fn clamp_to_limits(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max.max(min))
}

/// Shift `value` by whole turns so it lands as close as possible to
/// `reference`.
pub(crate) fn wrap_nearest(value: f64, reference: f64) -> f64 {
    value + std::f64::consts::TAU * ((reference - value) / std::f64::consts::TAU).round()
}

/// Re-express a full Euler triple near `current`, trying both the direct
/// representation and the gimbal-flipped one
/// `(ex + π, π - ey, ez + π)`, which encodes the same rotation.
///
/// Returns the candidate closer to `current` that fits the limits, or the
/// other if only it fits, or `None` when neither does.
pub(crate) fn minimize_triple(
    current: [f64; 3],
    desired: [f64; 3],
    min: [f64; 3],
    max: [f64; 3],
) -> Option<[f64; 3]> {
    use std::f64::consts::PI;

    let wrap = |triple: [f64; 3]| {
        [
            wrap_nearest(triple[0], current[0]),
            wrap_nearest(triple[1], current[1]),
            wrap_nearest(triple[2], current[2]),
        ]
    };
    let direct = wrap(desired);
    let flipped = wrap([desired[0] + PI, PI - desired[1], desired[2] + PI]);

    let score =
        |c: &[f64; 3]| (0..3).map(|i| (c[i] - current[i]).abs()).sum::<f64>();
    let fits = |c: &[f64; 3]| (0..3).all(|i| c[i] >= min[i] && c[i] <= max[i]);

    let (near, far) = if score(&direct) <= score(&flipped) {
        (direct, flipped)
    } else {
        (flipped, direct)
    };
    if fits(&near) {
        Some(near)
    } else if fits(&far) {
        Some(far)
    } else {
        None
    }
}

impl Rig {
    /// Replace the joint's DoF list and reset all per-DoF state (values,
    /// targets, rest pose, limits).
    ///
    /// # Errors
    ///
    /// [`StructureError::NotAJoint`], [`StructureError::DuplicateDof`], or
    /// [`StructureError::DofOutOfOrder`] when a translation DoF follows a
    /// rotation DoF.
    pub fn set_dof(&mut self, id: NodeId, dofs: &[Dof]) -> Result<(), StructureError> {
        if !self.is_joint(id) {
            return Err(StructureError::NotAJoint);
        }
        let mut seen = [false; DOF_COUNT];
        let mut saw_rotation = false;
        for &dof in dofs {
            if seen[dof.index()] {
                return Err(StructureError::DuplicateDof);
            }
            seen[dof.index()] = true;
            if dof.is_rotation() {
                saw_rotation = true;
            } else if saw_rotation {
                return Err(StructureError::DofOutOfOrder);
            }
        }
        let state = self.joint_mut(id);
        state.dof = dofs.to_vec();
        state.flags = seen;
        state.values = [0.0; DOF_COUNT];
        state.targets = [0.0; DOF_COUNT];
        state.rest_pose = [0.0; DOF_COUNT];
        state.min_limit = [f64::NEG_INFINITY; DOF_COUNT];
        state.max_limit = [f64::INFINITY; DOF_COUNT];
        state.target_set = false;
        self.mark_dirty(id);
        Ok(())
    }

    /// Enabled DoF list, in the order it was declared.
    pub fn dof_list(&self, id: NodeId) -> &[Dof] {
        &self.joint(id).dof
    }

    pub fn translation_dof_count(&self, id: NodeId) -> usize {
        self.joint(id).translation_dof_count()
    }

    pub fn rotation_dof_count(&self, id: NodeId) -> usize {
        self.joint(id).rotation_dof_count()
    }

    /// Set a DoF value, clamped to its limits. Returns whether the limits
    /// clamped the requested value (the saturation signal). Disabled DoF
    /// are ignored.
    pub fn set_dof_value(&mut self, id: NodeId, dof: Dof, value: f64) -> bool {
        let i = dof.index();
        let state = self.joint_mut(id);
        if !state.flags[i] {
            return false;
        }
        let clamped = clamp_to_limits(value, state.min_limit[i], state.max_limit[i]);
        if clamped != state.values[i] {
            state.values[i] = clamped;
            self.mark_dirty(id);
        }
        clamped != value
    }

    pub fn dof_value(&self, id: NodeId, dof: Dof) -> f64 {
        self.joint(id).values[dof.index()]
    }

    /// Set a DoF target, clamped to its limits, and flag the joint as
    /// target-driven. Returns whether the limits clamped the requested
    /// target.
    pub fn set_target_value(&mut self, id: NodeId, dof: Dof, value: f64) -> bool {
        let i = dof.index();
        let state = self.joint_mut(id);
        if !state.flags[i] {
            return false;
        }
        state.target_set = true;
        let clamped = clamp_to_limits(value, state.min_limit[i], state.max_limit[i]);
        state.targets[i] = clamped;
        clamped != value
    }

    pub fn target_value(&self, id: NodeId, dof: Dof) -> f64 {
        self.joint(id).targets[dof.index()]
    }

    /// Drop the target-driven flag; stored target values are kept.
    pub fn clear_target(&mut self, id: NodeId) {
        self.joint_mut(id).target_set = false;
    }

    pub fn target_set(&self, id: NodeId) -> bool {
        self.joint(id).target_set
    }

    /// Set a DoF rest pose, clamped to its limits. Returns whether the
    /// limits clamped the requested value. Disabled DoF are ignored.
    pub fn set_rest_pose_value(&mut self, id: NodeId, dof: Dof, value: f64) -> bool {
        let i = dof.index();
        let state = self.joint_mut(id);
        if !state.flags[i] {
            return false;
        }
        let clamped = clamp_to_limits(value, state.min_limit[i], state.max_limit[i]);
        state.rest_pose[i] = clamped;
        clamped != value
    }

    pub fn rest_pose_value(&self, id: NodeId, dof: Dof) -> f64 {
        self.joint(id).rest_pose[dof.index()]
    }

    /// Lower the DoF's floor. The current value is re-clamped; returns
    /// whether it moved.
    pub fn set_min_limit(&mut self, id: NodeId, dof: Dof, limit: f64) -> bool {
        let i = dof.index();
        let state = self.joint_mut(id);
        state.min_limit[i] = limit;
        let clamped = clamp_to_limits(state.values[i], state.min_limit[i], state.max_limit[i]);
        if clamped == state.values[i] {
            return false;
        }
        state.values[i] = clamped;
        self.mark_dirty(id);
        true
    }

    /// Raise the DoF's ceiling. The current value is re-clamped; returns
    /// whether it moved.
    pub fn set_max_limit(&mut self, id: NodeId, dof: Dof, limit: f64) -> bool {
        let i = dof.index();
        let state = self.joint_mut(id);
        state.max_limit[i] = limit;
        let clamped = clamp_to_limits(state.values[i], state.min_limit[i], state.max_limit[i]);
        if clamped == state.values[i] {
            return false;
        }
        state.values[i] = clamped;
        self.mark_dirty(id);
        true
    }

    pub fn min_limit(&self, id: NodeId, dof: Dof) -> f64 {
        self.joint(id).min_limit[dof.index()]
    }

    pub fn max_limit(&self, id: NodeId, dof: Dof) -> f64 {
        self.joint(id).max_limit[dof.index()]
    }

    pub fn set_track_joint_wrap(&mut self, id: NodeId, track: bool) {
        self.joint_mut(id).track_joint_wrap = track;
    }

    pub fn track_joint_wrap(&self, id: NodeId) -> bool {
        self.joint(id).track_joint_wrap
    }

    pub fn joint_kind(&self, id: NodeId) -> JointKind {
        self.joint(id).kind
    }

    /// Turn the joint into a goal tracking `target`, or retarget an
    /// existing goal.
    ///
    /// # Errors
    ///
    /// [`StructureError::NotAJoint`] or
    /// [`StructureError::GoalClosureConflict`] for closure joints.
    pub fn set_goal(&mut self, id: NodeId, target: Target) -> Result<(), StructureError> {
        if !self.is_joint(id) {
            return Err(StructureError::NotAJoint);
        }
        if matches!(self.joint(id).kind, JointKind::Closure(_)) {
            return Err(StructureError::GoalClosureConflict);
        }
        self.joint_mut(id).kind = JointKind::Goal(target);
        Ok(())
    }

    /// Revert a goal joint to a structural one. No-op otherwise.
    pub fn clear_goal(&mut self, id: NodeId) {
        if matches!(self.joint(id).kind, JointKind::Goal(_)) {
            self.joint_mut(id).kind = JointKind::Structural;
        }
    }

    /// World matrix of the joint if `dof` were perturbed by `delta`,
    /// without mutating any state.
    ///
    /// The step is clamped to the DoF's limits; when the limit blocks it
    /// entirely the opposite direction is tried instead. Returns the
    /// perturbed world matrix and the step actually applied (zero when the
    /// DoF is pinned). Uses the cached parent world matrix.
    pub fn delta_world_matrix(&self, id: NodeId, dof: Dof, delta: f64) -> (Isometry3<f64>, f64) {
        let i = dof.index();
        let base = Isometry3::from_parts(Translation3::from(self.position(id)), self.quaternion(id));
        let parent_world = self.parent_world_cached(id);
        let state = self.joint(id);
        let v = state.values[i];
        let mut end = clamp_to_limits(v + delta, state.min_limit[i], state.max_limit[i]);
        if (end - v).abs() < f64::EPSILON {
            end = clamp_to_limits(v - delta, state.min_limit[i], state.max_limit[i]);
        }
        let applied = end - v;
        let world = parent_world * base * state.dof_local_with(dof, end);
        (world, applied)
    }

    /// World-space pose error of a closure or goal joint, or `None` for
    /// structural joints. Uses cached world matrices.
    pub fn closure_error(&self, id: NodeId) -> Option<PoseDelta> {
        let target = match self.joint(id).kind {
            JointKind::Closure(link) => self.world(link),
            JointKind::Goal(goal) => Isometry3::from_parts(
                Translation3::from(goal.position),
                goal.quaternion,
            ),
            JointKind::Structural => return None,
        };
        let frame = self.world(id);
        let translation = target.translation.vector - frame.translation.vector;
        let mut rotation = target.rotation * frame.rotation.inverse();
        if rotation.w < 0.0 {
            rotation = UnitQuaternion::new_unchecked(-rotation.into_inner());
        }
        Some(PoseDelta { translation, rotation })
    }

    /// Re-express the joint's rotational targets and rest pose as close as
    /// possible to the current values without changing the rotations they
    /// encode. With all three Euler DoF enabled the gimbal-flipped
    /// representation is considered too. Returns whether anything changed.
    pub fn try_minimize_euler_angles(&mut self, id: NodeId) -> bool {
        let state = self.joint(id);
        let rot_dofs: Vec<Dof> = state.dof.iter().copied().filter(|d| d.is_rotation()).collect();
        match rot_dofs.len() {
            0 => false,
            3 => {
                let current = [state.values[3], state.values[4], state.values[5]];
                let min = [state.min_limit[3], state.min_limit[4], state.min_limit[5]];
                let max = [state.max_limit[3], state.max_limit[4], state.max_limit[5]];
                let targets = [state.targets[3], state.targets[4], state.targets[5]];
                let rest = [state.rest_pose[3], state.rest_pose[4], state.rest_pose[5]];
                let target_set = state.target_set;

                let mut changed = false;
                if target_set {
                    if let Some(new_targets) = minimize_triple(current, targets, min, max) {
                        if new_targets != targets {
                            let state = self.joint_mut(id);
                            state.targets[3..6].copy_from_slice(&new_targets);
                            changed = true;
                        }
                    }
                }
                if let Some(new_rest) = minimize_triple(current, rest, min, max) {
                    if new_rest != rest {
                        let state = self.joint_mut(id);
                        state.rest_pose[3..6].copy_from_slice(&new_rest);
                        changed = true;
                    }
                }
                changed
            }
            _ => {
                // With fewer than three Euler DoF the flipped representation
                // would touch disabled axes, so only whole-turn wrapping is
                // available per axis.
                let mut changed = false;
                for dof in rot_dofs {
                    let i = dof.index();
                    let state = self.joint(id);
                    let current = state.values[i];
                    let min = state.min_limit[i];
                    let max = state.max_limit[i];

                    if state.target_set {
                        let wrapped = wrap_nearest(state.targets[i], current);
                        if wrapped != state.targets[i] && wrapped >= min && wrapped <= max {
                            self.joint_mut(id).targets[i] = wrapped;
                            changed = true;
                        }
                    }
                    let state = self.joint(id);
                    let wrapped = wrap_nearest(state.rest_pose[i], current);
                    if wrapped != state.rest_pose[i] && wrapped >= min && wrapped <= max {
                        self.joint_mut(id).rest_pose[i] = wrapped;
                        changed = true;
                    }
                }
                changed
            }
        }
    }

    fn parent_world_cached(&self, id: NodeId) -> Isometry3<f64> {
        self.parent(id)
            .map(|p| self.world(p))
            .unwrap_or_else(Isometry3::identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn revolute_z(rig: &mut Rig) -> NodeId {
        let j = rig.add_joint("j");
        rig.set_dof(j, &[Dof::Ez]).unwrap();
        j
    }

    #[test]
    fn set_dof_validates_order_and_duplicates() {
        let mut rig = Rig::new();
        let j = rig.add_joint("j");
        assert_eq!(
            rig.set_dof(j, &[Dof::X, Dof::X]),
            Err(StructureError::DuplicateDof)
        );
        assert_eq!(
            rig.set_dof(j, &[Dof::Ez, Dof::X]),
            Err(StructureError::DofOutOfOrder)
        );
        rig.set_dof(j, &[Dof::X, Dof::Y, Dof::Ez]).unwrap();
        assert_eq!(rig.dof_list(j), &[Dof::X, Dof::Y, Dof::Ez]);
        assert_eq!(rig.translation_dof_count(j), 2);
        assert_eq!(rig.rotation_dof_count(j), 1);

        let link = rig.add_link("l");
        assert_eq!(rig.set_dof(link, &[Dof::X]), Err(StructureError::NotAJoint));
    }

    #[test]
    fn set_dof_resets_state() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_dof_value(j, Dof::Ez, 0.5);
        rig.set_target_value(j, Dof::Ez, 0.7);
        rig.set_dof(j, &[Dof::Ez]).unwrap();
        assert_eq!(rig.dof_value(j, Dof::Ez), 0.0);
        assert!(!rig.target_set(j));
        assert_eq!(rig.min_limit(j, Dof::Ez), f64::NEG_INFINITY);
    }

    #[test]
    fn values_are_clamped_to_limits() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_min_limit(j, Dof::Ez, -1.0);
        rig.set_max_limit(j, Dof::Ez, 1.0);

        assert!(rig.set_dof_value(j, Dof::Ez, 2.5));
        assert_eq!(rig.dof_value(j, Dof::Ez), 1.0);
        assert!(rig.set_dof_value(j, Dof::Ez, -7.0));
        assert_eq!(rig.dof_value(j, Dof::Ez), -1.0);
        // In-range writes report no saturation.
        assert!(!rig.set_dof_value(j, Dof::Ez, 0.5));
        assert_eq!(rig.dof_value(j, Dof::Ez), 0.5);

        // Disabled DoF are ignored outright.
        assert!(!rig.set_dof_value(j, Dof::X, 1.0));
        assert_eq!(rig.dof_value(j, Dof::X), 0.0);
    }

    #[test]
    fn tightening_a_limit_reclamps_the_value() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_dof_value(j, Dof::Ez, 0.7);
        assert!(rig.set_max_limit(j, Dof::Ez, 0.5));
        assert_eq!(rig.dof_value(j, Dof::Ez), 0.5);
        assert!(!rig.set_min_limit(j, Dof::Ez, 0.0));
        assert!(rig.set_min_limit(j, Dof::Ez, 0.6));
        assert_eq!(rig.dof_value(j, Dof::Ez), 0.6);
    }

    #[test]
    fn crossed_limits_pin_writes_to_the_floor() {
        // Limits are set one at a time, so the floor can legitimately
        // pass above the ceiling. The floor wins until they uncross.
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_max_limit(j, Dof::Ez, 0.5);
        rig.set_min_limit(j, Dof::Ez, 0.6);

        assert!(rig.set_dof_value(j, Dof::Ez, 0.2));
        assert_eq!(rig.dof_value(j, Dof::Ez), 0.6);
        assert!(rig.set_dof_value(j, Dof::Ez, 0.9));
        assert_eq!(rig.dof_value(j, Dof::Ez), 0.6);
        assert!(rig.set_target_value(j, Dof::Ez, 0.55));
        assert_eq!(rig.target_value(j, Dof::Ez), 0.6);

        rig.set_max_limit(j, Dof::Ez, 1.0);
        assert!(!rig.set_dof_value(j, Dof::Ez, 0.9));
        assert_eq!(rig.dof_value(j, Dof::Ez), 0.9);
    }

    #[test]
    fn rest_pose_writes_are_clamped_and_flagged() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_min_limit(j, Dof::Ez, 0.0);
        rig.set_max_limit(j, Dof::Ez, 1.0);

        assert!(rig.set_rest_pose_value(j, Dof::Ez, 5.0));
        assert_eq!(rig.rest_pose_value(j, Dof::Ez), 1.0);
        assert!(!rig.set_rest_pose_value(j, Dof::Ez, 0.25));
        assert_eq!(rig.rest_pose_value(j, Dof::Ez), 0.25);

        // Disabled DoF are ignored outright.
        assert!(!rig.set_rest_pose_value(j, Dof::X, 1.0));
        assert_eq!(rig.rest_pose_value(j, Dof::X), 0.0);
    }

    #[test]
    fn targets_are_clamped_and_flagged() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_max_limit(j, Dof::Ez, 1.0);
        assert!(rig.set_target_value(j, Dof::Ez, 2.0));
        assert!(rig.target_set(j));
        assert_eq!(rig.target_value(j, Dof::Ez), 1.0);
        rig.clear_target(j);
        assert!(!rig.target_set(j));
        assert_eq!(rig.target_value(j, Dof::Ez), 1.0);
    }

    #[test]
    fn dof_rotation_matches_world() {
        let mut rig = Rig::new();
        let root = rig.add_link("root");
        let j = revolute_z(&mut rig);
        rig.add_child(root, j).unwrap();
        rig.set_dof_value(j, Dof::Ez, FRAC_PI_2);
        rig.update_all_world();

        let expect = UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2);
        assert_relative_eq!(rig.world(j).rotation.angle_to(&expect), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn delta_world_matrix_flips_at_limits() {
        let mut rig = Rig::new();
        let root = rig.add_link("root");
        let j = revolute_z(&mut rig);
        rig.add_child(root, j).unwrap();
        rig.set_max_limit(j, Dof::Ez, 1.0);
        rig.set_dof_value(j, Dof::Ez, 1.0);
        rig.update_all_world();

        let (_, applied) = rig.delta_world_matrix(j, Dof::Ez, 1e-4);
        assert_relative_eq!(applied, -1e-4, epsilon = 1e-12);
        // State is untouched.
        assert_eq!(rig.dof_value(j, Dof::Ez), 1.0);
    }

    #[test]
    fn delta_world_matrix_reports_pinned_dof() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_min_limit(j, Dof::Ez, 0.0);
        rig.set_max_limit(j, Dof::Ez, 0.0);
        rig.update_all_world();

        let (_, applied) = rig.delta_world_matrix(j, Dof::Ez, 1e-4);
        assert_eq!(applied, 0.0);
    }

    #[test]
    fn delta_world_matrix_perturbs_world() {
        let mut rig = Rig::new();
        let root = rig.add_link("root");
        let j = rig.add_joint("j");
        rig.add_child(root, j).unwrap();
        rig.set_dof(j, &[Dof::X]).unwrap();
        rig.set_position(root, Vector3::new(1.0, 0.0, 0.0));
        rig.update_all_world();

        let (world, applied) = rig.delta_world_matrix(j, Dof::X, 0.25);
        assert_relative_eq!(applied, 0.25, epsilon = 1e-12);
        assert_relative_eq!(world.translation.vector.x, 1.25, epsilon = 1e-12);
    }

    #[test]
    fn closure_error_reports_world_delta() {
        let mut rig = Rig::new();
        let root = rig.add_link("root");
        let target = rig.add_link("target");
        let j = rig.add_joint("j");
        rig.add_child(root, target).unwrap();
        rig.add_child(root, j).unwrap();
        rig.set_position(target, Vector3::new(1.0, 2.0, 0.0));
        rig.make_closure(j, target).unwrap();
        rig.update_all_world();

        let delta = rig.closure_error(j).unwrap();
        assert_relative_eq!(delta.translation.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(delta.translation.y, 2.0, epsilon = 1e-12);
        assert!(delta.rotation.w >= 0.0);

        let plain = rig.add_joint("plain");
        assert!(rig.closure_error(plain).is_none());
    }

    #[test]
    fn goal_error_tracks_target_pose() {
        let mut rig = Rig::new();
        let j = rig.add_joint("j");
        rig.set_goal(
            j,
            Target::new(
                Vector3::new(0.0, 1.0, 0.0),
                UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2),
            ),
        )
        .unwrap();
        rig.update_all_world();

        let delta = rig.closure_error(j).unwrap();
        assert_relative_eq!(delta.translation.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(delta.rotation.angle(), FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn goal_and_closure_are_mutually_exclusive() {
        let mut rig = Rig::new();
        let root = rig.add_link("root");
        let target = rig.add_link("target");
        let j = rig.add_joint("j");
        rig.add_child(root, target).unwrap();
        rig.add_child(root, j).unwrap();
        rig.make_closure(j, target).unwrap();
        assert_eq!(
            rig.set_goal(j, Target::new(Vector3::zeros(), UnitQuaternion::identity())),
            Err(StructureError::GoalClosureConflict)
        );

        let g = rig.add_joint("g");
        rig.set_goal(g, Target::new(Vector3::zeros(), UnitQuaternion::identity()))
            .unwrap();
        assert_eq!(rig.make_closure(g, target), Err(StructureError::GoalClosureConflict));
        rig.clear_goal(g);
        assert_eq!(rig.joint_kind(g), JointKind::Structural);
    }

    #[test]
    fn wrap_nearest_snaps_to_reference() {
        assert_relative_eq!(wrap_nearest(0.1, 2.0 * PI), 0.1 + 2.0 * PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_nearest(6.2, 0.0), 6.2 - 2.0 * PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_nearest(1.0, 1.5), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn minimize_is_a_noop_without_rotational_dof() {
        let mut rig = Rig::new();
        let j = rig.add_joint("j");
        rig.set_dof(j, &[Dof::X, Dof::Y]).unwrap();
        rig.set_target_value(j, Dof::X, 9.0);
        assert!(!rig.try_minimize_euler_angles(j));
        assert_eq!(rig.target_value(j, Dof::X), 9.0);
    }

    #[test]
    fn minimize_wraps_two_axes_independently() {
        let mut rig = Rig::new();
        let j = rig.add_joint("j");
        rig.set_dof(j, &[Dof::Ex, Dof::Ez]).unwrap();
        rig.set_dof_value(j, Dof::Ex, 2.0 * PI);
        rig.set_dof_value(j, Dof::Ez, -2.0 * PI);
        rig.set_target_value(j, Dof::Ex, 0.2);
        rig.set_target_value(j, Dof::Ez, -0.3);
        assert!(rig.try_minimize_euler_angles(j));
        assert_relative_eq!(rig.target_value(j, Dof::Ex), 0.2 + 2.0 * PI, epsilon = 1e-12);
        assert_relative_eq!(rig.target_value(j, Dof::Ez), -0.3 - 2.0 * PI, epsilon = 1e-12);
    }

    #[test]
    fn minimize_wraps_single_axis_targets() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_dof_value(j, Dof::Ez, 6.0);
        rig.set_target_value(j, Dof::Ez, 0.1);
        assert!(rig.try_minimize_euler_angles(j));
        assert_relative_eq!(rig.target_value(j, Dof::Ez), 0.1 + 2.0 * PI, epsilon = 1e-12);
    }

    #[test]
    fn minimize_respects_limits_on_single_axis() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_min_limit(j, Dof::Ez, 0.0);
        rig.set_max_limit(j, Dof::Ez, 6.0);
        rig.set_dof_value(j, Dof::Ez, 5.9);
        rig.set_target_value(j, Dof::Ez, 0.1);
        // 0.1 + τ exceeds the ceiling, so the target stays put.
        assert!(!rig.try_minimize_euler_angles(j));
        assert_relative_eq!(rig.target_value(j, Dof::Ez), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn minimize_uses_gimbal_flip_for_full_euler() {
        let mut rig = Rig::new();
        let j = rig.add_joint("j");
        rig.set_dof(j, &[Dof::Ex, Dof::Ey, Dof::Ez]).unwrap();
        rig.set_dof_value(j, Dof::Ex, 0.1);
        rig.set_dof_value(j, Dof::Ey, 1.5);
        rig.set_dof_value(j, Dof::Ez, 0.2);
        // Same rotation, expressed through the flipped branch.
        rig.set_target_value(j, Dof::Ex, 0.1 + PI);
        rig.set_target_value(j, Dof::Ey, PI - 1.5);
        rig.set_target_value(j, Dof::Ez, 0.2 + PI);

        let before = UnitQuaternion::from_euler_angles(
            rig.target_value(j, Dof::Ex),
            rig.target_value(j, Dof::Ey),
            rig.target_value(j, Dof::Ez),
        );
        assert!(rig.try_minimize_euler_angles(j));
        let after = UnitQuaternion::from_euler_angles(
            rig.target_value(j, Dof::Ex),
            rig.target_value(j, Dof::Ey),
            rig.target_value(j, Dof::Ez),
        );

        assert_relative_eq!(before.angle_to(&after), 0.0, epsilon = 1e-9);
        assert_relative_eq!(rig.target_value(j, Dof::Ex), 0.1, epsilon = 1e-9);
        assert_relative_eq!(rig.target_value(j, Dof::Ey), 1.5, epsilon = 1e-9);
        assert_relative_eq!(rig.target_value(j, Dof::Ez), 0.2, epsilon = 1e-9);
    }

    #[test]
    fn minimize_wraps_rest_pose_too() {
        let mut rig = Rig::new();
        let j = revolute_z(&mut rig);
        rig.set_dof_value(j, Dof::Ez, 2.0 * PI);
        rig.set_rest_pose_value(j, Dof::Ez, 0.0);
        assert!(rig.try_minimize_euler_angles(j));
        assert_relative_eq!(rig.rest_pose_value(j, Dof::Ez), 2.0 * PI, epsilon = 1e-12);
    }
}

//! Frame graph: links, joints, and their ownership tree.
//!
//! A [`Rig`] owns every node in an index-based arena and hands out copyable
//! [`NodeId`] handles. Ownership (the tree) and constraint references
//! (closure back-edges, goal targets) are kept as separate relations so the
//! graph can contain loops without reference cycles.
//!
//! World matrices are recomputed lazily: any local-pose or DoF mutation
//! marks the subtree dirty, and [`Rig::update_matrix_world`] (or
//! [`Rig::update_all_world`]) recomposes `world = parent.world * local`
//! top-down. Cached world matrices are only valid after such a pass.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};

use crate::error::StructureError;
use crate::joint::{JointKind, JointState};

/// Handle to a node owned by a [`Rig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Index into the rig's node arena.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Spatial state shared by links and joints.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) name: String,
    pub(crate) position: Vector3<f64>,
    pub(crate) quaternion: UnitQuaternion<f64>,
    pub(crate) local: Isometry3<f64>,
    pub(crate) world: Isometry3<f64>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) matrix_needs_update: bool,
    pub(crate) world_needs_update: bool,
}

impl Frame {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            position: Vector3::zeros(),
            quaternion: UnitQuaternion::identity(),
            local: Isometry3::identity(),
            world: Isometry3::identity(),
            parent: None,
            children: Vec::new(),
            matrix_needs_update: true,
            world_needs_update: true,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    /// Passive frame; records which closure joints terminate on it.
    Link { closures: Vec<NodeId> },
    Joint(JointState),
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) frame: Frame,
    pub(crate) kind: NodeKind,
}

/// Arena of links and joints forming one articulated structure.
#[derive(Debug, Clone, Default)]
pub struct Rig {
    nodes: Vec<Node>,
}

impl Rig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the rig.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create a link (passive frame) with no parent.
    pub fn add_link(&mut self, name: &str) -> NodeId {
        self.push_node(name, NodeKind::Link { closures: Vec::new() })
    }

    /// Create a joint with no parent and no degrees of freedom.
    pub fn add_joint(&mut self, name: &str) -> NodeId {
        self.push_node(name, NodeKind::Joint(JointState::new()))
    }

    fn push_node(&mut self, name: &str, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            frame: Frame::new(name),
            kind,
        });
        id
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Joint state accessor.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a joint.
    pub(crate) fn joint(&self, id: NodeId) -> &JointState {
        match &self.node(id).kind {
            NodeKind::Joint(state) => state,
            NodeKind::Link { .. } => panic!("node {:?} is not a joint", id),
        }
    }

    pub(crate) fn joint_mut(&mut self, id: NodeId) -> &mut JointState {
        match &mut self.node_mut(id).kind {
            NodeKind::Joint(state) => state,
            NodeKind::Link { .. } => panic!("node {:?} is not a joint", id),
        }
    }

    pub fn is_joint(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Joint(_))
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).frame.name
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).frame.parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).frame.children
    }

    /// Nodes with no parent.
    pub fn roots(&self) -> Vec<NodeId> {
        (0..self.nodes.len() as u32)
            .map(NodeId)
            .filter(|&id| self.node(id).frame.parent.is_none())
            .collect()
    }

    /// Closure joints whose target is this link. Empty for joints.
    pub fn link_closures(&self, id: NodeId) -> &[NodeId] {
        match &self.node(id).kind {
            NodeKind::Link { closures } => closures.as_slice(),
            NodeKind::Joint(_) => &[],
        }
    }

    // -----------------------------------------------------------------------
    // Local and world pose
    // -----------------------------------------------------------------------

    pub fn position(&self, id: NodeId) -> Vector3<f64> {
        self.node(id).frame.position
    }

    pub fn quaternion(&self, id: NodeId) -> UnitQuaternion<f64> {
        self.node(id).frame.quaternion
    }

    /// Cached world matrix; valid only after an update pass since the last
    /// mutation.
    pub fn world(&self, id: NodeId) -> Isometry3<f64> {
        self.node(id).frame.world
    }

    pub fn set_position(&mut self, id: NodeId, position: Vector3<f64>) {
        self.node_mut(id).frame.position = position;
        self.mark_dirty(id);
    }

    /// Set the local orientation from Euler angles (`Rz * Ry * Rx` order).
    pub fn set_euler(&mut self, id: NodeId, ex: f64, ey: f64, ez: f64) {
        self.set_quaternion(id, UnitQuaternion::from_euler_angles(ex, ey, ez));
    }

    pub fn set_quaternion(&mut self, id: NodeId, quaternion: UnitQuaternion<f64>) {
        self.node_mut(id).frame.quaternion = quaternion;
        self.mark_dirty(id);
    }

    /// Recompute the local position so the frame lands on `position` in
    /// world space, using the parent's current (cached) world matrix.
    ///
    /// For joints the DoF transform is preserved; the base pose absorbs the
    /// change.
    pub fn set_world_position(&mut self, id: NodeId, position: Vector3<f64>) {
        let parent_world = self.parent_world(id);
        let local_p = parent_world.inverse() * Point3::from(position);
        let dof_translation = match &self.node(id).kind {
            NodeKind::Joint(state) => state.dof_translation(),
            NodeKind::Link { .. } => Vector3::zeros(),
        };
        let q = self.node(id).frame.quaternion;
        self.node_mut(id).frame.position = local_p.coords - q * dof_translation;
        self.mark_dirty(id);
    }

    /// Recompute the local orientation so the frame matches `quaternion` in
    /// world space, using the parent's current (cached) world matrix.
    pub fn set_world_quaternion(&mut self, id: NodeId, quaternion: UnitQuaternion<f64>) {
        let parent_world = self.parent_world(id);
        let local_q = parent_world.rotation.inverse() * quaternion;
        let dof_q = match &self.node(id).kind {
            NodeKind::Joint(state) => state.dof_rotation(),
            NodeKind::Link { .. } => UnitQuaternion::identity(),
        };
        self.node_mut(id).frame.quaternion = local_q * dof_q.inverse();
        self.mark_dirty(id);
    }

    fn parent_world(&self, id: NodeId) -> Isometry3<f64> {
        self.parent(id)
            .map(|p| self.node(p).frame.world)
            .unwrap_or_else(Isometry3::identity)
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Parent `child` under `parent` without preserving its world pose.
    ///
    /// # Errors
    ///
    /// [`StructureError::SelfParent`], [`StructureError::AlreadyParented`],
    /// [`StructureError::WouldCycle`], [`StructureError::ChildOnClosure`]
    /// (structural children are forbidden on closure joints), or
    /// [`StructureError::JointHasChild`] (joints own at most one child).
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StructureError> {
        if parent == child {
            return Err(StructureError::SelfParent);
        }
        if self.node(child).frame.parent.is_some() {
            return Err(StructureError::AlreadyParented);
        }
        let mut cursor = self.node(parent).frame.parent;
        while let Some(ancestor) = cursor {
            if ancestor == child {
                return Err(StructureError::WouldCycle);
            }
            cursor = self.node(ancestor).frame.parent;
        }
        if let NodeKind::Joint(state) = &self.node(parent).kind {
            if matches!(state.kind, JointKind::Closure(_)) {
                return Err(StructureError::ChildOnClosure);
            }
            if !self.node(parent).frame.children.is_empty() {
                return Err(StructureError::JointHasChild);
            }
        }
        self.node_mut(parent).frame.children.push(child);
        self.node_mut(child).frame.parent = Some(parent);
        self.mark_world_dirty(child);
        Ok(())
    }

    /// Unparent `child`, keeping its local pose (the world pose changes).
    ///
    /// # Errors
    ///
    /// [`StructureError::NotAChild`] if `child` is not parented to `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StructureError> {
        if self.node(child).frame.parent != Some(parent) {
            return Err(StructureError::NotAChild);
        }
        self.node_mut(parent).frame.children.retain(|&c| c != child);
        self.node_mut(child).frame.parent = None;
        self.mark_world_dirty(child);
        Ok(())
    }

    /// Parent `child` under `parent`, recomposing its local pose so the
    /// world pose is preserved at the moment of transfer.
    ///
    /// Uses the cached world matrices of both nodes; run an update pass
    /// first if either may be stale.
    ///
    /// # Errors
    ///
    /// Same as [`Rig::add_child`].
    pub fn attach_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StructureError> {
        let child_world = self.node(child).frame.world;
        self.add_child(parent, child)?;
        self.set_local_from_world(child, &child_world);
        Ok(())
    }

    /// Unparent `child`, recomposing its local pose so the world pose is
    /// preserved.
    ///
    /// # Errors
    ///
    /// [`StructureError::NotAChild`] if `child` is not parented to `parent`.
    pub fn detach_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StructureError> {
        let child_world = self.node(child).frame.world;
        self.remove_child(parent, child)?;
        self.set_local_from_world(child, &child_world);
        Ok(())
    }

    fn set_local_from_world(&mut self, id: NodeId, world: &Isometry3<f64>) {
        let parent_world = self.parent_world(id);
        let local = parent_world.inverse() * world;
        let base = match &self.node(id).kind {
            NodeKind::Joint(state) => local * state.dof_local().inverse(),
            NodeKind::Link { .. } => local,
        };
        let frame = &mut self.node_mut(id).frame;
        frame.position = base.translation.vector;
        frame.quaternion = base.rotation;
        self.mark_dirty(id);
    }

    /// Wire a non-owning back-edge from `joint` to an existing `link`,
    /// turning `joint` into a closure.
    ///
    /// # Errors
    ///
    /// [`StructureError::NotAJoint`], [`StructureError::AlreadyClosure`],
    /// [`StructureError::GoalClosureConflict`],
    /// [`StructureError::JointHasChild`] (a joint cannot hold both a
    /// structural child and a closure),
    /// [`StructureError::ClosureTargetNotLink`], or
    /// [`StructureError::DegenerateClosure`] when `link` is the joint's own
    /// parent.
    pub fn make_closure(&mut self, joint: NodeId, link: NodeId) -> Result<(), StructureError> {
        let NodeKind::Joint(state) = &self.node(joint).kind else {
            return Err(StructureError::NotAJoint);
        };
        match state.kind {
            JointKind::Closure(_) => return Err(StructureError::AlreadyClosure),
            JointKind::Goal(_) => return Err(StructureError::GoalClosureConflict),
            JointKind::Structural => {}
        }
        if !self.node(joint).frame.children.is_empty() {
            return Err(StructureError::JointHasChild);
        }
        if !matches!(self.node(link).kind, NodeKind::Link { .. }) {
            return Err(StructureError::ClosureTargetNotLink);
        }
        if self.node(joint).frame.parent == Some(link) {
            return Err(StructureError::DegenerateClosure);
        }
        self.joint_mut(joint).kind = JointKind::Closure(link);
        if let NodeKind::Link { closures } = &mut self.node_mut(link).kind {
            closures.push(joint);
        }
        Ok(())
    }

    /// Closure target of `joint`, if it is a closure.
    pub fn closure_target(&self, joint: NodeId) -> Option<NodeId> {
        match &self.node(joint).kind {
            NodeKind::Joint(state) => match state.kind {
                JointKind::Closure(link) => Some(link),
                _ => None,
            },
            NodeKind::Link { .. } => None,
        }
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    /// Pre-order walk of the subtree under `root` (structural edges only).
    /// Returning `true` from the callback skips descending into that node.
    pub fn traverse(&self, root: NodeId, mut f: impl FnMut(NodeId) -> bool) {
        self.traverse_inner(root, &mut f);
    }

    fn traverse_inner(&self, id: NodeId, f: &mut impl FnMut(NodeId) -> bool) {
        if f(id) {
            return;
        }
        for i in 0..self.node(id).frame.children.len() {
            let child = self.node(id).frame.children[i];
            self.traverse_inner(child, f);
        }
    }

    /// Walk the ancestors of `start`, nearest first. Returning `true` stops
    /// the walk.
    pub fn traverse_parents(&self, start: NodeId, mut f: impl FnMut(NodeId) -> bool) {
        let mut cursor = self.parent(start);
        while let Some(id) = cursor {
            if f(id) {
                return;
            }
            cursor = self.parent(id);
        }
    }

    /// First node under `root` (pre-order) matching the predicate.
    pub fn find(&self, root: NodeId, mut pred: impl FnMut(NodeId) -> bool) -> Option<NodeId> {
        let mut found = None;
        self.traverse_inner(root, &mut |id| {
            if found.is_some() {
                return true;
            }
            if pred(id) {
                found = Some(id);
                return true;
            }
            false
        });
        found
    }

    /// `true` if `ancestor` is a strict ancestor of `node`.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cursor = self.parent(node);
        while let Some(id) = cursor {
            if id == ancestor {
                return true;
            }
            cursor = self.parent(id);
        }
        false
    }

    // -----------------------------------------------------------------------
    // Matrix updates
    // -----------------------------------------------------------------------

    /// Recompose the local matrix from position, quaternion, and DoF values
    /// if it is dirty.
    pub fn update_matrix(&mut self, id: NodeId) {
        if !self.node(id).frame.matrix_needs_update {
            return;
        }
        let base = {
            let frame = &self.node(id).frame;
            Isometry3::from_parts(Translation3::from(frame.position), frame.quaternion)
        };
        let local = match &self.node(id).kind {
            NodeKind::Joint(state) => base * state.dof_local(),
            NodeKind::Link { .. } => base,
        };
        let frame = &mut self.node_mut(id).frame;
        frame.local = local;
        frame.matrix_needs_update = false;
    }

    /// Recompute `world = parent.world * local` for this node if dirty (or
    /// `force`), then recurse into the subtree, forcing descendants whose
    /// ancestor was recomputed.
    pub fn update_matrix_world(&mut self, id: NodeId, force: bool) {
        self.update_matrix(id);
        let mut propagate = force;
        if self.node(id).frame.world_needs_update || force {
            let world = self.parent_world(id) * self.node(id).frame.local;
            let frame = &mut self.node_mut(id).frame;
            frame.world = world;
            frame.world_needs_update = false;
            propagate = true;
        }
        let children = self.node(id).frame.children.clone();
        for child in children {
            self.update_matrix_world(child, propagate);
        }
    }

    /// Update world matrices from every root.
    pub fn update_all_world(&mut self) {
        for root in self.roots() {
            self.update_matrix_world(root, false);
        }
    }

    pub(crate) fn mark_dirty(&mut self, id: NodeId) {
        self.node_mut(id).frame.matrix_needs_update = true;
        self.mark_world_dirty(id);
    }

    fn mark_world_dirty(&mut self, id: NodeId) {
        if self.node(id).frame.world_needs_update {
            // Invariant: a flagged node implies a fully flagged subtree.
            return;
        }
        self.node_mut(id).frame.world_needs_update = true;
        let children = self.node(id).frame.children.clone();
        for child in children {
            self.mark_world_dirty(child);
        }
    }
}

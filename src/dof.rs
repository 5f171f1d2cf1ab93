//! Scalar degrees of freedom of a joint.

use serde::{Deserialize, Serialize};

/// Number of scalar degrees of freedom a joint can expose.
pub const DOF_COUNT: usize = 6;

/// One scalar parameter of a joint's motion.
///
/// `X`/`Y`/`Z` are translations along the joint's local axes; `Ex`/`Ey`/`Ez`
/// are Euler rotations composed in `Rz * Ry * Rx` order (so `Ey = ±π/2` is
/// the gimbal singularity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dof {
    X,
    Y,
    Z,
    Ex,
    Ey,
    Ez,
}

impl Dof {
    /// All degrees of freedom in canonical order.
    pub const ALL: [Self; DOF_COUNT] = [Self::X, Self::Y, Self::Z, Self::Ex, Self::Ey, Self::Ez];

    /// Index into the per-joint six-element state arrays.
    pub const fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::Ex => 3,
            Self::Ey => 4,
            Self::Ez => 5,
        }
    }

    pub const fn is_translation(self) -> bool {
        matches!(self, Self::X | Self::Y | Self::Z)
    }

    pub const fn is_rotation(self) -> bool {
        !self.is_translation()
    }
}

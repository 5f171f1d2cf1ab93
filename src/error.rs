use thiserror::Error;

/// Structural and wiring errors.
///
/// These are raised synchronously at the violating call and are never
/// retried internally. Numerical solve outcomes are not errors; see
/// [`SolveOutcome`](crate::SolveOutcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("a frame cannot be its own parent")]
    SelfParent,

    #[error("frame already has a parent")]
    AlreadyParented,

    #[error("reparenting would create an ownership cycle")]
    WouldCycle,

    #[error("frame is not a child of the given parent")]
    NotAChild,

    #[error("joint already has a structural child")]
    JointHasChild,

    #[error("closure joints cannot take structural children")]
    ChildOnClosure,

    #[error("joint already holds a closure")]
    AlreadyClosure,

    #[error("a joint cannot be both a goal and a closure")]
    GoalClosureConflict,

    #[error("closure target must be a link")]
    ClosureTargetNotLink,

    #[error("closure target is the joint's own parent")]
    DegenerateClosure,

    #[error("expected a joint node")]
    NotAJoint,

    #[error("duplicate degree of freedom in specification")]
    DuplicateDof,

    #[error("translation degrees of freedom must precede rotation")]
    DofOutOfOrder,
}

/// Solver tunable validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: &'static str,
    },
}

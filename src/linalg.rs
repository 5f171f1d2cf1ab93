//! Least-squares kernels and reusable solver scratch space.

use nalgebra::{DMatrix, DVector, SVD};

/// Iteration cap for the SVD decomposition; failure falls back to damped
/// least squares.
const SVD_MAX_ITERS: usize = 250;

/// Saturation state of one Jacobian column's DoF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    Free,
    AtMin,
    AtMax,
}

/// Per-solve scratch buffers, reused across chains and iterations.
#[derive(Debug, Default)]
pub(crate) struct Workspace {
    pub(crate) snapshot: Vec<f64>,
    pub(crate) locked: Vec<LockState>,
}

impl Workspace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reset(&mut self, columns: usize) {
        self.snapshot.clear();
        self.snapshot.resize(columns, 0.0);
        self.locked.clear();
        self.locked.resize(columns, LockState::Free);
    }
}

/// Damped least-squares step: `Jᵀ (J Jᵀ + λ² I)⁻¹ e`.
///
/// Returns `None` when the damped normal matrix is singular, which only
/// happens with zero damping on a degenerate Jacobian.
pub(crate) fn solve_dls(
    jac: &DMatrix<f64>,
    residual: &DVector<f64>,
    damping: f64,
) -> Option<DVector<f64>> {
    let jt = jac.transpose();
    let mut normal = jac * &jt;
    let lambda_sq = damping * damping;
    for i in 0..normal.nrows() {
        normal[(i, i)] += lambda_sq;
    }
    normal.lu().solve(residual).map(|y| &jt * y)
}

/// Pseudo-inverse step through SVD, truncating singular values below `eps`.
///
/// Returns `None` when the decomposition fails to converge.
pub(crate) fn solve_svd(
    jac: &DMatrix<f64>,
    residual: &DVector<f64>,
    eps: f64,
) -> Option<DVector<f64>> {
    let svd = SVD::try_new(jac.clone(), true, true, f64::EPSILON, SVD_MAX_ITERS)?;
    svd.solve(residual, eps).ok()
}

/// Project `bias` onto the null space of `jac`: `(I - J⁺J) bias`, with the
/// pseudo-inverse damped the same way as [`solve_dls`].
pub(crate) fn nullspace_project(
    jac: &DMatrix<f64>,
    damping: f64,
    bias: &DVector<f64>,
) -> Option<DVector<f64>> {
    let jt = jac.transpose();
    let mut normal = jac * &jt;
    let lambda_sq = damping * damping;
    for i in 0..normal.nrows() {
        normal[(i, i)] += lambda_sq;
    }
    let y = normal.lu().solve(&(jac * bias))?;
    Some(bias - &jt * y)
}

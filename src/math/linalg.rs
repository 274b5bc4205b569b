//! Dense linear-algebra helpers for covariance work.
//!
//! - inversion of a (possibly ill-conditioned) symmetric matrix
//! - positive-definiteness check via Cholesky
//! - Higham-style projection onto the nearest symmetric positive-definite matrix

use nalgebra::{Cholesky, DMatrix};

/// Upper bound on jitter rounds in [`nearest_spd`].
const MAX_SPD_ROUNDS: usize = 100;

/// Symmetric part `(A + Aᵀ) / 2`.
pub fn symmetrize(a: &DMatrix<f64>) -> DMatrix<f64> {
    (a + a.transpose()) * 0.5
}

/// `true` when `a` is symmetric (to a relative tolerance) and Cholesky succeeds.
pub fn is_positive_definite(a: &DMatrix<f64>) -> bool {
    if !a.is_square() || a.iter().any(|v| !v.is_finite()) {
        return false;
    }
    let scale = a.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(f64::MIN_POSITIVE);
    let asym = (a - a.transpose()).iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if asym > 1e-8 * scale {
        return false;
    }
    Cholesky::new(a.clone()).is_some()
}

/// Invert a square matrix with LU, rejecting non-finite results.
pub fn invert(a: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let inv = a.clone().try_inverse()?;
    if inv.iter().all(|v| v.is_finite()) {
        Some(inv)
    } else {
        None
    }
}

/// Project `a` onto the nearest symmetric positive-definite matrix.
///
/// Symmetrize, clip negative eigenvalues of the symmetric part to zero, then
/// add a growing multiple of the identity until Cholesky succeeds. The result
/// is always symmetric; when `a` is already SPD it is returned (symmetrized)
/// unchanged.
pub fn nearest_spd(a: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows();
    let b = symmetrize(a);
    if is_positive_definite(&b) {
        return b;
    }

    let eig = b.clone().symmetric_eigen();
    let clipped = eig.eigenvalues.map(|l| if l.is_finite() { l.max(0.0) } else { 0.0 });
    let v = &eig.eigenvectors;
    let mut out = symmetrize(&(v * DMatrix::from_diagonal(&clipped) * v.transpose()));

    let norm = b.iter().fold(0.0_f64, |m, x| m.max(x.abs())).max(1e-300);
    let spacing = f64::EPSILON * norm;
    let identity = DMatrix::<f64>::identity(n, n);
    let mut k = 1.0_f64;
    let mut rounds = 0;
    while !is_positive_definite(&out) && rounds < MAX_SPD_ROUNDS {
        let min_eig = out
            .clone()
            .symmetric_eigen()
            .eigenvalues
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let shift = (-min_eig * k * k + spacing).max(spacing * k * k);
        out += &identity * shift;
        out = symmetrize(&out);
        k += 1.0;
        rounds += 1;
    }
    out
}

/// Lower Cholesky factor of an SPD matrix.
pub fn cholesky_lower(a: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(a.clone()).map(|c| c.l())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_eigenvalue(a: &DMatrix<f64>) -> f64 {
        a.clone().symmetric_eigen().eigenvalues.iter().copied().fold(f64::INFINITY, f64::min)
    }

    #[test]
    fn spd_input_is_left_alone() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let p = nearest_spd(&a);
        assert!((p - a).abs().max() < 1e-15);
    }

    #[test]
    fn indefinite_matrix_is_repaired() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.0, 2.0, 1.0, 0.0, 0.0, 0.0, -0.5]);
        assert!(!is_positive_definite(&a));
        let p = nearest_spd(&a);
        assert!(is_positive_definite(&p));
        assert!((&p - p.transpose()).abs().max() == 0.0);
        assert!(min_eigenvalue(&p) >= -1e-12);
    }

    #[test]
    fn asymmetric_near_singular_input_ends_symmetric() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0 + 1e-9, 1.0, 1.0]);
        let p = nearest_spd(&a);
        assert!((&p - p.transpose()).abs().max() == 0.0);
        assert!(min_eigenvalue(&p) >= -1e-12);
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert!(invert(&a).is_none());
    }
}

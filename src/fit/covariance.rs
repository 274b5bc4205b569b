//! Parameter covariance from the NLL Hessian at the optimum.
//!
//! The Hessian is exact (hyper-dual AD), taken in the constrained space of the
//! free parameters. Its inverse can come out slightly indefinite when the
//! optimizer stopped a hair away from the true minimum, so the result is
//! projected onto the nearest symmetric positive-definite matrix before it is
//! reported. Whether the raw inverse needed that repair is kept, because the
//! single-peak retry policy keys off it.

use nalgebra::DMatrix;
use tracing::warn;

use crate::domain::{Covariance, Param};
use crate::error::{FitError, Result};
use crate::fit::optimizer::Objective;
use crate::math::ad;
use crate::math::linalg::{invert, is_positive_definite, nearest_spd};

#[derive(Debug, Clone)]
pub struct CovarianceEstimate {
    pub names: Vec<Param>,
    /// Symmetric positive-definite (after projection).
    pub matrix: DMatrix<f64>,
    /// The raw inverse Hessian was already positive definite.
    pub raw_positive_definite: bool,
}

impl CovarianceEstimate {
    pub fn std_errors(&self) -> Vec<f64> {
        self.matrix.diagonal().iter().map(|v| v.max(0.0).sqrt()).collect()
    }

    pub fn to_covariance(&self) -> Covariance {
        Covariance::from_matrix(self.names.clone(), &self.matrix)
    }
}

/// Hessian of `nll` at `point`, as a dense matrix.
pub fn hessian_matrix<O: Objective>(nll: &O, point: &[f64]) -> DMatrix<f64> {
    let rows = ad::hessian(|z| nll.eval(z), point);
    let n = point.len();
    DMatrix::from_fn(n, n, |i, j| rows[i][j])
}

/// Invert the Hessian of `nll` at `point` and repair the result to SPD.
///
/// `names` labels the coordinates of `point`. A Hessian that cannot be
/// inverted yields [`FitError::SingularHessian`]; callers treat that as a
/// failure of the uncertainty path only.
pub fn estimate_covariance<O: Objective>(nll: &O, point: &[f64], names: &[Param]) -> Result<CovarianceEstimate> {
    if names.len() != point.len() {
        return Err(FitError::input("covariance names and point differ in length"));
    }
    let h = hessian_matrix(nll, point);
    if h.iter().any(|v| !v.is_finite()) {
        return Err(FitError::Numeric("Hessian has non-finite entries".into()));
    }
    let raw = invert(&h).ok_or(FitError::SingularHessian)?;
    let raw_positive_definite = is_positive_definite(&raw);
    if !raw_positive_definite {
        warn!(n = names.len(), "inverse Hessian is not positive definite; projecting to nearest SPD");
    }
    Ok(CovarianceEstimate {
        names: names.to_vec(),
        matrix: nearest_spd(&raw),
        raw_positive_definite,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Scalar;
    use approx::assert_relative_eq;

    /// NLL of independent normals with known sds and a correlation term.
    struct Gaussian2 {
        rho: f64,
    }

    impl Objective for Gaussian2 {
        fn eval<S: Scalar>(&self, x: &[S]) -> S {
            // 0.5 · xᵀ Σ⁻¹ x for Σ = [[4, 2ρ], [2ρ, 1]]
            let det = 4.0 - 4.0 * self.rho * self.rho;
            let a = x[0] * x[0] * (1.0 / det);
            let b = x[0] * x[1] * (-2.0 * 2.0 * self.rho / det);
            let c = x[1] * x[1] * (4.0 / det);
            (a + b + c) * 0.5
        }
    }

    struct Saddle;

    impl Objective for Saddle {
        fn eval<S: Scalar>(&self, x: &[S]) -> S {
            x[0] * x[0] - x[1] * x[1] * 0.5
        }
    }

    struct Flat;

    impl Objective for Flat {
        fn eval<S: Scalar>(&self, x: &[S]) -> S {
            (x[0] + x[1]) * (x[0] + x[1])
        }
    }

    #[test]
    fn recovers_known_covariance() {
        let est = estimate_covariance(&Gaussian2 { rho: 0.5 }, &[0.3, -0.2], &[Param::Mu, Param::Sigma]).unwrap();
        assert!(est.raw_positive_definite);
        assert_relative_eq!(est.matrix[(0, 0)], 4.0, epsilon = 1e-10);
        assert_relative_eq!(est.matrix[(1, 1)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(est.matrix[(0, 1)], 1.0, epsilon = 1e-10);
        let se = est.std_errors();
        assert_relative_eq!(se[0], 2.0, epsilon = 1e-10);
        let cov = est.to_covariance();
        assert_relative_eq!(cov.correlation(Param::Mu, Param::Sigma).unwrap(), 0.5, epsilon = 1e-10);
    }

    #[test]
    fn indefinite_inverse_is_repaired() {
        let est = estimate_covariance(&Saddle, &[0.0, 0.0], &[Param::Mu, Param::Sigma]).unwrap();
        assert!(!est.raw_positive_definite);
        let m = &est.matrix;
        assert_eq!(m[(0, 1)], m[(1, 0)]);
        let min_eig = m.clone().symmetric_eigen().eigenvalues.min();
        assert!(min_eig >= -1e-12);
    }

    #[test]
    fn singular_hessian_is_reported() {
        let err = estimate_covariance(&Flat, &[1.0, 1.0], &[Param::Mu, Param::Sigma]).unwrap_err();
        assert!(matches!(err, FitError::SingularHessian));
    }
}

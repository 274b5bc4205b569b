//! Binned Poisson log-likelihood.
//!
//! ```text
//! ln L = Σ_i k_i·ln λ_i − λ_i − ln(k_i!)
//! ```
//!
//! with `λ_i` the shape density integrated over bin `i`. The flat-slice entry
//! point is generic over [`Scalar`] so the optimizer and the covariance code
//! can differentiate through it; the named entry point is a checked wrapper
//! over the same code path.
//!
//! [`InUnconstrained`] and [`OnFreeParams`] adapt any [`NegLogLikelihood`] to
//! the optimizer: the first over the prior's unconstrained coordinates (for
//! the search), the second over the constrained free parameters (for the
//! Hessian).

use crate::domain::{Histogram, ParameterVector, ShapeKind};
use crate::error::{FitError, Result};
use crate::fit::optimizer::Objective;
use crate::fit::prior::Prior;
use crate::math::Scalar;
use crate::math::special::ln_factorial;
use crate::models::bin_expectations;

/// Expectations below this are clamped before taking the log.
pub const LAMBDA_FLOOR: f64 = 1e-300;

/// Poisson likelihood of one shape variant against one histogram.
#[derive(Debug, Clone)]
pub struct LikelihoodEngine<'h> {
    shape: ShapeKind,
    hist: &'h Histogram,
    ln_k_factorial: Vec<f64>,
}

impl<'h> LikelihoodEngine<'h> {
    pub fn new(shape: ShapeKind, hist: &'h Histogram) -> Self {
        let ln_k_factorial = hist.counts().iter().map(|&k| ln_factorial(k)).collect();
        Self { shape, hist, ln_k_factorial }
    }

    pub fn shape(&self) -> ShapeKind {
        self.shape
    }

    pub fn histogram(&self) -> &'h Histogram {
        self.hist
    }

    /// `ln L` for a named parameter vector.
    ///
    /// The names must match the shape's canonical list exactly.
    pub fn log_likelihood(&self, params: &ParameterVector) -> Result<f64> {
        if params.names() != self.shape.param_names() {
            return Err(FitError::input(format!(
                "parameters {:?} do not match {} ({:?})",
                params.names(),
                self.shape,
                self.shape.param_names()
            )));
        }
        Ok(self.log_likelihood_flat(params.values()))
    }

    /// `ln L` for a flat slice in canonical order.
    pub fn log_likelihood_flat<S: Scalar>(&self, p: &[S]) -> S {
        let lambdas = bin_expectations(self.shape, self.hist.edges(), p);
        let mut total = S::from_f64(0.0);
        for ((lam, &k), &lnkf) in lambdas.into_iter().zip(self.hist.counts()).zip(&self.ln_k_factorial) {
            let lam = if lam.value() < LAMBDA_FLOOR { S::from_f64(LAMBDA_FLOOR) } else { lam };
            total = if k > 0.0 {
                total + lam.ln() * k - lam - lnkf
            } else {
                total - lam
            };
        }
        total
    }

    /// Negative log-likelihood, the optimizer's objective.
    pub fn nll_flat<S: Scalar>(&self, p: &[S]) -> S {
        -self.log_likelihood_flat(p)
    }

    /// Expected counts per bin at `p`.
    pub fn expected(&self, p: &[f64]) -> Vec<f64> {
        bin_expectations(self.shape, self.hist.edges(), p)
    }
}

/// A negative log-likelihood over a full, constrained parameter slice.
pub trait NegLogLikelihood: Sync {
    fn nll<S: Scalar>(&self, p: &[S]) -> S;
}

impl NegLogLikelihood for LikelihoodEngine<'_> {
    fn nll<S: Scalar>(&self, p: &[S]) -> S {
        self.nll_flat(p)
    }
}

/// NLL as a function of the unconstrained free coordinates.
pub struct InUnconstrained<'a, L> {
    pub nll: &'a L,
    pub prior: &'a Prior,
    /// Full vector supplying the fixed parameters.
    pub base: &'a [f64],
}

impl<L: NegLogLikelihood> Objective for InUnconstrained<'_, L> {
    fn eval<S: Scalar>(&self, z: &[S]) -> S {
        self.nll.nll(&self.prior.from_unconstrained(z, self.base))
    }
}

/// NLL as a function of the constrained free parameters.
pub struct OnFreeParams<'a, L> {
    pub nll: &'a L,
    pub prior: &'a Prior,
    pub base: &'a [f64],
}

impl<L: NegLogLikelihood> Objective for OnFreeParams<'_, L> {
    fn eval<S: Scalar>(&self, free: &[S]) -> S {
        self.nll.nll(&self.prior.embed_free(free, self.base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnergyUnit, uniform_edges};
    use crate::math::ad;
    use approx::assert_relative_eq;

    fn hist() -> Histogram {
        let counts: Vec<f64> = (0..40)
            .map(|i| {
                let x = i as f64 + 0.5;
                (3.0 + 80.0 * (-(x - 20.0).powi(2) / 8.0).exp()).round()
            })
            .collect();
        Histogram::new(uniform_edges(0.0, 40.0, 40), counts, EnergyUnit::KeV).unwrap()
    }

    #[test]
    fn named_and_flat_agree() {
        let h = hist();
        let engine = LikelihoodEngine::new(ShapeKind::HpgePeak, &h);
        for values in [
            [500.0, 20.0, 2.0, 0.2, 0.05, 3.0, 0.5],
            [10.0, 18.3, 0.7, 0.9, 0.3, 0.0, -1.0],
            [1e5, 25.0, 6.0, 0.0, 0.001, 100.0, 0.0],
        ] {
            let pv = ParameterVector::from_flat(ShapeKind::HpgePeak.param_names(), &values).unwrap();
            let named = engine.log_likelihood(&pv).unwrap();
            let flat = engine.log_likelihood_flat(&pv.to_flat());
            assert_eq!(named.to_bits(), flat.to_bits());
        }
    }

    #[test]
    fn wrong_names_are_rejected() {
        let h = hist();
        let engine = LikelihoodEngine::new(ShapeKind::HpgePeak, &h);
        let pv = ParameterVector::from_flat(ShapeKind::GaussOnStep.param_names(), &[1.0; 5]).unwrap();
        assert!(engine.log_likelihood(&pv).is_err());
    }

    #[test]
    fn matches_direct_poisson_sum() {
        let h = hist();
        let engine = LikelihoodEngine::new(ShapeKind::GaussOnStep, &h);
        let p = [500.0, 20.0, 2.0, 3.0, 0.0];
        let lam = engine.expected(&p);
        let direct: f64 = lam
            .iter()
            .zip(h.counts())
            .map(|(l, &k)| k * l.ln() - l - ln_factorial(k))
            .sum();
        assert_relative_eq!(engine.log_likelihood_flat(&p), direct, max_relative = 1e-12);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let h = hist();
        let engine = LikelihoodEngine::new(ShapeKind::HpgePeak, &h);
        let p = [450.0, 20.2, 1.9, 0.3, 0.04, 2.5, 0.4];
        let g = ad::gradient(|x| engine.nll_flat(x), &p);
        for i in 0..p.len() {
            let step = 1e-6 * p[i].abs().max(1.0);
            let mut hi = p;
            let mut lo = p;
            hi[i] += step;
            lo[i] -= step;
            let fd = (engine.nll_flat(&hi) - engine.nll_flat(&lo)) / (2.0 * step);
            assert_relative_eq!(g[i], fd, max_relative = 1e-4, epsilon = 1e-5);
        }
    }

    #[test]
    fn zero_expectation_is_finite() {
        let h = hist();
        let engine = LikelihoodEngine::new(ShapeKind::GaussOnStep, &h);
        let v = engine.log_likelihood_flat(&[0.0, 20.0, 2.0, 0.0, 0.0]);
        assert!(v.is_finite());
    }
}

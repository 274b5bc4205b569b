//! Peak-shape densities for HPGe calibration lines.
//!
//! The fitter relies on three primitive operations:
//! - evaluate the full density `f(x)` (signal + background) at an energy
//! - evaluate the signal component alone (for FWHM and the centroid)
//! - integrate the density over histogram bins (expected counts)
//!
//! All three are generic over [`Scalar`] so the same code yields values,
//! gradients and Hessians.
//!
//! ```text
//! f(x) = n_sig·[(1 − htail)·G(x) + htail·T(x)] + bkg + hstep·½·erfc(u/√2)
//! u    = (x − mu) / sigma
//! ```
//!
//! `G` is a unit-area Gaussian and `T` a unit-area Gaussian convolved with a
//! low-side exponential whose decay length is `tau·mu`.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use crate::domain::ShapeKind;
use crate::math::Scalar;

/// Shape parameters unpacked from a flat slice.
///
/// `htail` holds `(htail, tau)` for tailed variants and is `None` for `GaussOnStep`.
#[derive(Debug, Clone, Copy)]
pub struct PeakParams<S> {
    pub n_sig: S,
    pub mu: S,
    pub sigma: S,
    pub htail: Option<(S, S)>,
    pub bkg: S,
    pub hstep: S,
}

impl<S: Scalar> PeakParams<S> {
    /// Unpack `p`, laid out in `kind.param_names()` order.
    ///
    /// # Panics
    /// Panics if `p` is shorter than the variant's parameter list. Callers
    /// build `p` from the same list.
    pub fn unpack(kind: ShapeKind, p: &[S]) -> Self {
        match kind {
            ShapeKind::GaussOnStep => Self {
                n_sig: p[0],
                mu: p[1],
                sigma: p[2],
                htail: None,
                bkg: p[3],
                hstep: p[4],
            },
            ShapeKind::HpgePeak => Self {
                n_sig: p[0],
                mu: p[1],
                sigma: p[2],
                htail: Some((p[3], p[4])),
                bkg: p[5],
                hstep: p[6],
            },
        }
    }
}

/// Unit-area Gaussian at standardized offset `u`.
fn gauss<S: Scalar>(u: S, sigma: S) -> S {
    (u * u * -0.5).exp() / (sigma * (2.0 * PI).sqrt())
}

/// Unit-area low-side exponentially modified Gaussian.
///
/// With `z = (u + sigma/τ)/√2` the exponent `(x−mu)/τ + sigma²/(2τ²)` equals
/// `z² − u²/2`, so for `z ≥ 0` the product `exp(z²)·erfc(z)` is replaced by
/// `erfcx(z)` to avoid `inf·0`.
fn tail<S: Scalar>(u: S, sigma: S, tau_abs: S) -> S {
    let r = sigma / tau_abs;
    let z = (u + r) * FRAC_1_SQRT_2;
    let norm = (tau_abs * 2.0).powi(-1);
    if z.value() < 0.0 {
        norm * (u * r + r * r * 0.5).exp() * z.erfc()
    } else {
        norm * (u * u * -0.5).exp() * z.erfcx()
    }
}

/// Normalized signal shape (area one) at `x`.
fn unit_signal<S: Scalar>(params: &PeakParams<S>, x: f64) -> S {
    let u = (params.mu * -1.0 + x) / params.sigma;
    let g = gauss(u, params.sigma);
    match params.htail {
        None => g,
        Some((htail, _)) if htail.value() == 0.0 => g,
        Some((htail, tau)) => {
            let tau_abs = tau * params.mu;
            (htail * -1.0 + 1.0) * g + htail * tail(u, params.sigma, tau_abs)
        }
    }
}

/// Signal component `n_sig · shape(x)`, background excluded.
pub fn signal_density<S: Scalar>(kind: ShapeKind, x: f64, p: &[S]) -> S {
    let params = PeakParams::unpack(kind, p);
    params.n_sig * unit_signal(&params, x)
}

/// Background component: flat level plus a smoothed step under the peak.
pub fn background_density<S: Scalar>(kind: ShapeKind, x: f64, p: &[S]) -> S {
    let params = PeakParams::unpack(kind, p);
    let u = (params.mu * -1.0 + x) / params.sigma;
    params.bkg + params.hstep * (u * FRAC_1_SQRT_2).erfc() * 0.5
}

/// Full density (counts per unit energy) at `x`.
pub fn density<S: Scalar>(kind: ShapeKind, x: f64, p: &[S]) -> S {
    signal_density(kind, x, p) + background_density(kind, x, p)
}

/// Expected counts per bin, `∫ f` over each bin by Simpson's rule.
pub fn bin_expectations<S: Scalar>(kind: ShapeKind, edges: &[f64], p: &[S]) -> Vec<S> {
    edges
        .windows(2)
        .map(|w| {
            let (a, b) = (w[0], w[1]);
            let m = 0.5 * (a + b);
            let sum = density(kind, a, p) + density(kind, m, p) * 4.0 + density(kind, b, p);
            sum * ((b - a) / 6.0)
        })
        .collect()
}

/// Relative tail length used when the tail is disabled or unconstrained.
pub const DEFAULT_TAU: f64 = 1e-3;

/// `2·sqrt(2·ln 2)`, the Gaussian FWHM/sigma ratio.
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn integrate(f: impl Fn(f64) -> f64, lo: f64, hi: f64, n: usize) -> f64 {
        let h = (hi - lo) / n as f64;
        (0..n)
            .map(|i| {
                let a = lo + h * i as f64;
                let b = a + h;
                h / 6.0 * (f(a) + 4.0 * f(0.5 * (a + b)) + f(b))
            })
            .sum()
    }

    #[test]
    fn signal_components_have_unit_area() {
        let gauss_p = [1.0, 100.0, 2.0, 0.0, 0.0];
        let area = integrate(|x| signal_density(ShapeKind::GaussOnStep, x, &gauss_p), 60.0, 140.0, 4000);
        assert_relative_eq!(area, 1.0, epsilon = 1e-8);

        let tail_p = [1.0, 100.0, 2.0, 1.0, 0.03, 0.0, 0.0];
        let area = integrate(|x| signal_density(ShapeKind::HpgePeak, x, &tail_p), 0.0, 140.0, 20000);
        assert_relative_eq!(area, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn tail_branches_agree_at_switch() {
        // z = 0 when u = -sigma/tau_abs.
        let sigma = 1.5;
        let tau_abs = 3.0;
        let u0 = -sigma / tau_abs;
        let below = tail(u0 - 1e-9, sigma, tau_abs);
        let above = tail(u0 + 1e-9, sigma, tau_abs);
        assert_relative_eq!(below, above, max_relative = 1e-7);
    }

    #[test]
    fn tail_is_on_the_low_side() {
        let p = [1.0, 100.0, 1.0, 1.0, 0.05, 0.0, 0.0];
        let low = signal_density(ShapeKind::HpgePeak, 95.0, &p);
        let high = signal_density(ShapeKind::HpgePeak, 105.0, &p);
        assert!(low > 100.0 * high);
    }

    #[test]
    fn zero_tail_matches_gaussian_variant() {
        let with = [500.0, 50.0, 2.0, 0.0, 0.01, 3.0, 1.0];
        let without = [500.0, 50.0, 2.0, 3.0, 1.0];
        for &x in &[40.0, 48.5, 50.0, 53.0] {
            assert_relative_eq!(
                density(ShapeKind::HpgePeak, x, &with),
                density(ShapeKind::GaussOnStep, x, &without),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn step_is_high_on_the_low_side() {
        let p = [0.0, 50.0, 2.0, 1.0, 4.0];
        assert_relative_eq!(background_density(ShapeKind::GaussOnStep, 0.0, &p), 5.0, epsilon = 1e-12);
        assert_relative_eq!(background_density(ShapeKind::GaussOnStep, 100.0, &p), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn bin_expectations_sum_to_area() {
        let p = [1000.0, 50.0, 2.0, 0.0, 0.0];
        let edges: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        let total: f64 = bin_expectations(ShapeKind::GaussOnStep, &edges, &p).iter().sum();
        assert_relative_eq!(total, 1000.0, max_relative = 1e-3);
    }
}

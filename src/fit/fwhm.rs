//! Full width at half maximum of the fitted signal shape.
//!
//! - the mode is located numerically (the tail pulls it below `mu`)
//! - the two half-maximum crossings are found by bisection on each side
//! - the uncertainty is the spread of the FWHM over parameter vectors drawn
//!   from the fit covariance (Monte Carlo)
//!
//! Root-finding failures never raise: they yield `None` for the central value
//! and are dropped from the Monte Carlo batch.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::domain::ShapeKind;
use crate::math::linalg::cholesky_lower;
use crate::math::roots::{RootSettings, bisect, maximize};
use crate::models::{PeakParams, signal_density};

/// Grid used to bracket the mode before golden-section refinement.
const MODE_GRID: usize = 201;

/// Half-width of the search window in units of sigma.
const WINDOW_SIGMAS: f64 = 5.0;

/// Monte Carlo settings for the FWHM uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McConfig {
    /// Draws when a full covariance matrix is available.
    pub samples_full: usize,
    /// Draws when only per-parameter standard errors are available.
    pub samples_diag: usize,
    pub seed: u64,
    /// Draws per parallel work unit; each unit owns a generator seeded from `seed`.
    pub chunk: usize,
}

impl Default for McConfig {
    fn default() -> Self {
        Self {
            samples_full: 10_000,
            samples_diag: 1_000,
            seed: 0x00EC_A1F1,
            chunk: 250,
        }
    }
}

/// How the free parameters scatter around the best fit.
#[derive(Debug, Clone, Copy)]
pub enum Spread<'a> {
    /// Full covariance over the free parameters.
    Covariance(&'a DMatrix<f64>),
    /// Independent standard errors over the free parameters.
    StdErrors(&'a [f64]),
}

/// Mode and FWHM of the signal component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalWidth {
    pub centroid: f64,
    pub fwhm: f64,
}

/// Energy window searched for the mode and the half-maximum crossings.
///
/// Tail-dominated shapes (`htail > 0.5`) get a symmetric window wide enough
/// for the tail; otherwise the window runs from `mu·(1 − tau)` to
/// `mu·(1 + tau)`, widened to at least `±5σ`.
fn search_window(pp: &PeakParams<f64>) -> (f64, f64) {
    let reach = WINDOW_SIGMAS * pp.sigma;
    match pp.htail {
        Some((htail, tau)) if htail > 0.5 => {
            let w = reach + WINDOW_SIGMAS * (tau * pp.mu).abs();
            (pp.mu - w, pp.mu + w)
        }
        Some((_, tau)) => (
            (pp.mu * (1.0 - tau)).min(pp.mu - reach),
            (pp.mu * (1.0 + tau)).max(pp.mu + reach),
        ),
        None => (pp.mu - reach, pp.mu + reach),
    }
}

/// Mode and FWHM of the signal at `p` (flat, canonical order), or `None` if
/// the crossings cannot be bracketed.
pub fn signal_width(kind: ShapeKind, p: &[f64]) -> Option<SignalWidth> {
    if p.iter().any(|v| !v.is_finite()) {
        return None;
    }
    // Width does not depend on the amplitude.
    let mut unit = p.to_vec();
    unit[0] = 1.0;
    let pp = PeakParams::unpack(kind, &unit);
    if !(pp.sigma > 0.0) {
        return None;
    }

    let f = |x: f64| signal_density(kind, x, &unit);
    let settings = RootSettings::default();
    let (lo, hi) = search_window(&pp);
    let (centroid, peak) = maximize(f, lo, hi, MODE_GRID, settings)?;
    if !(peak > 0.0) {
        return None;
    }
    let half = 0.5 * peak;
    let g = |x: f64| f(x) - half;
    let left = bisect(g, lo, centroid, settings)?;
    let right = bisect(g, centroid, hi, settings)?;
    let fwhm = right - left;
    (fwhm > 0.0 && fwhm.is_finite()).then_some(SignalWidth { centroid, fwhm })
}

/// FWHM of the signal at `p`.
pub fn fwhm(kind: ShapeKind, p: &[f64]) -> Option<f64> {
    signal_width(kind, p).map(|w| w.fwhm)
}

/// Monte Carlo standard deviation of the FWHM.
///
/// `best` is the full constrained parameter vector; `free` lists the indices
/// that `spread` describes. Draws with an undefined FWHM are discarded; if
/// fewer than two remain the uncertainty is `None`.
pub fn fwhm_uncertainty(
    kind: ShapeKind,
    best: &[f64],
    free: &[usize],
    spread: Spread<'_>,
    config: &McConfig,
) -> Option<f64> {
    let n_free = free.len();
    let (n_samples, factor) = match spread {
        Spread::Covariance(cov) => {
            if cov.nrows() != n_free || cov.ncols() != n_free {
                return None;
            }
            (config.samples_full, cholesky_lower(cov)?)
        }
        Spread::StdErrors(se) => {
            if se.len() != n_free || se.iter().any(|s| !s.is_finite() || *s < 0.0) {
                return None;
            }
            (config.samples_diag, DMatrix::from_diagonal(&DVector::from_column_slice(se)))
        }
    };
    if n_samples < 2 || n_free == 0 {
        return None;
    }

    let chunk = config.chunk.max(1);
    let n_chunks = n_samples.div_ceil(chunk);
    let widths: Vec<f64> = (0..n_chunks)
        .into_par_iter()
        .flat_map_iter(|c| {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(c as u64));
            let len = chunk.min(n_samples - c * chunk);
            let factor = &factor;
            (0..len)
                .filter_map(move |_| {
                    let z = DVector::from_fn(n_free, |_, _| rng.sample::<f64, _>(StandardNormal));
                    let delta = factor * z;
                    let mut p = best.to_vec();
                    for (k, &i) in free.iter().enumerate() {
                        p[i] += delta[k];
                    }
                    fwhm(kind, &p)
                })
                .collect::<Vec<_>>()
        })
        .collect();

    let dropped = n_samples - widths.len();
    if dropped > 0 {
        let level_is_high = dropped * 10 > n_samples;
        if level_is_high {
            warn!(dropped, n_samples, "FWHM undefined for many Monte Carlo draws");
        } else {
            debug!(dropped, n_samples, "FWHM undefined for some Monte Carlo draws");
        }
    }
    sample_std(&widths)
}

/// Unbiased sample standard deviation.
fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FWHM_PER_SIGMA;
    use approx::assert_relative_eq;

    #[test]
    fn gaussian_fwhm_is_exact() {
        let p = [1000.0, 50.0, 2.0, 5.0, 1.0];
        let w = signal_width(ShapeKind::GaussOnStep, &p).unwrap();
        assert_relative_eq!(w.fwhm, FWHM_PER_SIGMA * 2.0, max_relative = 1e-7);
        assert_relative_eq!(w.centroid, 50.0, epsilon = 1e-6);
    }

    #[test]
    fn tail_widens_and_shifts_the_peak() {
        let gauss = fwhm(ShapeKind::HpgePeak, &[1000.0, 500.0, 1.0, 0.0, 0.004, 0.0, 0.0]).unwrap();
        let tailed = signal_width(ShapeKind::HpgePeak, &[1000.0, 500.0, 1.0, 0.4, 0.004, 0.0, 0.0]).unwrap();
        assert!(tailed.fwhm > gauss);
        assert!(tailed.centroid < 500.0);
    }

    #[test]
    fn tail_dominated_shape_is_bracketed() {
        let w = fwhm(ShapeKind::HpgePeak, &[1000.0, 500.0, 1.0, 0.9, 0.01, 0.0, 0.0]);
        assert!(w.is_some_and(|v| v > FWHM_PER_SIGMA));
    }

    #[test]
    fn invalid_width_is_undefined() {
        assert_eq!(fwhm(ShapeKind::GaussOnStep, &[1000.0, 50.0, -2.0, 5.0, 1.0]), None);
        assert_eq!(fwhm(ShapeKind::GaussOnStep, &[1000.0, f64::NAN, 2.0, 5.0, 1.0]), None);
    }

    #[test]
    fn uncertainty_follows_sigma_error() {
        // FWHM is linear in sigma for a Gaussian, so its spread is 2.3548·se(sigma).
        let best = [1000.0, 50.0, 2.0, 5.0, 0.0];
        let se = [0.05];
        let config = McConfig { samples_diag: 4000, ..McConfig::default() };
        let u = fwhm_uncertainty(ShapeKind::GaussOnStep, &best, &[2], Spread::StdErrors(&se), &config).unwrap();
        assert_relative_eq!(u, FWHM_PER_SIGMA * 0.05, max_relative = 0.06);
    }

    #[test]
    fn uncertainty_is_deterministic_for_a_seed() {
        let best = [1000.0, 50.0, 2.0, 5.0, 0.0];
        let cov = DMatrix::from_row_slice(2, 2, &[0.01, 0.001, 0.001, 0.0025]);
        let config = McConfig { samples_full: 600, ..McConfig::default() };
        let a = fwhm_uncertainty(ShapeKind::GaussOnStep, &best, &[1, 2], Spread::Covariance(&cov), &config);
        let b = fwhm_uncertainty(ShapeKind::GaussOnStep, &best, &[1, 2], Spread::Covariance(&cov), &config);
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn all_undefined_draws_give_no_uncertainty() {
        // sigma scattered around a negative value: every draw fails.
        let best = [1000.0, 50.0, -2.0, 5.0, 0.0];
        let se = [0.01];
        let u = fwhm_uncertainty(ShapeKind::GaussOnStep, &best, &[2], Spread::StdErrors(&se), &McConfig::default());
        assert_eq!(u, None);
    }
}

//! Quick histogram statistics used to seed a peak fit.
//!
//! The estimator is deliberately crude: the likelihood fit does the real work,
//! and the prior only needs a start point and sensible bounds.

use crate::domain::{Histogram, PeakStats};
use crate::error::{FitError, Result};
use crate::models::FWHM_PER_SIGMA;

/// Fraction of bins on each side treated as background-only.
const SIDEBAND_FRACTION: f64 = 0.1;
const MIN_SIDEBAND_BINS: usize = 3;

impl PeakStats {
    /// Estimate position, width, net counts and background from `hist`.
    ///
    /// - position: centroid of the bins above half maximum
    /// - background: sideband densities (high side = flat level, low − high = step)
    /// - FWHM: walk out from the maximum to half the background-subtracted height
    pub fn estimate(hist: &Histogram) -> Result<PeakStats> {
        let n = hist.nbins();
        if n < 2 * MIN_SIDEBAND_BINS + 1 {
            return Err(FitError::input(format!(
                "histogram needs at least {} bins to estimate peak statistics",
                2 * MIN_SIDEBAND_BINS + 1
            )));
        }
        let centers = hist.centers();
        let widths = hist.widths();
        let density: Vec<f64> = hist.counts().iter().zip(&widths).map(|(c, w)| c / w).collect();

        let side = ((n as f64 * SIDEBAND_FRACTION).round() as usize).max(MIN_SIDEBAND_BINS);
        let (low_mean, low_sd) = mean_sd(&density[..side]);
        let (high_mean, high_sd) = mean_sd(&density[n - side..]);
        let bkg = high_mean;
        let step = low_mean - high_mean;
        let bkg_std = (0.5 * (low_sd * low_sd + high_sd * high_sd)).sqrt();

        let imax = density
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| FitError::input("empty histogram"))?;

        let level = |i: usize| density[i] - bkg - 0.5 * step.max(0.0);
        let height = level(imax);
        let half = 0.5 * height;
        let left = crossing(&centers, (0..imax).rev(), imax, &level, half);
        let right = crossing(&centers, imax + 1..n, imax, &level, half);
        let fwhm = match (left, right) {
            (Some(l), Some(r)) if r > l => r - l,
            _ => widths[imax] * FWHM_PER_SIGMA,
        };
        let sigma = fwhm / FWHM_PER_SIGMA;

        let (mut wsum, mut xsum) = (0.0, 0.0);
        for i in 0..n {
            let w = level(i);
            if w >= half {
                wsum += w;
                xsum += w * centers[i];
            }
        }
        let position = if wsum > 0.0 { xsum / wsum } else { centers[imax] };

        let (x0, x1) = hist.range();
        let background_counts = bkg * (x1 - x0) + step.max(0.0) * (position - x0).max(0.0);
        let counts = (hist.total() - background_counts).max(1.0);

        Ok(PeakStats { position, fwhm, sigma, counts, bkg: bkg.max(0.0), step, bkg_std })
    }
}

/// First index in `walk` where `level` drops below `half`, interpolated linearly.
fn crossing(
    centers: &[f64],
    walk: impl Iterator<Item = usize>,
    start: usize,
    level: &impl Fn(usize) -> f64,
    half: f64,
) -> Option<f64> {
    let mut prev = start;
    for i in walk {
        let (a, b) = (level(prev), level(i));
        if b < half {
            let t = if (a - b).abs() > 0.0 { (a - half) / (a - b) } else { 0.5 };
            return Some(centers[prev] + t * (centers[i] - centers[prev]));
        }
        prev = i;
    }
    None
}

fn mean_sd(xs: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnergyUnit, ShapeKind, uniform_edges};
    use crate::models::bin_expectations;

    fn asimov(params: &[f64]) -> Histogram {
        let edges = uniform_edges(0.0, 100.0, 200);
        let counts = bin_expectations(ShapeKind::GaussOnStep, &edges, params);
        Histogram::new(edges, counts, EnergyUnit::KeV).unwrap()
    }

    #[test]
    fn asimov_gaussian_statistics() {
        let h = asimov(&[10_000.0, 50.0, 2.0, 5.0, 0.0]);
        let s = PeakStats::estimate(&h).unwrap();
        assert!((s.position - 50.0).abs() < 0.1, "{s:?}");
        assert!((s.sigma - 2.0).abs() < 0.1, "{s:?}");
        assert!((s.bkg - 5.0).abs() < 1e-6, "{s:?}");
        assert!(s.step.abs() < 1e-6, "{s:?}");
        assert!((s.counts - 10_000.0).abs() < 50.0, "{s:?}");
    }

    #[test]
    fn step_is_detected() {
        let h = asimov(&[5_000.0, 40.0, 1.5, 2.0, 3.0]);
        let s = PeakStats::estimate(&h).unwrap();
        assert!((s.step - 3.0).abs() < 0.05, "{s:?}");
        assert!((s.position - 40.0).abs() < 0.2, "{s:?}");
    }

    #[test]
    fn tiny_histograms_are_rejected() {
        let h = Histogram::uniform(0.0, 3.0, vec![1.0, 5.0, 1.0], EnergyUnit::KeV).unwrap();
        assert!(PeakStats::estimate(&h).is_err());
    }
}

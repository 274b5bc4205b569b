//! Poisson likelihood-ratio goodness of fit.
//!
//! The statistic compares the fitted model with the saturated model (one free
//! expectation per bin):
//!
//! ```text
//! chi2 = 2 Σ_i [ λ_i − k_i + k_i·ln(k_i / λ_i) ]
//! ```
//!
//! Bins with `k_i = 0` contribute `2λ_i`. Bins with zero expectation carry no
//! information and are left out of both the statistic and the degrees of
//! freedom.

use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::domain::GoodnessOfFit;

/// Evaluate the goodness of fit of `expected` against `observed`.
///
/// `n_free` is the number of parameters the fit adjusted. `converged` is
/// copied into the result so that downstream readers know whether the
/// statistic refers to a real optimum.
pub fn goodness_of_fit(observed: &[f64], expected: &[f64], n_free: usize, converged: bool) -> GoodnessOfFit {
    let mut chi2 = 0.0;
    let mut n_informative = 0usize;
    let mut residuals = Vec::with_capacity(observed.len());
    let mut normalized_residuals = Vec::with_capacity(observed.len());

    for (&k, &lam) in observed.iter().zip(expected) {
        let r = k - lam;
        residuals.push(r);
        if lam > 0.0 && lam.is_finite() {
            n_informative += 1;
            chi2 += if k > 0.0 { lam - k + k * (k / lam).ln() } else { lam };
            normalized_residuals.push(r / lam.sqrt());
        } else {
            normalized_residuals.push(0.0);
        }
    }
    // Rounding can push a near-perfect fit a hair below zero.
    let chi2 = (2.0 * chi2).max(0.0);
    let dof = n_informative.saturating_sub(n_free);

    GoodnessOfFit {
        p_value: p_value(chi2, dof),
        chi2,
        dof,
        residuals,
        normalized_residuals,
        converged,
    }
}

/// Chi-squared survival probability, `1` when there are no degrees of freedom.
pub fn p_value(chi2: f64, dof: usize) -> f64 {
    if dof == 0 || !chi2.is_finite() {
        return if chi2.is_finite() { 1.0 } else { 0.0 };
    }
    match ChiSquared::new(dof as f64) {
        Ok(dist) => dist.sf(chi2).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn perfect_fit_has_zero_statistic() {
        let obs = [4.0, 9.0, 16.0, 9.0, 4.0];
        let gof = goodness_of_fit(&obs, &obs, 2, true);
        assert_relative_eq!(gof.chi2, 0.0, epsilon = 1e-12);
        assert_eq!(gof.dof, 3);
        assert_relative_eq!(gof.p_value, 1.0, epsilon = 1e-12);
        assert!(gof.residuals.iter().all(|r| *r == 0.0));
    }

    #[test]
    fn empty_bins_and_zero_expectation() {
        let obs = [0.0, 2.0, 3.0];
        let exp = [1.5, 0.0, 3.0];
        let gof = goodness_of_fit(&obs, &exp, 0, true);
        // only bins 0 and 2 are informative
        assert_eq!(gof.dof, 2);
        assert_relative_eq!(gof.chi2, 3.0, epsilon = 1e-12);
        assert_eq!(gof.normalized_residuals[1], 0.0);
        assert_relative_eq!(gof.residuals[1], 2.0);
        assert!(gof.p_value > 0.0 && gof.p_value < 1.0);
    }

    #[test]
    fn more_parameters_than_bins_gives_unit_p_value() {
        let gof = goodness_of_fit(&[5.0, 6.0], &[4.0, 7.0], 7, true);
        assert_eq!(gof.dof, 0);
        assert_eq!(gof.p_value, 1.0);
        assert!(gof.chi2 > 0.0);
    }

    #[test]
    fn p_value_matches_known_quantile() {
        // 95th percentile of chi2(1) is 3.841459
        assert_relative_eq!(p_value(3.841_459, 1), 0.05, epsilon = 1e-6);
        assert_eq!(p_value(f64::INFINITY, 3), 0.0);
    }
}

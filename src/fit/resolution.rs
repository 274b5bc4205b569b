//! Energy-resolution curve across calibration lines.
//!
//! ```text
//! FWHM(E) = sqrt(max(0, Σ_{i=0}^{order} p_i·E^i))
//! χ²(p)   = Σ_j ((FWHM(E_j) − F_j) / σ_j)²  +  Σ_{i≥2} (p_i / σ_pull)²
//! ```
//!
//! Energies are divided by the largest one before fitting so the polynomial
//! coefficients are of comparable size. The fit is seeded by weighted linear
//! least squares on `F²`, then refined by Levenberg–Marquardt on the
//! square-root model. A negative polynomial evaluates to a zero width, which
//! the χ² penalizes through the residual of that point.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::domain::{EnergyUnit, Estimate, Quantity, ResolutionCurve, magnitudes_in};
use crate::error::{FitError, Result};
use crate::math::linalg::{invert, nearest_spd};
use crate::math::solve_weighted_least_squares;

/// Q-value of ⁷⁶Ge double-beta decay, in keV.
pub const REFERENCE_ENERGY_KEV: f64 = 2039.061;

const MAX_LM_ITER: usize = 200;
const LM_TOL: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveOptions {
    /// Highest power of `E` under the square root (at least 1).
    pub pol_order: usize,
    /// Standard deviation of the zero-centred pull on every `p_i` with
    /// `i ≥ 2`, in the natural units of that coefficient.
    pub pull_sd: Option<f64>,
    /// Unit the fit is carried out in.
    pub unit: EnergyUnit,
    pub reference_energy: Quantity,
}

impl Default for CurveOptions {
    fn default() -> Self {
        Self {
            pol_order: 1,
            pull_sd: None,
            unit: EnergyUnit::KeV,
            reference_energy: Quantity::kev(REFERENCE_ENERGY_KEV),
        }
    }
}

/// Fitted function and per-point residuals.
#[derive(Debug, Clone)]
pub struct CurveReport {
    coefficients: Vec<f64>,
    residuals: Vec<f64>,
    normalized_residuals: Vec<f64>,
    /// Pull contributions `p_i / σ_pull` for `i ≥ 2`.
    pub pulls: Vec<f64>,
}

impl CurveReport {
    /// Fitted `FWHM(E)` in the curve's unit.
    pub fn evaluate(&self, energy: f64) -> f64 {
        poly(&self.coefficients, energy).max(0.0).sqrt()
    }

    /// `F_j − FWHM(E_j)`.
    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    /// Residuals divided by the FWHM uncertainty.
    pub fn normalized_residuals(&self) -> &[f64] {
        &self.normalized_residuals
    }
}

fn poly(c: &[f64], x: f64) -> f64 {
    c.iter().rev().fold(0.0, |acc, ci| acc * x + ci)
}

/// The least-squares problem in scaled energies `x = E / s`.
struct Problem<'a> {
    x: &'a [f64],
    y: &'a [f64],
    err: &'a [f64],
    /// Pull sd for each coefficient in scaled units; `None` for unpulled ones.
    pull: Vec<Option<f64>>,
}

impl Problem<'_> {
    fn n_params(&self) -> usize {
        self.pull.len()
    }

    /// Stacked residuals (data, then pulls) and their Jacobian.
    fn residuals(&self, q: &[f64]) -> (DVector<f64>, DMatrix<f64>) {
        let n_pull = self.pull.iter().flatten().count();
        let rows = self.x.len() + n_pull;
        let mut r = DVector::zeros(rows);
        let mut jac = DMatrix::zeros(rows, self.n_params());
        for (j, ((&x, &y), &e)) in self.x.iter().zip(self.y).zip(self.err).enumerate() {
            let p = poly(q, x);
            let model = p.max(0.0).sqrt();
            r[j] = (model - y) / e;
            if p > 0.0 {
                let mut xi = 1.0;
                for i in 0..self.n_params() {
                    jac[(j, i)] = xi / (2.0 * model * e);
                    xi *= x;
                }
            }
        }
        let mut row = self.x.len();
        for (i, sd) in self.pull.iter().enumerate() {
            if let Some(sd) = sd {
                r[row] = q[i] / sd;
                jac[(row, i)] = 1.0 / sd;
                row += 1;
            }
        }
        (r, jac)
    }

    /// Linear fit of `y²` with weights `1 / (2·y·σ)²`, pulls as pseudo-rows.
    fn seed(&self) -> Vec<f64> {
        let k = self.n_params();
        let n_pull = self.pull.iter().flatten().count();
        let rows = self.x.len() + n_pull;
        let mut design = DMatrix::zeros(rows, k);
        let mut target = DVector::zeros(rows);
        let mut weights = Vec::with_capacity(rows);
        for (j, ((&x, &y), &e)) in self.x.iter().zip(self.y).zip(self.err).enumerate() {
            let mut xi = 1.0;
            for i in 0..k {
                design[(j, i)] = xi;
                xi *= x;
            }
            target[j] = y * y;
            weights.push((2.0 * y.abs().max(e) * e).powi(-2));
        }
        let mut row = self.x.len();
        for (i, sd) in self.pull.iter().enumerate() {
            if let Some(sd) = sd {
                design[(row, i)] = 1.0;
                weights.push(sd.powi(-2));
                row += 1;
            }
        }
        match solve_weighted_least_squares(&design, &target, &weights) {
            Some(beta) => beta.iter().copied().collect(),
            None => {
                // Flat curve through the mean squared width.
                let mean_sq = self.y.iter().map(|y| y * y).sum::<f64>() / self.y.len() as f64;
                let mut q = vec![0.0; k];
                q[0] = mean_sq;
                q
            }
        }
    }

    /// Levenberg–Marquardt from `q0`. Returns the optimum and whether it converged.
    fn refine(&self, q0: Vec<f64>) -> (Vec<f64>, bool) {
        let mut q = q0;
        let (mut r, mut jac) = self.residuals(&q);
        let mut cost = r.norm_squared();
        let mut lambda = 1e-3;
        for iter in 0..MAX_LM_ITER {
            let jt = jac.transpose();
            let jtj = &jt * &jac;
            let grad = &jt * &r;
            let mut a = jtj.clone();
            for i in 0..a.nrows() {
                a[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(step) = a.lu().solve(&(-grad)) else {
                lambda *= 10.0;
                continue;
            };
            let trial: Vec<f64> = q.iter().zip(step.iter()).map(|(a, b)| a + b).collect();
            let (r_new, jac_new) = self.residuals(&trial);
            let cost_new = r_new.norm_squared();
            if cost_new.is_finite() && cost_new <= cost {
                let drop = cost - cost_new;
                q = trial;
                r = r_new;
                jac = jac_new;
                cost = cost_new;
                lambda = (lambda / 10.0).max(1e-12);
                if drop <= LM_TOL * cost.max(1.0) {
                    debug!(iterations = iter + 1, chi2 = cost, "resolution curve converged");
                    return (q, true);
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    // No downhill step left at any damping.
                    return (q, true);
                }
            }
        }
        (q, false)
    }
}

/// Fit `FWHM(E)` to per-line widths and evaluate it at the reference energy.
///
/// All three slices must have the same length and units convertible to
/// `options.unit`; uncertainties must be finite and positive.
pub fn fit_resolution_curve(
    energies: &[Quantity],
    fwhms: &[Quantity],
    fwhm_errs: &[Quantity],
    options: &CurveOptions,
) -> Result<(ResolutionCurve, CurveReport)> {
    if options.pol_order < 1 {
        return Err(FitError::input("pol_order must be >= 1"));
    }
    if energies.len() != fwhms.len() || energies.len() != fwhm_errs.len() {
        return Err(FitError::input(format!(
            "length mismatch: {} energies, {} FWHMs, {} errors",
            energies.len(),
            fwhms.len(),
            fwhm_errs.len()
        )));
    }
    if energies.is_empty() {
        return Err(FitError::input("resolution curve needs at least one line"));
    }
    if let Some(sd) = options.pull_sd {
        if !(sd.is_finite() && sd > 0.0) {
            return Err(FitError::input("pull_sd must be finite and positive"));
        }
    }
    let unit = options.unit;
    let e = magnitudes_in(energies, unit)?;
    let y = magnitudes_in(fwhms, unit)?;
    let err = magnitudes_in(fwhm_errs, unit)?;
    let e0 = options.reference_energy.magnitude_in(unit)?;
    if err.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
        return Err(FitError::input("FWHM uncertainties must be finite and positive"));
    }
    if e.iter().chain(&y).any(|v| !v.is_finite()) {
        return Err(FitError::input("energies and FWHMs must be finite"));
    }

    let k = options.pol_order + 1;
    let scale = e.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(f64::MIN_POSITIVE);
    let x: Vec<f64> = e.iter().map(|v| v / scale).collect();
    let problem = Problem {
        x: &x,
        y: &y,
        err: &err,
        pull: (0..k)
            .map(|i| options.pull_sd.filter(|_| i >= 2).map(|sd| sd * scale.powi(i as i32)))
            .collect(),
    };
    if problem.x.len() + problem.pull.iter().flatten().count() < k {
        warn!(points = e.len(), params = k, "resolution curve is underdetermined");
    }

    let (q, converged) = problem.refine(problem.seed());
    if !converged {
        warn!("resolution curve fit hit the iteration limit");
    }
    let (r, jac) = problem.residuals(&q);

    // Back to natural units: p_i = q_i / s^i.
    let unscale: Vec<f64> = (0..k).map(|i| scale.powi(-(i as i32))).collect();
    let p: Vec<f64> = q.iter().zip(&unscale).map(|(a, b)| a * b).collect();
    let cov_q = invert(&(jac.transpose() * &jac)).map(|c| nearest_spd(&c));
    let cov_p = cov_q.as_ref().map(|c| DMatrix::from_fn(k, k, |i, j| c[(i, j)] * unscale[i] * unscale[j]));

    let coefficients: Vec<Estimate> = p
        .iter()
        .enumerate()
        .map(|(i, &v)| Estimate::new(v, cov_p.as_ref().map(|c| c[(i, i)].max(0.0).sqrt())))
        .collect();

    // FWHM(E0) with gradient propagation, in scaled coordinates.
    let x0 = e0 / scale;
    let poly0 = poly(&q, x0);
    let f0 = poly0.max(0.0).sqrt();
    let f0_err = cov_q.as_ref().filter(|_| poly0 > 0.0).map(|c| {
        let g = DVector::from_fn(k, |i, _| x0.powi(i as i32) / (2.0 * f0));
        (g.transpose() * c * &g)[(0, 0)].max(0.0).sqrt()
    });

    let n = e.len();
    let chi2 = r.rows(0, n).norm_squared();
    let residuals: Vec<f64> = (0..n).map(|j| -r[j] * err[j]).collect();
    let curve = ResolutionCurve {
        coefficients,
        covariance: cov_p
            .map(|c| (0..k).map(|i| c.row(i).iter().copied().collect()).collect())
            .unwrap_or_default(),
        energies: e,
        fwhms: y.iter().zip(&err).map(|(&v, &s)| Estimate::new(v, Some(s))).collect(),
        unit,
        reference_energy: e0,
        fwhm_at_reference: Estimate::new(f0, f0_err),
        chi2,
        dof: n.saturating_sub(k),
    };
    let report = CurveReport {
        coefficients: p,
        residuals,
        normalized_residuals: (0..n).map(|j| -r[j]).collect(),
        pulls: r.iter().skip(n).copied().collect(),
    };
    Ok((curve, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const LINES: [f64; 5] = [238.632, 583.191, 860.564, 1620.5, 2614.511];

    fn kev(values: &[f64]) -> Vec<Quantity> {
        values.iter().map(|&v| Quantity::kev(v)).collect()
    }

    fn exact(a: f64, b: f64, c: f64) -> (Vec<Quantity>, Vec<Quantity>, Vec<Quantity>) {
        let f: Vec<f64> = LINES.iter().map(|e| (a + b * e + c * e * e).sqrt()).collect();
        (kev(&LINES), kev(&f), kev(&[0.01; 5]))
    }

    #[test]
    fn recovers_exact_linear_curve() {
        let (e, f, s) = exact(1.2, 0.0015, 0.0);
        let (curve, report) = fit_resolution_curve(&e, &f, &s, &CurveOptions::default()).unwrap();
        assert_relative_eq!(curve.coefficients[0].value, 1.2, max_relative = 1e-6);
        assert_relative_eq!(curve.coefficients[1].value, 0.0015, max_relative = 1e-6);
        assert!(curve.chi2 < 1e-8);
        assert_eq!(curve.dof, 3);
        let expected = (1.2 + 0.0015 * REFERENCE_ENERGY_KEV).sqrt();
        assert_relative_eq!(curve.fwhm_at_reference.value, expected, max_relative = 1e-6);
        assert!(curve.fwhm_at_reference.error.is_some_and(|e| e > 0.0 && e < 0.05));
        assert_relative_eq!(report.evaluate(1000.0), curve.evaluate(1000.0), max_relative = 1e-12);
        assert!(report.residuals().iter().all(|r| r.abs() < 1e-6));
    }

    #[test]
    fn mev_inputs_are_converted() {
        let (e, f, s) = exact(1.2, 0.0015, 0.0);
        let e_mev: Vec<Quantity> = e.iter().map(|q| q.to(EnergyUnit::MeV).unwrap()).collect();
        let (curve, _) = fit_resolution_curve(&e_mev, &f, &s, &CurveOptions::default()).unwrap();
        assert_eq!(curve.unit, EnergyUnit::KeV);
        assert_relative_eq!(curve.coefficients[1].value, 0.0015, max_relative = 1e-6);
        assert_relative_eq!(curve.reference_energy, REFERENCE_ENERGY_KEV);
    }

    #[test]
    fn pulls_shrink_curvature() {
        let (e, f, _) = exact(1.0, 0.002, 4e-7);
        let s = kev(&[0.05; 5]);
        let free = CurveOptions { pol_order: 2, ..CurveOptions::default() };
        let pulled = CurveOptions { pull_sd: Some(1e-8), ..free };
        let (a, _) = fit_resolution_curve(&e, &f, &s, &free).unwrap();
        let (b, report) = fit_resolution_curve(&e, &f, &s, &pulled).unwrap();
        assert_relative_eq!(a.coefficients[2].value, 4e-7, max_relative = 1e-4);
        assert!(b.coefficients[2].value.abs() < a.coefficients[2].value.abs());
        assert_eq!(report.pulls.len(), 1);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let (e, f, s) = exact(1.2, 0.0015, 0.0);
        let zero_order = CurveOptions { pol_order: 0, ..CurveOptions::default() };
        assert!(matches!(fit_resolution_curve(&e, &f, &s, &zero_order), Err(FitError::Input(_))));
        assert!(fit_resolution_curve(&e[..4], &f, &s, &CurveOptions::default()).is_err());
        let mut bad = s.clone();
        bad[2] = Quantity::kev(0.0);
        assert!(fit_resolution_curve(&e, &f, &bad, &CurveOptions::default()).is_err());
        let mut adc = e.clone();
        adc[0] = Quantity::new(1000.0, EnergyUnit::Adc);
        assert!(fit_resolution_curve(&adc, &f, &s, &CurveOptions::default()).is_err());
    }

    #[test]
    fn negative_polynomial_is_penalized_not_nan() {
        // Widths that shrink with energy push the linear term negative.
        let e = kev(&[100.0, 1000.0, 3000.0]);
        let f = kev(&[3.0, 2.0, 0.1]);
        let s = kev(&[0.1, 0.1, 0.1]);
        let (curve, report) = fit_resolution_curve(&e, &f, &s, &CurveOptions::default()).unwrap();
        assert!(curve.chi2.is_finite());
        assert!(report.evaluate(10_000.0) >= 0.0);
        assert!(curve.fwhm_at_reference.value.is_finite());
    }
}

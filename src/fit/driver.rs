//! Independent fits of every calibration line.
//!
//! Each line is fit on the rayon pool with its own histogram, prior and
//! result; nothing mutable is shared between lines. One failing line degrades
//! to a non-converged result and never aborts the batch; only invalid input
//! (duplicate line ids, unconvertible units) stops the call.
//!
//! After each fit, energy-like results (`mu`, `sigma`, FWHM, centroid) are
//! rescaled into the calibrated unit.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use tracing::info;

use crate::domain::{EnergyUnit, Histogram, Param, PeakFit, PeakStats, Quantity};
use crate::error::{FitError, Result};
use crate::fit::budget::{default_budget, resident_memory};
use crate::fit::peak::{PeakFitOptions, PeakReport, fit_single_peak};

/// One calibration line to fit.
#[derive(Debug, Clone)]
pub struct PeakInput {
    /// Unique line id, e.g. `"2614.511"` or `"Tl208_DEP"`.
    pub line: String,
    /// Known energy of the line.
    pub energy: Quantity,
    pub histogram: Histogram,
    /// Start-point statistics; estimated from the histogram when `None`.
    pub stats: Option<PeakStats>,
    /// Linear detector-response factor applied after the fit.
    ///
    /// For an `ADC` histogram this is calibrated units per ADC channel. For a
    /// histogram already in a physical unit it is a dimensionless gain
    /// correction on top of the unit conversion (normally `1`).
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverOptions {
    pub peak: PeakFitOptions,
    /// Unit of the rescaled results.
    pub calibrated_unit: EnergyUnit,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            peak: PeakFitOptions::default(),
            calibrated_unit: EnergyUnit::KeV,
        }
    }
}

/// Fit all lines in parallel, keyed by line id.
pub fn fit_peaks(inputs: &[PeakInput], options: &DriverOptions) -> Result<BTreeMap<String, (PeakFit, PeakReport)>> {
    let mut seen = BTreeSet::new();
    for input in inputs {
        if !seen.insert(input.line.as_str()) {
            return Err(FitError::input(format!("duplicate calibration line '{}'", input.line)));
        }
    }
    if options.calibrated_unit == EnergyUnit::Adc {
        return Err(FitError::input("results must be rescaled into a physical unit"));
    }

    // One memory baseline for the whole batch, sampled before any fit allocates.
    let mut peak_options = options.peak.clone();
    let memory_limited = peak_options.budget.is_some_and(|b| b.max_memory_growth_bytes.is_some())
        || default_budget().max_memory_growth_bytes.is_some();
    if peak_options.memory_start.is_none() && memory_limited {
        peak_options.memory_start = resident_memory();
    }

    inputs
        .par_iter()
        .map(|input| {
            let (fit, report) = fit_line(input, &peak_options, options.calibrated_unit)?;
            info!(
                line = %input.line,
                status = ?fit.status,
                mu = ?fit.value(Param::Mu),
                fwhm = ?fit.fwhm.map(|f| f.value),
                unit = %fit.unit,
                "line fitted"
            );
            Ok((input.line.clone(), (fit, report)))
        })
        .collect()
}

fn fit_line(input: &PeakInput, options: &PeakFitOptions, target: EnergyUnit) -> Result<(PeakFit, PeakReport)> {
    let factor = rescale_factor(input, target)?;
    let stats = match input.stats {
        Some(s) => s,
        None => PeakStats::estimate(&input.histogram)?,
    };
    let (fit, report) = fit_single_peak(&input.histogram, &stats, options)?;
    Ok((rescale(fit, factor, target), report))
}

/// Combined factor from histogram units to `target`.
pub fn rescale_factor(input: &PeakInput, target: EnergyUnit) -> Result<f64> {
    if !(input.scale.is_finite() && input.scale > 0.0) {
        return Err(FitError::input(format!(
            "line '{}': scale must be finite and positive, got {}",
            input.line, input.scale
        )));
    }
    let unit = input.histogram.unit();
    let conversion = if unit == EnergyUnit::Adc { 1.0 } else { unit.factor_to(target)? };
    Ok(input.scale * conversion)
}

/// Apply a linear energy rescale to the energy-like parts of `fit`.
///
/// Amplitudes and background densities are left in histogram units.
pub fn rescale(mut fit: PeakFit, factor: f64, target: EnergyUnit) -> PeakFit {
    for (param, estimate) in fit.params.iter_mut() {
        if param.is_energy_like() {
            *estimate = estimate.scaled(factor);
        }
    }
    if let Some(cov) = fit.covariance.as_mut() {
        let f: Vec<f64> = cov.names.iter().map(|p| if p.is_energy_like() { factor } else { 1.0 }).collect();
        for (i, row) in cov.matrix.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v *= f[i] * f[j];
            }
        }
    }
    fit.fwhm = fit.fwhm.map(|e| e.scaled(factor));
    fit.centroid = fit.centroid.map(|c| c * factor);
    fit.unit = target;
    fit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleSpec, generate_histogram};
    use crate::domain::{Covariance, Estimate, FitStatus, ParameterVector, ShapeKind, Termination, uniform_edges};
    use crate::fit::fwhm::McConfig;
    use approx::assert_relative_eq;

    fn adc_line(line: &str, mu: f64, seed: u64) -> PeakInput {
        let truth =
            ParameterVector::from_flat(ShapeKind::GaussOnStep.param_names(), &[5_000.0, mu, 3.0, 4.0, 0.0]).unwrap();
        let histogram = generate_histogram(&SampleSpec {
            shape: ShapeKind::GaussOnStep,
            truth,
            edges: uniform_edges(mu - 40.0, mu + 40.0, 80),
            unit: EnergyUnit::Adc,
            seed,
        })
        .unwrap();
        PeakInput {
            line: line.into(),
            energy: Quantity::kev(mu * 0.5),
            histogram,
            stats: None,
            scale: 0.5,
        }
    }

    fn options() -> DriverOptions {
        DriverOptions {
            peak: PeakFitOptions {
                shape: ShapeKind::GaussOnStep,
                mc: McConfig { samples_full: 300, ..McConfig::default() },
                ..PeakFitOptions::default()
            },
            calibrated_unit: EnergyUnit::KeV,
        }
    }

    #[test]
    fn fits_every_line_and_rescales() {
        let inputs = vec![adc_line("a", 400.0, 1), adc_line("b", 1000.0, 2), adc_line("c", 3000.0, 3)];
        let results = fit_peaks(&inputs, &options()).unwrap();
        assert_eq!(results.keys().map(String::as_str).collect::<Vec<_>>(), ["a", "b", "c"]);
        let (fit, _) = &results["b"];
        assert_eq!(fit.unit, EnergyUnit::KeV);
        assert!((fit.value(Param::Mu).unwrap() - 500.0).abs() < 0.3);
        assert!((fit.value(Param::Sigma).unwrap() - 1.5).abs() < 0.15);
        // amplitudes stay in counts
        assert!((fit.value(Param::NSig).unwrap() - 5_000.0).abs() < 400.0);
        let fwhm = fit.fwhm.unwrap();
        assert_relative_eq!(fwhm.value, fit.value(Param::Sigma).unwrap() * 2.354_820_045, max_relative = 1e-6);
    }

    #[test]
    fn duplicate_lines_are_rejected() {
        let inputs = vec![adc_line("a", 400.0, 1), adc_line("a", 1000.0, 2)];
        assert!(matches!(fit_peaks(&inputs, &options()), Err(FitError::Input(_))));
    }

    #[test]
    fn rescale_scales_covariance_and_errors() {
        let mut params = BTreeMap::new();
        params.insert(Param::Mu, Estimate::new(100.0, Some(0.2)));
        params.insert(Param::NSig, Estimate::new(50.0, Some(7.0)));
        let fit = PeakFit {
            shape: ShapeKind::GaussOnStep,
            params,
            fixed: Default::default(),
            covariance: Some(Covariance {
                names: vec![Param::NSig, Param::Mu],
                matrix: vec![vec![49.0, 0.1], vec![0.1, 0.04]],
            }),
            fwhm: Some(Estimate::new(4.0, Some(0.1))),
            centroid: Some(100.0),
            gof: None,
            status: FitStatus::ConvergedWithCov,
            termination: Termination::Converged,
            iterations: 10,
            retried: false,
            retry_exhausted: false,
            unit: EnergyUnit::Adc,
        };
        let out = rescale(fit, 0.25, EnergyUnit::KeV);
        assert_eq!(out.value(Param::Mu), Some(25.0));
        assert_eq!(out.error(Param::Mu), Some(0.05));
        assert_eq!(out.value(Param::NSig), Some(50.0));
        let cov = out.covariance.unwrap();
        assert_relative_eq!(cov.matrix[1][1], 0.0025);
        assert_relative_eq!(cov.matrix[0][1], 0.025);
        assert_eq!(out.fwhm.unwrap().value, 1.0);
        assert_eq!(out.centroid, Some(25.0));
    }

    #[test]
    fn physical_histograms_convert_units() {
        let mut input = adc_line("x", 400.0, 4);
        input.histogram =
            Histogram::new(input.histogram.edges().to_vec(), input.histogram.counts().to_vec(), EnergyUnit::MeV).unwrap();
        input.scale = 1.0;
        assert_relative_eq!(rescale_factor(&input, EnergyUnit::KeV).unwrap(), 1000.0);
        input.scale = 0.0;
        assert!(rescale_factor(&input, EnergyUnit::KeV).is_err());
    }
}

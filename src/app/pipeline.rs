//! Shared "fit pipeline" logic used by the `fit` and `demo` commands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! inputs -> per-line peak fits -> resolution curve -> exports
//!
//! The commands can then focus on where their inputs come from and on
//! presentation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::data::{SampleSpec, generate_histogram};
use crate::domain::{EnergyUnit, ParameterVector, Quantity, ResolutionCurve, ShapeKind, uniform_edges};
use crate::error::Result;
use crate::fit::{CurveOptions, CurveReport, DriverOptions, PeakInput, PeakReport, fit_peaks, fit_resolution_curve};
use crate::io::{IngestedRun, LineError, LineResult, ResultsFile, write_curve_json, write_results_json};

/// Everything one run needs besides its inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitConfig {
    pub driver: DriverOptions,
    pub curve: CurveOptions,
    /// Skip the resolution curve even when enough lines converge.
    pub skip_curve: bool,
    pub export_results: Option<PathBuf>,
    pub export_curve: Option<PathBuf>,
}

/// All computed outputs of a single run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub lines: BTreeMap<String, LineResult>,
    pub reports: BTreeMap<String, PeakReport>,
    pub curve: Option<(ResolutionCurve, CurveReport)>,
    /// Fitted lines left out of the curve, with the reason.
    pub curve_skipped: Vec<(String, String)>,
    /// Lines rejected before fitting.
    pub line_errors: Vec<LineError>,
    pub lines_read: usize,
}

impl RunOutput {
    pub fn results_file(&self) -> ResultsFile {
        ResultsFile::new(self.lines.clone(), self.curve.as_ref().map(|(c, _)| c.clone()))
    }
}

/// Fit an ingested run file.
///
/// The file's unit replaces the configured one; its prior overrides apply
/// unless `config` overrides the same parameter.
pub fn run_ingested(config: &FitConfig, run: IngestedRun) -> Result<RunOutput> {
    let mut config = config.clone();
    config.driver.calibrated_unit = run.unit;
    config.curve.unit = run.unit;
    let mut overrides = run.priors;
    overrides.extend(std::mem::take(&mut config.driver.peak.overrides));
    config.driver.peak.overrides = overrides;

    let mut output = run_fit(&config, &run.inputs)?;
    output.line_errors = run.line_errors;
    output.lines_read = run.lines_read;
    Ok(output)
}

/// Execute the full fitting pipeline and write the requested exports.
pub fn run_fit(config: &FitConfig, inputs: &[PeakInput]) -> Result<RunOutput> {
    // 1) Independent per-line fits.
    let mut fitted = fit_peaks(inputs, &config.driver)?;

    let mut lines = BTreeMap::new();
    let mut reports = BTreeMap::new();
    for input in inputs {
        if let Some((fit, report)) = fitted.remove(&input.line) {
            lines.insert(input.line.clone(), LineResult { energy: input.energy, fit });
            reports.insert(input.line.clone(), report);
        }
    }

    // 2) Resolution curve from every line with a usable FWHM.
    let (curve, curve_skipped) = if config.skip_curve {
        (None, Vec::new())
    } else {
        fit_curve(&lines, &config.curve)?
    };

    let output = RunOutput {
        lines,
        reports,
        curve,
        curve_skipped,
        line_errors: Vec::new(),
        lines_read: inputs.len(),
    };

    // 3) Optional exports.
    if let Some(path) = &config.export_results {
        write_results_json(path, &output.results_file())?;
        info!(path = %path.display(), "results written");
    }
    if let Some(path) = &config.export_curve {
        match &output.curve {
            Some((curve, _)) => {
                write_curve_json(path, curve)?;
                info!(path = %path.display(), "curve written");
            }
            None => warn!(path = %path.display(), "no resolution curve to export"),
        }
    }

    Ok(output)
}

type CurveFit = (Option<(ResolutionCurve, CurveReport)>, Vec<(String, String)>);

fn fit_curve(lines: &BTreeMap<String, LineResult>, options: &CurveOptions) -> Result<CurveFit> {
    let mut energies = Vec::new();
    let mut fwhms = Vec::new();
    let mut errs = Vec::new();
    let mut skipped = Vec::new();
    for (line, result) in lines {
        let fit = &result.fit;
        let usable = fit
            .fwhm
            .filter(|_| fit.converged())
            .and_then(|f| f.error.filter(|s| s.is_finite() && *s > 0.0).map(|s| (f.value, s)));
        match usable {
            Some((value, err)) => {
                energies.push(result.energy);
                fwhms.push(Quantity::new(value, fit.unit));
                errs.push(Quantity::new(err, fit.unit));
            }
            None => {
                let reason = if !fit.converged() {
                    format!("fit {:?}", fit.termination)
                } else {
                    "no FWHM uncertainty".to_string()
                };
                skipped.push((line.clone(), reason));
            }
        }
    }

    if energies.len() < 2 {
        warn!(usable = energies.len(), "too few lines for a resolution curve");
        return Ok((None, skipped));
    }
    let (curve, report) = fit_resolution_curve(&energies, &fwhms, &errs, options)?;
    info!(
        lines = energies.len(),
        fwhm_at_reference = curve.fwhm_at_reference.value,
        chi2 = curve.chi2,
        dof = curve.dof,
        "resolution curve fitted"
    );
    Ok((Some((curve, report)), skipped))
}

/// Line energies of the demo spectrum, in keV.
pub const DEMO_LINES_KEV: [f64; 4] = [583.191, 860.564, 1620.5, 2614.511];
/// Demo detector gain.
pub const DEMO_GAIN_KEV_PER_ADC: f64 = 0.25;
/// Demo resolution `FWHM(E) = sqrt(a + b·E)` in keV.
pub const DEMO_RESOLUTION: [f64; 2] = [1.0, 2.0e-3];

const DEMO_COUNTS: [f64; 4] = [20_000.0, 6_000.0, 3_000.0, 30_000.0];

/// Synthetic ADC histograms of a ²²⁸Th-like calibration spectrum.
pub fn demo_inputs(seed: u64) -> Result<Vec<PeakInput>> {
    DEMO_LINES_KEV
        .iter()
        .zip(DEMO_COUNTS)
        .enumerate()
        .map(|(i, (&energy, n_sig))| {
            let fwhm_kev = (DEMO_RESOLUTION[0] + DEMO_RESOLUTION[1] * energy).sqrt();
            let mu = energy / DEMO_GAIN_KEV_PER_ADC;
            let sigma = fwhm_kev / (8.0_f64 * 2.0_f64.ln()).sqrt() / DEMO_GAIN_KEV_PER_ADC;
            let half_width = (15.0 * sigma).round().max(20.0);
            let truth = ParameterVector::from_flat(
                ShapeKind::HpgePeak.param_names(),
                &[n_sig, mu, sigma, 0.15, 4.0e-4, 20.0, 5.0],
            )?;
            let lo = (mu - half_width).floor();
            let hi = (mu + half_width).ceil();
            let histogram = generate_histogram(&SampleSpec {
                shape: ShapeKind::HpgePeak,
                truth,
                edges: uniform_edges(lo, hi, (hi - lo) as usize),
                unit: EnergyUnit::Adc,
                seed: seed.wrapping_add(i as u64),
            })?;
            Ok(PeakInput {
                line: format!("{energy}"),
                energy: Quantity::kev(energy),
                histogram,
                stats: None,
                scale: DEMO_GAIN_KEV_PER_ADC,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Param;

    #[test]
    fn demo_inputs_are_reproducible() {
        let a = demo_inputs(7).unwrap();
        let b = demo_inputs(7).unwrap();
        assert_eq!(a.len(), DEMO_LINES_KEV.len());
        assert_eq!(a[0].histogram, b[0].histogram);
        assert_eq!(a[0].line, "583.191");
        let (lo, hi) = a[3].histogram.range();
        let mu = 2614.511 / DEMO_GAIN_KEV_PER_ADC;
        assert!(lo < mu && mu < hi);
    }

    #[test]
    fn curve_needs_two_usable_lines() {
        let config = FitConfig {
            driver: DriverOptions {
                peak: crate::fit::PeakFitOptions {
                    uncertainty: false,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let inputs = demo_inputs(3).unwrap();
        let out = run_fit(&config, &inputs[..2]).unwrap();
        assert_eq!(out.lines.len(), 2);
        assert!(out.curve.is_none());
        assert_eq!(out.curve_skipped.len(), 2);
        for result in out.lines.values() {
            assert_eq!(result.fit.unit, EnergyUnit::KeV);
            assert!(result.fit.value(Param::Mu).is_some());
        }
    }
}

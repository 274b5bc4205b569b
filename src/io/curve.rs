//! Read/write resolution-curve JSON files.
//!
//! Curve JSON is the portable representation of a fitted resolution curve:
//! - coefficients with covariance, reference energy and fit quality
//! - a precomputed `FWHM(E)` grid with first-order errors for quick plotting

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{Estimate, ResolutionCurve};
use crate::error::{FitError, Result, io_context};

const GRID_POINTS: usize = 101;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveGrid {
    pub energy: Vec<f64>,
    pub fwhm: Vec<Estimate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveFile {
    pub tool: String,
    pub curve: ResolutionCurve,
    pub grid: CurveGrid,
}

/// Write a curve JSON file.
pub fn write_curve_json(path: &Path, curve: &ResolutionCurve) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| io_context(e, format!("failed to create curve JSON '{}'", path.display())))?;
    let out = CurveFile {
        tool: "ecal".to_string(),
        curve: curve.clone(),
        grid: build_grid(curve, GRID_POINTS),
    };
    serde_json::to_writer_pretty(BufWriter::new(file), &out)?;
    Ok(())
}

/// Read a curve JSON file.
pub fn read_curve_json(path: &Path) -> Result<CurveFile> {
    let file = File::open(path)
        .map_err(|e| io_context(e, format!("failed to open curve JSON '{}'", path.display())))?;
    let curve: CurveFile =
        serde_json::from_reader(file).map_err(|e| FitError::input(format!("invalid curve JSON: {e}")))?;
    Ok(curve)
}

/// Grid from zero to the larger of the highest fitted line and the reference energy.
fn build_grid(curve: &ResolutionCurve, n: usize) -> CurveGrid {
    let n = n.max(2);
    let e_max = curve
        .energies
        .iter()
        .copied()
        .fold(curve.reference_energy, f64::max);
    let e_max = if e_max.is_finite() && e_max > 0.0 { e_max } else { 1.0 };

    let mut energy = Vec::with_capacity(n);
    let mut fwhm = Vec::with_capacity(n);
    for i in 0..n {
        let e = e_max * i as f64 / (n as f64 - 1.0);
        energy.push(e);
        fwhm.push(curve.evaluate_with_error(e));
    }
    CurveGrid { energy, fwhm }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EnergyUnit;

    fn curve() -> ResolutionCurve {
        ResolutionCurve {
            coefficients: vec![Estimate::new(1.0, Some(0.1)), Estimate::new(2e-3, Some(1e-4))],
            covariance: vec![vec![0.01, 0.0], vec![0.0, 1e-8]],
            energies: vec![583.191, 2614.511],
            fwhms: vec![Estimate::new(1.5, Some(0.01)), Estimate::new(2.5, Some(0.02))],
            unit: EnergyUnit::KeV,
            reference_energy: 2039.061,
            fwhm_at_reference: Estimate::new(2.27, Some(0.02)),
            chi2: 0.3,
            dof: 0,
        }
    }

    #[test]
    fn grid_covers_lines_and_reference() {
        let grid = build_grid(&curve(), 11);
        assert_eq!(grid.energy.len(), 11);
        assert_eq!(grid.energy[0], 0.0);
        assert!((grid.energy[10] - 2614.511).abs() < 1e-9);
        assert!((grid.fwhm[0].value - 1.0).abs() < 1e-12);
        assert!(grid.fwhm.iter().all(|f| f.error.is_some()));
    }

    #[test]
    fn curve_file_round_trips() {
        let path = std::env::temp_dir().join(format!("ecal-curve-{}.json", std::process::id()));
        write_curve_json(&path, &curve()).unwrap();
        let back = read_curve_json(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(back.tool, "ecal");
        assert_eq!(back.curve.coefficients.len(), 2);
        assert_eq!(back.grid.energy.len(), GRID_POINTS);
    }
}

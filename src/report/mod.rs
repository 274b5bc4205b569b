//! Reporting utilities: fit-quality rankings and formatted terminal output.

pub mod format;

pub use format::*;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::io::LineResult;

/// One line's fit quality, for ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct LineQuality {
    pub line: String,
    pub p_value: Option<f64>,
    pub chi2_per_dof: Option<f64>,
    pub retried: bool,
}

/// Lines ordered from worst to best goodness of fit.
///
/// Lines without a goodness of fit (not converged, or no uncertainty pass)
/// rank first since nothing vouches for them.
pub fn rank_by_fit_quality(lines: &BTreeMap<String, LineResult>, top_n: usize) -> Vec<LineQuality> {
    let mut ranked: Vec<LineQuality> = lines
        .iter()
        .map(|(line, r)| LineQuality {
            line: line.clone(),
            p_value: r.fit.gof.as_ref().map(|g| g.p_value),
            chi2_per_dof: r.fit.gof.as_ref().and_then(|g| g.chi2_per_dof()),
            retried: r.fit.retried,
        })
        .collect();
    ranked.sort_by(|a, b| match (a.p_value, b.p_value) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    });
    ranked.truncate(top_n);
    ranked
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use crate::domain::{EnergyUnit, Estimate, FitStatus, GoodnessOfFit, Param, PeakFit, Quantity, ShapeKind, Termination};
    use crate::io::LineResult;

    pub fn line(energy: f64, p_value: Option<f64>) -> LineResult {
        let mut params = BTreeMap::new();
        params.insert(Param::NSig, Estimate::new(1.0e4, Some(100.0)));
        params.insert(Param::Mu, Estimate::new(energy, Some(0.01)));
        params.insert(Param::Sigma, Estimate::new(1.0, Some(0.01)));
        LineResult {
            energy: Quantity::kev(energy),
            fit: PeakFit {
                shape: ShapeKind::GaussOnStep,
                params,
                fixed: Default::default(),
                covariance: None,
                fwhm: Some(Estimate::new(2.3548, Some(0.02))),
                centroid: Some(energy),
                gof: p_value.map(|p| GoodnessOfFit {
                    p_value: p,
                    chi2: 95.0,
                    dof: 100,
                    residuals: vec![],
                    normalized_residuals: vec![],
                    converged: true,
                }),
                status: if p_value.is_some() { FitStatus::ConvergedWithCov } else { FitStatus::NotConverged },
                termination: if p_value.is_some() { Termination::Converged } else { Termination::MaxIterations },
                iterations: 30,
                retried: false,
                retry_exhausted: false,
                unit: EnergyUnit::KeV,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::fixtures::line;

    #[test]
    fn unvouched_lines_rank_first() {
        let mut lines = BTreeMap::new();
        lines.insert("a".to_string(), line(583.0, Some(0.4)));
        lines.insert("b".to_string(), line(860.0, Some(0.01)));
        lines.insert("c".to_string(), line(2614.0, None));
        let ranked = rank_by_fit_quality(&lines, 2);
        let order: Vec<&str> = ranked.iter().map(|q| q.line.as_str()).collect();
        assert_eq!(order, ["c", "b"]);
        assert_eq!(ranked[1].chi2_per_dof, Some(0.95));
    }
}

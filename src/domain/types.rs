//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - exported to JSON
//! - reloaded later for comparisons or downstream calibration

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::domain::units::EnergyUnit;
use crate::error::{FitError, Result};

/// Named peak-shape parameter.
///
/// The declaration order is the canonical key order: every shape model lists
/// its parameters as an ordered subsequence of this enum, and `BTreeMap`s keyed
/// by `Param` iterate in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    /// Signal counts.
    NSig,
    /// Gaussian centre.
    Mu,
    /// Gaussian width.
    Sigma,
    /// Fraction of signal in the low-energy tail.
    #[serde(rename = "htail")]
    HTail,
    /// Tail decay length relative to `mu`.
    Tau,
    /// Flat background per unit energy.
    Bkg,
    /// Step-background height per unit energy.
    #[serde(rename = "hstep")]
    HStep,
    /// Signal survival fraction.
    Sf,
    /// Background survival fraction.
    Bsf,
    /// Step survival fraction.
    Sasf,
}

impl Param {
    pub const ALL: [Param; 10] = [
        Param::NSig,
        Param::Mu,
        Param::Sigma,
        Param::HTail,
        Param::Tau,
        Param::Bkg,
        Param::HStep,
        Param::Sf,
        Param::Bsf,
        Param::Sasf,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Param::NSig => "n_sig",
            Param::Mu => "mu",
            Param::Sigma => "sigma",
            Param::HTail => "htail",
            Param::Tau => "tau",
            Param::Bkg => "bkg",
            Param::HStep => "hstep",
            Param::Sf => "sf",
            Param::Bsf => "bsf",
            Param::Sasf => "sasf",
        }
    }

    /// Parameters carrying an energy dimension (rescaled by calibration).
    pub fn is_energy_like(self) -> bool {
        matches!(self, Param::Mu | Param::Sigma)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Param {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        Param::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| FitError::input(format!("unknown parameter '{s}'")))
    }
}

/// Peak-shape variant, selected by symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    /// Gaussian on a flat background with a step ("without tail").
    GaussOnStep,
    /// Gaussian plus low-energy exponential tail on a stepped background ("with tail").
    HpgePeak,
}

impl ShapeKind {
    pub fn symbol(self) -> &'static str {
        match self {
            ShapeKind::GaussOnStep => "gauss_on_step",
            ShapeKind::HpgePeak => "hpge_peak",
        }
    }

    /// Canonical parameter list for this variant.
    pub fn param_names(self) -> &'static [Param] {
        match self {
            ShapeKind::GaussOnStep => &[Param::NSig, Param::Mu, Param::Sigma, Param::Bkg, Param::HStep],
            ShapeKind::HpgePeak => &[
                Param::NSig,
                Param::Mu,
                Param::Sigma,
                Param::HTail,
                Param::Tau,
                Param::Bkg,
                Param::HStep,
            ],
        }
    }

    pub fn has_tail(self) -> bool {
        matches!(self, ShapeKind::HpgePeak)
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for ShapeKind {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gauss_on_step" | "without-tail" => Ok(ShapeKind::GaussOnStep),
            "hpge_peak" | "with-tail" => Ok(ShapeKind::HpgePeak),
            other => Err(FitError::input(format!("unknown peak shape '{other}'"))),
        }
    }
}

/// Binned counts over strictly increasing edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHistogram")]
pub struct Histogram {
    edges: Vec<f64>,
    counts: Vec<f64>,
    unit: EnergyUnit,
}

#[derive(Deserialize)]
struct RawHistogram {
    edges: Vec<f64>,
    counts: Vec<f64>,
    #[serde(default = "default_unit")]
    unit: EnergyUnit,
}

fn default_unit() -> EnergyUnit {
    EnergyUnit::KeV
}

impl TryFrom<RawHistogram> for Histogram {
    type Error = FitError;

    fn try_from(raw: RawHistogram) -> Result<Self> {
        Histogram::new(raw.edges, raw.counts, raw.unit)
    }
}

impl Histogram {
    /// Validate and build a histogram.
    ///
    /// Requires `edges.len() == counts.len() + 1`, at least one bin, finite
    /// strictly increasing edges and finite non-negative counts.
    pub fn new(edges: Vec<f64>, counts: Vec<f64>, unit: EnergyUnit) -> Result<Self> {
        if counts.is_empty() {
            return Err(FitError::input("histogram has no bins"));
        }
        if edges.len() != counts.len() + 1 {
            return Err(FitError::input(format!(
                "histogram has {} edges for {} bins",
                edges.len(),
                counts.len()
            )));
        }
        if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[1] <= w[0]) {
            return Err(FitError::input("histogram edges must be finite and strictly increasing"));
        }
        if counts.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err(FitError::input("histogram counts must be finite and non-negative"));
        }
        Ok(Self { edges, counts, unit })
    }

    /// `n` equal-width bins on `[lo, hi]`.
    pub fn uniform(lo: f64, hi: f64, counts: Vec<f64>, unit: EnergyUnit) -> Result<Self> {
        let n = counts.len();
        Histogram::new(uniform_edges(lo, hi, n), counts, unit)
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn unit(&self) -> EnergyUnit {
        self.unit
    }

    pub fn nbins(&self) -> usize {
        self.counts.len()
    }

    pub fn centers(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    pub fn widths(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn range(&self) -> (f64, f64) {
        (self.edges[0], self.edges[self.edges.len() - 1])
    }
}

/// Equally spaced edges for `n` bins on `[lo, hi]`.
pub fn uniform_edges(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    let step = (hi - lo) / n.max(1) as f64;
    (0..=n).map(|i| lo + step * i as f64).collect()
}

/// Named parameter values in canonical order.
///
/// The flat `values` slice is what AD and linear algebra operate on; `names`
/// records which parameter each slot holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    names: Vec<Param>,
    values: Vec<f64>,
}

impl ParameterVector {
    pub fn new(names: Vec<Param>, values: Vec<f64>) -> Result<Self> {
        if names.len() != values.len() {
            return Err(FitError::input(format!(
                "{} parameter names for {} values",
                names.len(),
                values.len()
            )));
        }
        for (i, n) in names.iter().enumerate() {
            if names[..i].contains(n) {
                return Err(FitError::input(format!("duplicate parameter '{n}'")));
            }
        }
        Ok(Self { names, values })
    }

    /// Rebuild from a flat array in the order given by `names`.
    pub fn from_flat(names: &[Param], values: &[f64]) -> Result<Self> {
        ParameterVector::new(names.to_vec(), values.to_vec())
    }

    /// Build from a map, in the map's (canonical) order.
    pub fn from_map(map: &BTreeMap<Param, f64>) -> Self {
        Self {
            names: map.keys().copied().collect(),
            values: map.values().copied().collect(),
        }
    }

    pub fn to_flat(&self) -> Vec<f64> {
        self.values.clone()
    }

    pub fn to_map(&self) -> BTreeMap<Param, f64> {
        self.iter().collect()
    }

    pub fn names(&self) -> &[Param] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_of(&self, p: Param) -> Option<usize> {
        self.names.iter().position(|&n| n == p)
    }

    pub fn get(&self, p: Param) -> Option<f64> {
        self.index_of(p).map(|i| self.values[i])
    }

    pub fn set(&mut self, p: Param, value: f64) -> Result<()> {
        let i = self
            .index_of(p)
            .ok_or_else(|| FitError::input(format!("parameter '{p}' is not part of this vector")))?;
        self.values[i] = value;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Param, f64)> + '_ {
        self.names.iter().copied().zip(self.values.iter().copied())
    }
}

/// A point estimate with an optional standard error.
///
/// `error == None` means the uncertainty is undefined (not fitted, not
/// converged, or not propagatable), which is distinct from zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub error: Option<f64>,
}

impl Estimate {
    pub fn new(value: f64, error: Option<f64>) -> Self {
        Self { value, error }
    }

    pub fn point(value: f64) -> Self {
        Self { value, error: None }
    }

    /// Linear rescale of value and error.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            value: self.value * factor,
            error: self.error.map(|e| e * factor.abs()),
        }
    }
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = f.precision().unwrap_or(4);
        match self.error {
            Some(e) => write!(f, "{:.*} ± {:.*}", p, self.value, p, e),
            None => write!(f, "{:.*} ± undefined", p, self.value),
        }
    }
}

/// Covariance over the free parameters of a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covariance {
    pub names: Vec<Param>,
    pub matrix: Vec<Vec<f64>>,
}

impl Covariance {
    pub fn from_matrix(names: Vec<Param>, m: &DMatrix<f64>) -> Self {
        let matrix = (0..m.nrows()).map(|i| m.row(i).iter().copied().collect()).collect();
        Self { names, matrix }
    }

    pub fn to_matrix(&self) -> DMatrix<f64> {
        let n = self.names.len();
        DMatrix::from_fn(n, n, |i, j| self.matrix[i][j])
    }

    pub fn get(&self, a: Param, b: Param) -> Option<f64> {
        let i = self.names.iter().position(|&p| p == a)?;
        let j = self.names.iter().position(|&p| p == b)?;
        Some(self.matrix[i][j])
    }

    /// `sqrt` of the diagonal entry, `None` if `p` is fixed or the variance is negative.
    pub fn std_error(&self, p: Param) -> Option<f64> {
        self.get(p, p).filter(|v| *v >= 0.0 && v.is_finite()).map(f64::sqrt)
    }

    /// Pearson correlation between two free parameters.
    pub fn correlation(&self, a: Param, b: Param) -> Option<f64> {
        let c = self.get(a, b)?;
        let d = self.std_error(a)? * self.std_error(b)?;
        (d > 0.0).then(|| c / d)
    }
}

/// Poisson likelihood-ratio goodness of fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodnessOfFit {
    pub p_value: f64,
    pub chi2: f64,
    pub dof: usize,
    /// `observed - expected` per bin.
    pub residuals: Vec<f64>,
    /// `(observed - expected) / sqrt(expected)`; zero where `expected == 0`.
    pub normalized_residuals: Vec<f64>,
    pub converged: bool,
}

impl GoodnessOfFit {
    pub fn chi2_per_dof(&self) -> Option<f64> {
        (self.dof > 0).then(|| self.chi2 / self.dof as f64)
    }
}

/// Why the optimizer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    MaxIterations,
    TimeBudgetExceeded,
    MemoryBudgetExceeded,
    NonFinite,
    LineSearchFailed,
}

impl Termination {
    pub fn is_converged(self) -> bool {
        self == Termination::Converged
    }
}

/// Terminal state of a single-peak fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    ConvergedWithCov,
    ConvergedNoCov,
    NotConverged,
}

impl FitStatus {
    pub fn is_converged(self) -> bool {
        !matches!(self, FitStatus::NotConverged)
    }
}

/// Result of one peak fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakFit {
    pub shape: ShapeKind,
    /// Estimates for every parameter of `shape`; fixed ones carry `error: None`.
    pub params: BTreeMap<Param, Estimate>,
    /// Parameters held at a point mass during the fit.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub fixed: BTreeSet<Param>,
    pub covariance: Option<Covariance>,
    /// `None` when the half-maximum roots could not be found.
    pub fwhm: Option<Estimate>,
    /// Mode of the signal component.
    pub centroid: Option<f64>,
    pub gof: Option<GoodnessOfFit>,
    pub status: FitStatus,
    pub termination: Termination,
    pub iterations: usize,
    /// The covariance retry (tail disabled) was taken.
    pub retried: bool,
    /// The retry was taken and its covariance still needed SPD repair.
    pub retry_exhausted: bool,
    pub unit: EnergyUnit,
}

impl PeakFit {
    pub fn value(&self, p: Param) -> Option<f64> {
        self.params.get(&p).map(|e| e.value)
    }

    pub fn error(&self, p: Param) -> Option<f64> {
        self.params.get(&p).and_then(|e| e.error)
    }

    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }

    /// Best-fit point as a parameter vector in the shape's canonical order.
    pub fn param_vector(&self) -> ParameterVector {
        ParameterVector::from_map(&self.params.iter().map(|(k, e)| (*k, e.value)).collect())
    }
}

/// Simple histogram statistics used to seed a peak fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakStats {
    /// Estimated peak position.
    pub position: f64,
    pub fwhm: f64,
    pub sigma: f64,
    /// Net signal counts above background.
    pub counts: f64,
    /// Mean background level per unit energy.
    pub bkg: f64,
    /// Background step height per unit energy (low side minus high side).
    pub step: f64,
    /// Spread of the background estimate per unit energy.
    pub bkg_std: f64,
}

/// Fitted resolution curve `FWHM(E) = sqrt(Σ p_i E^i)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionCurve {
    /// `p_i` with standard errors; `p_i` has units of `unit^(2-i)`.
    pub coefficients: Vec<Estimate>,
    pub covariance: Vec<Vec<f64>>,
    pub energies: Vec<f64>,
    pub fwhms: Vec<Estimate>,
    pub unit: EnergyUnit,
    pub reference_energy: f64,
    pub fwhm_at_reference: Estimate,
    pub chi2: f64,
    pub dof: usize,
}

impl ResolutionCurve {
    pub fn order(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    /// Evaluate `FWHM(E)` with the `sqrt(max(0, ·))` guard.
    pub fn evaluate(&self, energy: f64) -> f64 {
        let poly: f64 = self
            .coefficients
            .iter()
            .enumerate()
            .map(|(i, c)| c.value * energy.powi(i as i32))
            .sum();
        poly.max(0.0).sqrt()
    }

    /// `FWHM(E)` with a first-order error from the coefficient covariance.
    ///
    /// The error is `None` where the curve is clamped to zero.
    pub fn evaluate_with_error(&self, energy: f64) -> Estimate {
        let value = self.evaluate(energy);
        if value <= 0.0 || self.covariance.len() != self.coefficients.len() {
            return Estimate::new(value, None);
        }
        let grad: Vec<f64> = (0..self.coefficients.len())
            .map(|i| energy.powi(i as i32) / (2.0 * value))
            .collect();
        let mut var = 0.0;
        for (i, gi) in grad.iter().enumerate() {
            for (j, gj) in grad.iter().enumerate() {
                var += gi * self.covariance[i][j] * gj;
            }
        }
        Estimate::new(value, Some(var.max(0.0).sqrt()))
    }

    /// Unit label of coefficient `i`, e.g. `keV^2`, `keV`, `keV^0`, `keV^-1`.
    pub fn coefficient_unit(&self, i: usize) -> String {
        match 2 - i as i64 {
            1 => self.unit.symbol().to_string(),
            k => format!("{}^{}", self.unit.symbol(), k),
        }
    }
}

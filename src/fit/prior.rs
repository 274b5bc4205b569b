//! Pseudo-priors: start values and bounds for each peak parameter.
//!
//! A prior here never enters the likelihood. It supplies:
//! - the optimizer's start point (`ParamPrior::start`)
//! - domain bounds, expressed as a bijection to an unconstrained coordinate
//! - which parameters are fixed (point masses) and therefore excluded from the
//!   optimizer, the Hessian and the goodness-of-fit degrees of freedom

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::{Param, ParameterVector, PeakStats, ShapeKind};
use crate::error::{FitError, Result};
use crate::math::Scalar;
use crate::models::DEFAULT_TAU;

/// Smallest tail decay length, in units of the estimated sigma.
pub const TAU_FLOOR_SIGMAS: f64 = 0.1;

/// Distribution for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "snake_case")]
pub enum ParamPrior {
    /// Point mass; the parameter is not fitted.
    Fixed { value: f64 },
    Uniform { lo: f64, hi: f64 },
    /// Normal, optionally truncated to `[lo, hi]`.
    Normal {
        mean: f64,
        sd: f64,
        #[serde(default)]
        lo: Option<f64>,
        #[serde(default)]
        hi: Option<f64>,
    },
}

/// Map between a bounded parameter and the real line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Identity,
    /// `x = lo + exp(z)`
    Lower(f64),
    /// `x = hi - exp(z)`
    Upper(f64),
    /// `x = lo + (hi - lo) · sigmoid(z)`
    Interval(f64, f64),
}

impl Transform {
    pub fn to_constrained<S: Scalar>(self, z: S) -> S {
        match self {
            Transform::Identity => z,
            Transform::Lower(lo) => z.exp() + lo,
            Transform::Upper(hi) => -z.exp() + hi,
            Transform::Interval(lo, hi) => {
                let s = ((-z).exp() + 1.0).powi(-1);
                s * (hi - lo) + lo
            }
        }
    }

    /// Inverse map. Points on or outside a bound are nudged just inside it.
    pub fn to_unconstrained(self, x: f64) -> f64 {
        match self {
            Transform::Identity => x,
            Transform::Lower(lo) => (x - lo).max(bound_gap(lo, x)).ln(),
            Transform::Upper(hi) => (hi - x).max(bound_gap(hi, x)).ln(),
            Transform::Interval(lo, hi) => {
                let w = hi - lo;
                let t = ((x - lo) / w).clamp(1e-9, 1.0 - 1e-9);
                (t / (1.0 - t)).ln()
            }
        }
    }
}

fn bound_gap(bound: f64, x: f64) -> f64 {
    1e-9 * bound.abs().max(x.abs()).max(1.0)
}

impl ParamPrior {
    pub fn fixed(value: f64) -> Self {
        ParamPrior::Fixed { value }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, ParamPrior::Fixed { .. })
    }

    /// Start value: the point mass, the interval midpoint, or the (clamped) mean.
    pub fn start(&self) -> f64 {
        match *self {
            ParamPrior::Fixed { value } => value,
            ParamPrior::Uniform { lo, hi } => 0.5 * (lo + hi),
            ParamPrior::Normal { mean, lo, hi, .. } => {
                let mut m = mean;
                if let Some(lo) = lo {
                    m = m.max(lo);
                }
                if let Some(hi) = hi {
                    m = m.min(hi);
                }
                m
            }
        }
    }

    pub fn bounds(&self) -> (Option<f64>, Option<f64>) {
        match *self {
            ParamPrior::Fixed { value } => (Some(value), Some(value)),
            ParamPrior::Uniform { lo, hi } => (Some(lo), Some(hi)),
            ParamPrior::Normal { lo, hi, .. } => (lo, hi),
        }
    }

    pub fn transform(&self) -> Transform {
        match self.bounds() {
            _ if self.is_fixed() => Transform::Identity,
            (Some(lo), Some(hi)) => Transform::Interval(lo, hi),
            (Some(lo), None) => Transform::Lower(lo),
            (None, Some(hi)) => Transform::Upper(hi),
            (None, None) => Transform::Identity,
        }
    }

    fn validate(&self, name: Param) -> Result<()> {
        let bad = |why: &str| Err(FitError::input(format!("prior for '{name}': {why}")));
        match *self {
            ParamPrior::Fixed { value } if !value.is_finite() => bad("fixed value must be finite"),
            ParamPrior::Uniform { lo, hi } if !(lo.is_finite() && hi.is_finite() && lo < hi) => {
                bad("uniform bounds must be finite with lo < hi")
            }
            ParamPrior::Normal { mean, sd, lo, hi } => {
                if !(mean.is_finite() && sd.is_finite() && sd > 0.0) {
                    return bad("normal needs a finite mean and sd > 0");
                }
                if let (Some(lo), Some(hi)) = (lo, hi) {
                    if !(lo < hi) {
                        return bad("normal truncation needs lo < hi");
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// One prior per parameter of a shape variant, in canonical order.
#[derive(Debug, Clone, PartialEq)]
pub struct Prior {
    names: Vec<Param>,
    priors: Vec<ParamPrior>,
}

impl Prior {
    pub fn new(names: Vec<Param>, priors: Vec<ParamPrior>) -> Result<Self> {
        if names.len() != priors.len() {
            return Err(FitError::input("prior names and distributions differ in length"));
        }
        if names.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FitError::input("prior parameters must be unique and in canonical order"));
        }
        for (n, p) in names.iter().zip(&priors) {
            p.validate(*n)?;
        }
        Ok(Self { names, priors })
    }

    pub fn names(&self) -> &[Param] {
        &self.names
    }

    pub fn get(&self, p: Param) -> Option<&ParamPrior> {
        self.names.iter().position(|&n| n == p).map(|i| &self.priors[i])
    }

    /// Replace the prior of `p`, which must already be present.
    pub fn set(&mut self, p: Param, prior: ParamPrior) -> Result<()> {
        prior.validate(p)?;
        let i = self
            .names
            .iter()
            .position(|&n| n == p)
            .ok_or_else(|| FitError::input(format!("parameter '{p}' is not part of this model")))?;
        self.priors[i] = prior;
        Ok(())
    }

    pub fn free_indices(&self) -> Vec<usize> {
        (0..self.priors.len()).filter(|&i| !self.priors[i].is_fixed()).collect()
    }

    pub fn free_names(&self) -> Vec<Param> {
        self.free_indices().into_iter().map(|i| self.names[i]).collect()
    }

    /// Parameters held at a point mass.
    pub fn fixed_names(&self) -> BTreeSet<Param> {
        self.names
            .iter()
            .zip(&self.priors)
            .filter(|(_, p)| p.is_fixed())
            .map(|(&n, _)| n)
            .collect()
    }

    pub fn n_free(&self) -> usize {
        self.priors.iter().filter(|p| !p.is_fixed()).count()
    }

    pub fn start(&self) -> ParameterVector {
        let map = self.names.iter().zip(&self.priors).map(|(&n, p)| (n, p.start())).collect();
        ParameterVector::from_map(&map)
    }

    /// Free coordinates of `point` in unconstrained space.
    pub fn to_unconstrained(&self, point: &[f64]) -> Vec<f64> {
        self.free_indices()
            .into_iter()
            .map(|i| self.priors[i].transform().to_unconstrained(point[i]))
            .collect()
    }

    /// Full constrained vector from unconstrained free coordinates `z`.
    ///
    /// Fixed parameters are filled from `base`.
    pub fn from_unconstrained<S: Scalar>(&self, z: &[S], base: &[f64]) -> Vec<S> {
        let mut out: Vec<S> = base.iter().map(|&v| S::from_f64(v)).collect();
        for (k, i) in self.free_indices().into_iter().enumerate() {
            out[i] = self.priors[i].transform().to_constrained(z[k]);
        }
        out
    }

    /// Full vector with free slots taken from `free` (already constrained).
    pub fn embed_free<S: Scalar>(&self, free: &[S], base: &[f64]) -> Vec<S> {
        let mut out: Vec<S> = base.iter().map(|&v| S::from_f64(v)).collect();
        for (k, i) in self.free_indices().into_iter().enumerate() {
            out[i] = free[k];
        }
        out
    }
}

/// User-supplied partial priors keyed by parameter name.
pub type PriorOverrides = BTreeMap<String, ParamPrior>;

/// Derives a weakly-informative [`Prior`] from [`PeakStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct PriorBuilder {
    pub shape: ShapeKind,
    pub low_e_tail: bool,
    pub fixed_position: bool,
    pub overrides: PriorOverrides,
}

impl PriorBuilder {
    pub fn new(shape: ShapeKind) -> Self {
        Self {
            shape,
            low_e_tail: shape.has_tail(),
            fixed_position: false,
            overrides: PriorOverrides::new(),
        }
    }

    pub fn build(&self, stats: &PeakStats) -> Result<Prior> {
        check_stats(stats)?;
        let tail = self.low_e_tail && self.shape.has_tail();
        if tail && stats.position <= 0.0 {
            return Err(FitError::input("the low-energy tail needs a positive peak position"));
        }

        let names = self.shape.param_names().to_vec();
        let priors = names
            .iter()
            .map(|&p| self.default_prior(p, stats, tail))
            .collect();
        let mut prior = Prior::new(names, priors)?;

        for (key, value) in &self.overrides {
            let param: Param = key.parse()?;
            if !self.shape.param_names().contains(&param) {
                return Err(FitError::input(format!(
                    "prior override '{key}' is not a parameter of {}",
                    self.shape
                )));
            }
            prior.set(param, *value)?;
        }
        Ok(prior)
    }

    fn default_prior(&self, p: Param, s: &PeakStats, tail: bool) -> ParamPrior {
        let fwhm = s.fwhm.max(s.sigma);
        match p {
            Param::NSig => ParamPrior::Normal {
                mean: s.counts.max(1.0),
                sd: s.counts.max(10.0),
                lo: Some(0.0),
                hi: None,
            },
            Param::Mu if self.fixed_position => ParamPrior::fixed(s.position),
            Param::Mu => ParamPrior::Normal {
                mean: s.position,
                sd: fwhm,
                lo: Some(s.position - 5.0 * fwhm),
                hi: Some(s.position + 5.0 * fwhm),
            },
            Param::Sigma => ParamPrior::Normal {
                mean: s.sigma,
                sd: s.sigma,
                lo: Some(0.0),
                hi: None,
            },
            Param::HTail if tail => ParamPrior::Normal {
                mean: 0.1,
                sd: 0.5,
                lo: Some(0.0),
                hi: Some(1.0),
            },
            Param::HTail => ParamPrior::fixed(0.0),
            Param::Tau if tail => {
                let start = (2.0 * s.sigma / s.position).max(DEFAULT_TAU);
                let hi = (50.0 * start).min(1.0);
                // A decay length far below sigma is indistinguishable from the Gaussian core.
                let lo = (TAU_FLOOR_SIGMAS * s.sigma / s.position).min(0.5 * hi);
                ParamPrior::Normal {
                    mean: start,
                    sd: 10.0 * start,
                    lo: Some(lo),
                    hi: Some(hi),
                }
            }
            Param::Tau => ParamPrior::fixed(DEFAULT_TAU),
            Param::Bkg => ParamPrior::Normal {
                mean: s.bkg.max(1e-3 * s.bkg_std.max(1.0)),
                sd: s.bkg_std.max(s.bkg.sqrt()).max(1.0),
                lo: Some(0.0),
                hi: None,
            },
            Param::HStep => ParamPrior::Normal {
                mean: s.step,
                sd: s.step.abs().max(s.bkg_std).max(1.0),
                lo: None,
                hi: None,
            },
            // survival fractions belong to the two-histogram fit
            Param::Sf | Param::Bsf | Param::Sasf => ParamPrior::Uniform { lo: 0.0, hi: 1.0 },
        }
    }
}

fn check_stats(s: &PeakStats) -> Result<()> {
    let finite = [s.position, s.fwhm, s.sigma, s.counts, s.bkg, s.step, s.bkg_std]
        .iter()
        .all(|v| v.is_finite());
    if !finite {
        return Err(FitError::input("peak statistics must be finite"));
    }
    if s.sigma <= 0.0 {
        return Err(FitError::input("peak statistics need sigma > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Dual;

    fn stats() -> PeakStats {
        PeakStats {
            position: 50.0,
            fwhm: 4.7,
            sigma: 2.0,
            counts: 10_000.0,
            bkg: 5.0,
            step: 0.0,
            bkg_std: 2.0,
        }
    }

    #[test]
    fn tail_off_collapses_to_point_masses() {
        let mut b = PriorBuilder::new(ShapeKind::HpgePeak);
        b.low_e_tail = false;
        let prior = b.build(&stats()).unwrap();
        assert_eq!(prior.get(Param::HTail), Some(&ParamPrior::fixed(0.0)));
        assert!(prior.get(Param::Tau).unwrap().is_fixed());
        assert_eq!(prior.n_free(), 5);
    }

    #[test]
    fn tail_length_stays_off_zero() {
        let s = stats();
        let prior = PriorBuilder::new(ShapeKind::HpgePeak).build(&s).unwrap();
        let (lo, hi) = prior.get(Param::Tau).unwrap().bounds();
        let lo = lo.unwrap();
        assert!(lo > 0.0);
        assert!((lo * s.position - TAU_FLOOR_SIGMAS * s.sigma).abs() < 1e-12);
        assert!(lo < hi.unwrap());
        assert!(prior.fixed_names().is_empty());
    }

    #[test]
    fn fixed_position_pins_mu() {
        let mut b = PriorBuilder::new(ShapeKind::GaussOnStep);
        b.fixed_position = true;
        let prior = b.build(&stats()).unwrap();
        assert_eq!(prior.get(Param::Mu), Some(&ParamPrior::fixed(50.0)));
        assert!(!prior.free_names().contains(&Param::Mu));
        assert!(prior.fixed_names().contains(&Param::Mu));
    }

    #[test]
    fn overrides_replace_only_named_fields() {
        let mut b = PriorBuilder::new(ShapeKind::GaussOnStep);
        b.overrides.insert("sigma".into(), ParamPrior::Uniform { lo: 1.0, hi: 3.0 });
        let prior = b.build(&stats()).unwrap();
        let default = PriorBuilder::new(ShapeKind::GaussOnStep).build(&stats()).unwrap();
        assert_eq!(prior.get(Param::Sigma), Some(&ParamPrior::Uniform { lo: 1.0, hi: 3.0 }));
        assert_eq!(prior.get(Param::Mu), default.get(Param::Mu));
        assert_eq!(prior.get(Param::NSig), default.get(Param::NSig));
    }

    #[test]
    fn unknown_override_is_an_input_error() {
        let mut b = PriorBuilder::new(ShapeKind::GaussOnStep);
        b.overrides.insert("htail".into(), ParamPrior::fixed(0.2));
        assert_eq!(b.build(&stats()).unwrap_err().exit_code(), 2);

        let mut b = PriorBuilder::new(ShapeKind::HpgePeak);
        b.overrides.insert("skew".into(), ParamPrior::fixed(0.2));
        assert!(b.build(&stats()).is_err());
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut b = PriorBuilder::new(ShapeKind::GaussOnStep);
        b.overrides.insert("sigma".into(), ParamPrior::Uniform { lo: 3.0, hi: 1.0 });
        assert!(b.build(&stats()).is_err());
    }

    #[test]
    fn transforms_round_trip_and_respect_bounds() {
        let cases = [
            (Transform::Identity, 3.5),
            (Transform::Lower(0.0), 2.0),
            (Transform::Upper(1.0), -4.0),
            (Transform::Interval(0.0, 1.0), 0.25),
        ];
        for (t, x) in cases {
            let z = t.to_unconstrained(x);
            assert!((t.to_constrained(z) - x).abs() < 1e-12, "{t:?}");
        }
        let t = Transform::Interval(-1.0, 2.0);
        for z in [-50.0, -1.0, 0.0, 1.0, 50.0] {
            let x: f64 = t.to_constrained(z);
            assert!((-1.0..=2.0).contains(&x));
        }
        // derivative of sigmoid at 0 is 1/4 of the width
        let d = t.to_constrained(Dual::var(0.0));
        assert!((d.dot - 0.75).abs() < 1e-12);
    }

    #[test]
    fn start_lies_inside_bounds() {
        let prior = PriorBuilder::new(ShapeKind::HpgePeak).build(&stats()).unwrap();
        let start = prior.start();
        for (p, x) in start.iter() {
            let (lo, hi) = prior.get(p).unwrap().bounds();
            assert!(lo.is_none_or(|lo| x >= lo) && hi.is_none_or(|hi| x <= hi), "{p}");
        }
        let z = prior.to_unconstrained(start.values());
        let back: Vec<f64> = prior.from_unconstrained(&z, start.values());
        for (a, b) in back.iter().zip(start.values()) {
            assert!((a - b).abs() < 1e-9 * b.abs().max(1.0));
        }
    }
}

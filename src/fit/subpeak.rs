//! Simultaneous fit of the two halves of a peak split by a data-quality cut.
//!
//! The survived (`pass`) and rejected (`cut`) histograms share one peak
//! shape. Signal counts, background level and step height are split between
//! them by survival fractions:
//!
//! ```text
//! pass: n_sig·sf,       bkg·bsf,       hstep·sasf
//! cut:  n_sig·(1 − sf), bkg·(1 − bsf), hstep·(1 − sasf)
//! ```
//!
//! The joint NLL is the sum of the two Poisson NLLs. Shape and total
//! parameters start from the combined-peak fit and can be pinned to it.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::domain::{
    Covariance, Estimate, EnergyUnit, FitStatus, GoodnessOfFit, Histogram, Param, PeakFit, ShapeKind, Termination,
};
use crate::error::{FitError, Result};
use crate::fit::budget::{ResourceBudget, default_budget};
use crate::fit::gof::goodness_of_fit;
use crate::fit::likelihood::{LikelihoodEngine, NegLogLikelihood};
use crate::fit::optimizer::OptimizerConfig;
use crate::fit::peak::{estimates, free_covariance, search};
use crate::fit::prior::{ParamPrior, Prior};
use crate::math::Scalar;
use crate::models::density;

const FRACTIONS: [Param; 3] = [Param::Sf, Param::Bsf, Param::Sasf];

/// Policy flags for the two-histogram fit.
#[derive(Debug, Clone, PartialEq)]
pub struct SubpeakOptions {
    /// Pin `mu`, `sigma`, `htail`, `tau` to the combined fit.
    pub fix_shape: bool,
    /// Pin `n_sig`, `bkg`, `hstep` (the pass + cut totals) to the combined fit.
    pub fix_totals: bool,
    pub uncertainty: bool,
    pub optimizer: OptimizerConfig,
    pub budget: Option<ResourceBudget>,
    pub memory_start: Option<u64>,
}

impl Default for SubpeakOptions {
    fn default() -> Self {
        Self {
            fix_shape: true,
            fix_totals: true,
            uncertainty: true,
            optimizer: OptimizerConfig::default(),
            budget: None,
            memory_start: None,
        }
    }
}

/// Joint result. `params` holds the shape parameters (totals) and the three
/// survival fractions.
#[derive(Debug, Clone)]
pub struct SubpeakFit {
    pub shape: ShapeKind,
    pub params: BTreeMap<Param, Estimate>,
    pub covariance: Option<Covariance>,
    pub gof_pass: Option<GoodnessOfFit>,
    pub gof_cut: Option<GoodnessOfFit>,
    pub status: FitStatus,
    pub termination: Termination,
    pub iterations: usize,
    pub unit: EnergyUnit,
}

impl SubpeakFit {
    pub fn value(&self, p: Param) -> Option<f64> {
        self.params.get(&p).map(|e| e.value)
    }

    /// Signal survival fraction.
    pub fn survival_fraction(&self) -> Option<Estimate> {
        self.params.get(&Param::Sf).copied()
    }

    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }
}

/// Fitted functions and residuals for both histograms.
#[derive(Debug, Clone)]
pub struct SubpeakReport {
    shape: ShapeKind,
    pass_params: Vec<f64>,
    cut_params: Vec<f64>,
    pass_residuals: Vec<f64>,
    cut_residuals: Vec<f64>,
}

impl SubpeakReport {
    pub fn evaluate_pass(&self, x: f64) -> f64 {
        density(self.shape, x, &self.pass_params)
    }

    pub fn evaluate_cut(&self, x: f64) -> f64 {
        density(self.shape, x, &self.cut_params)
    }

    pub fn pass_params(&self) -> &[f64] {
        &self.pass_params
    }

    pub fn cut_params(&self) -> &[f64] {
        &self.cut_params
    }

    pub fn pass_residuals(&self) -> &[f64] {
        &self.pass_residuals
    }

    pub fn cut_residuals(&self) -> &[f64] {
        &self.cut_residuals
    }
}

/// Sum of the pass and cut likelihoods over the joint parameter vector.
struct JointLikelihood<'h> {
    shape: ShapeKind,
    pass: LikelihoodEngine<'h>,
    cut: LikelihoodEngine<'h>,
}

impl JointLikelihood<'_> {
    /// Split the joint vector into pass and cut shape vectors.
    fn split<S: Scalar>(&self, p: &[S]) -> (Vec<S>, Vec<S>) {
        let names = self.shape.param_names();
        let m = names.len();
        let (sf, bsf, sasf) = (p[m], p[m + 1], p[m + 2]);
        let mut pass = p[..m].to_vec();
        let mut cut = p[..m].to_vec();
        for (i, name) in names.iter().enumerate() {
            let frac = match name {
                Param::NSig => sf,
                Param::Bkg => bsf,
                Param::HStep => sasf,
                _ => continue,
            };
            pass[i] = p[i] * frac;
            cut[i] = p[i] * (-frac + 1.0);
        }
        (pass, cut)
    }
}

impl NegLogLikelihood for JointLikelihood<'_> {
    fn nll<S: Scalar>(&self, p: &[S]) -> S {
        let (pass, cut) = self.split(p);
        self.pass.nll_flat(&pass) + self.cut.nll_flat(&cut)
    }
}

fn joint_prior(combined: &PeakFit, pass: &Histogram, cut: &Histogram, options: &SubpeakOptions) -> Result<Prior> {
    let mut names = Vec::new();
    let mut priors = Vec::new();
    for &name in combined.shape.param_names() {
        let est = combined
            .params
            .get(&name)
            .ok_or_else(|| FitError::input(format!("combined fit has no value for '{name}'")))?;
        let pinned = combined.fixed.contains(&name)
            || match name {
                Param::NSig | Param::Bkg | Param::HStep => options.fix_totals,
                _ => options.fix_shape,
            };
        let prior = if pinned {
            ParamPrior::fixed(est.value)
        } else {
            // Only the start and the bounds matter; the width never enters the likelihood.
            let sd = est.error.filter(|e| *e > 0.0).unwrap_or(est.value.abs().max(1.0));
            let (lo, hi) = domain_bounds(name, est.value);
            ParamPrior::Normal { mean: est.value, sd, lo, hi }
        };
        names.push(name);
        priors.push(prior);
    }

    // All fractions start at the pass share of the total counts.
    let ratio = (pass.total() / (pass.total() + cut.total())).clamp(0.01, 0.99);
    for name in FRACTIONS {
        names.push(name);
        priors.push(ParamPrior::Normal {
            mean: ratio,
            sd: 1.0,
            lo: Some(0.0),
            hi: Some(1.0),
        });
    }
    Prior::new(names, priors)
}

fn domain_bounds(name: Param, value: f64) -> (Option<f64>, Option<f64>) {
    match name {
        Param::NSig | Param::Sigma | Param::Bkg => (Some(0.0), None),
        Param::HTail => (Some(0.0), Some(1.0)),
        // same collapse guard as the single-peak prior
        Param::Tau => (Some(0.1 * value), Some(1.0_f64.max(2.0 * value))),
        _ => (None, None),
    }
}

/// Fit survival fractions from the `pass` / `cut` split of a peak already fit as `combined`.
pub fn fit_subpeaks(
    pass: &Histogram,
    cut: &Histogram,
    combined: &PeakFit,
    options: &SubpeakOptions,
) -> Result<(SubpeakFit, SubpeakReport)> {
    if pass.edges() != cut.edges() {
        return Err(FitError::input("pass and cut histograms must share bin edges"));
    }
    if pass.unit() != cut.unit() || pass.unit() != combined.unit {
        return Err(FitError::input(format!(
            "unit mismatch: pass {}, cut {}, combined fit {}",
            pass.unit(),
            cut.unit(),
            combined.unit
        )));
    }
    if !combined.converged() {
        warn!("combined peak fit did not converge; subpeak fit starts from its best-effort values");
    }

    let shape = combined.shape;
    let budget = options.budget.unwrap_or_else(default_budget);
    let joint = JointLikelihood {
        shape,
        pass: LikelihoodEngine::new(shape, pass),
        cut: LikelihoodEngine::new(shape, cut),
    };
    let prior = joint_prior(combined, pass, cut, options)?;
    let minimum = search(&joint, &prior, &options.optimizer, budget, options.memory_start);
    debug!(termination = ?minimum.termination, iterations = minimum.iterations, "subpeak fit finished");

    let (pass_params, cut_params) = joint.split(&minimum.point);
    let pass_expected = joint.pass.expected(&pass_params);
    let cut_expected = joint.cut.expected(&cut_params);
    let n_free = prior.n_free();

    let (status, covariance, gofs) = if !minimum.converged() {
        (FitStatus::NotConverged, None, None)
    } else if !options.uncertainty {
        (FitStatus::ConvergedNoCov, None, None)
    } else {
        match free_covariance(&joint, &prior, &minimum.point) {
            Ok(cov) => {
                let gofs = (
                    goodness_of_fit(pass.counts(), &pass_expected, n_free, true),
                    goodness_of_fit(cut.counts(), &cut_expected, n_free, true),
                );
                (FitStatus::ConvergedWithCov, Some(cov.to_covariance()), Some(gofs))
            }
            Err(FitError::SingularHessian | FitError::Numeric(_)) => {
                warn!("subpeak Hessian could not be inverted; covariance unavailable");
                (FitStatus::ConvergedNoCov, None, None)
            }
            Err(e) => return Err(e),
        }
    };

    let residual = |h: &Histogram, lam: &[f64]| -> Vec<f64> { h.counts().iter().zip(lam).map(|(k, l)| k - l).collect() };
    let report = SubpeakReport {
        shape,
        pass_residuals: residual(pass, &pass_expected),
        cut_residuals: residual(cut, &cut_expected),
        pass_params,
        cut_params,
    };
    let (gof_pass, gof_cut) = gofs.unzip();
    let fit = SubpeakFit {
        shape,
        params: estimates(&prior, &minimum.point, covariance.as_ref()),
        covariance,
        gof_pass,
        gof_cut,
        status,
        termination: minimum.termination,
        iterations: minimum.iterations,
        unit: pass.unit(),
    };
    Ok((fit, report))
}

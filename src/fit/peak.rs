//! Single-peak maximum-likelihood fit.
//!
//! Pipeline: summary stats → prior → L-BFGS on the Poisson NLL → (optionally)
//! covariance, goodness of fit and FWHM uncertainty.
//!
//! The fit runs as an explicit state machine:
//!
//! ```text
//! PriorBuilt → FitAttempted → { ConvergedWithCov | ConvergedNoCov | NotConverged }
//!                  │
//!                  └─ ill-conditioned covariance, refinement on, tail on:
//!                     back to PriorBuilt with the tail disabled (once)
//! ```
//!
//! Swapping to the tail-less model on retry is a modelling policy, not a
//! numerical necessity: the retried result describes a different shape. It is
//! therefore opt-in (`iterative_refinement`) and recorded in `PeakFit::retried`.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use tracing::{debug, warn};

use crate::domain::{
    Covariance, Estimate, FitStatus, GoodnessOfFit, Histogram, Param, PeakFit, PeakStats, ShapeKind, Termination,
};
use crate::error::{FitError, Result};
use crate::fit::budget::{BudgetGuard, ResourceBudget, default_budget};
use crate::fit::covariance::{CovarianceEstimate, estimate_covariance};
use crate::fit::fwhm::{McConfig, SignalWidth, Spread, fwhm_uncertainty, signal_width};
use crate::fit::gof::goodness_of_fit;
use crate::fit::likelihood::{InUnconstrained, LikelihoodEngine, NegLogLikelihood, OnFreeParams};
use crate::fit::optimizer::{OptimizerConfig, minimize};
use crate::fit::prior::{Prior, PriorBuilder, PriorOverrides};
use crate::models::{density, signal_density};

/// Retries allowed per peak.
const MAX_RETRIES: usize = 1;

/// Knobs for one peak fit.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakFitOptions {
    pub shape: ShapeKind,
    /// Fit the low-energy tail (ignored for shapes without one).
    pub low_e_tail: bool,
    /// Pin `mu` to the estimated position.
    pub fixed_position: bool,
    pub overrides: PriorOverrides,
    /// Compute covariance, goodness of fit and the FWHM uncertainty.
    pub uncertainty: bool,
    /// Allow one refit without the tail when the covariance is ill-conditioned.
    pub iterative_refinement: bool,
    pub optimizer: OptimizerConfig,
    /// `None` reads the process default at fit start.
    pub budget: Option<ResourceBudget>,
    /// Baseline for the memory budget; `None` samples at optimizer start.
    pub memory_start: Option<u64>,
    pub mc: McConfig,
}

impl Default for PeakFitOptions {
    fn default() -> Self {
        Self {
            shape: ShapeKind::HpgePeak,
            low_e_tail: true,
            fixed_position: false,
            overrides: PriorOverrides::new(),
            uncertainty: true,
            iterative_refinement: true,
            optimizer: OptimizerConfig::default(),
            budget: None,
            memory_start: None,
            mc: McConfig::default(),
        }
    }
}

impl PeakFitOptions {
    pub fn prior_builder(&self) -> PriorBuilder {
        PriorBuilder {
            shape: self.shape,
            low_e_tail: self.low_e_tail && self.shape.has_tail(),
            fixed_position: self.fixed_position,
            overrides: self.overrides.clone(),
        }
    }
}

/// Read-only view of a fitted peak for plotting and residual inspection.
#[derive(Debug, Clone)]
pub struct PeakReport {
    shape: ShapeKind,
    params: Vec<f64>,
    edges: Vec<f64>,
    expected: Vec<f64>,
    residuals: Vec<f64>,
    normalized_residuals: Vec<f64>,
    /// p-value of the first attempt when the retry was taken.
    pub p_value_before_retry: Option<f64>,
}

impl PeakReport {
    fn new(hist: &Histogram, shape: ShapeKind, params: &[f64], gof: &GoodnessOfFit) -> Self {
        Self {
            shape,
            params: params.to_vec(),
            edges: hist.edges().to_vec(),
            expected: gof_expected(hist, &gof.residuals),
            residuals: gof.residuals.clone(),
            normalized_residuals: gof.normalized_residuals.clone(),
            p_value_before_retry: None,
        }
    }

    /// Fitted density (signal + background) at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        density(self.shape, x, &self.params)
    }

    /// Signal component alone at `x`.
    pub fn evaluate_signal(&self, x: f64) -> f64 {
        signal_density(self.shape, x, &self.params)
    }

    pub fn shape(&self) -> ShapeKind {
        self.shape
    }

    /// Best-fit parameters in canonical order.
    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Expected counts per bin at the best fit.
    pub fn expected(&self) -> &[f64] {
        &self.expected
    }

    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    pub fn normalized_residuals(&self) -> &[f64] {
        &self.normalized_residuals
    }
}

fn gof_expected(hist: &Histogram, residuals: &[f64]) -> Vec<f64> {
    hist.counts().iter().zip(residuals).map(|(k, r)| k - r).collect()
}

/// Outcome of one optimizer run, mapped back to constrained space.
#[derive(Debug, Clone)]
pub(crate) struct Minimum {
    /// Full constrained parameter vector.
    pub point: Vec<f64>,
    pub nll: f64,
    pub iterations: usize,
    pub termination: Termination,
}

impl Minimum {
    pub fn converged(&self) -> bool {
        self.termination.is_converged()
    }
}

/// Minimize `nll` from the prior's start point under `budget`.
pub(crate) fn search<L: NegLogLikelihood>(
    nll: &L,
    prior: &Prior,
    config: &OptimizerConfig,
    budget: ResourceBudget,
    memory_start: Option<u64>,
) -> Minimum {
    let base = prior.start().to_flat();
    let z0 = prior.to_unconstrained(&base);
    let objective = InUnconstrained { nll, prior, base: &base };
    let mut guard = BudgetGuard::start(budget, memory_start);
    let result = minimize(&objective, &z0, config, |_| match guard.check() {
        Some(reason) => ControlFlow::Break(reason),
        None => ControlFlow::Continue(()),
    });
    Minimum {
        point: prior.from_unconstrained(&result.x, &base),
        nll: result.f,
        iterations: result.iterations,
        termination: result.termination,
    }
}

/// Covariance over the prior's free parameters at `point`.
pub(crate) fn free_covariance<L: NegLogLikelihood>(
    nll: &L,
    prior: &Prior,
    point: &[f64],
) -> Result<CovarianceEstimate> {
    let free: Vec<f64> = prior.free_indices().into_iter().map(|i| point[i]).collect();
    let objective = OnFreeParams { nll, prior, base: point };
    estimate_covariance(&objective, &free, &prior.free_names())
}

/// Monte Carlo FWHM error, falling back to independent errors when the
/// covariance cannot be factorized.
pub(crate) fn fwhm_error(
    shape: ShapeKind,
    point: &[f64],
    prior: &Prior,
    cov: &CovarianceEstimate,
    mc: &McConfig,
) -> Option<f64> {
    let free = prior.free_indices();
    fwhm_uncertainty(shape, point, &free, Spread::Covariance(&cov.matrix), mc)
        .or_else(|| fwhm_uncertainty(shape, point, &free, Spread::StdErrors(&cov.std_errors()), mc))
}

/// Per-parameter estimates; errors only for free parameters with a covariance.
pub(crate) fn estimates(
    prior: &Prior,
    point: &[f64],
    cov: Option<&Covariance>,
) -> BTreeMap<Param, Estimate> {
    prior
        .names()
        .iter()
        .zip(point)
        .map(|(&name, &value)| {
            let error = cov.and_then(|c| c.std_error(name));
            (name, Estimate::new(value, error))
        })
        .collect()
}

enum FitState {
    PriorBuilt { prior: Prior, attempt: usize },
    FitAttempted { prior: Prior, minimum: Minimum, attempt: usize },
}

/// Uncertainty-path result of a converged attempt.
struct Analysis {
    covariance: Option<CovarianceEstimate>,
    gof: GoodnessOfFit,
}

impl Analysis {
    fn ill_conditioned(&self) -> bool {
        self.covariance.as_ref().is_none_or(|c| !c.raw_positive_definite)
    }
}

/// Fit one peak.
///
/// Only invalid input is an error. Non-convergence, exhausted budgets and
/// covariance trouble come back as a [`PeakFit`] with the matching
/// [`FitStatus`] and undefined (`None`) uncertainties.
pub fn fit_single_peak(hist: &Histogram, stats: &PeakStats, options: &PeakFitOptions) -> Result<(PeakFit, PeakReport)> {
    let budget = options.budget.unwrap_or_else(default_budget);
    let engine = LikelihoodEngine::new(options.shape, hist);
    let mut builder = options.prior_builder();
    let mut p_value_before_retry = None;

    let mut state = FitState::PriorBuilt {
        prior: builder.build(stats)?,
        attempt: 0,
    };
    let (fit, mut report) = loop {
        state = match state {
            FitState::PriorBuilt { prior, attempt } => {
                let minimum = search(&engine, &prior, &options.optimizer, budget, options.memory_start);
                debug!(
                    shape = %options.shape,
                    attempt,
                    termination = ?minimum.termination,
                    iterations = minimum.iterations,
                    nll = minimum.nll,
                    "peak fit attempt finished"
                );
                FitState::FitAttempted { prior, minimum, attempt }
            }
            FitState::FitAttempted { prior, minimum, attempt } => {
                if !minimum.converged() || !options.uncertainty {
                    break assemble(hist, &engine, &prior, &minimum, None, attempt, options);
                }
                let analysis = analyse(&engine, &prior, &minimum)?;
                let may_retry = options.iterative_refinement && attempt < MAX_RETRIES && builder.low_e_tail;
                if analysis.ill_conditioned() && may_retry {
                    warn!(
                        p_value = analysis.gof.p_value,
                        "ill-conditioned covariance; refitting without the low-energy tail"
                    );
                    p_value_before_retry = Some(analysis.gof.p_value);
                    builder.low_e_tail = false;
                    FitState::PriorBuilt {
                        prior: builder.build(stats)?,
                        attempt: attempt + 1,
                    }
                } else {
                    if let Some(before) = p_value_before_retry {
                        warn!(p_before = before, p_after = analysis.gof.p_value, "retry without tail finished");
                    }
                    break assemble(hist, &engine, &prior, &minimum, Some(analysis), attempt, options);
                }
            }
        };
    };

    report.p_value_before_retry = p_value_before_retry;
    Ok((fit, report))
}

fn analyse(engine: &LikelihoodEngine<'_>, prior: &Prior, minimum: &Minimum) -> Result<Analysis> {
    let covariance = match free_covariance(engine, prior, &minimum.point) {
        Ok(c) => Some(c),
        Err(FitError::SingularHessian | FitError::Numeric(_)) => {
            warn!("Hessian could not be inverted; covariance unavailable");
            None
        }
        Err(e) => return Err(e),
    };
    let expected = engine.expected(&minimum.point);
    let gof = goodness_of_fit(engine.histogram().counts(), &expected, prior.n_free(), true);
    Ok(Analysis { covariance, gof })
}

fn assemble(
    hist: &Histogram,
    engine: &LikelihoodEngine<'_>,
    prior: &Prior,
    minimum: &Minimum,
    analysis: Option<Analysis>,
    attempt: usize,
    options: &PeakFitOptions,
) -> (PeakFit, PeakReport) {
    let shape = options.shape;
    let width: Option<SignalWidth> = signal_width(shape, &minimum.point);
    let retried = attempt > 0;

    let (status, covariance, gof, fwhm_err, retry_exhausted) = match analysis {
        None => {
            let status = if minimum.converged() { FitStatus::ConvergedNoCov } else { FitStatus::NotConverged };
            (status, None, None, None, false)
        }
        // No covariance at all: point estimates only.
        Some(Analysis { covariance: None, .. }) => (FitStatus::ConvergedNoCov, None, None, None, retried),
        Some(Analysis { covariance: Some(cov), gof }) => {
            let err = width.and_then(|_| fwhm_error(shape, &minimum.point, prior, &cov, &options.mc));
            let exhausted = retried && !cov.raw_positive_definite;
            (FitStatus::ConvergedWithCov, Some(cov.to_covariance()), Some(gof), err, exhausted)
        }
    };
    if retry_exhausted {
        warn!("covariance still ill-conditioned after retry; reporting nearest SPD projection");
    }
    let report_gof = match &gof {
        Some(g) => g.clone(),
        None => goodness_of_fit(
            hist.counts(),
            &engine.expected(&minimum.point),
            prior.n_free(),
            minimum.converged(),
        ),
    };
    let report = PeakReport::new(hist, shape, &minimum.point, &report_gof);

    let fit = PeakFit {
        shape,
        params: estimates(prior, &minimum.point, covariance.as_ref()),
        fixed: prior.fixed_names(),
        covariance,
        fwhm: width.map(|w| Estimate::new(w.fwhm, fwhm_err)),
        centroid: width.map(|w| w.centroid),
        gof,
        status,
        termination: minimum.termination,
        iterations: minimum.iterations,
        retried,
        retry_exhausted,
        unit: hist.unit(),
    };
    (fit, report)
}

//! Peak fitting and uncertainty propagation.
//!
//! Responsibilities:
//!
//! - derive start values and bounds from histogram statistics (`prior`)
//! - binned Poisson likelihood and its L-BFGS minimization under a time and
//!   memory budget (`likelihood`, `optimizer`, `budget`)
//! - covariance, goodness of fit and FWHM with Monte Carlo errors
//!   (`covariance`, `gof`, `fwhm`)
//! - single-peak, two-histogram and multi-line orchestration
//!   (`peak`, `subpeak`, `driver`)
//! - the resolution curve across lines (`resolution`)

pub mod budget;
pub mod covariance;
pub mod driver;
pub mod fwhm;
pub mod gof;
pub mod likelihood;
pub mod optimizer;
pub mod peak;
pub mod prior;
pub mod resolution;
pub mod subpeak;

pub use budget::{ResourceBudget, default_budget, set_default_budget};
pub use driver::{DriverOptions, PeakInput, fit_peaks};
pub use fwhm::McConfig;
pub use likelihood::LikelihoodEngine;
pub use optimizer::OptimizerConfig;
pub use peak::{PeakFitOptions, PeakReport, fit_single_peak};
pub use prior::{ParamPrior, Prior, PriorBuilder, PriorOverrides};
pub use resolution::{CurveOptions, CurveReport, REFERENCE_ENERGY_KEV, fit_resolution_curve};
pub use subpeak::{SubpeakFit, SubpeakOptions, SubpeakReport, fit_subpeaks};

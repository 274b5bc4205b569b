//! Command-line parsing for the HPGe calibration fitter.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the fitting code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::{EnergyUnit, ShapeKind};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "ecal", version, about = "HPGe gamma-peak fitting and energy-resolution curve")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit every line of a JSON run file, then the resolution curve.
    Fit(FitArgs),
    /// Fit a synthetic ²²⁸Th-like spectrum (no input file needed).
    Demo(DemoArgs),
    /// Evaluate a previously exported curve JSON at given energies.
    Eval(EvalArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// Run file listing the lines and their histograms.
    #[arg(value_name = "JSON")]
    pub input: PathBuf,

    #[command(flatten)]
    pub options: FitOptionArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct DemoArgs {
    /// Seed for the synthetic histograms.
    #[arg(long, default_value_t = 42)]
    pub sample_seed: u64,

    #[command(flatten)]
    pub options: FitOptionArgs,
}

/// Options shared by `fit` and `demo`.
#[derive(Debug, Args, Clone)]
pub struct FitOptionArgs {
    /// Peak shape (`hpge_peak` / `with-tail` or `gauss_on_step` / `without-tail`).
    #[arg(long, default_value = "hpge_peak")]
    pub shape: ShapeKind,

    /// Fit without the low-energy tail.
    #[arg(long)]
    pub no_tail: bool,

    /// Pin every peak position to its estimate.
    #[arg(long)]
    pub fixed_position: bool,

    /// Skip covariance, goodness of fit and FWHM errors (and so the curve).
    #[arg(long)]
    pub no_uncertainty: bool,

    /// Never refit without the tail when the covariance is ill-conditioned.
    #[arg(long)]
    pub no_refinement: bool,

    /// Unit of the calibrated results (`fit` takes it from the run file).
    #[arg(long, default_value = "keV")]
    pub unit: EnergyUnit,

    /// Highest power of E under the square root of the resolution curve.
    #[arg(long, default_value_t = 1)]
    pub pol_order: usize,

    /// Standard deviation of the zero-centred pull on curve coefficients p_i, i >= 2.
    #[arg(long)]
    pub pull_sd: Option<f64>,

    /// Wall-clock limit per optimizer run, in seconds.
    #[arg(long)]
    pub max_time_secs: Option<f64>,

    /// Allowed resident-memory growth during a run, in MiB.
    #[arg(long)]
    pub max_memory_mb: Option<u64>,

    /// Monte Carlo draws for the FWHM uncertainty.
    #[arg(long, default_value_t = 10_000)]
    pub mc_samples: usize,

    /// Seed for the FWHM Monte Carlo.
    #[arg(long, default_value_t = 0x00EC_A1F1)]
    pub seed: u64,

    /// Show the N worst-fitting lines.
    #[arg(long, default_value_t = 5)]
    pub top: usize,

    /// Export per-line results to JSON.
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Export the resolution curve (coefficients + evaluated grid) to JSON.
    #[arg(long = "export-curve")]
    pub export_curve: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct EvalArgs {
    /// Curve JSON file produced by `ecal fit --export-curve`.
    #[arg(long, value_name = "JSON")]
    pub curve: PathBuf,

    /// Energies to evaluate, in the curve's unit.
    #[arg(required = true, num_args = 1..)]
    pub energies: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_defaults() {
        let cli = Cli::try_parse_from(["ecal", "fit", "run.json"]).unwrap();
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.input, PathBuf::from("run.json"));
        assert_eq!(args.options.shape, ShapeKind::HpgePeak);
        assert_eq!(args.options.unit, EnergyUnit::KeV);
        assert_eq!(args.options.pol_order, 1);
        assert!(args.options.pull_sd.is_none());
    }

    #[test]
    fn demo_accepts_shape_aliases() {
        let cli = Cli::try_parse_from(["ecal", "demo", "--shape", "without-tail", "--pol-order", "2", "--pull-sd", "1e-6"])
            .unwrap();
        let Command::Demo(args) = cli.command else {
            panic!("expected demo");
        };
        assert_eq!(args.options.shape, ShapeKind::GaussOnStep);
        assert_eq!(args.options.pol_order, 2);
        assert_eq!(args.options.pull_sd, Some(1e-6));
        assert!(Cli::try_parse_from(["ecal", "demo", "--shape", "lorentz"]).is_err());
    }

    #[test]
    fn eval_needs_energies() {
        assert!(Cli::try_parse_from(["ecal", "eval", "--curve", "c.json"]).is_err());
        let cli = Cli::try_parse_from(["ecal", "eval", "--curve", "c.json", "583.2", "2614.5"]).unwrap();
        let Command::Eval(args) = cli.command else {
            panic!("expected eval");
        };
        assert_eq!(args.energies, vec![583.2, 2614.5]);
    }
}

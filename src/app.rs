//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and installs the log subscriber
//! - loads a run file (or synthesizes the demo spectrum)
//! - runs the per-line fits and the resolution curve
//! - prints reports and writes optional exports

use std::time::Duration;

use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::cli::{Command, DemoArgs, EvalArgs, FitArgs, FitOptionArgs};
use crate::error::{FitError, Result};
use crate::fit::{CurveOptions, DriverOptions, McConfig, PeakFitOptions, ResourceBudget, set_default_budget};

pub mod pipeline;

use pipeline::{FitConfig, RunOutput};

/// Entry point for the `ecal` binary.
pub fn run() -> Result<()> {
    let cli = crate::cli::Cli::parse();
    init_logging();

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Demo(args) => handle_demo(args),
        Command::Eval(args) => handle_eval(args),
    }
}

/// Log to stderr; `RUST_LOG` overrides the `info` default.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_fit(args: FitArgs) -> Result<()> {
    let config = fit_config_from_args(&args.options)?;
    let ingest = crate::io::load_run_file(&args.input)?;
    for e in &ingest.line_errors {
        warn!(index = e.index, line = %e.line, "skipping line: {}", e.message);
    }
    let run = pipeline::run_ingested(&config, ingest)?;
    print_run(&run, args.options.top);
    Ok(())
}

fn handle_demo(args: DemoArgs) -> Result<()> {
    let config = fit_config_from_args(&args.options)?;
    let inputs = pipeline::demo_inputs(args.sample_seed)?;
    let run = pipeline::run_fit(&config, &inputs)?;
    print_run(&run, args.options.top);
    Ok(())
}

fn handle_eval(args: EvalArgs) -> Result<()> {
    let file = crate::io::read_curve_json(&args.curve)?;
    let unit = file.curve.unit;
    for e in args.energies {
        let fwhm = file.curve.evaluate_with_error(e);
        println!("FWHM({e} {unit}) = {fwhm:.4} {unit}");
    }
    Ok(())
}

fn print_run(run: &RunOutput, top: usize) {
    println!("{}", crate::report::format_run_summary(run));
    if top > 0 {
        let ranked = crate::report::rank_by_fit_quality(&run.lines, top);
        println!("{}", crate::report::format_quality_ranking(&ranked));
    }
}

/// Translate CLI options into a run configuration and install the budget.
pub fn fit_config_from_args(args: &FitOptionArgs) -> Result<FitConfig> {
    if args.mc_samples < 2 {
        return Err(FitError::input("mc-samples must be at least 2"));
    }
    let mut budget = ResourceBudget::UNLIMITED;
    if let Some(secs) = args.max_time_secs {
        let limit = Duration::try_from_secs_f64(secs)
            .map_err(|_| FitError::input(format!("max-time-secs must be a finite non-negative number, got {secs}")))?;
        budget = budget.with_time(limit);
    }
    if let Some(mb) = args.max_memory_mb {
        budget = budget.with_memory_growth(mb.saturating_mul(1024 * 1024));
    }
    set_default_budget(budget);

    let peak = PeakFitOptions {
        shape: args.shape,
        low_e_tail: !args.no_tail,
        fixed_position: args.fixed_position,
        uncertainty: !args.no_uncertainty,
        iterative_refinement: !args.no_refinement,
        mc: McConfig {
            samples_full: args.mc_samples,
            samples_diag: args.mc_samples.min(McConfig::default().samples_diag),
            seed: args.seed,
            ..McConfig::default()
        },
        ..PeakFitOptions::default()
    };
    Ok(FitConfig {
        driver: DriverOptions {
            peak,
            calibrated_unit: args.unit,
        },
        curve: CurveOptions {
            pol_order: args.pol_order,
            pull_sd: args.pull_sd,
            unit: args.unit,
            ..CurveOptions::default()
        },
        skip_curve: args.no_uncertainty,
        export_results: args.export.clone(),
        export_curve: args.export_curve.clone(),
    })
}

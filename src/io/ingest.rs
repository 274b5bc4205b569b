//! JSON run-file ingest and validation.
//!
//! A run file lists the calibration lines of one detector:
//!
//! ```json
//! {
//!   "unit": "keV",
//!   "lines": [
//!     {
//!       "line": "Tl208_2614",
//!       "energy": { "value": 2614.511, "unit": "keV" },
//!       "scale": 0.25,
//!       "histogram": { "edges": [...], "counts": [...], "unit": "ADC" }
//!     }
//!   ],
//!   "priors": { "sigma": { "dist": "normal", "mean": 1.2, "sd": 0.5, "lo": 0.0 } }
//! }
//! ```
//!
//! Design goals:
//! - **strict schema** for the file itself (malformed JSON is an input error)
//! - **line-level validation**: a bad histogram skips that line and is
//!   reported, the remaining lines are still fitted
//! - no fitting logic here

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;

use crate::domain::{EnergyUnit, Histogram, PeakStats, Quantity};
use crate::error::{FitError, Result, io_context};
use crate::fit::{PeakInput, PriorOverrides};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunFile {
    #[serde(default = "default_unit")]
    unit: EnergyUnit,
    lines: Vec<LineEntry>,
    #[serde(default)]
    priors: PriorOverrides,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LineEntry {
    line: String,
    energy: Quantity,
    #[serde(default = "unit_scale")]
    scale: f64,
    /// Validated separately so one bad histogram does not reject the file.
    histogram: serde_json::Value,
    #[serde(default)]
    stats: Option<PeakStats>,
}

fn default_unit() -> EnergyUnit {
    EnergyUnit::KeV
}

fn unit_scale() -> f64 {
    1.0
}

/// A line skipped during ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct LineError {
    pub index: usize,
    pub line: String,
    pub message: String,
}

/// Ingest output: validated lines plus what was skipped.
#[derive(Debug, Clone)]
pub struct IngestedRun {
    pub inputs: Vec<PeakInput>,
    /// Unit the results are rescaled into.
    pub unit: EnergyUnit,
    /// Prior overrides applied to every line.
    pub priors: PriorOverrides,
    pub line_errors: Vec<LineError>,
    pub lines_read: usize,
}

/// Load and validate a run file.
pub fn load_run_file(path: &Path) -> Result<IngestedRun> {
    let file = File::open(path)
        .map_err(|e| io_context(e, format!("failed to open run file '{}'", path.display())))?;
    parse_run(BufReader::new(file))
}

/// Parse a run file from any reader.
pub fn parse_run<R: std::io::Read>(reader: R) -> Result<IngestedRun> {
    let run: RunFile =
        serde_json::from_reader(reader).map_err(|e| FitError::input(format!("invalid run file: {e}")))?;
    if run.unit == EnergyUnit::Adc {
        return Err(FitError::input("run file unit must be a physical energy unit"));
    }

    let lines_read = run.lines.len();
    let mut inputs = Vec::with_capacity(lines_read);
    let mut line_errors = Vec::new();
    for (index, entry) in run.lines.into_iter().enumerate() {
        let line = entry.line.clone();
        match validate_line(entry, run.unit) {
            Ok(input) => inputs.push(input),
            Err(message) => line_errors.push(LineError { index, line, message }),
        }
    }
    if inputs.is_empty() {
        return Err(FitError::input(format!(
            "run file has no usable lines ({} read, {} rejected)",
            lines_read,
            line_errors.len()
        )));
    }

    Ok(IngestedRun {
        inputs,
        unit: run.unit,
        priors: run.priors,
        line_errors,
        lines_read,
    })
}

fn validate_line(entry: LineEntry, unit: EnergyUnit) -> std::result::Result<PeakInput, String> {
    if entry.line.trim().is_empty() {
        return Err("line id is empty".into());
    }
    if !(entry.energy.value.is_finite() && entry.energy.value > 0.0) {
        return Err(format!("energy must be positive, got {}", entry.energy));
    }
    entry.energy.to(unit).map_err(|e| e.to_string())?;
    if !(entry.scale.is_finite() && entry.scale > 0.0) {
        return Err(format!("scale must be finite and positive, got {}", entry.scale));
    }
    let histogram: Histogram = serde_json::from_value(entry.histogram).map_err(|e| format!("histogram: {e}"))?;
    Ok(PeakInput {
        line: entry.line,
        energy: entry.energy,
        histogram,
        stats: entry.stats,
        scale: entry.scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = r#"{
        "unit": "keV",
        "lines": [
            {"line": "a", "energy": {"value": 583.191, "unit": "keV"}, "scale": 0.25,
             "histogram": {"edges": [0, 1, 2, 3], "counts": [1, 5, 2], "unit": "ADC"}},
            {"line": "b", "energy": {"value": 2.614511, "unit": "MeV"},
             "histogram": {"edges": [0, 2, 1], "counts": [1, 5]}},
            {"line": "c", "energy": {"value": 1000, "unit": "ADC"},
             "histogram": {"edges": [0, 1], "counts": [1]}}
        ],
        "priors": {"sigma": {"dist": "fixed", "value": 1.0}}
    }"#;

    #[test]
    fn bad_lines_are_skipped_and_reported() {
        let run = parse_run(RUN.as_bytes()).unwrap();
        assert_eq!(run.lines_read, 3);
        assert_eq!(run.inputs.len(), 1);
        assert_eq!(run.inputs[0].line, "a");
        assert_eq!(run.inputs[0].scale, 0.25);
        assert_eq!(run.inputs[0].histogram.unit(), EnergyUnit::Adc);
        let skipped: Vec<&str> = run.line_errors.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(skipped, ["b", "c"]);
        assert!(run.priors.contains_key("sigma"));
    }

    #[test]
    fn malformed_file_is_an_input_error() {
        let err = parse_run(r#"{"lines": 3}"#.as_bytes()).unwrap_err();
        assert!(matches!(err, FitError::Input(_)));
        let err = parse_run(r#"{"lines": [], "extra": 1}"#.as_bytes()).unwrap_err();
        assert!(matches!(err, FitError::Input(_)));
    }

    #[test]
    fn file_without_usable_lines_is_rejected() {
        let err = parse_run(r#"{"lines": []}"#.as_bytes()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}

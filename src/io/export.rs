//! Export fit results to JSON.
//!
//! The results file carries every line's `PeakFit` (with the line energy) plus
//! the resolution curve when one was fitted, and is meant to be reloaded by
//! downstream calibration scripts.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{PeakFit, Quantity, ResolutionCurve};
use crate::error::{Result, io_context};

/// One fitted line in the results file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineResult {
    pub energy: Quantity,
    pub fit: PeakFit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsFile {
    pub tool: String,
    pub lines: BTreeMap<String, LineResult>,
    pub curve: Option<ResolutionCurve>,
}

impl ResultsFile {
    pub fn new(lines: BTreeMap<String, LineResult>, curve: Option<ResolutionCurve>) -> Self {
        Self {
            tool: "ecal".to_string(),
            lines,
            curve,
        }
    }
}

/// Write the results file.
pub fn write_results_json(path: &Path, results: &ResultsFile) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| io_context(e, format!("failed to create results JSON '{}'", path.display())))?;
    serde_json::to_writer_pretty(BufWriter::new(file), results)?;
    Ok(())
}

/// Read a results file written by [`write_results_json`].
pub fn read_results_json(path: &Path) -> Result<ResultsFile> {
    let file = File::open(path)
        .map_err(|e| io_context(e, format!("failed to open results JSON '{}'", path.display())))?;
    Ok(serde_json::from_reader(file)?)
}

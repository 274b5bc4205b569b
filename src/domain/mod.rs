//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - energy units and unit-tagged quantities (`EnergyUnit`, `Quantity`)
//! - binned input data (`Histogram`, `PeakStats`)
//! - parameter naming and storage (`Param`, `ShapeKind`, `ParameterVector`)
//! - fit outputs (`PeakFit`, `GoodnessOfFit`, `ResolutionCurve`, etc.)

pub mod types;
pub mod units;

pub use types::*;
pub use units::*;

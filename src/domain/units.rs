//! Energy units and unit-tagged quantities.
//!
//! Every energy or width crossing the public API carries an [`EnergyUnit`].
//! Numeric routines strip the tag with [`Quantity::magnitude_in`] and re-attach
//! it at the boundary, so a keV/MeV mix-up surfaces as an input error instead
//! of a silently wrong curve.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Energy scale of a histogram axis or a fitted quantity.
///
/// `Adc` is the raw (uncalibrated) detector scale and cannot be converted to a
/// physical unit without a calibration factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnergyUnit {
    #[serde(rename = "ADC")]
    Adc,
    #[serde(rename = "eV")]
    Ev,
    #[serde(rename = "keV")]
    KeV,
    #[serde(rename = "MeV")]
    MeV,
}

impl EnergyUnit {
    /// Multiplier converting one unit of `self` into keV.
    pub fn kev_per_unit(self) -> Option<f64> {
        match self {
            EnergyUnit::Adc => None,
            EnergyUnit::Ev => Some(1e-3),
            EnergyUnit::KeV => Some(1.0),
            EnergyUnit::MeV => Some(1e3),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            EnergyUnit::Adc => "ADC",
            EnergyUnit::Ev => "eV",
            EnergyUnit::KeV => "keV",
            EnergyUnit::MeV => "MeV",
        }
    }

    /// Factor `f` such that `value_in_self * f = value_in_target`.
    pub fn factor_to(self, target: EnergyUnit) -> Result<f64> {
        if self == target {
            return Ok(1.0);
        }
        match (self.kev_per_unit(), target.kev_per_unit()) {
            (Some(a), Some(b)) => Ok(a / b),
            _ => Err(FitError::input(format!(
                "cannot convert {} to {} without a calibration",
                self.symbol(),
                target.symbol()
            ))),
        }
    }
}

impl fmt::Display for EnergyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for EnergyUnit {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADC" | "adc" => Ok(EnergyUnit::Adc),
            "eV" | "ev" => Ok(EnergyUnit::Ev),
            "keV" | "kev" => Ok(EnergyUnit::KeV),
            "MeV" | "mev" => Ok(EnergyUnit::MeV),
            other => Err(FitError::input(format!("unknown energy unit '{other}'"))),
        }
    }
}

/// A magnitude with an explicit energy unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: EnergyUnit,
}

impl Quantity {
    pub fn new(value: f64, unit: EnergyUnit) -> Self {
        Self { value, unit }
    }

    pub fn kev(value: f64) -> Self {
        Self::new(value, EnergyUnit::KeV)
    }

    /// Convert to another unit.
    pub fn to(self, unit: EnergyUnit) -> Result<Quantity> {
        Ok(Quantity::new(self.value * self.unit.factor_to(unit)?, unit))
    }

    /// Bare magnitude expressed in `unit`.
    pub fn magnitude_in(self, unit: EnergyUnit) -> Result<f64> {
        Ok(self.to(unit)?.value)
    }

    /// Sum in the unit of `self`; the other operand is converted first.
    pub fn checked_add(self, other: Quantity) -> Result<Quantity> {
        Ok(Quantity::new(self.value + other.magnitude_in(self.unit)?, self.unit))
    }

    pub fn checked_sub(self, other: Quantity) -> Result<Quantity> {
        Ok(Quantity::new(self.value - other.magnitude_in(self.unit)?, self.unit))
    }

    /// Dimensionless ratio `self / other`.
    pub fn ratio(self, other: Quantity) -> Result<f64> {
        Ok(self.value / other.magnitude_in(self.unit)?)
    }

    pub fn scale(self, factor: f64) -> Quantity {
        Quantity::new(self.value * factor, self.unit)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match f.precision() {
            Some(p) => write!(f, "{:.*} {}", p, self.value, self.unit),
            None => write!(f, "{} {}", self.value, self.unit),
        }
    }
}

/// Strip a slice of quantities to magnitudes in a single unit.
pub fn magnitudes_in(values: &[Quantity], unit: EnergyUnit) -> Result<Vec<f64>> {
    values.iter().map(|q| q.magnitude_in(unit)).collect()
}

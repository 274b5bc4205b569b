//! Special functions on `f64` used by the peak shapes.
//!
//! `erfc` comes from `statrs`; the scaled complement `erfcx(x) = exp(x²)·erfc(x)`
//! is needed to evaluate the exponentially modified Gaussian tail without
//! overflow/underflow pairs, and `statrs` does not provide it.

use std::f64::consts::PI;

/// `2 / sqrt(pi)`.
pub const TWO_OVER_SQRT_PI: f64 = 2.0 / 1.772_453_850_905_516;

/// Above this argument we switch `erfcx` to its asymptotic expansion.
const ERFCX_ASYMPTOTIC: f64 = 10.0;

pub fn erfc(x: f64) -> f64 {
    statrs::function::erf::erfc(x)
}

/// Scaled complementary error function `exp(x²)·erfc(x)`.
pub fn erfcx(x: f64) -> f64 {
    if x < ERFCX_ASYMPTOTIC {
        return (x * x).exp() * erfc(x);
    }
    // erfcx(x) ~ 1/(x sqrt(pi)) * (1 - 1/(2x²) + 3/(4x⁴) - 15/(8x⁶) + 105/(16x⁸))
    let inv2 = 1.0 / (x * x);
    let series = 1.0 - 0.5 * inv2 + 0.75 * inv2 * inv2 - 1.875 * inv2.powi(3)
        + 6.5625 * inv2.powi(4);
    series / (x * PI.sqrt())
}

/// `ln(k!)` for real-valued counts, via `ln Γ(k + 1)`.
pub fn ln_factorial(k: f64) -> f64 {
    if k == 0.0 || k == 1.0 {
        return 0.0;
    }
    statrs::function::gamma::ln_gamma(k + 1.0)
}

//! Forward-mode automatic differentiation.
//!
//! Likelihood and shape code is written once against the [`Scalar`] trait and
//! evaluated with three number types:
//!
//! - `f64` for plain evaluation
//! - [`Dual`] (value + one tangent) for gradients, one pass per coordinate
//! - [`HyperDual`] (value, two tangents, mixed second tangent) for exact
//!   Hessian entries, one pass per `(i, j)` pair with `i <= j`
//!
//! Parameter counts in this crate are small (at most ten), so seeding one
//! coordinate at a time is cheaper than maintaining a reverse-mode tape.

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::math::special::{TWO_OVER_SQRT_PI, erfc, erfcx};

/// Number type that likelihood code is generic over.
pub trait Scalar:
    Copy
    + Debug
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// Wrap a constant (all tangents zero).
    fn from_f64(v: f64) -> Self;

    /// Primal value.
    fn value(&self) -> f64;

    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn erfc(self) -> Self;
    /// `exp(x²)·erfc(x)`.
    fn erfcx(self) -> Self;
}

impl Scalar for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn value(&self) -> f64 {
        *self
    }
    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }
    #[inline]
    fn ln(self) -> Self {
        f64::ln(self)
    }
    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    #[inline]
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
    #[inline]
    fn erfc(self) -> Self {
        erfc(self)
    }
    #[inline]
    fn erfcx(self) -> Self {
        erfcx(self)
    }
}

/// First and second derivatives of the elementary functions, evaluated at `x`.
///
/// Returned as `(f, f', f'')`; shared by [`Dual`] and [`HyperDual`].
mod rules {
    use super::*;

    #[inline]
    pub fn exp(x: f64) -> (f64, f64, f64) {
        let e = x.exp();
        (e, e, e)
    }

    #[inline]
    pub fn ln(x: f64) -> (f64, f64, f64) {
        (x.ln(), 1.0 / x, -1.0 / (x * x))
    }

    #[inline]
    pub fn sqrt(x: f64) -> (f64, f64, f64) {
        let s = x.sqrt();
        (s, 0.5 / s, -0.25 / (s * s * s))
    }

    #[inline]
    pub fn powi(x: f64, n: i32) -> (f64, f64, f64) {
        match n {
            0 => (1.0, 0.0, 0.0),
            1 => (x, 1.0, 0.0),
            _ => {
                let nf = n as f64;
                (x.powi(n), nf * x.powi(n - 1), nf * (nf - 1.0) * x.powi(n - 2))
            }
        }
    }

    #[inline]
    pub fn erfc(x: f64) -> (f64, f64, f64) {
        let g = (-x * x).exp();
        (super::erfc(x), -TWO_OVER_SQRT_PI * g, 2.0 * TWO_OVER_SQRT_PI * x * g)
    }

    #[inline]
    pub fn erfcx(x: f64) -> (f64, f64, f64) {
        let g = super::erfcx(x);
        let d1 = 2.0 * x * g - TWO_OVER_SQRT_PI;
        let d2 = (2.0 + 4.0 * x * x) * g - 2.0 * TWO_OVER_SQRT_PI * x;
        (g, d1, d2)
    }
}

// ---------------------------------------------------------------------------
// Dual
// ---------------------------------------------------------------------------

/// Value with a single directional derivative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual {
    pub val: f64,
    pub dot: f64,
}

impl Dual {
    #[inline]
    pub fn new(val: f64, dot: f64) -> Self {
        Self { val, dot }
    }

    #[inline]
    pub fn constant(val: f64) -> Self {
        Self { val, dot: 0.0 }
    }

    #[inline]
    pub fn var(val: f64) -> Self {
        Self { val, dot: 1.0 }
    }

    #[inline]
    fn chain(self, (f, d1, _): (f64, f64, f64)) -> Self {
        Self { val: f, dot: d1 * self.dot }
    }
}

impl Add for Dual {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self { val: self.val + rhs.val, dot: self.dot + rhs.dot }
    }
}

impl Sub for Dual {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self { val: self.val - rhs.val, dot: self.dot - rhs.dot }
    }
}

impl Mul for Dual {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self { val: self.val * rhs.val, dot: self.dot * rhs.val + self.val * rhs.dot }
    }
}

impl Div for Dual {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        Self {
            val: self.val / rhs.val,
            dot: (self.dot * rhs.val - self.val * rhs.dot) / (rhs.val * rhs.val),
        }
    }
}

impl Neg for Dual {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self { val: -self.val, dot: -self.dot }
    }
}

impl Add<f64> for Dual {
    type Output = Self;
    #[inline]
    fn add(self, rhs: f64) -> Self {
        Self { val: self.val + rhs, dot: self.dot }
    }
}

impl Sub<f64> for Dual {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: f64) -> Self {
        Self { val: self.val - rhs, dot: self.dot }
    }
}

impl Mul<f64> for Dual {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: f64) -> Self {
        Self { val: self.val * rhs, dot: self.dot * rhs }
    }
}

impl Div<f64> for Dual {
    type Output = Self;
    #[inline]
    fn div(self, rhs: f64) -> Self {
        Self { val: self.val / rhs, dot: self.dot / rhs }
    }
}

impl Scalar for Dual {
    #[inline]
    fn from_f64(v: f64) -> Self {
        Dual::constant(v)
    }
    #[inline]
    fn value(&self) -> f64 {
        self.val
    }
    #[inline]
    fn exp(self) -> Self {
        self.chain(rules::exp(self.val))
    }
    #[inline]
    fn ln(self) -> Self {
        self.chain(rules::ln(self.val))
    }
    #[inline]
    fn sqrt(self) -> Self {
        self.chain(rules::sqrt(self.val))
    }
    #[inline]
    fn powi(self, n: i32) -> Self {
        self.chain(rules::powi(self.val, n))
    }
    #[inline]
    fn erfc(self) -> Self {
        self.chain(rules::erfc(self.val))
    }
    #[inline]
    fn erfcx(self) -> Self {
        self.chain(rules::erfcx(self.val))
    }
}

// ---------------------------------------------------------------------------
// HyperDual
// ---------------------------------------------------------------------------

/// Hyper-dual number `re + e1·ε1 + e2·ε2 + e12·ε1ε2` with `ε1² = ε2² = 0`.
///
/// Seeding `ε1` along coordinate `i` and `ε2` along `j` yields `∂²f/∂xi∂xj`
/// in `e12`, exactly (no step-size error).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HyperDual {
    pub re: f64,
    pub e1: f64,
    pub e2: f64,
    pub e12: f64,
}

impl HyperDual {
    #[inline]
    pub fn constant(re: f64) -> Self {
        Self { re, e1: 0.0, e2: 0.0, e12: 0.0 }
    }

    #[inline]
    pub fn seeded(re: f64, e1: f64, e2: f64) -> Self {
        Self { re, e1, e2, e12: 0.0 }
    }

    #[inline]
    fn chain(self, (f, d1, d2): (f64, f64, f64)) -> Self {
        Self {
            re: f,
            e1: d1 * self.e1,
            e2: d1 * self.e2,
            e12: d1 * self.e12 + d2 * self.e1 * self.e2,
        }
    }

    #[inline]
    fn recip(self) -> Self {
        let inv = 1.0 / self.re;
        self.chain((inv, -inv * inv, 2.0 * inv * inv * inv))
    }
}

impl Add for HyperDual {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self {
            re: self.re + rhs.re,
            e1: self.e1 + rhs.e1,
            e2: self.e2 + rhs.e2,
            e12: self.e12 + rhs.e12,
        }
    }
}

impl Sub for HyperDual {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self {
            re: self.re - rhs.re,
            e1: self.e1 - rhs.e1,
            e2: self.e2 - rhs.e2,
            e12: self.e12 - rhs.e12,
        }
    }
}

impl Mul for HyperDual {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self {
            re: self.re * rhs.re,
            e1: self.re * rhs.e1 + self.e1 * rhs.re,
            e2: self.re * rhs.e2 + self.e2 * rhs.re,
            e12: self.re * rhs.e12 + self.e1 * rhs.e2 + self.e2 * rhs.e1 + self.e12 * rhs.re,
        }
    }
}

impl Div for HyperDual {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        self * rhs.recip()
    }
}

impl Neg for HyperDual {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self { re: -self.re, e1: -self.e1, e2: -self.e2, e12: -self.e12 }
    }
}

impl Add<f64> for HyperDual {
    type Output = Self;
    #[inline]
    fn add(self, rhs: f64) -> Self {
        Self { re: self.re + rhs, ..self }
    }
}

impl Sub<f64> for HyperDual {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: f64) -> Self {
        Self { re: self.re - rhs, ..self }
    }
}

impl Mul<f64> for HyperDual {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: f64) -> Self {
        Self { re: self.re * rhs, e1: self.e1 * rhs, e2: self.e2 * rhs, e12: self.e12 * rhs }
    }
}

impl Div<f64> for HyperDual {
    type Output = Self;
    #[inline]
    fn div(self, rhs: f64) -> Self {
        self * (1.0 / rhs)
    }
}

impl Scalar for HyperDual {
    #[inline]
    fn from_f64(v: f64) -> Self {
        HyperDual::constant(v)
    }
    #[inline]
    fn value(&self) -> f64 {
        self.re
    }
    #[inline]
    fn exp(self) -> Self {
        self.chain(rules::exp(self.re))
    }
    #[inline]
    fn ln(self) -> Self {
        self.chain(rules::ln(self.re))
    }
    #[inline]
    fn sqrt(self) -> Self {
        self.chain(rules::sqrt(self.re))
    }
    #[inline]
    fn powi(self, n: i32) -> Self {
        self.chain(rules::powi(self.re, n))
    }
    #[inline]
    fn erfc(self) -> Self {
        self.chain(rules::erfc(self.re))
    }
    #[inline]
    fn erfcx(self) -> Self {
        self.chain(rules::erfcx(self.re))
    }
}

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

/// Gradient of `f` at `x`, one forward pass per coordinate.
pub fn gradient<F>(f: F, x: &[f64]) -> Vec<f64>
where
    F: Fn(&[Dual]) -> Dual,
{
    let n = x.len();
    let mut seeded: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut grad = vec![0.0; n];
    for i in 0..n {
        seeded[i].dot = 1.0;
        grad[i] = f(&seeded).dot;
        seeded[i].dot = 0.0;
    }
    grad
}

/// Value and gradient of `f` at `x`.
pub fn value_and_gradient<F>(f: F, x: &[f64]) -> (f64, Vec<f64>)
where
    F: Fn(&[Dual]) -> Dual,
{
    if x.is_empty() {
        let plain: Vec<Dual> = Vec::new();
        return (f(&plain).val, Vec::new());
    }
    let n = x.len();
    let mut seeded: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut grad = vec![0.0; n];
    let mut value = f64::NAN;
    for i in 0..n {
        seeded[i].dot = 1.0;
        let out = f(&seeded);
        value = out.val;
        grad[i] = out.dot;
        seeded[i].dot = 0.0;
    }
    (value, grad)
}

/// Dense Hessian of `f` at `x` (row-major, symmetric by construction).
pub fn hessian<F>(f: F, x: &[f64]) -> Vec<Vec<f64>>
where
    F: Fn(&[HyperDual]) -> HyperDual,
{
    let n = x.len();
    let mut h = vec![vec![0.0; n]; n];
    let mut seeded: Vec<HyperDual> = x.iter().map(|&v| HyperDual::constant(v)).collect();
    for i in 0..n {
        for j in i..n {
            seeded[i].e1 = 1.0;
            seeded[j].e2 = 1.0;
            let hij = f(&seeded).e12;
            h[i][j] = hij;
            h[j][i] = hij;
            seeded[i].e1 = 0.0;
            seeded[j].e2 = 0.0;
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rosenbrock<S: Scalar>(x: &[S]) -> S {
        let a = S::from_f64(1.0) - x[0];
        let b = x[1] - x[0] * x[0];
        a * a + b * b * 100.0
    }

    #[test]
    fn gradient_matches_analytic_rosenbrock() {
        let x = [0.3, -0.7];
        let g = gradient(|v| rosenbrock(v), &x);
        let gx = -2.0 * (1.0 - x[0]) - 400.0 * x[0] * (x[1] - x[0] * x[0]);
        let gy = 200.0 * (x[1] - x[0] * x[0]);
        assert_relative_eq!(g[0], gx, epsilon = 1e-12);
        assert_relative_eq!(g[1], gy, epsilon = 1e-12);
    }

    #[test]
    fn hessian_matches_analytic_rosenbrock() {
        let x = [0.3, -0.7];
        let h = hessian(|v| rosenbrock(v), &x);
        assert_relative_eq!(h[0][0], 2.0 - 400.0 * (x[1] - 3.0 * x[0] * x[0]), epsilon = 1e-10);
        assert_relative_eq!(h[0][1], -400.0 * x[0], epsilon = 1e-10);
        assert_relative_eq!(h[1][0], h[0][1]);
        assert_relative_eq!(h[1][1], 200.0, epsilon = 1e-10);
    }

    #[test]
    fn special_function_derivatives_match_finite_differences() {
        let eps = 1e-6;
        for &x in &[-1.3, 0.2, 2.5, 6.0] {
            let d = Dual::var(x).erfcx().dot;
            let fd = (erfcx(x + eps) - erfcx(x - eps)) / (2.0 * eps);
            assert_relative_eq!(d, fd, max_relative = 1e-6);

            let d2 = {
                let h = HyperDual::seeded(x, 1.0, 1.0);
                h.erfc().e12
            };
            let fd2 = (erfc(x + eps) - 2.0 * erfc(x) + erfc(x - eps)) / (eps * eps);
            assert_relative_eq!(d2, fd2, epsilon = 1e-3);
        }
    }

    #[test]
    fn hyperdual_division_second_derivative() {
        // f(x) = 1/x, f'' = 2/x³
        let x = 1.7;
        let h = HyperDual::constant(1.0) / HyperDual::seeded(x, 1.0, 1.0);
        assert_relative_eq!(h.e12, 2.0 / (x * x * x), epsilon = 1e-12);
    }
}

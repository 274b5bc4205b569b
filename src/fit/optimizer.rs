//! Limited-memory BFGS in unconstrained coordinates.
//!
//! The objective is any [`Objective`]: a function written once against
//! [`Scalar`], evaluated with [`Dual`] numbers for exact gradients. Bounds are
//! handled upstream by the prior's transforms, so the search itself is
//! unconstrained.
//!
//! Steps come from a strong-Wolfe line search (bracketing, then a zoom phase
//! with safeguarded cubic interpolation). The curvature condition keeps every
//! accepted `(s, y)` pair usable by the inverse-Hessian estimate, which a bare
//! sufficient-decrease rule does not.
//!
//! Every iteration hands an [`IterState`] to a caller callback, which may stop
//! the run with a [`Termination`] reason. Stopping is a normal outcome: the
//! result carries the best point so far with `converged = false`.

use std::ops::ControlFlow;

use tracing::debug;

use crate::domain::Termination;
use crate::math::{Dual, Scalar, ad};

/// A scalar function that can be evaluated with any AD number type.
pub trait Objective: Sync {
    fn eval<S: Scalar>(&self, x: &[S]) -> S;
}

/// Stopping rules and L-BFGS memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub max_iter: usize,
    /// Converged once `max |∂f/∂x_i|` drops below `grad_tol · sqrt(max(1, |f|))`.
    pub grad_tol: f64,
    /// Converged once a step changes `f` by less than `f_tol · max(1, |f|)`.
    pub f_tol: f64,
    /// Number of `(s, y)` pairs kept for the inverse-Hessian estimate.
    pub memory: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            grad_tol: 1e-6,
            f_tol: 1e-12,
            memory: 8,
        }
    }
}

/// Snapshot passed to the per-iteration callback.
#[derive(Debug, Clone, Copy)]
pub struct IterState<'a> {
    pub iteration: usize,
    pub f: f64,
    pub grad_max: f64,
    pub x: &'a [f64],
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeResult {
    pub x: Vec<f64>,
    pub f: f64,
    pub iterations: usize,
    pub termination: Termination,
}

impl OptimizeResult {
    pub fn converged(&self) -> bool {
        self.termination.is_converged()
    }
}

/// Sufficient-decrease constant.
const WOLFE_C1: f64 = 1e-4;
/// Curvature constant; 0.9 is the usual choice for quasi-Newton directions.
const WOLFE_C2: f64 = 0.9;
const MAX_BRACKET: usize = 40;
const MAX_ZOOM: usize = 40;
/// Largest step tried while bracketing.
const MAX_STEP: f64 = 1e10;
/// A failed line search with the gradient this small relative to `f` is a
/// minimum at working precision.
const STATIONARY_RTOL: f64 = 1e-7;

/// Flat ring buffer of `(s, y, rho)` pairs; the oldest pair is overwritten.
struct History {
    s: Vec<f64>,
    y: Vec<f64>,
    rho: Vec<f64>,
    n: usize,
    m: usize,
    head: usize,
    len: usize,
}

impl History {
    fn new(m: usize, n: usize) -> Self {
        let m = m.max(1);
        Self {
            s: vec![0.0; m * n],
            y: vec![0.0; m * n],
            rho: vec![0.0; m],
            n,
            m,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, s: &[f64], y: &[f64], rho: f64) {
        let slot = if self.len < self.m {
            self.len += 1;
            (self.head + self.len - 1) % self.m
        } else {
            let slot = self.head;
            self.head = (self.head + 1) % self.m;
            slot
        };
        let off = slot * self.n;
        self.s[off..off + self.n].copy_from_slice(s);
        self.y[off..off + self.n].copy_from_slice(y);
        self.rho[slot] = rho;
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot of logical index `i` (0 = oldest).
    fn slot(&self, i: usize) -> usize {
        (self.head + i) % self.m
    }

    fn s_at(&self, i: usize) -> &[f64] {
        let off = self.slot(i) * self.n;
        &self.s[off..off + self.n]
    }

    fn y_at(&self, i: usize) -> &[f64] {
        let off = self.slot(i) * self.n;
        &self.y[off..off + self.n]
    }

    fn rho_at(&self, i: usize) -> f64 {
        self.rho[self.slot(i)]
    }

    /// `-H·g` from the two-loop recursion.
    fn direction(&self, g: &[f64]) -> Vec<f64> {
        let mut q = g.to_vec();
        let mut alphas = vec![0.0; self.len];
        for i in (0..self.len).rev() {
            let a = self.rho_at(i) * dot(self.s_at(i), &q);
            axpy(-a, self.y_at(i), &mut q);
            alphas[i] = a;
        }
        if self.len > 0 {
            let (s, y) = (self.s_at(self.len - 1), self.y_at(self.len - 1));
            let gamma = dot(s, y) / dot(y, y);
            for qi in &mut q {
                *qi *= gamma;
            }
        }
        for (i, a) in alphas.into_iter().enumerate() {
            let b = self.rho_at(i) * dot(self.y_at(i), &q);
            axpy(a - b, self.s_at(i), &mut q);
        }
        q.iter().map(|v| -v).collect()
    }
}

/// Objective value, gradient and directional derivative at `x + alpha·d`.
#[derive(Debug, Clone)]
struct LinePoint {
    alpha: f64,
    x: Vec<f64>,
    f: f64,
    g: Vec<f64>,
    slope: f64,
}

impl LinePoint {
    fn is_finite(&self) -> bool {
        self.f.is_finite() && self.slope.is_finite()
    }
}

/// Strong-Wolfe step along the descent direction `d` from `origin`.
///
/// Returns `None` when no step with sufficient decrease exists at working
/// precision. When the zoom phase runs out of rounds, the best point with
/// sufficient decrease is returned even if it misses the curvature condition.
fn wolfe_step<F>(value_grad: &F, origin: &LinePoint, d: &[f64], first: f64) -> Option<LinePoint>
where
    F: Fn(&[f64]) -> (f64, Vec<f64>),
{
    let at = |alpha: f64| {
        let x: Vec<f64> = origin.x.iter().zip(d).map(|(xi, di)| xi + alpha * di).collect();
        let (f, g) = value_grad(&x);
        let slope = dot(&g, d);
        LinePoint { alpha, x, f, g, slope }
    };
    let armijo = |p: &LinePoint| p.f <= origin.f + WOLFE_C1 * p.alpha * origin.slope;
    let curvature = |p: &LinePoint| p.slope.abs() <= -WOLFE_C2 * origin.slope;

    let mut prev = origin.clone();
    let mut alpha = first;
    for i in 0..MAX_BRACKET {
        let trial = at(alpha);
        if !trial.is_finite() || !armijo(&trial) || (i > 0 && trial.f >= prev.f) {
            return zoom(&at, origin, prev, trial);
        }
        if curvature(&trial) {
            return Some(trial);
        }
        if trial.slope >= 0.0 {
            return zoom(&at, origin, trial, prev);
        }
        prev = trial;
        alpha = (2.0 * alpha).min(MAX_STEP);
    }
    (prev.alpha > 0.0).then_some(prev)
}

/// Zoom phase: `lo` satisfies sufficient decrease and has the lower value; the
/// minimizer lies between `lo.alpha` and `hi.alpha`.
fn zoom<A>(at: &A, origin: &LinePoint, mut lo: LinePoint, mut hi: LinePoint) -> Option<LinePoint>
where
    A: Fn(f64) -> LinePoint,
{
    for _ in 0..MAX_ZOOM {
        let width = (hi.alpha - lo.alpha).abs();
        if width <= f64::EPSILON * lo.alpha.abs().max(hi.alpha.abs()) {
            break;
        }
        let trial = at(interpolate(&lo, &hi));
        let sufficient = trial.is_finite() && trial.f <= origin.f + WOLFE_C1 * trial.alpha * origin.slope;
        if !sufficient || trial.f >= lo.f {
            hi = trial;
            continue;
        }
        if trial.slope.abs() <= -WOLFE_C2 * origin.slope {
            return Some(trial);
        }
        if trial.slope * (hi.alpha - lo.alpha) >= 0.0 {
            hi = lo;
        }
        lo = trial;
    }
    (lo.alpha > 0.0).then_some(lo)
}

/// Minimizer of the cubic through both end points, kept away from the ends;
/// bisection when the cubic is unusable.
fn interpolate(a: &LinePoint, b: &LinePoint) -> f64 {
    let (lo, hi) = (a.alpha.min(b.alpha), a.alpha.max(b.alpha));
    let mid = 0.5 * (lo + hi);
    if !(a.is_finite() && b.is_finite()) {
        return mid;
    }
    let d1 = a.slope + b.slope - 3.0 * (a.f - b.f) / (a.alpha - b.alpha);
    let disc = d1 * d1 - a.slope * b.slope;
    if !(disc >= 0.0) {
        return mid;
    }
    let d2 = (b.alpha - a.alpha).signum() * disc.sqrt();
    let t = b.alpha - (b.alpha - a.alpha) * (b.slope + d2 - d1) / (b.slope - a.slope + 2.0 * d2);
    let margin = 0.1 * (hi - lo);
    if t.is_finite() && t >= lo + margin && t <= hi - margin { t } else { mid }
}

/// Minimize `objective` from `x0`.
pub fn minimize<O, C>(objective: &O, x0: &[f64], config: &OptimizerConfig, mut callback: C) -> OptimizeResult
where
    O: Objective,
    C: FnMut(&IterState<'_>) -> ControlFlow<Termination>,
{
    let value_grad = |x: &[f64]| ad::value_and_gradient(|z: &[Dual]| objective.eval(z), x);
    let finish = |x: Vec<f64>, f: f64, iterations: usize, termination: Termination| {
        debug!(?termination, iterations, f, "optimizer finished");
        OptimizeResult { x, f, iterations, termination }
    };

    let (f0, g0) = value_grad(x0);
    if x0.is_empty() {
        return finish(x0.to_vec(), f0, 0, Termination::Converged);
    }
    if !f0.is_finite() || g0.iter().any(|v| !v.is_finite()) {
        return finish(x0.to_vec(), f0, 0, Termination::NonFinite);
    }

    let mut x = x0.to_vec();
    let mut f = f0;
    let mut g = g0;
    let mut history = History::new(config.memory, x.len());

    for iteration in 0..config.max_iter {
        let grad_max = max_abs(&g);
        let state = IterState { iteration, f, grad_max, x: &x };
        if let ControlFlow::Break(reason) = callback(&state) {
            return finish(x, f, iteration, reason);
        }
        if grad_max <= config.grad_tol * f.abs().max(1.0).sqrt() {
            return finish(x, f, iteration, Termination::Converged);
        }

        let mut d = history.direction(&g);
        let mut slope = dot(&g, &d);
        if !(slope < 0.0) {
            history.clear();
            d = g.iter().map(|v| -v).collect();
            slope = dot(&g, &d);
        }
        let first = if history.is_empty() { (1.0 / grad_max).min(1.0) } else { 1.0 };
        let origin = LinePoint { alpha: 0.0, x, f, g, slope };

        let Some(next) = wolfe_step(&value_grad, &origin, &d, first) else {
            let LinePoint { x: x_old, g: g_old, .. } = origin;
            if grad_max <= STATIONARY_RTOL * f.abs().max(1.0) || -slope <= config.f_tol * f.abs().max(1.0) {
                return finish(x_old, f, iteration, Termination::Converged);
            }
            if !history.is_empty() {
                history.clear();
                x = x_old;
                g = g_old;
                continue;
            }
            return finish(x_old, f, iteration, Termination::LineSearchFailed);
        };
        if next.g.iter().any(|v| !v.is_finite()) {
            return finish(origin.x, f, iteration, Termination::NonFinite);
        }

        let s: Vec<f64> = next.x.iter().zip(&origin.x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = next.g.iter().zip(&origin.g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > 1e-12 * norm(&s) * norm(&y) {
            history.push(&s, &y, 1.0 / sy);
        }

        let change = (f - next.f).abs() / f.abs().max(next.f.abs()).max(1.0);
        x = next.x;
        f = next.f;
        g = next.g;
        if change <= config.f_tol {
            return finish(x, f, iteration + 1, Termination::Converged);
        }
    }

    finish(x, f, config.max_iter, Termination::MaxIterations)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `y += a·x`
fn axpy(a: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += a * xi;
    }
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

fn max_abs(a: &[f64]) -> f64 {
    a.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
}

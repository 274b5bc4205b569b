//! One-dimensional root finding and maximization on `f64` closures.
//!
//! Both routines report failure as `None` so callers can map it to an
//! "undefined" result instead of propagating an error.

/// Bracketing tolerance and iteration limits.
#[derive(Debug, Clone, Copy)]
pub struct RootSettings {
    pub x_tol: f64,
    pub max_iter: usize,
}

impl Default for RootSettings {
    fn default() -> Self {
        Self { x_tol: 1e-10, max_iter: 200 }
    }
}

/// Bisection for `f(x) = 0` on `[lo, hi]`.
///
/// Requires a sign change between the endpoints; returns `None` otherwise, or
/// when `f` produces a non-finite value.
pub fn bisect<F: Fn(f64) -> f64>(f: F, lo: f64, hi: f64, settings: RootSettings) -> Option<f64> {
    if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
        return None;
    }
    let mut a = lo;
    let mut b = hi;
    let mut fa = f(a);
    let fb = f(b);
    if !(fa.is_finite() && fb.is_finite()) {
        return None;
    }
    if fa == 0.0 {
        return Some(a);
    }
    if fb == 0.0 {
        return Some(b);
    }
    if fa.signum() == fb.signum() {
        return None;
    }

    let tol = settings.x_tol * (1.0 + lo.abs().max(hi.abs()));
    for _ in 0..settings.max_iter {
        let mid = 0.5 * (a + b);
        let fm = f(mid);
        if !fm.is_finite() {
            return None;
        }
        if fm == 0.0 || (b - a) < tol {
            return Some(mid);
        }
        if fm.signum() == fa.signum() {
            a = mid;
            fa = fm;
        } else {
            b = mid;
        }
    }
    Some(0.5 * (a + b))
}

/// Locate the maximum of `f` on `[lo, hi]`.
///
/// A coarse grid picks the best cell, then golden-section search refines it.
/// Returns `(argmax, max)` or `None` if no finite value was seen.
pub fn maximize<F: Fn(f64) -> f64>(
    f: F,
    lo: f64,
    hi: f64,
    grid: usize,
    settings: RootSettings,
) -> Option<(f64, f64)> {
    if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
        return None;
    }
    let grid = grid.max(3);
    let step = (hi - lo) / (grid - 1) as f64;

    let mut best_i = None;
    let mut best_f = f64::NEG_INFINITY;
    for i in 0..grid {
        let fx = f(lo + step * i as f64);
        if fx.is_finite() && fx > best_f {
            best_f = fx;
            best_i = Some(i);
        }
    }
    let i = best_i?;

    let mut a = lo + step * i.saturating_sub(1) as f64;
    let mut b = (lo + step * (i + 1) as f64).min(hi);
    let inv_phi = 0.5 * (5f64.sqrt() - 1.0);
    let mut c = b - inv_phi * (b - a);
    let mut d = a + inv_phi * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    let tol = settings.x_tol * (1.0 + lo.abs().max(hi.abs()));
    for _ in 0..settings.max_iter {
        if (b - a) < tol {
            break;
        }
        if fc > fd || !fd.is_finite() {
            b = d;
            d = c;
            fd = fc;
            c = b - inv_phi * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + inv_phi * (b - a);
            fd = f(d);
        }
    }

    let x = 0.5 * (a + b);
    let fx = f(x);
    if fx.is_finite() && fx >= best_f {
        Some((x, fx))
    } else {
        Some((lo + step * i as f64, best_f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bisect_finds_sqrt2() {
        let r = bisect(|x| x * x - 2.0, 0.0, 2.0, RootSettings::default()).unwrap();
        assert!((r - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn bisect_without_sign_change_is_undefined() {
        assert!(bisect(|x| x * x + 1.0, -1.0, 1.0, RootSettings::default()).is_none());
    }

    #[test]
    fn bisect_rejects_nan() {
        assert!(bisect(|_| f64::NAN, 0.0, 1.0, RootSettings::default()).is_none());
    }

    #[test]
    fn maximize_finds_parabola_peak() {
        let (x, fx) = maximize(|x| -(x - 1.3).powi(2) + 4.0, -5.0, 5.0, 50, RootSettings::default())
            .unwrap();
        assert!((x - 1.3).abs() < 1e-6);
        assert!((fx - 4.0).abs() < 1e-10);
    }
}

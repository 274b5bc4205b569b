//! Numerical building blocks: forward-mode AD, special functions, dense linear
//! algebra helpers, least squares and one-dimensional root finding.

pub mod ad;
pub mod linalg;
pub mod ols;
pub mod roots;
pub mod special;

pub use ad::{Dual, HyperDual, Scalar};
pub use ols::*;

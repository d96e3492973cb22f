//! Standard normal helpers shared by pricing, the IV solver and the simulator.

use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::erf::erfc;
use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// Phi(x) = erfc(-x / sqrt(2)) / 2.
///
/// Going through erfc instead of 1 + erf keeps full relative precision in the
/// lower tail, where 1 + erf(x) cancels.
#[inline]
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x * FRAC_1_SQRT_2)
}

#[inline]
pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

/// Inverse CDF. `p` outside (0, 1) maps to -inf / +inf.
pub fn norm_inv(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    Normal::standard().inverse_cdf(p)
}

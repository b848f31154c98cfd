use statrs::distribution::{Continuous, Normal};

use super::error::{GlidePathError, GlideResult};
use super::types::{ALLOCATION_EPSILON, ModelParameters};

/// Expense-adjusted gross one-period return mean for stock weight `a`.
pub fn mean(params: &ModelParameters, a: f64) -> f64 {
    1.0 + a * params.stock_mean + (1.0 - a) * params.bond_mean - params.expense_ratio
}

pub fn variance(params: &ModelParameters, a: f64) -> f64 {
    a * a * params.stock_variance
        + (1.0 - a) * (1.0 - a) * params.bond_variance
        + 2.0 * a * (1.0 - a) * params.covariance
}

pub fn mean_derivative(params: &ModelParameters) -> f64 {
    params.stock_mean - params.bond_mean
}

pub fn variance_derivative(params: &ModelParameters, a: f64) -> f64 {
    2.0 * a * params.stock_variance - 2.0 * (1.0 - a) * params.bond_variance
        + 2.0 * (1.0 - 2.0 * a) * params.covariance
}

pub fn variance_second_derivative(params: &ModelParameters) -> f64 {
    2.0 * params.stock_variance + 2.0 * params.bond_variance - 4.0 * params.covariance
}

pub fn min_variance_allocation(params: &ModelParameters) -> f64 {
    let denom = params.stock_variance + params.bond_variance - 2.0 * params.covariance;
    if denom <= 0.0 {
        return 0.0;
    }
    ((params.bond_variance - params.covariance) / denom).clamp(0.0, 1.0)
}

/// Smallest allocation any glide-path entry may take.
pub fn lower_bound(params: &ModelParameters) -> f64 {
    (min_variance_allocation(params) + ALLOCATION_EPSILON).min(1.0)
}

/// Standard return density `f(a, r)`.
pub fn density(params: &ModelParameters, a: f64, r: f64) -> GlideResult<f64> {
    Ok(Moments::new(params, a).normal()?.pdf(r))
}

/// Per-time-point moments, computed once before the bucket sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub mean: f64,
    pub mean_derivative: f64,
    pub variance: f64,
    pub variance_derivative: f64,
    pub variance_second_derivative: f64,
    pub min_variance_allocation: f64,
    /// `variance * variance'' - 2 * variance'^2`; zero makes the Hessian diagonal undefined.
    pub hessian_curvature: f64,
}

impl Moments {
    pub fn new(params: &ModelParameters, a: f64) -> Self {
        let variance = variance(params, a);
        let variance_derivative = variance_derivative(params, a);
        let variance_second_derivative = variance_second_derivative(params);
        Self {
            mean: mean(params, a),
            mean_derivative: mean_derivative(params),
            variance,
            variance_derivative,
            variance_second_derivative,
            min_variance_allocation: min_variance_allocation(params),
            hessian_curvature: variance * variance_second_derivative
                - 2.0 * variance_derivative * variance_derivative,
        }
    }

    /// Return distribution `N(mean, variance)` at this allocation.
    pub fn normal(&self) -> GlideResult<Normal> {
        Normal::new(self.mean, self.variance.sqrt()).map_err(|e| {
            GlidePathError::InvalidConfig(format!(
                "return distribution undefined (variance {}): {e}",
                self.variance
            ))
        })
    }

    /// Gradient scaling `k` with `df/da = k (g - f)`.
    pub fn gradient_scale(&self) -> f64 {
        self.variance_derivative / (2.0 * self.variance)
            + self.mean_derivative * self.mean_derivative / (2.0 * self.variance_derivative)
    }

    /// `alpha` in `d ln f / da = alpha (u + shift)^2 - k`.
    pub(crate) fn score_curvature(&self) -> f64 {
        self.variance_derivative / (2.0 * self.variance * self.variance)
    }

    pub(crate) fn score_shift(&self) -> f64 {
        self.mean_derivative * self.variance / self.variance_derivative
    }

    /// `E_f[(d ln f / da)^2]`, the normaliser of the quartic Hessian density.
    pub fn score_second_moment(&self) -> f64 {
        let s = self.variance;
        let alpha = self.score_curvature();
        let d = self.score_shift();
        let k = self.gradient_scale();
        alpha * alpha * (3.0 * s * s + 6.0 * s * d * d + d.powi(4)) - k * k
    }

    /// Coefficients `(A, B, C)` of `d^2 ln f / da^2 = A + B u + C u^2`.
    pub(crate) fn second_score(&self) -> (f64, f64, f64) {
        let s = self.variance;
        let ds = self.variance_derivative;
        let dds = self.variance_second_derivative;
        let dm = self.mean_derivative;
        let a = -dds / (2.0 * s) + ds * ds / (2.0 * s * s) - dm * dm / s;
        let b = -2.0 * dm * ds / (s * s);
        let c = self.hessian_curvature / (2.0 * s * s * s);
        (a, b, c)
    }

    /// Weights `(w_h1, w_h2, w_f)` with `d^2 f / da^2 = w_h1 h1 + w_h2 h2 + w_f f`.
    pub fn hessian_weights(&self) -> (f64, f64, f64) {
        let (a, b, c) = self.second_score();
        let e = b / (2.0 * c);
        (
            c * (self.variance + e * e),
            self.score_second_moment(),
            a - b * b / (4.0 * c),
        )
    }
}

//! Gradient and Hessian of the success probability with respect to the
//! glide-path, assembled from engine calls under substituted densities.

use nalgebra::DMatrix;
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, warn};

use super::density::DensitySelector;
use super::engine::Engine;
use super::error::{GlidePathError, GlideResult};
use super::returns::Moments;
use super::types::{Estimate, GlidePath, Gradient};

const DEGENERATE_CURVATURE: f64 = 1e-12;

/// Component clamped to the distance from `allocation` to the boundary it points at.
pub(crate) fn effective_component(raw: f64, allocation: f64, lower: f64) -> f64 {
    if raw > 0.0 {
        raw.min(1.0 - allocation)
    } else {
        raw.max(lower - allocation)
    }
}

/// Two-sided p-value of "both estimates share one success probability".
pub(crate) fn noise_p_value(baseline: Estimate, perturbed: Estimate) -> f64 {
    let (n0, n1) = (baseline.samples as f64, perturbed.samples as f64);
    if n0 == 0.0 || n1 == 0.0 {
        return 0.0;
    }
    let pooled = (baseline.probability * n0 + perturbed.probability * n1) / (n0 + n1);
    let se = (pooled * (1.0 - pooled) * (1.0 / n0 + 1.0 / n1)).sqrt();
    let diff = perturbed.probability - baseline.probability;
    if se <= 0.0 {
        return if diff == 0.0 { 1.0 } else { 0.0 };
    }
    let z = (diff / se).abs();
    2.0 * (1.0 - Normal::standard().cdf(z))
}

/// Gradient at `path` given its already-estimated `baseline` probability.
///
/// Under Monte Carlo every component is z-tested against zero at the noise
/// significance level and dropped when indistinguishable from it.
pub fn build_gradient(engine: &Engine, path: &GlidePath, baseline: Estimate) -> GlideResult<Gradient> {
    let path = engine.feasible(path);
    let lower = engine.lower_bound();
    let noise_level = engine.simulation().map(|s| s.significance[1]);

    let horizon = path.len();
    let mut raw = Vec::with_capacity(horizon);
    let mut components = Vec::with_capacity(horizon);
    let mut effective = Vec::with_capacity(horizon);
    let mut scales = Vec::with_capacity(horizon);
    let mut zeroed = 0;

    for (t, allocation) in path.as_slice().iter().enumerate() {
        let k = Moments::new(engine.params(), *allocation).gradient_scale();
        let perturbed = engine.success_probability(&path, DensitySelector::gradient(t))?;
        let value = k * (perturbed.probability - baseline.probability);

        let mut kept = value;
        if let Some(alpha) = noise_level {
            let p_value = noise_p_value(baseline, perturbed);
            if p_value > alpha && value != 0.0 {
                warn!(timepoint = t, component = value, p_value, "gradient component is noise, zeroed");
                kept = 0.0;
                zeroed += 1;
            }
        }

        raw.push(value);
        components.push(kept);
        effective.push(effective_component(kept, *allocation, lower));
        scales.push(k);
    }

    let gradient = Gradient {
        baseline,
        raw,
        components,
        effective,
        scales,
        zeroed,
    };
    debug!(
        max_component = gradient.max_component(),
        max_effective = gradient.max_effective(),
        zeroed,
        "gradient built"
    );
    Ok(gradient)
}

/// Symmetric `T x T` Hessian at `path`.
///
/// Off-diagonal terms reuse `gradient.raw`; each needs one engine call with
/// the gradient density at both time-points. Diagonal terms need one call per
/// Hessian density.
pub fn build_hessian(engine: &Engine, path: &GlidePath, gradient: &Gradient) -> GlideResult<DMatrix<f64>> {
    let path = engine.feasible(path);
    let horizon = path.len();
    let baseline = gradient.baseline.probability;

    let moments: Vec<Moments> = path
        .as_slice()
        .iter()
        .map(|a| Moments::new(engine.params(), *a))
        .collect();
    for (t, m) in moments.iter().enumerate() {
        if m.hessian_curvature.abs() < DEGENERATE_CURVATURE {
            return Err(GlidePathError::DegenerateHessianDiagonal {
                timepoint: t,
                curvature: m.hessian_curvature,
            });
        }
    }

    let mut hessian = DMatrix::zeros(horizon, horizon);
    for i in 0..horizon {
        let (w_quadratic, w_quartic, w_base) = moments[i].hessian_weights();
        let quadratic = engine.success_probability(&path, DensitySelector::hessian_quadratic(i))?;
        let quartic = engine.success_probability(&path, DensitySelector::hessian_quartic(i))?;
        hessian[(i, i)] = w_quadratic * quadratic.probability
            + w_quartic * quartic.probability
            + w_base * baseline;

        for j in (i + 1)..horizon {
            let (k_i, k_j) = (gradient.scales[i], gradient.scales[j]);
            let paired = engine.success_probability(&path, DensitySelector::gradient_pair(i, j))?;
            let value = k_i * k_j * (paired.probability - baseline)
                - k_j * gradient.raw[i]
                - k_i * gradient.raw[j];
            hessian[(i, j)] = value;
            hessian[(j, i)] = value;
        }
    }
    debug!(horizon, "hessian built");
    Ok(hessian)
}

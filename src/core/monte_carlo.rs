use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::ThreadPool;
use rayon::prelude::*;

use super::density::{DensityKind, DensitySelector, ReweightedDensity};
use super::error::{GlidePathError, GlideResult};
use super::returns::Moments;
use super::types::{Estimate, ModelParameters};

const ENVELOPE_SCAN_POINTS: usize = 2048;
const ENVELOPE_HEADROOM: f64 = 1.05;

/// Rejection-sampling box `[x_lo, x_hi] x [0, y_max]` for one special density.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SamplingBox {
    x_lo: f64,
    x_hi: f64,
    y_max: f64,
}

const GRADIENT_BOX: SamplingBox = SamplingBox {
    x_lo: -0.15,
    x_hi: 2.20,
    y_max: 6.20,
};

const HESSIAN_QUADRATIC_BOX: SamplingBox = SamplingBox {
    x_lo: -0.10,
    x_hi: 2.30,
    y_max: 5.70,
};

const HESSIAN_QUARTIC_BOX: SamplingBox = SamplingBox {
    x_lo: -0.15,
    x_hi: 2.40,
    y_max: 5.85,
};

/// One-period return sampler for one time-point.
enum ReturnSampler {
    Normal(Normal<f64>),
    Rejection {
        density: ReweightedDensity,
        bounds: SamplingBox,
    },
}

impl ReturnSampler {
    fn new(
        params: &ModelParameters,
        allocation: f64,
        selector: &DensitySelector,
        timepoint: usize,
    ) -> GlideResult<Self> {
        let moments = Moments::new(params, allocation);
        let kind = selector.kind_at(timepoint);
        let mut bounds = match kind {
            DensityKind::Standard => {
                let normal = Normal::new(moments.mean, moments.variance.sqrt()).map_err(|e| {
                    GlidePathError::InvalidConfig(format!(
                        "return distribution undefined at time-point {timepoint}: {e}"
                    ))
                })?;
                return Ok(Self::Normal(normal));
            }
            DensityKind::Gradient => GRADIENT_BOX,
            DensityKind::HessianQuadratic => HESSIAN_QUADRATIC_BOX,
            DensityKind::HessianQuartic => HESSIAN_QUARTIC_BOX,
        };

        let density = ReweightedDensity::new(&moments, kind)?;
        // Low-variance allocations can peak above the calibrated height.
        let dx = (bounds.x_hi - bounds.x_lo) / ENVELOPE_SCAN_POINTS as f64;
        let peak = (0..=ENVELOPE_SCAN_POINTS)
            .map(|i| density.pdf(bounds.x_lo + i as f64 * dx))
            .fold(0.0_f64, f64::max);
        bounds.y_max = bounds.y_max.max(peak * ENVELOPE_HEADROOM);
        Ok(Self::Rejection { density, bounds })
    }

    fn sample(&self, rng: &mut ChaCha8Rng) -> f64 {
        match self {
            Self::Normal(normal) => normal.sample(rng),
            Self::Rejection { density, bounds } => loop {
                let x = rng.gen_range(bounds.x_lo..bounds.x_hi);
                let y = rng.gen_range(0.0..bounds.y_max);
                if y <= density.pdf(x) {
                    break x;
                }
            },
        }
    }
}

pub(crate) fn derive_seed(base_seed: u64, stream: u64, worker: usize) -> u64 {
    let mixed = base_seed ^ (stream << 20) ^ worker as u64;
    splitmix64(mixed)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Fraction of `trials` paths that never hit ruin.
fn run_trials(samplers: &[ReturnSampler], rf0: f64, trials: u64, rng: &mut ChaCha8Rng) -> f64 {
    let mut ruined = 0_u64;
    for _ in 0..trials {
        let mut rf = rf0;
        for sampler in samplers {
            let r = sampler.sample(rng);
            if rf <= 0.0 || r <= rf {
                ruined += 1;
                break;
            }
            rf /= r - rf;
        }
    }
    1.0 - ruined as f64 / trials as f64
}

/// Monte Carlo estimate split into `workers` equal independent batches.
#[allow(clippy::too_many_arguments)]
pub(crate) fn success_probability(
    params: &ModelParameters,
    sample_size: u64,
    seed: u64,
    stream: u64,
    path: &[f64],
    selector: &DensitySelector,
    rf0: f64,
    pool: &ThreadPool,
    workers: usize,
) -> GlideResult<Estimate> {
    let per_worker = sample_size / workers.max(1) as u64;
    if workers == 0 || per_worker == 0 {
        return Err(GlidePathError::WorkerPartition {
            units: sample_size as usize,
            workers,
        });
    }

    let samplers = path
        .iter()
        .enumerate()
        .map(|(t, a)| ReturnSampler::new(params, *a, selector, t))
        .collect::<GlideResult<Vec<_>>>()?;

    let estimates: Vec<f64> = pool.install(|| {
        (0..workers)
            .into_par_iter()
            .map(|worker| {
                let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, stream, worker));
                run_trials(&samplers, rf0, per_worker, &mut rng)
            })
            .collect()
    });

    Ok(Estimate {
        probability: estimates.iter().sum::<f64>() / workers as f64,
        samples: per_worker * workers as u64,
    })
}

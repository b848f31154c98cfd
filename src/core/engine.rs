use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use super::density::DensitySelector;
use super::dynamic_programming;
use super::error::{GlidePathError, GlideResult};
use super::monte_carlo;
use super::returns::lower_bound;
use super::types::{
    Estimate, Estimation, GlidePath, ModelParameters, RunConfig, SimulationSettings,
};

/// Success-probability estimator shared by the builders and the optimizer.
///
/// Owns the worker pool; every call partitions its innermost loop (buckets or
/// trials) across exactly `workers` threads and returns only when all finish.
pub struct Engine {
    params: ModelParameters,
    horizon: usize,
    withdrawal_rate: f64,
    estimation: Estimation,
    workers: usize,
    pool: ThreadPool,
    stream: AtomicU64,
}

impl Engine {
    pub fn new(config: &RunConfig) -> GlideResult<Self> {
        if config.workers == 0 {
            return Err(GlidePathError::WorkerPartition {
                units: config.horizon,
                workers: 0,
            });
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|idx| format!("glidepath-worker-{idx}"))
            .build()
            .map_err(|e| GlidePathError::InvalidConfig(format!("worker pool: {e}")))?;

        Ok(Self {
            params: config.parameters,
            horizon: config.horizon,
            withdrawal_rate: config.withdrawal_rate,
            estimation: config.estimation,
            workers: config.workers,
            pool,
            stream: AtomicU64::new(0),
        })
    }

    pub fn params(&self) -> &ModelParameters {
        &self.params
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn is_stochastic(&self) -> bool {
        self.estimation.is_stochastic()
    }

    /// Monte Carlo settings, `None` for the exact backend.
    pub fn simulation(&self) -> Option<&SimulationSettings> {
        match &self.estimation {
            Estimation::Simulation(settings) => Some(settings),
            Estimation::DynamicProgramming(_) => None,
        }
    }

    pub fn lower_bound(&self) -> f64 {
        lower_bound(&self.params)
    }

    /// Copy of `path` with every entry clamped into the feasible range.
    pub fn feasible(&self, path: &GlidePath) -> GlidePath {
        path.clamped(self.lower_bound())
    }

    pub fn success_probability(
        &self,
        path: &GlidePath,
        selector: DensitySelector,
    ) -> GlideResult<Estimate> {
        self.success_probability_scaled(path, selector, 1)
    }

    /// Same as [`Engine::success_probability`], with the Monte Carlo sample
    /// size multiplied by `sample_multiplier`. Exact backends ignore it.
    pub fn success_probability_scaled(
        &self,
        path: &GlidePath,
        selector: DensitySelector,
        sample_multiplier: u64,
    ) -> GlideResult<Estimate> {
        if path.len() != self.horizon {
            return Err(GlidePathError::InvalidConfig(format!(
                "glide path has {} entries, horizon is {}",
                path.len(),
                self.horizon
            )));
        }
        selector.validate(self.horizon)?;
        let path = self.feasible(path);

        let estimate = match self.estimation {
            Estimation::DynamicProgramming(settings) => {
                let probability = dynamic_programming::success_probability(
                    &self.params,
                    &settings,
                    path.as_slice(),
                    &selector,
                    self.withdrawal_rate,
                    &self.pool,
                    self.workers,
                )?;
                Estimate::exact(probability)
            }
            Estimation::Simulation(settings) => {
                let stream = self.stream.fetch_add(1, Ordering::Relaxed);
                monte_carlo::success_probability(
                    &self.params,
                    settings.sample_size.saturating_mul(sample_multiplier.max(1)),
                    settings.seed,
                    stream,
                    path.as_slice(),
                    &selector,
                    self.withdrawal_rate,
                    &self.pool,
                    self.workers,
                )?
            }
        };
        debug!(
            probability = estimate.probability,
            samples = estimate.samples,
            ?selector,
            "engine call"
        );
        Ok(estimate)
    }
}

/// Contiguous, disjoint ranges covering `0..units`, one per worker.
pub(crate) fn partition(units: usize, workers: usize) -> GlideResult<Vec<Range<usize>>> {
    if workers == 0 {
        return Err(GlidePathError::WorkerPartition { units, workers });
    }
    let base = units / workers;
    let extra = units % workers;
    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0;
    for w in 0..workers {
        let len = base + usize::from(w < extra);
        if len == 0 {
            continue;
        }
        ranges.push(start..start + len);
        start += len;
    }
    if start != units {
        return Err(GlidePathError::WorkerPartition { units, workers });
    }
    Ok(ranges)
}

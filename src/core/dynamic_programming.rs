//! Backward recursion over a discretized ruin-factor axis.
//!
//! Bucket `k` (1-based) stands for ruin factor `k / precision`. The ruin
//! probability curve of time-point `t + 1` is kept as runs of equal
//! probability. A next-period ruin factor is rounded to the nearest bucket,
//! so bucket `k` covers `((k - 0.5) / precision, (k + 0.5) / precision]` and
//! bucket 1 also takes everything below it. The last bucket must saturate at
//! 1.0, which makes any ruin factor beyond the axis a ruin.

use rayon::ThreadPool;
use rayon::prelude::*;
use statrs::distribution::{Gamma, Normal};
use tracing::trace;

use super::density::{self, DensitySelector};
use super::engine::partition;
use super::error::{GlidePathError, GlideResult};
use super::returns::Moments;
use super::types::{DpSettings, ModelParameters};

const MONOTONE_TOLERANCE: f64 = 1e-15;
const UPPER_TOLERANCE: f64 = 2e-15;

/// Consecutive buckets sharing one ruin probability; `last` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Run {
    last: usize,
    probability: f64,
}

/// Return distribution of one time-point, hoisted out of the bucket loop.
struct PeriodDensity {
    moments: Moments,
    constants: Vec<f64>,
    normal: Normal,
    gammas: &'static [Gamma],
}

impl PeriodDensity {
    fn new(
        params: &ModelParameters,
        allocation: f64,
        selector: &DensitySelector,
        timepoint: usize,
    ) -> GlideResult<Self> {
        let moments = Moments::new(params, allocation);
        Ok(Self {
            constants: density::constants(&moments, selector, timepoint),
            normal: moments.normal()?,
            gammas: density::auxiliary_variables(selector, timepoint),
            moments,
        })
    }

    fn cdf(&self, x: f64) -> f64 {
        density::cdf(&self.moments, &self.constants, &self.normal, self.gammas, x)
    }
}

/// Ruin probability from ruin factor `rf` at one time-point.
///
/// `prior` is the coalesced curve of the next time-point; `None` means no
/// time-point follows, so only this period's return can ruin.
fn ruin_probability(rf: f64, period: &PeriodDensity, prior: Option<&[Run]>, precision: f64) -> f64 {
    let immediate = period.cdf(rf);
    let Some(runs) = prior else {
        return immediate;
    };
    let survive = 1.0 - immediate;
    if survive <= 0.0 {
        return 1.0;
    }

    // s(k): probability of surviving this period and landing at or below the
    // upper edge of bucket k next period.
    let mut mass = 0.0;
    let mut tail = 0.0;
    let mut previous_edge = 0.0;
    for (idx, run) in runs.iter().enumerate() {
        let edge = 1.0 - period.cdf(rf * (1.0 + precision / (run.last as f64 + 0.5)));
        mass += run.probability * (edge - previous_edge);
        let next = runs.get(idx + 1).map_or(1.0, |r| r.probability);
        tail += (next - run.probability) * edge;
        previous_edge = edge;
    }
    mass += survive - previous_edge;

    let conditional = (mass / survive).clamp(0.0, 1.0);
    let naive = immediate + conditional - immediate * conditional;
    if naive > 0.5 {
        // 1 - (1 - cdf)(1 - conditional), with the product accumulated directly.
        (1.0 - tail).clamp(0.0, 1.0)
    } else {
        naive
    }
}

fn coalesce(curve: &[f64]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for (idx, p) in curve.iter().enumerate() {
        match runs.last_mut() {
            Some(run) if run.probability == *p => run.last = idx + 1,
            _ => runs.push(Run {
                last: idx + 1,
                probability: *p,
            }),
        }
    }
    runs
}

/// First 1-based bucket whose ruin probability is exactly 1.0, or
/// `buckets + 1` when none is. Gallops from `seed` then bisects.
fn saturation_boundary(seed: usize, buckets: usize, is_saturated: impl Fn(usize) -> bool) -> usize {
    let seed = seed.clamp(1, buckets);
    let (mut below, mut at) = if is_saturated(seed) {
        let mut at = seed;
        let mut step = 1;
        loop {
            if at <= step {
                break (0, at);
            }
            let probe = at - step;
            if is_saturated(probe) {
                at = probe;
                step *= 2;
            } else {
                break (probe, at);
            }
        }
    } else {
        let mut below = seed;
        let mut step = 1;
        loop {
            let probe = (below + step).min(buckets);
            if probe == below {
                return buckets + 1;
            }
            if is_saturated(probe) {
                break (below, probe);
            }
            below = probe;
            step *= 2;
        }
    };
    while at - below > 1 {
        let mid = below + (at - below) / 2;
        if is_saturated(mid) {
            at = mid;
        } else {
            below = mid;
        }
    }
    at
}

fn validate_curve(curve: &[f64], timepoint: usize) -> GlideResult<()> {
    for (idx, p) in curve.iter().enumerate() {
        if !(0.0..=1.0 + UPPER_TOLERANCE).contains(p) {
            return Err(GlidePathError::ProbabilityOutOfBounds {
                timepoint,
                bucket: idx + 1,
                probability: *p,
            });
        }
        if idx > 0 && *p < curve[idx - 1] - MONOTONE_TOLERANCE {
            return Err(GlidePathError::NonMonotoneBuckets {
                timepoint,
                bucket: idx + 1,
                previous: curve[idx - 1],
                current: *p,
            });
        }
    }
    match curve.last() {
        Some(last) if *last == 1.0 => Ok(()),
        other => Err(GlidePathError::InsufficientRange {
            timepoint,
            probability: other.copied().unwrap_or(0.0),
        }),
    }
}

/// Probability of never being ruined along `path`, starting from ruin factor `rf0`.
pub(crate) fn success_probability(
    params: &ModelParameters,
    settings: &DpSettings,
    path: &[f64],
    selector: &DensitySelector,
    rf0: f64,
    pool: &ThreadPool,
    workers: usize,
) -> GlideResult<f64> {
    let horizon = path.len();
    if horizon == 0 {
        return Err(GlidePathError::InvalidConfig("empty glide path".to_string()));
    }
    let buckets = settings.bucket_count();
    if buckets == 0 || settings.precision == 0 {
        return Err(GlidePathError::InvalidConfig(format!(
            "ruin factor axis is empty (precision {}, rf_max {})",
            settings.precision, settings.rf_max
        )));
    }
    let precision = settings.precision as f64;
    let top_region = horizon.div_ceil(6);

    let mut prior: Option<Vec<Run>> = None;
    let mut curve = vec![0.0; buckets];
    let mut boundary = buckets;
    for t in (1..horizon).rev() {
        let period = PeriodDensity::new(params, path[t], selector, t)?;
        let runs = prior.as_deref();
        let ruin_at = |bucket: usize| ruin_probability(bucket as f64 / precision, &period, runs, precision);

        let seed = if t >= horizon - top_region {
            buckets
        } else {
            boundary
        };
        boundary = saturation_boundary(seed, buckets, |bucket| ruin_at(bucket) >= 1.0);
        if boundary > buckets {
            return Err(GlidePathError::InsufficientRange {
                timepoint: t,
                probability: ruin_at(buckets),
            });
        }

        let (open, saturated) = curve.split_at_mut(boundary - 1);
        saturated.fill(1.0);
        let ranges = partition(open.len(), workers)?;
        let mut slices = Vec::with_capacity(ranges.len());
        let mut rest = open;
        for range in &ranges {
            let (head, tail) = rest.split_at_mut(range.len());
            slices.push((range.start, head));
            rest = tail;
        }
        pool.install(|| {
            slices.into_par_iter().for_each(|(start, slice)| {
                for (offset, slot) in slice.iter_mut().enumerate() {
                    *slot = ruin_at(start + offset + 1);
                }
            });
        });

        validate_curve(&curve, t)?;
        let coalesced = coalesce(&curve);
        trace!(
            timepoint = t,
            saturation = boundary,
            runs = coalesced.len(),
            "bucket sweep"
        );
        prior = Some(coalesced);
    }

    let first = PeriodDensity::new(params, path[0], selector, 0)?;
    let ruin = ruin_probability(rf0, &first, prior.as_deref(), precision);
    Ok(1.0 - ruin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{assert_close, scenario_params};
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};
    use rayon::ThreadPoolBuilder;
    use statrs::distribution::ContinuousCDF;

    fn pool(workers: usize) -> ThreadPool {
        ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .expect("pool")
    }

    fn settings() -> DpSettings {
        DpSettings {
            precision: 40,
            rf_max: 3.0,
        }
    }

    #[test]
    fn single_period_matches_normal_cdf() {
        let params = scenario_params();
        let p = success_probability(
            &params,
            &settings(),
            &[0.6],
            &DensitySelector::standard(),
            0.9,
            &pool(2),
            2,
        )
        .expect("probability");
        let moments = Moments::new(&params, 0.6);
        let normal = moments.normal().expect("normal");
        assert_close(p, 1.0 - normal.cdf(0.9), 1e-15);
    }

    #[test]
    fn next_ruin_factor_rounds_to_nearest_bucket() {
        let params = scenario_params();
        let settings = DpSettings {
            precision: 10,
            rf_max: 3.0,
        };
        let (a0, a1, rf0) = (0.6, 0.4, 0.3);
        let p = success_probability(
            &params,
            &settings,
            &[a0, a1],
            &DensitySelector::standard(),
            rf0,
            &pool(2),
            2,
        )
        .expect("probability");

        let now = Moments::new(&params, a0).normal().expect("normal");
        let next = Moments::new(&params, a1).normal().expect("normal");
        let buckets = settings.bucket_count();
        let ruin_with_edges = |offset: f64| {
            // Surviving this period and landing at or below the upper edge of bucket k.
            let below = |k: usize| 1.0 - now.cdf(rf0 * (1.0 + 10.0 / (k as f64 + offset)));
            let mut ruin = now.cdf(rf0) + (1.0 - now.cdf(rf0) - below(buckets));
            let mut previous = 0.0;
            for k in 1..=buckets {
                ruin += next.cdf(k as f64 / 10.0) * (below(k) - previous);
                previous = below(k);
            }
            ruin
        };

        assert_close(p, 1.0 - ruin_with_edges(0.5), 1e-12);
        assert!((ruin_with_edges(0.5) - ruin_with_edges(0.0)).abs() > 1e-6);
    }

    #[test]
    fn coalesce_merges_equal_neighbours() {
        let runs = coalesce(&[0.0, 0.0, 0.2, 0.5, 0.5, 1.0]);
        assert_eq!(
            runs,
            vec![
                Run { last: 2, probability: 0.0 },
                Run { last: 3, probability: 0.2 },
                Run { last: 5, probability: 0.5 },
                Run { last: 6, probability: 1.0 },
            ]
        );
    }

    #[test]
    fn validate_curve_flags_each_violation() {
        assert!(validate_curve(&[0.0, 0.5, 1.0], 3).is_ok());
        assert!(matches!(
            validate_curve(&[0.0, 0.6, 0.5, 1.0], 3),
            Err(GlidePathError::NonMonotoneBuckets { bucket: 3, .. })
        ));
        assert!(matches!(
            validate_curve(&[0.0, 0.5, 0.9], 3),
            Err(GlidePathError::InsufficientRange { timepoint: 3, .. })
        ));
        assert!(matches!(
            validate_curve(&[-0.1, 1.0], 3),
            Err(GlidePathError::ProbabilityOutOfBounds { bucket: 1, .. })
        ));
    }

    #[test]
    fn too_small_range_is_fatal() {
        let err = success_probability(
            &scenario_params(),
            &DpSettings {
                precision: 40,
                rf_max: 1.0,
            },
            &[0.6, 0.6, 0.6],
            &DensitySelector::standard(),
            0.05,
            &pool(2),
            2,
        )
        .expect_err("range too small");
        assert!(matches!(err, GlidePathError::InsufficientRange { timepoint: 2, .. }));
    }

    #[test]
    fn worker_count_does_not_change_result() {
        let params = scenario_params();
        let path = [0.9, 0.7, 0.5, 0.4, 0.3, 0.3];
        let selector = DensitySelector::gradient(2);
        let one = success_probability(&params, &settings(), &path, &selector, 0.1, &pool(1), 1)
            .expect("probability");
        let many = success_probability(&params, &settings(), &path, &selector, 0.1, &pool(3), 7)
            .expect("probability");
        assert_eq!(one, many);
    }

    #[test]
    fn higher_withdrawal_lowers_success() {
        let params = scenario_params();
        let path = [0.6; 8];
        let run = |rf0: f64| {
            success_probability(
                &params,
                &settings(),
                &path,
                &DensitySelector::standard(),
                rf0,
                &pool(2),
                2,
            )
            .expect("probability")
        };
        let low = run(0.08);
        let high = run(0.16);
        assert!(low > high, "{low} should exceed {high}");
        assert!(high > 0.0 && low < 1.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_saturation_search_finds_first_saturated_bucket(
            buckets in 1_usize..400,
            first in 1_usize..450,
            seed in 1_usize..400,
        ) {
            let expected = first.min(buckets + 1);
            let found = saturation_boundary(seed, buckets, |bucket| bucket >= first);
            prop_assert_eq!(found, expected);
        }

        #[test]
        fn prop_success_probability_is_a_probability(
            a0 in 0.2_f64..1.0,
            a1 in 0.2_f64..1.0,
            a2 in 0.2_f64..1.0,
            rf0 in 0.02_f64..0.3,
        ) {
            let p = success_probability(
                &scenario_params(),
                &settings(),
                &[a0, a1, a2],
                &DensitySelector::standard(),
                rf0,
                &pool(2),
                2,
            ).expect("probability");
            prop_assert!((0.0..=1.0).contains(&p));
        }
    }
}

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, info, warn};

use super::density::DensitySelector;
use super::derivatives::{build_gradient, build_hessian};
use super::engine::Engine;
use super::error::{GlidePathError, GlideResult};
use super::returns::{min_variance_allocation, variance};
use super::types::{
    ALLOCATION_EPSILON, Algorithm, ConcavityReport, Estimate, Estimation, Evaluation, GlidePath,
    Gradient, IterationRecord, OptimizeResult, RunConfig, StepKind,
};

/// Largest single-component move of a regular climb.
const MAX_MOVE: f64 = 0.1;
/// Largest single-component move of the climb that precedes the main loop.
const INITIAL_MAX_MOVE: f64 = 0.01;
const MAX_STEP_REDUCTIONS: u32 = 64;
const MAX_ACCEPTED_MOVES: u32 = 64;

fn step_ratio() -> f64 {
    5.0_f64.powf(0.25)
}

#[derive(Debug, Clone)]
pub(crate) struct ClimbOutcome {
    pub path: GlidePath,
    pub estimate: Estimate,
    pub accepted_moves: u32,
}

/// Success probability of `path`, optionally with its gradient.
pub fn evaluate(config: &RunConfig, path: &GlidePath, with_gradient: bool) -> GlideResult<Evaluation> {
    validate_config(config)?;
    let engine = Engine::new(config)?;
    let path = checked_path(&engine, path)?;
    let estimate = engine.success_probability(&path, DensitySelector::standard())?;

    let (gradient, max_effective_gradient) = if with_gradient {
        let gradient = build_gradient(&engine, &path, estimate)?;
        let max = gradient.max_effective();
        (Some(gradient.components), Some(max))
    } else {
        (None, None)
    };

    info!(
        probability = estimate.probability,
        samples = estimate.samples,
        "glide path evaluated"
    );
    Ok(Evaluation {
        success_probability: estimate.probability,
        samples: estimate.samples,
        glide_path: path,
        gradient,
        max_effective_gradient,
    })
}

/// Locally optimal glide-path starting from `initial`.
pub fn optimize(config: &RunConfig, initial: &GlidePath) -> GlideResult<OptimizeResult> {
    validate_config(config)?;
    let engine = Engine::new(config)?;
    let mut path = checked_path(&engine, initial)?;
    let threshold = config.convergence_threshold;

    let mut estimate = engine.success_probability(&path, DensitySelector::standard())?;
    let mut gradient = build_gradient(&engine, &path, estimate)?;
    let mut iterations = Vec::new();
    info!(
        probability = estimate.probability,
        max_effective_gradient = gradient.max_effective(),
        "starting optimization"
    );

    if gradient.max_effective() > threshold {
        let outcome = climb(&engine, &path, &gradient, INITIAL_MAX_MOVE)?;
        path = outcome.path;
        estimate = outcome.estimate;
        gradient = build_gradient(&engine, &path, estimate)?;
        let accepted_moves = outcome.accepted_moves;
        iterations.push(record(0, StepKind::InitialClimb, &path, &gradient, accepted_moves));
    }

    let mut iteration = 0;
    while gradient.max_effective() > threshold {
        if iteration >= config.max_iterations {
            return Err(GlidePathError::NotConverged {
                iterations: iteration,
                max_gradient: gradient.max_effective(),
            });
        }
        iteration += 1;

        let (step, accepted_moves) = match config.algorithm {
            Algorithm::GradientAscent => {
                let outcome = climb(&engine, &path, &gradient, MAX_MOVE)?;
                path = outcome.path;
                estimate = outcome.estimate;
                (StepKind::Climb, outcome.accepted_moves)
            }
            Algorithm::NewtonRaphson => {
                let hessian = build_hessian(&engine, &path, &gradient)?;
                let (next, next_estimate) = newton_step(&engine, &path, &gradient, &hessian)?;
                path = next;
                estimate = next_estimate;
                (StepKind::Newton, 1)
            }
        };
        gradient = build_gradient(&engine, &path, estimate)?;

        let entry = record(iteration, step, &path, &gradient, accepted_moves);
        info!(
            iteration,
            step = ?entry.step,
            probability = entry.probability,
            max_effective_gradient = entry.max_effective_gradient,
            "optimizer iteration"
        );
        iterations.push(entry);
    }

    let hessian = build_hessian(&engine, &path, &gradient)?;
    let concavity = concavity(hessian);
    if !concavity.is_local_maximum {
        warn!(
            max_eigenvalue = concavity.max_eigenvalue,
            "final hessian is not negative semi-definite"
        );
    }

    let success_probability = match engine.simulation() {
        Some(settings) => {
            engine
                .success_probability_scaled(
                    &path,
                    DensitySelector::standard(),
                    settings.final_resample_multiplier,
                )?
                .probability
        }
        None => estimate.probability,
    };
    info!(
        success_probability,
        iterations = iteration,
        "optimization converged"
    );

    Ok(OptimizeResult {
        success_probability,
        glide_path: path,
        max_effective_gradient: gradient.max_effective(),
        iterations,
        concavity,
    })
}

fn record(
    iteration: u32,
    step: StepKind,
    path: &GlidePath,
    gradient: &Gradient,
    accepted_moves: u32,
) -> IterationRecord {
    IterationRecord {
        iteration,
        step,
        glide_path: path.clone(),
        probability: gradient.baseline.probability,
        max_effective_gradient: gradient.max_effective(),
        accepted_moves,
    }
}

fn checked_path(engine: &Engine, path: &GlidePath) -> GlideResult<GlidePath> {
    if path.len() != engine.horizon() {
        return Err(GlidePathError::InvalidConfig(format!(
            "glide path has {} entries, horizon is {}",
            path.len(),
            engine.horizon()
        )));
    }
    if path.as_slice().iter().any(|a| !a.is_finite()) {
        return Err(GlidePathError::InvalidConfig(
            "glide path entries must be finite".to_string(),
        ));
    }
    Ok(engine.feasible(path))
}

/// Gradient ascent along `gradient` on a geometric step grid.
///
/// The step starts as the largest grid value that keeps every move within
/// `max_move`. Until the first accepted move a rejection shrinks the step one
/// grid notch; afterwards a rejection ends the climb.
pub(crate) fn climb(
    engine: &Engine,
    path: &GlidePath,
    gradient: &Gradient,
    max_move: f64,
) -> GlideResult<ClimbOutcome> {
    let direction = ascent_direction(gradient);
    let max_component = direction.iter().fold(0.0_f64, |acc, g| acc.max(g.abs()));
    let mut current = path.clone();
    let mut best = gradient.baseline;
    if max_component == 0.0 {
        return Ok(ClimbOutcome {
            path: current,
            estimate: best,
            accepted_moves: 0,
        });
    }

    let ratio = step_ratio();
    let mut bucket = ((max_move / max_component).ln() / ratio.ln()).floor() as i32;
    let mut reductions = 0;
    let mut accepted_moves = 0;

    while accepted_moves < MAX_ACCEPTED_MOVES {
        let step = ratio.powi(bucket);
        let candidate = moved(engine, &current, &direction, step);
        if candidate == current {
            break;
        }
        let estimate = engine.success_probability(&candidate, DensitySelector::standard())?;
        let accepted = accepts(engine, best, estimate);
        debug!(
            step,
            probability = estimate.probability,
            best = best.probability,
            accepted,
            "climb attempt"
        );

        if accepted {
            current = candidate;
            best = estimate;
            accepted_moves += 1;
        } else if accepted_moves == 0 {
            reductions += 1;
            if reductions > MAX_STEP_REDUCTIONS {
                return Err(GlidePathError::ClimbStalled {
                    reductions: MAX_STEP_REDUCTIONS,
                });
            }
            bucket -= 1;
        } else {
            break;
        }
    }

    // Selecting the best of several noisy estimates biases it upward.
    if let Some(settings) = engine.simulation() {
        if accepted_moves > 0 {
            best = engine.success_probability_scaled(
                &current,
                DensitySelector::standard(),
                settings.climb_resample_multiplier,
            )?;
        }
    }

    Ok(ClimbOutcome {
        path: current,
        estimate: best,
        accepted_moves,
    })
}

/// A component pushing against the bound it already sits on cannot move.
fn is_pinned(gradient: &Gradient, t: usize) -> bool {
    gradient.components[t] != 0.0 && gradient.effective[t] == 0.0
}

fn ascent_direction(gradient: &Gradient) -> Vec<f64> {
    (0..gradient.components.len())
        .map(|t| if is_pinned(gradient, t) { 0.0 } else { gradient.components[t] })
        .collect()
}

fn moved(engine: &Engine, path: &GlidePath, direction: &[f64], step: f64) -> GlidePath {
    let next = path
        .as_slice()
        .iter()
        .zip(direction)
        .map(|(a, g)| a + step * g)
        .collect();
    engine.feasible(&GlidePath::new(next))
}

/// Strict improvement for exact estimates, one-sided non-inferiority otherwise.
fn accepts(engine: &Engine, best: Estimate, candidate: Estimate) -> bool {
    let Some(settings) = engine.simulation() else {
        return candidate.probability > best.probability;
    };
    if best.is_exact() || candidate.is_exact() {
        return candidate.probability > best.probability;
    }
    let (n0, n1) = (best.samples as f64, candidate.samples as f64);
    let pooled = (best.probability * n0 + candidate.probability * n1) / (n0 + n1);
    let se = (pooled * (1.0 - pooled) * (1.0 / n0 + 1.0 / n1)).sqrt();
    let z = Normal::standard().inverse_cdf(1.0 - settings.significance[0]);
    candidate.probability >= best.probability - z * se
}

/// Full Newton step over the components not pinned against a bound.
pub(crate) fn newton_step(
    engine: &Engine,
    path: &GlidePath,
    gradient: &Gradient,
    hessian: &DMatrix<f64>,
) -> GlideResult<(GlidePath, Estimate)> {
    let free: Vec<usize> = (0..path.len())
        .filter(|t| !is_pinned(gradient, *t))
        .collect();

    let mut next = path.clone();
    if !free.is_empty() {
        let reduced = DMatrix::from_fn(free.len(), free.len(), |r, c| hessian[(free[r], free[c])]);
        let rhs = DVector::from_iterator(free.len(), free.iter().map(|t| -gradient.components[*t]));
        let delta = reduced.lu().solve(&rhs).ok_or(GlidePathError::SingularHessian)?;
        for (row, t) in free.iter().enumerate() {
            next.set(*t, path.get(*t) + delta[row]);
        }
    }
    let next = engine.feasible(&next);

    let estimate = engine.success_probability(&next, DensitySelector::standard())?;
    if estimate.probability < gradient.baseline.probability {
        warn!(
            before = gradient.baseline.probability,
            after = estimate.probability,
            "newton step lowered the success probability"
        );
    }
    Ok((next, estimate))
}

fn concavity(hessian: DMatrix<f64>) -> ConcavityReport {
    let eigen = SymmetricEigen::new(hessian);
    let min_eigenvalue = eigen.eigenvalues.min();
    let max_eigenvalue = eigen.eigenvalues.max();
    ConcavityReport {
        min_eigenvalue,
        max_eigenvalue,
        is_local_maximum: max_eigenvalue <= 0.0,
    }
}

pub fn validate_config(config: &RunConfig) -> GlideResult<()> {
    let invalid = |msg: &str| Err(GlidePathError::InvalidConfig(msg.to_string()));
    let p = &config.parameters;

    if config.horizon == 0 {
        return invalid("horizon must be > 0");
    }
    if !config.withdrawal_rate.is_finite() || config.withdrawal_rate <= 0.0 {
        return invalid("withdrawal_rate must be > 0");
    }
    if !config.convergence_threshold.is_finite() || config.convergence_threshold <= 0.0 {
        return invalid("convergence_threshold must be > 0");
    }
    if config.workers == 0 {
        return invalid("workers must be > 0");
    }
    if config.max_iterations == 0 {
        return invalid("max_iterations must be > 0");
    }
    let moments = [
        p.stock_mean,
        p.stock_variance,
        p.bond_mean,
        p.bond_variance,
        p.covariance,
        p.expense_ratio,
    ];
    if moments.iter().any(|m| !m.is_finite()) {
        return invalid("return parameters must be finite");
    }
    if p.stock_variance <= 0.0 || p.bond_variance <= 0.0 {
        return invalid("stock_variance and bond_variance must be > 0");
    }
    if p.covariance * p.covariance >= p.stock_variance * p.bond_variance {
        return invalid("covariance must be smaller in magnitude than sqrt(stock_variance * bond_variance)");
    }
    if min_variance_allocation(p) + ALLOCATION_EPSILON >= 1.0 {
        return invalid("minimum-variance allocation leaves no feasible range below 1.0");
    }
    if variance(p, min_variance_allocation(p)) <= 0.0 {
        return invalid("portfolio variance must be > 0");
    }

    match &config.estimation {
        Estimation::DynamicProgramming(dp) => {
            if dp.precision == 0 {
                return invalid("precision must be > 0");
            }
            if !dp.rf_max.is_finite() || dp.rf_max <= config.withdrawal_rate {
                return invalid("rf_max must be greater than withdrawal_rate");
            }
        }
        Estimation::Simulation(sim) => {
            if sim.sample_size < config.workers as u64 {
                return invalid("sample_size must be >= workers");
            }
            if sim.significance.iter().any(|s| !(*s > 0.0 && *s < 1.0)) {
                return invalid("significance levels must be between 0 and 1");
            }
            if sim.climb_resample_multiplier == 0 || sim.final_resample_multiplier == 0 {
                return invalid("resample multipliers must be > 0");
            }
        }
    }
    Ok(())
}

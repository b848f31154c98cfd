use thiserror::Error;

/// Fatal conditions raised by the numerical core. None of them are retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GlidePathError {
    #[error("density selector index {index} is outside the horizon of {horizon} time-points")]
    SelectorOutOfRange { index: usize, horizon: usize },

    #[error("at most one Hessian diagonal density may be active per call (h1 at {h1}, h2 at {h2})")]
    ConflictingHessianDensities { h1: usize, h2: usize },

    #[error("time-point {timepoint} is selected for more than one special density")]
    OverlappingSelector { timepoint: usize },

    #[error(
        "Hessian diagonal undefined at time-point {timepoint}: variance * variance'' - 2 * variance'^2 = {curvature:e}"
    )]
    DegenerateHessianDiagonal { timepoint: usize, curvature: f64 },

    #[error(
        "ruin factor range too small: last bucket at time-point {timepoint} has ruin probability {probability}, increase rf_max"
    )]
    InsufficientRange { timepoint: usize, probability: f64 },

    #[error(
        "ruin probability decreases at time-point {timepoint}, bucket {bucket}: {previous} > {current}"
    )]
    NonMonotoneBuckets {
        timepoint: usize,
        bucket: usize,
        previous: f64,
        current: f64,
    },

    #[error("ruin probability {probability} out of bounds at time-point {timepoint}, bucket {bucket}")]
    ProbabilityOutOfBounds {
        timepoint: usize,
        bucket: usize,
        probability: f64,
    },

    #[error("cannot split {units} units of work across {workers} workers")]
    WorkerPartition { units: usize, workers: usize },

    #[error(
        "gradient climb stalled after {reductions} step reductions; the path may sit on a non-stationary boundary or the estimate is too imprecise"
    )]
    ClimbStalled { reductions: u32 },

    #[error("Hessian is singular; Newton step undefined")]
    SingularHessian,

    #[error("no convergence after {iterations} iterations (max effective gradient {max_gradient:e})")]
    NotConverged { iterations: u32, max_gradient: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type GlideResult<T> = Result<T, GlidePathError>;

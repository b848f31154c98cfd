pub mod density;
mod derivatives;
mod dynamic_programming;
mod engine;
mod error;
mod monte_carlo;
mod optimizer;
pub mod returns;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use density::{DensityKind, DensitySelector, ReweightedDensity};
pub use derivatives::{build_gradient, build_hessian};
pub use engine::Engine;
pub use error::{GlidePathError, GlideResult};
pub use optimizer::{evaluate, optimize, validate_config};
pub use returns::{Moments, lower_bound, min_variance_allocation};
pub use types::{
    ALLOCATION_EPSILON, Algorithm, ConcavityReport, DpSettings, Estimate, Estimation, Evaluation,
    GlidePath, Gradient, IterationRecord, ModelParameters, OptimizeResult, RunConfig,
    SimulationSettings, StepKind,
};

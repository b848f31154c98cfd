//! Fixtures shared by unit tests across the core.

use super::types::{
    Algorithm, DpSettings, Estimation, ModelParameters, RunConfig, SimulationSettings,
};

pub(crate) fn scenario_params() -> ModelParameters {
    ModelParameters {
        stock_mean: 0.082509,
        stock_variance: 0.0402696529,
        bond_mean: 0.021409,
        bond_variance: 0.0069605649,
        covariance: 0.0007344180,
        expense_ratio: 0.0,
    }
}

pub(crate) fn small_dp_config(horizon: usize, withdrawal_rate: f64) -> RunConfig {
    RunConfig {
        parameters: scenario_params(),
        horizon,
        withdrawal_rate,
        convergence_threshold: 1e-6,
        algorithm: Algorithm::NewtonRaphson,
        estimation: Estimation::DynamicProgramming(DpSettings {
            precision: 40,
            rf_max: 3.0,
        }),
        workers: 2,
        max_iterations: 50,
    }
}

pub(crate) fn small_simulation_config(horizon: usize, withdrawal_rate: f64) -> RunConfig {
    RunConfig {
        estimation: Estimation::Simulation(SimulationSettings {
            sample_size: 20_000,
            significance: [0.05, 0.05],
            seed: 11,
            climb_resample_multiplier: 2,
            final_resample_multiplier: 4,
        }),
        algorithm: Algorithm::GradientAscent,
        ..small_dp_config(horizon, withdrawal_rate)
    }
}

pub(crate) fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol,
        "expected {expected}, got {actual}, tolerance {tol}"
    );
}

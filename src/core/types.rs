use serde::Serialize;

/// Lower feasibility margin above the minimum-variance allocation.
pub const ALLOCATION_EPSILON: f64 = 1e-4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Algorithm {
    GradientAscent,
    NewtonRaphson,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Estimation {
    DynamicProgramming(DpSettings),
    Simulation(SimulationSettings),
}

impl Estimation {
    pub fn is_stochastic(&self) -> bool {
        matches!(self, Estimation::Simulation(_))
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DpSettings {
    /// Buckets per unit of ruin factor.
    pub precision: u32,
    /// Largest ruin factor represented on the bucket axis.
    pub rf_max: f64,
}

impl DpSettings {
    pub fn bucket_count(&self) -> usize {
        (self.rf_max * self.precision as f64).round() as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimulationSettings {
    pub sample_size: u64,
    /// `[acceptance, gradient noise]` significance levels.
    pub significance: [f64; 2],
    pub seed: u64,
    pub climb_resample_multiplier: u64,
    pub final_resample_multiplier: u64,
}

/// Stock/bond return moments for one run. Means are real arithmetic returns.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ModelParameters {
    pub stock_mean: f64,
    pub stock_variance: f64,
    pub bond_mean: f64,
    pub bond_variance: f64,
    pub covariance: f64,
    pub expense_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub parameters: ModelParameters,
    pub horizon: usize,
    pub withdrawal_rate: f64,
    pub convergence_threshold: f64,
    pub algorithm: Algorithm,
    pub estimation: Estimation,
    pub workers: usize,
    pub max_iterations: u32,
}

/// Equity fraction per time-point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct GlidePath(Vec<f64>);

impl GlidePath {
    pub fn new(allocations: Vec<f64>) -> Self {
        Self(allocations)
    }

    pub fn constant(horizon: usize, allocation: f64) -> Self {
        Self(vec![allocation; horizon])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, index: usize) -> f64 {
        self.0[index]
    }

    pub fn set(&mut self, index: usize, allocation: f64) {
        self.0[index] = allocation;
    }

    /// Copy with every entry forced into `[lower, 1]`.
    pub fn clamped(&self, lower: f64) -> Self {
        Self(self.0.iter().map(|a| a.clamp(lower, 1.0)).collect())
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

/// One probability estimate plus the sample size behind it (zero when exact).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Estimate {
    pub probability: f64,
    pub samples: u64,
}

impl Estimate {
    pub fn exact(probability: f64) -> Self {
        Self {
            probability,
            samples: 0,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.samples == 0
    }
}

#[derive(Debug, Clone)]
pub struct Gradient {
    pub baseline: Estimate,
    /// Unfiltered `k (P_g - P)` per time-point.
    pub raw: Vec<f64>,
    /// `raw` with statistically insignificant entries zeroed.
    pub components: Vec<f64>,
    pub effective: Vec<f64>,
    /// Scaling constant `k` per time-point.
    pub scales: Vec<f64>,
    pub zeroed: usize,
}

impl Gradient {
    pub fn max_effective(&self) -> f64 {
        self.effective.iter().fold(0.0_f64, |acc, g| acc.max(g.abs()))
    }

    pub fn max_component(&self) -> f64 {
        self.components.iter().fold(0.0_f64, |acc, g| acc.max(g.abs()))
    }
}

/// Result of evaluating one glide-path without optimizing it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub success_probability: f64,
    pub samples: u64,
    pub glide_path: GlidePath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradient: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_effective_gradient: Option<f64>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    InitialClimb,
    Climb,
    Newton,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    pub step: StepKind,
    /// Path after this iteration's step.
    pub glide_path: GlidePath,
    pub probability: f64,
    pub max_effective_gradient: f64,
    pub accepted_moves: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcavityReport {
    pub min_eigenvalue: f64,
    pub max_eigenvalue: f64,
    pub is_local_maximum: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeResult {
    pub success_probability: f64,
    pub glide_path: GlidePath,
    pub max_effective_gradient: f64,
    pub iterations: Vec<IterationRecord>,
    pub concavity: ConcavityReport,
}

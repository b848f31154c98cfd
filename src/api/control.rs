use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::core::{
    Algorithm, DpSettings, Estimation, GlidePath, ModelParameters, RunConfig, SimulationSettings,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize, ValueEnum)]
pub enum AlgorithmChoice {
    #[serde(rename = "gradient")]
    #[value(name = "gradient")]
    Gradient,
    #[serde(rename = "nr")]
    #[value(name = "nr")]
    NewtonRaphson,
}

impl From<AlgorithmChoice> for Algorithm {
    fn from(value: AlgorithmChoice) -> Self {
        match value {
            AlgorithmChoice::Gradient => Algorithm::GradientAscent,
            AlgorithmChoice::NewtonRaphson => Algorithm::NewtonRaphson,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EstimationChoice {
    Dp,
    Simulation,
}

/// Run settings as read from a JSON control file or HTTP body.
///
/// Every field is optional on input; missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlFile {
    pub stock_mean: f64,
    pub stock_variance: f64,
    pub bond_mean: f64,
    pub bond_variance: f64,
    pub covariance: f64,
    pub expense_ratio: f64,

    pub horizon: usize,
    pub withdrawal_rate: f64,
    pub convergence_threshold: f64,
    pub algorithm: AlgorithmChoice,
    pub estimation: EstimationChoice,
    pub max_iterations: u32,
    pub workers: Option<usize>,

    pub precision: u32,
    pub rf_max: f64,

    pub sample_size: u64,
    pub significance: [f64; 2],
    pub seed: u64,
    pub climb_resample_multiplier: u64,
    pub final_resample_multiplier: u64,

    pub glide_path: Option<Vec<f64>>,
}

impl Default for ControlFile {
    fn default() -> Self {
        Self {
            stock_mean: 0.082509,
            stock_variance: 0.0402696529,
            bond_mean: 0.021409,
            bond_variance: 0.0069605649,
            covariance: 0.0007344180,
            expense_ratio: 0.0,
            horizon: 20,
            withdrawal_rate: 0.05,
            convergence_threshold: 1e-5,
            algorithm: AlgorithmChoice::NewtonRaphson,
            estimation: EstimationChoice::Dp,
            max_iterations: 200,
            workers: None,
            precision: 500,
            rf_max: 2.75,
            sample_size: 1_000_000,
            significance: [0.05, 0.05],
            seed: 42,
            climb_resample_multiplier: 2,
            final_resample_multiplier: 4,
            glide_path: None,
        }
    }
}

/// Command-line overrides applied on top of the control file.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// JSON control file; omitted fields use built-in defaults
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    /// One allocation per line; `#` starts a comment
    #[arg(long)]
    pub glide_path: Option<std::path::PathBuf>,
    /// Write the JSON report here instead of stdout
    #[arg(long)]
    pub output: Option<std::path::PathBuf>,

    #[arg(long)]
    pub horizon: Option<usize>,
    #[arg(long)]
    pub withdrawal_rate: Option<f64>,
    #[arg(long)]
    pub threshold: Option<f64>,
    #[arg(long, value_enum)]
    pub algorithm: Option<AlgorithmChoice>,
    #[arg(long, value_enum)]
    pub estimation: Option<EstimationChoice>,
    #[arg(long)]
    pub max_iterations: Option<u32>,
    #[arg(long, help = "Worker threads; defaults to the logical core count, at least 2")]
    pub workers: Option<usize>,
    #[arg(long, help = "Dynamic-programming buckets per unit of ruin factor")]
    pub precision: Option<u32>,
    #[arg(long)]
    pub rf_max: Option<f64>,
    #[arg(long, help = "Monte Carlo trials per estimate")]
    pub sample_size: Option<u64>,
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ControlFile {
    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Invalid control file: {e}"))
    }

    pub fn apply(&mut self, args: &RunArgs) {
        if let Some(v) = args.horizon {
            self.horizon = v;
        }
        if let Some(v) = args.withdrawal_rate {
            self.withdrawal_rate = v;
        }
        if let Some(v) = args.threshold {
            self.convergence_threshold = v;
        }
        if let Some(v) = args.algorithm {
            self.algorithm = v;
        }
        if let Some(v) = args.estimation {
            self.estimation = v;
        }
        if let Some(v) = args.max_iterations {
            self.max_iterations = v;
        }
        if let Some(v) = args.workers {
            self.workers = Some(v);
        }
        if let Some(v) = args.precision {
            self.precision = v;
        }
        if let Some(v) = args.rf_max {
            self.rf_max = v;
        }
        if let Some(v) = args.sample_size {
            self.sample_size = v;
        }
        if let Some(v) = args.seed {
            self.seed = v;
        }
    }

    /// Validated core configuration.
    pub fn build_config(&self) -> Result<RunConfig, String> {
        if self.horizon == 0 {
            return Err("horizon must be > 0".to_string());
        }
        if !self.withdrawal_rate.is_finite() || self.withdrawal_rate <= 0.0 {
            return Err("withdrawalRate must be > 0".to_string());
        }
        if !self.convergence_threshold.is_finite() || self.convergence_threshold <= 0.0 {
            return Err("convergenceThreshold must be > 0".to_string());
        }
        if self.max_iterations == 0 {
            return Err("maxIterations must be > 0".to_string());
        }
        if self.stock_variance <= 0.0 || self.bond_variance <= 0.0 {
            return Err("stockVariance and bondVariance must be > 0".to_string());
        }
        if !(0.0..1.0).contains(&self.expense_ratio) {
            return Err("expenseRatio must be in [0, 1)".to_string());
        }
        let workers = self.workers.unwrap_or_else(default_workers);
        if workers == 0 {
            return Err("workers must be > 0".to_string());
        }

        let estimation = match self.estimation {
            EstimationChoice::Dp => {
                if self.precision == 0 {
                    return Err("precision must be > 0".to_string());
                }
                if !self.rf_max.is_finite() || self.rf_max <= self.withdrawal_rate {
                    return Err("rfMax must be greater than withdrawalRate".to_string());
                }
                Estimation::DynamicProgramming(DpSettings {
                    precision: self.precision,
                    rf_max: self.rf_max,
                })
            }
            EstimationChoice::Simulation => {
                if self.sample_size < workers as u64 {
                    return Err(format!("sampleSize must be >= workers ({workers})"));
                }
                if self.significance.iter().any(|s| !(*s > 0.0 && *s < 1.0)) {
                    return Err("significance levels must be between 0 and 1".to_string());
                }
                if self.climb_resample_multiplier == 0 || self.final_resample_multiplier == 0 {
                    return Err("resample multipliers must be > 0".to_string());
                }
                Estimation::Simulation(SimulationSettings {
                    sample_size: self.sample_size,
                    significance: self.significance,
                    seed: self.seed,
                    climb_resample_multiplier: self.climb_resample_multiplier,
                    final_resample_multiplier: self.final_resample_multiplier,
                })
            }
        };

        Ok(RunConfig {
            parameters: ModelParameters {
                stock_mean: self.stock_mean,
                stock_variance: self.stock_variance,
                bond_mean: self.bond_mean,
                bond_variance: self.bond_variance,
                covariance: self.covariance,
                expense_ratio: self.expense_ratio,
            },
            horizon: self.horizon,
            withdrawal_rate: self.withdrawal_rate,
            convergence_threshold: self.convergence_threshold,
            algorithm: self.algorithm.into(),
            estimation,
            workers,
            max_iterations: self.max_iterations,
        })
    }

    /// Starting glide-path: the supplied one, else a constant 0.5 allocation.
    pub fn initial_path(&self) -> Result<GlidePath, String> {
        match &self.glide_path {
            Some(path) if path.len() != self.horizon => Err(format!(
                "glidePath has {} entries, horizon is {}",
                path.len(),
                self.horizon
            )),
            Some(path) => Ok(GlidePath::new(path.clone())),
            None => Ok(GlidePath::constant(self.horizon, 0.5)),
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

/// Parses one allocation per non-empty line; `#` starts a comment.
pub fn parse_glide_path(text: &str) -> Result<Vec<f64>, String> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let content = line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let value = content
            .parse::<f64>()
            .map_err(|e| format!("glide path line {}: {e}", idx + 1))?;
        if !value.is_finite() {
            return Err(format!("glide path line {}: value must be finite", idx + 1));
        }
        out.push(value);
    }
    if out.is_empty() {
        return Err("glide path file has no allocations".to_string());
    }
    Ok(out)
}

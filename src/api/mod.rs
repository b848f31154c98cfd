mod control;
mod server;

use std::fs;
use std::path::Path;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

pub use control::{
    AlgorithmChoice, ControlFile, EstimationChoice, RunArgs, default_workers, parse_glide_path,
};
pub use server::run_http_server;

use crate::core::{Evaluation, GlidePath, OptimizeResult, evaluate, optimize};

#[derive(Parser, Debug)]
#[command(
    name = "glidepath",
    about = "Retirement glide-path optimizer (probability of never depleting the portfolio)"
)]
pub struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Optimize a glide-path and report it with its success probability
    Optimize(RunArgs),
    /// Success probability of a glide-path without optimizing it
    Evaluate {
        #[command(flatten)]
        run: RunArgs,
        /// Also report the gradient and its effective magnitude
        #[arg(long)]
        gradient: bool,
    },
    /// Serve the JSON API
    Serve {
        #[arg(default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeReport {
    pub horizon: usize,
    pub withdrawal_rate: f64,
    pub algorithm: AlgorithmChoice,
    pub estimation: EstimationChoice,
    #[serde(flatten)]
    pub result: OptimizeResult,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateReport {
    pub horizon: usize,
    pub withdrawal_rate: f64,
    pub estimation: EstimationChoice,
    #[serde(flatten)]
    pub evaluation: Evaluation,
}

/// Loads the control file (if any), applies CLI overrides and the glide-path file.
pub fn load_control(args: &RunArgs) -> Result<ControlFile, String> {
    let mut control = match &args.config {
        Some(path) => ControlFile::from_json(&read_file(path)?)?,
        None => ControlFile::default(),
    };
    control.apply(args);
    if let Some(path) = &args.glide_path {
        control.glide_path = Some(parse_glide_path(&read_file(path)?)?);
    }
    Ok(control)
}

fn read_file(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))
}

pub fn run_optimize(control: &ControlFile) -> Result<OptimizeReport, String> {
    let config = control.build_config()?;
    let initial = control.initial_path()?;
    info!(
        horizon = config.horizon,
        withdrawal_rate = config.withdrawal_rate,
        workers = config.workers,
        "optimizing glide path"
    );
    let result = optimize(&config, &initial).map_err(|e| e.to_string())?;
    Ok(OptimizeReport {
        horizon: control.horizon,
        withdrawal_rate: control.withdrawal_rate,
        algorithm: control.algorithm,
        estimation: control.estimation,
        result,
    })
}

pub fn run_evaluate(control: &ControlFile, with_gradient: bool) -> Result<EvaluateReport, String> {
    let config = control.build_config()?;
    let path: GlidePath = control.initial_path()?;
    let evaluation = evaluate(&config, &path, with_gradient).map_err(|e| e.to_string())?;
    Ok(EvaluateReport {
        horizon: control.horizon,
        withdrawal_rate: control.withdrawal_rate,
        estimation: control.estimation,
        evaluation,
    })
}

/// Pretty JSON to `output`, or stdout when absent.
pub fn write_report<T: Serialize>(report: &T, output: Option<&Path>) -> Result<(), String> {
    let json = serde_json::to_string_pretty(report).map_err(|e| format!("cannot encode report: {e}"))?;
    match output {
        Some(path) => fs::write(path, json + "\n")
            .map_err(|e| format!("cannot write {}: {e}", path.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

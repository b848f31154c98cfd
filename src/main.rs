use clap::Parser;
use tracing::error;

use glidepath::api::{Cli, Command, load_control, run_evaluate, run_http_server, run_optimize, write_report};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let outcome = match cli.command {
        Command::Optimize(args) => load_control(&args)
            .and_then(|control| run_optimize(&control))
            .and_then(|report| write_report(&report, args.output.as_deref())),
        Command::Evaluate { run, gradient } => load_control(&run)
            .and_then(|control| run_evaluate(&control, gradient))
            .and_then(|report| write_report(&report, run.output.as_deref())),
        Command::Serve { port } => run_http_server(port)
            .await
            .map_err(|e| format!("server error: {e}")),
    };

    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
}

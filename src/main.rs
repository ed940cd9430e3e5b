use anyhow::Result;
use clap::Parser;
use py2blocks_core::cli::Args;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;

fn main() -> Result<ExitCode> {
    // stdout may carry the JSON document.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "py2blocks_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    Ok(py2blocks_core::run_cli(&args)?.exit_code())
}

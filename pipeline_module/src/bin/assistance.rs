//! `assistance` command line.
//!
//! - `serve` runs the inbound webhook service
//! - `rerun [digest]` replays pending emails without notifying operators

use std::env;
use std::process::exit;
use std::sync::Arc;

use pipeline_module::service::{run_server, BoxError, ServiceConfig};
use pipeline_module::{Pipeline, ServiceContext};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!(
        r##"Usage: assistance <command> [arguments]

Commands:
  serve              Receive inbound emails over HTTP and process them
  rerun [digest]     Replay one pending email, or every pending email
  help               Show this message

Configuration is read from the environment (and a .env file if present)."##
    );
}

async fn cmd_serve() -> Result<(), BoxError> {
    let config = ServiceConfig::from_env()?;
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", err);
        }
        info!("shutdown requested");
    };
    run_server(config, shutdown).await
}

async fn cmd_rerun(digest: Option<&str>) -> Result<(), BoxError> {
    let config = ServiceConfig::from_env()?;
    let context = Arc::new(ServiceContext::open(&config)?);
    let pipeline = Pipeline::from_config(&config, context.clone());
    let result = pipeline.rerun(digest).await;
    context.close();
    let report = result?;
    println!(
        "completed: {}, failed: {}, skipped: {}",
        report.completed, report.failed, report.skipped
    );
    if report.has_failures() {
        return Err(format!("{} email(s) failed to replay and are still pending", report.failed).into());
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        exit(1);
    }

    let result = match args[1].as_str() {
        "serve" => cmd_serve().await,
        "rerun" => cmd_rerun(args.get(2).map(String::as_str)).await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            exit(1);
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {}", err);
        exit(1);
    }
}

//! CLI entry point for the video converter
//!
//! Loads configuration, runs startup checks and feeds task payloads to the
//! worker, either from `--payload` arguments or as JSON lines on stdin.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use video_converter::{run_startup_checks, Config, ConversionPipeline, Worker};

/// Video converter - reassemble uploaded chunks and package them as MPEG-DASH
#[derive(Parser, Debug)]
#[command(name = "video-converter")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Task payload, e.g. '{"video_id": 1, "path": "/media/uploads/1"}'.
    /// May be repeated. Without it, payloads are read line by line from stdin.
    #[arg(short, long)]
    payload: Vec<String>,

    /// Skip startup checks (encoder availability). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    info!(config = %args.config.display(), "video converter starting");

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else {
        match run_startup_checks(&config) {
            Ok(version) => info!(encoder = %config.encoder.binary, %version, "encoder available"),
            Err(e) => {
                error!("Startup check failed: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let worker = Worker::new(ConversionPipeline::from_config(config));
    let sender = worker.job_sender();

    let producer = if args.payload.is_empty() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if sender.send(line.as_bytes().to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read payload from stdin: {}", e);
                        break;
                    }
                }
            }
        })
    } else {
        let payloads = args.payload;
        tokio::spawn(async move {
            for payload in payloads {
                if sender.send(payload.into_bytes()).await.is_err() {
                    break;
                }
            }
        })
    };

    let stats = worker.run().await;
    let _ = producer.await;

    if stats.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

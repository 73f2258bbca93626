//! preroll — continuous pre-roll recorder for RTSP cameras
//!
//! Usage:
//!   preroll run   --config preroll.conf
//!   preroll check --config preroll.conf

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use preroll::config::{Config, TriggerMode};
use preroll::manager::{Orchestrator, EXIT_CONFIG};

#[derive(Parser)]
#[command(name = "preroll", about = "Continuous pre-roll recorder for RTSP cameras", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record all configured cameras and serve clip triggers.
    Run {
        #[arg(short, long, default_value = "preroll.conf")]
        config: PathBuf,
    },
    /// Validate the configuration and print a summary.
    Check {
        #[arg(short, long, default_value = "preroll.conf")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Run { config } => run_record(config).await,
        Command::Check { config } => match run_check(&config) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e:#}");
                EXIT_CONFIG
            }
        },
    };
    std::process::exit(code);
}

async fn run_record(config_path: PathBuf) -> i32 {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            return EXIT_CONFIG;
        }
    };

    let orchestrator = match Orchestrator::start(cfg) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "Failed to start recorder");
            return EXIT_CONFIG;
        }
    };

    orchestrator.run().await
}

fn run_check(config_path: &PathBuf) -> anyhow::Result<()> {
    let cfg = Config::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    println!("=== preroll configuration ===");
    println!("Cameras        : {}", cfg.cameras.len());
    for cam in &cfg.cameras {
        println!("  {} — {}", cam.id, cam.url);
    }
    println!("Chunk duration : {} s", cfg.chunk_duration);
    println!("Buffer window  : {} s", cfg.buffer_seconds);
    println!("Clip duration  : {} s", cfg.final_clip_duration);
    println!("Temp dir       : {}", cfg.temp_dir.display());
    println!("Clips dir      : {}", cfg.clips_dir.display());
    println!(
        "Trigger        : {}",
        match cfg.trigger_mode {
            TriggerMode::Keyboard => "keyboard".to_string(),
            TriggerMode::Http => format!("http (port {})", cfg.http_port),
        }
    );
    println!("Transport      : {}", cfg.rtsp_transport.as_flag());
    println!("Configuration OK");
    Ok(())
}

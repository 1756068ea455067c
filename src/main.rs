//! CLI entry point for seatrack.
//!
//! ```bash
//! seatrack live                        # record until Ctrl-C
//! seatrack replay 0                    # replay the newest stored track
//! seatrack replay 20240601-100000.json
//! seatrack tracks                      # list stored tracks
//! seatrack check-config --config /etc/seatrack.toml
//! ```
//!
//! While recording, `SIGHUP` reloads the configuration file.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use seatrack::catalog::{TrackCatalog, TrackSelector};
use seatrack::config::{Settings, DEFAULT_CONFIG_PATH};
use seatrack::logging;
use seatrack::recorder::Recorder;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "seatrack")]
#[command(about = "Headless telemetry recorder for remote sensor units", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record from the configured transports until Ctrl-C
    Live,

    /// Replay a stored track
    Replay {
        /// Index in `seatrack tracks` or file name
        track: String,
    },

    /// List stored tracks, newest first
    Tracks,

    /// Validate the configuration and print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Live => {
            logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
            run_live(settings, &cli.config).await
        }
        Commands::Replay { track } => {
            logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;
            run_replay(settings, &cli.config, &track).await
        }
        Commands::Tracks => list_tracks(&settings),
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn run_live(settings: Settings, config_path: &Path) -> Result<()> {
    let mut recorder = Recorder::new(settings)?;
    let track = recorder.start_live()?;
    info!(track = %track.id(), "recording, press Ctrl-C to stop");

    wait_for_shutdown(&mut recorder, config_path, false).await?;
    finish(&mut recorder).await
}

async fn run_replay(settings: Settings, config_path: &Path, selector: &str) -> Result<()> {
    let mut recorder = Recorder::new(settings)?;
    let selector: TrackSelector = selector.parse()?;
    let track = recorder.start_replay_selected(&selector)?;
    info!(track = %track.id(), "replaying, press Ctrl-C to stop");

    wait_for_shutdown(&mut recorder, config_path, true).await?;
    finish(&mut recorder).await
}

/// Block until Ctrl-C (or the end of a replay), reloading the configuration on
/// `SIGHUP`.
async fn wait_for_shutdown(
    recorder: &mut Recorder,
    config_path: &Path,
    until_replay_done: bool,
) -> Result<()> {
    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut poll = tokio::time::interval(Duration::from_secs(1));

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutdown requested");
                return Ok(());
            }
            _ = reload => {
                if let Err(e) = recorder.reload_from(config_path).await {
                    error!(error = %e, "configuration reload rejected");
                }
            }
            _ = poll.tick() => {
                if until_replay_done {
                    if let Some((fed, total)) = recorder.status().replay {
                        if fed >= total {
                            info!(records = total, "replay complete");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

async fn finish(recorder: &mut Recorder) -> Result<()> {
    let report = recorder.stop().await?;
    match report.archive {
        Some(path) => println!(
            "Track {} archived to {} ({} records)",
            report.track.id,
            path.display(),
            report.track.total
        ),
        None => println!("Track {} was empty, nothing archived", report.track.id),
    }
    Ok(())
}

fn list_tracks(settings: &Settings) -> Result<()> {
    let tracks = TrackCatalog::from_settings(settings).scan()?;
    if tracks.is_empty() {
        println!("No tracks in {}", settings.files.output_dir.display());
        return Ok(());
    }
    println!(
        "{:>3}  {:<40} {:<20} {:>9} {:>7}  units",
        "#", "file", "start", "duration", "points"
    );
    for (i, track) in tracks.iter().enumerate() {
        let start = track
            .datetime
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let marker = if track.checkpoint { " (checkpoint)" } else { "" };
        println!(
            "{:>3}  {:<40} {:<20} {:>8.0}s {:>7}  {}{}",
            i,
            track.filename,
            start,
            track.duration,
            track.datapoint_count,
            track.remote_units.join(", "),
            marker
        );
    }
    Ok(())
}

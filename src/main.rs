//! CLI entry point for the microscope console.
//!
//! Runs the live-mode acquisition controller against the simulated camera,
//! so the streaming path can be exercised end to end without hardware:
//!
//! ```bash
//! scope_console live --seconds 5
//! scope_console snap --display
//! ```

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use scope_console::config::Settings;
use scope_console::data::PassthroughPipelineFactory;
use scope_console::device::MockDeviceCore;
use scope_console::display::HeadlessDisplayFactory;
use scope_console::live::LiveHandle;
use scope_console::tracing_setup;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "scope_console")]
#[command(about = "Laboratory microscope console with live-mode acquisition", long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream the simulated camera into the preview for a while.
    Live {
        /// How long to stream, in seconds.
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },

    /// Acquire a single image per channel.
    Snap {
        /// Route the snapped images into the preview display.
        #[arg(long)]
        display: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    settings.validate().map_err(|msg| anyhow!(msg))?;
    tracing_setup::init_from_settings(&settings).map_err(|msg| anyhow!(msg))?;

    let device = Arc::new(
        MockDeviceCore::builder()
            .camera_name(&settings.camera.name)
            .channels(settings.camera.channels)
            .resolution(settings.camera.width, settings.camera.height)
            .exposure_ms(settings.camera.exposure_ms)
            .config_name(&settings.camera.config_name)
            .stream_frames(true)
            .build(),
    );
    let displays = Arc::new(HeadlessDisplayFactory::new(Duration::from_millis(
        settings.display.render_time_ms,
    )));
    let live = LiveHandle::spawn(device, displays, Arc::new(PassthroughPipelineFactory));

    match cli.command {
        Commands::Live { seconds } => run_live(&live, seconds).await,
        Commands::Snap { display } => run_snap(&live, display).await,
    }
}

async fn run_live(live: &LiveHandle, seconds: u64) -> Result<()> {
    let mut events = live.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(is_on = event.is_on, "live mode changed");
        }
    });

    live.set_live_mode(true).await?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    // Grab the cached per-channel images before stopping.
    let images = live.snap(false).await?;
    live.set_live_mode(false).await?;
    live.shutdown().await?;

    for image in &images {
        info!(
            channel = image.coords.channel,
            width = image.frame.width,
            height = image.frame.height,
            mean = format!("{:.1}", image.frame.mean()),
            "last live image"
        );
    }
    info!(channels = images.len(), "live run finished");
    Ok(())
}

async fn run_snap(live: &LiveHandle, display: bool) -> Result<()> {
    let images = live.snap(display).await?;
    for image in &images {
        info!(
            channel = image.coords.channel,
            width = image.frame.width,
            height = image.frame.height,
            mean = format!("{:.1}", image.frame.mean()),
            "snapped image"
        );
    }
    live.shutdown().await?;
    Ok(())
}

//! `pinboard` command line.
//!
//! Loads a JSON device file and either validates it or runs every device
//! against a simulated daemon host, polling until interrupted.
//!
//! ```bash
//! pinboard check devices.json
//! RUST_LOG=debug pinboard run devices.json --period 0.25
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use pinboard_core::constants::{TRIGGER_DEVICE_ERROR, TRIGGER_LIMIT_FAULT};
use pinboard_daemon::mock::MockDaemon;
use pinboard_devices::{
    Context, DeviceFile, LogReporter, PollScheduler, TriggerDispatcher, TriggerFilter,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pinboard")]
#[command(about = "GPIO, I2C, and SPI device manager", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a device file and list its devices
    Check {
        /// Path to the JSON device file
        file: PathBuf,
    },

    /// Start every device and poll until Ctrl-C
    Run {
        /// Path to the JSON device file
        file: PathBuf,

        /// Poll period in seconds; overrides the file
        #[arg(long)]
        period: Option<f64>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Host model reported by the simulated daemon
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Check { file } => check(&file),
        Commands::Run {
            file,
            period,
            duration,
            model,
        } => run(&file, period, duration, model).await,
    }
}

fn load(file: &Path) -> Result<DeviceFile> {
    DeviceFile::load(file).with_context(|| format!("loading {}", file.display()))
}

fn check(file: &Path) -> Result<()> {
    let devices = load(file)?;
    println!(
        "{}: {} devices, poll period {:.3}s",
        file.display(),
        devices.devices.len(),
        devices.context.poll_period().as_secs_f64()
    );
    for device in &devices.devices {
        let master = device
            .relay_master()
            .map(|master| format!(" (interrupts via {master})"))
            .unwrap_or_default();
        println!(
            "  {:<16} {:<8} {}{}",
            device.id,
            device.kind.type_name(),
            device.display_name(),
            master
        );
    }
    Ok(())
}

async fn run(
    file: &Path,
    period: Option<f64>,
    duration: Option<f64>,
    model: Option<String>,
) -> Result<()> {
    let devices = load(file)?;
    let period = match period {
        Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        Some(secs) => bail!("poll period must be positive, got {secs}"),
        None => devices.context.poll_period(),
    };

    let daemon = MockDaemon::new();
    if let Some(model) = &model {
        daemon.set_model(Some(model.as_str()));
    }

    let ctx = Context::open(
        devices.context.clone(),
        Arc::new(daemon.clone()),
        Arc::new(LogReporter),
    );
    log_triggers(ctx.triggers());

    ctx.configure_all(devices.devices)?;
    let running = ctx.start_all();
    info!(
        "{} of {} devices running",
        running,
        ctx.device_ids().len()
    );

    let scheduler = PollScheduler::spawn(Arc::clone(&ctx), period);
    match duration {
        Some(secs) if secs.is_finite() && secs >= 0.0 => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {}
                result = signal::ctrl_c() => result?,
            }
        }
        Some(secs) => bail!("duration must be non-negative, got {secs}"),
        None => signal::ctrl_c().await?,
    }

    info!("Shutting down after {} poll passes", scheduler.passes());
    scheduler.shutdown().await;
    tokio::task::spawn_blocking(move || ctx.close()).await?;
    if daemon.open_handles() > 0 {
        warn!("{} daemon handles still open", daemon.open_handles());
    }
    Ok(())
}

/// Log every device error and limit fault trigger.
fn log_triggers(triggers: &TriggerDispatcher) {
    for event_type in [TRIGGER_DEVICE_ERROR, TRIGGER_LIMIT_FAULT] {
        let mut events = triggers.subscribe(TriggerFilter::any(event_type));
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                warn!(
                    "Trigger {}/{}: {}",
                    event.event_type, event.event_name, event.message
                );
            }
        });
    }
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the generator derating daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gdm_bus::{BusDirectory, InMemoryBus};
use gdm_common::config::{AppConfig, LoadedAppConfig};
use gdm_common::logging::init_tracing;
use gdm_core::{round_amps, ControlLoop, ControlLoopHandle, DeratingCalculator};
use tokio::signal;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/gdmd.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Generator derating monitor daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the control loop against the simulated bus")]
    Run,
    #[command(about = "Print the derated generator limit for the given conditions")]
    Derate {
        #[arg(long, value_name = "°F", help = "Outdoor temperature (defaults to the configured fallback)")]
        outdoor_f: Option<f64>,
        #[arg(long, value_name = "FT", help = "Altitude (defaults to the configured fallback)")]
        altitude_ft: Option<f64>,
        #[arg(long, value_name = "°F", help = "Generator temperature (defaults to the configured fallback)")]
        generator_f: Option<f64>,
    },
    #[command(about = "Print the effective configuration as TOML")]
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));
    let loaded = AppConfig::load_with_source(&candidates)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(loaded).await?,
        Commands::Derate {
            outdoor_f,
            altitude_ft,
            generator_f,
        } => {
            let defaults = &loaded.config.defaults;
            print_derating(
                &DeratingCalculator::new(loaded.config.derating.clone()),
                outdoor_f.unwrap_or(defaults.outdoor_temp_f),
                altitude_ft.unwrap_or(defaults.altitude_ft),
                generator_f.unwrap_or(defaults.generator_temp_f),
            );
        }
        Commands::Config => {
            print!("{}", loaded.config.to_toml()?);
        }
    }

    Ok(())
}

async fn run_daemon(loaded: LoadedAppConfig) -> Result<()> {
    let LoadedAppConfig { config, source } = loaded;
    init_tracing("gdmd", &config.logging).context("failed to initialise logging")?;
    match &source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using built-in defaults"),
    }

    if config.simulation.services.is_empty() {
        warn!("simulated bus has no services; every role will stay unresolved");
    }
    let bus = Arc::new(InMemoryBus::from_services(
        config.simulation.services.clone(),
    ));
    let directory = Arc::new(BusDirectory::new(bus.clone(), config.discovery.clone()));
    let control = ControlLoop::new(&config, directory, bus);

    info!(
        poll_interval_s = config.control.poll_interval.as_secs_f64(),
        startup_delay_s = config.control.startup_delay.as_secs_f64(),
        settings_service = %config.bus.settings_service,
        "daemon running; waiting for termination signal"
    );
    let handle = ControlLoopHandle::spawn(control);

    signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await;
    Ok(())
}

fn print_derating(
    calculator: &DeratingCalculator,
    outdoor_f: f64,
    altitude_ft: f64,
    generator_f: f64,
) {
    let breakdown = calculator.breakdown(outdoor_f, altitude_ft, generator_f);
    let output = calculator.calculate(outdoor_f, altitude_ft, generator_f);
    println!("Outdoor: {outdoor_f:.1} °F  Altitude: {altitude_ft:.0} ft  Generator: {generator_f:.1} °F");
    println!("Temperature multiplier: {:.4}", breakdown.temperature);
    println!("Altitude multiplier:    {:.4}", breakdown.altitude);
    println!("Generator multiplier:   {:.4}", breakdown.generator_temperature);
    println!("Output buffer:          {:.4}", breakdown.buffer);
    println!("Combined factor:        {:.4}", breakdown.combined());
    println!(
        "Derated output: {output:.4} A (applied as {:.1} A)",
        round_amps(output)
    );
}

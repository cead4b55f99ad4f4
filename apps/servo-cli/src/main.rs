use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use serial_transport::PortBackend;
use servo_bus::{BusConfig, DeviceId, Outcome, ServoController, SimulatedServos};

#[derive(Parser, Debug)]
#[command(
    name = "servo",
    version,
    about = "Serial bus servo CLI",
    disable_help_subcommand = true
)]
struct Cli {
    /// Use simulated servos instead of a real port
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    /// Bus config YAML (defaults to a six-joint arm)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Serial port to open, overriding the config
    #[arg(long, global = true)]
    port: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Target {
    /// Servo id
    #[arg(long)]
    id: DeviceId,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports the backend can see
    Ports,
    /// Validate a config file and print it as JSON
    Validate,
    /// Connect, initialize every servo, print status, disconnect
    Probe,
    /// Step a joint or spin a wheel
    Move {
        #[command(flatten)]
        target: Target,
        /// Direction: 1 or -1
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        direction: i8,
        /// Fraction of a full step or of full wheel speed (0..=1)
        #[arg(long, default_value_t = 1.0)]
        magnitude: f32,
    },
    /// Send a joint to an absolute position
    Goto {
        #[command(flatten)]
        target: Target,
        /// Position in ticks (0..=4095)
        #[arg(long, conflicts_with = "fraction")]
        position: Option<i32>,
        /// Position as a fraction of travel (0..=1)
        #[arg(long)]
        fraction: Option<f32>,
    },
    /// Stop a wheel
    WheelStop {
        #[command(flatten)]
        target: Target,
    },
    /// Probe the bus and print prometheus metrics
    Metrics,
}

#[derive(Serialize)]
struct CommandReport<'a> {
    servo: DeviceId,
    command: &'a str,
    severity: String,
    message: Option<String>,
}

impl<'a> CommandReport<'a> {
    fn new(servo: DeviceId, command: &'a str, outcome: &Outcome) -> Self {
        Self {
            servo,
            command,
            severity: format!("{:?}", outcome.severity).to_lowercase(),
            message: outcome.message.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Ports => list_ports(cli.mock, &config),
        Commands::Validate => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Probe => {
            let ctl = open_controller(cli.mock, config).await?;
            print_status(&ctl)?;
            ctl.disconnect().await?;
            Ok(())
        }
        Commands::Move {
            target,
            direction,
            magnitude,
        } => {
            let ctl = open_controller(cli.mock, config).await?;
            let result = ctl.request_move(target.id, direction, magnitude)?.await;
            finish(&ctl, target.id, "move", result).await
        }
        Commands::Goto {
            target,
            position,
            fraction,
        } => {
            let ctl = open_controller(cli.mock, config).await?;
            let ticket = match (position, fraction) {
                (Some(p), _) => ctl.write_position(target.id, p)?,
                (None, Some(f)) => ctl.request_normalized_position(target.id, f)?,
                (None, None) => return Err(anyhow::anyhow!("provide --position or --fraction")),
            };
            let result = ticket.await;
            finish(&ctl, target.id, "goto", result).await
        }
        Commands::WheelStop { target } => {
            let ctl = open_controller(cli.mock, config).await?;
            let result = ctl.request_wheel_stop(target.id)?.await;
            finish(&ctl, target.id, "wheel-stop", result).await
        }
        Commands::Metrics => {
            let ctl = open_controller(cli.mock, config).await?;
            ctl.disconnect().await?;
            print!("{}", ctl.metrics().encode_text());
            Ok(())
        }
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> Result<BusConfig> {
    let mut config = match &cli.config {
        Some(path) => servo_bus::load_config_file(path)?,
        None => BusConfig::default(),
    };
    if cli.port.is_some() {
        config.port = cli.port.clone();
    }
    Ok(config)
}

fn backend(mock: bool, config: &BusConfig) -> Result<Arc<dyn PortBackend>> {
    if mock {
        let sim = SimulatedServos::new(config.device_ids());
        return Ok(Arc::new(sim.backend()));
    }
    native_backend()
}

#[cfg(feature = "serial")]
fn native_backend() -> Result<Arc<dyn PortBackend>> {
    Ok(Arc::new(serial_transport::NativeBackend))
}

#[cfg(not(feature = "serial"))]
fn native_backend() -> Result<Arc<dyn PortBackend>> {
    Err(anyhow::anyhow!(
        "native serial support not compiled in; rebuild with --features serial or pass --mock"
    ))
}

fn list_ports(mock: bool, config: &BusConfig) -> Result<()> {
    let backend = backend(mock, config)?;
    for port in backend.list().context("listing serial ports")? {
        let usb = if port.is_usb() { "\tusb" } else { "" };
        println!("{}\t{}{}", port.name, port.driver, usb);
    }
    Ok(())
}

async fn open_controller(mock: bool, config: BusConfig) -> Result<ServoController> {
    let backend = backend(mock, &config)?;
    let ctl = ServoController::new(config, backend).context("building servo controller")?;
    let mut alerts = ctl.subscribe_alerts();
    tokio::spawn(async move {
        while let Ok(alert) = alerts.recv().await {
            match alert.device {
                Some(id) => eprintln!("alert[{id}]: {}", alert.message),
                None => eprintln!("alert: {}", alert.message),
            }
        }
    });
    ctl.connect().await.context("connecting to servo bus")?;
    info!(port = ?ctl.config().port, "connected");
    Ok(ctl)
}

fn print_status(ctl: &ServoController) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&ctl.status())?);
    Ok(())
}

async fn finish(
    ctl: &ServoController,
    id: DeviceId,
    command: &str,
    result: servo_bus::Result<Outcome>,
) -> Result<()> {
    let report = match &result {
        Ok(outcome) => Some(CommandReport::new(id, command, outcome)),
        Err(e) => {
            warn!(servo = id, error = %e, "{command} failed");
            None
        }
    };
    if let Some(report) = report {
        println!("{}", serde_json::to_string(&report)?);
    }
    print_status(ctl)?;
    ctl.disconnect().await?;
    result.map(|_| ()).map_err(anyhow::Error::from)
}

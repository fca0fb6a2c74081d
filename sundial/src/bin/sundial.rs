use clap::Parser;
use std::{path::PathBuf, time::Duration};
use sundial::{
    actuator::{Actuator, PwmActuator},
    calibration::CalibrationSet,
    capture::{self, StdinObserver},
    config::Config,
    modbus::ModbusPowerSource,
    monitor::Monitor,
    shutdown::{self, Shutdown},
    Error, Result,
};
use humantime_serde::re::humantime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(
    name = "sundial",
    version,
    author,
    about = "Shows a solar inverter's output on an analog ammeter"
)]
struct Cli {
    /// JSON config file; built-in defaults are used without one
    #[clap(long, env = "SUNDIAL_CONFIG", value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Where the dial calibration is stored
    #[clap(long, env = "SUNDIAL_CALIBRATION", value_hint = clap::ValueHint::FilePath)]
    calibration: Option<PathBuf>,

    /// Record the dial's response interactively instead of monitoring
    #[clap(long)]
    calibrate: bool,

    /// Inverter host, reached over Modbus TCP
    #[clap(long, env = "SUNDIAL_HOST", value_hint = clap::ValueHint::Hostname)]
    host: Option<String>,

    /// Inverter output in watts that puts the needle at full scale
    #[clap(long, env = "SUNDIAL_MAX_POWER")]
    max_power: Option<u32>,

    /// Time between polls, e.g. "1s" or "500ms"
    #[clap(long, env = "SUNDIAL_INTERVAL", value_parser = parse_duration)]
    interval: Option<Duration>,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;

        if let Some(ref host) = self.host {
            config.source.set_host(host.clone())?;
        }
        if let Some(max_power) = self.max_power {
            config.max_power = max_power;
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(ref path) = self.calibration {
            config.calibration.path = path.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();
    let config = args.config()?;
    let shutdown = shutdown::ctrl_c();

    if args.calibrate {
        calibrate(&config, shutdown).await
    } else {
        monitor(&config, shutdown).await
    }
}

async fn monitor(config: &Config, shutdown: Shutdown) -> Result<()> {
    let calibration =
        CalibrationSet::load_or_default(&config.calibration.path, &config.calibration.levels)?;
    let actuator = PwmActuator::new(&config.pwm)?;
    let source = ModbusPowerSource::new(config.source.clone());

    Monitor::new(config.monitor(), calibration, source, actuator)
        .run(shutdown)
        .await
}

async fn calibrate(config: &Config, mut shutdown: Shutdown) -> Result<()> {
    let mut actuator = PwmActuator::new(&config.pwm)?;
    let mut operator = StdinObserver::new()?;

    println!("Watch the meter. At each step the output is held briefly, then enter where the");
    println!("needle points as a percentage of full scale. Ctrl-C or Ctrl-D abandons without saving.");

    let result = capture::capture(
        &config.calibration.levels,
        config.calibration.settle,
        &mut actuator,
        &mut operator,
        &mut shutdown,
    )
    .await;
    if let Err(error) = actuator.release() {
        warn!(%error, "Failed to release actuator");
    }

    match result {
        Ok(set) => {
            set.save(&config.calibration.path)?;
            println!();
            println!("{:>8}  {:>8}", "output", "dial");
            for point in set.points() {
                println!(
                    "{:>7}%  {:>7}%",
                    point.drive_percent, point.observed_percent
                );
            }
            info!(path = %config.calibration.path.display(), "Calibration saved");
            Ok(())
        }
        Err(Error::Cancelled) => {
            warn!("Calibration abandoned, nothing saved");
            Ok(())
        }
        Err(error) => Err(error),
    }
}

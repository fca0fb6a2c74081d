use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    modbus::{connection, Watts},
    Error,
};

/// Everything needed for a run, loaded once at startup and passed down.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Where the inverter's power reading comes from
    #[serde(default, alias = "inverter")]
    pub source: connection::Config,

    /// Inverter output, in watts, that should put the needle at full scale
    #[serde(default = "default_max_power")]
    pub max_power: u32,

    #[serde(
        with = "humantime_serde",
        default = "default_interval",
        alias = "period"
    )]
    pub interval: Duration,

    #[serde(default)]
    pub pwm: PwmConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PwmConfig {
    /// BCM GPIO number the ammeter is wired to
    #[serde(default = "default_pwm_pin")]
    pub pin: u8,

    /// Software PWM frequency in Hz
    #[serde(default = "default_pwm_frequency")]
    pub frequency: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_calibration_path")]
    pub path: PathBuf,

    /// Drive percentages sampled during calibration, which also form the identity default
    #[serde(default = "default_calibration_levels")]
    pub levels: Vec<f64>,

    /// How long the needle is given to come to rest at each level before asking for a reading
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,
}

/// The part of [`Config`] the monitor loop cares about
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MonitorConfig {
    pub max_power: u32,
    pub poll_interval: Duration,
}

impl MonitorConfig {
    /// Reading as a percentage of rated output. Deliberately unclamped; may be negative or above 100.
    pub fn power_percent(&self, watts: Watts) -> f64 {
        100.0 * watts as f64 / f64::from(self.max_power)
    }
}

impl Config {
    /// Read a config file, or take the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(path) => {
                let bytes = fs::read(path)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.max_power == 0 {
            return Err(Error::config("max_power must be greater than zero"));
        }
        if self.interval.is_zero() {
            return Err(Error::config("interval must be greater than zero"));
        }
        if !(self.pwm.frequency.is_finite() && self.pwm.frequency > 0.0) {
            return Err(Error::config("pwm frequency must be greater than zero"));
        }
        self.source.register.validate()?;

        let levels = &self.calibration.levels;
        if levels.len() < 2 {
            return Err(Error::config("at least two calibration levels are required"));
        }
        if levels.iter().any(|level| !(0.0..=100.0).contains(level)) {
            return Err(Error::config("calibration levels must be within 0-100"));
        }
        if levels.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(Error::config("calibration levels must be strictly increasing"));
        }

        Ok(())
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            max_power: self.max_power,
            poll_interval: self.interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: Default::default(),
            max_power: default_max_power(),
            interval: default_interval(),
            pwm: Default::default(),
            calibration: Default::default(),
        }
    }
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            pin: default_pwm_pin(),
            frequency: default_pwm_frequency(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            path: default_calibration_path(),
            levels: default_calibration_levels(),
            settle: default_settle(),
        }
    }
}

fn default_max_power() -> u32 {
    5760
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_pwm_pin() -> u8 {
    23
}

fn default_pwm_frequency() -> f64 {
    100.0
}

fn default_calibration_path() -> PathBuf {
    PathBuf::from("calibration.json")
}

fn default_calibration_levels() -> Vec<f64> {
    vec![0.0, 25.0, 50.0, 75.0, 100.0]
}

fn default_settle() -> Duration {
    Duration::from_secs(2)
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_empty_config_defaults() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({})).unwrap();

    assert_eq!(config.max_power, 5760);
    assert_eq!(config.interval, Duration::from_secs(1));
    assert_eq!(config.pwm, PwmConfig::default());
    assert_eq!(config.calibration, CalibrationConfig::default());
    assert!(config.validate().is_ok());
}

#[cfg(feature = "tcp")]
#[test]
fn parse_full_config() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "source": {
            "proto": "tcp",
            "host": "10.0.0.7",
            "port": 1502,
            "unit": 3,
            "timeout": "500ms",
            "register": { "address": 30775, "type": "s32" }
        },
        "max_power": 8000,
        "interval": "5s",
        "pwm": { "pin": 18, "frequency": 250 },
        "calibration": {
            "path": "/var/lib/sundial/calibration.json",
            "levels": [0, 10, 50, 100],
            "settle": "3s"
        }
    }))
    .unwrap();

    assert_eq!(config.max_power, 8000);
    assert_eq!(config.interval, Duration::from_secs(5));
    assert_eq!(config.pwm, PwmConfig { pin: 18, frequency: 250.0 });
    assert_eq!(config.calibration.levels, vec![0.0, 10.0, 50.0, 100.0]);
    assert_eq!(config.calibration.settle, Duration::from_secs(3));
    assert_eq!(config.source.unit.0, 3);
    assert_eq!(config.source.timeout, Duration::from_millis(500));
    assert!(config.validate().is_ok());
}

#[test]
fn validate_rejects_bad_values() {
    let broken: [fn(&mut Config); 6] = [
        |c| c.max_power = 0,
        |c| c.interval = Duration::ZERO,
        |c| c.source.register.scale = 127,
        |c| c.calibration.levels = vec![50.0],
        |c| c.calibration.levels = vec![0.0, 50.0, 50.0, 100.0],
        |c| c.calibration.levels = vec![0.0, 120.0],
    ];

    for breakage in broken {
        let mut config = Config::default();
        breakage(&mut config);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}

#[test]
fn power_percent_is_relative_to_rated_output() {
    let monitor = MonitorConfig {
        max_power: 5760,
        poll_interval: Duration::from_secs(1),
    };
    assert_eq!(monitor.power_percent(2880), 50.0);
    assert_eq!(monitor.power_percent(0), 0.0);
    assert!(monitor.power_percent(7200) > 100.0);
    assert!(monitor.power_percent(-100) < 0.0);
}

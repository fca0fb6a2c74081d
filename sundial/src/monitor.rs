//! The polling loop: inverter output in, needle position out.

use tokio::{select, time};
use tracing::{debug, error, info, warn};

use crate::{
    actuator::Actuator,
    calibration::CalibrationSet,
    config::MonitorConfig,
    modbus::{PowerSource, Watts},
    shutdown::Shutdown,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Disconnected,
    Connecting,
    Polling,
    Stopped,
}

/// What the loop last saw and did. Never persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RuntimeState {
    /// `None` when the latest read failed
    pub last_power: Option<Watts>,
    pub last_drive: Option<f64>,
}

/// Owns the power source and the actuator for the length of a run.
pub struct Monitor<P, A> {
    config: MonitorConfig,
    calibration: CalibrationSet,
    source: P,
    actuator: A,
    state: MonitorState,
    runtime: RuntimeState,
}

impl<P: PowerSource, A: Actuator> Monitor<P, A> {
    pub fn new(config: MonitorConfig, calibration: CalibrationSet, source: P, actuator: A) -> Self {
        Self {
            config,
            calibration,
            source,
            actuator,
            state: MonitorState::Disconnected,
            runtime: Default::default(),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn runtime(&self) -> RuntimeState {
        self.runtime
    }

    pub fn into_parts(self) -> (P, A) {
        (self.source, self.actuator)
    }

    /// Poll until `shutdown` fires or something fatal happens.
    ///
    /// The actuator is released and the power source closed on the way out, whichever way that is. Shutdown is a
    /// clean exit. An unreachable inverter is retried every poll interval, at startup as well as mid-run. A bad
    /// connection config, the actuator failing, or the calibration turning out to be unusable return an error.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> crate::Result<()> {
        info!(
            calibrated = self.calibration.is_calibrated(),
            notes = self.calibration.notes(),
            max_power = self.config.max_power,
            interval = ?self.config.poll_interval,
            "Starting monitor"
        );

        let result = self.connect_and_poll(&mut shutdown).await;
        self.stop().await;

        match result {
            Ok(()) => info!("Monitor stopped"),
            Err(ref error) => error!(%error, "Monitor failed"),
        }
        result
    }

    async fn connect_and_poll(&mut self, shutdown: &mut Shutdown) -> crate::Result<()> {
        self.state = MonitorState::Connecting;
        loop {
            select! {
                res = self.source.connect() => match res {
                    Ok(()) => break,
                    Err(error) if error.is_connectivity() => warn!(%error, "Connection failed"),
                    Err(error) => return Err(error),
                },
                _ = shutdown.recv() => return Ok(()),
            }

            select! {
                _ = time::sleep(self.config.poll_interval) => {},
                _ = shutdown.recv() => return Ok(()),
            }
        }

        self.state = MonitorState::Polling;
        info!("Connected, polling");

        loop {
            select! {
                res = self.poll_once() => res?,
                _ = shutdown.recv() => return Ok(()),
            }

            select! {
                _ = time::sleep(self.config.poll_interval) => {},
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// One read-and-update cycle. A failed read is reported and leaves the actuator where it was.
    pub(crate) async fn poll_once(&mut self) -> crate::Result<()> {
        let watts = match self.source.read_power().await {
            Ok(watts) => watts,
            Err(error) if error.is_connectivity() => {
                warn!(%error, "Connection failed");
                self.runtime.last_power = None;
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let percent = self.config.power_percent(watts);
        let drive = self.calibration.invert(percent)?;
        self.actuator.set_drive(drive)?;

        debug!(
            expected_dial = self.calibration.observed_at(drive * 100.0),
            "Dial target"
        );
        info!(
            watts,
            percent = %format_args!("{percent:.1}"),
            drive = %format_args!("{drive:.3}"),
            "Updated dial"
        );

        self.runtime = RuntimeState {
            last_power: Some(watts),
            last_drive: Some(drive),
        };
        Ok(())
    }

    async fn stop(&mut self) {
        if let Err(error) = self.actuator.release() {
            error!(%error, "Failed to release actuator");
        }
        if let Err(error) = self.source.close().await {
            warn!(%error, "Failed to close connection to inverter");
        }
        self.state = MonitorState::Stopped;
    }
}

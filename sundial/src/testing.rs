//! In-memory stand-ins for the inverter, the meter and the operator.

use std::{collections::VecDeque, io};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    actuator::Actuator,
    capture::ObservationSource,
    modbus::{PowerSource, Watts},
    Error,
};

pub(crate) fn connection_lost() -> Error {
    Error::Connectivity(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
}

/// Replays a fixed list of readings. Once they run out the optional shutdown is signalled, and every read then fails,
/// or never completes with `stall_when_exhausted`.
#[derive(Debug, Default)]
pub(crate) struct ScriptedSource {
    pub readings: VecDeque<crate::Result<Watts>>,
    /// Number of connection attempts that fail before one succeeds
    pub refuse_connections: usize,
    pub misconfigured: bool,
    pub stall_when_exhausted: bool,
    pub shutdown_when_exhausted: Option<broadcast::Sender<()>>,
    pub connect_attempts: usize,
    pub reads: usize,
    pub connected: bool,
    pub closed: bool,
}

impl ScriptedSource {
    pub fn new(readings: impl IntoIterator<Item = crate::Result<Watts>>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PowerSource for ScriptedSource {
    async fn connect(&mut self) -> crate::Result<()> {
        self.connect_attempts += 1;
        if self.misconfigured {
            return Err(Error::config("unrecognised modbus protocol"));
        }
        if self.connect_attempts <= self.refuse_connections {
            return Err(connection_lost());
        }
        self.connected = true;
        Ok(())
    }

    async fn read_power(&mut self) -> crate::Result<Watts> {
        self.reads += 1;
        match self.readings.pop_front() {
            Some(reading) => reading,
            None => {
                if let Some(notify) = self.shutdown_when_exhausted.take() {
                    let _ = notify.send(());
                }
                if self.stall_when_exhausted {
                    std::future::pending::<()>().await;
                }
                Err(connection_lost())
            }
        }
    }

    async fn close(&mut self) -> crate::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Remembers every drive value it was given.
#[derive(Debug, Default)]
pub(crate) struct RecordingActuator {
    pub drives: Vec<f64>,
    pub released: bool,
    pub broken: bool,
}

impl RecordingActuator {
    pub fn last(&self) -> Option<f64> {
        self.drives.last().copied()
    }
}

impl Actuator for RecordingActuator {
    fn set_drive(&mut self, fraction: f64) -> crate::Result<()> {
        if self.broken {
            return Err(Error::from("actuator unplugged"));
        }
        self.drives.push(fraction);
        Ok(())
    }

    fn release(&mut self) -> crate::Result<()> {
        self.released = true;
        Ok(())
    }
}

/// Answers prompts from a script. Running out of answers behaves like end of input, or like an operator who has
/// walked away with `silent_when_exhausted`.
#[derive(Debug, Default)]
pub(crate) struct ScriptedOperator {
    pub answers: VecDeque<&'static str>,
    pub silent_when_exhausted: bool,
    pub prompts: Vec<f64>,
    pub rejections: Vec<String>,
}

impl ScriptedOperator {
    pub fn new(answers: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ObservationSource for ScriptedOperator {
    async fn prompt(&mut self, drive_percent: f64) -> crate::Result<Option<String>> {
        self.prompts.push(drive_percent);
        let answer = self.answers.pop_front();
        if answer.is_none() && self.silent_when_exhausted {
            std::future::pending::<()>().await;
        }
        Ok(answer.map(str::to_owned))
    }

    async fn reject(&mut self, error: &Error) -> crate::Result<()> {
        self.rejections.push(error.to_string());
        Ok(())
    }
}

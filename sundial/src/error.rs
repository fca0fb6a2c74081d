use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    JSONError(#[from] serde_json::Error),

    #[error(transparent)]
    GpioError(#[from] rppal::gpio::Error),

    /// The power source could not be reached or did not answer a read.
    #[error("Connection failed: {0}")]
    Connectivity(#[source] std::io::Error),

    #[error("Invalid calibration data: {0}")]
    CalibrationData(Cow<'static, str>),

    #[error("Invalid reading: {0}")]
    InputValidation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(Cow<'static, str>),
}

impl Error {
    /// Connectivity failures are retried on the next poll cycle rather than ending the run.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }

    pub(crate) fn calibration<S: Into<Cow<'static, str>>>(msg: S) -> Self {
        Error::CalibrationData(msg.into())
    }

    pub(crate) fn config<S: Into<Cow<'static, str>>>(msg: S) -> Self {
        Error::InvalidConfig(msg.into())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Self::Other(s.into())
    }
}
impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Self::Other(s.into())
    }
}

//! The output side: something that moves the needle.

use rppal::gpio::{Gpio, OutputPin};
use tracing::debug;

use crate::{config::PwmConfig, Error};

/// Accepts a normalised drive value and turns it into needle deflection.
pub trait Actuator: Send {
    /// Drive at `fraction` of full scale, `0.0..=1.0`.
    fn set_drive(&mut self, fraction: f64) -> crate::Result<()>;

    /// Stop driving the output altogether.
    fn release(&mut self) -> crate::Result<()>;
}

/// An ammeter on a Raspberry Pi GPIO pin, driven with software PWM.
#[derive(Debug)]
pub struct PwmActuator {
    pin: OutputPin,
    frequency: f64,
}

impl PwmActuator {
    pub fn new(config: &PwmConfig) -> crate::Result<Self> {
        let mut pin = Gpio::new()?.get(config.pin)?.into_output_low();
        pin.set_reset_on_drop(true);
        debug!(pin = config.pin, frequency = config.frequency, "Claimed PWM pin");

        Ok(Self {
            pin,
            frequency: config.frequency,
        })
    }
}

impl Actuator for PwmActuator {
    fn set_drive(&mut self, fraction: f64) -> crate::Result<()> {
        if fraction.is_nan() {
            return Err(Error::from("drive value is not a number"));
        }
        self.pin
            .set_pwm_frequency(self.frequency, fraction.clamp(0.0, 1.0))?;
        Ok(())
    }

    fn release(&mut self) -> crate::Result<()> {
        self.pin.clear_pwm()?;
        self.pin.set_low();
        debug!("Released PWM pin");
        Ok(())
    }
}

//! Temperature sensor drivers.
//!
//! Both chips hang off bit-banged serial lines; see [`spi::SoftSpi`]. Each
//! [`Sampler::sample`] call is a complete bus transaction and blocks for the
//! duration of the conversion, so the monitor runs it on the blocking pool.

pub mod max31865;
pub mod max6675;
pub mod spi;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpio::DigitalPin;

pub use max31865::Max31865;
pub use max6675::Max6675;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: f32,
    pub observed_at: DateTime<Local>,
}

impl Sample {
    pub fn now(value: f32) -> Self {
        Self {
            value,
            observed_at: Local::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorFault {
    #[error("thermocouple open circuit")]
    OpenCircuit,
    #[error("sensor fault register {fault:#04x}")]
    Device { fault: u8 },
}

pub trait Sampler: Send {
    fn sample(&mut self) -> Result<Sample, SensorFault>;
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn sample(&mut self) -> Result<Sample, SensorFault> {
        (**self).sample()
    }
}

/// Chip select held low for the guard's lifetime.
pub struct ChipSelect<'a> {
    pin: &'a mut dyn DigitalPin,
}

impl<'a> ChipSelect<'a> {
    pub fn assert(pin: &'a mut dyn DigitalPin) -> Self {
        pin.set_low();
        Self { pin }
    }
}

impl Drop for ChipSelect<'_> {
    fn drop(&mut self) {
        self.pin.set_high();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{Level, SimulatedPin};

    #[test]
    fn chip_select_released_on_early_return() {
        fn transaction(cs: &mut dyn DigitalPin, fail: bool) -> Result<(), SensorFault> {
            let _cs = ChipSelect::assert(cs);
            if fail {
                return Err(SensorFault::OpenCircuit);
            }
            Ok(())
        }

        let mut cs = SimulatedPin::default();
        cs.set_high();
        assert!(transaction(&mut cs, true).is_err());
        assert_eq!(cs.read(), Level::High);
        assert!(transaction(&mut cs, false).is_ok());
        assert_eq!(cs.read(), Level::High);
    }

    #[test]
    fn fault_messages_carry_register() {
        assert_eq!(
            SensorFault::Device { fault: 0x84 }.to_string(),
            "sensor fault register 0x84"
        );
    }
}

//! Digital pin capability and the two pin providers.
//!
//! The control loops only ever see [`DigitalPin`]. Direction and pull
//! configuration happen once, when a pin is acquired from a [`Gpio`].

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Down,
}

pub trait DigitalPin: Send {
    fn set(&mut self, level: Level);
    fn read(&self) -> Level;

    fn set_high(&mut self) {
        self.set(Level::High);
    }

    fn set_low(&mut self) {
        self.set(Level::Low);
    }

    fn is_high(&self) -> bool {
        self.read().is_high()
    }
}

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("failed to export gpio line {line}: {source}")]
    Export {
        line: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to configure gpio line {line}: {source}")]
    Configure {
        line: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Hands out configured pins by line number.
pub trait Gpio {
    fn output(&self, line: u32) -> Result<Box<dyn DigitalPin>, GpioError>;
    fn input(&self, line: u32, pull: Pull) -> Result<Box<dyn DigitalPin>, GpioError>;
}

/// Linux sysfs GPIO (`/sys/class/gpio`).
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::with_root("/sys/class/gpio")
    }
}

impl SysfsGpio {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn export(&self, line: u32) -> Result<PathBuf, GpioError> {
        let dir = self.root.join(format!("gpio{line}"));
        if !dir.exists() {
            fs::write(self.root.join("export"), line.to_string())
                .map_err(|source| GpioError::Export { line, source })?;
        }
        Ok(dir)
    }

    fn configure(&self, line: u32, direction: &str) -> Result<SysfsPin, GpioError> {
        let dir = self.export(line)?;
        fs::write(dir.join("direction"), direction)
            .map_err(|source| GpioError::Configure { line, source })?;
        Ok(SysfsPin {
            line,
            value: dir.join("value"),
        })
    }
}

impl Gpio for SysfsGpio {
    fn output(&self, line: u32) -> Result<Box<dyn DigitalPin>, GpioError> {
        // "low" selects output direction with the line initially driven low.
        Ok(Box::new(self.configure(line, "low")?))
    }

    fn input(&self, line: u32, pull: Pull) -> Result<Box<dyn DigitalPin>, GpioError> {
        if pull == Pull::Down {
            warn!(line, "sysfs gpio cannot set pull resistors, relying on board wiring");
        }
        Ok(Box::new(self.configure(line, "in")?))
    }
}

#[derive(Debug)]
pub struct SysfsPin {
    line: u32,
    value: PathBuf,
}

impl DigitalPin for SysfsPin {
    fn set(&mut self, level: Level) {
        let v = if level.is_high() { "1" } else { "0" };
        if let Err(e) = fs::write(&self.value, v) {
            error!(line = self.line, error = %e, "gpio write failed");
        }
    }

    fn read(&self) -> Level {
        match fs::read_to_string(&self.value) {
            Ok(s) => Level::from(s.trim() == "1"),
            Err(e) => {
                error!(line = self.line, error = %e, "gpio read failed");
                Level::Low
            }
        }
    }
}

/// In-memory pins shared by line number. Every handle for the same line sees
/// the same level, so a test can hold the button line while the power
/// manager polls it.
#[derive(Debug, Default, Clone)]
pub struct SimulatedGpio {
    lines: Arc<Mutex<HashMap<u32, SimulatedPin>>>,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, line: u32) -> SimulatedPin {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.entry(line).or_default().clone()
    }
}

impl Gpio for SimulatedGpio {
    fn output(&self, line: u32) -> Result<Box<dyn DigitalPin>, GpioError> {
        let mut pin = self.pin(line);
        pin.set_low();
        Ok(Box::new(pin))
    }

    fn input(&self, line: u32, _pull: Pull) -> Result<Box<dyn DigitalPin>, GpioError> {
        Ok(Box::new(self.pin(line)))
    }
}

#[derive(Debug, Default, Clone)]
pub struct SimulatedPin {
    high: Arc<AtomicBool>,
}

impl DigitalPin for SimulatedPin {
    fn set(&mut self, level: Level) {
        self.high.store(level.is_high(), Ordering::SeqCst);
    }

    fn read(&self) -> Level {
        Level::from(self.high.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_handles_share_a_line() {
        let gpio = SimulatedGpio::new();
        let mut relay = gpio.output(21).unwrap();
        let probe = gpio.pin(21);
        assert_eq!(probe.read(), Level::Low);
        relay.set_high();
        assert!(probe.is_high());
        assert!(relay.is_high());
    }

    #[test]
    fn sysfs_pin_writes_value_file() {
        let root = tempfile::tempdir().unwrap();
        let line_dir = root.path().join("gpio14");
        fs::create_dir(&line_dir).unwrap();
        fs::write(line_dir.join("direction"), "in").unwrap();
        fs::write(line_dir.join("value"), "0").unwrap();

        let gpio = SysfsGpio::with_root(root.path());
        let mut pin = gpio.output(14).unwrap();
        assert_eq!(fs::read_to_string(line_dir.join("direction")).unwrap(), "low");

        pin.set_high();
        assert_eq!(fs::read_to_string(line_dir.join("value")).unwrap(), "1");
        assert_eq!(pin.read(), Level::High);
    }

    #[test]
    fn sysfs_export_failure_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let gpio = SysfsGpio::with_root(root.path().join("missing"));
        let err = gpio.output(3).err().unwrap();
        assert!(matches!(err, GpioError::Export { line: 3, .. }));
    }
}

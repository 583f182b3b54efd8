//! Server configuration loaded from TOML. Every field has a default, so an
//! empty file (or no file at all) describes the stock machine.
//!
//! ```toml
//! port = 8080
//!
//! [pins]
//! heating_element_relay = 14
//!
//! [sensor]
//! kind = "max6675"
//!
//! [power]
//! auto_off_minutes = 45
//! [power.schedule]
//! Mon = [{ from_hour = 6, to_hour = 8 }]
//!
//! [pid]
//! target = 94.0
//! ```

use anyhow::{Context, Result};
use espresso_controller::sensor::max31865::{DEFAULT_REFERENCE_RESISTOR, PT100_NOMINAL};
use espresso_controller::{PidGains, PowerSchedule, ScheduleError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid power schedule: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("gpio line {line} is assigned to both {first} and {second}")]
    PinConflict {
        line: u32,
        first: &'static str,
        second: &'static str,
    },
    #[error("auto-off must be between 1 and {MAX_AUTO_OFF_MINUTES} minutes, got {0}")]
    AutoOff(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub simulate: bool,
    pub static_dir: PathBuf,
    pub pins: PinConfig,
    pub sensor: SensorConfig,
    pub power: PowerConfig,
    pub pid: PidConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            simulate: false,
            static_dir: PathBuf::from("apps/server/static"),
            pins: PinConfig::default(),
            sensor: SensorConfig::default(),
            power: PowerConfig::default(),
            pid: PidConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    pub heating_element_relay: u32,
    pub power_button: u32,
    pub power_button_relay: u32,
    pub power_led: u32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            heating_element_relay: 14,
            power_button: 17,
            power_button_relay: 21,
            power_led: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// PT100 RTD converter.
    Max31865,
    /// K-type thermocouple converter.
    Max6675,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub cs: u32,
    pub clk: u32,
    pub miso: u32,
    pub mosi: u32,
    pub rtd_nominal: f32,
    pub reference_resistor: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Max31865,
            cs: 5,
            clk: 11,
            miso: 9,
            mosi: 10,
            rtd_nominal: PT100_NOMINAL,
            reference_resistor: DEFAULT_REFERENCE_RESISTOR,
        }
    }
}

// One week.
pub const MAX_AUTO_OFF_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub auto_off_minutes: u64,
    pub schedule: PowerSchedule,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            auto_off_minutes: 60,
            schedule: PowerSchedule::standard(),
        }
    }
}

impl PowerConfig {
    pub fn auto_off(&self) -> Duration {
        Duration::from_secs(self.auto_off_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub p: f32,
    pub i: f32,
    pub d: f32,
    pub target: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        let PidGains { p, i, d } = PidGains::default();
        Self {
            p,
            i,
            d,
            target: espresso_controller::pid::DEFAULT_TARGET,
        }
    }
}

impl PidConfig {
    pub fn gains(&self) -> PidGains {
        PidGains {
            p: self.p,
            i: self.i,
            d: self.d,
        }
    }
}

impl Config {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("loading {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("parsing TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.power.schedule.validate()?;
        if !(1..=MAX_AUTO_OFF_MINUTES).contains(&self.power.auto_off_minutes) {
            return Err(ConfigError::AutoOff(self.power.auto_off_minutes));
        }

        let mut lines: Vec<(u32, &'static str)> = vec![
            (self.pins.heating_element_relay, "heating_element_relay"),
            (self.pins.power_button, "power_button"),
            (self.pins.power_button_relay, "power_button_relay"),
            (self.pins.power_led, "power_led"),
        ];
        // The thermal model replaces the sensor bus in simulation.
        if !self.simulate {
            lines.extend([
                (self.sensor.cs, "sensor.cs"),
                (self.sensor.clk, "sensor.clk"),
                (self.sensor.miso, "sensor.miso"),
            ]);
            if self.sensor.kind == SensorKind::Max31865 {
                lines.push((self.sensor.mosi, "sensor.mosi"));
            }
        }

        let mut seen = HashMap::new();
        for (line, name) in lines {
            if let Some(first) = seen.insert(line, name) {
                return Err(ConfigError::PinConflict {
                    line,
                    first,
                    second: name,
                });
            }
        }
        Ok(())
    }
}

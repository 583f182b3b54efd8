//! Thermal model of the boiler for running without hardware. The heater
//! relay is a simulated GPIO line, so the model only sees what the real
//! heating element would drive.

use espresso_controller::gpio::SimulatedPin;
use espresso_controller::{DigitalPin, Sample, Sampler, SensorFault};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const STEP: Duration = Duration::from_millis(50);
const AMBIENT: f64 = 21.0;
// Degrees per second the element gains while energised.
const HEAT_RATE: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct Boiler {
    element_t: f64,
    water_t: f64,
    ambient_t: f64,
}

impl Default for Boiler {
    fn default() -> Self {
        Self {
            element_t: AMBIENT,
            water_t: AMBIENT,
            ambient_t: AMBIENT,
        }
    }
}

impl Boiler {
    pub fn update(&mut self, heating: bool, dt: Duration) {
        let secs = dt.as_secs_f64();
        if heating {
            self.element_t += HEAT_RATE * secs;
        }
        let mut ambient = self.ambient_t;
        Self::exchange(&mut self.element_t, 0.3, &mut self.water_t, 1.0, (0.5 * secs).min(0.5));
        Self::exchange(&mut self.water_t, 1.0, &mut ambient, 1.0, (0.004 * secs).min(0.5));
    }

    pub fn water_temperature(&self) -> f64 {
        self.water_t
    }

    fn exchange(t1: &mut f64, weight1: f64, t2: &mut f64, weight2: f64, speed: f64) {
        let energy1 = *t1 * weight1;
        let energy2 = *t2 * weight2;
        let exchanged = (*t1 - *t2) * speed;
        *t1 = (energy1 - exchanged) / weight1;
        *t2 = (energy2 + exchanged) / weight2;
    }
}

/// Advances a shared [`Boiler`] in small steps, reading the heater relay
/// line each step.
pub fn spawn(heater: SimulatedPin) -> (BoilerProbe, JoinHandle<()>) {
    let boiler = Arc::new(Mutex::new(Boiler::default()));
    let probe = BoilerProbe {
        boiler: Arc::clone(&boiler),
    };
    let handle = tokio::spawn(async move {
        let mut ticker = interval(STEP);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let heating = heater.is_high();
            boiler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .update(heating, STEP);
        }
    });
    (probe, handle)
}

/// Reads the simulated boiler like a temperature sensor would.
pub struct BoilerProbe {
    boiler: Arc<Mutex<Boiler>>,
}

impl Sampler for BoilerProbe {
    fn sample(&mut self) -> Result<Sample, SensorFault> {
        let boiler = self.boiler.lock().unwrap_or_else(PoisonError::into_inner);
        // Converter resolution.
        let quantised = (boiler.water_temperature() * 4.0).round() / 4.0;
        Ok(Sample::now(quantised as f32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use espresso_controller::{Gpio, Level, SimulatedGpio};

    fn run(boiler: &mut Boiler, heating: bool, seconds: u64) {
        for _ in 0..seconds * 20 {
            boiler.update(heating, STEP);
        }
    }

    #[test]
    fn heats_while_energised_and_cools_back() {
        let mut boiler = Boiler::default();
        run(&mut boiler, true, 120);
        let hot = boiler.water_temperature();
        assert!(hot > 45.0, "reached only {hot}");

        run(&mut boiler, false, 600);
        let cooled = boiler.water_temperature();
        assert!(cooled < hot);
        assert!(cooled > AMBIENT);
    }

    #[test]
    fn idle_boiler_stays_at_ambient() {
        let mut boiler = Boiler::default();
        run(&mut boiler, false, 60);
        assert!((boiler.water_temperature() - AMBIENT).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_follows_the_relay_line() {
        let gpio = SimulatedGpio::new();
        let mut relay = gpio.output(14).unwrap();
        let (mut probe, task) = spawn(gpio.pin(14));
        let before = probe.sample().unwrap().value;

        relay.set(Level::High);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let after = probe.sample().unwrap().value;
        assert!(after > before + 5.0, "{before} -> {after}");
        task.abort();
    }
}

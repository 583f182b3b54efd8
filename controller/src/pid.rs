//! Boiler temperature loop: one control step per smoothed sample, gated on
//! the machine being powered.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::fifo::Fifo;
use crate::heating::HeatingElement;
use crate::monitor::Monitor;
use crate::power::PowerManager;
use crate::sensor::{Sample, Sampler};

pub const DEFAULT_TARGET: f32 = 93.0;
const ERROR_HISTORY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub p: f32,
    pub i: f32,
    pub d: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            p: 3.0,
            i: 4.0,
            d: 350.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetTemperature {
    pub value: f32,
    pub set_at: DateTime<Local>,
}

/// Error terms of the last few steps.
#[derive(Debug)]
struct PidState {
    gains: PidGains,
    errors: Fifo,
    slopes: Fifo,
}

impl PidState {
    fn new(gains: PidGains) -> Self {
        Self {
            gains,
            errors: Fifo::new(ERROR_HISTORY),
            slopes: Fifo::new(ERROR_HISTORY),
        }
    }

    /// Duty factor in `[0, 1]`. The slope is `previous - current` error, so a
    /// closing gap brakes the output through the D term.
    fn step(&mut self, target: f32, measured: f32) -> f32 {
        let error = target - measured;

        self.slopes.push(self.errors.last() - error);
        let slope = self.slopes.average();

        self.errors.push(error);
        let integral = self.errors.sum();

        let PidGains { p, i, d } = self.gains;
        let raw = (p * error + i * integral - d * slope) / 100.0;
        if raw.is_nan() {
            return 0.0;
        }
        raw.clamp(0.0, 1.0)
    }

    fn reset(&mut self) {
        self.errors.clear();
        self.slopes.clear();
    }
}

pub struct PidController<S> {
    monitor: Arc<Monitor<S>>,
    heating: Arc<HeatingElement>,
    power: Arc<PowerManager>,
    clock: Arc<dyn Clock>,
    target: RwLock<TargetTemperature>,
    state: Mutex<PidState>,
    subscription: Mutex<Option<Uuid>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Sampler + 'static> PidController<S> {
    pub fn new(
        monitor: Arc<Monitor<S>>,
        heating: Arc<HeatingElement>,
        power: Arc<PowerManager>,
        gains: PidGains,
        target: f32,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let target = TargetTemperature {
            value: target,
            set_at: clock.now(),
        };
        Arc::new(Self {
            monitor,
            heating,
            power,
            clock,
            target: RwLock::new(target),
            state: Mutex::new(PidState::new(gains)),
            subscription: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Subscribes to the monitor and starts stepping on every sample.
    pub fn run(self: &Arc<Self>) {
        let (id, samples) = self.monitor.subscribe();
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        let handle = tokio::spawn(Arc::clone(self).control_loop(samples));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn control_loop(self: Arc<Self>, mut samples: mpsc::Receiver<Sample>) {
        while let Some(sample) = samples.recv().await {
            self.apply(&sample);
        }
        debug!("pid controller sample stream closed");
    }

    /// Stops the loop and leaves the heater at zero duty. Safe to call twice.
    pub fn shutdown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = subscription {
            self.monitor.unsubscribe(id);
            info!("pid controller stopped");
        }
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.heating.set_duty_factor(0.0);
    }
}

impl<S> PidController<S> {
    fn apply(&self, sample: &Sample) -> f32 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let duty_factor = if self.power.is_machine_power_on() {
            let target = self.target_temperature().value;
            let duty_factor = state.step(target, sample.value);
            debug!(temperature = sample.value, target, duty_factor, "pid step");
            duty_factor
        } else {
            state.reset();
            0.0
        };
        self.heating.set_duty_factor(duty_factor);
        duty_factor
    }

    pub fn set_target_temperature(&self, value: f32) -> TargetTemperature {
        let target = TargetTemperature {
            value,
            set_at: self.clock.now(),
        };
        *self.target.write().unwrap_or_else(PoisonError::into_inner) = target;
        info!(target = value, "target temperature set");
        target
    }

    pub fn target_temperature(&self) -> TargetTemperature {
        *self.target.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gains(&self) -> PidGains {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).gains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gpio::{Gpio, Pull, SimulatedGpio};
    use crate::power::{PowerPins, PowerSchedule};
    use crate::sensor::SensorFault;
    use chrono::TimeZone;
    use std::time::Duration;
    use tokio::time::sleep;

    struct Unplugged;

    impl Sampler for Unplugged {
        fn sample(&mut self) -> Result<Sample, SensorFault> {
            Err(SensorFault::OpenCircuit)
        }
    }

    struct Rig {
        clock: Arc<ManualClock>,
        monitor: Arc<Monitor<Unplugged>>,
        heating: Arc<HeatingElement>,
        power: Arc<PowerManager>,
        pid: Arc<PidController<Unplugged>>,
    }

    fn rig(gains: PidGains) -> Rig {
        let clock = Arc::new(ManualClock::new(
            Local.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap(),
        ));
        let gpio = SimulatedGpio::new();
        let monitor = Monitor::new(Unplugged, clock.clone());
        let heating = HeatingElement::new(gpio.output(14).unwrap());
        let power = PowerManager::new(
            PowerPins {
                relay: gpio.output(21).unwrap(),
                button: gpio.input(17, Pull::Down).unwrap(),
                led: gpio.output(16).unwrap(),
            },
            PowerSchedule::empty(),
            Duration::from_secs(3600),
            clock.clone(),
        );
        let pid = PidController::new(
            Arc::clone(&monitor),
            Arc::clone(&heating),
            Arc::clone(&power),
            gains,
            DEFAULT_TARGET,
            clock.clone(),
        );
        Rig {
            clock,
            monitor,
            heating,
            power,
            pid,
        }
    }

    fn sample(value: f32) -> Sample {
        Sample::now(value)
    }

    #[test]
    fn output_is_clamped() {
        let mut state = PidState::new(PidGains::default());
        assert_eq!(state.step(93.0, 20.0), 1.0);
        state.reset();
        assert_eq!(state.step(93.0, 120.0), 0.0);
    }

    #[test]
    fn combines_proportional_integral_and_slope() {
        let mut state = PidState::new(PidGains {
            p: 10.0,
            i: 1.0,
            d: 2.0,
        });
        // error 3: slope -3, sum 3 -> (30 + 3 + 6) / 100
        assert!((state.step(93.0, 90.0) - 0.39).abs() < 1e-6);
        // error 2: slopes [-3, 1] avg -1, sum 5 -> (20 + 5 + 2) / 100
        assert!((state.step(93.0, 91.0) - 0.27).abs() < 1e-6);
    }

    #[test]
    fn powered_off_forces_zero_and_forgets_history() {
        let rig = rig(PidGains {
            p: 10.0,
            i: 1.0,
            d: 2.0,
        });
        rig.heating.set_duty_factor(0.8);
        assert_eq!(rig.pid.apply(&sample(50.0)), 0.0);
        assert_eq!(rig.heating.duty_factor(), 0.0);

        rig.power.power_on();
        rig.pid.apply(&sample(90.0));
        rig.power.power_off();
        rig.pid.apply(&sample(90.0));
        rig.power.power_on();
        // Same result as a fresh first step.
        assert!((rig.pid.apply(&sample(90.0)) - 0.39).abs() < 1e-6);
    }

    #[test]
    fn target_round_trips_with_timestamp() {
        let rig = rig(PidGains::default());
        assert_eq!(rig.pid.target_temperature().value, DEFAULT_TARGET);

        let later = Local.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap();
        rig.clock.set(later);
        let set = rig.pid.set_target_temperature(95.5);
        assert_eq!(set.value, 95.5);
        assert_eq!(set.set_at, later);
        assert_eq!(rig.pid.target_temperature(), set);
    }

    #[tokio::test(start_paused = true)]
    async fn drives_heater_from_monitor_samples() {
        let rig = rig(PidGains::default());
        rig.power.power_on();
        rig.pid.run();
        assert_eq!(rig.monitor.subscriber_count(), 1);

        rig.monitor.ingest(sample(60.0)).await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.heating.duty_factor(), 1.0);

        rig.pid.shutdown();
        rig.pid.shutdown();
        assert_eq!(rig.monitor.subscriber_count(), 0);
        assert_eq!(rig.heating.duty_factor(), 0.0);
    }
}

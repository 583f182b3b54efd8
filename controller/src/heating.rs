//! Boiler heater relay driven as a slow software PWM.
//!
//! A mechanical/SSR relay cannot follow a real PWM carrier, so the duty
//! factor is spread over a fixed one second period: on for `duty * 1 s`,
//! then off for the remainder.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::gpio::{DigitalPin, Level};

pub const PWM_PERIOD: Duration = Duration::from_secs(1);

pub struct HeatingElement {
    relay: Mutex<Box<dyn DigitalPin>>,
    // f32 bits
    duty_factor: AtomicU32,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeatingElement {
    pub fn new(mut relay: Box<dyn DigitalPin>) -> Arc<Self> {
        relay.set_low();
        Arc::new(Self {
            relay: Mutex::new(relay),
            duty_factor: AtomicU32::new(0f32.to_bits()),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn run(self: &Arc<Self>) {
        let handle = tokio::spawn(Arc::clone(self).actuation_loop());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn actuation_loop(self: Arc<Self>) {
        while !self.stopped.load(Ordering::SeqCst) {
            let duty = self.duty_factor();
            // Also catches NaN.
            if !(duty > 0.0) {
                self.drive(Level::Low);
                sleep(PWM_PERIOD).await;
                continue;
            }

            let on = PWM_PERIOD.mul_f32(duty.min(1.0));
            let off = PWM_PERIOD.saturating_sub(on);

            self.drive(Level::High);
            sleep(on).await;
            if off.is_zero() {
                continue;
            }
            self.drive(Level::Low);
            sleep(off).await;
        }
    }

    /// Drives the relay unless shutdown has already happened; after shutdown
    /// only `Low` gets through.
    fn drive(&self, level: Level) {
        let mut relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
        if level.is_high() && self.stopped.load(Ordering::SeqCst) {
            return;
        }
        relay.set(level);
    }

    /// Latest requested duty factor. The caller clamps to `[0, 1]`.
    pub fn set_duty_factor(&self, factor: f32) {
        let previous = f32::from_bits(self.duty_factor.swap(factor.to_bits(), Ordering::SeqCst));
        if previous != factor {
            debug!(duty_factor = factor, "heating element duty factor changed");
        }
    }

    pub fn duty_factor(&self) -> f32 {
        f32::from_bits(self.duty_factor.load(Ordering::SeqCst))
    }

    pub fn is_energised(&self) -> bool {
        self.relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_high()
    }

    /// Forces the relay off and stops the actuation task. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        let mut relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner);
        let was_running = !self.stopped.swap(true, Ordering::SeqCst);
        relay.set_low();
        drop(relay);

        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        if was_running {
            info!("heating element relay off");
        }
    }
}

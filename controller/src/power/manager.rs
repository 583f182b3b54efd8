use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use super::schedule::{PowerOnInterval, PowerSchedule};
use crate::clock::Clock;
use crate::gpio::DigitalPin;

const TICK_PERIOD: Duration = Duration::from_millis(200);
const BUTTON_POLL: Duration = Duration::from_millis(100);
// One second of continuous press.
const DEBOUNCE_POLLS: usize = 10;

/// What last changed the power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LastInteraction {
    StartUp,
    Scheduled,
    ScheduledOff,
    AutoOff,
    ButtonOn,
    ButtonOff,
    ApiOn,
    ApiOff,
    TotalOff,
}

impl LastInteraction {
    pub const ALL: [LastInteraction; 9] = [
        Self::StartUp,
        Self::Scheduled,
        Self::ScheduledOff,
        Self::AutoOff,
        Self::ButtonOn,
        Self::ButtonOff,
        Self::ApiOn,
        Self::ApiOff,
        Self::TotalOff,
    ];

    /// Same spelling as the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartUp => "start_up",
            Self::Scheduled => "scheduled",
            Self::ScheduledOff => "scheduled_off",
            Self::AutoOff => "auto_off",
            Self::ButtonOn => "button_on",
            Self::ButtonOff => "button_off",
            Self::ApiOn => "api_on",
            Self::ApiOff => "api_off",
            Self::TotalOff => "total_off",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerStatus {
    pub schedule: PowerSchedule,
    #[serde(serialize_with = "as_seconds")]
    pub auto_off_duration: Duration,
    pub on_since: Option<DateTime<Local>>,
    pub currently_in_schedule: bool,
    pub last_interaction: LastInteraction,
    pub power_on: bool,
    pub stop_scheduling: bool,
    pub total_off: bool,
    pub current_matched_interval: Option<PowerOnInterval>,
}

fn as_seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

/// Power relay, front-panel button and indicator LED.
pub struct PowerPins {
    pub relay: Box<dyn DigitalPin>,
    pub button: Box<dyn DigitalPin>,
    pub led: Box<dyn DigitalPin>,
}

struct Inner {
    pins: PowerPins,
    schedule: PowerSchedule,
    auto_off: Duration,
    on_since: Option<DateTime<Local>>,
    currently_in_schedule: bool,
    stop_scheduling: bool,
    total_off: bool,
    last_interaction: LastInteraction,
    matched: Option<PowerOnInterval>,
    // Set by shutdown; the relay is never driven high again.
    shut_down: bool,
}

impl Inner {
    fn machine_on(&self) -> bool {
        self.pins.relay.is_high()
    }

    /// Relay and LED follow each other; `on_since` is refreshed even when
    /// already on.
    fn power_on(&mut self, now: DateTime<Local>) {
        if self.shut_down {
            debug!("power manager shut down, ignoring power on");
            return;
        }
        if !self.machine_on() {
            self.pins.relay.set_high();
            self.pins.led.set_high();
            info!("machine powered on");
        }
        self.on_since = Some(now);
    }

    fn power_off(&mut self) {
        if self.machine_on() {
            self.pins.relay.set_low();
            self.pins.led.set_low();
            info!("machine powered off");
        }
        self.on_since = None;
    }

    /// A manual switch-off inside a window suppresses it until the matched
    /// window changes.
    fn manual_off(&mut self, via: LastInteraction) {
        if self.currently_in_schedule {
            self.stop_scheduling = true;
            self.currently_in_schedule = false;
        }
        self.power_off();
        self.last_interaction = via;
    }

    fn manual_on(&mut self, now: DateTime<Local>, via: LastInteraction) {
        if self.shut_down {
            debug!(?via, "power manager shut down, ignoring power on");
            return;
        }
        self.total_off = false;
        self.power_on(now);
        self.last_interaction = via;
    }

    fn apply_schedule(&mut self, now: DateTime<Local>) {
        let matched = self.schedule.matching(now);
        if matched != self.matched {
            if self.stop_scheduling {
                debug!(?matched, "schedule window changed, scheduling re-armed");
            }
            self.matched = matched;
            self.stop_scheduling = false;
        }

        if self.stop_scheduling {
            self.currently_in_schedule = false;
            return;
        }

        match matched {
            Some(interval) => {
                if !self.currently_in_schedule || !self.machine_on() {
                    info!(from = interval.from_hour, to = interval.to_hour, "entering power-on window");
                    self.power_on(now);
                    self.last_interaction = LastInteraction::Scheduled;
                }
                self.currently_in_schedule = true;
            }
            None if self.currently_in_schedule => {
                if self.machine_on() {
                    info!("power-on window over");
                    self.power_off();
                    self.last_interaction = LastInteraction::ScheduledOff;
                }
                self.currently_in_schedule = false;
            }
            None => {}
        }
    }

    fn apply_auto_off(&mut self, now: DateTime<Local>) {
        let Some(since) = self.on_since else {
            return;
        };
        if self.currently_in_schedule {
            return;
        }
        let on_for = (now - since).to_std().unwrap_or_default();
        if on_for >= self.auto_off {
            info!(minutes = on_for.as_secs() / 60, "auto-off after inactivity");
            self.power_off();
            self.last_interaction = LastInteraction::AutoOff;
        }
    }

    fn status(&self) -> PowerStatus {
        PowerStatus {
            schedule: self.schedule.clone(),
            auto_off_duration: self.auto_off,
            on_since: self.on_since,
            currently_in_schedule: self.currently_in_schedule,
            last_interaction: self.last_interaction,
            power_on: self.machine_on(),
            stop_scheduling: self.stop_scheduling,
            total_off: self.total_off,
            current_matched_interval: self.matched,
        }
    }
}

/// Machine power state: front-panel button, weekly schedule, auto-off and
/// API commands all funnel through here.
pub struct PowerManager {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PowerManager {
    pub fn new(
        mut pins: PowerPins,
        schedule: PowerSchedule,
        auto_off: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        pins.relay.set_low();
        pins.led.set_low();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pins,
                schedule,
                auto_off,
                on_since: None,
                currently_in_schedule: false,
                stop_scheduling: false,
                total_off: false,
                last_interaction: LastInteraction::StartUp,
                matched: None,
                shut_down: false,
            }),
            clock,
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run(self: &Arc<Self>) {
        let handle = tokio::spawn(Arc::clone(self).control_loop());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn control_loop(self: Arc<Self>) {
        while !self.stopped.load(Ordering::SeqCst) {
            self.tick().await;
            sleep(TICK_PERIOD).await;
        }
    }

    async fn tick(&self) {
        self.poll_button().await;
        self.evaluate(self.clock.now());
    }

    /// Schedule and auto-off decisions for one tick.
    fn evaluate(&self, now: DateTime<Local>) {
        let mut inner = self.lock();
        if inner.total_off || inner.shut_down {
            return;
        }
        inner.apply_schedule(now);
        inner.apply_auto_off(now);
    }

    fn button_pressed(&self) -> bool {
        self.lock().pins.button.is_high()
    }

    async fn poll_button(&self) {
        if !self.button_pressed() {
            return;
        }
        for _ in 0..DEBOUNCE_POLLS {
            sleep(BUTTON_POLL).await;
            if !self.button_pressed() {
                return;
            }
        }

        let now = self.clock.now();
        {
            let mut inner = self.lock();
            if inner.machine_on() {
                inner.manual_off(LastInteraction::ButtonOff);
            } else {
                inner.manual_on(now, LastInteraction::ButtonOn);
            }
        }
        self.wait_for_release().await;
    }

    /// Two consecutive released polls count as a release.
    async fn wait_for_release(&self) {
        while !self.stopped.load(Ordering::SeqCst) {
            sleep(BUTTON_POLL).await;
            if self.button_pressed() {
                continue;
            }
            sleep(BUTTON_POLL).await;
            if !self.button_pressed() {
                return;
            }
        }
    }

    pub fn power_on(&self) {
        let now = self.clock.now();
        self.lock().manual_on(now, LastInteraction::ApiOn);
    }

    pub fn power_off(&self) {
        self.lock().manual_off(LastInteraction::ApiOff);
    }

    pub fn power_toggle(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.machine_on() {
            inner.manual_off(LastInteraction::ApiOff);
        } else {
            inner.manual_on(now, LastInteraction::ApiOn);
        }
    }

    /// Off and held off, schedule included, until the next explicit power-on.
    pub fn total_power_off(&self) {
        let mut inner = self.lock();
        inner.power_off();
        inner.total_off = true;
        inner.stop_scheduling = true;
        inner.currently_in_schedule = false;
        inner.last_interaction = LastInteraction::TotalOff;
        info!("total power off");
    }

    pub fn schedule_on(&self) {
        self.lock().stop_scheduling = false;
        info!("scheduling enabled");
    }

    pub fn schedule_off(&self) {
        self.lock().stop_scheduling = true;
        info!("scheduling disabled");
    }

    pub fn set_schedule(&self, schedule: PowerSchedule) {
        self.lock().schedule = schedule;
        info!("power schedule replaced");
    }

    pub fn status(&self) -> PowerStatus {
        self.lock().status()
    }

    pub fn is_machine_power_on(&self) -> bool {
        self.lock().machine_on()
    }

    pub fn is_machine_power_off(&self) -> bool {
        !self.is_machine_power_on()
    }

    /// Stops the control task and powers off for good: later ticks, API calls
    /// and button presses leave the relay low. Does not latch total-off.
    pub fn shutdown(&self) {
        let was_running = !self.stopped.swap(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        let mut inner = self.lock();
        inner.shut_down = true;
        inner.power_off();
        inner.currently_in_schedule = false;
        if was_running {
            info!("power manager stopped");
        }
    }
}

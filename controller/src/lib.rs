//! Real-time core of the espresso machine controller.
//!
//! Independent background loops cooperate through locks and channels:
//!
//! ```text
//!   Sampler -> Monitor -> (fan-out) -> PidController -> HeatingElement -> relay pin
//!                                          ^
//!                                    PowerManager (button, schedule, auto-off)
//! ```

pub mod clock;
pub mod fifo;
pub mod gpio;
pub mod heating;
pub mod monitor;
pub mod pid;
pub mod power;
pub mod sensor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use gpio::{DigitalPin, Gpio, GpioError, Level, Pull, SimulatedGpio, SysfsGpio};
pub use heating::HeatingElement;
pub use monitor::Monitor;
pub use pid::{PidController, PidGains, TargetTemperature};
pub use power::{
    LastInteraction, PowerManager, PowerOnInterval, PowerPins, PowerSchedule, PowerStatus, ScheduleError,
};
pub use sensor::{Sample, Sampler, SensorFault};

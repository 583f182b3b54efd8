//! Machine power: front-panel button, weekly power-on schedule and
//! inactivity auto-off.

mod manager;
mod schedule;

pub use manager::{LastInteraction, PowerManager, PowerPins, PowerStatus};
pub use schedule::{PowerOnInterval, PowerSchedule, ScheduleError};

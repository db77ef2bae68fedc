//! Shared support code for the flow metering daemon: wall-clock helpers
//! with a stable monotonic offset, a one-shot notification primitive for
//! thread shutdown, and interruptible sleeps for the export tick loop.

mod notification;
mod sleep;
pub mod unix_time;

pub use notification::Notification;
pub use sleep::sleep_until_seconds;

use crate::unix_time::now_seconds;
use crate::Notification;
use std::time::Duration;

const MAX_SLICE: Duration = Duration::from_millis(250);

/// Sleep until `deadline_secs` (UNIX seconds), waking early if `stop` is
/// notified. Sleeps in short slices so a shutdown request never waits out
/// a full export tick. Returns `true` if the deadline was reached,
/// `false` if the sleep was interrupted by `stop`.
pub fn sleep_until_seconds(deadline_secs: f64, stop: &Notification) -> bool {
    loop {
        if stop.has_been_notified() {
            return false;
        }
        let now = match now_seconds() {
            Ok(now) => now,
            Err(_) => return true,
        };
        let remaining = deadline_secs - now;
        if remaining <= 0.0 {
            return true;
        }
        let slice = Duration::from_secs_f64(remaining).min(MAX_SLICE);
        std::thread::sleep(slice);
    }
}

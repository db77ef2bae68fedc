use log::warn;
use nix::time::{clock_gettime, ClockId};
use once_cell::sync::Lazy;
use thiserror::Error;

pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Error type for time functions.
#[derive(Error, Debug)]
pub enum TimeError {
    /// The clock isn't ready yet.
    #[error("Clock not ready")]
    ClockNotReady,
}

/// The realtime-to-monotonic offset, captured once at startup. Timestamps
/// derived from it are comparable across hosts but do not jump when the
/// wall clock is stepped mid-run.
struct ClockOffset {
    mono_id: ClockId,
    offset_ns: i64,
}

impl ClockOffset {
    fn capture() -> Option<Self> {
        let realtime = clock_gettime(ClockId::CLOCK_REALTIME).ok()?;
        // Prefer the raw monotonic clock when the kernel provides it.
        let (mono_id, mono) = match clock_gettime(ClockId::CLOCK_MONOTONIC_RAW) {
            Ok(t) => (ClockId::CLOCK_MONOTONIC_RAW, t),
            Err(_) => (
                ClockId::CLOCK_MONOTONIC,
                clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?,
            ),
        };
        let realtime_ns =
            realtime.tv_sec() * NANOS_PER_SECOND as i64 + realtime.tv_nsec();
        let mono_ns = mono.tv_sec() * NANOS_PER_SECOND as i64 + mono.tv_nsec();
        Some(Self { mono_id, offset_ns: realtime_ns - mono_ns })
    }
}

static CLOCK_OFFSET: Lazy<Option<ClockOffset>> = Lazy::new(|| {
    let offset = ClockOffset::capture();
    if offset.is_none() {
        warn!("Unable to capture the realtime/monotonic clock offset");
    }
    offset
});

/// Nanoseconds since the UNIX epoch, from the monotonic clock plus the
/// realtime offset captured at startup.
///
/// It can fail if the clocks aren't ready.
pub fn now_nanos() -> Result<u64, TimeError> {
    let offset = CLOCK_OFFSET.as_ref().ok_or(TimeError::ClockNotReady)?;
    let mono = clock_gettime(offset.mono_id)
        .map_err(|_| TimeError::ClockNotReady)?;
    let mono_ns = mono.tv_sec() * NANOS_PER_SECOND as i64 + mono.tv_nsec();
    Ok((offset.offset_ns + mono_ns) as u64)
}

/// Seconds since the UNIX epoch, as a double.
pub fn now_seconds() -> Result<f64, TimeError> {
    Ok(now_nanos()? as f64 / NANOS_PER_SECOND as f64)
}

/// A source of epoch timestamps. The daemon runs on [`SystemClock`];
/// tests can substitute a fixed clock.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> Result<u64, TimeError>;

    fn now_seconds(&self) -> Result<f64, TimeError> {
        Ok(self.now_nanos()? as f64 / NANOS_PER_SECOND as f64)
    }
}

/// The process-wide monotonic-plus-offset clock.
#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> Result<u64, TimeError> {
        now_nanos()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_now_is_monotone() {
        let a = now_nanos().unwrap();
        let b = now_nanos().unwrap();
        assert!(b >= a);
    }

    #[test]
    fn test_now_is_after_2020() {
        // 2020-01-01 in nanos. A sane clock puts us well past it.
        let epoch_2020 = 1_577_836_800u64 * NANOS_PER_SECOND;
        assert!(now_nanos().unwrap() > epoch_2020);
    }

    #[test]
    fn test_seconds_matches_nanos() {
        let secs = now_seconds().unwrap();
        let nanos = now_nanos().unwrap();
        let diff = (secs - nanos as f64 / NANOS_PER_SECOND as f64).abs();
        assert!(diff < 1.0);
    }
}

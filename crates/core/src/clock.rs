//! Wall-clock and NTP time helpers.
//!
//! Monotonic time comes from [`Instant`]; absolute time for RTCP Sender
//! Reports is the 64-bit NTP format of RFC 3550 §4 (seconds since
//! 1900-01-01 in the upper 32 bits, binary fraction in the lower 32).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Current wall-clock time in 64-bit NTP format.
pub fn ntp_now() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    to_ntp(since_unix)
}

/// Convert a duration since the Unix epoch to NTP format.
pub fn to_ntp(since_unix: Duration) -> u64 {
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Middle 32 bits of an NTP timestamp, the "compact" form used by LSR.
pub fn ntp_compact(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// A duration expressed in 1/65536 second units (DLSR, RFC 3550 §6.4.1).
pub fn to_compact_units(d: Duration) -> u32 {
    let units = d.as_secs_f64() * 65536.0;
    units.min(u32::MAX as f64) as u32
}

/// Media clock anchored at stream creation.
///
/// Converts elapsed wall-clock time into RTP timestamp units for a given
/// clock rate, offset by a random base timestamp (RFC 3550 §5.1).
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    origin: Instant,
    base: u32,
}

impl MediaClock {
    pub fn new(base: u32) -> Self {
        Self {
            origin: Instant::now(),
            base,
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// RTP timestamp for `now` at `clock_rate` Hz.
    pub fn rtp_timestamp_at(&self, now: Instant, clock_rate: u32) -> u32 {
        let elapsed = now.saturating_duration_since(self.origin);
        let ticks = elapsed.as_nanos() * clock_rate as u128 / 1_000_000_000;
        self.base.wrapping_add(ticks as u32)
    }

    pub fn rtp_timestamp(&self, clock_rate: u32) -> u32 {
        self.rtp_timestamp_at(Instant::now(), clock_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_epoch_offset() {
        assert_eq!(to_ntp(Duration::ZERO), NTP_UNIX_OFFSET << 32);
    }

    #[test]
    fn ntp_half_second_fraction() {
        let ntp = to_ntp(Duration::from_millis(500));
        assert_eq!(ntp & 0xFFFF_FFFF, 0x8000_0000);
    }

    #[test]
    fn compact_takes_middle_bits() {
        assert_eq!(ntp_compact(0x1122_3344_5566_7788), 0x3344_5566);
    }

    #[test]
    fn compact_units_one_second() {
        assert_eq!(to_compact_units(Duration::from_secs(1)), 65536);
    }

    #[test]
    fn media_clock_ticks_at_rate() {
        let clock = MediaClock::new(1000);
        let later = clock.origin() + Duration::from_millis(100);
        assert_eq!(clock.rtp_timestamp_at(later, 90_000), 1000 + 9000);
    }

    #[test]
    fn media_clock_wraps() {
        let clock = MediaClock::new(u32::MAX);
        let later = clock.origin() + Duration::from_secs(1);
        assert_eq!(clock.rtp_timestamp_at(later, 8000), 7999);
    }
}

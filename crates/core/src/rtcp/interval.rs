//! RTCP transmission interval (RFC 3550 §6.2, §6.3.1).

use std::time::Duration;

/// Minimum interval once the first report has gone out.
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum interval before the first report.
pub const INITIAL_MIN_INTERVAL: Duration = Duration::from_millis(2500);

/// UDP and IPv4 header bytes counted into the average compound size.
pub const TRANSPORT_OVERHEAD: usize = 28;

/// Fraction of the session bandwidth given to RTCP.
const RTCP_BANDWIDTH_FRACTION: f64 = 0.05;

/// Share of the RTCP bandwidth reserved for senders.
const SENDER_FRACTION: f64 = 0.25;

/// Smoothed average compound packet size, `avg_rtcp_size` in §6.3.3.
#[derive(Debug, Clone, Copy)]
pub struct AverageSize(f64);

impl AverageSize {
    /// Initial estimate before anything has been sent or received.
    pub fn new(initial: usize) -> Self {
        Self((initial + TRANSPORT_OVERHEAD) as f64)
    }

    /// Fold in one compound packet of `size` bytes (without UDP/IP headers).
    pub fn update(&mut self, size: usize) {
        let size = (size + TRANSPORT_OVERHEAD) as f64;
        self.0 = size / 16.0 + self.0 * 15.0 / 16.0;
    }

    pub fn get(&self) -> f64 {
        self.0
    }
}

/// Deterministic part of the interval, before randomization.
///
/// `session_bandwidth` is in bytes per second. `members` includes this
/// endpoint, `senders` includes it when `we_sent` is true.
pub fn deterministic_interval(
    members: usize,
    senders: usize,
    session_bandwidth: u32,
    we_sent: bool,
    avg_size: f64,
    initial: bool,
) -> Duration {
    let min = if initial {
        INITIAL_MIN_INTERVAL
    } else {
        MIN_INTERVAL
    };
    let rtcp_bw = session_bandwidth as f64 * RTCP_BANDWIDTH_FRACTION;
    if rtcp_bw <= 0.0 {
        return min;
    }

    let members = members.max(1);
    let senders = senders.min(members);
    let (n, bw) = if (senders as f64) <= members as f64 * SENDER_FRACTION {
        if we_sent {
            (senders.max(1), rtcp_bw * SENDER_FRACTION)
        } else {
            ((members - senders).max(1), rtcp_bw * (1.0 - SENDER_FRACTION))
        }
    } else {
        (members, rtcp_bw)
    };

    let t = avg_size * n as f64 / bw;
    Duration::from_secs_f64(t).max(min)
}

/// Randomized interval: the deterministic value scaled by a uniform
/// factor in `[0.5, 1.5]`.
pub fn rtcp_interval(
    members: usize,
    senders: usize,
    session_bandwidth: u32,
    we_sent: bool,
    avg_size: f64,
    initial: bool,
) -> Duration {
    let td = deterministic_interval(members, senders, session_bandwidth, we_sent, avg_size, initial);
    td.mul_f64(0.5 + rand::random::<f64>())
}

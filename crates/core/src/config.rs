//! Stream flags and runtime options.

use std::time::Duration;

use crate::error::{Result, RtpError};

/// Bytes of IPv4 + UDP header (20 + 8) and RTP fixed header (12) subtracted
/// from the MTU to get the largest RTP payload.
pub const PACKET_OVERHEAD: usize = 28 + 12;

pub const DEFAULT_MTU: usize = 1440;
pub const DEFAULT_REORDER_WINDOW: Duration = Duration::from_millis(200);
pub const DEFAULT_PULL_QUEUE_CAPACITY: usize = 64;

/// Default session bandwidth in bytes per second used for the RTCP interval.
pub const DEFAULT_SESSION_BANDWIDTH: u32 = 64_000;

/// Smallest MTU that still leaves room for an FU header and some data.
const MIN_MTU: usize = PACKET_OVERHEAD + 16;

bitflags::bitflags! {
    /// Creation-time and runtime stream options.
    pub struct StreamFlags: u32 {
        /// Disable the sender path.
        const RECEIVE_ONLY = 1 << 0;
        /// Disable the receiver path.
        const SEND_ONLY = 1 << 1;
        /// Deliver H.26x NAL units without the `00 00 00 01` prefix.
        const NO_H26X_PREPEND_SC = 1 << 2;
        /// Enable SRTP.
        const SRTP = 1 << 3;
        /// Caller supplies the SRTP master key via `set_srtp_key`.
        const SRTP_KMNGMNT_USER = 1 << 4;
        /// Batch all packets of one flush into a single system call.
        const SYSTEM_CALL_DISPATCHER = 1 << 5;
        /// Reassemble fragmented Generic frames on receive.
        const FRAGMENT_GENERIC = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Per-call options for `push_frame`.
    pub struct PushFlags: u32 {
        /// Input is exactly one NAL unit; skip the Annex-B start code scan.
        const NO_H26X_SCL = 1 << 0;
    }
}

impl StreamFlags {
    /// Flags that may be toggled with `configure` after creation.
    pub const RUNTIME: StreamFlags = StreamFlags::from_bits_truncate(
        StreamFlags::NO_H26X_PREPEND_SC.bits()
            | StreamFlags::SYSTEM_CALL_DISPATCHER.bits()
            | StreamFlags::FRAGMENT_GENERIC.bits(),
    );

    pub fn is_sender(self) -> bool {
        !self.contains(StreamFlags::RECEIVE_ONLY)
    }

    pub fn is_receiver(self) -> bool {
        !self.contains(StreamFlags::SEND_ONLY)
    }

    /// Reject contradictory creation flags.
    pub fn validate(self) -> Result<()> {
        if self.contains(StreamFlags::RECEIVE_ONLY | StreamFlags::SEND_ONLY) {
            return Err(RtpError::invalid(
                "RECEIVE_ONLY and SEND_ONLY are mutually exclusive",
            ));
        }
        if self.contains(StreamFlags::SRTP_KMNGMNT_USER) && !self.contains(StreamFlags::SRTP) {
            return Err(RtpError::invalid("SRTP_KMNGMNT_USER requires SRTP"));
        }
        Ok(())
    }
}

/// Valued runtime options for `MediaStream::configure_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOption {
    /// `SO_SNDBUF` and `SO_RCVBUF`, in bytes.
    UdpBufSize,
    /// How long the H.26x reassembler waits for late fragments.
    ReorderWindowMs,
    /// Path MTU; the largest RTP payload is `MTU - 40`.
    MtuSize,
    /// Capacity of the pull-mode frame queue.
    PullQueueCapacity,
    /// Session bandwidth in bytes per second for the RTCP interval.
    RtcpBandwidth,
}

/// Resolved per-stream settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub flags: StreamFlags,
    pub mtu: usize,
    pub reorder_window: Duration,
    pub pull_queue_capacity: usize,
    pub udp_buf_size: Option<usize>,
    pub session_bandwidth: u32,
    /// SDES CNAME; `None` derives one from the SSRC.
    pub cname: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flags: StreamFlags::empty(),
            mtu: DEFAULT_MTU,
            reorder_window: DEFAULT_REORDER_WINDOW,
            pull_queue_capacity: DEFAULT_PULL_QUEUE_CAPACITY,
            udp_buf_size: None,
            session_bandwidth: DEFAULT_SESSION_BANDWIDTH,
            cname: None,
        }
    }
}

impl StreamConfig {
    pub fn with_flags(flags: StreamFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Largest RTP payload (excluding the 12-byte RTP header).
    pub fn max_payload(&self) -> usize {
        self.mtu - PACKET_OVERHEAD
    }

    /// Toggle a runtime flag on.
    pub fn enable(&mut self, flag: StreamFlags) -> Result<()> {
        if flag.is_empty() || !StreamFlags::RUNTIME.contains(flag) {
            return Err(RtpError::invalid(format!(
                "{flag:?} cannot be changed after creation"
            )));
        }
        self.flags.insert(flag);
        Ok(())
    }

    /// Apply a valued option.
    pub fn apply(&mut self, option: ConfigOption, value: i64) -> Result<()> {
        if value <= 0 {
            return Err(RtpError::invalid(format!(
                "{option:?} must be positive, got {value}"
            )));
        }
        let value_usize = usize::try_from(value)
            .map_err(|_| RtpError::invalid(format!("{option:?} value {value} out of range")))?;

        match option {
            ConfigOption::UdpBufSize => self.udp_buf_size = Some(value_usize),
            ConfigOption::ReorderWindowMs => {
                self.reorder_window = Duration::from_millis(value as u64)
            }
            ConfigOption::MtuSize => {
                if value_usize < MIN_MTU || value_usize > u16::MAX as usize {
                    return Err(RtpError::invalid(format!(
                        "MTU {value} outside {MIN_MTU}..=65535"
                    )));
                }
                self.mtu = value_usize;
            }
            ConfigOption::PullQueueCapacity => self.pull_queue_capacity = value_usize,
            ConfigOption::RtcpBandwidth => {
                self.session_bandwidth = u32::try_from(value).map_err(|_| {
                    RtpError::invalid(format!("RTCP bandwidth {value} out of range"))
                })?
            }
        }
        tracing::debug!(?option, value, "stream option applied");
        Ok(())
    }

    pub fn cname_for(&self, ssrc: u32) -> String {
        self.cname
            .clone()
            .unwrap_or_else(|| format!("rtp-{ssrc:08x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn default_max_payload() {
        assert_eq!(StreamConfig::default().max_payload(), 1400);
    }

    #[test]
    fn roles() {
        assert!(StreamFlags::RECEIVE_ONLY.is_receiver());
        assert!(!StreamFlags::RECEIVE_ONLY.is_sender());
        assert!(StreamFlags::SEND_ONLY.is_sender());
        assert!(!StreamFlags::SEND_ONLY.is_receiver());
        assert!(StreamFlags::empty().is_sender() && StreamFlags::empty().is_receiver());
    }

    #[test]
    fn contradictory_roles_rejected() {
        let err = (StreamFlags::RECEIVE_ONLY | StreamFlags::SEND_ONLY)
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn creation_flags_not_runtime_toggleable() {
        let mut cfg = StreamConfig::default();
        assert!(cfg.enable(StreamFlags::NO_H26X_PREPEND_SC).is_ok());
        assert!(cfg.flags.contains(StreamFlags::NO_H26X_PREPEND_SC));
        assert_eq!(
            cfg.enable(StreamFlags::SEND_ONLY).unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
        assert_eq!(
            cfg.enable(StreamFlags::SRTP).unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn apply_options() {
        let mut cfg = StreamConfig::default();
        cfg.apply(ConfigOption::ReorderWindowMs, 50).unwrap();
        assert_eq!(cfg.reorder_window, Duration::from_millis(50));
        cfg.apply(ConfigOption::MtuSize, 1240).unwrap();
        assert_eq!(cfg.max_payload(), 1200);
        cfg.apply(ConfigOption::UdpBufSize, 4 * 1024 * 1024).unwrap();
        assert_eq!(cfg.udp_buf_size, Some(4 * 1024 * 1024));
    }

    #[test]
    fn non_positive_values_rejected() {
        let mut cfg = StreamConfig::default();
        assert!(cfg.apply(ConfigOption::UdpBufSize, 0).is_err());
        assert!(cfg.apply(ConfigOption::ReorderWindowMs, -5).is_err());
        assert!(cfg.apply(ConfigOption::MtuSize, 20).is_err());
    }

    #[test]
    fn default_cname_from_ssrc() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.cname_for(0xAB), "rtp-000000ab");
    }
}

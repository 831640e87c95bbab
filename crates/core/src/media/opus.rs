//! Opus RTP payload format (RFC 7587).
//!
//! One Opus packet per RTP packet, marker bit set on each. The RTP clock
//! always runs at 48 kHz whatever the encoder's internal rate.

use crate::config::PushFlags;
use crate::error::{Result, RtpError};
use crate::queue::FrameQueue;

use super::Packetizer;

pub const CLOCK_RATE: u32 = 48_000;

/// Stream-level Opus parameters surfaced with every received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpusConfig {
    /// 1 (mono) or 2 (stereo).
    pub channels: u8,
    /// TOC configuration number, 0..=31 (RFC 6716 §3.1).
    pub config_number: u8,
}

impl OpusConfig {
    pub fn new(channels: u8, config_number: u8) -> Result<Self> {
        let config = Self {
            channels,
            config_number,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=2).contains(&self.channels) {
            return Err(RtpError::invalid(format!(
                "Opus channel count {} not in 1..=2",
                self.channels
            )));
        }
        if self.config_number > 31 {
            return Err(RtpError::invalid(format!(
                "Opus config number {} not in 0..=31",
                self.config_number
            )));
        }
        Ok(())
    }

    /// Read the configuration out of a packet's TOC byte.
    pub fn from_toc(toc: u8) -> Self {
        Self {
            channels: if toc & 0x04 != 0 { 2 } else { 1 },
            config_number: toc >> 3,
        }
    }
}

/// One Opus packet per RTP packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpusPacketizer;

impl Packetizer for OpusPacketizer {
    fn packetize<'a>(
        &self,
        queue: &mut FrameQueue<'a>,
        data: &'a [u8],
        _flags: PushFlags,
        max_payload: usize,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(RtpError::invalid("empty Opus packet"));
        }
        if data.len() > max_payload {
            return Err(RtpError::invalid(format!(
                "Opus packet of {} bytes exceeds payload size {max_payload}",
                data.len()
            )));
        }
        queue.enqueue(&[], data, true);
        Ok(())
    }
}

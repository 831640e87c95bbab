//! Payload formats and RTP packetization.
//!
//! Each encoded frame handed to a stream is split into one or more RTP
//! packets by the stream's [`Packetizer`]; inbound packets are turned
//! back into frames by the [`reassembly::Reassembler`].
//!
//! ## Supported formats
//!
//! | Format  | Module      | RFC | Payload type | Clock rate |
//! |---------|-------------|-----|--------------|------------|
//! | Generic | [`generic`] | -   | 0            | caller-set |
//! | H.264   | [`h264`]    | [RFC 6184](https://tools.ietf.org/html/rfc6184) | 95 | 90000 |
//! | H.265   | [`h265`]    | [RFC 7798](https://tools.ietf.org/html/rfc7798) | 96 | 90000 |
//! | Opus    | [`opus`]    | [RFC 7587](https://tools.ietf.org/html/rfc7587) | 97 | 48000 |

pub mod generic;
pub mod h264;
pub mod h265;
pub mod h26x;
pub mod opus;
pub mod reassembly;
pub mod rtp;

use std::fmt;

use crate::config::PushFlags;
use crate::error::Result;
use crate::queue::FrameQueue;

/// Codec-specific RTP packetizer.
///
/// Implementations enqueue the packets of one frame on `queue` in wire
/// order and decide where the marker bit goes. Payload bytes are
/// borrowed from `data`; only small per-packet prefixes are copied.
pub trait Packetizer: Send + Sync {
    fn packetize<'a>(
        &self,
        queue: &mut FrameQueue<'a>,
        data: &'a [u8],
        flags: PushFlags,
        max_payload: usize,
    ) -> Result<()>;
}

/// RTP payload format of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadFormat {
    Generic,
    H264,
    H265,
    Opus,
}

impl PayloadFormat {
    /// RTP payload type written into outbound headers.
    pub fn payload_type(self) -> u8 {
        match self {
            Self::Generic => 0,
            Self::H264 => 95,
            Self::H265 => 96,
            Self::Opus => 97,
        }
    }

    /// Clock rate implied by the format, `None` for Generic.
    pub fn default_clock_rate(self) -> Option<u32> {
        match self {
            Self::Generic => None,
            Self::H264 | Self::H265 => Some(90_000),
            Self::Opus => Some(opus::CLOCK_RATE),
        }
    }

    pub fn packetizer(self) -> &'static dyn Packetizer {
        match self {
            Self::Generic => &generic::GenericPacketizer,
            Self::H264 => &h264::H264,
            Self::H265 => &h265::H265,
            Self::Opus => &opus::OpusPacketizer,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::H264 => "H264",
            Self::H265 => "H265",
            Self::Opus => "opus",
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

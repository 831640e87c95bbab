//! H.264 RTP payload format (RFC 6184).
//!
//! Outbound NAL units are sent as:
//!
//! - **Single NAL Unit** (§5.6) when they fit the payload size.
//! - **FU-A** (§5.8) otherwise, each fragment prefixed by:
//!
//!   ```text
//!   FU indicator:  [F|NRI|Type=28]     (1 byte)
//!   FU header:     [S|E|R|NAL_Type]    (1 byte)
//!   Fragment data: [...]
//!   ```
//!
//! Inbound, STAP-A (§5.7.1) aggregates are also accepted. STAP-B, MTAP
//! and FU-B (interleaved mode) are rejected as malformed.

use crate::config::PushFlags;
use crate::error::Result;
use crate::media::rtp::PacketError;
use crate::queue::{FrameQueue, MAX_PREFIX_LEN};

use super::Packetizer;
use super::h26x::{self, FragmentUnit, NalHeader, NalPayload, NalSyntax};

pub const NAL_TYPE_STAP_A: u8 = 24;
pub const NAL_TYPE_FU_A: u8 = 28;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// H.264 packetizer and NAL syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct H264;

impl NalSyntax for H264 {
    const HEADER_LEN: usize = 1;
    const FU_PREFIX_LEN: usize = 2;

    fn fu_prefix(nal_header: &[u8], start: bool, end: bool) -> [u8; MAX_PREFIX_LEN] {
        let nal = nal_header[0];
        let mut fu_header = nal & 0x1F;
        if start {
            fu_header |= FU_START;
        }
        if end {
            fu_header |= FU_END;
        }
        [(nal & 0xE0) | NAL_TYPE_FU_A, fu_header, 0]
    }

    fn classify(payload: &[u8]) -> std::result::Result<NalPayload<'_>, PacketError> {
        let first = *payload.first().ok_or(PacketError::MalformedPayload)?;
        match first & 0x1F {
            1..=23 => Ok(NalPayload::Single(payload)),
            NAL_TYPE_STAP_A => h26x::split_aggregate(&payload[1..]).map(NalPayload::Aggregate),
            NAL_TYPE_FU_A => {
                if payload.len() < 3 {
                    return Err(PacketError::MalformedPayload);
                }
                let fu_header = payload[1];
                Ok(NalPayload::Fragment(FragmentUnit {
                    start: fu_header & FU_START != 0,
                    end: fu_header & FU_END != 0,
                    nal_header: NalHeader::one((first & 0xE0) | (fu_header & 0x1F)),
                    data: &payload[2..],
                }))
            }
            _ => Err(PacketError::MalformedPayload),
        }
    }
}

impl Packetizer for H264 {
    fn packetize<'a>(
        &self,
        queue: &mut FrameQueue<'a>,
        data: &'a [u8],
        flags: PushFlags,
        max_payload: usize,
    ) -> Result<()> {
        h26x::packetize::<Self>(queue, data, flags, max_payload)
    }
}

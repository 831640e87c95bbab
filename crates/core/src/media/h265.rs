//! H.265 (HEVC) RTP payload format (RFC 7798).
//!
//! Differs from H.264 in its 2-byte NAL unit header, with the type in
//! bits 1..6 of the first byte. Fragments carry a 3-byte prefix:
//!
//! ```text
//! PayloadHdr: [F|Type=49|LayerId|TID]  (2 bytes)
//! FU header:  [S|E|FuType]             (1 byte)
//! ```
//!
//! Inbound, Aggregation Packets (type 48) are split into their NAL units;
//! PACI packets are rejected.

use crate::config::PushFlags;
use crate::error::Result;
use crate::media::rtp::PacketError;
use crate::queue::{FrameQueue, MAX_PREFIX_LEN};

use super::Packetizer;
use super::h26x::{self, FragmentUnit, NalHeader, NalPayload, NalSyntax};

pub const NAL_TYPE_AP: u8 = 48;
pub const NAL_TYPE_FU: u8 = 49;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

fn nal_type(b0: u8) -> u8 {
    (b0 >> 1) & 0x3F
}

/// H.265 packetizer and NAL syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct H265;

impl NalSyntax for H265 {
    const HEADER_LEN: usize = 2;
    const FU_PREFIX_LEN: usize = 3;

    fn fu_prefix(nal_header: &[u8], start: bool, end: bool) -> [u8; MAX_PREFIX_LEN] {
        let mut fu_header = nal_type(nal_header[0]);
        if start {
            fu_header |= FU_START;
        }
        if end {
            fu_header |= FU_END;
        }
        [
            (nal_header[0] & 0x81) | (NAL_TYPE_FU << 1),
            nal_header[1],
            fu_header,
        ]
    }

    fn classify(payload: &[u8]) -> std::result::Result<NalPayload<'_>, PacketError> {
        if payload.len() < 2 {
            return Err(PacketError::MalformedPayload);
        }
        match nal_type(payload[0]) {
            0..=47 => Ok(NalPayload::Single(payload)),
            NAL_TYPE_AP => h26x::split_aggregate(&payload[2..]).map(NalPayload::Aggregate),
            NAL_TYPE_FU => {
                if payload.len() < 4 {
                    return Err(PacketError::MalformedPayload);
                }
                let fu_header = payload[2];
                Ok(NalPayload::Fragment(FragmentUnit {
                    start: fu_header & FU_START != 0,
                    end: fu_header & FU_END != 0,
                    nal_header: NalHeader::two(
                        (payload[0] & 0x81) | ((fu_header & 0x3F) << 1),
                        payload[1],
                    ),
                    data: &payload[3..],
                }))
            }
            _ => Err(PacketError::MalformedPayload),
        }
    }
}

impl Packetizer for H265 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::{RTP_HEADER_LEN, RtpHeader};

    // IDR_W_RADL, layer 0, TID 1
    const IDR: [u8; 2] = [0x26, 0x01];

    #[test]
    fn large_nal_uses_fu() {
        let mut nal = IDR.to_vec();
        nal.extend(vec![0xAB; 3000]);

        let mut header = RtpHeader::new(96, 1, 0);
        let mut queue = FrameQueue::new(&mut header, 0);
        H265.packetize(&mut queue, &nal, PushFlags::NO_H26X_SCL, 1400)
            .unwrap();
        let packets = queue.datagrams();

        // 3000 body bytes in chunks of 1397
        assert_eq!(packets.len(), 3);
        let first = &packets[0][RTP_HEADER_LEN..];
        assert_eq!(first[0], (0x26 & 0x81) | (49 << 1));
        assert_eq!(first[1], 0x01);
        assert_eq!(first[2], 0x80 | 19);
        assert_eq!(packets[1][RTP_HEADER_LEN + 2], 19);
        assert_eq!(packets[2][RTP_HEADER_LEN + 2], 0x40 | 19);
        assert!(packets[2][1] & 0x80 != 0);
    }

    #[test]
    fn classify_fu_restores_header() {
        let prefix = H265::fu_prefix(&IDR, false, true);
        let mut payload = prefix.to_vec();
        payload.extend_from_slice(&[9, 9]);
        match H265::classify(&payload).unwrap() {
            NalPayload::Fragment(fu) => {
                assert!(!fu.start && fu.end);
                assert_eq!(fu.nal_header.as_slice(), &IDR);
                assert_eq!(fu.data, &[9, 9]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classify_ap_and_single() {
        // AP payload header: type 48
        let payload = [48 << 1, 0x01, 0, 3, 0x40, 0x01, 0xAA, 0, 2, 0x42, 0x01];
        assert_eq!(
            H265::classify(&payload).unwrap(),
            NalPayload::Aggregate(vec![&[0x40, 0x01, 0xAA][..], &[0x42, 0x01][..]])
        );
        assert_eq!(
            H265::classify(&IDR).unwrap(),
            NalPayload::Single(&IDR[..])
        );
        assert_eq!(H265::classify(&[0x26]), Err(PacketError::MalformedPayload));
    }
}

use crate::media::opus::OpusConfig;

/// Length of the RTP fixed header (RFC 3550 §5.1).
pub const RTP_HEADER_LEN: usize = 12;

pub const RTP_VERSION: u8 = 2;

/// Outbound RTP fixed header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Owns the 16-bit wrapping sequence number and the SSRC of one sender.
/// The timestamp is supplied per packet by the caller because all
/// fragments of one NAL unit must share it.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug, Clone)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, sequence: u16) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            sequence,
            "RTP header state created"
        );
        Self { pt, ssrc, sequence }
    }

    /// Random SSRC and initial sequence number, per RFC 3550 §5.1 and §8.1.
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>(), rand::random::<u16>())
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    pub fn write(&mut self, marker: bool, timestamp: u32) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = RTP_VERSION << 6;
        header[1] = ((marker as u8) << 7) | (self.pt & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// Reasons an inbound datagram is not a usable RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet shorter than the RTP fixed header")]
    TooShort,
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("CSRC list runs past the end of the packet")]
    TruncatedCsrc,
    #[error("header extension runs past the end of the packet")]
    TruncatedExtension,
    #[error("invalid padding length")]
    BadPadding,
    #[error("payload is malformed for its format")]
    MalformedPayload,
}

/// Parsed RTP header fields of an inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

/// An inbound RTP packet borrowing its payload from the receive buffer.
#[derive(Debug, Clone)]
pub struct RtpPacket<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// Parse an RTP packet.
    ///
    /// The CSRC list is kept; a header extension is skipped and padding is
    /// stripped from the payload.
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(PacketError::TooShort);
        }

        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(PacketError::BadVersion(version));
        }
        let padding = buf[0] & 0x20 != 0;
        let extension = buf[0] & 0x10 != 0;
        let csrc_count = (buf[0] & 0x0f) as usize;

        let mut offset = RTP_HEADER_LEN;
        let csrc_end = offset + 4 * csrc_count;
        if buf.len() < csrc_end {
            return Err(PacketError::TruncatedCsrc);
        }
        let csrc = buf[offset..csrc_end]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset = csrc_end;

        if extension {
            if buf.len() < offset + 4 {
                return Err(PacketError::TruncatedExtension);
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + 4 * words;
            if buf.len() < offset {
                return Err(PacketError::TruncatedExtension);
            }
        }

        let mut end = buf.len();
        if padding {
            let pad = buf[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(PacketError::BadPadding);
            }
            end -= pad;
        }

        Ok(Self {
            header: PacketHeader {
                marker: buf[1] & 0x80 != 0,
                payload_type: buf[1] & 0x7f,
                sequence: u16::from_be_bytes([buf[2], buf[3]]),
                timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
                ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
                csrc,
            },
            payload: &buf[offset..end],
        })
    }
}

/// A reassembled inbound media frame, owned by whoever receives it.
///
/// For H.26x streams the payload is one NAL unit (with a start code
/// unless `NO_H26X_PREPEND_SC` is set); for Opus one Opus packet; for
/// Generic one RTP payload or, with `FRAGMENT_GENERIC`, one reassembled
/// frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpFrame {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
    /// Stream-level Opus configuration, attached to Opus frames.
    pub opus: Option<OpusConfig>,
}

impl RtpFrame {
    pub fn new(header: PacketHeader, payload: Vec<u8>) -> Self {
        Self {
            header,
            payload,
            opus: None,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

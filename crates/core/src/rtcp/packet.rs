//! RTCP wire format (RFC 3550 §6.4–§6.6).
//!
//! Common header of every RTCP packet:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|   RC    |      PT       |             length            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `length` counts 32-bit words minus one. Packets are stacked into a
//! compound datagram: SR or RR first, then SDES, then optionally BYE.

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;

const SDES_CNAME: u8 = 1;
const HEADER_LEN: usize = 4;
const REPORT_BLOCK_LEN: usize = 24;
const SENDER_INFO_LEN: usize = 20;
/// RC is a 5-bit field.
pub const MAX_REPORT_BLOCKS: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RtcpParseError {
    #[error("RTCP packet too short")]
    TooShort,
    #[error("unsupported RTCP version {0}")]
    BadVersion(u8),
    #[error("RTCP length field exceeds datagram")]
    BadLength,
    #[error("compound packet does not start with SR or RR")]
    BadCompoundStart,
}

/// One reception report block (RFC 3550 §6.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    /// Source this block reports on.
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit signed in the wire format.
    pub cumulative_lost: i32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    fn write(&self, out: &mut Vec<u8>) {
        let lost = self.cumulative_lost.clamp(-0x80_0000, 0x7F_FFFF) as u32 & 0xFF_FFFF;
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(&(((self.fraction_lost as u32) << 24) | lost).to_be_bytes());
        out.extend_from_slice(&self.highest_seq.to_be_bytes());
        out.extend_from_slice(&self.jitter.to_be_bytes());
        out.extend_from_slice(&self.last_sr.to_be_bytes());
        out.extend_from_slice(&self.delay_since_last_sr.to_be_bytes());
    }

    fn read(b: &[u8]) -> Self {
        let lost_word = be32(&b[4..]);
        // sign-extend the 24-bit field
        let cumulative_lost = ((lost_word << 8) as i32) >> 8;
        Self {
            ssrc: be32(b),
            fraction_lost: (lost_word >> 24) as u8,
            cumulative_lost,
            highest_seq: be32(&b[8..]),
            jitter: be32(&b[12..]),
            last_sr: be32(&b[16..]),
            delay_since_last_sr: be32(&b[20..]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

/// SDES chunk; only the CNAME item is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub cname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub sources: Vec<u32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(Vec<SdesChunk>),
    Goodbye(Goodbye),
    /// APP, feedback and other types we do not interpret.
    Other { packet_type: u8 },
}

impl RtcpPacket {
    /// Append the wire form of this packet to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        match self {
            Self::SenderReport(sr) => {
                let reports = &sr.reports[..sr.reports.len().min(MAX_REPORT_BLOCKS)];
                write_header(out, reports.len() as u8, PT_SR);
                out.extend_from_slice(&sr.ssrc.to_be_bytes());
                out.extend_from_slice(&sr.ntp_time.to_be_bytes());
                out.extend_from_slice(&sr.rtp_time.to_be_bytes());
                out.extend_from_slice(&sr.packet_count.to_be_bytes());
                out.extend_from_slice(&sr.octet_count.to_be_bytes());
                reports.iter().for_each(|r| r.write(out));
            }
            Self::ReceiverReport(rr) => {
                let reports = &rr.reports[..rr.reports.len().min(MAX_REPORT_BLOCKS)];
                write_header(out, reports.len() as u8, PT_RR);
                out.extend_from_slice(&rr.ssrc.to_be_bytes());
                reports.iter().for_each(|r| r.write(out));
            }
            Self::SourceDescription(chunks) => {
                let chunks = &chunks[..chunks.len().min(MAX_REPORT_BLOCKS)];
                write_header(out, chunks.len() as u8, PT_SDES);
                for chunk in chunks {
                    let chunk_start = out.len();
                    out.extend_from_slice(&chunk.ssrc.to_be_bytes());
                    if let Some(cname) = &chunk.cname {
                        let text = &cname.as_bytes()[..cname.len().min(255)];
                        out.push(SDES_CNAME);
                        out.push(text.len() as u8);
                        out.extend_from_slice(text);
                    }
                    // null item terminates the list, then pad the chunk
                    out.push(0);
                    while (out.len() - chunk_start) % 4 != 0 {
                        out.push(0);
                    }
                }
            }
            Self::Goodbye(bye) => {
                let sources = &bye.sources[..bye.sources.len().min(MAX_REPORT_BLOCKS)];
                write_header(out, sources.len() as u8, PT_BYE);
                for ssrc in sources {
                    out.extend_from_slice(&ssrc.to_be_bytes());
                }
                if let Some(reason) = &bye.reason {
                    let text = &reason.as_bytes()[..reason.len().min(255)];
                    out.push(text.len() as u8);
                    out.extend_from_slice(text);
                    while (out.len() - start) % 4 != 0 {
                        out.push(0);
                    }
                }
            }
            Self::Other { .. } => return,
        }
        let words = (out.len() - start) / 4 - 1;
        out[start + 2..start + 4].copy_from_slice(&(words as u16).to_be_bytes());
    }

    fn read(packet_type: u8, count: usize, body: &[u8]) -> Result<Self, RtcpParseError> {
        match packet_type {
            PT_SR => {
                if body.len() < 4 + SENDER_INFO_LEN {
                    return Err(RtcpParseError::TooShort);
                }
                Ok(Self::SenderReport(SenderReport {
                    ssrc: be32(body),
                    ntp_time: ((be32(&body[4..]) as u64) << 32) | be32(&body[8..]) as u64,
                    rtp_time: be32(&body[12..]),
                    packet_count: be32(&body[16..]),
                    octet_count: be32(&body[20..]),
                    reports: read_blocks(&body[4 + SENDER_INFO_LEN..], count)?,
                }))
            }
            PT_RR => {
                if body.len() < 4 {
                    return Err(RtcpParseError::TooShort);
                }
                Ok(Self::ReceiverReport(ReceiverReport {
                    ssrc: be32(body),
                    reports: read_blocks(&body[4..], count)?,
                }))
            }
            PT_SDES => Ok(Self::SourceDescription(read_sdes(body, count)?)),
            PT_BYE => {
                if body.len() < 4 * count {
                    return Err(RtcpParseError::TooShort);
                }
                let sources = body[..4 * count].chunks_exact(4).map(be32).collect();
                let rest = &body[4 * count..];
                let reason = rest.first().and_then(|&len| {
                    rest.get(1..1 + len as usize)
                        .map(|text| String::from_utf8_lossy(text).into_owned())
                });
                Ok(Self::Goodbye(Goodbye { sources, reason }))
            }
            other => Ok(Self::Other { packet_type: other }),
        }
    }
}

fn write_header(out: &mut Vec<u8>, count: u8, packet_type: u8) {
    out.push((2 << 6) | (count & 0x1f));
    out.push(packet_type);
    // length is patched once the body is written
    out.extend_from_slice(&[0, 0]);
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn read_blocks(body: &[u8], count: usize) -> Result<Vec<ReportBlock>, RtcpParseError> {
    if body.len() < count * REPORT_BLOCK_LEN {
        return Err(RtcpParseError::TooShort);
    }
    Ok(body
        .chunks_exact(REPORT_BLOCK_LEN)
        .take(count)
        .map(ReportBlock::read)
        .collect())
}

fn read_sdes(body: &[u8], count: usize) -> Result<Vec<SdesChunk>, RtcpParseError> {
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0;
    for _ in 0..count {
        if body.len() < offset + 4 {
            return Err(RtcpParseError::TooShort);
        }
        let chunk_start = offset;
        let ssrc = be32(&body[offset..]);
        offset += 4;
        let mut cname = None;
        loop {
            let item = *body.get(offset).ok_or(RtcpParseError::TooShort)?;
            if item == 0 {
                offset += 1;
                break;
            }
            let len = *body.get(offset + 1).ok_or(RtcpParseError::TooShort)? as usize;
            let text = body
                .get(offset + 2..offset + 2 + len)
                .ok_or(RtcpParseError::TooShort)?;
            if item == SDES_CNAME {
                cname = Some(String::from_utf8_lossy(text).into_owned());
            }
            offset += 2 + len;
        }
        // chunks are padded to a 32-bit boundary
        offset += (4 - (offset - chunk_start) % 4) % 4;
        chunks.push(SdesChunk { ssrc, cname });
    }
    Ok(chunks)
}

/// Serialize packets back to back into one compound datagram.
pub fn build_compound(packets: &[RtcpPacket]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    for packet in packets {
        packet.write(&mut out);
    }
    out
}

/// Parse a compound RTCP datagram.
///
/// The first packet must be SR or RR (RFC 3550 §6.1). Unknown packet
/// types are returned as [`RtcpPacket::Other`].
pub fn parse_compound(buf: &[u8]) -> Result<Vec<RtcpPacket>, RtcpParseError> {
    let mut packets = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let rest = &buf[offset..];
        if rest.len() < HEADER_LEN {
            return Err(RtcpParseError::TooShort);
        }
        let version = rest[0] >> 6;
        if version != 2 {
            return Err(RtcpParseError::BadVersion(version));
        }
        let padding = rest[0] & 0x20 != 0;
        let count = (rest[0] & 0x1f) as usize;
        let packet_type = rest[1];
        let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        if rest.len() < len {
            return Err(RtcpParseError::BadLength);
        }

        let mut body = &rest[HEADER_LEN..len];
        if padding {
            let pad = *body.last().ok_or(RtcpParseError::BadLength)? as usize;
            if pad > body.len() {
                return Err(RtcpParseError::BadLength);
            }
            body = &body[..body.len() - pad];
        }

        if packets.is_empty() && packet_type != PT_SR && packet_type != PT_RR {
            return Err(RtcpParseError::BadCompoundStart);
        }

        packets.push(RtcpPacket::read(packet_type, count, body)?);
        offset += len;
    }

    Ok(packets)
}

//! Shared H.264/H.265 payloadization.
//!
//! Both formats carry Annex B NAL units the same way: small NAL units go
//! out verbatim, large ones are split into Fragmentation Units that carry
//! the original NAL header bits in a 2- or 3-byte prefix. The two formats
//! differ only in NAL header layout, which [`NalSyntax`] abstracts.

use crate::config::PushFlags;
use crate::error::{Result, RtpError};
use crate::media::rtp::PacketError;
use crate::queue::{FrameQueue, MAX_PREFIX_LEN};

/// Annex B start code prepended to delivered NAL units.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// A NAL unit header of one (H.264) or two (H.265) bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader {
    bytes: [u8; 2],
    len: u8,
}

impl NalHeader {
    pub fn one(b0: u8) -> Self {
        Self {
            bytes: [b0, 0],
            len: 1,
        }
    }

    pub fn two(b0: u8, b1: u8) -> Self {
        Self {
            bytes: [b0, b1],
            len: 2,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// One fragment of a Fragmentation Unit with the original header restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentUnit<'a> {
    pub start: bool,
    pub end: bool,
    pub nal_header: NalHeader,
    pub data: &'a [u8],
}

/// Classified RTP payload of an H.26x stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NalPayload<'a> {
    /// One complete NAL unit.
    Single(&'a [u8]),
    /// STAP-A or AP: several complete NAL units.
    Aggregate(Vec<&'a [u8]>),
    Fragment(FragmentUnit<'a>),
}

/// NAL header layout of one H.26x payload format.
pub trait NalSyntax {
    /// Bytes of NAL header stripped before fragmenting.
    const HEADER_LEN: usize;

    /// Bytes of payload header plus FU header on each fragment.
    const FU_PREFIX_LEN: usize;

    /// Fragmentation Unit prefix for a NAL with header `nal_header`.
    fn fu_prefix(nal_header: &[u8], start: bool, end: bool) -> [u8; MAX_PREFIX_LEN];

    /// Classify one inbound RTP payload.
    fn classify(payload: &[u8]) -> std::result::Result<NalPayload<'_>, PacketError>;
}

/// Split an Annex B bitstream into NAL units, without start codes.
///
/// Handles both 4-byte `00 00 00 01` and 3-byte `00 00 01` start codes,
/// mixed freely. Bytes before the first start code are ignored.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;
    // (nal_data_start_index, start_code_length)
    let mut starts: Vec<(usize, usize)> = Vec::new();

    while i + 2 < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            starts.push((i + 4, 4));
            i += 4;
        } else if data[i..i + 3] == [0, 0, 1] {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .filter_map(|(idx, &(start, _))| {
            let end = match starts.get(idx + 1) {
                Some(&(next_start, next_len)) => next_start - next_len,
                None => data.len(),
            };
            (start < end).then(|| &data[start..end])
        })
        .collect()
}

/// Parse the 16-bit-length-prefixed NAL units of a STAP-A/AP body.
pub fn split_aggregate(mut body: &[u8]) -> std::result::Result<Vec<&[u8]>, PacketError> {
    let mut units = Vec::new();
    while !body.is_empty() {
        if body.len() < 2 {
            return Err(PacketError::MalformedPayload);
        }
        let size = u16::from_be_bytes([body[0], body[1]]) as usize;
        if size == 0 || body.len() < 2 + size {
            return Err(PacketError::MalformedPayload);
        }
        units.push(&body[2..2 + size]);
        body = &body[2 + size..];
    }
    if units.is_empty() {
        return Err(PacketError::MalformedPayload);
    }
    Ok(units)
}

/// Enqueue one access unit.
///
/// Unless `NO_H26X_SCL` is set the buffer is scanned for start codes; a
/// buffer without any is sent as a single NAL unit. The marker bit goes
/// on the last packet of the last NAL unit.
pub fn packetize<'a, S: NalSyntax>(
    queue: &mut FrameQueue<'a>,
    data: &'a [u8],
    flags: PushFlags,
    max_payload: usize,
) -> Result<()> {
    if data.is_empty() {
        return Err(RtpError::invalid("empty frame"));
    }
    let nals = if flags.contains(PushFlags::NO_H26X_SCL) {
        vec![data]
    } else {
        match split_annexb(data) {
            nals if nals.is_empty() => vec![data],
            nals => nals,
        }
    };
    if max_payload <= S::FU_PREFIX_LEN {
        return Err(RtpError::invalid(format!(
            "payload size {max_payload} too small for fragmentation"
        )));
    }

    let count = nals.len();
    for (i, nal) in nals.into_iter().enumerate() {
        let last_nal = i + 1 == count;

        if nal.len() <= max_payload {
            queue.enqueue(&[], nal, last_nal);
            continue;
        }

        let (header, body) = nal.split_at(S::HEADER_LEN);
        let mut chunks = body.chunks(max_payload - S::FU_PREFIX_LEN).peekable();
        let mut start = true;
        let mut fragments = 0usize;
        while let Some(chunk) = chunks.next() {
            let end = chunks.peek().is_none();
            let prefix = S::fu_prefix(header, start, end);
            queue.enqueue(&prefix[..S::FU_PREFIX_LEN], chunk, last_nal && end);
            start = false;
            fragments += 1;
        }

        tracing::trace!(nal_size = nal.len(), fragments, "fragmented NAL unit");
    }
    Ok(())
}

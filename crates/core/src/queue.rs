//! Outbound frame queue.
//!
//! A [`FrameQueue`] collects the RTP packets of one `push_frame` call and
//! hands them to the endpoint in a single flush. It owns the 12-byte RTP
//! header and the small payload-format prefix (FU indicator/header) of
//! every packet; payload bytes are borrowed from the caller's buffer, which
//! must outlive the flush.

use std::io::IoSlice;

use crate::error::Result;
use crate::media::rtp::{RTP_HEADER_LEN, RtpHeader};
use crate::rtcp::stats::StatsSink;
use crate::transport::UdpEndpoint;

/// Largest payload-format prefix: the 3-byte H.265 FU header.
pub const MAX_PREFIX_LEN: usize = 3;

#[derive(Debug)]
struct QueuedPacket<'a> {
    header: [u8; RTP_HEADER_LEN],
    prefix: [u8; MAX_PREFIX_LEN],
    prefix_len: usize,
    payload: &'a [u8],
}

impl QueuedPacket<'_> {
    fn payload_len(&self) -> usize {
        self.prefix_len + self.payload.len()
    }

    fn slices(&self) -> Vec<IoSlice<'_>> {
        let mut iov = Vec::with_capacity(3);
        iov.push(IoSlice::new(&self.header));
        if self.prefix_len > 0 {
            iov.push(IoSlice::new(&self.prefix[..self.prefix_len]));
        }
        if !self.payload.is_empty() {
            iov.push(IoSlice::new(self.payload));
        }
        iov
    }
}

/// Outcome of a successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushSummary {
    pub packets: usize,
    pub payload_octets: usize,
}

/// Packets of one outbound frame, in wire order.
///
/// Sequence numbers are assigned at [`enqueue`](Self::enqueue) time, so
/// enqueue order is wire order. Every packet carries the same RTP
/// timestamp.
pub struct FrameQueue<'a> {
    header: &'a mut RtpHeader,
    timestamp: u32,
    packets: Vec<QueuedPacket<'a>>,
}

impl<'a> FrameQueue<'a> {
    pub fn new(header: &'a mut RtpHeader, timestamp: u32) -> Self {
        Self {
            header,
            timestamp,
            packets: Vec::new(),
        }
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Record one packet: `prefix` is copied, `payload` is borrowed.
    pub fn enqueue(&mut self, prefix: &[u8], payload: &'a [u8], marker: bool) {
        debug_assert!(prefix.len() <= MAX_PREFIX_LEN);
        let prefix_len = prefix.len().min(MAX_PREFIX_LEN);
        let mut stored = [0u8; MAX_PREFIX_LEN];
        stored[..prefix_len].copy_from_slice(&prefix[..prefix_len]);

        self.packets.push(QueuedPacket {
            header: self.header.write(marker, self.timestamp),
            prefix: stored,
            prefix_len,
            payload,
        });
    }

    /// Set the marker bit on the most recently queued packet.
    pub fn mark_last(&mut self) {
        if let Some(last) = self.packets.last_mut() {
            last.header[1] |= 0x80;
        }
    }

    /// Queued packets as contiguous datagrams.
    #[cfg(test)]
    pub(crate) fn datagrams(&self) -> Vec<Vec<u8>> {
        self.packets
            .iter()
            .map(|p| p.slices().iter().flat_map(|s| s.iter().copied()).collect())
            .collect()
    }

    /// Send all queued packets, then clear the queue.
    ///
    /// With `batched` the packets go out in one `sendmmsg` where available;
    /// otherwise one vectored send per packet. The first failing packet
    /// aborts the rest. Statistics are recorded for every packet that
    /// left the socket, including those sent before a failure.
    pub fn flush(
        &mut self,
        endpoint: &UdpEndpoint,
        stats: &dyn StatsSink,
        batched: bool,
    ) -> Result<FlushSummary> {
        let packets = std::mem::take(&mut self.packets);
        let mut summary = FlushSummary::default();

        let record = |summary: &mut FlushSummary, packet: &QueuedPacket<'_>| {
            stats.record_sent(packet.payload_len());
            summary.packets += 1;
            summary.payload_octets += packet.payload_len();
        };

        if batched {
            let iovs: Vec<Vec<IoSlice<'_>>> = packets.iter().map(QueuedPacket::slices).collect();
            let (sent, failure) = match endpoint.send_batch(&iovs) {
                Ok(sent) => (sent, None),
                Err(partial) => (partial.sent, Some(partial.error)),
            };
            for packet in packets.iter().take(sent) {
                record(&mut summary, packet);
            }
            if let Some(error) = failure {
                return Err(error);
            }
        } else {
            for packet in &packets {
                endpoint.send_vectored(&packet.slices())?;
                record(&mut summary, packet);
            }
        }

        tracing::trace!(
            packets = summary.packets,
            octets = summary.payload_octets,
            ts = self.timestamp,
            next_seq = self.header.sequence(),
            "frame queue flushed"
        );

        Ok(summary)
    }
}

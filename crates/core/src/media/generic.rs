//! Generic payload format: opaque bytes, optionally split across packets.

use crate::config::PushFlags;
use crate::error::{Result, RtpError};
use crate::queue::FrameQueue;

use super::Packetizer;

/// Sends a frame as one packet, or as `max_payload`-sized chunks with the
/// marker bit on the last one.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericPacketizer;

impl Packetizer for GenericPacketizer {
    fn packetize<'a>(
        &self,
        queue: &mut FrameQueue<'a>,
        data: &'a [u8],
        _flags: PushFlags,
        max_payload: usize,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(RtpError::invalid("empty frame"));
        }
        let mut chunks = data.chunks(max_payload).peekable();
        while let Some(chunk) = chunks.next() {
            queue.enqueue(&[], chunk, chunks.peek().is_none());
        }
        Ok(())
    }
}

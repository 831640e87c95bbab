//! Receive path: the per-stream receiver thread and pull-mode queue.
//!
//! The thread drains the stream's UDP endpoint, updates statistics, runs
//! the reassembler and hands completed frames either to the installed
//! receive hook or, without a hook, to a bounded [`PullQueue`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RtpError};
use crate::media::PayloadFormat;
use crate::media::opus::OpusConfig;
use crate::media::reassembly::Reassembler;
use crate::media::rtp::{RTP_HEADER_LEN, RtpFrame, RtpPacket};
use crate::stream::StreamShared;

/// Receive buffer size; the largest possible UDP payload.
pub const MAX_PACKET: usize = 65_536;

/// Hook invoked on the receiver thread with every completed frame.
pub type ReceiveHook = Box<dyn Fn(RtpFrame) + Send + Sync>;

#[derive(Debug)]
struct PullState {
    frames: VecDeque<RtpFrame>,
    capacity: usize,
    closed: bool,
}

/// Bounded frame queue for streams without a receive hook.
///
/// When full, the oldest frame is discarded to make room.
#[derive(Debug)]
pub struct PullQueue {
    state: Mutex<PullState>,
    ready: Condvar,
}

impl PullQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PullState {
                frames: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity.max(1);
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a frame, returning how many old frames were discarded.
    pub fn push(&self, frame: RtpFrame) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        while state.frames.len() >= state.capacity {
            state.frames.pop_front();
            dropped += 1;
        }
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        dropped
    }

    /// Take the oldest frame, waiting up to `timeout` (forever on `None`).
    ///
    /// Returns `Ok(None)` when the timeout expires and [`RtpError::Eof`]
    /// once the queue is closed and drained.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Option<RtpFrame>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Ok(Some(frame));
            }
            if state.closed {
                return Err(RtpError::Eof);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out()
                        && state.frames.is_empty()
                        && !state.closed
                    {
                        return Ok(None);
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Wake all waiters; later pops drain what is left, then fail with EOF.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

/// Receiver thread body. Returns when the stream shuts down or the
/// socket fails.
pub(crate) fn run(shared: &StreamShared) {
    let mut buf = vec![0u8; MAX_PACKET];
    let mut reassembler = Reassembler::new(shared.format);

    tracing::debug!(stream = shared.id, local = %shared.endpoint.local_addr(), "receiver started");

    while !shared.shutdown.load(Ordering::SeqCst) {
        match shared.endpoint.recv_into(&mut buf) {
            Ok((len, from)) => handle_datagram(shared, &mut reassembler, &buf[..len], from),
            Err(RtpError::Interrupted) => {}
            Err(e) => {
                tracing::error!(stream = shared.id, error = %e, "receive failed; receiver exiting");
                shared.mark_fatal(e.kind());
                break;
            }
        }

        let window = shared.config.read().reorder_window;
        let lost = reassembler.evict_stale(Instant::now(), window);
        shared.stats.record_frames_lost(lost);
    }

    shared.queue.close();
    tracing::debug!(stream = shared.id, "receiver stopped");
}

fn handle_datagram(
    shared: &StreamShared,
    reassembler: &mut Reassembler,
    datagram: &[u8],
    from: SocketAddr,
) {
    if datagram.len() < RTP_HEADER_LEN {
        shared.stats.record_malformed();
        tracing::debug!(%from, len = datagram.len(), "runt datagram dropped");
        return;
    }
    let packet = match RtpPacket::parse(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            shared.stats.record_malformed();
            tracing::debug!(%from, error = %e, "malformed RTP packet dropped");
            return;
        }
    };

    let header = &packet.header;
    if header.payload_type != shared.format.payload_type() {
        shared.stats.record_malformed();
        tracing::debug!(
            %from,
            pt = header.payload_type,
            expected = shared.format.payload_type(),
            "foreign payload type dropped"
        );
        return;
    }

    let now = Instant::now();
    shared.stats.record_received(
        header.ssrc,
        header.sequence,
        header.timestamp,
        now,
        packet.payload.len(),
    );

    let flags = shared.config.read().flags;
    match reassembler.push(&packet, flags, now) {
        Ok(out) => {
            shared.stats.record_frames_lost(out.lost);
            for frame in out.frames {
                deliver(shared, frame);
            }
        }
        Err(e) => {
            shared.stats.record_malformed();
            tracing::debug!(
                %from,
                seq = header.sequence,
                format = %shared.format,
                error = %e,
                "undecodable payload dropped"
            );
        }
    }
}

fn deliver(shared: &StreamShared, mut frame: RtpFrame) {
    if shared.format == PayloadFormat::Opus {
        frame.opus = (*shared.opus.lock())
            .or_else(|| frame.payload.first().map(|&toc| OpusConfig::from_toc(toc)));
    }

    let hook = shared.hook.load();
    match &*hook {
        Some(hook) => {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(frame))).is_err() {
                tracing::error!(stream = shared.id, "receive hook panicked");
            }
        }
        None => {
            let dropped = shared.queue.push(frame);
            for _ in 0..dropped {
                shared.stats.record_frame_dropped();
            }
            if dropped > 0 {
                tracing::trace!(stream = shared.id, dropped, "pull queue full");
            }
        }
    }
}

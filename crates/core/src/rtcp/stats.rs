//! Per-stream RTP statistics shared by the send path, the receiver thread
//! and the RTCP thread.
//!
//! Sequence tracking, loss and jitter follow RFC 3550 Appendix A.1, A.3
//! and A.8. Every method takes the lock for a handful of arithmetic
//! operations only.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::clock;
use crate::rtcp::packet::{ReportBlock, SenderReport};

const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;

/// Statistics as seen by the send path and the RTCP engine.
pub trait StatsSink: Send + Sync {
    /// One RTP packet with `payload_octets` payload bytes left the socket.
    fn record_sent(&self, payload_octets: usize);

    /// Remember an inbound SR for LSR/DLSR and the sender's own counters.
    fn record_sender_report(&self, sr: &SenderReport, arrival: Instant);

    /// Keep the report block `reporter` sent about this stream, if any.
    fn record_reception_reports(&self, reporter: u32, blocks: &[ReportBlock]);

    fn record_cname(&self, ssrc: u32, cname: String);

    /// Forget a source after BYE.
    fn remove_source(&self, ssrc: u32);

    /// Report blocks for every source heard from, rolling loss intervals.
    fn reception_reports(&self, now: Instant) -> Vec<ReportBlock>;

    /// `(packets_sent, octets_sent)`.
    fn sender_counts(&self) -> (u64, u64);

    /// Number of remote sources and how many of them have sent an SR.
    fn remote_counts(&self) -> (usize, usize);

    fn snapshot(&self) -> StatsView;
}

/// Reception state for one remote SSRC.
#[derive(Debug, Clone)]
struct SourceState {
    base_seq: u16,
    max_seq: u16,
    cycles: u32,
    bad_seq: Option<u16>,
    received: u64,
    octets: u64,
    expected_prior: u64,
    received_prior: u64,
    prev_arrival: Instant,
    prev_timestamp: u32,
    jitter: f64,
    last_sr: Option<(u64, Instant)>,
    sender_packets: u32,
    sender_octets: u32,
    cname: Option<String>,
    /// False for a source known only from RTCP; sequence state starts on its first RTP packet.
    seeded: bool,
}

impl SourceState {
    fn new(seq: u16, timestamp: u32, arrival: Instant) -> Self {
        Self {
            base_seq: seq,
            max_seq: seq,
            cycles: 0,
            bad_seq: None,
            received: 0,
            octets: 0,
            expected_prior: 0,
            received_prior: 0,
            prev_arrival: arrival,
            prev_timestamp: timestamp,
            jitter: 0.0,
            last_sr: None,
            sender_packets: 0,
            sender_octets: 0,
            cname: None,
            seeded: true,
        }
    }

    fn restart(&mut self, seq: u16) {
        self.base_seq = seq;
        self.max_seq = seq;
        self.cycles = 0;
        self.bad_seq = None;
        self.received = 0;
        self.expected_prior = 0;
        self.received_prior = 0;
    }

    /// RFC 3550 A.1 without the probation phase. Returns `false` for a
    /// packet that looks like a sequence jump and is not counted.
    fn update_seq(&mut self, seq: u16) -> bool {
        let delta = seq.wrapping_sub(self.max_seq);
        if delta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles += 1 << 16;
            }
            self.max_seq = seq;
        } else if delta <= u16::MAX - MAX_MISORDER {
            // Two consecutive packets after a big jump mean the sender restarted.
            if self.bad_seq == Some(seq) {
                self.restart(seq);
            } else {
                self.bad_seq = Some(seq.wrapping_add(1));
                return false;
            }
        }
        // else: duplicate or reordered packet, counted but max_seq unchanged
        true
    }

    fn update_jitter(&mut self, timestamp: u32, arrival: Instant, clock_rate: u32) {
        if self.received > 1 && clock_rate > 0 {
            let arrival_delta = arrival
                .saturating_duration_since(self.prev_arrival)
                .as_secs_f64()
                * clock_rate as f64;
            let ts_delta = timestamp.wrapping_sub(self.prev_timestamp) as i32 as f64;
            let d = arrival_delta - ts_delta;
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.prev_arrival = arrival;
        self.prev_timestamp = timestamp;
    }

    fn extended_max(&self) -> u64 {
        self.cycles as u64 + self.max_seq as u64
    }

    fn expected(&self) -> u64 {
        self.extended_max() + 1 - self.base_seq as u64
    }

    fn cumulative_lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    /// Build a report block and roll the interval counters forward.
    fn report_block(&mut self, ssrc: u32, now: Instant) -> ReportBlock {
        let expected = self.expected();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        let (last_sr, delay_since_last_sr) = match self.last_sr {
            Some((ntp, at)) => (
                clock::ntp_compact(ntp),
                clock::to_compact_units(now.saturating_duration_since(at)),
            ),
            None => (0, 0),
        };

        ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: self.cumulative_lost().clamp(-0x80_0000, 0x7F_FFFF) as i32,
            highest_seq: self.extended_max() as u32,
            jitter: self.jitter as u32,
            last_sr,
            delay_since_last_sr,
        }
    }
}

/// Point-in-time copy of one remote source's statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceView {
    pub ssrc: u32,
    pub packets_received: u64,
    pub octets_received: u64,
    pub highest_seq: u32,
    pub cumulative_lost: i64,
    /// Interarrival jitter in timestamp units.
    pub jitter: f64,
    pub cname: Option<String>,
    /// Packet and octet counts from the source's latest SR.
    pub sender_packets: Option<u32>,
    pub sender_octets: Option<u32>,
}

/// Point-in-time copy of a stream's statistics.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatsView {
    pub ssrc: u32,
    pub packets_sent: u64,
    pub octets_sent: u64,
    /// H.26x/Generic frames dropped by the reassembler.
    pub frames_lost: u64,
    /// Pull-mode frames discarded because the queue was full.
    pub frames_dropped: u64,
    /// Inbound datagrams that failed to parse or depacketize.
    pub malformed_packets: u64,
    pub sources: Vec<SourceView>,
    /// What remote receivers last reported about this stream, by reporter SSRC.
    pub remote_reports: Vec<(u32, ReportBlock)>,
}

#[derive(Debug)]
struct StatsInner {
    ssrc: u32,
    clock_rate: u32,
    packets_sent: u64,
    octets_sent: u64,
    frames_lost: u64,
    frames_dropped: u64,
    malformed: u64,
    sources: HashMap<u32, SourceState>,
    remote_reports: HashMap<u32, ReportBlock>,
}

/// Statistics block of one stream.
///
/// Written by the sending application thread and the receiver thread,
/// read by the RTCP thread.
#[derive(Debug)]
pub struct StreamStats {
    inner: Mutex<StatsInner>,
}

impl StreamStats {
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                ssrc,
                clock_rate,
                packets_sent: 0,
                octets_sent: 0,
                frames_lost: 0,
                frames_dropped: 0,
                malformed: 0,
                sources: HashMap::new(),
                remote_reports: HashMap::new(),
            }),
        }
    }

    pub fn set_ssrc(&self, ssrc: u32) {
        self.inner.lock().ssrc = ssrc;
    }

    pub fn set_clock_rate(&self, clock_rate: u32) {
        self.inner.lock().clock_rate = clock_rate;
    }

    /// Feed one received RTP packet.
    pub fn record_received(
        &self,
        ssrc: u32,
        seq: u16,
        timestamp: u32,
        arrival: Instant,
        payload_octets: usize,
    ) {
        let mut inner = self.inner.lock();
        let clock_rate = inner.clock_rate;
        let source = inner
            .sources
            .entry(ssrc)
            .or_insert_with(|| SourceState::new(seq, timestamp, arrival));
        if !source.seeded {
            source.restart(seq);
            source.prev_arrival = arrival;
            source.prev_timestamp = timestamp;
            source.seeded = true;
        }

        if !source.update_seq(seq) {
            return;
        }
        source.received += 1;
        source.octets += payload_octets as u64;
        source.update_jitter(timestamp, arrival, clock_rate);
    }

    pub fn record_frames_lost(&self, count: u64) {
        if count > 0 {
            self.inner.lock().frames_lost += count;
        }
    }

    pub fn record_frame_dropped(&self) {
        self.inner.lock().frames_dropped += 1;
    }

    pub fn record_malformed(&self) {
        self.inner.lock().malformed += 1;
    }
}

impl StatsSink for StreamStats {
    fn record_sent(&self, payload_octets: usize) {
        let mut inner = self.inner.lock();
        inner.packets_sent += 1;
        inner.octets_sent += payload_octets as u64;
    }

    fn record_sender_report(&self, sr: &SenderReport, arrival: Instant) {
        let mut inner = self.inner.lock();
        if let Some(source) = inner.sources.get_mut(&sr.ssrc) {
            source.last_sr = Some((sr.ntp_time, arrival));
            source.sender_packets = sr.packet_count;
            source.sender_octets = sr.octet_count;
        } else {
            // SR from a source we have not received RTP from yet
            let mut source = SourceState::new(0, sr.rtp_time, arrival);
            source.seeded = false;
            source.last_sr = Some((sr.ntp_time, arrival));
            source.sender_packets = sr.packet_count;
            source.sender_octets = sr.octet_count;
            inner.sources.insert(sr.ssrc, source);
        }
    }

    fn record_reception_reports(&self, reporter: u32, blocks: &[ReportBlock]) {
        let mut inner = self.inner.lock();
        let own = inner.ssrc;
        if let Some(block) = blocks.iter().find(|b| b.ssrc == own) {
            inner.remote_reports.insert(reporter, *block);
        }
    }

    fn record_cname(&self, ssrc: u32, cname: String) {
        if let Some(source) = self.inner.lock().sources.get_mut(&ssrc) {
            source.cname = Some(cname);
        }
    }

    fn remove_source(&self, ssrc: u32) {
        let mut inner = self.inner.lock();
        inner.sources.remove(&ssrc);
        inner.remote_reports.remove(&ssrc);
    }

    fn reception_reports(&self, now: Instant) -> Vec<ReportBlock> {
        let mut inner = self.inner.lock();
        inner
            .sources
            .iter_mut()
            .filter(|(_, s)| s.received > 0)
            .map(|(&ssrc, s)| s.report_block(ssrc, now))
            .collect()
    }

    fn sender_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.packets_sent, inner.octets_sent)
    }

    fn remote_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let senders = inner.sources.values().filter(|s| s.last_sr.is_some()).count();
        (inner.sources.len(), senders)
    }

    fn snapshot(&self) -> StatsView {
        let inner = self.inner.lock();
        let mut sources: Vec<SourceView> = inner
            .sources
            .iter()
            .map(|(&ssrc, s)| SourceView {
                ssrc,
                packets_received: s.received,
                octets_received: s.octets,
                highest_seq: s.extended_max() as u32,
                cumulative_lost: if s.received > 0 { s.cumulative_lost() } else { 0 },
                jitter: s.jitter,
                cname: s.cname.clone(),
                sender_packets: s.last_sr.map(|_| s.sender_packets),
                sender_octets: s.last_sr.map(|_| s.sender_octets),
            })
            .collect();
        sources.sort_by_key(|s| s.ssrc);

        let mut remote_reports: Vec<_> = inner.remote_reports.iter().map(|(&k, &v)| (k, v)).collect();
        remote_reports.sort_by_key(|(k, _)| *k);

        StatsView {
            ssrc: inner.ssrc,
            packets_sent: inner.packets_sent,
            octets_sent: inner.octets_sent,
            frames_lost: inner.frames_lost,
            frames_dropped: inner.frames_dropped,
            malformed_packets: inner.malformed,
            sources,
            remote_reports,
        }
    }
}

//! Receive-side frame reassembly.
//!
//! Fragments are collected per SSRC and RTP timestamp. A fragmented NAL
//! unit (or a fragmented Generic frame) completes once every packet from
//! its first to its last fragment is present; packets may arrive in any
//! order within the reorder window.
//!
//! A frame is counted as lost, exactly once, when its state is evicted
//! with fragments still pending: either because it aged past the reorder
//! window or because a newer timestamp arrived from the same source.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::config::StreamFlags;

use super::PayloadFormat;
use super::h264::H264;
use super::h265::H265;
use super::h26x::{NalHeader, NalPayload, NalSyntax, START_CODE};
use super::rtp::{PacketError, PacketHeader, RtpFrame, RtpPacket};

/// Evicted or finished timestamps remembered per source to discard late fragments.
const RETIRED_TIMESTAMPS: usize = 16;

/// Sources silent this long with nothing pending are forgotten.
const SOURCE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames completed by one packet, and frames given up on meanwhile.
#[derive(Debug, Default)]
pub struct Reassembled {
    pub frames: Vec<RtpFrame>,
    pub lost: u64,
}

#[derive(Debug)]
struct Fragment {
    start: bool,
    end: bool,
    marker: bool,
    nal_header: Option<NalHeader>,
    data: Vec<u8>,
}

#[derive(Debug)]
struct PendingFrame {
    first_seen: Instant,
    header: PacketHeader,
    fragments: HashMap<u16, Fragment>,
    consumed: HashSet<u16>,
    /// Pending fragments with the end flag set.
    ends: usize,
}

impl PendingFrame {
    fn new(header: &PacketHeader, now: Instant) -> Self {
        Self {
            first_seen: now,
            header: header.clone(),
            fragments: HashMap::new(),
            consumed: HashSet::new(),
            ends: 0,
        }
    }

    fn insert(&mut self, seq: u16, fragment: Fragment) {
        self.ends += usize::from(fragment.end);
        self.fragments.insert(seq, fragment);
    }

    fn is_duplicate(&self, seq: u16) -> bool {
        self.consumed.contains(&seq) || self.fragments.contains_key(&seq)
    }

    /// Contiguous FU run through `seq`, from an S fragment to an E fragment.
    fn fu_run(&self, seq: u16) -> Option<(u16, u16)> {
        if self.ends == 0 {
            return None;
        }
        let limit = self.fragments.len();

        let mut first = seq;
        for _ in 0..limit {
            if self.fragments.get(&first)?.start {
                break;
            }
            let prev = first.wrapping_sub(1);
            match self.fragments.get(&prev) {
                Some(p) if !p.end => first = prev,
                _ => return None,
            }
        }
        if !self.fragments.get(&first)?.start {
            return None;
        }

        let last = self.run_end(seq, true)?;
        Some((first, last))
    }

    /// Contiguous Generic run through `seq`, ending at a marker packet.
    ///
    /// The run must begin at the lowest pending sequence of this timestamp,
    /// and at `expected_start` when the previous frame's end is known.
    fn generic_run(&self, seq: u16, expected_start: Option<u16>) -> Option<(u16, u16)> {
        if self.ends == 0 {
            return None;
        }
        let limit = self.fragments.len();

        let mut first = seq;
        for _ in 0..limit {
            let prev = first.wrapping_sub(1);
            match self.fragments.get(&prev) {
                Some(p) if !p.end => first = prev,
                _ => break,
            }
        }
        if self.fragments.keys().any(|&s| seq_before(s, first)) {
            return None;
        }
        if expected_start.is_some_and(|expected| expected != first) {
            return None;
        }

        let last = self.run_end(seq, false)?;
        Some((first, last))
    }

    fn run_end(&self, seq: u16, check_start: bool) -> Option<u16> {
        let mut last = seq;
        for _ in 0..self.fragments.len() {
            if self.fragments.get(&last)?.end {
                return Some(last);
            }
            let next = last.wrapping_add(1);
            match self.fragments.get(&next) {
                Some(n) if !(check_start && n.start) => last = next,
                _ => return None,
            }
        }
        None
    }

    /// Remove the run `first..=last` and build its frame.
    fn take(&mut self, first: u16, last: u16, prefix: &[u8]) -> RtpFrame {
        let mut seq = first;
        let mut payload = prefix.to_vec();
        let mut marker = false;
        loop {
            if let Some(fragment) = self.fragments.remove(&seq) {
                if seq == first {
                    if let Some(nal_header) = fragment.nal_header {
                        payload.extend_from_slice(nal_header.as_slice());
                    }
                }
                payload.extend_from_slice(&fragment.data);
                marker = fragment.marker;
                if fragment.end {
                    self.ends = self.ends.saturating_sub(1);
                }
            }
            self.consumed.insert(seq);
            if seq == last {
                break;
            }
            seq = seq.wrapping_add(1);
        }

        let mut header = self.header.clone();
        header.sequence = first;
        header.marker = marker;
        RtpFrame::new(header, payload)
    }
}

#[derive(Debug)]
struct SourceFrames {
    pending: HashMap<u32, PendingFrame>,
    latest_timestamp: Option<u32>,
    retired: VecDeque<u32>,
    /// First sequence of the next Generic frame, when known.
    next_generic_start: Option<u16>,
    last_seen: Instant,
}

impl SourceFrames {
    fn new(now: Instant) -> Self {
        Self {
            pending: HashMap::new(),
            latest_timestamp: None,
            retired: VecDeque::new(),
            next_generic_start: None,
            last_seen: now,
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) >= SOURCE_IDLE_TIMEOUT
            && self.pending.values().all(|p| p.fragments.is_empty())
    }

    fn retire(&mut self, timestamp: u32) {
        if self.retired.len() == RETIRED_TIMESTAMPS {
            self.retired.pop_front();
        }
        self.retired.push_back(timestamp);
    }

    fn is_retired(&self, timestamp: u32) -> bool {
        self.retired.contains(&timestamp)
    }

    /// Evict states matching `stale`, returning how many were incomplete.
    fn evict(&mut self, mut stale: impl FnMut(u32, &PendingFrame) -> bool) -> u64 {
        let doomed: Vec<u32> = self
            .pending
            .iter()
            .filter(|(ts, p)| stale(**ts, *p))
            .map(|(ts, _)| *ts)
            .collect();

        let mut lost = 0;
        for ts in doomed {
            if let Some(frame) = self.pending.remove(&ts) {
                if !frame.fragments.is_empty() {
                    // Generic frames: resume after this frame's marker if it arrived.
                    self.next_generic_start = frame
                        .fragments
                        .iter()
                        .find(|(_, f)| f.end && f.nal_header.is_none())
                        .map(|(seq, _)| seq.wrapping_add(1));
                    lost += 1;
                    tracing::debug!(
                        ssrc = frame.header.ssrc,
                        ts,
                        fragments = frame.fragments.len(),
                        "incomplete frame dropped"
                    );
                }
                self.retire(ts);
            }
        }
        lost
    }

    fn pending_mut(&mut self, header: &PacketHeader, now: Instant) -> &mut PendingFrame {
        self.pending
            .entry(header.timestamp)
            .or_insert_with(|| PendingFrame::new(header, now))
    }
}

/// Per-stream reassembly state for all remote sources.
#[derive(Debug)]
pub struct Reassembler {
    format: PayloadFormat,
    sources: HashMap<u32, SourceFrames>,
}

impl Reassembler {
    pub fn new(format: PayloadFormat) -> Self {
        Self {
            format,
            sources: HashMap::new(),
        }
    }

    /// Number of timestamps with fragments still waiting.
    pub fn pending(&self) -> usize {
        self.sources
            .values()
            .flat_map(|s| s.pending.values())
            .filter(|p| !p.fragments.is_empty())
            .count()
    }

    /// Feed one parsed packet.
    ///
    /// Errors mean the payload does not fit its format; the packet is
    /// dropped without touching reassembly state.
    pub fn push(
        &mut self,
        packet: &RtpPacket<'_>,
        flags: StreamFlags,
        now: Instant,
    ) -> Result<Reassembled, PacketError> {
        let header = &packet.header;
        let source = self
            .sources
            .entry(header.ssrc)
            .or_insert_with(|| SourceFrames::new(now));
        source.last_seen = now;
        let mut out = Reassembled::default();

        let prepend = !flags.contains(StreamFlags::NO_H26X_PREPEND_SC);
        match self.format {
            PayloadFormat::H264 => {
                push_h26x::<H264>(source, packet, prepend, now, &mut out)?;
            }
            PayloadFormat::H265 => {
                push_h26x::<H265>(source, packet, prepend, now, &mut out)?;
            }
            PayloadFormat::Generic if flags.contains(StreamFlags::FRAGMENT_GENERIC) => {
                push_generic(source, packet, now, &mut out)?;
            }
            PayloadFormat::Generic | PayloadFormat::Opus => {
                if packet.payload.is_empty() {
                    return Err(PacketError::MalformedPayload);
                }
                out.frames
                    .push(RtpFrame::new(header.clone(), packet.payload.to_vec()));
            }
        }

        let newer = match source.latest_timestamp {
            None => true,
            Some(latest) => ts_after(header.timestamp, latest),
        };
        if newer {
            let current = header.timestamp;
            out.lost += source.evict(|ts, _| ts_after(current, ts));
            source.latest_timestamp = Some(current);
        }
        Ok(out)
    }

    /// Drop states older than `window`, returning how many frames were lost.
    ///
    /// Sources that have gone quiet with nothing pending are forgotten.
    pub fn evict_stale(&mut self, now: Instant, window: Duration) -> u64 {
        let lost = self
            .sources
            .values_mut()
            .map(|source| {
                source.evict(|_, p| now.saturating_duration_since(p.first_seen) >= window)
            })
            .sum();
        self.sources.retain(|ssrc, source| {
            let idle = source.is_idle(now);
            if idle {
                tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "idle source forgotten");
            }
            !idle
        });
        lost
    }
}

fn push_h26x<S: NalSyntax>(
    source: &mut SourceFrames,
    packet: &RtpPacket<'_>,
    prepend: bool,
    now: Instant,
    out: &mut Reassembled,
) -> Result<(), PacketError> {
    let header = &packet.header;
    let prefix: &[u8] = if prepend { &START_CODE } else { &[] };

    match S::classify(packet.payload)? {
        NalPayload::Single(nal) => {
            out.frames.push(RtpFrame::new(header.clone(), [prefix, nal].concat()));
        }
        NalPayload::Aggregate(nals) => {
            let count = nals.len();
            for (i, nal) in nals.into_iter().enumerate() {
                let mut frame_header = header.clone();
                frame_header.marker = header.marker && i + 1 == count;
                out.frames
                    .push(RtpFrame::new(frame_header, [prefix, nal].concat()));
            }
        }
        NalPayload::Fragment(fu) => {
            if source.is_retired(header.timestamp) {
                tracing::trace!(seq = header.sequence, ts = header.timestamp, "late fragment discarded");
                return Ok(());
            }
            let pending = source.pending_mut(header, now);
            if pending.is_duplicate(header.sequence) {
                return Ok(());
            }
            pending.insert(
                header.sequence,
                Fragment {
                    start: fu.start,
                    end: fu.end,
                    marker: header.marker,
                    nal_header: Some(fu.nal_header),
                    data: fu.data.to_vec(),
                },
            );
            if let Some((first, last)) = pending.fu_run(header.sequence) {
                out.frames.push(pending.take(first, last, prefix));
            }
        }
    }
    Ok(())
}

fn push_generic(
    source: &mut SourceFrames,
    packet: &RtpPacket<'_>,
    now: Instant,
    out: &mut Reassembled,
) -> Result<(), PacketError> {
    let header = &packet.header;
    if packet.payload.is_empty() {
        return Err(PacketError::MalformedPayload);
    }
    if source.is_retired(header.timestamp) {
        return Ok(());
    }

    let expected_start = source.next_generic_start;
    let pending = source.pending_mut(header, now);
    if pending.is_duplicate(header.sequence) {
        return Ok(());
    }
    pending.insert(
        header.sequence,
        Fragment {
            start: false,
            end: header.marker,
            marker: header.marker,
            nal_header: None,
            data: packet.payload.to_vec(),
        },
    );
    if let Some((first, last)) = pending.generic_run(header.sequence, expected_start) {
        out.frames.push(pending.take(first, last, &[]));
        source.next_generic_start = Some(last.wrapping_add(1));
    }
    Ok(())
}

/// `a` comes after `b` in RTP timestamp order.
fn ts_after(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// `a` comes before `b` in sequence number order.
fn seq_before(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushFlags;
    use crate::media::Packetizer;
    use crate::media::rtp::{RTP_HEADER_LEN, RtpHeader};
    use crate::queue::FrameQueue;

    const WINDOW: Duration = Duration::from_millis(200);

    fn packetize_with(
        format: PayloadFormat,
        data: &[u8],
        ts: u32,
        header: &mut RtpHeader,
        max_payload: usize,
    ) -> Vec<Vec<u8>> {
        let mut queue = FrameQueue::new(header, ts);
        format
            .packetizer()
            .packetize(&mut queue, data, PushFlags::NO_H26X_SCL, max_payload)
            .unwrap();
        queue.datagrams()
    }

    fn packetize(format: PayloadFormat, data: &[u8], ts: u32, header: &mut RtpHeader) -> Vec<Vec<u8>> {
        packetize_with(format, data, ts, header, 1400)
    }

    fn feed(r: &mut Reassembler, datagrams: &[Vec<u8>], flags: StreamFlags, now: Instant) -> Reassembled {
        let mut total = Reassembled::default();
        for datagram in datagrams {
            let packet = RtpPacket::parse(datagram).unwrap();
            let out = r.push(&packet, flags, now).unwrap();
            total.frames.extend(out.frames);
            total.lost += out.lost;
        }
        total
    }

    fn idr(len: usize) -> Vec<u8> {
        let mut nal = vec![0x65];
        nal.extend((1..len).map(|i| (i % 251) as u8));
        nal
    }

    #[test]
    fn single_nal_gets_start_code() {
        let mut header = RtpHeader::new(95, 1, 0);
        let nal = vec![0x41; 40];
        let packets = packetize(PayloadFormat::H264, &nal, 0, &mut header);
        let mut r = Reassembler::new(PayloadFormat::H264);
        let out = feed(&mut r, &packets, StreamFlags::empty(), Instant::now());
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload[..4], START_CODE);
        assert_eq!(out.frames[0].payload[4..], nal[..]);
    }

    #[test]
    fn fu_a_in_order() {
        let mut header = RtpHeader::new(95, 1, 100);
        let nal = idr(4000);
        let packets = packetize(PayloadFormat::H264, &nal, 9000, &mut header);
        assert_eq!(packets.len(), 3);

        let mut r = Reassembler::new(PayloadFormat::H264);
        let out = feed(&mut r, &packets, StreamFlags::NO_H26X_PREPEND_SC, Instant::now());
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload, nal);
        assert_eq!(out.frames[0].header.sequence, 100);
        assert!(out.frames[0].header.marker);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn fu_a_out_of_order() {
        let mut header = RtpHeader::new(95, 1, 65534);
        let nal = idr(4000);
        let packets = packetize(PayloadFormat::H264, &nal, 0, &mut header);
        let reordered = [packets[2].clone(), packets[0].clone(), packets[1].clone()];

        let mut r = Reassembler::new(PayloadFormat::H264);
        let out = feed(&mut r, &reordered, StreamFlags::NO_H26X_PREPEND_SC, Instant::now());
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload, nal);
        assert_eq!(out.lost, 0);
        assert_eq!(r.evict_stale(Instant::now() + WINDOW, WINDOW), 0);
    }

    #[test]
    fn missing_fragment_counts_one_loss() {
        let mut header = RtpHeader::new(95, 1, 0);
        let packets = packetize(PayloadFormat::H264, &idr(4000), 0, &mut header);
        let partial = [packets[0].clone(), packets[2].clone()];

        let mut r = Reassembler::new(PayloadFormat::H264);
        let t0 = Instant::now();
        let out = feed(&mut r, &partial, StreamFlags::empty(), t0);
        assert!(out.frames.is_empty());
        assert_eq!(r.evict_stale(t0 + Duration::from_millis(50), WINDOW), 0);
        assert_eq!(r.evict_stale(t0 + WINDOW, WINDOW), 1);
        assert_eq!(r.evict_stale(t0 + WINDOW * 2, WINDOW), 0);

        // the late fragment must not resurrect the frame or count again
        let out = feed(&mut r, &packets[1..2], StreamFlags::empty(), t0 + WINDOW * 2);
        assert!(out.frames.is_empty());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn newer_timestamp_evicts_incomplete_frame() {
        let mut header = RtpHeader::new(96, 1, 0);
        let first = packetize(
            PayloadFormat::H265,
            &[&[0x26u8, 0x01][..], &[7u8; 3000][..]].concat(),
            0,
            &mut header,
        );
        let second = packetize(PayloadFormat::H265, &[0x02, 0x01, 0xAA], 3000, &mut header);

        let mut r = Reassembler::new(PayloadFormat::H265);
        let now = Instant::now();
        let mut out = feed(&mut r, &first[..2], StreamFlags::empty(), now);
        let next = feed(&mut r, &second, StreamFlags::empty(), now);
        out.lost += next.lost;
        assert_eq!(out.lost, 1);
        assert_eq!(next.frames.len(), 1);
    }

    #[test]
    fn h265_fragments_round_trip() {
        let mut nal = vec![0x26, 0x01];
        nal.extend((0..5000u32).map(|i| (i * 7) as u8));
        let mut header = RtpHeader::new(96, 9, 0);
        let packets = packetize(PayloadFormat::H265, &nal, 0, &mut header);

        let mut r = Reassembler::new(PayloadFormat::H265);
        let out = feed(&mut r, &packets, StreamFlags::NO_H26X_PREPEND_SC, Instant::now());
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload, nal);
    }

    #[test]
    fn two_fragmented_nals_share_timestamp() {
        let mut header = RtpHeader::new(95, 1, 0);
        let a = idr(2000);
        let mut b = vec![0x41];
        b.extend(vec![3u8; 2500]);
        let mut packets = packetize(PayloadFormat::H264, &a, 0, &mut header);
        packets.extend(packetize(PayloadFormat::H264, &b, 0, &mut header));

        let mut r = Reassembler::new(PayloadFormat::H264);
        let out = feed(&mut r, &packets, StreamFlags::NO_H26X_PREPEND_SC, Instant::now());
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.frames[0].payload, a);
        assert_eq!(out.frames[1].payload, b);
    }

    #[test]
    fn stap_a_splits_into_frames() {
        let datagram = {
            let mut header = RtpHeader::new(95, 1, 0);
            let mut d = header.write(true, 0).to_vec();
            d.extend_from_slice(&[0x78, 0, 2, 0x67, 0x42, 0, 2, 0x68, 0xCE]);
            d
        };
        let mut r = Reassembler::new(PayloadFormat::H264);
        let out = feed(&mut r, &[datagram], StreamFlags::NO_H26X_PREPEND_SC, Instant::now());
        let payloads: Vec<_> = out.frames.iter().map(|f| f.payload.clone()).collect();
        assert_eq!(payloads, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
        assert!(!out.frames[0].header.marker);
        assert!(out.frames[1].header.marker);
    }

    #[test]
    fn generic_passthrough_and_fragmented() {
        let data: Vec<u8> = (0..3500u32).map(|i| i as u8).collect();
        let mut header = RtpHeader::new(0, 5, 0);
        let packets = packetize(PayloadFormat::Generic, &data, 0, &mut header);
        assert_eq!(packets.len(), 3);

        let mut r = Reassembler::new(PayloadFormat::Generic);
        let out = feed(&mut r, &packets, StreamFlags::empty(), Instant::now());
        assert_eq!(out.frames.len(), 3);

        // a preceding frame pins down where the fragmented one starts
        let mut header = RtpHeader::new(0, 5, 0);
        let mut packets = packetize(PayloadFormat::Generic, &[9u8; 10], 0, &mut header);
        let fragmented = packetize(PayloadFormat::Generic, &data, 10, &mut header);
        packets.extend([fragmented[1].clone(), fragmented[2].clone(), fragmented[0].clone()]);

        let mut r = Reassembler::new(PayloadFormat::Generic);
        let out = feed(&mut r, &packets, StreamFlags::FRAGMENT_GENERIC, Instant::now());
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.frames[1].payload, data);
        assert_eq!(out.frames[1].header.sequence, 1);
    }

    #[test]
    fn generic_leading_loss_drops_frame() {
        let mut header = RtpHeader::new(0, 5, 0);
        let first = packetize(PayloadFormat::Generic, &[1u8; 100], 0, &mut header);
        let second = packetize(PayloadFormat::Generic, &[2u8; 3000], 10, &mut header);

        let mut r = Reassembler::new(PayloadFormat::Generic);
        let now = Instant::now();
        let out = feed(&mut r, &first, StreamFlags::FRAGMENT_GENERIC, now);
        assert_eq!(out.frames.len(), 1);
        let out = feed(&mut r, &second[1..], StreamFlags::FRAGMENT_GENERIC, now);
        assert!(out.frames.is_empty());
        assert_eq!(r.evict_stale(now + WINDOW, WINDOW), 1);
    }

    #[test]
    fn malformed_payload_rejected() {
        let mut header = RtpHeader::new(95, 1, 0);
        let mut d = header.write(true, 0).to_vec();
        d.extend_from_slice(&[0x7C, 0x85]);
        let packet = RtpPacket::parse(&d).unwrap();
        let mut r = Reassembler::new(PayloadFormat::H264);
        assert_eq!(
            r.push(&packet, StreamFlags::empty(), Instant::now()).unwrap_err(),
            PacketError::MalformedPayload
        );
    }

    #[test]
    fn round_trip_across_payload_sizes() {
        // (format, smallest frame, fragmentation overhead, receive flags)
        let cases = [
            (PayloadFormat::H264, vec![0x65], 2, StreamFlags::NO_H26X_PREPEND_SC),
            (PayloadFormat::H265, vec![0x26, 0x01], 3, StreamFlags::NO_H26X_PREPEND_SC),
            (PayloadFormat::Generic, vec![0x5A], 0, StreamFlags::FRAGMENT_GENERIC),
        ];
        for (format, smallest, overhead, flags) in cases {
            for p in [200usize, 576, 1400] {
                let mut header = RtpHeader::new(format.payload_type(), 7, 65_000);
                let mut r = Reassembler::new(format);
                let now = Instant::now();
                let sizes = [
                    smallest.len(),
                    p - overhead,
                    p - overhead + 1,
                    p,
                    p + 1,
                    2 * p + 7,
                    1 << 20,
                ];
                for (i, n) in sizes.into_iter().enumerate() {
                    let mut data = smallest.clone();
                    let start = data.len();
                    data.extend((start..n).map(|j| (j % 251) as u8));
                    let packets = packetize_with(format, &data, i as u32 * 3000, &mut header, p);

                    let (last, rest) = packets.split_last().unwrap();
                    assert!(
                        packets.iter().all(|d| d.len() - RTP_HEADER_LEN <= p),
                        "{format} p={p} n={n}: oversized payload"
                    );
                    assert!(
                        rest.iter()
                            .all(|d| !RtpPacket::parse(d).unwrap().header.marker),
                        "{format} p={p} n={n}: marker before last packet"
                    );
                    assert!(RtpPacket::parse(last).unwrap().header.marker);

                    let out = feed(&mut r, &packets, flags, now);
                    assert_eq!(out.frames.len(), 1, "{format} p={p} n={n}");
                    assert_eq!(out.frames[0].payload, data, "{format} p={p} n={n}");
                    assert!(out.frames[0].header.marker);
                    assert_eq!(out.lost, 0);
                }
                assert_eq!(r.pending(), 0);
            }
        }
    }

    #[test]
    fn idle_sources_are_forgotten() {
        let mut header = RtpHeader::new(95, 0xAB, 0);
        let packets = packetize(PayloadFormat::H264, &idr(4000), 0, &mut header);
        let mut other = RtpHeader::new(95, 0xCD, 0);
        let partial = packetize(PayloadFormat::H264, &idr(4000), 0, &mut other);

        let mut r = Reassembler::new(PayloadFormat::H264);
        let t0 = Instant::now();
        feed(&mut r, &packets, StreamFlags::empty(), t0);
        assert_eq!(r.evict_stale(t0 + WINDOW, WINDOW), 0);
        assert_eq!(r.sources.len(), 1);

        // a fresh fragment keeps its source alive
        let later = t0 + SOURCE_IDLE_TIMEOUT;
        feed(&mut r, &partial[..1], StreamFlags::empty(), later);
        assert_eq!(r.evict_stale(later, WINDOW), 0);
        assert_eq!(r.sources.len(), 1);
        assert!(r.sources.contains_key(&0xCD));

        // its incomplete frame is counted before the source goes
        let idle = later + SOURCE_IDLE_TIMEOUT;
        assert_eq!(r.evict_stale(idle, WINDOW), 1);
        assert!(r.sources.is_empty());
    }
}

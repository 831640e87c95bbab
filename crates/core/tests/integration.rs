//! End-to-end tests over loopback UDP.
//!
//! Each test uses its own fixed port range so tests can run in parallel.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rtp::media::rtp::{RtpHeader, RtpPacket};
use rtp::rtcp::packet::{RtcpPacket, parse_compound};
use rtp::{ConfigOption, Context, PayloadFormat, PushFlags, RtpFrame, StreamFlags};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn raw_socket(port: u16) -> UdpSocket {
    let socket = UdpSocket::bind((LOCALHOST, port)).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    socket
}

fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    buf.truncate(len);
    buf
}

fn frame_channel() -> (impl Fn(RtpFrame) + Send + Sync + 'static, mpsc::Receiver<RtpFrame>) {
    let (tx, rx) = mpsc::channel();
    (
        move |frame| {
            let _ = tx.send(frame);
        },
        rx,
    )
}

fn idr(len: usize) -> Vec<u8> {
    let mut nal = vec![0x65];
    nal.extend((1..len).map(|i| (i % 253) as u8));
    nal
}

#[test]
fn single_nal_unit_gets_start_code() {
    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let rx = session
        .create_unidirectional_stream(19000, PayloadFormat::H264, StreamFlags::RECEIVE_ONLY)
        .unwrap();
    let (hook, frames) = frame_channel();
    rx.install_receive_hook(hook).unwrap();

    let tx = session
        .create_unidirectional_stream(19000, PayloadFormat::H264, StreamFlags::SEND_ONLY)
        .unwrap();
    let mut nal = vec![0x41];
    nal.extend(vec![0x11; 39]);
    let mut annexb = vec![0, 0, 0, 1];
    annexb.extend_from_slice(&nal);
    tx.push_frame(&annexb, PushFlags::empty()).unwrap();

    let frame = frames.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.payload, annexb);
    assert_eq!(frame.payload_len(), 44);
    assert!(frame.header.marker);
    assert_eq!(frame.header.payload_type, 95);

    ctx.destroy_session(&session).unwrap();
}

/// Push a 4000-byte IDR and capture its packets on a plain socket.
fn capture_idr_packets(sink_port: u16) -> (Vec<u8>, Vec<Vec<u8>>) {
    let sink = raw_socket(sink_port);
    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let tx = session
        .create_unidirectional_stream(sink_port, PayloadFormat::H264, StreamFlags::SEND_ONLY)
        .unwrap();

    let nal = idr(4000);
    tx.push_frame(&nal, PushFlags::NO_H26X_SCL).unwrap();
    let packets = (0..3).map(|_| recv_datagram(&sink)).collect();
    ctx.destroy_session(&session).unwrap();
    (nal, packets)
}

#[test]
fn fu_a_fragments_on_the_wire() {
    let (nal, packets) = capture_idr_packets(19010);
    let parsed: Vec<RtpPacket<'_>> = packets.iter().map(|p| RtpPacket::parse(p).unwrap()).collect();

    let fu_headers: Vec<u8> = parsed.iter().map(|p| p.payload[1]).collect();
    assert_eq!(fu_headers, vec![0x85, 0x05, 0x45]);
    assert!(parsed.iter().all(|p| p.payload[0] == 0x7C));
    assert!(parsed.iter().all(|p| p.payload.len() <= 1400));

    let ts = parsed[0].header.timestamp;
    assert!(parsed.iter().all(|p| p.header.timestamp == ts));
    let seq = parsed[0].header.sequence;
    for (i, p) in parsed.iter().enumerate() {
        assert_eq!(p.header.sequence, seq.wrapping_add(i as u16));
        assert_eq!(p.header.marker, i == 2);
    }

    let body: Vec<u8> = parsed.iter().flat_map(|p| p.payload[2..].iter().copied()).collect();
    assert_eq!(body, nal[1..]);
}

#[test]
fn out_of_order_fragments_reassemble() {
    let (nal, packets) = capture_idr_packets(19020);

    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let rx = session
        .create_unidirectional_stream(
            19021,
            PayloadFormat::H264,
            StreamFlags::RECEIVE_ONLY | StreamFlags::NO_H26X_PREPEND_SC,
        )
        .unwrap();
    let (hook, frames) = frame_channel();
    rx.install_receive_hook(hook).unwrap();

    let source = raw_socket(0);
    for i in [2, 0, 1] {
        source.send_to(&packets[i], (LOCALHOST, 19021)).unwrap();
    }

    let frame = frames.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.payload, nal);
    assert!(frames.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(rx.stats().frames_lost, 0);

    ctx.destroy_session(&session).unwrap();
}

#[test]
fn dropped_fragment_counts_one_lost_frame() {
    let (_, packets) = capture_idr_packets(19030);

    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let rx = session
        .create_unidirectional_stream(19031, PayloadFormat::H264, StreamFlags::RECEIVE_ONLY)
        .unwrap();
    rx.configure_value(ConfigOption::ReorderWindowMs, 50).unwrap();
    let (hook, frames) = frame_channel();
    rx.install_receive_hook(hook).unwrap();

    let source = raw_socket(0);
    source.send_to(&packets[0], (LOCALHOST, 19031)).unwrap();
    source.send_to(&packets[2], (LOCALHOST, 19031)).unwrap();

    assert!(frames.recv_timeout(Duration::from_millis(400)).is_err());
    let stats = rx.stats();
    assert_eq!(stats.frames_lost, 1);
    assert_eq!(stats.sources[0].packets_received, 2);

    ctx.destroy_session(&session).unwrap();
}

#[test]
fn proxy_rewrites_ssrc_and_sequence() {
    const INGRESS: u16 = 19040;
    const EGRESS: u16 = 19041;

    let sink = raw_socket(EGRESS);
    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();

    let forward = session
        .create_unidirectional_stream(EGRESS, PayloadFormat::H264, StreamFlags::SEND_ONLY)
        .unwrap();
    let ingress = session
        .create_unidirectional_stream(
            INGRESS,
            PayloadFormat::H264,
            StreamFlags::RECEIVE_ONLY | StreamFlags::NO_H26X_PREPEND_SC,
        )
        .unwrap();
    let out = Arc::clone(&forward);
    ingress
        .install_receive_hook(move |frame| {
            let _ = out.push_frame_with_timestamp(
                &frame.payload,
                frame.header.timestamp,
                PushFlags::NO_H26X_SCL,
            );
        })
        .unwrap();

    let source = raw_socket(0);
    let mut header = RtpHeader::new(95, 0x5151_5151, 40_000);
    for i in 0..100u32 {
        let mut packet = header.write(true, i * 3000).to_vec();
        packet.extend_from_slice(&[0x41, i as u8, 0xAA, 0xBB]);
        source.send_to(&packet, (LOCALHOST, INGRESS)).unwrap();
        if i % 10 == 9 {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    let mut sequences = Vec::new();
    for _ in 0..100 {
        let datagram = recv_datagram(&sink);
        let packet = RtpPacket::parse(&datagram).unwrap();
        assert_eq!(packet.header.ssrc, forward.ssrc());
        assert_ne!(packet.header.ssrc, 0x5151_5151);
        sequences.push(packet.header.sequence);
    }
    let first = sequences[0];
    let expected: Vec<u16> = (0..100).map(|i| first.wrapping_add(i)).collect();
    assert_eq!(sequences, expected);

    ctx.destroy_session(&session).unwrap();
}

#[test]
fn rtcp_sender_reports_while_sending_then_bye() {
    const MEDIA: u16 = 19050;
    const RTCP_LOCAL: u16 = 19052;
    const RTCP_SINK: u16 = 19053;

    let _media_sink = raw_socket(MEDIA);
    let rtcp_sink = raw_socket(RTCP_SINK);
    // report intervals are randomized around five seconds
    rtcp_sink
        .set_read_timeout(Some(Duration::from_secs(15)))
        .unwrap();

    let (reports_tx, reports) = mpsc::channel();
    let collector = std::thread::spawn(move || {
        loop {
            let packets = parse_compound(&recv_datagram(&rtcp_sink)).unwrap();
            let bye = matches!(packets.last(), Some(RtcpPacket::Goodbye(_)));
            reports_tx.send(packets).unwrap();
            if bye {
                break;
            }
        }
    });

    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let tx = session
        .create_unidirectional_stream(MEDIA, PayloadFormat::H264, StreamFlags::SEND_ONLY)
        .unwrap();
    tx.create_rtcp(LOCALHOST, RTCP_SINK, RTCP_LOCAL).unwrap();

    // octets[n] is the payload total after n frames
    let mut octets = vec![0u32];
    for i in 0..150usize {
        let mut nal = vec![0x41];
        nal.extend(vec![0x22; 20 + i]);
        octets.push(octets[i] + nal.len() as u32);
        tx.push_frame(&nal, PushFlags::NO_H26X_SCL).unwrap();
        std::thread::sleep(Duration::from_millis(33));
    }

    let during: Vec<Vec<RtcpPacket>> = reports.try_iter().collect();
    let periodic: Vec<_> = during
        .iter()
        .filter_map(|packets| match &packets[0] {
            RtcpPacket::SenderReport(sr) => Some(sr.clone()),
            _ => None,
        })
        .collect();
    assert!(!periodic.is_empty(), "no sender report while sending");
    for sr in &periodic {
        assert_eq!(sr.ssrc, tx.ssrc());
        let sent = sr.packet_count as usize;
        assert!((1..=150).contains(&sent));
        assert_eq!(sr.octet_count, octets[sent]);
    }
    let cname = during[0].iter().find_map(|p| match p {
        RtcpPacket::SourceDescription(chunks) => chunks[0].cname.clone(),
        _ => None,
    });
    assert_eq!(cname, Some(format!("rtp-{:08x}", tx.ssrc())));

    session.destroy_stream(&tx).unwrap();
    collector.join().unwrap();
    let last = reports.try_iter().last().unwrap();
    match (&last[0], last.last()) {
        (RtcpPacket::SenderReport(sr), Some(RtcpPacket::Goodbye(bye))) => {
            assert_eq!(sr.packet_count, 150);
            assert_eq!(sr.octet_count, octets[150]);
            assert_eq!(bye.sources, vec![tx.ssrc()]);
        }
        other => panic!("expected SR ... BYE, got {other:?}"),
    }

    ctx.destroy_session(&session).unwrap();
}

#[test]
fn foreign_payload_type_is_counted_and_dropped() {
    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let rx = session
        .create_unidirectional_stream(19080, PayloadFormat::Generic, StreamFlags::RECEIVE_ONLY)
        .unwrap();

    let source = raw_socket(0);
    // first byte pair of an RTCP SR read as RTP: M=1, PT=72
    let mut foreign = RtpHeader::new(72, 0x0101_0101, 0);
    let mut datagram = foreign.write(true, 0).to_vec();
    datagram.extend_from_slice(b"hello");
    source.send_to(&datagram, (LOCALHOST, 19080)).unwrap();

    let mut own = RtpHeader::new(PayloadFormat::Generic.payload_type(), 0x0202_0202, 0);
    let mut datagram = own.write(true, 0).to_vec();
    datagram.extend_from_slice(b"media");
    source.send_to(&datagram, (LOCALHOST, 19080)).unwrap();

    let frame = rx
        .pull_frame_timeout(Duration::from_secs(2))
        .unwrap()
        .unwrap();
    assert_eq!(frame.payload, b"media");
    assert_eq!(frame.header.payload_type, 0);
    assert!(rx.pull_frame_timeout(Duration::from_millis(100)).unwrap().is_none());

    let stats = rx.stats();
    assert_eq!(stats.malformed_packets, 1);
    assert_eq!(stats.sources.len(), 1);
    assert_eq!(stats.sources[0].ssrc, 0x0202_0202);

    ctx.destroy_session(&session).unwrap();
}

#[test]
fn pull_mode_delivers_in_order() {
    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let rx = session
        .create_unidirectional_stream(19060, PayloadFormat::Generic, StreamFlags::RECEIVE_ONLY)
        .unwrap();
    let tx = session
        .create_unidirectional_stream(19060, PayloadFormat::Generic, StreamFlags::SEND_ONLY)
        .unwrap();
    tx.set_clock_rate(8000).unwrap();

    for i in 0..3u8 {
        tx.push_frame(&[i; 16], PushFlags::empty()).unwrap();
    }
    for i in 0..3u8 {
        let frame = rx
            .pull_frame_timeout(Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, vec![i; 16]);
    }
    assert!(rx.pull_frame_timeout(Duration::from_millis(50)).unwrap().is_none());

    ctx.destroy_session(&session).unwrap();
    assert!(rx.pull_frame().is_err());
}

#[test]
fn batched_dispatch_sends_whole_frame() {
    let sink = raw_socket(19070);
    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let tx = session
        .create_unidirectional_stream(19070, PayloadFormat::H265, StreamFlags::SEND_ONLY)
        .unwrap();
    tx.configure(StreamFlags::SYSTEM_CALL_DISPATCHER).unwrap();

    let mut nal = vec![0x26, 0x01];
    nal.extend(vec![0x33; 6000]);
    tx.push_frame(&nal, PushFlags::NO_H26X_SCL).unwrap();

    // 6000 body bytes in chunks of 1397
    let packets: Vec<Vec<u8>> = (0..5).map(|_| recv_datagram(&sink)).collect();
    let last = RtpPacket::parse(&packets[4]).unwrap();
    assert!(last.header.marker);
    assert_eq!(last.payload[2] & 0x40, 0x40);
    assert_eq!(tx.stats().packets_sent, 5);

    ctx.destroy_session(&session).unwrap();
}

#[test]
fn context_close_refused_with_live_session() {
    let ctx = Context::new();
    let session = ctx.create_session("127.0.0.1").unwrap();
    let (ctx, err) = ctx.close().unwrap_err();
    assert_eq!(err.kind(), rtp::ErrorKind::InvalidValue);
    ctx.destroy_session(&session).unwrap();
    assert!(ctx.close().is_ok());
}

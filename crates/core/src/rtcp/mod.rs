//! RTCP engine (RFC 3550 §6).
//!
//! Each stream may own one [`Rtcp`] instance. It binds its own UDP port,
//! runs on a dedicated thread and:
//!
//! - Sends a compound report (SR when the stream has sent media, RR
//!   otherwise, followed by SDES CNAME) every randomized interval.
//! - Parses inbound compound packets, updating the stream's
//!   [`StatsSink`] and notifying an optional report hook.
//! - Sends BYE when stopped.

pub mod interval;
pub mod packet;
pub mod stats;

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use arc_swap::ArcSwapOption;

use crate::clock;
use crate::error::{Result, RtpError};
use crate::transport::UdpEndpoint;
use interval::AverageSize;
use packet::{
    Goodbye, MAX_REPORT_BLOCKS, ReceiverReport, RtcpPacket, SdesChunk, SenderReport,
};
use stats::StatsSink;

/// Receive buffer size for inbound compound packets.
const RTCP_RECV_BUFFER: usize = 4096;

/// Initial `avg_rtcp_size` guess: one RR with a block plus SDES.
const INITIAL_AVG_SIZE: usize = 60;

/// What the engine needs to know about the local sender.
pub trait ReportSource: Send + Sync {
    fn ssrc(&self) -> u32;

    /// RTP timestamp corresponding to `now`, `None` while the media clock
    /// rate is unknown.
    fn rtp_timestamp_at(&self, now: Instant) -> Option<u32>;

    /// Whether the local side may send media at all.
    fn is_sender(&self) -> bool;
}

/// Inbound RTCP, handed to the report hook.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpEvent {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(Vec<SdesChunk>),
    Bye(Goodbye),
}

type ReportHook = Box<dyn Fn(RtcpEvent) + Send + Sync>;

/// Settings fixed at engine start.
#[derive(Debug, Clone)]
pub struct RtcpConfig {
    pub cname: String,
    /// Session bandwidth in bytes per second.
    pub session_bandwidth: u32,
}

struct Shared {
    stats: Arc<dyn StatsSink>,
    source: Arc<dyn ReportSource>,
    config: RtcpConfig,
    hook: ArcSwapOption<ReportHook>,
    shutdown: AtomicBool,
}

/// Running RTCP engine of one stream.
pub struct Rtcp {
    shared: Arc<Shared>,
    local: SocketAddr,
    remote: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl Rtcp {
    /// Bind `local`, address `remote` and start the RTCP thread.
    pub fn start(
        local: SocketAddr,
        remote: SocketAddr,
        stats: Arc<dyn StatsSink>,
        source: Arc<dyn ReportSource>,
        config: RtcpConfig,
    ) -> Result<Self> {
        let endpoint = UdpEndpoint::bind(local)?.with_remote(remote);
        let local = endpoint.local_addr();

        let shared = Arc::new(Shared {
            stats,
            source,
            config,
            hook: ArcSwapOption::empty(),
            shutdown: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("rtcp-{}", local.port()))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| worker.run(&endpoint)));
                if result.is_err() {
                    tracing::error!(%local, "RTCP thread panicked");
                }
            })
            .map_err(|e| RtpError::Generic(format!("failed to spawn RTCP thread: {e}")))?;

        tracing::info!(%local, %remote, "RTCP started");
        Ok(Self {
            shared,
            local,
            remote,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Replace the hook called for every inbound SR, RR, SDES and BYE.
    pub fn install_report_hook<F>(&self, hook: F)
    where
        F: Fn(RtcpEvent) + Send + Sync + 'static,
    {
        self.shared.hook.store(Some(Arc::new(Box::new(hook))));
    }

    /// Send BYE and wait for the thread to exit. Idempotent.
    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            tracing::warn!(local = %self.local, "RTCP stopped from its own hook; not joining");
            return;
        }
        if handle.join().is_err() {
            tracing::error!(local = %self.local, "RTCP thread join failed");
        }
        tracing::info!(local = %self.local, "RTCP stopped");
    }
}

impl Drop for Rtcp {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Rtcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rtcp")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Shared {
    fn run(&self, endpoint: &UdpEndpoint) {
        let mut buf = vec![0u8; RTCP_RECV_BUFFER];
        let mut avg_size = AverageSize::new(INITIAL_AVG_SIZE);
        let mut initial = true;
        let mut next_report = Instant::now() + self.interval(&avg_size, initial);

        while !self.shutdown.load(Ordering::SeqCst) {
            match endpoint.recv_into(&mut buf) {
                Ok((len, from)) => {
                    avg_size.update(len);
                    self.handle_inbound(&buf[..len], from);
                }
                Err(RtpError::Interrupted) => {}
                Err(e) => {
                    tracing::error!(error = %e, "RTCP receive failed; engine exiting");
                    return;
                }
            }

            let now = Instant::now();
            if now >= next_report {
                let compound = packet::build_compound(&self.build_report(now, None));
                match endpoint.send_one(&compound) {
                    Ok(_) => {
                        avg_size.update(compound.len());
                        tracing::trace!(len = compound.len(), "RTCP report sent");
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!(error = %e, "RTCP send failed; engine exiting");
                        return;
                    }
                    Err(_) => {}
                }
                initial = false;
                next_report = now + self.interval(&avg_size, initial);
            }
        }

        let bye = packet::build_compound(&self.build_report(Instant::now(), Some("stream closed")));
        if endpoint.send_one(&bye).is_ok() {
            tracing::debug!(ssrc = self.source.ssrc(), "RTCP BYE sent");
        }
    }

    fn we_sent(&self) -> bool {
        self.source.is_sender() && self.stats.sender_counts().0 > 0
    }

    fn interval(&self, avg_size: &AverageSize, initial: bool) -> std::time::Duration {
        let (remote_members, remote_senders) = self.stats.remote_counts();
        let we_sent = self.we_sent();
        interval::rtcp_interval(
            remote_members + 1,
            remote_senders + usize::from(we_sent),
            self.config.session_bandwidth,
            we_sent,
            avg_size.get(),
            initial,
        )
    }

    /// SR or RR, then SDES CNAME, then BYE when `bye_reason` is set.
    fn build_report(&self, now: Instant, bye_reason: Option<&str>) -> Vec<RtcpPacket> {
        let ssrc = self.source.ssrc();
        let mut reports = self.stats.reception_reports(now);
        reports.truncate(MAX_REPORT_BLOCKS);

        let rtp_time = if self.we_sent() {
            self.source.rtp_timestamp_at(now)
        } else {
            None
        };

        let report = match rtp_time {
            Some(rtp_time) => {
                let (packets, octets) = self.stats.sender_counts();
                RtcpPacket::SenderReport(SenderReport {
                    ssrc,
                    ntp_time: clock::ntp_now(),
                    rtp_time,
                    packet_count: packets as u32,
                    octet_count: octets as u32,
                    reports,
                })
            }
            None => RtcpPacket::ReceiverReport(ReceiverReport { ssrc, reports }),
        };

        let mut compound = vec![
            report,
            RtcpPacket::SourceDescription(vec![SdesChunk {
                ssrc,
                cname: Some(self.config.cname.clone()),
            }]),
        ];
        if let Some(reason) = bye_reason {
            compound.push(RtcpPacket::Goodbye(Goodbye {
                sources: vec![ssrc],
                reason: Some(reason.to_string()),
            }));
        }
        compound
    }

    fn handle_inbound(&self, buf: &[u8], from: SocketAddr) {
        let now = Instant::now();
        let packets = match packet::parse_compound(buf) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::debug!(%from, error = %e, "dropping malformed RTCP");
                return;
            }
        };

        for packet in packets {
            let event = match packet {
                RtcpPacket::SenderReport(sr) => {
                    self.stats.record_sender_report(&sr, now);
                    self.stats.record_reception_reports(sr.ssrc, &sr.reports);
                    RtcpEvent::SenderReport(sr)
                }
                RtcpPacket::ReceiverReport(rr) => {
                    self.stats.record_reception_reports(rr.ssrc, &rr.reports);
                    RtcpEvent::ReceiverReport(rr)
                }
                RtcpPacket::SourceDescription(chunks) => {
                    for chunk in &chunks {
                        if let Some(cname) = &chunk.cname {
                            self.stats.record_cname(chunk.ssrc, cname.clone());
                        }
                    }
                    RtcpEvent::SourceDescription(chunks)
                }
                RtcpPacket::Goodbye(bye) => {
                    for &ssrc in &bye.sources {
                        self.stats.remove_source(ssrc);
                    }
                    tracing::info!(sources = ?bye.sources, reason = ?bye.reason, "RTCP BYE received");
                    RtcpEvent::Bye(bye)
                }
                RtcpPacket::Other { packet_type } => {
                    tracing::trace!(packet_type, "ignoring RTCP packet");
                    continue;
                }
            };
            self.notify(event);
        }
    }

    fn notify(&self, event: RtcpEvent) {
        let hook = self.hook.load();
        if let Some(hook) = &*hook {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(event))).is_err() {
                tracing::error!("RTCP report hook panicked");
            }
        }
    }
}

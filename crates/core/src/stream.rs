//! Media streams: one RTP flow between a local and a remote port.
//!
//! A [`MediaStream`] owns its UDP endpoint, its send state (SSRC,
//! sequence, media clock), its receiver thread and optionally an RTCP
//! engine. Sends run synchronously on the caller's thread; receives run on
//! the stream's own thread and end up in the receive hook or pull queue.

use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};

use crate::clock::MediaClock;
use crate::config::{ConfigOption, PushFlags, StreamConfig, StreamFlags};
use crate::error::{ErrorKind, Result, RtpError};
use crate::media::PayloadFormat;
use crate::media::opus::OpusConfig;
use crate::media::rtp::{RtpFrame, RtpHeader};
use crate::queue::FrameQueue;
use crate::receiver::{self, PullQueue, ReceiveHook};
use crate::rtcp::stats::{StatsSink, StatsView, StreamStats};
use crate::rtcp::{ReportSource, Rtcp, RtcpConfig, RtcpEvent};
use crate::transport::{SocketOption, UdpEndpoint};

/// Hook that takes back buffers handed over with [`MediaStream::push_frame_owned`].
pub type DeallocHook = Box<dyn Fn(Vec<u8>) + Send + Sync>;

const SRTP_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// Media clock position of the sender.
#[derive(Debug)]
struct Timing {
    clock: MediaClock,
    clock_rate: Option<u32>,
}

/// State shared between the stream handle, its receiver thread and RTCP.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) format: PayloadFormat,
    pub(crate) endpoint: UdpEndpoint,
    pub(crate) config: RwLock<StreamConfig>,
    pub(crate) stats: Arc<StreamStats>,
    pub(crate) hook: ArcSwapOption<ReceiveHook>,
    pub(crate) queue: PullQueue,
    pub(crate) opus: Mutex<Option<OpusConfig>>,
    pub(crate) shutdown: AtomicBool,
    fatal: Mutex<Option<ErrorKind>>,
    header: Mutex<RtpHeader>,
    timing: Mutex<Timing>,
    ssrc: AtomicU32,
}

impl StreamShared {
    /// Latch the first fatal error; later calls fail with [`RtpError::Unusable`].
    pub(crate) fn mark_fatal(&self, kind: ErrorKind) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            tracing::error!(stream = self.id, %kind, "stream marked unusable");
            *fatal = Some(kind);
        }
    }

    fn check_usable(&self) -> Result<()> {
        match *self.fatal.lock() {
            Some(kind) => Err(RtpError::Unusable(kind)),
            None => Ok(()),
        }
    }
}

impl ReportSource for StreamShared {
    fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::SeqCst)
    }

    fn rtp_timestamp_at(&self, now: Instant) -> Option<u32> {
        let timing = self.timing.lock();
        timing
            .clock_rate
            .map(|rate| timing.clock.rtp_timestamp_at(now, rate))
    }

    fn is_sender(&self) -> bool {
        self.config.read().flags.is_sender()
    }
}

/// One RTP stream.
///
/// Created through [`Session::create_stream`](crate::Session::create_stream)
/// and shared as `Arc<MediaStream>`. Dropping the last reference shuts the
/// stream down.
pub struct MediaStream {
    shared: Arc<StreamShared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    rtcp: Mutex<Option<Rtcp>>,
    dealloc: ArcSwapOption<DeallocHook>,
    srtp_key: Mutex<Option<Vec<u8>>>,
    sent_any: AtomicBool,
}

impl MediaStream {
    /// Bind `local`, address `remote` and start the receiver thread when
    /// the stream receives.
    pub(crate) fn open(
        id: u32,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        format: PayloadFormat,
        flags: StreamFlags,
    ) -> Result<Self> {
        flags.validate()?;
        if flags.is_sender() && remote.is_none() {
            return Err(RtpError::invalid("sending stream needs a remote address"));
        }

        let mut endpoint = UdpEndpoint::bind(local)?;
        if let Some(remote) = remote {
            endpoint = endpoint.with_remote(remote);
        }

        let config = StreamConfig::with_flags(flags);
        let header = RtpHeader::with_random_ssrc(format.payload_type());
        let ssrc = header.ssrc;
        let clock_rate = format.default_clock_rate();
        let stats = Arc::new(StreamStats::new(ssrc, clock_rate.unwrap_or(0)));

        let shared = Arc::new(StreamShared {
            id,
            format,
            endpoint,
            queue: PullQueue::new(config.pull_queue_capacity),
            config: RwLock::new(config),
            stats,
            hook: ArcSwapOption::empty(),
            opus: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
            header: Mutex::new(header),
            timing: Mutex::new(Timing {
                clock: MediaClock::new(rand::random::<u32>()),
                clock_rate,
            }),
            ssrc: AtomicU32::new(ssrc),
        });

        let receiver = if flags.is_receiver() {
            let worker = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("rtp-recv-{id}"))
                .spawn(move || {
                    if panic::catch_unwind(AssertUnwindSafe(|| receiver::run(&worker))).is_err() {
                        tracing::error!(stream = worker.id, "receiver thread panicked");
                        worker.mark_fatal(ErrorKind::GenericError);
                        worker.queue.close();
                    }
                })
                .map_err(|e| RtpError::Generic(format!("failed to spawn receiver thread: {e}")))?;
            Some(handle)
        } else {
            shared.queue.close();
            None
        };

        tracing::info!(
            stream = id,
            %format,
            local = %shared.endpoint.local_addr(),
            remote = ?remote,
            ssrc = format_args!("{ssrc:#010x}"),
            ?flags,
            "stream created"
        );

        Ok(Self {
            shared,
            receiver: Mutex::new(receiver),
            rtcp: Mutex::new(None),
            dealloc: ArcSwapOption::empty(),
            srtp_key: Mutex::new(None),
            sent_any: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn payload_format(&self) -> PayloadFormat {
        self.shared.format
    }

    pub fn flags(&self) -> StreamFlags {
        self.shared.config.read().flags
    }

    pub fn ssrc(&self) -> u32 {
        self.shared.ssrc.load(Ordering::SeqCst)
    }

    /// Sequence number of the next outbound packet.
    pub fn sequence(&self) -> u16 {
        self.shared.header.lock().sequence()
    }

    pub fn clock_rate(&self) -> Option<u32> {
        self.shared.timing.lock().clock_rate
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.endpoint.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.endpoint.remote_addr()
    }

    pub fn stats(&self) -> StatsView {
        self.shared.stats.snapshot()
    }

    fn check_sender(&self) -> Result<()> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(RtpError::Interrupted);
        }
        self.shared.check_usable()?;
        if !self.flags().is_sender() {
            return Err(RtpError::invalid("stream is receive-only"));
        }
        Ok(())
    }

    fn check_receiver(&self) -> Result<()> {
        if !self.flags().is_receiver() {
            return Err(RtpError::invalid("stream is send-only"));
        }
        Ok(())
    }

    fn check_preconfig(&self, what: &str) -> Result<()> {
        if self.sent_any.load(Ordering::SeqCst) {
            return Err(RtpError::invalid(format!(
                "{what} must be set before the first send"
            )));
        }
        Ok(())
    }

    /// Packetize and send one frame, timestamped from the media clock.
    ///
    /// H.26x frames are scanned for Annex B start codes unless
    /// [`PushFlags::NO_H26X_SCL`] is given.
    pub fn push_frame(&self, data: &[u8], flags: PushFlags) -> Result<()> {
        self.check_sender()?;
        let timestamp = {
            let timing = self.shared.timing.lock();
            let rate = timing.clock_rate.ok_or_else(|| {
                RtpError::invalid("clock rate must be set before sending")
            })?;
            timing.clock.rtp_timestamp(rate)
        };
        self.send(data, timestamp, flags)
    }

    /// Like [`push_frame`](Self::push_frame) with a caller-chosen RTP timestamp.
    pub fn push_frame_with_timestamp(
        &self,
        data: &[u8],
        timestamp: u32,
        flags: PushFlags,
    ) -> Result<()> {
        self.check_sender()?;
        self.send(data, timestamp, flags)
    }

    /// Send a frame the caller hands over. Once sent, the buffer goes to
    /// the dealloc hook, or is dropped when none is installed.
    pub fn push_frame_owned(&self, data: Vec<u8>, flags: PushFlags) -> Result<()> {
        let result = self.push_frame(&data, flags);
        match &*self.dealloc.load() {
            Some(hook) => {
                if panic::catch_unwind(AssertUnwindSafe(|| hook(data))).is_err() {
                    tracing::error!(stream = self.shared.id, "dealloc hook panicked");
                }
            }
            None => drop(data),
        }
        result
    }

    fn send(&self, data: &[u8], timestamp: u32, flags: PushFlags) -> Result<()> {
        let (max_payload, batched) = {
            let config = self.shared.config.read();
            (
                config.max_payload(),
                config.flags.contains(StreamFlags::SYSTEM_CALL_DISPATCHER),
            )
        };

        let mut header = self.shared.header.lock();
        let mut queue = FrameQueue::new(&mut *header, timestamp);
        self.shared
            .format
            .packetizer()
            .packetize(&mut queue, data, flags, max_payload)?;

        match queue.flush(&self.shared.endpoint, self.shared.stats.as_ref(), batched) {
            Ok(summary) => {
                self.sent_any.store(true, Ordering::SeqCst);
                tracing::trace!(
                    stream = self.shared.id,
                    packets = summary.packets,
                    ts = timestamp,
                    "frame sent"
                );
                Ok(())
            }
            Err(e) => {
                if self.shared.stats.sender_counts().0 > 0 {
                    self.sent_any.store(true, Ordering::SeqCst);
                }
                if e.is_fatal() {
                    self.shared.mark_fatal(e.kind());
                }
                Err(e)
            }
        }
    }

    /// Replace the receive hook. It runs on the receiver thread and must
    /// not block.
    pub fn install_receive_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(RtpFrame) + Send + Sync + 'static,
    {
        self.check_receiver()?;
        self.shared.hook.store(Some(Arc::new(Box::new(hook))));
        Ok(())
    }

    /// Install the hook that takes back buffers passed to
    /// [`push_frame_owned`](Self::push_frame_owned).
    pub fn install_dealloc_hook<F>(&self, hook: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        self.dealloc.store(Some(Arc::new(Box::new(hook))));
    }

    /// Block until a frame arrives. Only used without a receive hook.
    pub fn pull_frame(&self) -> Result<RtpFrame> {
        self.check_receiver()?;
        self.shared
            .queue
            .pop(None)?
            .ok_or(RtpError::Interrupted)
    }

    /// Wait up to `timeout` for a frame; `Ok(None)` when none arrived.
    pub fn pull_frame_timeout(&self, timeout: Duration) -> Result<Option<RtpFrame>> {
        self.check_receiver()?;
        self.shared.queue.pop(Some(timeout))
    }

    /// Turn on a runtime flag.
    pub fn configure(&self, flag: StreamFlags) -> Result<()> {
        self.shared.config.write().enable(flag)?;
        tracing::debug!(stream = self.shared.id, ?flag, "stream flag enabled");
        Ok(())
    }

    /// Set a valued option.
    pub fn configure_value(&self, option: ConfigOption, value: i64) -> Result<()> {
        let mut config = self.shared.config.write();
        config.apply(option, value)?;
        match option {
            ConfigOption::UdpBufSize => {
                if let Some(size) = config.udp_buf_size {
                    self.shared
                        .endpoint
                        .set_option(SocketOption::SendBufferSize(size))?;
                    self.shared
                        .endpoint
                        .set_option(SocketOption::RecvBufferSize(size))?;
                }
            }
            ConfigOption::PullQueueCapacity => {
                self.shared.queue.set_capacity(config.pull_queue_capacity)
            }
            ConfigOption::ReorderWindowMs | ConfigOption::MtuSize | ConfigOption::RtcpBandwidth => {}
        }
        Ok(())
    }

    /// Set the SDES CNAME used once RTCP starts.
    pub fn set_cname(&self, cname: impl Into<String>) -> Result<()> {
        let cname = cname.into();
        if cname.is_empty() || cname.len() > 255 {
            return Err(RtpError::invalid("CNAME must be 1..=255 bytes"));
        }
        self.shared.config.write().cname = Some(cname);
        Ok(())
    }

    pub fn set_clock_rate(&self, clock_rate: u32) -> Result<()> {
        if clock_rate == 0 {
            return Err(RtpError::invalid("clock rate must be positive"));
        }
        self.check_preconfig("clock rate")?;
        self.shared.timing.lock().clock_rate = Some(clock_rate);
        self.shared.stats.set_clock_rate(clock_rate);
        Ok(())
    }

    pub fn set_ssrc(&self, ssrc: u32) -> Result<()> {
        self.check_preconfig("SSRC")?;
        self.shared.header.lock().ssrc = ssrc;
        self.shared.ssrc.store(ssrc, Ordering::SeqCst);
        self.shared.stats.set_ssrc(ssrc);
        tracing::debug!(stream = self.shared.id, ssrc = format_args!("{ssrc:#010x}"), "SSRC set");
        Ok(())
    }

    /// Park an SRTP master key. Requires `SRTP | SRTP_KMNGMNT_USER`.
    pub fn set_srtp_key(&self, key: &[u8]) -> Result<()> {
        let flags = self.flags();
        if !flags.contains(StreamFlags::SRTP | StreamFlags::SRTP_KMNGMNT_USER) {
            return Err(RtpError::NotSupported(
                "SRTP key requires SRTP_KMNGMNT_USER".into(),
            ));
        }
        if !SRTP_KEY_LENGTHS.contains(&key.len()) {
            return Err(RtpError::invalid(format!(
                "SRTP master key of {} bytes, expected 16, 24 or 32",
                key.len()
            )));
        }
        *self.srtp_key.lock() = Some(key.to_vec());
        tracing::debug!(stream = self.shared.id, len = key.len(), "SRTP key stored");
        Ok(())
    }

    pub fn has_srtp_key(&self) -> bool {
        self.srtp_key.lock().is_some()
    }

    pub fn set_opus_config(&self, config: OpusConfig) -> Result<()> {
        if self.shared.format != PayloadFormat::Opus {
            return Err(RtpError::invalid("Opus config on a non-Opus stream"));
        }
        config.validate()?;
        *self.shared.opus.lock() = Some(config);
        Ok(())
    }

    /// Start RTCP: bind `src_port` locally and report to `dst_addr:dst_port`.
    pub fn create_rtcp(&self, dst_addr: IpAddr, dst_port: u16, src_port: u16) -> Result<()> {
        let mut slot = self.rtcp.lock();
        if slot.is_some() {
            return Err(RtpError::invalid("RTCP already running"));
        }
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(RtpError::Interrupted);
        }

        let (cname, session_bandwidth) = {
            let config = self.shared.config.read();
            (config.cname_for(self.ssrc()), config.session_bandwidth)
        };
        let local = SocketAddr::new(self.local_addr().ip(), src_port);
        let stats: Arc<dyn StatsSink> = self.shared.stats.clone();
        let source: Arc<dyn ReportSource> = self.shared.clone();
        let rtcp = Rtcp::start(
            local,
            SocketAddr::new(dst_addr, dst_port),
            stats,
            source,
            RtcpConfig {
                cname,
                session_bandwidth,
            },
        )?;
        *slot = Some(rtcp);
        Ok(())
    }

    /// Local address of the RTCP socket, if RTCP runs.
    pub fn rtcp_local_addr(&self) -> Option<SocketAddr> {
        self.rtcp.lock().as_ref().map(Rtcp::local_addr)
    }

    /// Forward inbound RTCP reports to `hook`.
    pub fn install_rtcp_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(RtcpEvent) + Send + Sync + 'static,
    {
        match self.rtcp.lock().as_ref() {
            Some(rtcp) => {
                rtcp.install_report_hook(hook);
                Ok(())
            }
            None => Err(RtpError::NotReady),
        }
    }

    /// Stop workers and release the stream's resources. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::SeqCst) {
            tracing::debug!(stream = self.shared.id, "stream shutting down");
        }

        if let Some(handle) = self.receiver.lock().take() {
            if handle.thread().id() == thread::current().id() {
                tracing::warn!(stream = self.shared.id, "stream dropped from its receive hook; not joining");
            } else if handle.join().is_err() {
                tracing::error!(stream = self.shared.id, "receiver thread join failed");
            }
        }

        self.shared.hook.store(None);
        self.shared.queue.close();

        if let Some(mut rtcp) = self.rtcp.lock().take() {
            rtcp.stop();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.shutdown();
        tracing::info!(stream = self.shared.id, "stream closed");
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.shared.id)
            .field("format", &self.shared.format)
            .field("local", &self.local_addr())
            .field("remote", &self.remote_addr())
            .field("ssrc", &format_args!("{:#010x}", self.ssrc()))
            .finish()
    }
}

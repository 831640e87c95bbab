//! User-space RTP (RFC 3550) endpoint library.
//!
//! A [`Context`] holds [`Session`]s, each talking to one remote host. A
//! session holds [`MediaStream`]s, each an RTP flow over its own UDP port
//! pair with:
//!
//! - a synchronous send path that packetizes H.264, H.265, Opus or
//!   generic frames and hands them to the socket in one scatter/gather
//!   flush,
//! - a receiver thread that reassembles fragmented frames and delivers
//!   them to a hook or a pull queue,
//! - an optional RTCP thread exchanging sender/receiver reports.
//!
//! ```no_run
//! use rtp::{Context, PayloadFormat, PushFlags, StreamFlags};
//!
//! # fn main() -> rtp::Result<()> {
//! let ctx = Context::new();
//! let session = ctx.create_session("127.0.0.1")?;
//! let stream = session.create_stream(8888, 8890, PayloadFormat::H264, StreamFlags::SEND_ONLY)?;
//! stream.push_frame(&[0, 0, 0, 1, 0x65, 0x88, 0x84], PushFlags::empty())?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod media;
pub mod queue;
pub mod receiver;
pub mod rtcp;
pub mod session;
pub mod stream;
pub mod transport;

pub use config::{ConfigOption, PushFlags, StreamConfig, StreamFlags};
pub use context::Context;
pub use error::{ErrorKind, Result, RtpError};
pub use media::PayloadFormat;
pub use media::opus::OpusConfig;
pub use media::rtp::{PacketHeader, RtpFrame};
pub use rtcp::RtcpEvent;
pub use rtcp::stats::{SourceView, StatsView};
pub use session::Session;
pub use stream::MediaStream;

//! Network transport for RTP and RTCP.
//!
//! Every stream owns one [`UdpEndpoint`] for media and, when RTCP is
//! enabled, a second one for control traffic. Sockets are never shared
//! between streams.

pub mod udp;

pub use udp::{PartialSend, RECV_TIMEOUT, SocketOption, UdpEndpoint};

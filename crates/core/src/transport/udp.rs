use std::io::{self, IoSlice};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Result, RtpError};

/// Receive timeout that bounds how long a worker can miss a shutdown request.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Socket options settable after bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    SendBufferSize(usize),
    RecvBufferSize(usize),
    ReadTimeout(Option<Duration>),
}

/// A batch send that failed after `sent` datagrams had already gone out.
#[derive(Debug)]
pub struct PartialSend {
    pub sent: usize,
    pub error: RtpError,
}

/// Non-shared UDP socket bound to a local port and addressed to one peer.
///
/// Outbound packets are handed over as `IoSlice` lists so the RTP header,
/// payload prefix and payload never get copied into one buffer. With
/// [`send_batch`](Self::send_batch) a whole flush goes out in a single
/// `sendmmsg(2)` on Linux.
///
/// Receives block for at most [`RECV_TIMEOUT`] and report
/// [`RtpError::Interrupted`] on expiry so the caller can poll its
/// shutdown flag.
pub struct UdpEndpoint {
    socket: Socket,
    reader: UdpSocket,
    local: SocketAddr,
    remote: Option<(SocketAddr, SockAddr)>,
}

impl UdpEndpoint {
    /// Bind a UDP socket on `local`. Port 0 picks an ephemeral port.
    pub fn bind(local: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
            .map_err(RtpError::Socket)?;
        socket
            .bind(&local.into())
            .map_err(|source| RtpError::Bind { addr: local, source })?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(RtpError::Socket)?;

        let reader: UdpSocket = socket.try_clone().map_err(RtpError::Socket)?.into();
        let local = reader.local_addr().map_err(RtpError::Socket)?;

        tracing::debug!(%local, "UDP endpoint bound");

        Ok(Self {
            socket,
            reader,
            local,
            remote: None,
        })
    }

    /// Set the default destination for [`send_one`](Self::send_one) and friends.
    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some((remote, remote.into()));
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote.as_ref().map(|(addr, _)| *addr)
    }

    pub fn set_option(&self, option: SocketOption) -> Result<()> {
        let res = match option {
            SocketOption::SendBufferSize(size) => self.socket.set_send_buffer_size(size),
            SocketOption::RecvBufferSize(size) => self.socket.set_recv_buffer_size(size),
            SocketOption::ReadTimeout(timeout) => self.socket.set_read_timeout(timeout),
        };
        res.map_err(|e| {
            tracing::error!(?option, error = %e, "failed to set socket option");
            RtpError::Socket(e)
        })
    }

    fn remote(&self) -> Result<&SockAddr> {
        self.remote
            .as_ref()
            .map(|(_, sa)| sa)
            .ok_or_else(|| RtpError::invalid("endpoint has no remote address"))
    }

    /// Send one contiguous datagram to the remote.
    pub fn send_one(&self, buf: &[u8]) -> Result<usize> {
        let remote = self.remote()?;
        self.socket.send_to(buf, remote).map_err(send_error)
    }

    /// Send one contiguous datagram to an explicit address.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        self.socket.send_to(buf, &addr.into()).map_err(send_error)
    }

    /// Send one datagram gathered from `bufs`.
    ///
    /// A short send is reported through the return value and is not an
    /// error; UDP datagrams are atomic.
    pub fn send_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let remote = self.remote()?;
        self.socket
            .send_to_vectored(bufs, remote)
            .map_err(send_error)
    }

    /// Send several datagrams, each gathered from its own slice list.
    ///
    /// Returns how many datagrams went out. Datagrams go out in slice
    /// order; the first failure aborts the rest and reports how many were
    /// sent before it.
    pub fn send_batch(&self, packets: &[Vec<IoSlice<'_>>]) -> std::result::Result<usize, PartialSend> {
        #[cfg(target_os = "linux")]
        {
            self.sendmmsg(packets)
        }
        #[cfg(not(target_os = "linux"))]
        {
            for (sent, iov) in packets.iter().enumerate() {
                self.send_vectored(iov)
                    .map_err(|error| PartialSend { sent, error })?;
            }
            Ok(packets.len())
        }
    }

    #[cfg(target_os = "linux")]
    fn sendmmsg(&self, packets: &[Vec<IoSlice<'_>>]) -> std::result::Result<usize, PartialSend> {
        use std::os::fd::AsRawFd;

        if packets.is_empty() {
            return Ok(0);
        }

        let remote = self.remote().map_err(|error| PartialSend { sent: 0, error })?;
        let mut headers: Vec<libc::mmsghdr> = packets
            .iter()
            .map(|iov| {
                // SAFETY: mmsghdr is a plain C struct; all-zero is a valid empty value.
                let mut hdr: libc::mmsghdr = unsafe { std::mem::zeroed() };
                hdr.msg_hdr.msg_name = remote.as_ptr() as *mut libc::c_void;
                hdr.msg_hdr.msg_namelen = remote.len() as libc::socklen_t;
                // IoSlice is ABI-compatible with iovec on unix.
                hdr.msg_hdr.msg_iov = iov.as_ptr() as *mut libc::iovec;
                hdr.msg_hdr.msg_iovlen = iov.len() as _;
                hdr
            })
            .collect();

        let fd = self.socket.as_raw_fd();
        let mut done = 0usize;
        while done < headers.len() {
            let pending = &mut headers[done..];
            // SAFETY: every header points at a live iovec array and the
            // remote sockaddr, both of which outlive this call.
            let sent = unsafe {
                libc::sendmmsg(fd, pending.as_mut_ptr(), pending.len() as libc::c_uint, 0)
            };
            if sent < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(PartialSend {
                    sent: done,
                    error: send_error(err),
                });
            }
            done += sent as usize;
        }

        Ok(done)
    }

    /// Receive one datagram into `buf`.
    ///
    /// Returns [`RtpError::Interrupted`] when the receive timeout expires.
    pub fn recv_into(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.reader.recv_from(buf).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                RtpError::Interrupted
            }
            _ => RtpError::Socket(e),
        })
    }
}

fn send_error(e: io::Error) -> RtpError {
    tracing::warn!(error = %e, "UDP send failed");
    RtpError::Send(e)
}

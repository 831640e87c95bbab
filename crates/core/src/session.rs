//! Sessions: the set of streams exchanged with one remote host.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::StreamFlags;
use crate::context::IdGenerator;
use crate::error::{Result, RtpError};
use crate::media::PayloadFormat;
use crate::stream::MediaStream;

/// Streams shared with one remote address.
///
/// Created by [`Context::create_session`](crate::Context::create_session).
/// Every stream belongs to exactly one session and is torn down through
/// it, or when the session goes away.
pub struct Session {
    id: u32,
    remote: IpAddr,
    local: IpAddr,
    ids: Arc<IdGenerator>,
    streams: RwLock<HashMap<u32, Arc<MediaStream>>>,
}

impl Session {
    pub(crate) fn new(id: u32, remote: IpAddr, local: IpAddr, ids: Arc<IdGenerator>) -> Self {
        tracing::debug!(session = id, %remote, %local, "session created");
        Session {
            id,
            remote,
            local,
            ids,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote_addr(&self) -> IpAddr {
        self.remote
    }

    /// Local IP the session's streams bind to.
    pub fn local_addr(&self) -> IpAddr {
        self.local
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Open a stream bound to `src_port` and sending to `dst_port` on the
    /// remote host. Port 0 binds an ephemeral port.
    pub fn create_stream(
        &self,
        src_port: u16,
        dst_port: u16,
        format: PayloadFormat,
        flags: StreamFlags,
    ) -> Result<Arc<MediaStream>> {
        self.open(
            SocketAddr::new(self.local, src_port),
            Some(SocketAddr::new(self.remote, dst_port)),
            format,
            flags,
        )
    }

    /// Open a one-way stream on a single port.
    ///
    /// With `RECEIVE_ONLY` the stream binds `port`; with `SEND_ONLY` it
    /// binds an ephemeral port and sends to `port` on the remote host.
    pub fn create_unidirectional_stream(
        &self,
        port: u16,
        format: PayloadFormat,
        flags: StreamFlags,
    ) -> Result<Arc<MediaStream>> {
        if flags.contains(StreamFlags::RECEIVE_ONLY) && !flags.contains(StreamFlags::SEND_ONLY) {
            self.open(SocketAddr::new(self.local, port), None, format, flags)
        } else if flags.contains(StreamFlags::SEND_ONLY) && !flags.contains(StreamFlags::RECEIVE_ONLY) {
            self.open(
                SocketAddr::new(self.local, 0),
                Some(SocketAddr::new(self.remote, port)),
                format,
                flags,
            )
        } else {
            Err(RtpError::invalid(
                "unidirectional stream needs exactly one of RECEIVE_ONLY and SEND_ONLY",
            ))
        }
    }

    fn open(
        &self,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        format: PayloadFormat,
        flags: StreamFlags,
    ) -> Result<Arc<MediaStream>> {
        let id = self.ids.next();
        let stream = Arc::new(MediaStream::open(id, local, remote, format, flags)?);
        let total = {
            let mut streams = self.streams.write();
            streams.insert(id, Arc::clone(&stream));
            streams.len()
        };
        tracing::debug!(session = self.id, stream = id, total_streams = total, "stream added");
        Ok(stream)
    }

    /// Shut a stream down and remove it from the session.
    ///
    /// Other `Arc` clones stay valid but refuse further work.
    pub fn destroy_stream(&self, stream: &Arc<MediaStream>) -> Result<()> {
        let removed = self.streams.write().remove(&stream.id());
        match removed {
            Some(removed) => {
                removed.shutdown();
                tracing::debug!(session = self.id, stream = removed.id(), "stream destroyed");
                Ok(())
            }
            None => Err(RtpError::invalid(format!(
                "stream {} does not belong to session {}",
                stream.id(),
                self.id
            ))),
        }
    }

    /// Shut down every stream. Idempotent.
    pub fn close(&self) {
        let streams: Vec<_> = self.streams.write().drain().map(|(_, s)| s).collect();
        for stream in &streams {
            stream.shutdown();
        }
        if !streams.is_empty() {
            tracing::debug!(session = self.id, closed = streams.len(), "session streams closed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("streams", &self.stream_count())
            .finish()
    }
}

//! Library context: session registry and ID generator.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, RtpError};
use crate::session::Session;

/// Monotonic 32-bit ID source for sessions and streams.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU32,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }
}

impl IdGenerator {
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Root object owning all sessions.
///
/// Closing a context with live sessions is refused; destroy the sessions
/// first.
#[derive(Debug, Default)]
pub struct Context {
    ids: Arc<IdGenerator>,
    sessions: RwLock<HashMap<u32, Arc<Session>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh process-unique ID.
    pub fn unique_id(&self) -> u32 {
        self.ids.next()
    }

    /// Create a session with `remote`, a host name or IP literal.
    ///
    /// Streams bind the unspecified address of the remote's family.
    pub fn create_session(&self, remote: &str) -> Result<Arc<Session>> {
        let remote = resolve(remote)?;
        let local = match remote {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Ok(self.register(remote, local))
    }

    /// Create a session whose streams bind `local` instead.
    pub fn create_session_with_local(&self, remote: &str, local: &str) -> Result<Arc<Session>> {
        let remote = resolve(remote)?;
        let local = resolve(local)?;
        if remote.is_ipv4() != local.is_ipv4() {
            return Err(RtpError::invalid(format!(
                "local {local} and remote {remote} differ in address family"
            )));
        }
        Ok(self.register(remote, local))
    }

    fn register(&self, remote: IpAddr, local: IpAddr) -> Arc<Session> {
        let id = self.ids.next();
        let session = Arc::new(Session::new(id, remote, local, Arc::clone(&self.ids)));
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(id, Arc::clone(&session));
            sessions.len()
        };
        tracing::info!(session = id, %remote, %local, total_sessions = total, "session registered");
        session
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Tear down a session's streams and forget it.
    pub fn destroy_session(&self, session: &Arc<Session>) -> Result<()> {
        let removed = self.sessions.write().remove(&session.id());
        match removed {
            Some(removed) => {
                removed.close();
                tracing::info!(session = removed.id(), "session destroyed");
                Ok(())
            }
            None => Err(RtpError::invalid(format!(
                "session {} is not registered",
                session.id()
            ))),
        }
    }

    /// Consume the context. Fails with `InvalidValue`, handing the context
    /// back, while sessions are still registered.
    pub fn close(self) -> std::result::Result<(), (Self, RtpError)> {
        let live = self.session_count();
        if live > 0 {
            return Err((
                self,
                RtpError::invalid(format!("{live} session(s) still live")),
            ));
        }
        tracing::debug!("context closed");
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let live = self.sessions.read().len();
        if live > 0 {
            tracing::warn!(live, "context dropped with live sessions");
        }
    }
}

fn resolve(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .map_err(|e| RtpError::invalid(format!("cannot resolve {host}: {e}")))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| RtpError::invalid(format!("{host} resolved to no address")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn ids_are_unique() {
        let ctx = Context::new();
        let a = ctx.unique_id();
        let b = ctx.unique_id();
        assert_ne!(a, b);
    }

    #[test]
    fn close_refused_while_sessions_live() {
        let ctx = Context::new();
        let session = ctx.create_session("127.0.0.1").unwrap();
        let (ctx, err) = ctx.close().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);

        ctx.destroy_session(&session).unwrap();
        assert!(ctx.destroy_session(&session).is_err());
        assert!(ctx.close().is_ok());
    }

    #[test]
    fn resolves_literals_and_localhost() {
        let ctx = Context::new();
        let v6 = ctx.create_session("::1").unwrap();
        assert_eq!(v6.local_addr(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert!(ctx.create_session("localhost").is_ok());
        assert!(ctx.create_session_with_local("::1", "127.0.0.1").is_err());
        assert!(ctx.create_session("no.such.host.invalid").is_err());
    }
}

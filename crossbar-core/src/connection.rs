//! The connection capability consumed by the factory
//!
//! The factory never parses bytes. Everything protocol-specific sits behind
//! [`Connection`], which the factory drives through readiness callbacks and
//! lifecycle calls. Implementations own their socket; the factory owns which
//! selector the socket is registered on and with what interest mask.

use crate::factory::FactoryCore;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// Identity assigned to every accepted connection. Keys the factory indexes
/// and picks the worker a connection's I/O is pinned to.
pub type ConnId = u64;

/// A live client connection, driven by the factory.
///
/// Threading contract: `do_io` is only ever invoked by one worker at a time
/// (the factory masks readiness while I/O is in flight and pins each
/// connection to a single worker), but the lifecycle methods (`close`,
/// `session_id`, introspection) may be called from any thread. `close` must
/// be idempotent, must shut the socket down so the owning selector observes
/// the death, and must de-register the connection through
/// [`CnxnContext::remove_cnxn`]. The socket's file descriptor must stay open
/// until the last `Arc` reference drops; the owning selector still holds one
/// while the kernel-side registration exists.
pub trait Connection: Send + Sync {
    /// The factory-assigned identity.
    fn conn_id(&self) -> ConnId;

    /// Perform socket I/O for the indicated readiness. Errors close the
    /// connection.
    fn do_io(&self, ready: crossbar_transport::Interest) -> std::io::Result<()>;

    /// Tear the connection down. Idempotent.
    fn close(&self);

    /// False once `close` has run; the factory's equivalent of an invalidated
    /// selection key.
    fn is_open(&self) -> bool;

    /// The interest mask the selector should restore once in-flight I/O
    /// completes.
    fn interest_ops(&self) -> crossbar_transport::Interest;

    /// Session id, 0 until the session handshake assigns one.
    fn session_id(&self) -> u64;

    /// Negotiated session timeout; `None` until the handshake completes, in
    /// which case the factory applies the sessionless timeout.
    fn session_timeout(&self) -> Option<Duration>;

    fn remote_address(&self) -> SocketAddr;

    /// Whether the connection may currently be offered to `select`.
    fn is_selectable(&self) -> bool;
    fn enable_selectable(&self);
    fn disable_selectable(&self);

    fn reset_stats(&self);

    /// Introspection snapshot; `brief` omits per-connection counters.
    fn connection_info(&self, brief: bool) -> HashMap<String, Value>;
}

/// Materializes a [`Connection`] for a freshly registered socket.
///
/// The stream is already non-blocking and registered for read readiness on
/// the calling selector. On error the implementation must close (drop) the
/// stream before returning.
pub trait ConnectionBuilder: Send + Sync {
    fn build(&self, stream: TcpStream, ctx: CnxnContext) -> std::io::Result<Arc<dyn Connection>>;
}

/// Capability handed to a connection at build time: its identity plus the
/// factory operations it is expected to call back into.
pub struct CnxnContext {
    id: ConnId,
    core: Arc<FactoryCore>,
}

impl CnxnContext {
    pub(crate) fn new(id: ConnId, core: Arc<FactoryCore>) -> Self {
        Self { id, core }
    }

    pub fn conn_id(&self) -> ConnId {
        self.id
    }

    /// De-register from every factory index. Returns false when the
    /// connection was already removed.
    pub fn remove_cnxn(&self, cnxn: &dyn Connection) -> bool {
        self.core.remove_cnxn(cnxn)
    }

    /// Renew the connection's expiry deadline.
    pub fn touch_cnxn(&self, cnxn: &dyn Connection) {
        self.core.touch_cnxn(cnxn);
    }

    /// Whether the factory is shutting down.
    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    /// Configured size for the per-thread I/O buffer (0 disables it).
    pub fn direct_buffer_bytes(&self) -> usize {
        self.core.direct_buffer_bytes()
    }
}

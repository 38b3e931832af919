//! Echo connection for the crossbar connection factory
//!
//! A production-shaped [`Connection`] implementation: level-triggered reads
//! through the per-thread direct buffer (or a stack buffer when direct
//! buffers are disabled), write backpressure via an outbound queue and a
//! widened interest mask, and gathered writes as the no-direct-buffer
//! fallback. Doubles as the reference implementation the integration tests
//! drive traffic through.

use crossbar_core::{CnxnContext, ConnId, Connection, ConnectionBuilder, Interest};
use crossbar_transport::iobuf;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Read size when direct buffers are disabled.
const FALLBACK_READ_BYTES: usize = 4096;

const INTEREST_READ: u8 = 0b01;
const INTEREST_WRITE: u8 = 0b10;

pub struct EchoConnection {
    ctx: CnxnContext,
    stream: TcpStream,
    peer: SocketAddr,
    open: AtomicBool,
    selectable: AtomicBool,
    interest: AtomicU8,
    session_id: AtomicU64,
    /// Negotiated session timeout in ms; 0 while no session is established.
    session_timeout_ms: AtomicU64,
    /// Bytes read but not yet written back.
    outbound: Mutex<VecDeque<Vec<u8>>>,
    established: Instant,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl EchoConnection {
    /// Record a completed session handshake; the factory starts renewing the
    /// expiry from this timeout instead of the sessionless one.
    pub fn set_session(&self, session_id: u64, timeout: Duration) {
        self.session_id.store(session_id, Ordering::Relaxed);
        self.session_timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Drain the socket into the outbound queue. The per-thread buffer is
    /// released before returning; the caller flushes afterwards, so this
    /// never nests two borrows of the thread-local buffer.
    fn handle_readable(&self) -> io::Result<()> {
        let direct = self.ctx.direct_buffer_bytes();
        if direct > 0 {
            iobuf::with_direct_buffer(direct, |buf| {
                self.read_into(buf.expect("direct buffer sized by configuration"))
            })
        } else {
            let mut buf = [0u8; FALLBACK_READ_BYTES];
            self.read_into(&mut buf)
        }
    }

    fn read_into(&self, buf: &mut [u8]) -> io::Result<()> {
        loop {
            match (&self.stream).read(buf) {
                Ok(0) => {
                    debug!("peer {} closed the connection", self.peer);
                    self.close();
                    return Ok(());
                }
                Ok(n) => {
                    self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    self.outbound.lock().unwrap().push_back(buf[..n].to_vec());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much queued data as the socket accepts. With a direct buffer
    /// the queued chunks are coalesced through it into one write; without one
    /// we fall back to a gathered write across the chunks.
    fn flush_outbound(&self) -> io::Result<()> {
        let mut queue = self.outbound.lock().unwrap();
        let direct = self.ctx.direct_buffer_bytes();

        while !queue.is_empty() {
            let written = if direct > 0 {
                iobuf::with_direct_buffer(direct, |buf| {
                    let buf = buf.expect("direct buffer sized by configuration");
                    let mut filled = 0;
                    for chunk in queue.iter() {
                        if filled == buf.len() {
                            break;
                        }
                        let take = chunk.len().min(buf.len() - filled);
                        buf[filled..filled + take].copy_from_slice(&chunk[..take]);
                        filled += take;
                    }
                    (&self.stream).write(&buf[..filled])
                })
            } else {
                let slices: Vec<IoSlice<'_>> = queue.iter().map(|c| IoSlice::new(c)).collect();
                (&self.stream).write_vectored(&slices)
            };

            match written {
                Ok(0) => break,
                Ok(mut n) => {
                    self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    while n > 0 {
                        let Some(mut chunk) = queue.pop_front() else { break };
                        if n >= chunk.len() {
                            n -= chunk.len();
                            continue;
                        }
                        chunk.drain(..n);
                        n = 0;
                        queue.push_front(chunk);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let mask = if queue.is_empty() {
            INTEREST_READ
        } else {
            INTEREST_READ | INTEREST_WRITE
        };
        self.interest.store(mask, Ordering::Release);
        Ok(())
    }

    fn queued_bytes(&self) -> usize {
        self.outbound.lock().unwrap().iter().map(Vec::len).sum()
    }
}

impl Connection for EchoConnection {
    fn conn_id(&self) -> ConnId {
        self.ctx.conn_id()
    }

    fn do_io(&self, ready: Interest) -> io::Result<()> {
        if ready.writable {
            self.flush_outbound()?;
        }
        if ready.readable {
            self.handle_readable()?;
            if self.is_open() {
                self.flush_outbound()?;
            }
        }
        Ok(())
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.ctx.remove_cnxn(self);
        // Shutting the socket down wakes the owning selector, which reaps
        // the registration; the fd itself lives until the last Arc drops
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("closed connection to {}", self.peer);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn interest_ops(&self) -> Interest {
        let mask = self.interest.load(Ordering::Acquire);
        Interest {
            readable: mask & INTEREST_READ != 0,
            writable: mask & INTEREST_WRITE != 0,
        }
    }

    fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Relaxed)
    }

    fn session_timeout(&self) -> Option<Duration> {
        match self.session_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn remote_address(&self) -> SocketAddr {
        self.peer
    }

    fn is_selectable(&self) -> bool {
        self.selectable.load(Ordering::Acquire)
    }

    fn enable_selectable(&self) {
        self.selectable.store(true, Ordering::Release);
    }

    fn disable_selectable(&self) {
        self.selectable.store(false, Ordering::Release);
    }

    fn reset_stats(&self) {
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
    }

    fn connection_info(&self, brief: bool) -> HashMap<String, Value> {
        let mut info = HashMap::new();
        info.insert("remote_socket_address".into(), Value::from(self.peer.to_string()));
        info.insert(
            "session_id".into(),
            Value::from(format!("0x{:x}", self.session_id())),
        );
        if !brief {
            info.insert(
                "bytes_received".into(),
                Value::from(self.bytes_received.load(Ordering::Relaxed)),
            );
            info.insert(
                "bytes_sent".into(),
                Value::from(self.bytes_sent.load(Ordering::Relaxed)),
            );
            info.insert("outstanding_bytes".into(), Value::from(self.queued_bytes() as u64));
            info.insert(
                "established_ms".into(),
                Value::from(self.established.elapsed().as_millis() as u64),
            );
        }
        info
    }
}

/// Builds an [`EchoConnection`] for every accepted socket.
pub struct EchoConnectionBuilder;

impl ConnectionBuilder for EchoConnectionBuilder {
    fn build(&self, stream: TcpStream, ctx: CnxnContext) -> io::Result<Arc<dyn Connection>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Arc::new(EchoConnection {
            ctx,
            stream,
            peer,
            open: AtomicBool::new(true),
            selectable: AtomicBool::new(true),
            interest: AtomicU8::new(INTEREST_READ),
            session_id: AtomicU64::new(0),
            session_timeout_ms: AtomicU64::new(0),
            outbound: Mutex::new(VecDeque::new()),
            established: Instant::now(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }))
    }
}

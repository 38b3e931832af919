//! Selector threads
//!
//! Each selector thread owns one [`Multiplexer`] outright. Registering a
//! socket, changing its interest mask and dropping its registration happen
//! only on the owning thread; on several platforms touching these from a
//! second thread while the first is blocked in the wait call can stall
//! indefinitely, and the single-writer rule removes the hazard without a
//! lock. Other threads communicate through two lock-free queues on the
//! thread's [`SelectorHandle`], waking the selector after every offer so the
//! item is observed on the next cycle.
//!
//! Readiness here is level-triggered: before a connection's I/O is handed to
//! the worker pool its interest mask is cleared, otherwise every subsequent
//! wait would re-report the same unconsumed bytes. The worker offers the
//! token back on the update queue when it finishes and the selector restores
//! the mask the connection asks for.

use crate::connection::{CnxnContext, Connection, ConnectionBuilder};
use crate::factory::FactoryCore;
use crate::worker::WorkRequest;
use crossbar_transport::{sock, Interest, Multiplexer, Waker, WAKE_TOKEN};
use crossbeam_queue::SegQueue;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cross-thread face of a selector thread: the two intake queues plus the
/// wakeup primitive. Offer-then-wake ordering guarantees the owning thread
/// sees the item on its next drain.
pub struct SelectorHandle {
    id: usize,
    accepted_queue: SegQueue<TcpStream>,
    update_queue: SegQueue<usize>,
    waker: Waker,
    stopped: Arc<AtomicBool>,
    accepted_total: AtomicUsize,
}

impl SelectorHandle {
    fn new(id: usize, waker: Waker, stopped: Arc<AtomicBool>) -> Self {
        Self {
            id,
            accepted_queue: SegQueue::new(),
            update_queue: SegQueue::new(),
            waker,
            stopped,
            accepted_total: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a freshly accepted socket to this selector for registration.
    /// Returns the socket on refusal (factory stopping) so the caller can
    /// fast-close it.
    pub fn add_accepted_connection(&self, sock: TcpStream) -> Result<(), TcpStream> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(sock);
        }
        self.accepted_queue.push(sock);
        self.accepted_total.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
        Ok(())
    }

    /// Ask the owning thread to restore the interest mask of `token` (or to
    /// clean it up if its connection died). Returns false when the factory is
    /// stopping.
    pub fn add_interest_ops_update(&self, token: usize) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.update_queue.push(token);
        self.waker.wake();
        true
    }

    pub fn wakeup(&self) {
        self.waker.wake();
    }

    /// Total sockets ever offered to this selector; accepts are spread
    /// round-robin so the totals stay balanced.
    pub fn accepted_total(&self) -> usize {
        self.accepted_total.load(Ordering::Relaxed)
    }
}

struct Registered {
    fd: RawFd,
    cnxn: Arc<dyn Connection>,
}

pub struct SelectorThread {
    mux: Multiplexer,
    handle: Arc<SelectorHandle>,
    core: Arc<FactoryCore>,
    builder: Arc<dyn ConnectionBuilder>,
    registered: HashMap<usize, Registered>,
    next_token: usize,
}

impl SelectorThread {
    pub(crate) fn new(
        id: usize,
        core: Arc<FactoryCore>,
        builder: Arc<dyn ConnectionBuilder>,
    ) -> crate::Result<Self> {
        let mux = Multiplexer::new()?;
        let handle = Arc::new(SelectorHandle::new(id, mux.waker(), core.stopped_flag()));
        Ok(Self {
            mux,
            handle,
            core,
            builder,
            registered: HashMap::new(),
            next_token: 0,
        })
    }

    pub(crate) fn handle(&self) -> Arc<SelectorHandle> {
        self.handle.clone()
    }

    /// Thread body: select and dispatch ready connections, register pending
    /// accepts, apply queued interest updates; on exit, tear down everything
    /// still registered and cascade the stop to the rest of the factory.
    pub(crate) fn run(mut self) {
        let id = self.handle.id();
        while !self.core.is_stopped() {
            if let Err(e) = self.select() {
                warn!("selector {id}: ignoring error while selecting: {e}");
            }
            self.process_accepted_connections();
            self.process_interest_ops_updates();
        }

        // Close connections still pending on this selector; ones with
        // in-flight work drain out of the worker queue and observe the stop
        // flag there.
        let registered: Vec<(usize, Registered)> = self.registered.drain().collect();
        for (token, reg) in registered {
            if reg.cnxn.is_selectable() {
                reg.cnxn.close();
            }
            let _ = self.mux.deregister(reg.fd, token);
        }
        while let Some(sock) = self.handle.accepted_queue.pop() {
            sock::fast_close(sock);
        }
        while self.handle.update_queue.pop().is_some() {}

        self.core.stop();
        info!("selector thread {id} exited");
    }

    fn select(&mut self) -> crate::Result<()> {
        let mut events = self.mux.wait(None)?;
        // Shuffle so a persistently hot descriptor cannot starve the rest of
        // the ready set
        events.shuffle(&mut rand::thread_rng());

        for event in events {
            if self.core.is_stopped() {
                break;
            }
            let cnxn = match self.registered.get(&event.token) {
                Some(reg) => reg.cnxn.clone(),
                None => continue,
            };
            if !cnxn.is_open() {
                self.cleanup_key(event.token);
                continue;
            }
            if event.readable || event.writable {
                let ready = Interest { readable: event.readable, writable: event.writable };
                self.handle_io(event.token, ready, cnxn);
            }
        }
        Ok(())
    }

    /// Stop selecting this connection while its I/O is processed, then hand
    /// the work to the pool keyed by connection identity.
    fn handle_io(&mut self, token: usize, ready: Interest, cnxn: Arc<dyn Connection>) {
        cnxn.disable_selectable();
        if let Some(reg) = self.registered.get(&token) {
            if let Err(e) = self.mux.reregister(reg.fd, token, Interest::NONE) {
                debug!("failed to mask interest for token {token}: {e}");
            }
        }
        self.core.touch_cnxn(cnxn.as_ref());

        let key = cnxn.conn_id();
        let request = IoWorkRequest {
            selector: self.handle.clone(),
            core: self.core.clone(),
            token,
            ready,
            cnxn,
        };
        self.core.schedule_io(Box::new(request), key);
    }

    /// Register sockets the accept thread assigned to this selector but that
    /// are not yet on the multiplexer.
    fn process_accepted_connections(&mut self) {
        while !self.core.is_stopped() {
            let Some(sock) = self.handle.accepted_queue.pop() else {
                break;
            };
            self.register_accepted(sock);
        }
    }

    fn register_accepted(&mut self, sock: TcpStream) {
        let fd = sock.as_raw_fd();
        let token = self.alloc_token();
        if let Err(e) = self.mux.register(fd, token, Interest::READABLE) {
            debug!("failed to register accepted socket: {e}");
            sock::fast_close(sock);
            return;
        }

        let ctx = CnxnContext::new(self.core.next_conn_id(), self.core.clone());
        match self.builder.build(sock, ctx) {
            Ok(cnxn) => {
                self.registered.insert(token, Registered { fd, cnxn: cnxn.clone() });
                self.core.add_cnxn(cnxn);
            }
            Err(e) => {
                // The builder closed the stream; drop the dangling
                // registration (the kernel may already have)
                debug!("failed to build connection for accepted socket: {e}");
                let _ = self.mux.deregister(fd, token);
            }
        }
    }

    /// Restore the interest mask of connections whose I/O completed, and
    /// reap registrations whose connection died since.
    fn process_interest_ops_updates(&mut self) {
        while !self.core.is_stopped() {
            let Some(token) = self.handle.update_queue.pop() else {
                break;
            };
            let (fd, cnxn) = match self.registered.get(&token) {
                Some(reg) => (reg.fd, reg.cnxn.clone()),
                None => continue,
            };
            if !cnxn.is_open() {
                self.cleanup_key(token);
                continue;
            }
            if cnxn.is_selectable() {
                if let Err(e) = self.mux.reregister(fd, token, cnxn.interest_ops()) {
                    debug!("failed to restore interest for token {token}: {e}");
                }
            }
        }
    }

    fn cleanup_key(&mut self, token: usize) {
        if let Some(reg) = self.registered.remove(&token) {
            let _ = self.mux.deregister(reg.fd, token);
        }
    }

    fn alloc_token(&mut self) -> usize {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        if self.next_token == WAKE_TOKEN {
            self.next_token = 0;
        }
        token
    }
}

/// Adapter between a ready selection and the worker pool: runs the
/// connection's I/O, renews its expiry, and queues the interest-ops
/// restoration back onto the owning selector.
struct IoWorkRequest {
    selector: Arc<SelectorHandle>,
    core: Arc<FactoryCore>,
    token: usize,
    ready: Interest,
    cnxn: Arc<dyn Connection>,
}

impl WorkRequest for IoWorkRequest {
    fn do_work(&mut self) -> crate::Result<()> {
        if !self.cnxn.is_open() {
            // Dead before we got to it: let the owning selector reap the key
            self.selector.add_interest_ops_update(self.token);
            return Ok(());
        }
        if self.ready.readable || self.ready.writable {
            if let Err(e) = self.cnxn.do_io(self.ready) {
                debug!(
                    "closing connection to {} after I/O error: {e}",
                    self.cnxn.remote_address()
                );
                self.cnxn.close();
            }

            // The factory may have stopped, or the I/O may have killed the
            // connection, while we were working
            if self.core.is_stopped() {
                self.cnxn.close();
                return Ok(());
            }
            if !self.cnxn.is_open() {
                self.selector.add_interest_ops_update(self.token);
                return Ok(());
            }
            self.core.touch_cnxn(self.cnxn.as_ref());
        }

        self.cnxn.enable_selectable();
        // Resume selection on whatever interest set the I/O left behind
        if !self.selector.add_interest_ops_update(self.token) {
            self.cnxn.close();
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.cnxn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn handle_with_flag(stopped: bool) -> (SelectorHandle, Multiplexer) {
        let mux = Multiplexer::new().unwrap();
        let flag = Arc::new(AtomicBool::new(stopped));
        let handle = SelectorHandle::new(3, mux.waker(), flag);
        (handle, mux)
    }

    fn connected_pair() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let _server = listener.accept().unwrap();
        client
    }

    #[test]
    fn test_offers_accepted_while_running() {
        let (handle, mut mux) = handle_with_flag(false);
        assert!(handle.add_accepted_connection(connected_pair()).is_ok());
        assert!(handle.add_interest_ops_update(11));
        assert_eq!(handle.accepted_total(), 1);

        // Both offers woke the selector; a blocked wait returns immediately
        let events = mux.wait(Some(std::time::Duration::from_secs(2))).unwrap();
        assert!(events.is_empty());
        assert!(handle.accepted_queue.pop().is_some());
        assert_eq!(handle.update_queue.pop(), Some(11));
    }

    #[test]
    fn test_offers_refused_after_stop() {
        let (handle, _mux) = handle_with_flag(true);
        let sock = connected_pair();
        assert!(handle.add_accepted_connection(sock).is_err());
        assert!(!handle.add_interest_ops_update(5));
        assert_eq!(handle.accepted_total(), 0);
        assert!(handle.accepted_queue.pop().is_none());
    }
}

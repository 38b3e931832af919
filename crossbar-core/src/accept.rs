//! Accept thread
//!
//! A single thread owns the listen socket and its selector. It accepts new
//! sockets, enforces the per-peer connection cap, and spreads the survivors
//! across the selector threads round-robin. Accept failures that smell like
//! file-descriptor exhaustion pause accepting briefly instead of spinning.
//!
//! When the thread exits it closes the listen socket and cascades a factory
//! stop, unless it was marked *reconfiguring*, in which case a replacement
//! thread bound to a new address takes over the same selector set.

use crate::factory::FactoryCore;
use crate::ratelog::RateLogger;
use crate::selector::SelectorHandle;
use crossbar_transport::{sock, Interest, Multiplexer, Waker};
use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

const LISTEN_TOKEN: usize = 0;
const ACCEPT_PAUSE: Duration = Duration::from_millis(10);

/// Shared control surface for a running accept thread.
pub(crate) struct AcceptControl {
    waker: Waker,
    reconfiguring: AtomicBool,
    closed: AtomicBool,
}

impl AcceptControl {
    /// Mark the thread as being replaced: its exit must not cascade a
    /// factory-wide stop.
    pub(crate) fn set_reconfiguring(&self) {
        self.reconfiguring.store(true, Ordering::Release);
    }

    /// Stop accepting: the woken thread exits its loop and closes the listen
    /// socket. Safe to call repeatedly and at any time.
    pub(crate) fn request_close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// Join handle plus control surface, held by the factory facade.
pub(crate) struct AcceptHandle {
    pub(crate) ctl: Arc<AcceptControl>,
    pub(crate) join: JoinHandle<()>,
}

pub(crate) struct AcceptThread {
    mux: Multiplexer,
    listener: TcpListener,
    listen_fd: RawFd,
    core: Arc<FactoryCore>,
    selectors: Vec<Arc<SelectorHandle>>,
    next_selector: usize,
    accept_errors: RateLogger,
    ctl: Arc<AcceptControl>,
}

impl AcceptThread {
    pub(crate) fn new(
        listener: TcpListener,
        core: Arc<FactoryCore>,
        selectors: Vec<Arc<SelectorHandle>>,
    ) -> crate::Result<Self> {
        let mut mux = Multiplexer::new()?;
        let listen_fd = listener.as_raw_fd();
        mux.register(listen_fd, LISTEN_TOKEN, Interest::READABLE)?;
        let ctl = Arc::new(AcceptControl {
            waker: mux.waker(),
            reconfiguring: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Ok(Self {
            mux,
            listener,
            listen_fd,
            core,
            selectors,
            next_selector: 0,
            accept_errors: RateLogger::new(),
            ctl,
        })
    }

    pub(crate) fn control(&self) -> Arc<AcceptControl> {
        self.ctl.clone()
    }

    pub(crate) fn run(mut self) {
        while !self.core.is_stopped() && !self.ctl.closed.load(Ordering::Acquire) {
            if let Err(e) = self.select() {
                warn!("ignoring error in accept loop: {e}");
            }
        }

        let AcceptThread { mux, listener, core, ctl, .. } = self;
        drop(mux);
        // Closing the listen socket is what actually stops new connections
        drop(listener);
        if !ctl.reconfiguring.load(Ordering::Acquire) {
            core.stop();
        }
        info!("accept thread exited");
    }

    fn select(&mut self) -> crate::Result<()> {
        let events = self.mux.wait(None)?;
        for event in events {
            if self.core.is_stopped() || self.ctl.closed.load(Ordering::Acquire) {
                break;
            }
            if event.token != LISTEN_TOKEN {
                warn!("unexpected token {} in accept select", event.token);
                continue;
            }
            if event.readable && !self.do_accept() {
                // Could not pull a connection off the accept queue; back off
                // so fd exhaustion does not turn into a tight loop
                self.pause_accept(ACCEPT_PAUSE)?;
            }
        }
        Ok(())
    }

    /// Accept one connection. Enforces the per-peer cap and round-robin
    /// assigns the survivor to a selector thread. Returns whether a
    /// connection could be pulled off the accept queue.
    fn do_accept(&mut self) -> bool {
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) => {
                self.accept_errors
                    .rate_limit_log(&format!("error accepting new connection: {e}"));
                return false;
            }
        };

        let max = self.core.max_client_cnxns();
        if max > 0 && self.core.client_cnxn_count(peer.ip()) >= max {
            self.accept_errors.rate_limit_log(&format!(
                "too many connections from {} - max is {max}",
                peer.ip()
            ));
            sock::fast_close(stream);
            return true;
        }

        info!("accepted socket connection from {peer}");
        if let Err(e) = stream.set_nonblocking(true) {
            self.accept_errors
                .rate_limit_log(&format!("error configuring accepted socket: {e}"));
            sock::fast_close(stream);
            return true;
        }

        let idx = self.next_selector % self.selectors.len();
        self.next_selector = self.next_selector.wrapping_add(1);
        if let Err(stream) = self.selectors[idx].add_accepted_connection(stream) {
            self.accept_errors.rate_limit_log(
                "unable to add connection to selector queue (shutdown in progress)",
            );
            sock::fast_close(stream);
            return true;
        }

        self.accept_errors.flush();
        true
    }

    /// Mask the listen socket's interest and wait out the pause on the
    /// selector, so another thread can still wake us early.
    fn pause_accept(&mut self, pause: Duration) -> crate::Result<()> {
        self.mux.reregister(self.listen_fd, LISTEN_TOKEN, Interest::NONE)?;
        if let Err(e) = self.mux.wait(Some(pause)) {
            warn!("ignoring error while pausing accept: {e}");
        }
        self.mux.reregister(self.listen_fd, LISTEN_TOKEN, Interest::READABLE)?;
        Ok(())
    }
}

pub(crate) fn spawn_accept_thread(thread: AcceptThread) -> crate::Result<AcceptHandle> {
    let ctl = thread.control();
    let join = std::thread::Builder::new()
        .name("accept-thread".into())
        .spawn(move || thread.run())
        .map_err(crate::Error::Io)?;
    Ok(AcceptHandle { ctl, join })
}

impl AcceptHandle {
    pub(crate) fn join(self) {
        if self.join.join().is_err() {
            error!("accept thread panicked");
        }
    }
}

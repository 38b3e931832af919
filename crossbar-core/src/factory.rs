//! Connection factory facade
//!
//! Wires the lifecycle together: `configure` builds the listen socket, the
//! selector threads, the accept thread and the expiry wheel without starting
//! anything; `start` brings the worker pool and all threads up; `stop` closes
//! the listen socket and signals every thread; `join` waits them out;
//! `shutdown` chains the three and closes every live connection.
//!
//! The factory also owns the shared registries: the live-connection table,
//! the per-peer index backing the connection cap, and the session table
//! populated by the upstream handshake.

use crate::accept::{spawn_accept_thread, AcceptControl, AcceptHandle, AcceptThread};
use crate::config::FactoryConfig;
use crate::connection::{ConnId, Connection, ConnectionBuilder};
use crate::expiry::ExpiryQueue;
use crate::selector::{SelectorHandle, SelectorThread};
use crate::worker::{WorkRequest, WorkerService};
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use crossbar_transport::sock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// State shared between the factory threads and every live connection.
pub(crate) struct FactoryCore {
    stopped: Arc<AtomicBool>,
    sessionless_timeout_ms: u64,
    direct_buffer_bytes: usize,
    num_worker_threads: usize,
    max_client_cnxns: AtomicUsize,
    next_conn_id: AtomicU64,

    cnxns: Mutex<HashMap<ConnId, Arc<dyn Connection>>>,
    /// Peer address -> live connections from it. Entries are inserted lazily
    /// and empty sets are retained; bounded by the distinct peer count.
    ip_map: Mutex<HashMap<IpAddr, HashSet<ConnId>>>,
    session_map: Mutex<HashMap<u64, ConnId>>,
    expiry: ExpiryQueue<ConnId>,

    worker_pool: OnceLock<WorkerService>,
    selectors: Mutex<Vec<Arc<SelectorHandle>>>,
    accept_ctl: Mutex<Option<Arc<AcceptControl>>>,
    expirer_stop: Mutex<Option<Sender<()>>>,
}

impl FactoryCore {
    fn new(config: &FactoryConfig, max_client_cnxns: usize) -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(true)),
            sessionless_timeout_ms: config.sessionless_cnxn_timeout,
            direct_buffer_bytes: config.direct_buffer_bytes,
            num_worker_threads: config.num_worker_threads,
            max_client_cnxns: AtomicUsize::new(max_client_cnxns),
            next_conn_id: AtomicU64::new(1),
            cnxns: Mutex::new(HashMap::new()),
            ip_map: Mutex::new(HashMap::new()),
            session_map: Mutex::new(HashMap::new()),
            expiry: ExpiryQueue::new(config.sessionless_cnxn_timeout),
            worker_pool: OnceLock::new(),
            selectors: Mutex::new(Vec::new()),
            accept_ctl: Mutex::new(None),
            expirer_stop: Mutex::new(None),
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stopped_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn direct_buffer_bytes(&self) -> usize {
        self.direct_buffer_bytes
    }

    pub(crate) fn max_client_cnxns(&self) -> usize {
        self.max_client_cnxns.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_client_cnxns(&self, max: usize) {
        self.max_client_cnxns.store(max, Ordering::Relaxed);
    }

    pub(crate) fn client_cnxn_count(&self, ip: IpAddr) -> usize {
        self.ip_map.lock().unwrap().get(&ip).map(|set| set.len()).unwrap_or(0)
    }

    /// Index a freshly registered connection and arm its expiry.
    pub(crate) fn add_cnxn(&self, cnxn: Arc<dyn Connection>) {
        let id = cnxn.conn_id();
        let ip = cnxn.remote_address().ip();
        self.ip_map.lock().unwrap().entry(ip).or_default().insert(id);
        self.cnxns.lock().unwrap().insert(id, cnxn.clone());
        self.touch_cnxn(cnxn.as_ref());
    }

    /// De-register a connection from every index. Returns false when it was
    /// already removed, which makes double closes harmless.
    pub(crate) fn remove_cnxn(&self, cnxn: &dyn Connection) -> bool {
        let id = cnxn.conn_id();
        if self.cnxns.lock().unwrap().remove(&id).is_none() {
            return false;
        }
        self.expiry.remove(&id);

        let session_id = cnxn.session_id();
        if session_id != 0 {
            let mut sessions = self.session_map.lock().unwrap();
            if sessions.get(&session_id) == Some(&id) {
                sessions.remove(&session_id);
            }
        }

        if let Some(set) = self.ip_map.lock().unwrap().get_mut(&cnxn.remote_address().ip()) {
            set.remove(&id);
            // The now-possibly-empty set stays in the map
        }
        true
    }

    /// Renew the connection's expiry from its session timeout, or from the
    /// sessionless timeout while no session is established.
    pub(crate) fn touch_cnxn(&self, cnxn: &dyn Connection) {
        let timeout_ms = cnxn
            .session_timeout()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(self.sessionless_timeout_ms);
        self.expiry.update(&cnxn.conn_id(), timeout_ms);
    }

    pub(crate) fn schedule_io(&self, request: Box<dyn WorkRequest>, key: u64) {
        match self.worker_pool.get() {
            Some(pool) => pool.schedule(request, key),
            None => {
                // Selectors only run between start() and shutdown, where the
                // pool exists; anything else is a lifecycle bug
                error!("I/O scheduled with no worker pool; dropping request");
                let mut request = request;
                request.cleanup();
            }
        }
    }

    pub(crate) fn get_cnxn(&self, id: ConnId) -> Option<Arc<dyn Connection>> {
        self.cnxns.lock().unwrap().get(&id).cloned()
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.cnxns.lock().unwrap().values().cloned().collect()
    }

    fn selectors(&self) -> Vec<Arc<SelectorHandle>> {
        self.selectors.lock().unwrap().clone()
    }

    /// Signal every thread to stop: close the listen socket, interrupt the
    /// expirer, wake the selectors, drain the worker pool. Idempotent, and
    /// invoked both by the facade and as the cascade when any selector or
    /// accept thread exits.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(ctl) = self.accept_ctl.lock().unwrap().as_ref() {
            ctl.request_close();
        }
        if let Some(tx) = self.expirer_stop.lock().unwrap().take() {
            let _ = tx.send(());
        }
        for handle in self.selectors.lock().unwrap().iter() {
            handle.wakeup();
        }
        if let Some(pool) = self.worker_pool.get() {
            pool.stop();
        }
    }
}

/// Closes connections whose expiry deadline passed without a renewing touch,
/// reaping sockets that never completed (or whose session outlived) the
/// application handshake.
fn run_expirer(core: Arc<FactoryCore>, stop_rx: Receiver<()>) {
    while !core.is_stopped() {
        let wait = core.expiry.wait_time();
        if !wait.is_zero() {
            match stop_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
        for id in core.expiry.poll() {
            if let Some(cnxn) = core.get_cnxn(id) {
                debug!("closing expired connection from {}", cnxn.remote_address());
                cnxn.close();
            }
        }
    }
    info!("connection expirer thread exited");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unconfigured,
    Configured,
    Running,
    /// `stop()` has been issued but `join()` has not completed yet.
    Stopping,
    Stopped,
}

pub struct ConnectionFactory {
    builder: Arc<dyn ConnectionBuilder>,
    state: State,
    config: FactoryConfig,
    core: Option<Arc<FactoryCore>>,
    local_addr: Option<SocketAddr>,

    selector_threads: Vec<SelectorThread>,
    selector_handles: Vec<Arc<SelectorHandle>>,
    selector_joins: Vec<JoinHandle<()>>,
    accept_thread: Option<AcceptThread>,
    accept_handle: Option<AcceptHandle>,
    expirer_rx: Option<Receiver<()>>,
    expirer_join: Option<JoinHandle<()>>,
}

impl ConnectionFactory {
    pub fn new(builder: Arc<dyn ConnectionBuilder>) -> Self {
        Self {
            builder,
            state: State::Unconfigured,
            config: FactoryConfig::default(),
            core: None,
            local_addr: None,
            selector_threads: Vec::new(),
            selector_handles: Vec::new(),
            selector_joins: Vec::new(),
            accept_thread: None,
            accept_handle: None,
            expirer_rx: None,
            expirer_join: None,
        }
    }

    /// Configure with tunables taken from the process environment.
    pub fn configure(
        &mut self,
        addr: SocketAddr,
        max_client_cnxns: usize,
        secure: bool,
    ) -> Result<()> {
        self.configure_with(addr, max_client_cnxns, secure, FactoryConfig::from_env())
    }

    /// Bind the listen socket and build (but do not start) every thread.
    pub fn configure_with(
        &mut self,
        addr: SocketAddr,
        max_client_cnxns: usize,
        secure: bool,
        config: FactoryConfig,
    ) -> Result<()> {
        if self.state != State::Unconfigured {
            return Err(Error::State(format!("cannot configure from {:?}", self.state)));
        }
        if secure {
            return Err(Error::Unsupported("TLS is not supported on this listener".into()));
        }
        config.validate()?;

        info!(
            "configuring connection factory: {}ms sessionless connection timeout, \
             {} selector thread(s), {} worker thread(s), {}",
            config.sessionless_cnxn_timeout,
            config.num_selector_threads,
            config.num_worker_threads,
            if config.direct_buffer_bytes == 0 {
                "gathered writes".to_string()
            } else {
                format!("{} kB direct buffers", config.direct_buffer_bytes / 1024)
            }
        );

        let core = Arc::new(FactoryCore::new(&config, max_client_cnxns));

        let mut threads = Vec::with_capacity(config.num_selector_threads);
        let mut handles = Vec::with_capacity(config.num_selector_threads);
        for id in 0..config.num_selector_threads {
            let thread = SelectorThread::new(id, core.clone(), self.builder.clone())?;
            handles.push(thread.handle());
            threads.push(thread);
        }
        *core.selectors.lock().unwrap() = handles.clone();

        let listener = sock::bind_listener(addr)?;
        let local = listener.local_addr()?;
        info!("binding to {local}");

        let accept = AcceptThread::new(listener, core.clone(), handles.clone())?;
        *core.accept_ctl.lock().unwrap() = Some(accept.control());

        let (stop_tx, stop_rx) = bounded(1);
        *core.expirer_stop.lock().unwrap() = Some(stop_tx);

        self.config = config;
        self.core = Some(core);
        self.local_addr = Some(local);
        self.selector_threads = threads;
        self.selector_handles = handles;
        self.accept_thread = Some(accept);
        self.expirer_rx = Some(stop_rx);
        self.state = State::Configured;
        Ok(())
    }

    /// Start the worker pool and every configured thread. Idempotent once
    /// running.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            State::Running => return Ok(()),
            State::Configured => {}
            other => return Err(Error::State(format!("cannot start from {other:?}"))),
        }
        let core = self.core.as_ref().cloned().ok_or_else(|| {
            Error::State("start called with no configured core".into())
        })?;

        core.worker_pool
            .get_or_init(|| WorkerService::new("io-worker", core.num_worker_threads));
        core.stopped.store(false, Ordering::Release);

        for thread in self.selector_threads.drain(..) {
            let name = format!("selector-{}", thread.handle().id());
            let join = std::thread::Builder::new()
                .name(name)
                .spawn(move || thread.run())
                .map_err(Error::Io)?;
            self.selector_joins.push(join);
        }

        if let Some(accept) = self.accept_thread.take() {
            self.accept_handle = Some(spawn_accept_thread(accept)?);
        }

        if let Some(stop_rx) = self.expirer_rx.take() {
            let expirer_core = core.clone();
            let join = std::thread::Builder::new()
                .name("cnxn-expirer".into())
                .spawn(move || run_expirer(expirer_core, stop_rx))
                .map_err(Error::Io)?;
            self.expirer_join = Some(join);
        }

        self.state = State::Running;
        Ok(())
    }

    /// Stop accepting and signal every thread. Callable at any time.
    pub fn stop(&mut self) {
        if let Some(core) = &self.core {
            core.stop();
            if matches!(self.state, State::Configured | State::Running) {
                self.state = State::Stopping;
            }
        }
    }

    /// Wait for the accept thread, the selector threads and the worker pool
    /// (the latter bounded by the shutdown timeout).
    pub fn join(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            handle.join();
        }
        for join in self.selector_joins.drain(..) {
            if join.join().is_err() {
                error!("selector thread panicked");
            }
        }
        if let Some(join) = self.expirer_join.take() {
            if join.join().is_err() {
                error!("connection expirer thread panicked");
            }
        }
        if let Some(core) = &self.core {
            if let Some(pool) = core.worker_pool.get() {
                pool.join(Duration::from_millis(self.config.shutdown_timeout));
            }
        }
        if self.state != State::Unconfigured {
            self.state = State::Stopped;
        }
    }

    /// `stop` + `join` + close every live connection.
    pub fn shutdown(&mut self) {
        self.stop();
        self.join();
        self.close_all();
    }

    /// Close every live connection; each close de-registers itself.
    pub fn close_all(&self) {
        if let Some(core) = &self.core {
            for cnxn in core.connections() {
                cnxn.close();
            }
        }
    }

    /// Move the listener to `new_addr` without disturbing established
    /// connections: bind the replacement socket, retire the old accept thread
    /// (closing the old socket), and start a fresh accept thread over the
    /// same selector set.
    pub fn reconfigure(&mut self, new_addr: SocketAddr) -> Result<()> {
        if !matches!(self.state, State::Configured | State::Running) {
            return Err(Error::State(format!("cannot reconfigure from {:?}", self.state)));
        }
        let core = self.core.as_ref().cloned().ok_or_else(|| {
            Error::State("cannot reconfigure an unconfigured factory".into())
        })?;

        let listener = sock::bind_listener(new_addr)?;
        let local = listener.local_addr()?;
        info!("binding to {local}");

        if let Some(handle) = self.accept_handle.take() {
            handle.ctl.set_reconfiguring();
            handle.ctl.request_close();
            handle.join();
        } else if let Some(old) = self.accept_thread.take() {
            // Never started; dropping it closes the old listen socket
            drop(old);
        }

        let accept = AcceptThread::new(listener, core.clone(), core.selectors())?;
        *core.accept_ctl.lock().unwrap() = Some(accept.control());
        self.local_addr = Some(local);

        if self.state == State::Running {
            self.accept_handle = Some(spawn_accept_thread(accept)?);
        } else {
            self.accept_thread = Some(accept);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Session and registry operations
    // -------------------------------------------------------------------------

    /// Publish a session -> connection binding. A pre-existing binding is
    /// overwritten; the upstream call site detects collisions before this.
    pub fn add_session(&self, session_id: u64, cnxn: &dyn Connection) {
        if let Some(core) = &self.core {
            core.session_map.lock().unwrap().insert(session_id, cnxn.conn_id());
        }
    }

    /// Drop the session binding and close its connection, if any.
    pub fn close_session(&self, session_id: u64) -> bool {
        let Some(core) = &self.core else { return false };
        let id = core.session_map.lock().unwrap().remove(&session_id);
        match id.and_then(|id| core.get_cnxn(id)) {
            Some(cnxn) => {
                cnxn.close();
                true
            }
            None => false,
        }
    }

    pub fn remove_cnxn(&self, cnxn: &dyn Connection) -> bool {
        self.core.as_ref().map(|core| core.remove_cnxn(cnxn)).unwrap_or(false)
    }

    pub fn touch_cnxn(&self, cnxn: &dyn Connection) {
        if let Some(core) = &self.core {
            core.touch_cnxn(cnxn);
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.map(|addr| addr.port())
    }

    pub fn max_client_cnxns(&self) -> usize {
        self.core.as_ref().map(|core| core.max_client_cnxns()).unwrap_or(0)
    }

    pub fn set_max_client_cnxns(&self, max: usize) {
        if let Some(core) = &self.core {
            core.set_max_client_cnxns(max);
        }
    }

    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.core.as_ref().map(|core| core.connections()).unwrap_or_default()
    }

    pub fn reset_all_connection_stats(&self) {
        for cnxn in self.connections() {
            cnxn.reset_stats();
        }
    }

    pub fn all_connection_info(&self, brief: bool) -> Vec<HashMap<String, Value>> {
        self.connections().iter().map(|cnxn| cnxn.connection_info(brief)).collect()
    }

    /// Expiry-bucket summary of the live connections, for the admin dump
    /// command.
    pub fn dump_connections(&self) -> String {
        let mut out = String::new();
        if let Some(core) = &self.core {
            out.push_str(&format!("Connections: {}\n", core.cnxns.lock().unwrap().len()));
            core.expiry.dump(&mut out);
        }
        out
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        if matches!(self.state, State::Running | State::Stopping) {
            warn!("connection factory dropped while running; shutting down");
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CnxnContext;
    use crossbar_transport::Interest;
    use std::io::{ErrorKind, Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::time::Instant;

    struct TestCnxn {
        ctx: CnxnContext,
        stream: TcpStream,
        peer: SocketAddr,
        open: AtomicBool,
        selectable: AtomicBool,
        session_id: AtomicU64,
        bytes_received: AtomicU64,
    }

    impl Connection for TestCnxn {
        fn conn_id(&self) -> ConnId {
            self.ctx.conn_id()
        }

        fn do_io(&self, ready: Interest) -> std::io::Result<()> {
            if ready.readable {
                let mut buf = [0u8; 256];
                loop {
                    match (&self.stream).read(&mut buf) {
                        Ok(0) => {
                            self.close();
                            break;
                        }
                        Ok(n) => {
                            self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(())
        }

        fn close(&self) {
            if self.open.swap(false, Ordering::AcqRel) {
                self.ctx.remove_cnxn(self);
                let _ = self.stream.shutdown(Shutdown::Both);
            }
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn interest_ops(&self) -> Interest {
            Interest::READABLE
        }

        fn session_id(&self) -> u64 {
            self.session_id.load(Ordering::Relaxed)
        }

        fn session_timeout(&self) -> Option<Duration> {
            None
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
        }

        fn connection_info(&self, brief: bool) -> HashMap<String, Value> {
            let mut info = HashMap::new();
            info.insert("remote_socket_address".into(), Value::from(self.peer.to_string()));
            if !brief {
                info.insert(
                    "bytes_received".into(),
                    Value::from(self.bytes_received.load(Ordering::Relaxed)),
                );
            }
            info
        }
    }

    struct TestBuilder;

    impl ConnectionBuilder for TestBuilder {
        fn build(
            &self,
            stream: TcpStream,
            ctx: CnxnContext,
        ) -> std::io::Result<Arc<dyn Connection>> {
            let peer = stream.peer_addr()?;
            Ok(Arc::new(TestCnxn {
                ctx,
                stream,
                peer,
                open: AtomicBool::new(true),
                selectable: AtomicBool::new(true),
                session_id: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }))
        }
    }

    fn test_config(selectors: usize, tick_ms: u64) -> FactoryConfig {
        FactoryConfig {
            sessionless_cnxn_timeout: tick_ms,
            num_selector_threads: selectors,
            num_worker_threads: 2,
            direct_buffer_bytes: 0,
            shutdown_timeout: 2_000,
            max_client_cnxns: 60,
        }
    }

    fn start_factory(max_cnxns: usize, config: FactoryConfig) -> (ConnectionFactory, SocketAddr) {
        let mut factory = ConnectionFactory::new(Arc::new(TestBuilder));
        factory
            .configure_with("127.0.0.1:0".parse().unwrap(), max_cnxns, false, config)
            .unwrap();
        factory.start().unwrap();
        let addr = factory.local_addr().unwrap();
        (factory, addr)
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_configure_rejects_secure() {
        let mut factory = ConnectionFactory::new(Arc::new(TestBuilder));
        let err = factory
            .configure_with("127.0.0.1:0".parse().unwrap(), 0, true, test_config(1, 10_000))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_configure_rejects_zero_selectors() {
        let mut factory = ConnectionFactory::new(Arc::new(TestBuilder));
        let err = factory
            .configure_with("127.0.0.1:0".parse().unwrap(), 0, false, test_config(0, 10_000))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_start_requires_configure() {
        let mut factory = ConnectionFactory::new(Arc::new(TestBuilder));
        assert!(matches!(factory.start(), Err(Error::State(_))));
    }

    #[test]
    fn test_stop_window_blocks_start_and_reconfigure() {
        let (mut factory, _addr) = start_factory(0, test_config(1, 10_000));

        // Between stop() and join() the factory is stopping: no restart and
        // no fresh listener over the dying core
        factory.stop();
        assert!(matches!(factory.start(), Err(Error::State(_))));
        assert!(matches!(
            factory.reconfigure("127.0.0.1:0".parse().unwrap()),
            Err(Error::State(_))
        ));

        factory.join();
        assert!(matches!(factory.start(), Err(Error::State(_))));
    }

    #[test]
    fn test_round_robin_distribution() {
        let (mut factory, addr) = start_factory(0, test_config(4, 10_000));

        let mut clients = Vec::new();
        for _ in 0..8 {
            clients.push(TcpStream::connect(addr).unwrap());
        }
        assert!(
            wait_for(|| factory.connections().len() == 8, Duration::from_secs(5)),
            "expected 8 registered connections, got {}",
            factory.connections().len()
        );

        for handle in &factory.selector_handles {
            assert_eq!(handle.accepted_total(), 2, "selector {} unbalanced", handle.id());
        }

        factory.shutdown();
    }

    #[test]
    fn test_per_peer_cap_enforced() {
        let (mut factory, addr) = start_factory(1, test_config(1, 10_000));

        let _first = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| factory.connections().len() == 1, Duration::from_secs(5)));

        // Second connection from the same peer is accepted then hard-closed
        let mut second = TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        match second.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected {n} bytes from rejected connection"),
        }

        assert_eq!(factory.connections().len(), 1);
        factory.shutdown();
    }

    #[test]
    fn test_sessionless_connection_expires() {
        let (mut factory, addr) = start_factory(0, test_config(1, 100));

        let _client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| factory.connections().len() == 1, Duration::from_secs(5)));

        // One tick of timeout plus one tick of jitter, with CI slack
        assert!(
            wait_for(|| factory.connections().is_empty(), Duration::from_secs(5)),
            "idle sessionless connection was not expired"
        );
        factory.shutdown();
    }

    #[test]
    fn test_traffic_keeps_connection_alive() {
        let (mut factory, addr) = start_factory(0, test_config(1, 200));

        let mut client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| factory.connections().len() == 1, Duration::from_secs(5)));

        // Write every 100ms for well over the sessionless timeout
        for _ in 0..12 {
            client.write_all(b"x").unwrap();
            std::thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(factory.connections().len(), 1, "touched connection expired");

        let received: u64 = factory.connections()[0]
            .connection_info(false)
            .get("bytes_received")
            .and_then(Value::as_u64)
            .unwrap();
        assert!(received >= 10, "expected most writes to be read, saw {received}");

        factory.shutdown();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut factory, addr) = start_factory(0, test_config(1, 10_000));

        let _client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| factory.connections().len() == 1, Duration::from_secs(5)));

        let cnxn = factory.connections().remove(0);
        cnxn.close();
        assert!(factory.connections().is_empty());
        // Second close must not panic or disturb the indexes
        cnxn.close();
        assert!(factory.connections().is_empty());

        factory.shutdown();
    }

    #[test]
    fn test_session_bindings() {
        let (mut factory, addr) = start_factory(0, test_config(1, 10_000));

        let _client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| factory.connections().len() == 1, Duration::from_secs(5)));

        let cnxn = factory.connections().remove(0);
        factory.add_session(0x42, cnxn.as_ref());

        assert!(factory.close_session(0x42));
        assert!(wait_for(|| factory.connections().is_empty(), Duration::from_secs(2)));
        // The binding is gone; closing again reports nothing to do
        assert!(!factory.close_session(0x42));

        factory.shutdown();
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let (mut factory, addr) = start_factory(0, test_config(2, 10_000));

        let clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        assert!(wait_for(|| factory.connections().len() == 3, Duration::from_secs(5)));

        factory.shutdown();
        assert!(factory.connections().is_empty());

        // The listen socket is gone
        assert!(wait_for(
            || TcpStream::connect(addr).is_err(),
            Duration::from_secs(2)
        ));

        // Clients observe the close
        for mut client in clients {
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut buf = [0u8; 1];
            match client.read(&mut buf) {
                Ok(0) | Err(_) => {}
                Ok(n) => panic!("unexpected {n} bytes after shutdown"),
            }
        }
    }

    #[test]
    fn test_reconfigure_moves_listener() {
        let (mut factory, old_addr) = start_factory(0, test_config(1, 10_000));

        let mut existing = TcpStream::connect(old_addr).unwrap();
        assert!(wait_for(|| factory.connections().len() == 1, Duration::from_secs(5)));

        factory.reconfigure("127.0.0.1:0".parse().unwrap()).unwrap();
        let new_addr = factory.local_addr().unwrap();
        assert_ne!(old_addr.port(), new_addr.port());

        // Old port refuses, new port accepts
        assert!(wait_for(|| TcpStream::connect(old_addr).is_err(), Duration::from_secs(2)));
        let _fresh = TcpStream::connect(new_addr).unwrap();
        assert!(wait_for(|| factory.connections().len() == 2, Duration::from_secs(5)));

        // The pre-existing connection is still serviceable
        existing.write_all(b"still here").unwrap();
        let survivor = factory
            .connections()
            .into_iter()
            .find(|c| c.remote_address() == existing.local_addr().unwrap())
            .unwrap();
        assert!(wait_for(
            || {
                survivor
                    .connection_info(false)
                    .get("bytes_received")
                    .and_then(Value::as_u64)
                    .unwrap()
                    == 10
            },
            Duration::from_secs(5)
        ));

        factory.shutdown();
    }

    #[test]
    fn test_dump_connections_reports_counts() {
        let (mut factory, addr) = start_factory(0, test_config(1, 10_000));
        let _client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| factory.connections().len() == 1, Duration::from_secs(5)));

        let dump = factory.dump_connections();
        assert!(dump.starts_with("Connections: 1"), "unexpected dump: {dump}");

        factory.shutdown();
    }
}

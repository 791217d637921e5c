//! The selector manager: channel admission and routing.
//!
//! Owns a fixed array of managed selectors and routes incoming channels
//! round-robin; a channel, once routed, stays on its selector for life.
//! Protocol specifics are inverted out through two capability traits,
//! [`EndpointFactory`] and [`ConnectionFactory`], so client and server
//! stacks embed the reactor without the reactor knowing either.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::Token;

use strand_core::{Callback, StrandError};

use crate::channel::Channel;
use crate::config::ReactorConfig;
use crate::connection::Connection;
use crate::endpoint::{Endpoint, SocketEndpoint};
use crate::executor::{Executor, InlineExecutor};
use crate::listener::{ConnectionListener, Listeners};
use crate::selector::{Action, ManagedSelector, SelectorEnv, SelectorHandle};

/// Opaque per-channel context handed to the connection factory (ALPN
/// token, connector configuration, ...).
pub type Context = Arc<dyn Any + Send + Sync>;

/// An empty context for channels that need none.
pub fn no_context() -> Context {
    Arc::new(())
}

/// Builds the endpoint for an adopted channel. The provided
/// [`SocketEndpointFactory`] covers stream sockets; embedders substitute
/// their own to decorate or replace the endpoint.
pub trait EndpointFactory: Send + Sync {
    fn new_endpoint(
        &self,
        channel: Box<dyn Channel>,
        token: Token,
        selector: SelectorHandle,
        listeners: Arc<Listeners>,
        idle_timeout: Option<Duration>,
    ) -> Arc<dyn Endpoint>;
}

#[derive(Debug, Default)]
pub struct SocketEndpointFactory;

impl EndpointFactory for SocketEndpointFactory {
    fn new_endpoint(
        &self,
        channel: Box<dyn Channel>,
        token: Token,
        selector: SelectorHandle,
        listeners: Arc<Listeners>,
        idle_timeout: Option<Duration>,
    ) -> Arc<dyn Endpoint> {
        SocketEndpoint::new(channel, token, selector, listeners, idle_timeout)
    }
}

/// Builds the protocol connection for a freshly bound endpoint.
pub trait ConnectionFactory: Send + Sync {
    fn new_connection(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        context: &Context,
    ) -> Arc<dyn Connection>;
}

pub struct SelectorManager {
    selectors: Vec<ManagedSelector>,
    next: AtomicUsize,
    listeners: Arc<Listeners>,
    stopped: bool,
}

impl SelectorManager {
    /// Build and start a manager with the default socket endpoint
    /// factory and inline executor.
    pub fn new(
        config: ReactorConfig,
        connection_factory: Arc<dyn ConnectionFactory>,
    ) -> io::Result<Self> {
        Self::with_factories(
            config,
            Arc::new(SocketEndpointFactory),
            connection_factory,
            Arc::new(InlineExecutor),
        )
    }

    /// Full-control constructor: every capability supplied by the
    /// embedder. Selector threads start here.
    pub fn with_factories(
        config: ReactorConfig,
        endpoint_factory: Arc<dyn EndpointFactory>,
        connection_factory: Arc<dyn ConnectionFactory>,
        executor: Arc<dyn Executor>,
    ) -> io::Result<Self> {
        let listeners = Arc::new(Listeners::new());
        let env = Arc::new(SelectorEnv {
            endpoint_factory,
            connection_factory,
            listeners: listeners.clone(),
            executor,
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
            dispatch_io: config.dispatch_io,
        });

        let count = config.selectors.max(1);
        let mut selectors = Vec::with_capacity(count);
        for id in 0..count {
            selectors.push(ManagedSelector::spawn(id, env.clone())?);
        }
        log::debug!("selector manager started with {} selectors", count);

        Ok(Self {
            selectors,
            next: AtomicUsize::new(0),
            listeners,
            stopped: false,
        })
    }

    /// Subscribe to connection opened/closed events.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    /// Admit a channel accepted by a server socket. The channel must
    /// already be non-blocking and pre-configured.
    pub fn accept(&self, channel: Box<dyn Channel>) {
        self.adopt(channel, no_context());
    }

    /// Admit a fully prepared channel, possibly one that already
    /// exchanged bytes outside the reactor (upgrades, tunnels).
    pub fn adopt(&self, channel: Box<dyn Channel>, context: Context) {
        let selector = self.choose();
        if selector.is_stopped() {
            log::warn!("channel adopted after stop; dropping");
            return;
        }
        selector.submit(Action::Adopt { channel, context });
        selector.wake();
    }

    /// Initiate an outbound connect. `connected` fires after the
    /// endpoint and connection are built, or fails on error/timeout.
    pub fn connect(&self, addr: SocketAddr, context: Context, connected: Callback) {
        let stream = match mio::net::TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                connected.failed(e.into());
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay({}): {}", addr, e);
        }

        let selector = self.choose();
        if selector.is_stopped() {
            connected.failed(StrandError::Closed);
            return;
        }
        selector.submit(Action::Connect {
            channel: Box::new(stream),
            context,
            connected,
        });
        selector.wake();
    }

    /// Run a task on the selector thread a channel would be routed to.
    pub fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        let selector = self.choose();
        selector.submit(Action::Task(task));
        selector.wake();
    }

    pub fn selector_count(&self) -> usize {
        self.selectors.len()
    }

    /// Stop all selectors and join their threads. Registered endpoints
    /// are closed, pending callbacks failed.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for selector in &self.selectors {
            selector.stop();
        }
        for selector in &mut self.selectors {
            selector.join();
        }
        log::debug!("selector manager stopped");
    }

    /// Stable round-robin assignment.
    fn choose(&self) -> SelectorHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.selectors.len();
        self.selectors[index].handle()
    }
}

impl Drop for SelectorManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{arm_fill_interest, Fillable};
    use crate::endpoint::Fill;
    use crate::listener::ConnectionStats;
    use bytes::{Bytes, BytesMut};
    use std::io::{Read, Write};
    use std::sync::{Mutex, Weak};
    use std::time::Instant;
    use strand_core::{ChunkPool, Latch, Process, Result, Step, StepDriver};

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Accept one blocking client/server pair and adopt the server side.
    fn adopt_pair(manager: &SelectorManager) -> std::net::TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        server.set_nodelay(true).unwrap();
        client.set_nodelay(true).unwrap();
        manager.accept(Box::new(mio::net::TcpStream::from_std(server)));
        client
    }

    fn test_config() -> ReactorConfig {
        ReactorConfig::new().selectors(1).idle_timeout(None)
    }

    // ── Null connection: records lifecycle, drives nothing ───────────

    #[derive(Default)]
    struct NullState {
        endpoints: Mutex<Vec<Arc<dyn Endpoint>>>,
        closes: Mutex<Vec<Option<StrandError>>>,
    }

    struct NullConnection {
        state: Arc<NullState>,
    }

    impl Connection for NullConnection {
        fn protocol(&self) -> &'static str {
            "null"
        }
        fn on_open(&self) {}
        fn on_close(&self, cause: Option<&StrandError>) {
            self.state.closes.lock().unwrap().push(cause.cloned());
        }
    }

    struct NullFactory {
        state: Arc<NullState>,
    }

    impl ConnectionFactory for NullFactory {
        fn new_connection(
            &self,
            endpoint: &Arc<dyn Endpoint>,
            _context: &Context,
        ) -> Arc<dyn Connection> {
            self.state.endpoints.lock().unwrap().push(endpoint.clone());
            Arc::new(NullConnection {
                state: self.state.clone(),
            })
        }
    }

    fn null_manager(config: ReactorConfig) -> (SelectorManager, Arc<NullState>) {
        let state = Arc::new(NullState::default());
        let manager =
            SelectorManager::new(config, Arc::new(NullFactory { state: state.clone() }))
                .unwrap();
        (manager, state)
    }

    fn first_endpoint(state: &NullState) -> Arc<dyn Endpoint> {
        state.endpoints.lock().unwrap()[0].clone()
    }

    // ── Echo connection over the step driver ─────────────────────────

    struct EchoPump {
        endpoint: Arc<dyn Endpoint>,
        pool: ChunkPool,
    }

    impl Process for EchoPump {
        fn process(&mut self, driver: &StepDriver) -> Result<Step> {
            loop {
                let mut lease = self.pool.acquire(4096);
                match self.endpoint.fill(&mut lease)? {
                    Fill::Data(_) => {
                        let chunk = lease.freeze(false);
                        self.endpoint
                            .write(driver.callback(), vec![chunk.to_bytes()]);
                        chunk.release();
                        return Ok(Step::Scheduled);
                    }
                    Fill::Empty => {
                        drop(lease);
                        self.endpoint.fill_interested(driver.iterate_callback());
                        return Ok(Step::Idle);
                    }
                    Fill::Eof => {
                        drop(lease);
                        self.endpoint.close();
                        return Ok(Step::Done);
                    }
                }
            }
        }

        fn on_failure(&mut self, cause: &StrandError) {
            if !cause.is_transient() {
                self.endpoint.close();
            }
        }
    }

    struct EchoConnection {
        driver: StepDriver,
    }

    impl Connection for EchoConnection {
        fn protocol(&self) -> &'static str {
            "echo"
        }
        fn on_open(&self) {
            self.driver.iterate();
        }
        fn on_close(&self, _cause: Option<&StrandError>) {
            self.driver.close();
        }
    }

    struct EchoFactory {
        pool: ChunkPool,
    }

    impl ConnectionFactory for EchoFactory {
        fn new_connection(
            &self,
            endpoint: &Arc<dyn Endpoint>,
            _context: &Context,
        ) -> Arc<dyn Connection> {
            Arc::new(EchoConnection {
                driver: StepDriver::new(EchoPump {
                    endpoint: endpoint.clone(),
                    pool: self.pool.clone(),
                }),
            })
        }
    }

    #[test]
    fn test_echo_round_trip_and_chunk_balance() {
        let pool = ChunkPool::with_capacity(1024, 64 * 1024);
        let stats = Arc::new(ConnectionStats::new());
        let manager = SelectorManager::new(
            test_config(),
            Arc::new(EchoFactory { pool: pool.clone() }),
        )
        .unwrap();
        manager.add_listener(stats.clone());

        let mut client = adopt_pair(&manager);
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

        let mut writer = client.try_clone().unwrap();
        let to_send = payload.clone();
        let sender = std::thread::spawn(move || {
            writer.write_all(&to_send).unwrap();
        });

        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).unwrap();
        sender.join().unwrap();
        assert_eq!(echoed, payload);

        client.shutdown(std::net::Shutdown::Both).unwrap();
        wait_until("connection close", || stats.total_closed() == 1);
        wait_until("chunk balance", || pool.outstanding() == 0);
        assert_eq!(stats.total_opened(), 1);
        assert_eq!(stats.peak(), 1);
    }

    #[test]
    fn test_single_reader_enforced() {
        let (manager, state) = null_manager(test_config());
        let _client = adopt_pair(&manager);
        wait_until("endpoint", || !state.endpoints.lock().unwrap().is_empty());
        let endpoint = first_endpoint(&state);

        endpoint.fill_interested(Callback::noop());
        let rejected = Arc::new(Mutex::new(None));
        let r = rejected.clone();
        endpoint.fill_interested(Callback::new(move |result| {
            *r.lock().unwrap() = Some(result);
        }));
        assert_eq!(
            *rejected.lock().unwrap(),
            Some(Err(StrandError::Usage("fill interest pending")))
        );
    }

    #[test]
    fn test_write_backpressure_single_writer() {
        let (manager, state) = null_manager(test_config());
        let mut client = adopt_pair(&manager);
        wait_until("endpoint", || !state.endpoints.lock().unwrap().is_empty());
        let endpoint = first_endpoint(&state);

        // 4 MiB into a peer that is not reading: the write must park.
        let big = Bytes::from(vec![0x5a; 4 * 1024 * 1024]);
        let latch = Latch::new();
        endpoint.write(latch.callback(), vec![big.clone()]);

        // A second write while one is pending fails immediately.
        let overlapped = Arc::new(Mutex::new(None));
        let o = overlapped.clone();
        endpoint.write(
            Callback::new(move |result| *o.lock().unwrap() = Some(result)),
            vec![Bytes::from_static(b"nope")],
        );
        assert_eq!(
            *overlapped.lock().unwrap(),
            Some(Err(StrandError::Usage("write pending")))
        );

        // Not complete while the peer is paused.
        assert_eq!(
            latch.wait(Some(Duration::from_millis(200))),
            Err(StrandError::Timeout)
        );

        // Drain the peer; the single callback then fires exactly once.
        let mut remaining = big.len();
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0);
            remaining -= n;
        }
        assert!(latch.wait(Some(Duration::from_secs(5))).is_ok());
    }

    #[test]
    fn test_idle_timeout_fires_transient_then_recovers() {
        let config = ReactorConfig::new()
            .selectors(1)
            .idle_timeout(Some(Duration::from_millis(100)));
        let (manager, state) = null_manager(config);
        let mut client = adopt_pair(&manager);
        wait_until("endpoint", || !state.endpoints.lock().unwrap().is_empty());
        let endpoint = first_endpoint(&state);

        // Nothing is sent: the armed read fails with a transient timeout.
        let first = Latch::new();
        endpoint.fill_interested(first.callback());
        assert_eq!(
            first.wait(Some(Duration::from_secs(5))),
            Err(StrandError::Timeout)
        );
        assert!(endpoint.is_open(), "timeout does not close the endpoint");

        // Re-arm and send a byte; further transient timeouts may still
        // slip in before it lands, and the connection's answer to those
        // is simply to re-arm again.
        client.write_all(b"!").unwrap();
        loop {
            let armed = Latch::new();
            endpoint.fill_interested(armed.callback());
            match armed.wait(Some(Duration::from_secs(5))) {
                Ok(()) => break,
                Err(StrandError::Timeout) => continue,
                Err(e) => panic!("unexpected fill failure: {}", e),
            }
        }

        let mut buf = BytesMut::with_capacity(16);
        assert_eq!(endpoint.fill(&mut buf).unwrap(), Fill::Data(1));
        assert_eq!(&buf[..], b"!");
    }

    // ── Recording connection for the upgrade scenario ────────────────

    struct Recording {
        name: &'static str,
        weak: Weak<Recording>,
        endpoint: Arc<dyn Endpoint>,
        data: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<Option<Option<StrandError>>>>,
    }

    impl Recording {
        fn new(
            name: &'static str,
            endpoint: Arc<dyn Endpoint>,
        ) -> (Arc<Self>, Arc<Mutex<Vec<u8>>>, Arc<Mutex<Option<Option<StrandError>>>>) {
            let data = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(Mutex::new(None));
            let conn = Arc::new_cyclic(|weak| Recording {
                name,
                weak: weak.clone(),
                endpoint,
                data: data.clone(),
                closed: closed.clone(),
            });
            (conn, data, closed)
        }

        fn arm(&self) {
            if let Some(me) = self.weak.upgrade() {
                arm_fill_interest(self.endpoint.as_ref(), &me);
            }
        }
    }

    impl Connection for Recording {
        fn protocol(&self) -> &'static str {
            self.name
        }
        fn on_open(&self) {
            self.arm();
        }
        fn on_close(&self, cause: Option<&StrandError>) {
            *self.closed.lock().unwrap() = Some(cause.cloned());
        }
    }

    impl Fillable for Recording {
        fn on_fillable(&self) {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match self.endpoint.fill(&mut buf) {
                    Ok(Fill::Data(_)) => continue,
                    Ok(Fill::Empty) => {
                        self.data.lock().unwrap().extend_from_slice(&buf);
                        self.arm();
                        return;
                    }
                    Ok(Fill::Eof) => {
                        self.data.lock().unwrap().extend_from_slice(&buf);
                        self.endpoint.close();
                        return;
                    }
                    Err(_) => return,
                }
            }
        }

        fn on_fill_failed(&self, cause: StrandError) {
            if cause.is_transient() {
                self.arm();
            } else {
                self.endpoint.close();
            }
        }
    }

    #[test]
    fn test_upgrade_reroutes_bytes_to_new_connection() {
        let (manager, state) = null_manager(test_config());
        let stats = Arc::new(ConnectionStats::new());
        manager.add_listener(stats.clone());

        let mut client = adopt_pair(&manager);
        wait_until("endpoint", || !state.endpoints.lock().unwrap().is_empty());
        let endpoint = first_endpoint(&state);
        // The null connection from the factory counts as one open.
        wait_until("initial open", || stats.total_opened() == 1);

        let (first, first_data, first_closed) = Recording::new("initial", endpoint.clone());
        endpoint.upgrade(first);
        wait_until("upgrade open", || stats.total_opened() == 2);

        client.write_all(b"before").unwrap();
        wait_until("pre-upgrade bytes", || {
            first_data.lock().unwrap().as_slice() == b"before"
        });

        let (second, second_data, second_closed) = Recording::new("upgraded", endpoint.clone());
        endpoint.upgrade(second);

        // P7: the outgoing connection saw a normal close before the
        // incoming one opened; counters reflect one close, one open.
        assert_eq!(*first_closed.lock().unwrap(), Some(None));
        wait_until("second open", || stats.total_opened() == 3);
        assert_eq!(stats.total_closed(), 2);

        client.write_all(b"after").unwrap();
        wait_until("post-upgrade bytes", || {
            second_data.lock().unwrap().as_slice() == b"after"
        });
        assert_eq!(first_data.lock().unwrap().as_slice(), b"before");

        client.shutdown(std::net::Shutdown::Both).unwrap();
        wait_until("final close", || second_closed.lock().unwrap().is_some());
    }

    #[test]
    fn test_connect_builds_endpoint_and_fires_continuation() {
        let (manager, state) = null_manager(test_config());
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let latch = Latch::new();
        manager.connect(addr, no_context(), latch.callback());
        let (mut peer, _) = listener.accept().unwrap();
        assert!(latch.wait(Some(Duration::from_secs(5))).is_ok());

        let endpoint = first_endpoint(&state);
        assert!(endpoint.is_open());
        assert_eq!(endpoint.remote_addr(), Some(addr));

        let written = Latch::new();
        endpoint.write(written.callback(), vec![Bytes::from_static(b"hello")]);
        assert!(written.wait(Some(Duration::from_secs(5))).is_ok());

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_connect_refused_fails_continuation() {
        let (manager, _state) = null_manager(test_config());
        // Bind-then-drop yields a port with nothing listening.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let latch = Latch::new();
        manager.connect(addr, no_context(), latch.callback());
        let result = latch.wait(Some(Duration::from_secs(5)));
        assert!(result.is_err(), "refused connect must fail: {:?}", result);
        drop(manager);
    }

    #[test]
    fn test_stop_closes_endpoints_and_fails_pending() {
        let (mut manager, state) = null_manager(test_config());
        let _client = adopt_pair(&manager);
        wait_until("endpoint", || !state.endpoints.lock().unwrap().is_empty());
        let endpoint = first_endpoint(&state);

        let pending = Latch::new();
        endpoint.fill_interested(pending.callback());

        manager.stop();
        assert_eq!(
            pending.wait(Some(Duration::from_secs(5))),
            Err(StrandError::Closed)
        );
        assert!(!endpoint.is_open());
        assert_eq!(state.closes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_round_robin_assignment() {
        let (manager, state) = null_manager(ReactorConfig::new().selectors(2).idle_timeout(None));
        let clients: Vec<_> = (0..4).map(|_| adopt_pair(&manager)).collect();
        wait_until("adoptions", || state.endpoints.lock().unwrap().len() == 4);
        drop(clients);
    }
}

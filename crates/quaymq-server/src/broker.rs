//! Broker core: listener, per-connection threads and shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};

use crate::auth::CredentialStore;
use crate::config::{Config, ConfigError};
use crate::connection::{BrokerContext, Connection, ConnectionControl};
use crate::router::TopicRouter;
use crate::session::{RegistrySettings, SessionRegistry};

const LISTENER: Token = Token(0);
const SHUTDOWN: Token = Token(1);

/// Upper bound on waiting for forced connections to finish.
const FORCE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest gap between sweeps for expired offline sessions.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Tracked {
    control: Arc<ConnectionControl>,
    thread: Option<JoinHandle<()>>,
}

/// Live connections, keyed by an id unique for the broker's lifetime.
#[derive(Default)]
struct ConnectionTable {
    entries: Mutex<AHashMap<u64, Tracked>>,
    changed: Condvar,
    next_id: AtomicU64,
}

impl ConnectionTable {
    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn remove(&self, id: u64) {
        let mut entries = self.entries.lock();
        entries.remove(&id);
        self.changed.notify_all();
    }

    /// Wait until every connection is gone or `deadline` passes.
    fn wait_empty(&self, deadline: Instant) -> bool {
        let mut entries = self.entries.lock();
        while !entries.is_empty() {
            if self.changed.wait_until(&mut entries, deadline).timed_out() {
                break;
            }
        }
        entries.is_empty()
    }

    fn for_each_control(&self, f: impl Fn(&ConnectionControl)) {
        for tracked in self.entries.lock().values() {
            f(&tracked.control);
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    /// Taken by whoever joins it first, `wait` or `stop`.
    acceptor: Option<JoinHandle<()>>,
}

/// MQTT broker.
///
/// ```no_run
/// use quaymq_server::{Broker, Config};
///
/// let mut broker = Broker::new(Config::default()).unwrap();
/// broker.add_credentials("alice", "secret");
/// let addr = broker.start().unwrap();
/// println!("listening on {}", addr);
/// broker.stop(std::time::Duration::from_secs(15));
/// ```
pub struct Broker {
    config: Arc<Config>,
    credentials: Arc<CredentialStore>,
    context: Arc<BrokerContext>,
    connections: Arc<ConnectionTable>,
    running: Option<Running>,
}

impl Broker {
    /// Build a broker from validated configuration. Nothing is bound yet.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let credentials = Arc::new(CredentialStore::from_config(&config.auth)?);
        let registry = Arc::new(SessionRegistry::new(
            credentials.clone(),
            RegistrySettings {
                persistent_sessions: config.session.persistent,
                max_queued_messages: config.limits.max_queued_messages,
                offline_expiry: config.offline_expiry(),
            },
        ));
        let config = Arc::new(config);
        let context = Arc::new(BrokerContext {
            config: config.clone(),
            router: Arc::new(TopicRouter::new(registry)),
        });

        Ok(Self {
            config,
            credentials,
            context,
            connections: Arc::new(ConnectionTable::default()),
            running: None,
        })
    }

    /// Add or replace a username/password pair. Takes effect for the next
    /// CONNECT, also while running.
    pub fn add_credentials(&self, username: &str, password: &str) {
        self.credentials.add(username, password);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.context.router
    }

    /// Bind the listener and start accepting. Returns the bound address,
    /// which differs from the configured one when port 0 was requested.
    pub fn start(&mut self) -> io::Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let mut listener = TcpListener::bind(self.config.server.bind)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), SHUTDOWN)?);
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = Acceptor {
            poll,
            listener,
            stop: stop.clone(),
            context: self.context.clone(),
            connections: self.connections.clone(),
            max_connections: self.config.limits.max_connections,
            sweep_interval: self
                .config
                .offline_expiry()
                .map(|expiry| expiry.clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL)),
        };
        let acceptor = thread::Builder::new()
            .name("quaymq-acceptor".into())
            .spawn(move || acceptor.run())?;

        info!("quaymq listening on {}", local_addr);
        self.running = Some(Running {
            local_addr,
            stop,
            waker,
            acceptor: Some(acceptor),
        });
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Block until the acceptor exits, i.e. until the listener fails.
    /// Open connections stay up until [`stop`](Self::stop) or drop.
    pub fn wait(&mut self) {
        let Some(acceptor) = self.running.as_mut().and_then(|r| r.acceptor.take()) else {
            return;
        };
        if acceptor.join().is_err() {
            error!("Acceptor thread panicked");
        }
    }

    /// Stop accepting, ask every connection to flush and close, wait up to
    /// `grace`, then force the stragglers closed.
    pub fn stop(&mut self, grace: Duration) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!("Shutting down, {} connection(s) open", self.connections.len());

        running.stop.store(true, Ordering::Release);
        if let Some(acceptor) = running.acceptor {
            if let Err(e) = running.waker.wake() {
                warn!("Failed to wake acceptor: {}", e);
            }
            if acceptor.join().is_err() {
                error!("Acceptor thread panicked");
            }
        }

        self.connections.for_each_control(ConnectionControl::drain);
        if !self.connections.wait_empty(Instant::now() + grace) {
            warn!(
                "{} connection(s) still open after {:?}, forcing close",
                self.connections.len(),
                grace
            );
            self.connections.for_each_control(ConnectionControl::force);
            self.connections
                .wait_empty(Instant::now() + FORCE_JOIN_TIMEOUT);
        }

        let leftovers: Vec<_> = self
            .connections
            .entries
            .lock()
            .drain()
            .filter_map(|(_, t)| t.thread)
            .collect();
        for handle in leftovers {
            let _ = handle.join();
        }
        info!("Broker stopped");
    }

    /// Open client connections, including ones still waiting for CONNECT.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sessions with a connected client.
    pub fn session_count(&self) -> usize {
        self.context.router.registry().live_count()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let grace = self.config.shutdown_grace();
        self.stop(grace);
    }
}

struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    stop: Arc<AtomicBool>,
    context: Arc<BrokerContext>,
    connections: Arc<ConnectionTable>,
    max_connections: usize,
    sweep_interval: Option<Duration>,
}

impl Acceptor {
    fn run(mut self) {
        let mut events = Events::with_capacity(128);
        let mut next_sweep = self.sweep_interval.map(|i| Instant::now() + i);
        loop {
            let timeout = next_sweep.map(|at| at.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Listener poll failed: {}", e);
                return;
            }
            if self.stop.load(Ordering::Acquire) {
                debug!("Acceptor stopping");
                return;
            }
            if let (Some(at), Some(interval)) = (next_sweep, self.sweep_interval) {
                let now = Instant::now();
                if now >= at {
                    self.context.router.expire_sessions(now);
                    next_sweep = Some(now + interval);
                }
            }
            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_all();
                }
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.max_connections > 0 && self.connections.len() >= self.max_connections
                    {
                        warn!(
                            "Connection limit {} reached, rejecting {}",
                            self.max_connections, peer
                        );
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = self.spawn(stream, peer) {
                        error!("Failed to start connection for {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    return;
                }
            }
        }
    }

    fn spawn(&self, stream: mio::net::TcpStream, peer: SocketAddr) -> io::Result<()> {
        let connection = Connection::new(stream, peer, self.context.clone())?;
        let id = self.connections.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("Accepted connection {} from {}", id, peer);

        // registered before the thread starts so it can always remove itself
        self.connections.entries.lock().insert(
            id,
            Tracked {
                control: connection.control(),
                thread: None,
            },
        );

        let table = self.connections.clone();
        let spawned = thread::Builder::new()
            .name(format!("quaymq-conn-{}", id))
            .spawn(move || {
                let exit = connection.run();
                debug!("Connection {} from {} finished: {:?}", id, peer, exit);
                table.remove(id);
            });

        match spawned {
            Ok(handle) => {
                if let Some(tracked) = self.connections.entries.lock().get_mut(&id) {
                    tracked.thread = Some(handle);
                }
                Ok(())
            }
            Err(e) => {
                self.connections.remove(id);
                Err(e)
            }
        }
    }
}

//! Thread-per-connection server.
//!
//! [`ConnectionServer`] is a [`ScheduledJob`]: one unit of work accepts one
//! connection and admits or rejects it. Admitted connections get their own
//! session thread, registered in a [`SessionRegistry`].
//!
//! ## Admission
//! 1. refuse when the live-session limit is reached
//! 2. register with the [`BruteForceGuard`], drop denied addresses
//! 3. set the read timeout and start the session
//!
//! The guard's backoff is slept on the session thread before its first
//! read, so a repeating peer never holds up `accept`.
//!
//! TLS and plaintext share the port: the session sniffs the first bytes
//! before reading requests.

pub mod address;
pub mod guard;
pub mod line;
pub mod registry;
mod session;
pub mod tls;
pub mod transport;

pub use address::ListenAddress;
pub use guard::{Admission, BruteForceGuard, GuardSettings};
pub use registry::{SessionEntry, SessionRegistry, SessionSummary};
pub use tls::TlsError;

use crate::protocol::ProtocolSet;
use crate::schedule::{JobError, ScheduledJob, ThreadControl};
use crate::store::ConfigStore;
use crate::switchboard::AccessTracker;
use parking_lot::Mutex;
use rustls::ServerConfig;
use socket2::{Domain, Protocol as SocketProtocol, SockRef, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Live-session limit used when the store has none.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Port used when the store has none.
pub const DEFAULT_PORT: &str = "8090";

const LISTEN_BACKLOG: i32 = 1024;

const ACCEPT_RETRY_MILLIS: i64 = 100;

/// Server startup errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address: {0}")]
    Address(String),
    #[error("cannot bind {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Per-session timing and framing.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Longest accepted request line.
    pub max_line_length: usize,
    /// Read timeout of a fresh session.
    pub timeout: Duration,
    /// Read timeout after a handler asked to resume.
    pub resume_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_line_length: 4096,
            timeout: Duration::from_secs(60),
            resume_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Called with the live-session count whenever it may have changed.
pub type BusyCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// State shared by the accept loop, the sessions and the handles.
pub(crate) struct Shared {
    registry: Arc<SessionRegistry>,
    guard: Arc<BruteForceGuard>,
    protocols: ProtocolSet,
    tls: Option<Arc<ServerConfig>>,
    settings: ServerSettings,
    max_sessions: AtomicUsize,
    restart: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    busy: Option<BusyCallback>,
    tracker: Option<Arc<AccessTracker>>,
}

impl Shared {
    /// Unblock a pending `accept`.
    fn shutdown_listener(&self) {
        if let Some(listener) = self.listener.lock().as_ref() {
            let _ = SockRef::from(listener).shutdown(Shutdown::Both);
        }
    }

    fn notify_busy(&self) {
        if let Some(busy) = &self.busy {
            busy(self.registry.len());
        }
    }
}

/// Listen address configured in the store: `bindPort` when set, else `port`.
pub fn listen_address(store: &ConfigStore) -> Result<ListenAddress, ServerError> {
    let bind_port = store.get("bindPort", "");
    let configured = if bind_port.trim().is_empty() {
        store.get("port", DEFAULT_PORT)
    } else {
        bind_port
    };
    configured.parse().map_err(ServerError::Address)
}

fn bind(address: &ListenAddress) -> Result<TcpListener, ServerError> {
    let addr = address
        .resolve()
        .map_err(|e| ServerError::Address(format!("{address}: {e}")))?;

    let create = || -> io::Result<TcpListener> {
        let socket = Socket::new(
            match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            },
            Type::STREAM,
            Some(SocketProtocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    };
    create().map_err(|e| ServerError::Bind(addr, e))
}

/// Builder for [`ConnectionServer`].
pub struct ServerBuilder {
    name: String,
    protocols: ProtocolSet,
    address: Option<ListenAddress>,
    guard: Option<Arc<BruteForceGuard>>,
    settings: ServerSettings,
    busy: Option<BusyCallback>,
    tracker: Option<Arc<AccessTracker>>,
}

impl ServerBuilder {
    /// Listen here instead of the store's `port`/`bindPort`.
    pub fn address(mut self, address: ListenAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Share a guard with other servers.
    pub fn guard(mut self, guard: Arc<BruteForceGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn on_busy(mut self, busy: BusyCallback) -> Self {
        self.busy = Some(busy);
        self
    }

    /// Record every request line per client address.
    pub fn access_tracker(mut self, tracker: Arc<AccessTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Load TLS material and bind the listener. Both failures are fatal.
    pub fn build(self, store: Arc<ConfigStore>) -> Result<ConnectionServer, ServerError> {
        let tls = tls::from_store(&store)?;
        let address = match self.address {
            Some(address) => address,
            None => listen_address(&store)?,
        };
        let listener = bind(&address)?;
        let local_addr = listener.local_addr()?;
        let max_sessions = usize::try_from(store.get_long(
            "httpdMaxBusySessions",
            DEFAULT_MAX_SESSIONS as i64,
        ))
        .unwrap_or(DEFAULT_MAX_SESSIONS);

        info!(
            server = %self.name,
            address = %local_addr,
            tls = tls.is_some(),
            protocols = ?self.protocols.names(),
            max_sessions,
            "Server listening"
        );

        let shared = Arc::new(Shared {
            registry: Arc::new(SessionRegistry::new()),
            guard: self.guard.unwrap_or_default(),
            protocols: self.protocols,
            tls,
            settings: self.settings,
            max_sessions: AtomicUsize::new(max_sessions),
            restart: AtomicBool::new(false),
            listener: Mutex::new(Some(listener.try_clone()?)),
            local_addr: Mutex::new(Some(local_addr)),
            busy: self.busy,
            tracker: self.tracker,
        });

        Ok(ConnectionServer {
            name: self.name,
            store,
            shared,
            listener,
            control: None,
        })
    }
}

/// The accept loop, run by a [`BusyThread`](crate::schedule::BusyThread).
pub struct ConnectionServer {
    name: String,
    store: Arc<ConfigStore>,
    shared: Arc<Shared>,
    listener: TcpListener,
    control: Option<Arc<ThreadControl>>,
}

impl ConnectionServer {
    pub fn builder(name: impl Into<String>, protocols: ProtocolSet) -> ServerBuilder {
        ServerBuilder {
            name: name.into(),
            protocols,
            address: None,
            guard: None,
            settings: ServerSettings::default(),
            busy: None,
            tracker: None,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn is_running(&self) -> bool {
        self.control.as_ref().map_or(true, |c| c.is_running())
    }

    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &self.control {
            Some(control) => control.blocking(|| self.listener.accept()),
            None => self.listener.accept(),
        }
    }

    fn rebind(&mut self) -> Result<(), ServerError> {
        let address = listen_address(&self.store)?;
        let listener = bind(&address)?;
        let local_addr = listener.local_addr()?;
        *self.shared.listener.lock() = Some(listener.try_clone()?);
        *self.shared.local_addr.lock() = Some(local_addr);
        self.listener = listener;
        info!(server = %self.name, address = %local_addr, "Server restarted");
        Ok(())
    }

    fn admit(&self, socket: TcpStream, peer: SocketAddr) {
        let shared = &self.shared;
        let live = shared.registry.len();
        let max = shared.max_sessions.load(Ordering::Relaxed);
        if live >= max {
            warn!(peer = %peer, live, max, "Session limit reached, refusing connection");
            return;
        }

        let ip = peer.ip();
        let host = address::display_host(ip);
        let admission = shared.guard.register(ip);
        if admission.denied || shared.guard.is_denied(ip) {
            warn!(host = %host, "Access denied");
            return;
        }
        if !admission.delay.is_zero() {
            warn!(
                host = %host,
                attempts = admission.attempts,
                delay_ms = admission.delay.as_millis() as u64,
                "Slowing down access for brute-force prevention"
            );
        }

        if let Err(e) = socket.set_read_timeout(Some(shared.settings.timeout)) {
            debug!(peer = %peer, error = %e, "Cannot set read timeout");
            return;
        }
        let handle = match socket.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Cannot register session");
                return;
            }
        };

        let entry = SessionEntry::new(peer, handle);
        let name = entry.name().to_string();
        let stop = entry.stop_flag();
        let id = shared.registry.insert(entry);
        let start = session::Start {
            peer,
            id,
            name,
            stop,
            delay: admission.delay,
        };
        if let Err(e) = session::spawn(Arc::clone(shared), socket, start) {
            error!(peer = %peer, error = %e, "Cannot start session thread");
            shared.registry.remove(id);
        }
        shared.notify_busy();
    }
}

impl ScheduledJob for ConnectionServer {
    fn open(&mut self, control: &Arc<ThreadControl>) {
        self.control = Some(Arc::clone(control));
        let shared = Arc::clone(&self.shared);
        control.set_interrupter(move || shared.shutdown_listener());
    }

    fn job(&mut self) -> Result<bool, JobError> {
        let (socket, peer) = match self.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if self.shared.restart.swap(false, Ordering::AcqRel) {
                    if let Err(e) = self.rebind() {
                        error!(server = %self.name, error = %e, "Restart failed, stopping server");
                        if let Some(control) = &self.control {
                            control.request_stop();
                        }
                        return Err(e.into());
                    }
                    return Ok(true);
                }
                if !self.is_running() {
                    return Ok(false);
                }
                warn!(server = %self.name, error = %e, "Accept failed");
                if let Some(control) = &self.control {
                    control.sleep(ACCEPT_RETRY_MILLIS);
                }
                return Ok(false);
            }
        };

        self.admit(socket, peer);
        Ok(true)
    }

    fn close(&mut self) {
        self.shared.registry.interrupt_all();
        self.shared.registry.clear();
        self.shared.shutdown_listener();
        *self.shared.listener.lock() = None;
        *self.shared.local_addr.lock() = None;
        self.shared.notify_busy();
        info!(server = %self.name, "Server closed");
    }
}

/// Control surface of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Bound address; `None` once the server closed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn guard(&self) -> &Arc<BruteForceGuard> {
        &self.shared.guard
    }

    /// Rebind the listener from the store's current `port`/`bindPort`.
    pub fn restart(&self) {
        self.shared.restart.store(true, Ordering::Release);
        self.shared.shutdown_listener();
    }

    pub fn set_max_sessions(&self, max: usize) {
        self.shared.max_sessions.store(max, Ordering::Relaxed);
    }

    pub fn max_sessions(&self) -> usize {
        self.shared.max_sessions.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Whether another session would be admitted.
    pub fn idle(&self) -> bool {
        self.session_count() < self.max_sessions()
    }

    pub fn is_encrypted(&self) -> bool {
        self.shared.tls.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        CommandTable, Conversation, Handler, HandlerError, Protocol, Reply, EMPTY, UNKNOWN,
    };
    use crate::switchboard::{AccessTracker, TrackerLimits};
    use crate::protocols;
    use crate::schedule::{BusyThread, ThreadHandle, ThreadSettings};
    use std::collections::BTreeMap;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::time::Instant;

    fn store(pairs: &[(&str, &str)]) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::in_memory(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        ))
    }

    fn quick_guard() -> Arc<BruteForceGuard> {
        Arc::new(BruteForceGuard::new(GuardSettings {
            backoff: Duration::ZERO,
            threshold: 1000,
            ..GuardSettings::default()
        }))
    }

    fn builder(protocols: ProtocolSet, guard: Arc<BruteForceGuard>) -> ServerBuilder {
        ConnectionServer::builder("test-server", protocols)
            .address("127.0.0.1:0".parse().unwrap())
            .guard(guard)
            .settings(ServerSettings {
                timeout: Duration::from_secs(5),
                ..ServerSettings::default()
            })
    }

    fn start(protocols: ProtocolSet, store: Arc<ConfigStore>, guard: Arc<BruteForceGuard>) -> (ServerHandle, ThreadHandle) {
        launch(builder(protocols, guard), store)
    }

    fn launch(builder: ServerBuilder, store: Arc<ConfigStore>) -> (ServerHandle, ThreadHandle) {
        let server = builder.build(store).unwrap();
        let handle = server.handle();
        let settings = ThreadSettings {
            idle_sleep: 0,
            busy_sleep: 0,
            ..ThreadSettings::default()
        };
        let thread = BusyThread::with_settings("test-server", server, settings)
            .start()
            .unwrap();
        (handle, thread)
    }

    fn connect(handle: &ServerHandle) -> (BufReader<TcpStream>, TcpStream) {
        let stream = TcpStream::connect(handle.local_addr().unwrap()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (BufReader::new(stream.try_clone().unwrap()), stream)
    }

    fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[derive(Clone)]
    struct Strict;

    impl Handler for Strict {
        fn commands() -> CommandTable<Self> {
            CommandTable::new()
                .command("HELLO", |_, _, _| Ok(Reply::text("HI")))
                .command("BOOM", |_, _, _| panic!("kaboom"))
                .command("FAIL", |_, _, _| Err(HandlerError::failed("nope")))
                .command("DONE", |_, _, _| Ok(Reply::Done))
        }
    }

    #[derive(Clone)]
    struct Blank;

    impl Handler for Blank {
        fn commands() -> CommandTable<Self> {
            CommandTable::new()
                .command(EMPTY, |_, _, _| Ok(Reply::text("BLANK")))
                .command("HELLO", |_, _, _| Ok(Reply::text("HI")))
        }
    }

    #[derive(Clone)]
    struct Greeter;

    impl Handler for Greeter {
        fn commands() -> CommandTable<Self> {
            CommandTable::new().command(UNKNOWN, |_, session: &mut Conversation<'_>, line| {
                Ok(Reply::text(format!("{} said {line}", session.identity())))
            })
        }

        fn greeting(&mut self) -> Option<String> {
            Some("WELCOME".to_string())
        }
    }

    #[test]
    fn test_echo_round_trip() {
        let (handle, thread) = start(protocols::standard(), store(&[]), quick_guard());
        let (mut reader, mut writer) = connect(&handle);

        writer.write_all(b"ECHO 5\r\nhello").unwrap();
        assert_eq!(read_line(&mut reader), "hello\r\n");
        writer.write_all(b"ECHO plain words\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "plain words\r\n");
        writer.write_all(b"QUIT\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "OK\r\n");
        assert_eq!(read_line(&mut reader), "");

        assert!(thread.terminate(true));
    }

    #[test]
    fn test_ping_session() {
        let (handle, thread) = start(protocols::standard(), store(&[]), quick_guard());
        let (mut reader, mut writer) = connect(&handle);

        writer.write_all(b"PING\r\nping there\r\n\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "PONG\r\n");
        assert_eq!(read_line(&mut reader), "PONG there\r\n");
        writer.write_all(b"FOO bar\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "ERROR unknown command FOO bar\r\n");
        writer.write_all(b"QUIT\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "OK\r\n");

        assert!(wait_for(|| handle.session_count() == 0));
        thread.terminate(true);
    }

    #[test]
    fn test_unknown_fallback_and_greeting() {
        let (handle, thread) = start(
            ProtocolSet::new(Protocol::new("greeter", Greeter)),
            store(&[]),
            quick_guard(),
        );
        let (mut reader, mut writer) = connect(&handle);

        writer.write_all(b"FOO bar\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "WELCOME\r\n");
        assert_eq!(read_line(&mut reader), "- said FOO bar\r\n");
        thread.terminate(true);
    }

    #[test]
    fn test_handler_errors_and_panics_keep_session() {
        let (handle, thread) = start(
            ProtocolSet::new(Protocol::new("strict", Strict)),
            store(&[]),
            quick_guard(),
        );
        let (mut reader, mut writer) = connect(&handle);

        writer.write_all(b"FAIL\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "ERROR nope\r\n");
        writer.write_all(b"BOOM\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "UNKNOWN REASON:ERROR kaboom\r\n");
        writer.write_all(b"hello\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "HI\r\n");
        writer.write_all(b"DONE\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "");
        thread.terminate(true);
    }

    #[test]
    fn test_unresolvable_command_closes_session() {
        let guard = quick_guard();
        let (handle, thread) = start(
            ProtocolSet::new(Protocol::new("strict", Strict)),
            store(&[]),
            Arc::clone(&guard),
        );
        let (mut reader, mut writer) = connect(&handle);

        writer.write_all(b"NOPE\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "");
        // loopback is not site-local, so it gets denied
        assert!(guard.is_denied("127.0.0.1".parse().unwrap()));
        thread.terminate(true);
    }

    #[test]
    fn test_denied_host_is_dropped() {
        let guard = quick_guard();
        guard.deny("127.0.0.1".parse().unwrap(), "test");
        let (handle, thread) = start(protocols::standard(), store(&[]), Arc::clone(&guard));

        let (mut reader, mut writer) = connect(&handle);
        let _ = writer.write_all(b"PING\r\n");
        let mut buf = Vec::new();
        assert_eq!(reader.read_to_end(&mut buf).unwrap_or(0), 0);
        assert_eq!(handle.session_count(), 0);
        thread.terminate(true);
    }

    #[test]
    fn test_max_sessions_refuse_then_accept() {
        let (handle, thread) = start(
            protocols::standard(),
            store(&[("httpdMaxBusySessions", "1")]),
            quick_guard(),
        );
        assert_eq!(handle.max_sessions(), 1);

        let (mut first_reader, mut first) = connect(&handle);
        first.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_line(&mut first_reader), "PONG\r\n");
        assert!(!handle.idle());

        let (mut refused, _second) = connect(&handle);
        assert_eq!(read_line(&mut refused), "");

        first.write_all(b"QUIT\r\n").unwrap();
        assert_eq!(read_line(&mut first_reader), "OK\r\n");
        assert!(wait_for(|| handle.session_count() == 0));

        let (mut third_reader, mut third) = connect(&handle);
        third.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_line(&mut third_reader), "PONG\r\n");
        thread.terminate(true);
    }

    #[test]
    fn test_terminate_closes_sessions_and_listener() {
        let (handle, thread) = start(protocols::standard(), store(&[]), quick_guard());
        let (mut reader, mut writer) = connect(&handle);
        writer.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "PONG\r\n");

        assert!(thread.terminate(true));
        assert_eq!(read_line(&mut reader), "");
        assert!(handle.local_addr().is_none());
        assert_eq!(handle.session_count(), 0);
    }

    #[test]
    fn test_restart_rebinds() {
        let store = store(&[("port", "127.0.0.1:0")]);
        let (handle, thread) = start(protocols::standard(), Arc::clone(&store), quick_guard());
        let before = handle.local_addr().unwrap();

        handle.restart();
        assert!(wait_for(|| handle.local_addr().is_some_and(|a| a != before)));

        let (mut reader, mut writer) = connect(&handle);
        writer.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "PONG\r\n");
        thread.terminate(true);
    }

    #[test]
    fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let result = ConnectionServer::builder("clash", protocols::standard())
            .address(addr.to_string().parse().unwrap())
            .build(store(&[]));
        assert!(matches!(result, Err(ServerError::Bind(..))));
    }

    #[test]
    fn test_listen_address_from_store() {
        assert_eq!(listen_address(&store(&[])).unwrap().port, 8090);
        assert_eq!(listen_address(&store(&[("port", "9000")])).unwrap().port, 9000);
        assert_eq!(
            listen_address(&store(&[("port", "9000"), ("bindPort", "9001")])).unwrap().port,
            9001
        );
        assert!(matches!(
            listen_address(&store(&[("port", "nope")])),
            Err(ServerError::Address(_))
        ));
    }

    #[test]
    fn test_busy_callback() {
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let observed = Arc::clone(&seen);
        let server = ConnectionServer::builder("busy", protocols::standard())
            .address("127.0.0.1:0".parse().unwrap())
            .guard(quick_guard())
            .on_busy(Arc::new(move |n| observed.store(n, Ordering::SeqCst)))
            .build(store(&[]))
            .unwrap();
        let handle = server.handle();
        let thread = BusyThread::with_settings(
            "busy",
            server,
            ThreadSettings {
                idle_sleep: 0,
                busy_sleep: 0,
                ..ThreadSettings::default()
            },
        )
        .start()
        .unwrap();

        let (mut reader, mut writer) = connect(&handle);
        writer.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "PONG\r\n");
        assert!(wait_for(|| seen.load(Ordering::SeqCst) == 1));
        writer.write_all(b"QUIT\r\n").unwrap();
        assert!(wait_for(|| seen.load(Ordering::SeqCst) == 0));
        thread.terminate(true);
    }

    #[test]
    fn test_blank_line_reaches_empty() {
        let (handle, thread) = start(
            ProtocolSet::new(Protocol::new("blank", Blank)),
            store(&[]),
            quick_guard(),
        );
        let (mut reader, mut writer) = connect(&handle);

        writer.write_all(b"\r\nHELLO\r\n\n").unwrap();
        assert_eq!(read_line(&mut reader), "BLANK\r\n");
        assert_eq!(read_line(&mut reader), "HI\r\n");
        assert_eq!(read_line(&mut reader), "BLANK\r\n");
        thread.terminate(true);
    }

    #[test]
    fn test_requests_are_tracked_per_host() {
        let tracker = Arc::new(AccessTracker::new(TrackerLimits::default()));
        let (handle, thread) = launch(
            builder(protocols::standard(), quick_guard()).access_tracker(Arc::clone(&tracker)),
            store(&[]),
        );
        let (mut reader, mut writer) = connect(&handle);

        writer.write_all(b"PING\r\nPING again\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "PONG\r\n");
        assert_eq!(read_line(&mut reader), "PONG again\r\n");

        let track = tracker.access_track("127.0.0.1");
        assert_eq!(track.len(), 2);
        assert_eq!(track[0].path, "PING");
        assert_eq!(track[1].path, "PING again");
        thread.terminate(true);
    }

    #[cfg(target_os = "linux")]
    fn connect_from(source: &str, handle: &ServerHandle) -> (BufReader<TcpStream>, TcpStream) {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        let source: SocketAddr = format!("{source}:0").parse().unwrap();
        socket.bind(&source.into()).unwrap();
        socket.connect(&handle.local_addr().unwrap().into()).unwrap();
        let stream: TcpStream = socket.into();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (BufReader::new(stream.try_clone().unwrap()), stream)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_backoff_does_not_hold_up_other_peers() {
        let (handle, thread) = start(
            protocols::standard(),
            store(&[]),
            Arc::new(BruteForceGuard::default()),
        );

        let (_first_reader, _first) = connect(&handle);
        std::thread::sleep(Duration::from_millis(100));
        let (mut slowed_reader, mut slowed) = connect(&handle);
        slowed
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let slowed_at = Instant::now();
        slowed.write_all(b"PING\r\n").unwrap();

        let (mut other_reader, mut other) = connect_from("127.0.0.2", &handle);
        let other_at = Instant::now();
        other.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_line(&mut other_reader), "PONG\r\n");
        assert!(other_at.elapsed() < Duration::from_secs(1));

        // the repeating peer still serves its backoff (2 attempts * 2s)
        assert_eq!(read_line(&mut slowed_reader), "PONG\r\n");
        assert!(slowed_at.elapsed() >= Duration::from_secs(3));
        thread.terminate(true);
    }

    #[test]
    fn test_tls_and_plaintext_share_port() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let bundle = dir.path().join("server.pem");
        std::fs::write(
            &bundle,
            format!(
                "{}{}",
                cert.serialize_pem().unwrap(),
                cert.serialize_private_key_pem()
            ),
        )
        .unwrap();
        let (handle, thread) = start(
            protocols::standard(),
            store(&[("keyStore", bundle.to_str().unwrap())]),
            quick_guard(),
        );
        assert!(handle.is_encrypted());

        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(&rustls::Certificate(cert.serialize_der().unwrap()))
            .unwrap();
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let conn =
            rustls::ClientConnection::new(Arc::new(config), "localhost".try_into().unwrap())
                .unwrap();
        let socket = TcpStream::connect(handle.local_addr().unwrap()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut tls = BufReader::new(rustls::StreamOwned::new(conn, socket));

        tls.get_mut().write_all(b"PING\r\nQUIT\r\n").unwrap();
        let mut line = String::new();
        tls.read_line(&mut line).unwrap();
        assert_eq!(line, "PONG\r\n");
        line.clear();
        tls.read_line(&mut line).unwrap();
        assert_eq!(line, "OK\r\n");
        // close_notify gives a clean end of stream
        line.clear();
        assert_eq!(tls.read_line(&mut line).unwrap(), 0);

        let (mut reader, mut writer) = connect(&handle);
        writer.write_all(b"PING\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "PONG\r\n");
        thread.terminate(true);
    }
}

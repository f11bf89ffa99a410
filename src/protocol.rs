//! Protocol handler interface used by server sessions.
//!
//! A protocol is a [`Handler`] type plus a dispatch table mapping command
//! names to operations. The table is built once when the protocol is
//! registered; every session gets its own clone of the prototype handler.
//!
//! ## Reserved commands
//! - `EMPTY`: the client sent a blank line
//! - `UNKNOWN`: no operation matches; receives the whole request line
//!
//! ## Replies
//! | Reply       | Session action                                   |
//! |-------------|--------------------------------------------------|
//! | `Done`      | close the connection                             |
//! | `Terminate` | close the connection                             |
//! | `Resume`    | relax the read timeout, read the next request    |
//! | `Text`      | write the line; a leading `!` makes it the last  |
//! | `Stream`    | copy the bytes verbatim plus CRLF                |

use crate::server::line;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Command invoked for a blank request line.
pub const EMPTY: &str = "EMPTY";

/// Fallback command when nothing else matches.
pub const UNKNOWN: &str = "UNKNOWN";

/// Prefix marking a text reply as the final line of a session.
pub const FINAL_LINE_MARKER: char = '!';

/// What an operation wants the session to do next.
pub enum Reply {
    /// Nothing to send; the session ends.
    Done,
    /// Close the connection.
    Terminate,
    /// Keep the connection open for a long idle period.
    Resume,
    /// Send one line.
    Text(String),
    /// Send the bytes of a stream.
    Stream(Box<dyn Read + Send>),
}

impl Reply {
    pub fn text(line: impl Into<String>) -> Self {
        Reply::Text(line.into())
    }

    /// A line after which the session ends.
    pub fn last(line: impl AsRef<str>) -> Self {
        Reply::Text(format!("{FINAL_LINE_MARKER}{}", line.as_ref()))
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        Reply::Stream(Box::new(io::Cursor::new(data)))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Done => f.write_str("Done"),
            Reply::Terminate => f.write_str("Terminate"),
            Reply::Resume => f.write_str("Resume"),
            Reply::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Errors raised by operations.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request failed; the session reports it and continues.
    #[error("{0}")]
    Failed(String),
    /// The connection is unusable; the session ends.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// Byte stream of a session: buffered reads, direct writes.
pub trait LineStream: BufRead + Write + Send {}

impl<T: BufRead + Write + Send> LineStream for T {}

/// Per-session facts visible to handlers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub identity: String,
    pub request_count: u64,
    pub encrypted: bool,
    pub max_line_length: usize,
    pub request: String,
}

impl SessionInfo {
    pub fn new(peer: SocketAddr, encrypted: bool, max_line_length: usize) -> Self {
        Self {
            peer,
            identity: "-".to_string(),
            request_count: 0,
            encrypted,
            max_line_length,
            request: String::new(),
        }
    }
}

/// The session as seen from inside an operation.
pub struct Conversation<'a> {
    stream: &'a mut dyn LineStream,
    info: &'a mut SessionInfo,
}

impl<'a> Conversation<'a> {
    pub fn new(stream: &'a mut dyn LineStream, info: &'a mut SessionInfo) -> Self {
        Self { stream, info }
    }

    pub fn peer(&self) -> SocketAddr {
        self.info.peer
    }

    pub fn identity(&self) -> &str {
        &self.info.identity
    }

    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.info.identity = identity.into();
    }

    /// Number of requests processed so far, including the current one.
    pub fn request_count(&self) -> u64 {
        self.info.request_count
    }

    pub fn is_encrypted(&self) -> bool {
        self.info.encrypted
    }

    /// The raw request line currently being handled.
    pub fn request_line(&self) -> &str {
        &self.info.request
    }

    /// Read one more line from the client.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(line::read_line(&mut *self.stream, self.info.max_line_length)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Read exactly `len` bytes from the client.
    pub fn read_exact(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write a line terminated by CRLF.
    pub fn write_line(&mut self, text: &str) -> io::Result<()> {
        line::write_line(&mut *self.stream, text)
    }

    pub fn writer(&mut self) -> &mut dyn LineStream {
        &mut *self.stream
    }
}

/// An operation: one optional string argument, one reply.
pub type Operation<H> = fn(&mut H, &mut Conversation<'_>, &str) -> Result<Reply, HandlerError>;

/// Command name to operation mapping for one handler type.
pub struct CommandTable<H> {
    ops: HashMap<String, Operation<H>>,
}

impl<H> Default for CommandTable<H> {
    fn default() -> Self {
        Self {
            ops: HashMap::new(),
        }
    }
}

impl<H> CommandTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `op` under `name` (case-insensitive).
    pub fn command(mut self, name: &str, op: Operation<H>) -> Self {
        self.ops.insert(name.to_ascii_uppercase(), op);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Operation<H>> {
        self.ops.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A protocol command handler.
///
/// `Clone` provides the fresh per-session instance.
pub trait Handler: Clone + Send + 'static {
    /// Build the dispatch table. Called once per registration.
    fn commands() -> CommandTable<Self>;

    fn init_session(&mut self, _session: &mut Conversation<'_>) {}

    /// Line sent right after the session was initialised.
    fn greeting(&mut self) -> Option<String> {
        None
    }

    /// Text reported to the client when an operation fails.
    fn error(&mut self, error: &HandlerError) -> String {
        format!("ERROR {error}")
    }

    fn reset(&mut self) {}
}

/// A handler instance bound to a session.
pub trait Dispatch: Send {
    fn protocol(&self) -> &str;

    fn init_session(&mut self, session: &mut Conversation<'_>);

    fn greeting(&mut self) -> Option<String>;

    /// Run `command`, falling back to `UNKNOWN` with the whole `line`.
    ///
    /// Returns `None` when neither exists.
    fn invoke(
        &mut self,
        command: &str,
        argument: &str,
        line: &str,
        session: &mut Conversation<'_>,
    ) -> Option<Result<Reply, HandlerError>>;

    fn error(&mut self, error: &HandlerError) -> String;

    fn reset(&mut self);
}

struct Bound<H: Handler> {
    protocol: Arc<str>,
    table: Arc<CommandTable<H>>,
    handler: H,
}

impl<H: Handler> Dispatch for Bound<H> {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn init_session(&mut self, session: &mut Conversation<'_>) {
        self.handler.init_session(session);
    }

    fn greeting(&mut self) -> Option<String> {
        self.handler.greeting()
    }

    fn invoke(
        &mut self,
        command: &str,
        argument: &str,
        line: &str,
        session: &mut Conversation<'_>,
    ) -> Option<Result<Reply, HandlerError>> {
        if let Some(op) = self.table.resolve(command) {
            return Some(op(&mut self.handler, session, argument));
        }
        let fallback = self.table.resolve(UNKNOWN)?;
        Some(fallback(&mut self.handler, session, line.trim()))
    }

    fn error(&mut self, error: &HandlerError) -> String {
        self.handler.error(error)
    }

    fn reset(&mut self) {
        self.handler.reset();
    }
}

/// A registered protocol family.
pub trait ProtocolFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a session whose first request is `first_line` speaks this protocol.
    fn matches(&self, first_line: &str) -> bool;

    /// A fresh handler for a new session.
    fn create(&self) -> Box<dyn Dispatch>;
}

type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Registration of a [`Handler`] type.
pub struct Protocol<H: Handler> {
    name: Arc<str>,
    prototype: H,
    table: Arc<CommandTable<H>>,
    matcher: Matcher,
}

impl<H: Handler> Protocol<H> {
    /// Register `prototype`; the protocol matches nothing until
    /// [`matching`](Self::matching) is set, so it only serves as a default.
    pub fn new(name: &str, prototype: H) -> Self {
        Self {
            name: Arc::from(name),
            prototype,
            table: Arc::new(H::commands()),
            matcher: Box::new(|_| false),
        }
    }

    pub fn matching(mut self, matcher: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }
}

impl<H: Handler + Sync> ProtocolFactory for Protocol<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, first_line: &str) -> bool {
        (self.matcher)(first_line)
    }

    fn create(&self) -> Box<dyn Dispatch> {
        Box::new(Bound {
            protocol: Arc::clone(&self.name),
            table: Arc::clone(&self.table),
            handler: self.prototype.clone(),
        })
    }
}

/// All protocols served on one listening port.
#[derive(Clone)]
pub struct ProtocolSet {
    protocols: Vec<Arc<dyn ProtocolFactory>>,
    default: Arc<dyn ProtocolFactory>,
}

impl ProtocolSet {
    pub fn new(default: impl ProtocolFactory + 'static) -> Self {
        Self {
            protocols: Vec::new(),
            default: Arc::new(default),
        }
    }

    /// Add a protocol; earlier registrations win when several match.
    pub fn with(mut self, protocol: impl ProtocolFactory + 'static) -> Self {
        self.protocols.push(Arc::new(protocol));
        self
    }

    /// Pick the protocol for a session from its first request line.
    pub fn select(&self, first_line: &str) -> Box<dyn Dispatch> {
        self.protocols
            .iter()
            .find(|p| p.matches(first_line))
            .unwrap_or(&self.default)
            .create()
    }

    pub fn names(&self) -> Vec<&str> {
        self.protocols
            .iter()
            .map(|p| p.name())
            .chain(std::iter::once(self.default.name()))
            .collect()
    }
}

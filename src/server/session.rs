//! One thread per accepted connection.
//!
//! A session reads request lines, picks a protocol on the first one and
//! dispatches every request to its handler until the client leaves, a reply
//! ends the conversation or the server interrupts it.

use super::address::{display_host, is_site_local};
use super::line::{self, Request};
use super::transport::Transport;
use super::Shared;
use crate::protocol::{
    Conversation, Dispatch, HandlerError, Reply, SessionInfo, FINAL_LINE_MARKER,
};
use crate::schedule::panic_message;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

const BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Buffered reads over the transport, unbuffered writes.
struct SessionStream {
    inner: BufReader<Transport>,
}

impl Read for SessionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl BufRead for SessionStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

impl Write for SessionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.get_mut().flush()
    }
}

enum Flow {
    Continue,
    Close,
}

/// Removes the session from the live set however the thread ends.
struct Deregister {
    shared: Arc<Shared>,
    id: usize,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.shared.registry.remove(self.id);
        self.shared.notify_busy();
    }
}

/// Admission facts handed to a session thread.
pub(super) struct Start {
    pub peer: SocketAddr,
    /// Registry slot the session was inserted under.
    pub id: usize,
    pub name: String,
    pub stop: Arc<AtomicBool>,
    /// Brute-force backoff served before the first read.
    pub delay: Duration,
}

/// Sleep `delay` in short steps, giving up once `stop` is raised.
///
/// Returns whether the full delay elapsed.
fn backoff(delay: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(BACKOFF_STEP));
    }
}

/// Start the thread serving an admitted connection.
///
/// The session must already be registered under `start.id`.
pub(super) fn spawn(shared: Arc<Shared>, socket: TcpStream, start: Start) -> io::Result<()> {
    let Start {
        peer,
        id,
        name,
        stop,
        delay,
    } = start;
    thread::Builder::new().name(name.clone()).spawn(move || {
        let _deregister = Deregister {
            shared: Arc::clone(&shared),
            id,
        };
        if !delay.is_zero() && !backoff(delay, &stop) {
            return;
        }
        let transport = match Transport::negotiate(socket, shared.tls.as_ref()) {
            Ok(transport) => transport,
            Err(e) => {
                debug!(session = %name, error = %e, "Connection negotiation failed");
                return;
            }
        };
        Session::new(shared, transport, peer, name, stop).run();
    })?;
    Ok(())
}

struct Session {
    name: String,
    host: String,
    stream: SessionStream,
    info: SessionInfo,
    dispatch: Option<Box<dyn Dispatch>>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
}

impl Session {
    fn new(
        shared: Arc<Shared>,
        transport: Transport,
        peer: SocketAddr,
        name: String,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let info = SessionInfo::new(
            peer,
            transport.is_encrypted(),
            shared.settings.max_line_length,
        );
        Self {
            name,
            host: display_host(peer.ip()),
            stream: SessionStream {
                inner: BufReader::new(transport),
            },
            info,
            dispatch: None,
            shared,
            stop,
        }
    }

    fn run(mut self) {
        debug!(session = %self.name, encrypted = self.info.encrypted, "Session started");
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let line = match line::read_line(&mut self.stream, self.info.max_line_length) {
                Ok(Some(line)) => String::from_utf8_lossy(&line).into_owned(),
                Ok(None) => break,
                Err(e) => {
                    debug!(session = %self.name, error = %e, "Read failed");
                    break;
                }
            };

            self.info.request_count += 1;
            let request = line::parse_request(&line);
            self.info.request = line;
            if let Some(tracker) = &self.shared.tracker {
                tracker.track(&self.info.peer.ip().to_string(), &self.info.request);
            }
            debug!(
                host = %self.host,
                identity = %self.info.identity,
                sessions = self.shared.registry.len(),
                request = self.info.request_count,
                command = %request.command,
                "Request"
            );

            if let Flow::Close = self.handle(&request) {
                break;
            }
            if let Err(e) = self.stream.flush() {
                debug!(session = %self.name, error = %e, "Flush failed");
                break;
            }
        }
        self.close();
    }

    fn select_protocol(&mut self) -> Flow {
        let mut dispatch = self.shared.protocols.select(&self.info.request);
        debug!(session = %self.name, protocol = dispatch.protocol(), "Protocol selected");

        let mut conv = Conversation::new(&mut self.stream, &mut self.info);
        dispatch.init_session(&mut conv);
        let greeting = dispatch.greeting().filter(|g| !g.is_empty());
        let flow = match greeting {
            Some(greeting) => match conv.write_line(&greeting) {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Close,
            },
            None => Flow::Continue,
        };
        self.dispatch = Some(dispatch);
        flow
    }

    fn handle(&mut self, request: &Request) -> Flow {
        if self.dispatch.is_none() {
            if let Flow::Close = self.select_protocol() {
                return Flow::Close;
            }
        }
        let Some(dispatch) = self.dispatch.as_mut() else {
            return Flow::Close;
        };

        let line = self.info.request.clone();
        let outcome = {
            let mut conv = Conversation::new(&mut self.stream, &mut self.info);
            panic::catch_unwind(AssertUnwindSafe(|| {
                dispatch.invoke(&request.command, &request.argument, &line, &mut conv)
            }))
        };

        match outcome {
            Ok(Some(Ok(reply))) => self.reply(reply),
            Ok(Some(Err(HandlerError::Io(e)))) => {
                debug!(session = %self.name, error = %e, "Connection lost in handler");
                Flow::Close
            }
            Ok(Some(Err(e))) => {
                let text = dispatch.error(&e);
                self.write(&text)
            }
            Ok(None) => {
                let ip = self.info.peer.ip();
                warn!(host = %self.host, command = %request.command, "Unresolvable command");
                if !is_site_local(ip) {
                    self.shared.guard.deny(ip, "unresolvable command");
                }
                Flow::Close
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(session = %self.name, command = %request.command, panic = %message, "Handler panicked");
                let text = format!(
                    "UNKNOWN REASON:{}",
                    dispatch.error(&HandlerError::Failed(message))
                );
                self.write(&text)
            }
        }
    }

    fn reply(&mut self, reply: Reply) -> Flow {
        match reply {
            Reply::Done | Reply::Terminate => Flow::Close,
            Reply::Resume => {
                let socket = self.stream.inner.get_ref().socket();
                if let Err(e) = socket.set_read_timeout(Some(self.shared.settings.resume_timeout)) {
                    trace!(session = %self.name, error = %e, "Cannot relax read timeout");
                }
                Flow::Continue
            }
            Reply::Text(text) => match text.strip_prefix(FINAL_LINE_MARKER) {
                Some(last) => {
                    self.write(last);
                    Flow::Close
                }
                None => self.write(&text),
            },
            Reply::Stream(mut reader) => {
                let result = io::copy(&mut reader, &mut self.stream)
                    .and_then(|_| self.stream.write_all(b"\r\n"));
                match result {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        debug!(session = %self.name, error = %e, "Stream reply failed");
                        Flow::Close
                    }
                }
            }
        }
    }

    fn write(&mut self, text: &str) -> Flow {
        match line::write_line(&mut self.stream, text) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                debug!(session = %self.name, error = %e, "Write failed");
                Flow::Close
            }
        }
    }

    fn close(mut self) {
        if let Some(dispatch) = self.dispatch.as_mut() {
            dispatch.reset();
        }
        if let Err(e) = self.stream.inner.get_mut().close() {
            trace!(session = %self.name, error = %e, "Close failed");
        }
        debug!(
            session = %self.name,
            requests = self.info.request_count,
            "Session closed"
        );
    }
}

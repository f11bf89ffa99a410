//! Registry of live sessions using slab allocation.

use parking_lot::Mutex;
use slab::Slab;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A live session as tracked by its server.
#[derive(Debug)]
pub struct SessionEntry {
    name: String,
    peer: SocketAddr,
    started: Instant,
    socket: TcpStream,
    stop: Arc<AtomicBool>,
}

impl SessionEntry {
    /// `socket` is a handle to the session's connection, used to interrupt it.
    pub fn new(peer: SocketAddr, socket: TcpStream) -> Self {
        Self {
            name: format!("session-{peer}"),
            peer,
            started: Instant::now(),
            socket,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flag checked by the session between requests.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn interrupt(&self) {
        self.stop.store(true, Ordering::Release);
        // unblocks a pending read
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// Summary of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: usize,
    pub name: String,
    pub peer: SocketAddr,
    pub age: Duration,
}

/// Live sessions of one server.
///
/// Provides O(1) insert and remove.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<Slab<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: SessionEntry) -> usize {
        self.sessions.lock().insert(entry)
    }

    /// Remove a session. Removing twice is harmless.
    pub fn remove(&self, id: usize) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains(id) {
            sessions.remove(id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.sessions.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Interrupt every live session.
    pub fn interrupt_all(&self) {
        for (_, entry) in self.sessions.lock().iter() {
            entry.interrupt();
        }
    }

    pub fn clear(&self) {
        self.sessions.lock().clear();
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, e)| SessionSummary {
                id,
                name: e.name.clone(),
                peer: e.peer,
                age: e.started.elapsed(),
            })
            .collect()
    }

    /// Sessions that have been open longer than `timeout`.
    pub fn sessions_older_than(&self, timeout: Duration) -> Vec<SessionSummary> {
        self.summaries()
            .into_iter()
            .filter(|s| s.age > timeout)
            .collect()
    }

    /// Interrupt the session called `name`.
    pub fn close_session(&self, name: &str) -> bool {
        let sessions = self.sessions.lock();
        match sessions.iter().find(|(_, e)| e.name == name) {
            Some((id, entry)) => {
                debug!(id, session = name, "Closing session");
                entry.interrupt();
                true
            }
            None => false,
        }
    }
}

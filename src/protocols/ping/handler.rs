//! Ping protocol handler.

use crate::protocol::{CommandTable, Conversation, Handler, HandlerError, Reply, EMPTY, UNKNOWN};
use tracing::debug;

/// Registration name of the protocol.
pub const NAME: &str = "ping";

/// Longest accepted identity.
const MAX_IDENT_LENGTH: usize = 64;

/// Health check handler. Purely in-memory, no shared state.
#[derive(Debug, Clone, Default)]
pub struct PingHandler {
    pings: u64,
}

impl PingHandler {
    fn ping(&mut self, _: &mut Conversation<'_>, message: &str) -> Result<Reply, HandlerError> {
        self.pings += 1;
        if message.is_empty() {
            Ok(Reply::text("PONG"))
        } else {
            Ok(Reply::text(format!("PONG {message}")))
        }
    }

    fn ident(&mut self, session: &mut Conversation<'_>, name: &str) -> Result<Reply, HandlerError> {
        if name.is_empty() || name.len() > MAX_IDENT_LENGTH || name.contains(char::is_whitespace) {
            return Err(HandlerError::failed("invalid identity"));
        }
        session.set_identity(name);
        Ok(Reply::text(format!("OK {name}")))
    }

    fn quit(&mut self, session: &mut Conversation<'_>, _: &str) -> Result<Reply, HandlerError> {
        debug!(peer = %session.peer(), pings = self.pings, "Ping session quit");
        Ok(Reply::last("OK"))
    }

    fn empty(&mut self, _: &mut Conversation<'_>, _: &str) -> Result<Reply, HandlerError> {
        Ok(Reply::Resume)
    }

    fn unknown(&mut self, _: &mut Conversation<'_>, line: &str) -> Result<Reply, HandlerError> {
        Err(HandlerError::failed(format!("unknown command {line}")))
    }
}

impl Handler for PingHandler {
    fn commands() -> CommandTable<Self> {
        CommandTable::new()
            .command("PING", Self::ping)
            .command("IDENT", Self::ident)
            .command("QUIT", Self::quit)
            .command(EMPTY, Self::empty)
            .command(UNKNOWN, Self::unknown)
    }

    fn reset(&mut self) {
        self.pings = 0;
    }
}

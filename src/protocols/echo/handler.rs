//! Echo protocol handler.

use crate::protocol::{CommandTable, Conversation, Handler, HandlerError, Reply};

/// Registration name of the protocol.
pub const NAME: &str = "echo";

const MAX_ECHO_SIZE: usize = 16 * 1024 * 1024; // 16MB max echo size

/// Whether a session opening with `first_line` speaks echo.
pub fn matches(first_line: &str) -> bool {
    first_line
        .get(..4)
        .is_some_and(|head| head.eq_ignore_ascii_case("ECHO"))
}

/// Echo handler.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    echoed_bytes: usize,
}

impl EchoHandler {
    fn echo(&mut self, session: &mut Conversation<'_>, arg: &str) -> Result<Reply, HandlerError> {
        let length = match arg.parse::<usize>() {
            Ok(len) if len > MAX_ECHO_SIZE => {
                return Err(HandlerError::failed("payload too large"));
            }
            Ok(len) => len,
            Err(_) => {
                self.echoed_bytes += arg.len();
                return Ok(Reply::text(arg));
            }
        };

        // short reads surface as I/O errors and end the session
        let payload = session.read_exact(length)?;
        self.echoed_bytes += payload.len();
        Ok(Reply::bytes(payload))
    }

    fn quit(&mut self, _: &mut Conversation<'_>, _: &str) -> Result<Reply, HandlerError> {
        Ok(Reply::last("OK"))
    }
}

impl Handler for EchoHandler {
    fn commands() -> CommandTable<Self> {
        CommandTable::new()
            .command("ECHO", Self::echo)
            .command("QUIT", Self::quit)
    }

    fn reset(&mut self) {
        self.echoed_bytes = 0;
    }
}

//! Protocol implementations.
//!
//! - `ping`: health checks and identification; the default protocol
//! - `echo`: byte and text echo, selected when the first request is `ECHO`

pub mod echo;
pub mod ping;

use crate::protocol::{Protocol, ProtocolSet};

/// Protocols served by the binary.
pub fn standard() -> ProtocolSet {
    ProtocolSet::new(Protocol::new(ping::NAME, ping::PingHandler::default()))
        .with(Protocol::new(echo::NAME, echo::EchoHandler::default()).matching(echo::matches))
}

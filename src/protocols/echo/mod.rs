//! Echo protocol implementation.
//!
//! Selected when the first request of a session starts with `ECHO`.
//!
//! ```text
//! Request:  ECHO 5\r\nhello
//! Response: hello\r\n
//!
//! Request:  ECHO some text\r\n
//! Response: some text\r\n
//!
//! Request:  QUIT\r\n
//! Response: OK\r\n          (connection closes)
//! ```
//!
//! A numeric argument is a payload length: exactly that many bytes are read
//! from the connection and sent back verbatim.

pub mod handler;

pub use handler::{matches, EchoHandler, NAME};

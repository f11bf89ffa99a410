//! Ping protocol implementation.
//!
//! A minimal line protocol for health checks and latency measurement:
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//!
//! Request:  IDENT alice\r\n
//! Response: OK alice\r\n
//!
//! Request:  QUIT\r\n
//! Response: OK\r\n          (connection closes)
//! ```
//!
//! Blank lines keep the session open without a reply; any other line gets
//! `ERROR unknown command <line>`.

pub mod handler;

pub use handler::{PingHandler, NAME};

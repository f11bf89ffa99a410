//! switchd: a thread-per-connection line protocol server core
//!
//! - `schedule`: busy/idle scheduler threads with memory prerequisites
//! - `pipeline`: fixed worker pools draining a job queue
//! - `server`: accept loop, brute-force guard, same-port TLS, sessions
//! - `protocol` / `protocols`: handler dispatch and the built-in protocols
//! - `switchboard`: thread registry, access tracking, authorization
//! - `store` / `config`: persisted settings and bootstrap configuration

pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod protocols;
pub mod schedule;
pub mod server;
pub mod store;
pub mod switchboard;

//! Process-liveness watchdog over a Unix socket.
//!
//! A `watchcatd` daemon supervises client processes through periodic
//! heartbeats. Each connection opens one session with a timeout and a
//! signal; if the client goes silent past its deadline, the daemon
//! delivers the signal to the owning process so an external supervisor can
//! restart it. Closing the session first guarantees it is never signaled.
//!
//! The crate ships both halves:
//! - the daemon (`server`, run by the `watchcatd` binary);
//! - the embeddable client ([`Watchcat`]).

pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod signals;

#[cfg(test)]
mod server_tests;

pub use client::{OpenOptions, Watchcat};
pub use config::DaemonConfig;
pub use protocol::{ErrorKind, SignalSpec};
pub use server::run_daemon;

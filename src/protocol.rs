//! Wire protocol for the watchcat daemon.
//!
//! All communication uses newline-delimited JSON (one JSON object per line)
//! over the daemon's Unix socket. Each connection carries at most one
//! in-flight request; the daemon answers every request with exactly one
//! [`Reply`] line.

use serde::{Deserialize, Serialize};

/// Protocol version expected in Open requests.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default heartbeat timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u32 = 60;

/// Default expiry signal (SIGKILL).
pub const DEFAULT_SIGNAL: u32 = 9;

/// Maximum length of the diagnostic `info` field, in bytes.
pub const MAX_INFO_BYTES: usize = 255;

/// The `signal` field of an Open request: a raw signal number or a
/// symbolic name such as `"HUP"` or `"SIGHUP"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalSpec {
    Number(u32),
    Name(String),
}

impl Default for SignalSpec {
    fn default() -> Self {
        SignalSpec::Number(DEFAULT_SIGNAL)
    }
}

/// Requests sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Request {
    /// Start supervising the connecting process.
    Open {
        #[serde(default = "default_version")]
        version: u32,
        /// Seconds without a heartbeat before the signal is delivered.
        #[serde(default = "default_timeout")]
        timeout: u32,
        #[serde(default)]
        signal: SignalSpec,
        /// Free-form text logged if the session expires.
        #[serde(default)]
        info: Option<String>,
    },
    /// Renew the session deadline.
    Heartbeat,
    /// Retire the session without ever being signaled.
    Close,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_timeout() -> u32 {
    DEFAULT_TIMEOUT_SECS
}

/// Error classification carried in wire replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidSignal,
    NotFound,
    Transport,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "InvalidArgument"),
            ErrorKind::InvalidSignal => write!(f, "InvalidSignal"),
            ErrorKind::NotFound => write!(f, "NotFound"),
            ErrorKind::Transport => write!(f, "Transport"),
        }
    }
}

/// Replies sent from daemon to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Reply {
    Ack,
    Error { kind: ErrorKind, message: String },
}

impl Reply {
    /// Build the wire form of a failed operation.
    pub fn error(err: &WatchdogError) -> Self {
        Reply::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Typed failure of a protocol operation.
///
/// Validation failures are rejected before any session state is touched,
/// so a failed Open never leaves a half-registered session behind.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("invalid signal name: {0}")]
    InvalidSignal(String),
    #[error("no open session")]
    NotFound,
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl WatchdogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WatchdogError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            WatchdogError::InvalidSignal(_) => ErrorKind::InvalidSignal,
            WatchdogError::NotFound => ErrorKind::NotFound,
            WatchdogError::Transport(_) => ErrorKind::Transport,
        }
    }
}

/// Replace newlines so multi-line info text cannot corrupt line-oriented
/// logs. Applied before an Open request is registered.
pub fn sanitize_info(info: &str) -> String {
    info.replace('\n', "_")
}

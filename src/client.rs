//! Client library for talking to a watchcat daemon.
//!
//! [`Watchcat`] opens a supervised session over the daemon's Unix socket.
//! The application heartbeats at its own pace; if it ever goes silent past
//! the configured timeout, the daemon delivers the configured signal. A
//! clean [`Watchcat::close`] (or the scoped [`Watchcat::with`] form)
//! guarantees the session is never signaled.

use crate::config::DEFAULT_DEVICE;
use crate::protocol::{
    sanitize_info, Reply, Request, SignalSpec, DEFAULT_TIMEOUT_SECS, PROTOCOL_VERSION,
};
use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

/// Options for opening a watchdog session. Every option is independently
/// optional; the defaults are a 60 second timeout, SIGKILL, no info text,
/// and the conventional device path.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    timeout: u32,
    signal: SignalSpec,
    info: Option<String>,
    device: PathBuf,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT_SECS,
            signal: SignalSpec::default(),
            info: None,
            device: PathBuf::from(DEFAULT_DEVICE),
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds without a heartbeat before the daemon signals this process.
    pub fn timeout(mut self, seconds: u32) -> Self {
        self.timeout = seconds;
        self
    }

    /// Expiry signal by number.
    pub fn signal(mut self, signal: u32) -> Self {
        self.signal = SignalSpec::Number(signal);
        self
    }

    /// Expiry signal by name, e.g. `"HUP"` or `"SIGHUP"`.
    pub fn signal_name(mut self, name: &str) -> Self {
        self.signal = SignalSpec::Name(name.to_string());
        self
    }

    /// Free-form text the daemon logs if this session expires.
    pub fn info(mut self, info: &str) -> Self {
        self.info = Some(sanitize_info(info));
        self
    }

    /// Socket path of the daemon.
    pub fn device(mut self, device: impl Into<PathBuf>) -> Self {
        self.device = device.into();
        self
    }

    /// Open a session with these options.
    pub fn open(self) -> Result<Watchcat> {
        Watchcat::open_with(self)
    }
}

/// An open watchdog session.
///
/// Dropping the handle sends a best-effort Close; prefer [`Watchcat::close`]
/// or [`Watchcat::with`], which surface errors.
#[derive(Debug)]
pub struct Watchcat {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    closed: bool,
}

impl Watchcat {
    /// Open a session with default options.
    pub fn open() -> Result<Self> {
        Self::open_with(OpenOptions::default())
    }

    /// Open a session with explicit options.
    pub fn open_with(options: OpenOptions) -> Result<Self> {
        let stream = UnixStream::connect(&options.device).with_context(|| {
            format!(
                "failed to connect to watchcat daemon at {}",
                options.device.display()
            )
        })?;
        let writer = stream.try_clone().context("failed to clone socket")?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
            closed: false,
        };
        client.round_trip(&Request::Open {
            version: PROTOCOL_VERSION,
            timeout: options.timeout,
            signal: options.signal,
            info: options.info,
        })?;
        Ok(client)
    }

    /// Run `f` under an open session, closing it on every exit path.
    pub fn with<T>(options: OpenOptions, f: impl FnOnce(&mut Watchcat) -> Result<T>) -> Result<T> {
        let mut cat = Self::open_with(options)?;
        let result = f(&mut cat);
        let closed = cat.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Renew the session deadline.
    pub fn heartbeat(&mut self) -> Result<()> {
        self.round_trip(&Request::Heartbeat)
    }

    /// Retire the session. The daemon will never signal it, even if the
    /// deadline already elapsed.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.round_trip(&Request::Close)
    }

    fn round_trip(&mut self, request: &Request) -> Result<()> {
        use crate::protocol::WatchdogError;

        let msg = serde_json::to_string(request)?;
        writeln!(self.writer, "{msg}").map_err(WatchdogError::Transport)?;
        self.writer.flush().map_err(WatchdogError::Transport)?;

        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(WatchdogError::Transport)?;
        if line.is_empty() {
            bail!("daemon closed the connection");
        }
        let reply: Reply = serde_json::from_str(line.trim())?;
        match reply {
            Reply::Ack => Ok(()),
            Reply::Error { kind, message } => bail!("daemon error: {kind}: {message}"),
        }
    }
}

impl Drop for Watchcat {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Ok(msg) = serde_json::to_string(&Request::Close) {
            let _ = writeln!(self.writer, "{msg}");
            let _ = self.writer.flush();
        }
    }
}

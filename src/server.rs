//! Watchdog daemon server.
//!
//! Accepts client connections on a Unix socket, resolves each peer's pid
//! from socket credentials, and enforces heartbeat deadlines:
//! - one task per connection handles Open/Heartbeat/Close round-trips;
//! - a single timer task sleeps until the earliest live deadline and
//!   retires sessions that went silent, delivering their signal.
//!
//! A dropped connection is not a Close: its session stays registered and
//! expires through the timer like any other.

use crate::config::DaemonConfig;
use crate::protocol::{self, Reply, Request, SignalSpec, WatchdogError, MAX_INFO_BYTES, PROTOCOL_VERSION};
use crate::registry::{SessionId, Watchdog};
use crate::signals::{self, KillSink, SignalSink};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};

/// Resolves the pid of the process on the other end of a connection.
///
/// The OS mechanism stays behind this seam so the daemon logic is portable
/// and tests can substitute their own resolution.
pub trait PeerIdentity: Send + Sync {
    fn resolve_pid(&self, stream: &UnixStream) -> std::io::Result<u32>;
}

/// SO_PEERCRED-backed resolution.
pub struct UcredIdentity;

impl PeerIdentity for UcredIdentity {
    fn resolve_pid(&self, stream: &UnixStream) -> std::io::Result<u32> {
        let cred = stream.peer_cred()?;
        let pid = cred.pid().filter(|pid| *pid > 0).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "peer pid not available on this platform",
            )
        })?;
        u32::try_from(pid).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "peer pid out of range")
        })
    }
}

/// Shared daemon state handed to every connection task and the timer loop.
struct Daemon {
    watchdog: Mutex<Watchdog>,
    /// Woken whenever the earliest deadline may have moved earlier.
    timer_wake: Notify,
    sink: Box<dyn SignalSink>,
    /// Suppresses the `[watchcatd]` stderr logs.
    quiet: bool,
}

/// Runs the watchdog daemon until the process exits or the listener fails.
pub async fn run_daemon(config: DaemonConfig) -> Result<()> {
    run_with(config, Box::new(KillSink), Box::new(UcredIdentity)).await
}

/// Runs the daemon with explicit delivery and identity capabilities.
pub async fn run_with(
    config: DaemonConfig,
    sink: Box<dyn SignalSink>,
    identity: Box<dyn PeerIdentity>,
) -> Result<()> {
    let device = config.device.clone();

    // A socket file may be left behind by a dead daemon. A live daemon
    // still answers on it; that is a startup error, not ours to replace.
    if device.exists() {
        if UnixStream::connect(&device).await.is_ok() {
            anyhow::bail!(
                "another watchcat daemon is already listening on {}",
                device.display()
            );
        }
        std::fs::remove_file(&device)
            .with_context(|| format!("failed to remove stale socket {}", device.display()))?;
    }

    let listener = UnixListener::bind(&device)
        .with_context(|| format!("failed to bind {}", device.display()))?;
    if !config.quiet {
        eprintln!("[watchcatd] listening on {}", device.display());
    }

    let daemon = Arc::new(Daemon {
        watchdog: Mutex::new(Watchdog::new()),
        timer_wake: Notify::new(),
        sink,
        quiet: config.quiet,
    });

    let timer_daemon = daemon.clone();
    tokio::spawn(async move {
        run_timer(timer_daemon).await;
    });

    let identity: Arc<dyn PeerIdentity> = Arc::from(identity);
    let result = accept_loop(&listener, &daemon, &identity).await;

    let _ = std::fs::remove_file(&device);
    result
}

async fn accept_loop(
    listener: &UnixListener,
    daemon: &Arc<Daemon>,
    identity: &Arc<dyn PeerIdentity>,
) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;

        // Expiry must target a concrete process; a connection whose pid
        // cannot be resolved is rejected before any request is read.
        let pid = match identity.resolve_pid(&stream) {
            Ok(pid) => pid,
            Err(e) => {
                if !daemon.quiet {
                    eprintln!("[watchcatd] rejecting connection without peer credentials: {e}");
                }
                continue;
            }
        };

        let conn_daemon = daemon.clone();
        tokio::spawn(async move {
            handle_connection(conn_daemon, stream, pid).await;
        });
    }
}

/// Single timer-dispatch loop shared by all sessions.
///
/// Sleeps until the earliest queued deadline, then re-checks it against
/// the registry: an entry renewed by a heartbeat in the meantime is
/// discarded and the loop re-arms for the new deadline.
async fn run_timer(daemon: Arc<Daemon>) {
    loop {
        let next = daemon.watchdog.lock().await.next_deadline();
        match next {
            None => daemon.timer_wake.notified().await,
            Some(due) => {
                tokio::select! {
                    () = tokio::time::sleep_until(due.into()) => {
                        fire_expirations(&daemon).await;
                    }
                    () = daemon.timer_wake.notified() => {}
                }
            }
        }
    }
}

/// Retire due sessions under the lock, then deliver signals outside it so
/// no concurrent Heartbeat or Close can observe a session being signaled.
async fn fire_expirations(daemon: &Daemon) {
    let expired = daemon.watchdog.lock().await.expire_due(Instant::now());
    for session in expired {
        let name = signals::name_of(session.signal).unwrap_or("?");
        let info = session
            .info
            .as_deref()
            .map(|info| format!(" ({info})"))
            .unwrap_or_default();
        match daemon.sink.deliver(session.owner_pid, session.signal) {
            Ok(()) => {
                if !daemon.quiet {
                    eprintln!(
                        "[watchcatd] session {}: no heartbeat for {}s, sent SIG{} to pid {}{}",
                        session.id,
                        session.timeout.as_secs(),
                        name,
                        session.owner_pid,
                        info
                    );
                }
            }
            // The process being gone means there is nothing left to stop.
            Err(e) => tracing::warn!(
                session = session.id,
                pid = session.owner_pid,
                signal = name,
                "expiry signal not delivered: {e}"
            ),
        }
    }
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream, pid: u32) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut session: Option<SessionId> = None;
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            // EOF without Close: the session, if any, is left to the timer.
            Ok(0) => break,
            Ok(_) => {
                let (reply, done) = handle_request(&daemon, &mut session, pid, &line).await;
                let reply_json = match serde_json::to_string(&reply) {
                    Ok(json) => json,
                    Err(e) => {
                        if !daemon.quiet {
                            eprintln!("[watchcatd] failed to serialize reply: {e}");
                        }
                        break;
                    }
                };
                if writer
                    .write_all(format!("{reply_json}\n").as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Handle one request line. Returns the reply and whether the connection
/// should be closed afterwards (a successful Close ends the connection).
async fn handle_request(
    daemon: &Arc<Daemon>,
    session: &mut Option<SessionId>,
    pid: u32,
    line: &str,
) -> (Reply, bool) {
    let request: Request = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            return (
                Reply::error(&WatchdogError::InvalidArgument(format!(
                    "invalid request: {e}"
                ))),
                false,
            );
        }
    };

    match request {
        Request::Open {
            version,
            timeout,
            signal,
            info,
        } => match open_session(daemon, session.is_some(), pid, version, timeout, &signal, info)
            .await
        {
            Ok(id) => {
                *session = Some(id);
                (Reply::Ack, false)
            }
            Err(e) => (Reply::error(&e), false),
        },

        Request::Heartbeat => match *session {
            None => (Reply::error(&WatchdogError::NotFound), false),
            Some(id) => {
                let result = daemon.watchdog.lock().await.heartbeat(id, Instant::now());
                match result {
                    Ok(()) => (Reply::Ack, false),
                    Err(e) => (Reply::error(&e), false),
                }
            }
        },

        // The slot is cleared only on a successful close: a connection
        // whose session already expired still had its one session, so a
        // later Open on it stays rejected.
        Request::Close => match *session {
            None => (Reply::error(&WatchdogError::NotFound), false),
            Some(id) => {
                let result = daemon.watchdog.lock().await.close(id);
                match result {
                    Ok(closed) => {
                        *session = None;
                        tracing::debug!(session = closed.id, pid = closed.owner_pid, "closed");
                        daemon.timer_wake.notify_one();
                        (Reply::Ack, true)
                    }
                    Err(e) => (Reply::error(&e), false),
                }
            }
        },
    }
}

/// Validate and register an Open request. Nothing is registered unless
/// every check passes.
async fn open_session(
    daemon: &Arc<Daemon>,
    already_open: bool,
    pid: u32,
    version: u32,
    timeout: u32,
    signal: &SignalSpec,
    info: Option<String>,
) -> Result<SessionId, WatchdogError> {
    if already_open {
        return Err(WatchdogError::InvalidArgument(
            "a session is already open on this connection".to_string(),
        ));
    }
    if version != PROTOCOL_VERSION {
        return Err(WatchdogError::InvalidArgument(format!(
            "unsupported protocol version {version}"
        )));
    }
    if timeout == 0 {
        return Err(WatchdogError::InvalidArgument(
            "timeout must be greater than zero".to_string(),
        ));
    }
    let signal = signals::resolve(signal)?;
    let info = match info {
        Some(text) if text.len() > MAX_INFO_BYTES => {
            return Err(WatchdogError::InvalidArgument(format!(
                "info exceeds {MAX_INFO_BYTES} bytes"
            )));
        }
        Some(text) => Some(protocol::sanitize_info(&text)),
        None => None,
    };

    let id = daemon.watchdog.lock().await.open(
        pid,
        Duration::from_secs(u64::from(timeout)),
        signal,
        info,
        Instant::now(),
    );
    // The new deadline may be earlier than whatever the timer sleeps on.
    daemon.timer_wake.notify_one();
    Ok(id)
}

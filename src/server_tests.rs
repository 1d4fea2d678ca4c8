//! End-to-end daemon tests over a real Unix socket.
//!
//! Each test spawns its own daemon on a tempdir socket with a counting
//! signal sink, then drives it with the real client. Timeouts are kept at
//! one second, so the assertions leave generous margins around each
//! deadline.

use crate::client::OpenOptions;
use crate::config::DaemonConfig;
use crate::server::{run_with, UcredIdentity};
use crate::signals::CountingSink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

struct TestDaemon {
    device: PathBuf,
    sink: Arc<CountingSink>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    async fn spawn() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = dir.path().join("watchcat.socket");
        let sink = Arc::new(CountingSink::default());
        let config = DaemonConfig {
            device: device.clone(),
            pid_file: None,
            quiet: true,
        };
        let server = tokio::spawn(run_with(
            config,
            Box::new(sink.clone()),
            Box::new(UcredIdentity),
        ));
        for _ in 0..200 {
            if device.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(device.exists(), "daemon did not come up");
        Self {
            device,
            sink,
            server,
            _dir: dir,
        }
    }

    fn options(&self) -> OpenOptions {
        OpenOptions::new().device(self.device.clone())
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heartbeats_faster_than_timeout_never_expire() {
    let daemon = TestDaemon::spawn().await;
    let mut cat = daemon
        .options()
        .timeout(1)
        .signal(10)
        .open()
        .expect("open");

    // Twice the timeout's worth of wall clock, heartbeating well inside it.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cat.heartbeat().expect("heartbeat");
    }
    assert_eq!(daemon.sink.count_of(10), 0);

    cat.close().expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_session_is_signaled_exactly_once() {
    let daemon = TestDaemon::spawn().await;
    let mut cat = daemon
        .options()
        .timeout(1)
        .signal(15)
        .open()
        .expect("open");

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(daemon.sink.deliveries(), vec![(std::process::id(), 15)]);

    // The session is gone; the connection only learns on its next call.
    let err = cat.heartbeat().expect_err("session expired");
    assert!(err.to_string().contains("NotFound"), "{err}");

    // Still exactly one delivery, ever.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(daemon.sink.count_of(15), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_session_is_never_signaled() {
    let daemon = TestDaemon::spawn().await;
    let cat = daemon
        .options()
        .timeout(1)
        .signal(15)
        .open()
        .expect("open");
    cat.close().expect("close");

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(daemon.sink.deliveries().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scoped_session_closes_on_every_path() {
    let daemon = TestDaemon::spawn().await;

    let value = crate::client::Watchcat::with(daemon.options().timeout(1).signal(15), |cat| {
        cat.heartbeat()?;
        Ok(42)
    })
    .expect("scoped run");
    assert_eq!(value, 42);

    let err = crate::client::Watchcat::with(
        daemon.options().timeout(1).signal(15),
        |_cat| -> anyhow::Result<()> { anyhow::bail!("worker failed") },
    )
    .expect_err("propagates the closure error");
    assert_eq!(err.to_string(), "worker failed");

    // Both sessions were closed, neither may ever be signaled.
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(daemon.sink.deliveries().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_expire_independently() {
    let daemon = TestDaemon::spawn().await;
    let _a = daemon
        .options()
        .timeout(1)
        .signal(15)
        .info("session-a")
        .open()
        .expect("open a");
    let mut b = daemon
        .options()
        .timeout(3)
        .signal(10)
        .info("session-b")
        .open()
        .expect("open b");

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(daemon.sink.count_of(15), 1, "a expired");
    assert_eq!(daemon.sink.count_of(10), 0, "b unaffected");

    // B is still live and renewable after A's expiry.
    b.heartbeat().expect("b heartbeat");
    b.close().expect("b close");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(daemon.sink.deliveries().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn renewed_then_silent_worker_is_signaled_once() {
    let daemon = TestDaemon::spawn().await;
    let mut cat = daemon
        .options()
        .timeout(1)
        .signal(15)
        .info("worker-7")
        .open()
        .expect("open");

    // Heartbeats inside the window slide the deadline...
    tokio::time::sleep(Duration::from_millis(500)).await;
    cat.heartbeat().expect("first heartbeat");
    tokio::time::sleep(Duration::from_millis(750)).await;
    cat.heartbeat().expect("second heartbeat");

    // ...then the worker hangs and the daemon steps in, once.
    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(daemon.sink.deliveries(), vec![(std::process::id(), 15)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unrecognized_signal_name_is_rejected_at_open() {
    let daemon = TestDaemon::spawn().await;
    let err = daemon
        .options()
        .timeout(1)
        .signal_name("WEDGED")
        .open()
        .expect_err("invalid signal");
    assert!(err.to_string().contains("InvalidSignal"), "{err}");
    assert!(err.to_string().contains("WEDGED"), "{err}");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(daemon.sink.deliveries().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_daemon_on_same_device_refuses_to_start() {
    let daemon = TestDaemon::spawn().await;
    let config = DaemonConfig {
        device: daemon.device.clone(),
        pid_file: None,
        quiet: true,
    };
    let err = run_with(
        config,
        Box::new(Arc::new(CountingSink::default())),
        Box::new(UcredIdentity),
    )
    .await
    .expect_err("device is taken");
    assert!(err.to_string().contains("already listening"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_connection_still_expires_via_the_timer() {
    use std::io::{BufRead, BufReader, Write};

    let daemon = TestDaemon::spawn().await;

    // Raw connection so nothing sends a Close on drop.
    let mut stream = std::os::unix::net::UnixStream::connect(&daemon.device).expect("connect");
    writeln!(stream, r#"{{"op":"Open","timeout":1,"signal":12}}"#).expect("send open");
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    let mut line = String::new();
    reader.read_line(&mut line).expect("read ack");
    assert!(line.contains("Ack"), "{line}");

    // Abrupt disconnect. The daemon must not treat this as a Close; the
    // session expires through the timer like any other.
    drop(reader);
    drop(stream);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(daemon.sink.count_of(12), 1);
}

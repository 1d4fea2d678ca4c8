//! `watchcatd` — the watchcat daemon binary.

use anyhow::{Context, Result};
use clap::Parser;
use fs2::FileExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use watchcat::config::{default_device, DaemonConfig};

#[derive(Parser)]
#[command(name = "watchcatd")]
#[command(about = "Process-liveness watchdog daemon")]
#[command(version)]
struct Cli {
    /// Socket path to listen on (also via WATCHCATD_DEVICE)
    #[arg(long)]
    device: Option<PathBuf>,

    /// Write and lock a pidfile while running
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Suppress operational log output
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = DaemonConfig {
        device: cli.device.unwrap_or_else(default_device),
        pid_file: cli.pid_file,
        quiet: cli.quiet,
    };

    // Held for the daemon's lifetime; a second watchcatd fails here
    // instead of fighting over the socket.
    let _pid_guard = config
        .pid_file
        .as_deref()
        .map(acquire_pid_file)
        .transpose()?;

    watchcat::server::run_daemon(config).await
}

struct PidFileGuard {
    file: std::fs::File,
    path: PathBuf,
}

fn acquire_pid_file(path: &Path) -> Result<PidFileGuard> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open pidfile {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("another watchcatd already holds {}", path.display()))?;
    file.set_len(0)
        .with_context(|| format!("failed to truncate pidfile {}", path.display()))?;
    let mut handle = &file;
    writeln!(handle, "{}", std::process::id())
        .with_context(|| format!("failed to write pidfile {}", path.display()))?;
    Ok(PidFileGuard {
        file,
        path: path.to_path_buf(),
    })
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

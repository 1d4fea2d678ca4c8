//! POSIX signal names and delivery.
//!
//! Name resolution uses a fixed table rather than any platform lookup so
//! the mapping stays deterministic. Delivery goes through the
//! [`SignalSink`] capability; production uses `kill(2)`, tests substitute
//! a counting sink.

use crate::protocol::{SignalSpec, WatchdogError};

/// Signal names without the `SIG` prefix, with their Linux numbers.
const SIGNAL_TABLE: &[(&str, u32)] = &[
    ("HUP", 1),
    ("INT", 2),
    ("QUIT", 3),
    ("ILL", 4),
    ("TRAP", 5),
    ("ABRT", 6),
    ("IOT", 6),
    ("BUS", 7),
    ("FPE", 8),
    ("KILL", 9),
    ("USR1", 10),
    ("SEGV", 11),
    ("USR2", 12),
    ("PIPE", 13),
    ("ALRM", 14),
    ("TERM", 15),
    ("STKFLT", 16),
    ("CHLD", 17),
    ("CONT", 18),
    ("STOP", 19),
    ("TSTP", 20),
    ("TTIN", 21),
    ("TTOU", 22),
    ("URG", 23),
    ("XCPU", 24),
    ("XFSZ", 25),
    ("VTALRM", 26),
    ("PROF", 27),
    ("WINCH", 28),
    ("IO", 29),
    ("POLL", 29),
    ("PWR", 30),
    ("SYS", 31),
];

/// Resolve a wire signal spec to a validated signal number.
///
/// Names are matched case-insensitively, with or without a leading `SIG`.
/// Raw numbers must appear in the table. Unrecognized values fail with
/// [`WatchdogError::InvalidSignal`].
pub fn resolve(spec: &SignalSpec) -> Result<u32, WatchdogError> {
    match spec {
        SignalSpec::Number(number) => SIGNAL_TABLE
            .iter()
            .find(|(_, n)| n == number)
            .map(|(_, n)| *n)
            .ok_or_else(|| WatchdogError::InvalidSignal(number.to_string())),
        SignalSpec::Name(name) => {
            let upper = name.to_ascii_uppercase();
            let stripped = upper.strip_prefix("SIG").unwrap_or(&upper);
            SIGNAL_TABLE
                .iter()
                .find(|(n, _)| *n == stripped)
                .map(|(_, number)| *number)
                .ok_or_else(|| WatchdogError::InvalidSignal(name.clone()))
        }
    }
}

/// Canonical name for a signal number, without the `SIG` prefix.
pub fn name_of(signal: u32) -> Option<&'static str> {
    SIGNAL_TABLE
        .iter()
        .find(|(_, n)| *n == signal)
        .map(|(name, _)| *name)
}

/// Delivers expiry signals to owning processes.
///
/// Kept behind a trait so tests can observe deliveries without signaling
/// anything.
pub trait SignalSink: Send + Sync {
    fn deliver(&self, pid: u32, signal: u32) -> std::io::Result<()>;
}

/// Real delivery via `kill(2)`.
pub struct KillSink;

impl SignalSink for KillSink {
    fn deliver(&self, pid: u32, signal: u32) -> std::io::Result<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let signal = Signal::try_from(i32::try_from(signal).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "signal out of range")
        })?)
        .map_err(std::io::Error::from)?;
        let pid = Pid::from_raw(i32::try_from(pid).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
        })?);
        signal::kill(pid, signal).map_err(std::io::Error::from)
    }
}

/// Records deliveries instead of signaling.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CountingSink {
    deliveries: std::sync::Mutex<Vec<(u32, u32)>>,
}

#[cfg(test)]
impl CountingSink {
    pub(crate) fn deliveries(&self) -> Vec<(u32, u32)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub(crate) fn count_of(&self, signal: u32) -> usize {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == signal)
            .count()
    }
}

#[cfg(test)]
impl SignalSink for CountingSink {
    fn deliver(&self, pid: u32, signal: u32) -> std::io::Result<()> {
        self.deliveries.lock().unwrap().push((pid, signal));
        Ok(())
    }
}

#[cfg(test)]
impl SignalSink for std::sync::Arc<CountingSink> {
    fn deliver(&self, pid: u32, signal: u32) -> std::io::Result<()> {
        self.as_ref().deliver(pid, signal)
    }
}

//! Session registry and deadline queue.
//!
//! [`Watchdog`] is the daemon's owned context object: the registry of open
//! sessions plus the time-ordered deadline queue the timer loop sleeps on.
//! It holds no I/O and no clock of its own — callers pass the current
//! monotonic instant — so state transitions are deterministic under test
//! and multiple instances can coexist.
//!
//! A session leaves the registry exactly once, either through
//! [`Watchdog::close`] (no signal) or [`Watchdog::expire_due`] (signal).
//! Heartbeats renew deadlines by queueing a fresh entry with a bumped
//! generation counter; superseded entries are discarded when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::protocol::WatchdogError;

pub type SessionId = u64;

/// Lifecycle position of a session. `Closed` and `Expired` are terminal;
/// sessions in the registry are always `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
    Expired,
}

/// One supervised connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Pid resolved from socket credentials at accept time; immutable.
    pub owner_pid: u32,
    pub timeout: Duration,
    pub signal: u32,
    pub info: Option<String>,
    /// Wall-clock open time (RFC 3339), for operator diagnostics only.
    pub opened_at: String,
    pub last_heartbeat: Instant,
    pub deadline: Instant,
    pub state: SessionState,
    generation: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct DeadlineEntry {
    due: Instant,
    id: SessionId,
    generation: u64,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Daemon-wide watchdog state: session registry plus deadline queue.
#[derive(Default)]
pub struct Watchdog {
    sessions: HashMap<SessionId, Session>,
    deadlines: BinaryHeap<Reverse<DeadlineEntry>>,
    next_id: SessionId,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new open session and arm its deadline.
    pub fn open(
        &mut self,
        owner_pid: u32,
        timeout: Duration,
        signal: u32,
        info: Option<String>,
        now: Instant,
    ) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = now + timeout;
        self.sessions.insert(
            id,
            Session {
                id,
                owner_pid,
                timeout,
                signal,
                info,
                opened_at: chrono::Utc::now().to_rfc3339(),
                last_heartbeat: now,
                deadline,
                state: SessionState::Open,
                generation: 0,
            },
        );
        self.deadlines.push(Reverse(DeadlineEntry {
            due: deadline,
            id,
            generation: 0,
        }));
        id
    }

    /// Renew a session: `deadline = now + timeout` (sliding window).
    ///
    /// The previous queue entry is left behind and invalidated by the
    /// generation bump.
    pub fn heartbeat(&mut self, id: SessionId, now: Instant) -> Result<(), WatchdogError> {
        let session = self.sessions.get_mut(&id).ok_or(WatchdogError::NotFound)?;
        session.last_heartbeat = now;
        session.deadline = now + session.timeout;
        session.generation += 1;
        self.deadlines.push(Reverse(DeadlineEntry {
            due: session.deadline,
            id,
            generation: session.generation,
        }));
        Ok(())
    }

    /// Retire a session as closed. Never signaled, even when its deadline
    /// has already elapsed: removal here wins any race with a not-yet-fired
    /// expiry.
    pub fn close(&mut self, id: SessionId) -> Result<Session, WatchdogError> {
        let mut session = self.sessions.remove(&id).ok_or(WatchdogError::NotFound)?;
        session.state = SessionState::Closed;
        Ok(session)
    }

    /// Earliest live deadline, discarding superseded queue entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.deadlines.peek() {
            let live = self
                .sessions
                .get(&entry.id)
                .is_some_and(|s| s.generation == entry.generation);
            if live {
                return Some(entry.due);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Retire every session whose deadline has truly elapsed at `now`.
    ///
    /// An entry superseded by a heartbeat since it was queued is discarded
    /// without touching the session. The caller delivers the returned
    /// sessions' signals after releasing its lock.
    pub fn expire_due(&mut self, now: Instant) -> Vec<Session> {
        let mut expired = Vec::new();
        loop {
            match self.deadlines.peek() {
                Some(Reverse(entry)) if entry.due <= now => {}
                _ => break,
            }
            let Some(Reverse(entry)) = self.deadlines.pop() else {
                break;
            };
            let due = self
                .sessions
                .get(&entry.id)
                .is_some_and(|s| s.generation == entry.generation && s.deadline <= now);
            if due {
                if let Some(mut session) = self.sessions.remove(&entry.id) {
                    session.state = SessionState::Expired;
                    expired.push(session);
                }
            }
        }
        expired
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

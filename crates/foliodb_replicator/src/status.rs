//! Observable replicator state: activity level, progress, last error.

use std::fmt;

use crate::error::ReplicatorError;

/// Coarse activity level of a replicator, in the style of a sync
/// engine's connection indicator.
///
/// The level moves through a fixed graph: `Stopped -> Connecting`,
/// then between `Idle`/`Busy` while the session is healthy, out to
/// `Offline` when the transport drops on a continuous session, and
/// back to `Stopped` when the session ends for any reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activity {
    /// No session is running. Terminal until the next `start`.
    Stopped,
    /// A continuous session lost its transport and is waiting to
    /// reconnect.
    Offline,
    /// The session is establishing its channel and handshaking.
    Connecting,
    /// Connected with no transfers in flight.
    Idle,
    /// Actively transferring revisions.
    Busy,
}

impl Activity {
    /// Whether a session currently exists for this level.
    pub fn is_active(self) -> bool {
        self != Activity::Stopped
    }

    /// Legal state-machine moves. Everything may fall back to
    /// `Stopped`; `Offline` is reachable only from a live session and
    /// leads back through `Connecting`.
    pub fn can_transition_to(self, next: Activity) -> bool {
        use Activity::*;
        matches!(
            (self, next),
            (Stopped, Connecting)
                | (Connecting, Idle)
                | (Connecting, Busy)
                | (Connecting, Offline)
                | (Connecting, Stopped)
                | (Idle, Busy)
                | (Idle, Offline)
                | (Idle, Stopped)
                | (Busy, Idle)
                | (Busy, Offline)
                | (Busy, Stopped)
                | (Offline, Connecting)
                | (Offline, Stopped)
        )
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activity::Stopped => "STOPPED",
            Activity::Offline => "OFFLINE",
            Activity::Connecting => "CONNECTING",
            Activity::Idle => "IDLE",
            Activity::Busy => "BUSY",
        };
        f.write_str(name)
    }
}

/// Unit counts for the current attempt. `completed` never exceeds
/// `total`, and both reset when a new attempt begins; they may end an
/// attempt short of each other when documents fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Revisions confirmed transferred so far.
    pub completed: u64,
    /// Revisions discovered for transfer so far.
    pub total: u64,
}

/// Snapshot of a replicator's externally visible state.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorStatus {
    /// Current activity level.
    pub activity: Activity,
    /// Transfer counters for the current attempt.
    pub progress: Progress,
    /// The most recent session-level error, if any. Cleared when a
    /// later attempt succeeds.
    pub error: Option<ReplicatorError>,
}

impl Default for ReplicatorStatus {
    fn default() -> Self {
        ReplicatorStatus {
            activity: Activity::Stopped,
            progress: Progress::default(),
            error: None,
        }
    }
}

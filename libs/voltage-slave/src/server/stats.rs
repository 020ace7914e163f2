//! Server counters, updated concurrently by TCP sessions

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters
#[derive(Debug, Default)]
pub struct ServerStats {
    requests: AtomicU64,
    exceptions: AtomicU64,
    frames_dropped: AtomicU64,
    broadcasts: AtomicU64,
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests decoded and dispatched
    pub requests: u64,
    /// Exception responses sent
    pub exceptions: u64,
    /// Frames discarded by a codec (checksum, format, timing)
    pub frames_dropped: u64,
    /// Broadcast requests executed
    pub broadcasts: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
}

impl ServerStats {
    pub(crate) fn record_request(&self, broadcast: bool, exception: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if broadcast {
            self.broadcasts.fetch_add(1, Ordering::Relaxed);
        }
        if exception {
            self.exceptions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_dropped(&self, frames: u64) {
        if frames > 0 {
            self.frames_dropped.fetch_add(frames, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
        }
    }
}

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A sliding window of request timestamps for one key.
///
/// Timestamps are kept in arrival order. Entries older than the window span
/// are pruned lazily on every admission check and by the periodic sweep.
#[derive(Debug, Clone, Default)]
pub struct Window {
    stamps: VecDeque<Instant>,
}

impl Window {
    /// Create a new, empty window with room for `capacity` timestamps
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            stamps: VecDeque::with_capacity(capacity),
        }
    }

    /// Drop all timestamps older than `span` relative to `now`
    pub fn prune(&mut self, now: Instant, span: Duration) {
        while let Some(oldest) = self.stamps.front() {
            if now.saturating_duration_since(*oldest) >= span {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record `now` if fewer than `max` timestamps are inside the window.
    ///
    /// Returns whether the request was admitted. The caller prunes first.
    pub fn try_push(&mut self, now: Instant, max: usize) -> bool {
        if self.stamps.len() >= max {
            return false;
        }
        self.stamps.push_back(now);
        true
    }

    /// Get the number of timestamps currently in the window
    #[must_use]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// Check if the window is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

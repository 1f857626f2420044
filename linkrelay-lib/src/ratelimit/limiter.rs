use dashmap::DashMap;
use log::debug;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{RateLimitConfig, Window};
use crate::CallerId;

/// Shortest interval between two sweeps. A zero interval would stop the
/// task before its first tick.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for the initial capacity of a fresh window
const MAX_INITIAL_CAPACITY: usize = 64;

/// Sliding-window rate limiter keyed by caller.
///
/// Each caller owns one [`Window`] inside a sharded map, so checks for
/// different callers rarely contend and a check never holds more than one
/// window's lock. Windows are pruned lazily on every check and by a periodic
/// sweep started with [`RateLimiter::spawn_sweep`].
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<CallerId, Window>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new `RateLimiter` with the given configuration
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    /// Check whether `caller` may submit another request right now.
    ///
    /// Returns `true` and records the request when fewer than
    /// `max_requests` requests fall inside the trailing window.
    #[must_use]
    pub fn allow(&self, caller: CallerId) -> bool {
        self.allow_at(caller, Instant::now())
    }

    /// Same as [`RateLimiter::allow`], evaluated at the given instant.
    ///
    /// Instants are expected to be non-decreasing per caller.
    #[must_use]
    pub fn allow_at(&self, caller: CallerId, now: Instant) -> bool {
        let mut window = self.windows.entry(caller).or_insert_with(|| {
            Window::new(self.config.max_requests.min(MAX_INITIAL_CAPACITY))
        });
        window.prune(now, self.config.window);
        window.try_push(now, self.config.max_requests)
    }

    /// Number of requests `caller` has made inside the current window
    #[must_use]
    pub fn recent_requests(&self, caller: CallerId) -> usize {
        self.windows.get(&caller).map_or(0, |window| window.len())
    }

    /// Number of callers with a window in memory
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// The configuration this limiter was created with
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Prune every window and drop the ones left empty.
    ///
    /// Returns the number of windows removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Same as [`RateLimiter::sweep`], evaluated at the given instant.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let span = self.config.window;
        let callers: Vec<CallerId> = self.windows.iter().map(|entry| *entry.key()).collect();

        callers
            .into_iter()
            .filter(|caller| {
                self.windows
                    .remove_if_mut(caller, |_, window| {
                        window.prune(now, span);
                        window.is_empty()
                    })
                    .is_some()
            })
            .count()
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The task runs every `sweep_interval`, but at most every 10ms, until
    /// the returned handle is stopped or dropped, or until the limiter itself
    /// is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    #[must_use]
    pub fn spawn_sweep(self: &Arc<Self>) -> SweepHandle {
        let period = self.config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let limiter: Weak<Self> = Arc::downgrade(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(limiter) = limiter.upgrade() else { break };
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(
                                "Rate limit sweep dropped {removed} idle windows, {} still tracked",
                                limiter.tracked_keys()
                            );
                        }
                    }
                }
            }
        });

        SweepHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Owner of the periodic sweep task.
///
/// Dropping the handle signals the task to stop as well.
#[derive(Debug)]
pub struct SweepHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Signal the sweep task to stop and wait for it to finish
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            // The task may already be gone if the limiter was dropped.
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the sweep task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

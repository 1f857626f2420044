//! Admission control for in-flight forwards.
//!
//! The controller sheds load instead of queuing it: a request that would
//! exceed the global or the per-caller ceiling is rejected immediately.
//! Granted requests hold an [`AdmissionSlot`] which gives its reservation
//! back when dropped, so a slot cannot leak through an early return, a panic
//! or a cancelled future.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::CallerId;

const DEFAULT_MAX_IN_FLIGHT: usize = 50;
const DEFAULT_MAX_PER_CALLER: usize = 5;
const DEFAULT_OVERLOAD_PERCENT: u8 = 80;

/// Ceilings for concurrent forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Maximum number of forwards in flight across all callers
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Maximum number of forwards in flight for a single caller
    #[serde(default = "default_max_per_caller")]
    pub max_per_caller: usize,

    /// Global usage, in percent of `max_in_flight`, above which the
    /// controller reports itself overloaded
    #[serde(default = "default_overload_percent")]
    pub overload_percent: u8,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            max_per_caller: default_max_per_caller(),
            overload_percent: default_overload_percent(),
        }
    }
}

const fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

const fn default_max_per_caller() -> usize {
    DEFAULT_MAX_PER_CALLER
}

const fn default_overload_percent() -> u8 {
    DEFAULT_OVERLOAD_PERCENT
}

/// A snapshot of the admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    /// Slots currently held
    pub in_flight: usize,
    /// The global ceiling
    pub max_in_flight: usize,
    /// Slots granted since start
    pub total: u64,
    /// Requests turned away since start
    pub rejected: u64,
    /// Slots released as failed
    pub errors: u64,
    /// Callers holding at least one slot
    pub active_callers: usize,
}

impl Display for AdmissionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} in flight, {} total, {} rejected, {} errors, {} active callers",
            self.in_flight,
            self.max_in_flight,
            self.total,
            self.rejected,
            self.errors,
            self.active_callers
        )
    }
}

#[derive(Debug, Default)]
struct State {
    in_flight: usize,
    per_caller: HashMap<CallerId, usize>,
    total: u64,
    rejected: u64,
    errors: u64,
}

/// Bounds the number of concurrent forwards, globally and per caller.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    state: Mutex<State>,
}

impl AdmissionController {
    /// Create a new controller
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    // Every critical section leaves the counters consistent, so a panic
    // while holding the lock cannot corrupt them.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Try to reserve a slot for `caller`.
    ///
    /// Returns `None` without waiting if either ceiling is reached.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>, caller: CallerId) -> Option<AdmissionSlot> {
        let mut state = self.lock();

        let held = state.per_caller.get(&caller).copied().unwrap_or(0);
        if state.in_flight >= self.config.max_in_flight || held >= self.config.max_per_caller {
            state.rejected += 1;
            return None;
        }

        state.in_flight += 1;
        state.total += 1;
        *state.per_caller.entry(caller).or_insert(0) += 1;
        drop(state);

        Some(AdmissionSlot {
            controller: Arc::clone(self),
            caller,
            released: false,
        })
    }

    fn release(&self, caller: CallerId, success: bool) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(held) = state.per_caller.get_mut(&caller) {
            *held = held.saturating_sub(1);
            if *held == 0 {
                state.per_caller.remove(&caller);
            }
        }
        if !success {
            state.errors += 1;
        }
    }

    /// Whether global usage is above the configured overload threshold
    #[must_use]
    pub fn is_overloaded(&self) -> bool {
        let in_flight = self.lock().in_flight;
        in_flight * 100 > self.config.max_in_flight * usize::from(self.config.overload_percent)
    }

    /// Number of slots currently held
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Number of slots currently held by `caller`
    #[must_use]
    pub fn in_flight_for(&self, caller: CallerId) -> usize {
        self.lock().per_caller.get(&caller).copied().unwrap_or(0)
    }

    /// A snapshot of all counters
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let state = self.lock();
        AdmissionStats {
            in_flight: state.in_flight,
            max_in_flight: self.config.max_in_flight,
            total: state.total,
            rejected: state.rejected,
            errors: state.errors,
            active_callers: state.per_caller.len(),
        }
    }

    /// The configured ceilings
    #[must_use]
    pub const fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

/// A reservation against both admission ceilings.
///
/// The reservation is returned exactly once: either through
/// [`AdmissionSlot::release`] or when the slot is dropped. A dropped slot
/// counts as a failed operation.
#[derive(Debug)]
#[must_use = "the slot is released as soon as it is dropped"]
pub struct AdmissionSlot {
    controller: Arc<AdmissionController>,
    caller: CallerId,
    released: bool,
}

impl AdmissionSlot {
    /// The caller this slot was granted to
    #[must_use]
    pub const fn caller(&self) -> CallerId {
        self.caller
    }

    /// Give the slot back, recording whether the operation succeeded
    pub fn release(mut self, success: bool) {
        self.released = true;
        self.controller.release(self.caller, success);
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release(self.caller, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn controller(max_in_flight: usize, max_per_caller: usize) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(AdmissionConfig {
            max_in_flight,
            max_per_caller,
            overload_percent: 80,
        }))
    }

    #[test]
    fn test_per_caller_ceiling() {
        let controller = controller(10, 2);

        let a = controller.try_acquire(1);
        let b = controller.try_acquire(1);
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(controller.try_acquire(1).is_none());
        assert!(controller.try_acquire(2).is_some());
        assert_eq!(controller.in_flight_for(1), 2);
    }

    #[test]
    fn test_global_ceiling() {
        let controller = controller(2, 5);

        let _a = controller.try_acquire(1);
        let _b = controller.try_acquire(2);
        assert!(controller.try_acquire(3).is_none());
        assert_eq!(controller.stats().rejected, 1);
    }

    #[test]
    fn test_release_and_drop() {
        let controller = controller(5, 5);

        let slot = controller.try_acquire(1).unwrap();
        slot.release(true);
        let slot = controller.try_acquire(1).unwrap();
        drop(slot);

        assert_eq!(
            controller.stats(),
            AdmissionStats {
                in_flight: 0,
                max_in_flight: 5,
                total: 2,
                rejected: 0,
                errors: 1,
                active_callers: 0,
            }
        );
    }

    #[test]
    fn test_overload_threshold() {
        let controller = controller(10, 10);
        let mut slots = Vec::new();

        for _ in 0..8 {
            slots.push(controller.try_acquire(1).unwrap());
        }
        // 80% is not above the threshold yet
        assert!(!controller.is_overloaded());

        slots.push(controller.try_acquire(1).unwrap());
        assert!(controller.is_overloaded());

        slots.clear();
        assert!(!controller.is_overloaded());
    }

    #[test]
    fn test_slot_released_on_panic() {
        let controller = controller(5, 5);
        let inner = Arc::clone(&controller);

        let result = std::panic::catch_unwind(move || {
            let slot = inner.try_acquire(1);
            assert!(slot.is_none(), "operation failed while holding a slot");
        });

        assert!(result.is_err());
        assert_eq!(controller.in_flight(), 0);
    }

    #[test]
    fn test_stats_display() {
        let controller = controller(50, 5);
        let _slot = controller.try_acquire(3);
        assert_eq!(
            controller.stats().to_string(),
            "1/50 in flight, 1 total, 0 rejected, 0 errors, 1 active callers"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquirers() {
        const ACQUIRERS: usize = 32;
        const CEILING: usize = 5;

        let controller = controller(CEILING, ACQUIRERS);
        let held = Arc::new(Barrier::new(ACQUIRERS));

        let tasks: Vec<_> = (0..ACQUIRERS)
            .map(|i| {
                let controller = Arc::clone(&controller);
                let held = Arc::clone(&held);
                tokio::spawn(async move {
                    let slot = controller.try_acquire(i as CallerId);
                    let granted = slot.is_some();
                    // Keep every slot until all acquirers have tried
                    held.wait().await;
                    drop(slot);
                    granted
                })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, CEILING);
        assert_eq!(controller.stats().rejected, (ACQUIRERS - CEILING) as u64);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_slot_released_on_cancellation() {
        let controller = controller(5, 5);
        let inner = Arc::clone(&controller);

        let operation = async move {
            let _slot = inner.try_acquire(1);
            tokio::time::sleep(Duration::from_secs(60)).await;
        };
        let result = tokio::time::timeout(Duration::from_millis(20), operation).await;

        assert!(result.is_err());
        assert_eq!(controller.in_flight(), 0);
        assert_eq!(controller.in_flight_for(1), 0);
    }
}

//! Collaborators of the gateway: where endpoint configurations come from
//! and where outcomes go.
//!
//! Both are traits so the embedding application can plug in its own
//! storage. The in-memory implementations keep everything in the process
//! and are enough for a single instance and for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use crate::{CallerId, EndpointConfig, ForwardOutcome};

/// Number of records [`MemoryOutcomeSink`] keeps by default
const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Source of per-caller endpoint configurations.
///
/// Read on every forward, so changes take effect with the next submission.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The endpoint configured by `caller`, if any
    async fn endpoint_config(&self, caller: CallerId) -> Option<EndpointConfig>;

    /// Store the endpoint of `caller`. Returns whether it was saved.
    async fn save_endpoint_config(&self, caller: CallerId, config: EndpointConfig) -> bool;
}

/// Destination of forward outcomes
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    /// Record a finished forward attempt
    async fn record_outcome(&self, caller: CallerId, link: &str, outcome: &ForwardOutcome);

    /// Count a finished forward attempt in the caller's running totals
    async fn increment_stats(&self, caller: CallerId, success: bool);
}

/// A [`ConfigStore`] backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    configs: DashMap<CallerId, EndpointConfig>,
}

impl MemoryConfigStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the endpoint of `caller`. Returns whether one was configured.
    pub fn remove(&self, caller: CallerId) -> bool {
        self.configs.remove(&caller).is_some()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn endpoint_config(&self, caller: CallerId) -> Option<EndpointConfig> {
        self.configs.get(&caller).map(|config| config.value().clone())
    }

    async fn save_endpoint_config(&self, caller: CallerId, config: EndpointConfig) -> bool {
        self.configs.insert(caller, config);
        true
    }
}

/// Whether a recorded forward succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    /// The service accepted the link
    Success,
    /// The link was not delivered
    Failed,
}

/// One forward attempt, as kept by [`MemoryOutcomeSink`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardRecord {
    /// Who submitted the link
    pub caller: CallerId,
    /// The submitted link
    pub link: String,
    /// How the attempt ended
    pub status: ForwardStatus,
    /// The outcome message
    pub message: String,
    /// When the attempt was recorded
    pub created_at: SystemTime,
}

/// Running totals of one caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallerStats {
    /// Finished forward attempts
    pub total: u64,
    /// Attempts the service accepted
    pub successful: u64,
    /// Attempts that failed for any reason
    pub failed: u64,
    /// When the last attempt finished
    pub last_forward_at: Option<SystemTime>,
}

/// An [`OutcomeSink`] keeping records and totals in memory.
///
/// Only the most recent records are kept, 10 000 unless configured with
/// [`MemoryOutcomeSink::with_max_records`]. The oldest record is dropped
/// when a new one would exceed the limit. Totals cover every attempt.
#[derive(Debug)]
pub struct MemoryOutcomeSink {
    records: Mutex<VecDeque<ForwardRecord>>,
    max_records: usize,
    stats: DashMap<CallerId, CallerStats>,
}

impl Default for MemoryOutcomeSink {
    fn default() -> Self {
        Self::with_max_records(DEFAULT_MAX_RECORDS)
    }
}

impl MemoryOutcomeSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty sink keeping at most `max_records` records
    #[must_use]
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_records,
            stats: DashMap::new(),
        }
    }

    /// All records of `caller`, oldest first
    #[must_use]
    pub fn records_for(&self, caller: CallerId) -> Vec<ForwardRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|record| record.caller == caller)
            .cloned()
            .collect()
    }

    /// The `limit` most recent records of `caller`, newest first
    #[must_use]
    pub fn recent_records(&self, caller: CallerId, limit: usize) -> Vec<ForwardRecord> {
        let mut records = self.records_for(caller);
        records.reverse();
        records.truncate(limit);
        records
    }

    /// Running totals of `caller`
    #[must_use]
    pub fn stats_for(&self, caller: CallerId) -> CallerStats {
        self.stats
            .get(&caller)
            .map(|stats| *stats.value())
            .unwrap_or_default()
    }

    /// Number of records across all callers
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing was recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutcomeSink for MemoryOutcomeSink {
    async fn record_outcome(&self, caller: CallerId, link: &str, outcome: &ForwardOutcome) {
        let record = ForwardRecord {
            caller,
            link: link.to_string(),
            status: if outcome.is_success() {
                ForwardStatus::Success
            } else {
                ForwardStatus::Failed
            },
            message: outcome.message().to_string(),
            created_at: SystemTime::now(),
        };
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push_back(record);
        while records.len() > self.max_records {
            records.pop_front();
        }
    }

    async fn increment_stats(&self, caller: CallerId, success: bool) {
        let mut stats = self.stats.entry(caller).or_default();
        stats.total += 1;
        if success {
            stats.successful += 1;
        } else {
            stats.failed += 1;
        }
        stats.last_forward_at = Some(SystemTime::now());
    }
}

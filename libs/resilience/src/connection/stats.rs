use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{AsRefStr, Display, EnumIter};

use super::connector::PoolUsage;
use crate::common::RingBuffer;

/// Lifecycle of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReadyState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Operation family used to key counters and latency samples.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Find,
    Insert,
    Update,
    Delete,
    Aggregate,
    Command,
    Transaction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationCounters {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Extra attempts spent on retries
    pub retried: u64,
    pub avg_latency_ms: f64,
}

/// Summary of a latency window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg_ms: f64,
    pub p95_ms: u64,
    pub max_ms: u64,
    pub last_ms: Option<u64>,
}

impl LatencySummary {
    pub fn from_samples(buffer: &RingBuffer<u64>) -> Self {
        if buffer.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<u64> = buffer.iter().copied().collect();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        let p95_index = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);

        Self {
            samples: sorted.len(),
            avg_ms: sum as f64 / sorted.len() as f64,
            p95_ms: sorted[p95_index.min(sorted.len() - 1)],
            max_ms: sorted[sorted.len() - 1],
            last_ms: buffer.latest().copied(),
        }
    }
}

/// Read-only snapshot of the connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub is_connected: bool,
    pub ready_state: ReadyState,
    pub operations: BTreeMap<OperationKind, OperationCounters>,
    pub failure_count: u64,
    pub reconnect_count: u64,
    pub latency: LatencySummary,
    pub pool: PoolUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
}

impl ConnectionStats {
    /// Stats for a manager that never connected.
    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            ready_state: ReadyState::Disconnected,
            operations: BTreeMap::new(),
            failure_count: 0,
            reconnect_count: 0,
            latency: LatencySummary::default(),
            pool: PoolUsage::default(),
            last_error: None,
            connected_since: None,
        }
    }

    pub fn total_operations(&self) -> u64 {
        self.operations.values().map(|c| c.total).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.operations.values().map(|c| c.failed).sum()
    }
}

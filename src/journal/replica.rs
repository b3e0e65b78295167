//! Replica bookkeeping: follower lag, sync planning and promotion.
//!
//! Only the control plane lives here. Moving bytes to a follower is delegated
//! to a [`ReplicaTransport`] supplied by the host; without one, a sync pass
//! only refreshes lag figures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::entry::JournalEntry;
use crate::error::{JournalError, Result};
use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    Primary,
    Secondary,
    Standalone,
}

impl ReplicaRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            "standalone" => Some(Self::Standalone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaInfo {
    pub id: String,
    pub endpoint: String,
    pub role: ReplicaRole,
    pub last_sync_sequence: u64,
    pub last_sync_time: Option<u64>,
    pub is_healthy: bool,
    pub lag: u64,
}

/// Ships entries to a follower. Implemented by the transport layer.
pub trait ReplicaTransport: Send + Sync {
    fn send(&self, replica: &ReplicaInfo, entries: &[JournalEntry]) -> anyhow::Result<()>;
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub replicas: usize,
    pub entries_shipped: u64,
    pub failures: usize,
    pub max_lag: u64,
}

/// Retry configuration for transport sends
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// Calculate delay with exponential backoff and jitter
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Retry a fallible blocking operation with exponential backoff
pub fn retry_blocking<T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: impl FnMut() -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                log(
                    Level::Warn,
                    Domain::Replica,
                    "retry",
                    obj(&[
                        ("operation", v_str(operation_name)),
                        ("attempt", json!(attempt + 1)),
                        ("max_attempts", json!(config.max_retries + 1)),
                        ("error", v_str(&e.to_string())),
                        ("delay_ms", json!(delay.as_millis() as u64)),
                    ]),
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct ReplicaCoordinator {
    role: ReplicaRole,
    replicas: BTreeMap<String, ReplicaInfo>,
    transport: Option<Arc<dyn ReplicaTransport>>,
    retry: RetryConfig,
}

impl ReplicaCoordinator {
    pub fn new(role: ReplicaRole) -> Self {
        Self {
            role,
            replicas: BTreeMap::new(),
            transport: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn set_transport(&mut self, transport: Arc<dyn ReplicaTransport>, retry: RetryConfig) {
        self.transport = Some(transport);
        self.retry = retry;
    }

    pub(crate) fn transport(&self) -> Option<(Arc<dyn ReplicaTransport>, RetryConfig)> {
        self.transport.as_ref().map(|t| (t.clone(), self.retry.clone()))
    }

    /// Register (or re-register) a follower that has synced up to `last_sync_sequence`.
    pub fn register(&mut self, id: &str, endpoint: &str, last_sync_sequence: u64, local_sequence: u64) -> ReplicaInfo {
        let info = ReplicaInfo {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            role: ReplicaRole::Secondary,
            last_sync_sequence,
            last_sync_time: None,
            is_healthy: true,
            lag: local_sequence.saturating_sub(last_sync_sequence),
        };
        self.replicas.insert(id.to_string(), info.clone());
        log(
            Level::Info,
            Domain::Replica,
            "replica_registered",
            obj(&[
                ("replica_id", v_str(id)),
                ("endpoint", v_str(endpoint)),
                ("lag", json!(info.lag)),
            ]),
        );
        info
    }

    pub fn unregister(&mut self, id: &str) -> Option<ReplicaInfo> {
        let removed = self.replicas.remove(id);
        if removed.is_some() {
            log(
                Level::Info,
                Domain::Replica,
                "replica_unregistered",
                obj(&[("replica_id", v_str(id))]),
            );
        }
        removed
    }

    /// Record a follower's acknowledgement. Acks never move a follower backwards.
    pub fn acknowledge(&mut self, id: &str, sequence: u64, local_sequence: u64, now_ms: u64) -> Result<ReplicaInfo> {
        let info = self
            .replicas
            .get_mut(id)
            .ok_or_else(|| JournalError::ReplicaNotFound(id.to_string()))?;
        info.last_sync_sequence = info.last_sync_sequence.max(sequence.min(local_sequence));
        info.last_sync_time = Some(now_ms);
        info.is_healthy = true;
        info.lag = local_sequence.saturating_sub(info.last_sync_sequence);
        Ok(info.clone())
    }

    pub(crate) fn mark_failed(&mut self, id: &str) {
        if let Some(info) = self.replicas.get_mut(id) {
            info.is_healthy = false;
        }
    }

    /// Refresh lag for every follower and return those that are behind,
    /// with the first sequence each one is missing.
    pub fn plan_sync(&mut self, local_sequence: u64) -> Vec<(ReplicaInfo, u64)> {
        let mut plan = Vec::new();
        for info in self.replicas.values_mut() {
            info.lag = local_sequence.saturating_sub(info.last_sync_sequence);
            if info.lag > 0 && info.role == ReplicaRole::Secondary {
                plan.push((info.clone(), info.last_sync_sequence + 1));
            }
        }
        plan
    }

    /// Promote a follower to primary if it is within `max_lag` entries.
    pub fn promote(&mut self, id: &str, local_sequence: u64, max_lag: u64) -> Result<ReplicaInfo> {
        let info = self
            .replicas
            .get_mut(id)
            .ok_or_else(|| JournalError::ReplicaNotFound(id.to_string()))?;
        let lag = local_sequence.saturating_sub(info.last_sync_sequence);
        info.lag = lag;
        if lag > max_lag {
            return Err(JournalError::PromotionRefused {
                replica_id: id.to_string(),
                lag,
                max_lag,
            });
        }
        info.role = ReplicaRole::Primary;
        let promoted = info.clone();
        self.role = ReplicaRole::Secondary;
        log(
            Level::Warn,
            Domain::Replica,
            "replica_promoted",
            obj(&[("replica_id", v_str(id)), ("lag", json!(lag))]),
        );
        Ok(promoted)
    }

    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        self.replicas.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&ReplicaInfo> {
        self.replicas.get(id)
    }
}

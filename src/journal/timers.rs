//! Periodic checkpoint and replica-sync tasks.
//!
//! Journal calls block on file I/O, so each tick hands the work to the
//! blocking pool. Failures are logged and the loop keeps ticking; only a
//! closed journal ends a task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::replica::ReplicaRole;
use super::Journal;
use crate::error::JournalError;
use crate::logging::{log, obj, v_str, Domain, Level};

/// Handles for the maintenance tasks. Dropping it leaves the tasks running.
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Start the checkpoint timer and, when configured, the sync timer. Must be
/// called from within a tokio runtime.
pub fn spawn_maintenance(journal: Arc<Journal>) -> MaintenanceHandle {
    let mut tasks = Vec::new();
    let checkpoint_every = journal.config().checkpoint_interval;
    let sync_every = journal.config().sync_interval;

    if !checkpoint_every.is_zero() {
        tasks.push(tokio::spawn(checkpoint_loop(journal.clone(), checkpoint_every)));
    }
    if !sync_every.is_zero() {
        tasks.push(tokio::spawn(sync_loop(journal, sync_every)));
    }
    MaintenanceHandle { tasks }
}

async fn checkpoint_loop(journal: Arc<Journal>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        // Nothing new since the last checkpoint.
        let last = journal.last_sequence();
        if journal.checkpoints().last().map(|c| c.sequence) == Some(last) {
            continue;
        }

        let j = journal.clone();
        match tokio::task::spawn_blocking(move || j.create_checkpoint(None)).await {
            Ok(Ok(cp)) => log(
                Level::Debug,
                Domain::Checkpoint,
                "timer_checkpoint",
                obj(&[("checkpoint_id", v_str(&cp.checkpoint_id)), ("sequence", json!(cp.sequence))]),
            ),
            Ok(Err(JournalError::Closed)) => break,
            Ok(Err(JournalError::Busy(state))) => log(
                Level::Debug,
                Domain::Checkpoint,
                "timer_checkpoint_deferred",
                obj(&[("state", json!(state))]),
            ),
            Ok(Err(e)) => log(
                Level::Error,
                Domain::Checkpoint,
                "timer_checkpoint_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            ),
            Err(e) => log(
                Level::Error,
                Domain::Checkpoint,
                "timer_task_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            ),
        }
    }
}

async fn sync_loop(journal: Arc<Journal>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        // Role can change at runtime through promotion.
        if journal.role() != ReplicaRole::Primary || journal.replicas().is_empty() {
            continue;
        }

        let j = journal.clone();
        match tokio::task::spawn_blocking(move || j.sync_replicas()).await {
            Ok(Ok(report)) => log(
                Level::Debug,
                Domain::Replica,
                "timer_sync",
                obj(&[
                    ("replicas", json!(report.replicas)),
                    ("shipped", json!(report.entries_shipped)),
                    ("failures", json!(report.failures)),
                    ("max_lag", json!(report.max_lag)),
                ]),
            ),
            Ok(Err(JournalError::Closed)) => break,
            Ok(Err(e)) => log(
                Level::Warn,
                Domain::Replica,
                "timer_sync_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            ),
            Err(e) => log(
                Level::Error,
                Domain::Replica,
                "timer_task_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::journal::entry::EventMetadata;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checkpoint_timer_fires() {
        let dir = TempDir::new().unwrap();
        let mut cfg = JournalConfig::new(dir.path());
        cfg.checkpoint_interval = Duration::from_millis(20);
        cfg.sync_interval = Duration::ZERO;
        let journal = Arc::new(Journal::open(cfg).unwrap());
        journal.append("tick", json!(1), EventMetadata::default()).unwrap();

        let handle = spawn_maintenance(journal.clone());
        assert_eq!(handle.task_count(), 1);

        let mut waited = 0;
        while journal.checkpoints().is_empty() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        handle.abort();

        let cps = journal.checkpoints();
        assert_eq!(cps.len(), 1);
        assert_eq!(cps[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_zero_intervals_spawn_nothing() {
        let dir = TempDir::new().unwrap();
        let mut cfg = JournalConfig::new(dir.path());
        cfg.checkpoint_interval = Duration::ZERO;
        cfg.sync_interval = Duration::ZERO;
        let journal = Arc::new(Journal::open(cfg).unwrap());
        assert_eq!(spawn_maintenance(journal).task_count(), 0);
    }
}

//! Lock-lease sweeper
//!
//! A worker that dies while holding a folder lock leaves the folder locked
//! forever. The sweeper periodically force-releases locks older than the
//! lease TTL so another worker can pick the folder up.

use crate::{SchedulerEvent, SchedulerResult};
use foldex_core::{FolderIndexCoordinator, FolderKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

pub struct LeaseSweeper {
    coordinator: Arc<FolderIndexCoordinator>,
    ttl: Duration,
    sweep_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl LeaseSweeper {
    pub fn new(
        coordinator: Arc<FolderIndexCoordinator>,
        ttl: Duration,
        sweep_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            coordinator,
            ttl,
            sweep_interval,
            shutdown_rx,
            event_tx: None,
        }
    }

    /// Report each sweep that released locks
    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Release every expired lock once
    pub async fn sweep_once(&self) -> SchedulerResult<Vec<FolderKey>> {
        let released = self.coordinator.sweep_expired_locks(self.ttl).await?;
        if !released.is_empty() {
            if let Some(event_tx) = &self.event_tx {
                let _ = event_tx
                    .send(SchedulerEvent::LocksSwept {
                        count: released.len(),
                    })
                    .await;
            }
        }
        Ok(released)
    }

    /// Sweep on every interval tick until shutdown is signalled
    pub async fn run(mut self) {
        info!(
            "Lease sweeper started (ttl {:?}, every {:?})",
            self.ttl, self.sweep_interval
        );

        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Lease sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Lease sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldex_core::{FolderScope, ManualClock, MemoryStore};

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_until_shutdown() {
        let clock = Arc::new(ManualClock::new(0));
        let coordinator = Arc::new(
            FolderIndexCoordinator::new(Arc::new(MemoryStore::new())).with_clock(clock.clone()),
        );
        let key = FolderScope::new(1, 2, 19, "default0").folder("INBOX");
        assert!(coordinator.lock(&key).await.unwrap());
        clock.set(120_000);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let sweeper = LeaseSweeper::new(
            coordinator.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30),
            shutdown_rx,
        )
        .with_events(event_tx);
        let handle = tokio::spawn(sweeper.run());

        assert_eq!(event_rx.recv().await, Some(SchedulerEvent::LocksSwept { count: 1 }));
        assert!(!coordinator.is_locked(&key).await.unwrap());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_once_keeps_fresh_locks() {
        let clock = Arc::new(ManualClock::new(0));
        let coordinator = Arc::new(
            FolderIndexCoordinator::new(Arc::new(MemoryStore::new())).with_clock(clock.clone()),
        );
        let scope = FolderScope::new(1, 2, 19, "default0");
        assert!(coordinator.lock(&scope.folder("old")).await.unwrap());
        clock.set(50_000);
        assert!(coordinator.lock(&scope.folder("new")).await.unwrap());
        clock.set(70_000);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = LeaseSweeper::new(
            coordinator.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30),
            shutdown_rx,
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), vec![scope.folder("old")]);
        assert!(coordinator.is_locked(&scope.folder("new")).await.unwrap());
    }
}

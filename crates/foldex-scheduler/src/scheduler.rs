//! Staleness scheduler
//!
//! Periodically asks the coordinator which folders of the watched scopes
//! were not refreshed within the staleness window and hands each of them to
//! the workers as an [`IndexJob`].

use foldex_core::{FolderIndexCoordinator, FolderKey, FolderScope};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A folder due for (re)indexing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexJob {
    pub key: FolderKey,
}

/// Commands sent to the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    /// Start scanning a scope
    Watch(FolderScope),
    /// Stop scanning a scope
    Unwatch(FolderScope),
    /// Scan every watched scope immediately
    ScanNow,
    /// Stop the scheduler
    Shutdown,
}

/// Events sent from the scheduler and the sweeper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Jobs were queued for a scope
    JobsDispatched { scope: FolderScope, count: usize },
    /// Scanning a scope failed; it is retried on the next tick
    ScanFailed { scope: FolderScope, error: String },
    /// Expired locks were force-released
    LocksSwept { count: usize },
}

/// Scheduler that runs in a background tokio task
pub struct StalenessScheduler {
    coordinator: Arc<FolderIndexCoordinator>,
    staleness: Duration,
    scan_interval: Duration,
    watched: BTreeSet<FolderScope>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    job_tx: mpsc::Sender<IndexJob>,
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl StalenessScheduler {
    pub fn new(
        coordinator: Arc<FolderIndexCoordinator>,
        staleness: Duration,
        scan_interval: Duration,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        job_tx: mpsc::Sender<IndexJob>,
        event_tx: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        Self {
            coordinator,
            staleness,
            scan_interval,
            watched: BTreeSet::new(),
            command_rx,
            job_tx,
            event_tx,
        }
    }

    /// Run until shut down, or until the command or job channel closes
    pub async fn run(mut self) {
        info!("Staleness scheduler started");

        let mut ticker = interval_at(Instant::now() + self.scan_interval, self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let keep_running = tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(SchedulerCommand::Shutdown) | None => {
                        info!("Staleness scheduler shutting down");
                        false
                    }
                    Some(command) => self.handle_command(command).await,
                },
                _ = ticker.tick() => self.scan_all().await,
            };
            if !keep_running {
                break;
            }
        }

        info!("Staleness scheduler stopped");
    }

    /// Handle a command, returning whether to keep running
    async fn handle_command(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::Watch(scope) => {
                debug!("Watching {}", scope);
                self.watched.insert(scope);
                true
            }
            SchedulerCommand::Unwatch(scope) => {
                debug!("No longer watching {}", scope);
                self.watched.remove(&scope);
                true
            }
            SchedulerCommand::ScanNow => self.scan_all().await,
            SchedulerCommand::Shutdown => false,
        }
    }

    /// Scan every watched scope, returning false once nobody takes jobs
    async fn scan_all(&mut self) -> bool {
        let staleness = i64::try_from(self.staleness.as_millis()).unwrap_or(i64::MAX);
        let threshold = self.coordinator.now().saturating_sub(staleness);

        for scope in &self.watched {
            let folders = match self.coordinator.get_elapsed_folders(scope, threshold).await {
                Ok(folders) => folders,
                Err(e) => {
                    error!("Scanning {} for stale folders failed: {}", scope, e);
                    let _ = self
                        .event_tx
                        .send(SchedulerEvent::ScanFailed {
                            scope: scope.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    continue;
                }
            };

            let count = folders.len();
            for folder in folders {
                let job = IndexJob {
                    key: scope.folder(folder),
                };
                if self.job_tx.send(job).await.is_err() {
                    warn!("Job queue closed, stopping scheduler");
                    return false;
                }
            }

            if count > 0 {
                debug!("Dispatched {} index jobs for {}", count, scope);
                let _ = self
                    .event_tx
                    .send(SchedulerEvent::JobsDispatched {
                        scope: scope.clone(),
                        count,
                    })
                    .await;
            }
        }

        true
    }
}

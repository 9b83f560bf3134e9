//! Detection scheduling: the command channel, drain loop, and run execution.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use driftwatch_common::{DriftConfiguration, Error, ResourceId, Result};
use driftwatch_scan::{Baseline, DriftCategory, DriftScanner};
use driftwatch_store::ChangeSetStore;

use crate::gate::SyncGate;
use crate::schedule::{DetectionSchedule, ScheduleKey, ScheduleQueue};

/// Commands accepted by the scheduler drain loop.
#[derive(Debug)]
pub(crate) enum Command {
    Schedule {
        resource_id: ResourceId,
        config: DriftConfiguration,
    },
    Unschedule {
        resource_id: ResourceId,
        config_name: String,
    },
    Update {
        resource_id: ResourceId,
        config: DriftConfiguration,
    },
    RequestImmediate {
        resource_id: ResourceId,
        config: DriftConfiguration,
    },
    Release {
        key: ScheduleKey,
    },
    RunFinished {
        key: ScheduleKey,
        blocked: bool,
    },
    Shutdown,
}

/// Handle for submitting scheduling operations.
///
/// Cheap to clone; every operation is a message to the single drain loop
/// that owns the due-order structure.
#[derive(Clone)]
pub struct DetectionScheduler {
    command_tx: mpsc::Sender<Command>,
}

impl DetectionScheduler {
    pub(crate) fn new(command_tx: mpsc::Sender<Command>) -> Self {
        Self { command_tx }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::InvalidInput("Detection scheduler is not running".to_string()))
    }

    /// Start periodic detection for a configuration.
    pub async fn schedule(&self, resource_id: ResourceId, config: DriftConfiguration) -> Result<()> {
        self.send(Command::Schedule {
            resource_id,
            config,
        })
        .await
    }

    /// Stop detection for a configuration. An in-flight run completes but
    /// does not reschedule.
    pub async fn unschedule(&self, resource_id: ResourceId, config_name: &str) -> Result<()> {
        self.send(Command::Unschedule {
            resource_id,
            config_name: config_name.to_string(),
        })
        .await
    }

    /// Replace a configuration's interval/filters without resetting its due
    /// time. Disabling a configuration behaves as unschedule.
    pub async fn update(&self, resource_id: ResourceId, config: DriftConfiguration) -> Result<()> {
        self.send(Command::Update {
            resource_id,
            config,
        })
        .await
    }

    /// Order a configuration ahead of later-due entries. Does not interrupt
    /// a run already executing, and does not lift a gate block.
    pub async fn request_immediate(
        &self,
        resource_id: ResourceId,
        config: DriftConfiguration,
    ) -> Result<()> {
        self.send(Command::RequestImmediate {
            resource_id,
            config,
        })
        .await
    }

    /// Release a blocked configuration back into the due-order. Called by
    /// the synchronization gate once a change set is fully acknowledged.
    pub(crate) async fn release(&self, key: ScheduleKey) -> Result<()> {
        self.send(Command::Release { key }).await
    }

    /// Stop the drain loop.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
    }
}

/// Executes one detection run: scan, diff, persist, ship.
pub(crate) struct DetectionRunner {
    store: Arc<ChangeSetStore>,
    gate: Arc<SyncGate>,
    install_dir: PathBuf,
    /// In-memory previous-snapshot pointers, advanced only after a durable
    /// store write.
    baselines: Mutex<HashMap<ScheduleKey, Baseline>>,
}

impl DetectionRunner {
    pub(crate) fn new(store: Arc<ChangeSetStore>, gate: Arc<SyncGate>, install_dir: PathBuf) -> Self {
        Self {
            store,
            gate,
            install_dir,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn gate(&self) -> &Arc<SyncGate> {
        &self.gate
    }

    async fn previous_baseline(&self, key: &ScheduleKey) -> Result<Option<Baseline>> {
        {
            let cache = self.baselines.lock().await;
            if let Some(baseline) = cache.get(key) {
                return Ok(Some(baseline.clone()));
            }
        }

        // First run for this configuration since startup; recover the
        // baseline the last durable write established, if any.
        let loaded = self
            .store
            .load_baseline(key.resource_id, &key.config_name)
            .await?;
        if let Some(baseline) = &loaded {
            let mut cache = self.baselines.lock().await;
            cache.insert(key.clone(), baseline.clone());
        }
        Ok(loaded)
    }

    /// Execute a detection run. Returns whether the configuration is now
    /// blocked awaiting acknowledgment.
    pub(crate) async fn execute(&self, schedule: DetectionSchedule) -> Result<bool> {
        let key = schedule.key.clone();
        let started = Instant::now();

        let previous = self.previous_baseline(&key).await?;

        let scanner = DriftScanner::new(key.resource_id, schedule.config, &self.install_dir);
        let basedir = scanner.basedir().to_path_buf();

        // The walk and digesting are blocking I/O; keep them off the
        // scheduler's coordinating thread.
        let generated = tokio::task::spawn_blocking(move || scanner.generate(previous.as_ref()))
            .await
            .map_err(|e| Error::Scan(format!("Detection task failed: {}", e)))??;

        let Some(generated) = generated else {
            debug!(
                "No drift detected for {} in {:?}",
                key,
                started.elapsed()
            );
            return Ok(false);
        };

        let change_set = &generated.change_set;
        let (mut added, mut changed, mut deleted) = (0, 0, 0);
        for entry in &change_set.entries {
            match entry.category {
                DriftCategory::Added => added += 1,
                DriftCategory::Changed => changed += 1,
                DriftCategory::Deleted => deleted += 1,
                DriftCategory::Unchanged => {}
            }
        }

        let handle = self
            .store
            .write(change_set, &basedir, &generated.baseline)
            .await?;

        // The write is durable; only now may the diff baseline advance.
        {
            let mut cache = self.baselines.lock().await;
            cache.insert(key.clone(), generated.baseline);
        }

        info!(
            "Generated {} change set version {} for {} in {:?}: {} entries ({} added, {} changed, {} deleted)",
            change_set.category,
            change_set.version,
            key,
            started.elapsed(),
            change_set.entries.len(),
            added,
            changed,
            deleted
        );

        self.gate.ship(&handle, change_set).await?;
        Ok(true)
    }
}

/// The scheduler background task: owns the due-order structure and drains
/// due entries into detection runs.
pub struct DetectionSchedulerHandle {
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    queue: ScheduleQueue,
    runner: Arc<DetectionRunner>,
}

impl DetectionSchedulerHandle {
    pub(crate) fn new(
        command_rx: mpsc::Receiver<Command>,
        command_tx: mpsc::Sender<Command>,
        runner: Arc<DetectionRunner>,
    ) -> Self {
        Self {
            command_rx,
            command_tx,
            queue: ScheduleQueue::new(),
            runner,
        }
    }

    /// Run the drain loop. This should be spawned in a tokio task.
    pub async fn run(mut self) {
        info!("Drift detection scheduler started");

        loop {
            let next_due = self.queue.next_due_time();

            tokio::select! {
                maybe_command = self.command_rx.recv() => {
                    match maybe_command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }

                _ = Self::wait_until(next_due) => {
                    self.dispatch_due();
                }
            }
        }

        info!("Drift detection scheduler shutting down");
    }

    async fn wait_until(next_due: Option<Instant>) {
        match next_due {
            Some(at) => tokio::time::sleep_until(at).await,
            // No schedules; sleep long, a command will wake the loop.
            None => tokio::time::sleep(Duration::from_secs(3600)).await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Schedule {
                resource_id,
                config,
            } => {
                if !config.enabled {
                    debug!(
                        "Ignoring schedule request for disabled configuration {}:{}",
                        resource_id, config.name
                    );
                    return;
                }
                let key = ScheduleKey::new(resource_id, config.name.clone());
                let blocked = self.runner.gate().is_pending(&key).await;
                debug!(
                    "Scheduling drift detection for {} (interval {:?}, blocked: {})",
                    key, config.interval, blocked
                );
                self.queue.schedule(key, config, blocked, Instant::now());
            }

            Command::Unschedule {
                resource_id,
                config_name,
            } => {
                let key = ScheduleKey::new(resource_id, config_name);
                if self.queue.unschedule(&key) {
                    debug!("Unscheduled drift detection for {}", key);
                }
            }

            Command::Update {
                resource_id,
                config,
            } => {
                let key = ScheduleKey::new(resource_id, config.name.clone());
                if !config.enabled {
                    info!("Configuration {} disabled; unscheduling", key);
                    self.queue.unschedule(&key);
                    return;
                }
                let unchanged = matches!(
                    self.queue.get(&key),
                    Some(existing) if !existing.config.differs_from(&config, false)
                );
                if unchanged {
                    debug!("Configuration {} unchanged; leaving schedule as is", key);
                } else if self.queue.update(&key, config) {
                    debug!("Updated configuration for {}", key);
                } else {
                    warn!("Update for unknown configuration {}; ignoring", key);
                }
            }

            Command::RequestImmediate {
                resource_id,
                config,
            } => {
                let key = ScheduleKey::new(resource_id, config.name.clone());
                if self.runner.gate().is_pending(&key).await {
                    warn!(
                        "Immediate detection for {} ignored: previous change set unacknowledged",
                        key
                    );
                    return;
                }
                debug!("Immediate detection requested for {}", key);
                self.queue.request_immediate(key, config, Instant::now());
            }

            Command::Release { key } => {
                debug!("Releasing {} back into the due-order", key);
                self.queue.release(&key, Instant::now());
            }

            Command::RunFinished { key, blocked } => {
                // The ack can land before the completion message is
                // processed; a release against a still-running entry is a
                // no-op, so re-check the gate here.
                let blocked = blocked && self.runner.gate().is_pending(&key).await;
                self.queue.complete(&key, blocked, Instant::now());
            }

            Command::Shutdown => unreachable!("Shutdown is handled by the run loop"),
        }
    }

    fn dispatch_due(&mut self) {
        let due = self.queue.pop_due(Instant::now());
        for schedule in due {
            let runner = self.runner.clone();
            let completion_tx = self.command_tx.clone();
            tokio::spawn(async move {
                let key = schedule.key.clone();
                let blocked = match runner.execute(schedule).await {
                    Ok(blocked) => blocked,
                    Err(e) => {
                        // Scan, digest, and persistence failures are logged
                        // and retried at the next natural tick; the drain
                        // loop keeps servicing other configurations.
                        error!("Drift detection run for {} failed: {}", key, e);
                        false
                    }
                };
                let _ = completion_tx
                    .send(Command::RunFinished { key, blocked })
                    .await;
            });
        }
    }
}

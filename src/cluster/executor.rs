//! Background control loop driving the chunk replicator.

use super::enablement::{DisableReason, EnablementGate, EnablementVerdict};
use super::job::{JobReport, ScheduleJobsResult};
use super::replicator::{ChunkReplicator, ScanPassStats, UpdateChunkPropertiesRequest};
use crate::error::Result;
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Commits computed chunk properties to the metadata store.
#[async_trait]
pub trait PropertiesCommitter: Send + Sync {
    /// Only the active leader computes and commits property updates.
    fn is_active_leader(&self) -> bool;

    async fn commit(&self, request: &UpdateChunkPropertiesRequest) -> Result<()>;
}

/// Committer for a standalone replicator: always leader, commits in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCommitter;

#[async_trait]
impl PropertiesCommitter for LocalCommitter {
    fn is_active_leader(&self) -> bool {
        true
    }

    async fn commit(&self, _request: &UpdateChunkPropertiesRequest) -> Result<()> {
        Ok(())
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut Option<broadcast::Receiver<()>>) {
    match shutdown_rx {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Runs the refresh, properties update and enabled-check tasks.
///
/// All replicator state sits behind one mutex and the lock is never held
/// across an await, so a slow commit or health query in one task does not
/// stall the others or node heartbeats.
pub struct ReplicatorExecutor {
    replicator: Arc<Mutex<ChunkReplicator>>,
    gate: EnablementGate,
    committer: Arc<dyn PropertiesCommitter>,
    /// Shutdown signal receiver.
    shutdown_rx: Option<broadcast::Receiver<()>>,
}

impl ReplicatorExecutor {
    pub fn new(
        replicator: Arc<Mutex<ChunkReplicator>>,
        gate: EnablementGate,
        committer: Arc<dyn PropertiesCommitter>,
        shutdown_rx: Option<broadcast::Receiver<()>>,
    ) -> Self {
        Self {
            replicator,
            gate,
            committer,
            shutdown_rx,
        }
    }

    pub fn replicator(&self) -> Arc<Mutex<ChunkReplicator>> {
        Arc::clone(&self.replicator)
    }

    /// Handle a node heartbeat.
    pub fn schedule_jobs(&self, node_id: NodeId, reports: &[JobReport]) -> Result<ScheduleJobsResult> {
        self.replicator.lock().schedule_jobs(node_id, reports)
    }

    pub fn run_refresh_pass(&self) -> ScanPassStats {
        self.replicator.lock().on_refresh()
    }

    /// Compute, commit and apply one batch of property changes. Returns the
    /// number of chunks updated.
    pub async fn run_properties_update_pass(&self) -> Result<usize> {
        if !self.committer.is_active_leader() {
            return Ok(0);
        }

        let request = self.replicator.lock().build_properties_update();
        if request.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.committer.commit(&request).await {
            // Requeue the batch so the next tick recomputes it.
            let mut replicator = self.replicator.lock();
            for update in &request.updates {
                replicator.schedule_properties_update(&update.chunk_id);
            }
            return Err(e);
        }
        let applied = self.replicator.lock().apply_properties_update(&request)?;
        debug!(update_count = applied, "Chunk properties update committed");
        Ok(applied)
    }

    /// Run the enablement check and apply its verdict. Failures disable the
    /// replicator until the next check.
    pub async fn run_enabled_check(&self) -> Option<bool> {
        let config = self.replicator.lock().config().clone();
        let verdict = self.gate.check(&config).await;

        let mut replicator = self.replicator.lock();
        match verdict {
            Ok(Some(verdict)) => replicator.apply_enablement(&verdict),
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Replicator enablement check failed");
                replicator.apply_enablement(&EnablementVerdict::Disabled(DisableReason::CheckFailed(
                    e.to_string(),
                )));
            }
        }
        replicator.enabled()
    }

    /// Run until the shutdown signal fires, then stop the replicator.
    pub async fn run(mut self) {
        let (refresh_period, properties_period, check_period) = {
            let replicator = self.replicator.lock();
            let config = replicator.config();
            (
                config.chunk_refresh_period,
                config.chunk_properties_update_period,
                config.replicator_enabled_check_period,
            )
        };
        let shutdown_rx = self.shutdown_rx.take();
        let resubscribe = || shutdown_rx.as_ref().map(|rx| rx.resubscribe());

        self.replicator.lock().start();
        info!(role = ?self.gate.role(), "Replicator executor starting");
        let executor = Arc::new(self);

        let refresh = {
            let executor = Arc::clone(&executor);
            let mut shutdown_rx = resubscribe();
            tokio::spawn(async move {
                let mut timer = periodic(refresh_period);
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            executor.run_refresh_pass();
                        }
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    }
                }
            })
        };

        let properties = {
            let executor = Arc::clone(&executor);
            let mut shutdown_rx = resubscribe();
            tokio::spawn(async move {
                let mut timer = periodic(properties_period);
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            if let Err(e) = executor.run_properties_update_pass().await {
                                warn!(error = %e, "Chunk properties update failed");
                            }
                        }
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    }
                }
            })
        };

        let enabled_check = {
            let executor = Arc::clone(&executor);
            let mut shutdown_rx = resubscribe();
            tokio::spawn(async move {
                let mut timer = periodic(check_period);
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            executor.run_enabled_check().await;
                        }
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    }
                }
            })
        };

        for (name, task) in [
            ("refresh", refresh),
            ("properties_update", properties),
            ("enabled_check", enabled_check),
        ] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Replicator task panicked");
            }
        }

        executor.replicator.lock().stop();
        info!("Replicator executor shutting down");
    }
}

fn periodic(period: Duration) -> tokio::time::Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

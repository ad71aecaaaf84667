use anyhow::Result;
use meshwork_protocol::GossipNode;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::RelayClient;
use crate::pool::{PoolEvent, WorkerPool};
use crate::unit::UnitEvent;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Drives the worker: feeds pool units from the job ledger, publishes
/// their results and keeps the mesh connected.
pub struct Coordinator {
    node: Arc<GossipNode>,
    pool: WorkerPool,
    events: mpsc::UnboundedReceiver<PoolEvent>,
    relays: Arc<RelayClient>,
    files_dir: PathBuf,
    poll_interval: Duration,
}

impl Coordinator {
    pub fn new(
        node: Arc<GossipNode>,
        pool: WorkerPool,
        events: mpsc::UnboundedReceiver<PoolEvent>,
        relays: Arc<RelayClient>,
        files_dir: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            node,
            pool,
            events,
            relays,
            files_dir,
            poll_interval,
        }
    }

    /// Run until `shutdown` resolves, then stop the pool and flush results.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.pool.start()?;
        let mut relay_tick = tokio::time::interval(self.poll_interval);
        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = self.node.job_produced().notified() => self.dispatch_waiting().await,
                _ = relay_tick.tick() => self.sync_relays().await,
                _ = sweep_tick.tick() => self.sweep().await,
                _ = &mut shutdown => {
                    tracing::info!("Shutting down gracefully");
                    break;
                }
            }
        }

        self.pool.stop();
        let flushed = self.node.shutdown().await?;
        tracing::info!(results = flushed, "Result ledger flushed");
        Ok(())
    }

    async fn handle_event(&mut self, PoolEvent { unit, event }: PoolEvent) {
        tracing::debug!(unit, event = event.name(), "Unit event");
        match event {
            UnitEvent::JobRequired => {
                // stale once a job was dispatched to the unit directly
                if !self.pool.is_waiting(unit) {
                    return;
                }
                if let Some(job) = self.node.next_job().await {
                    if let Err(e) = self.pool.push_job(unit, job) {
                        tracing::warn!(unit, error = %e, "Job delivery failed");
                    }
                }
            }
            UnitEvent::JobFound(job) => tracing::debug!(unit, job = %job.uuid, "Unit accepted job"),
            UnitEvent::ResultFound(result) => {
                let job_uuid = result.job_uuid.clone();
                match self.node.publish_result(result).await {
                    Ok(outcome) => tracing::debug!(unit, ?outcome, "Result published"),
                    Err(e) => tracing::warn!(unit, error = %e, "Result could not be recorded"),
                }
                if let Some(job_uuid) = job_uuid {
                    self.node.complete_job(&job_uuid).await;
                }
            }
            UnitEvent::FileRequired(name) => {
                let bytes = match read_input_file(&self.files_dir, &name).await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::warn!(unit, file = %name, "Input file unavailable: {e}");
                        None
                    }
                };
                if let Err(e) = self.pool.push_file(unit, name, bytes) {
                    tracing::warn!(unit, error = %e, "File delivery failed");
                }
            }
            UnitEvent::FileFound(name) => tracing::debug!(unit, file = %name, "Unit cached file"),
            UnitEvent::ResultRequired(uuid) => {
                let result = self.node.results.get(&uuid).await.filter(|r| r.is_valid);
                if let Err(e) = self.pool.push_result(unit, uuid, result) {
                    tracing::warn!(unit, error = %e, "Dependency delivery failed");
                }
            }
            UnitEvent::Error(e) => tracing::warn!(unit, error = %e, "Unit reported an error"),
        }
    }

    /// Hand queued jobs to idle units.
    async fn dispatch_waiting(&mut self) {
        while self.pool.has_awaiting_unit() {
            let Some(job) = self.node.next_job().await else {
                return;
            };
            if let Err(job) = self.pool.push_job_to_awaiting_thread(job) {
                // leased; the sweep puts it back
                tracing::debug!(job = %job.uuid, "No unit took the job");
                return;
            }
        }
    }

    async fn sync_relays(&self) {
        for node in self.node.nodes().await {
            match self.relays.sync_node(&self.node, &node).await {
                Ok(report) if report.discovered > 0 || report.signals > 0 => {
                    tracing::debug!(node = %node.uuid, discovered = report.discovered, signals = report.signals, "Relay sync");
                }
                Ok(_) | Err(_) => {}
            }
        }
        let offers = self.node.connect_neighbours().await;
        if offers > 0 {
            tracing::debug!(offers, "Handshakes started");
        }
    }

    async fn sweep(&mut self) {
        let requeued = self.node.requeue_expired().await;
        if requeued > 0 {
            tracing::info!(requeued, "Re-queued jobs with expired leases");
        }
        self.node.expire_negotiations().await;
    }
}

async fn read_input_file(dir: &Path, name: &str) -> Result<Vec<u8>> {
    if name.contains("..") || name.starts_with('/') {
        anyhow::bail!("File name {name:?} escapes the files directory");
    }
    Ok(tokio::fs::read(dir.join(name)).await?)
}

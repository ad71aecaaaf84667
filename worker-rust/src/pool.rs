use meshwork_protocol::{Job, JobResult, MeshError, PeerId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::executor::JobExecutor;
use crate::unit::{ExecutionUnit, UnitEvent};

/// A unit event re-emitted on the pool.
#[derive(Debug)]
pub struct PoolEvent {
    pub unit: usize,
    pub event: UnitEvent,
}

/// Fixed-size set of execution units with their events merged into one
/// stream.
pub struct WorkerPool {
    max_workers: usize,
    peer_id: PeerId,
    executor: Arc<dyn JobExecutor>,
    units: Vec<ExecutionUnit>,
    forwarders: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl WorkerPool {
    pub fn new(
        max_workers: usize,
        peer_id: PeerId,
        executor: Arc<dyn JobExecutor>,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pool = Self {
            max_workers,
            peer_id,
            executor,
            units: Vec::new(),
            forwarders: Vec::new(),
            events,
        };
        (pool, rx)
    }

    /// Create and start `max_workers` fresh units.
    pub fn start(&mut self) -> Result<usize, MeshError> {
        if !self.units.is_empty() {
            return Err(MeshError::invalid("pool is already running"));
        }
        for id in 0..self.max_workers {
            let mut unit = ExecutionUnit::new(id, self.peer_id.clone(), self.executor.clone());
            let mut unit_events = unit.start()?;
            let pool_events = self.events.clone();
            self.forwarders.push(tokio::spawn(async move {
                while let Some(event) = unit_events.recv().await {
                    if pool_events.send(PoolEvent { unit: id, event }).is_err() {
                        break;
                    }
                }
            }));
            self.units.push(unit);
        }
        tracing::info!(workers = self.units.len(), "🚀 Worker pool started");
        Ok(self.units.len())
    }

    /// Stop every unit and discard them. A later `start` builds new ones.
    pub fn stop(&mut self) {
        for unit in &mut self.units {
            unit.stop();
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        if !self.units.is_empty() {
            tracing::info!(workers = self.units.len(), "Worker pool stopped");
        }
        self.units.clear();
    }

    pub fn pause(&mut self) -> Result<(), MeshError> {
        for unit in &mut self.units {
            unit.pause()?;
        }
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), MeshError> {
        for unit in &mut self.units {
            unit.resume()?;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.units.len()
    }

    pub fn is_waiting(&self, unit: usize) -> bool {
        self.unit(unit).map(|u| u.is_waiting_for_job()).unwrap_or(false)
    }

    pub fn has_awaiting_unit(&self) -> bool {
        self.units.iter().any(|u| u.is_waiting_for_job())
    }

    /// Hand `job` to the first unit waiting for work. Returns the unit id,
    /// or the job back when nobody is waiting.
    pub fn push_job_to_awaiting_thread(&mut self, job: Job) -> Result<usize, Job> {
        let Some(unit) = self.units.iter_mut().find(|u| u.is_waiting_for_job()) else {
            return Err(job);
        };
        let id = unit.id();
        if let Err(e) = unit.push_job(job) {
            tracing::warn!(unit = id, error = %e, "Job delivery failed");
        }
        Ok(id)
    }

    pub fn push_job(&mut self, unit: usize, job: Job) -> Result<(), MeshError> {
        self.unit_mut(unit)?.push_job(job)
    }

    pub fn push_file(&self, unit: usize, name: String, bytes: Option<Vec<u8>>) -> Result<(), MeshError> {
        self.unit(unit)?.push_file(name, bytes)
    }

    pub fn push_result(&self, unit: usize, uuid: String, result: Option<JobResult>) -> Result<(), MeshError> {
        self.unit(unit)?.push_result(uuid, result)
    }

    fn unit(&self, id: usize) -> Result<&ExecutionUnit, MeshError> {
        self.units
            .iter()
            .find(|u| u.id() == id)
            .ok_or_else(|| MeshError::not_found(format!("unit {id}")))
    }

    fn unit_mut(&mut self, id: usize) -> Result<&mut ExecutionUnit, MeshError> {
        self.units
            .iter_mut()
            .find(|u| u.id() == id)
            .ok_or_else(|| MeshError::not_found(format!("unit {id}")))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

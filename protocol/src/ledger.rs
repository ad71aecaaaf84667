//! Job queue and result validation ledgers.
//!
//! Results are trusted by repetition: every independent computation of a
//! job raises the stored result's `iteration`, and the result becomes
//! valid once it reaches the configured number of iterations. This is
//! approximate consensus for cooperative peers, not a proof.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cache::{AutoSave, ValidationCache};
use crate::config::{ResultSettings, ValidationSettings};
use crate::error::{MeshError, Result};
use crate::store::{SaveOptions, Store};
use crate::types::{Job, JobResult};

// ---------------------------------------------------------------------------
// JobLedger
// ---------------------------------------------------------------------------

struct Lease {
    job: Job,
    locked_at: Instant,
}

/// FIFO of pending jobs with content dedup.
///
/// A job handed out by [`JobLedger::next`] leaves the queue and is held
/// under a lease until [`JobLedger::complete`] acknowledges it. Leases older
/// than `max_lock_time` are put back in the queue by
/// [`JobLedger::requeue_expired`]; that is the only redelivery there is.
pub struct JobLedger {
    queue: VecDeque<Job>,
    leases: HashMap<String, Lease>,
    max_lock_time: Duration,
}

impl JobLedger {
    pub fn new(max_lock_time: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            leases: HashMap::new(),
            max_lock_time,
        }
    }

    /// Queue `job`. Returns false for jobs without a uuid and for jobs
    /// already queued or leased.
    pub fn add(&mut self, job: Job) -> bool {
        if job.uuid.is_empty() || self.contains(&job.uuid) {
            return false;
        }
        self.queue.push_back(job);
        true
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.leases.contains_key(uuid) || self.queue.iter().any(|j| j.uuid == uuid)
    }

    /// Oldest pending job, now locked under a lease.
    pub fn next(&mut self) -> Option<Job> {
        let mut job = self.queue.pop_front()?;
        job.is_locked = true;
        self.leases.insert(
            job.uuid.clone(),
            Lease {
                job: job.clone(),
                locked_at: Instant::now(),
            },
        );
        Some(job)
    }

    /// Acknowledge a leased job; it is gone for good.
    pub fn complete(&mut self, uuid: &str) -> bool {
        self.leases.remove(uuid).is_some()
    }

    /// Move leases older than `max_lock_time` back to the front of the
    /// queue, the longest-held lease first.
    pub fn requeue_expired(&mut self, now: Instant) -> usize {
        let mut expired: Vec<(Instant, String)> = self
            .leases
            .iter()
            .filter(|(_, lease)| now.saturating_duration_since(lease.locked_at) >= self.max_lock_time)
            .map(|(uuid, lease)| (lease.locked_at, uuid.clone()))
            .collect();
        expired.sort();
        // pushed newest first so the oldest ends up at the front
        for (_, uuid) in expired.iter().rev() {
            if let Some(lease) = self.leases.remove(uuid) {
                let mut job = lease.job;
                job.is_locked = false;
                tracing::info!(job = %job.uuid, "Lease expired, re-queueing job");
                self.queue.push_front(job);
            }
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn leased(&self) -> usize {
        self.leases.len()
    }
}

// ---------------------------------------------------------------------------
// ResultLedger
// ---------------------------------------------------------------------------

/// What a ledger write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Created,
    Changed,
    Unchanged,
}

impl LedgerOutcome {
    pub fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Validated results over the `results` collection.
///
/// All reads and writes go through one async mutex around the cache, so
/// updates to the same uuid never interleave between the read of the
/// stored iteration and the write of the incremented one.
pub struct ResultLedger {
    cache: Arc<Mutex<ValidationCache<JobResult>>>,
    store: Arc<dyn Store>,
    validation: ValidationSettings,
    expected: i64,
    auto_save: Mutex<AutoSave>,
}

impl ResultLedger {
    pub const COLLECTION: &'static str = "results";

    pub fn new(store: Arc<dyn Store>, settings: &ResultSettings) -> Self {
        Self {
            cache: Arc::new(Mutex::new(ValidationCache::new(Self::COLLECTION, store.clone()))),
            store,
            validation: settings.validation.clone(),
            expected: settings.expected,
            auto_save: Mutex::new(AutoSave::default()),
        }
    }

    /// Load previously stored results.
    pub async fn sync(&self) -> Result<usize> {
        self.cache.lock().await.sync().await
    }

    /// Record a result: new uuids are stored, known ones count as another
    /// computation of the stored result.
    pub async fn add(&self, result: JobResult) -> Result<LedgerOutcome> {
        check_uuid(&result)?;
        let mut cache = self.cache.lock().await;
        if !cache.has(&result.uuid) {
            return self.insert(&mut cache, result).await;
        }
        self.fold(&mut cache, result).await
    }

    /// Count `result` as one more computation. Unknown uuids are stored as
    /// new, exactly like [`ResultLedger::add`].
    pub async fn update(&self, result: JobResult) -> Result<LedgerOutcome> {
        self.add(result).await
    }

    async fn insert(
        &self,
        cache: &mut ValidationCache<JobResult>,
        mut result: JobResult,
    ) -> Result<LedgerOutcome> {
        result.iteration = result.iteration.max(1);
        result.is_valid = !self.validation.enabled || result.iteration >= self.validation.iterations;
        self.persist(&result).await?;
        if result.is_valid {
            tracing::info!(result = %result.uuid, "✅ Result valid on arrival");
        }
        cache.set(result)?;
        Ok(LedgerOutcome::Created)
    }

    async fn fold(
        &self,
        cache: &mut ValidationCache<JobResult>,
        mut result: JobResult,
    ) -> Result<LedgerOutcome> {
        if !self.validation.enabled {
            return Ok(LedgerOutcome::Unchanged);
        }
        let Some(stored) = cache.get(&result.uuid) else {
            return Err(MeshError::not_found(format!("results/{}", result.uuid)));
        };
        if stored.is_valid || stored.iteration >= self.validation.iterations {
            return Ok(LedgerOutcome::Unchanged);
        }
        if conflicts(&stored.data, &result.data) {
            tracing::warn!(
                result = %result.uuid,
                peer = %result.peer_uuid,
                "Recomputation disagrees with stored data, not counted"
            );
            return Ok(LedgerOutcome::Unchanged);
        }

        result.iteration = stored.iteration + 1;
        result.is_valid = result.iteration >= self.validation.iterations;
        let Some(merged) = cache.merged(&result)? else {
            return Ok(LedgerOutcome::Unchanged);
        };
        // the cache only moves once the store has the new count
        self.persist(&merged).await?;
        tracing::debug!(result = %merged.uuid, iteration = merged.iteration, "Result recomputed");
        if merged.is_valid {
            tracing::info!(result = %merged.uuid, iterations = merged.iteration, "✅ Result validated");
        }
        cache.replace(merged);
        Ok(LedgerOutcome::Changed)
    }

    async fn persist(&self, result: &JobResult) -> Result<()> {
        let dataset = serde_json::to_value(result)?;
        let overwrite = SaveOptions {
            allow_duplicates: true,
        };
        self.store.save(Self::COLLECTION, &dataset, overwrite).await?;
        Ok(())
    }

    pub async fn get(&self, uuid: &str) -> Option<JobResult> {
        self.cache.lock().await.get(uuid).cloned()
    }

    pub async fn is_valid(&self, uuid: &str) -> bool {
        self.cache
            .lock()
            .await
            .get(uuid)
            .map(|r| r.is_valid)
            .unwrap_or(false)
    }

    pub async fn valid_count(&self) -> usize {
        self.cache.lock().await.filter(|r| r.is_valid).len()
    }

    /// Whether the active project has all the valid results it expects.
    /// An unknown expectation (`-1`) is never satisfied.
    pub async fn all_valid(&self) -> bool {
        if self.expected < 0 {
            return false;
        }
        self.valid_count().await == self.expected as usize
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn flush(&self) -> Result<usize> {
        self.cache.lock().await.flush().await
    }

    pub async fn enable_auto_save(&self, period: Duration) {
        self.auto_save.lock().await.enable(self.cache.clone(), period);
    }

    pub async fn disable_auto_save(&self) {
        self.auto_save.lock().await.disable();
    }
}

fn check_uuid(result: &JobResult) -> Result<()> {
    if result.uuid.is_empty() {
        return Err(MeshError::invalid("result has no uuid"));
    }
    Ok(())
}

/// Two payloads conflict when they hold different values for a field
/// both of them set. Disjoint fields are compatible.
fn conflicts(stored: &Value, incoming: &Value) -> bool {
    match (stored, incoming) {
        (Value::Object(a), Value::Object(b)) => a
            .iter()
            .any(|(k, v)| b.get(k).map(|w| conflicts(v, w)).unwrap_or(false)),
        (a, b) => a != b,
    }
}

//! Execution units: one job at a time, isolated in their own task, talking
//! to the coordinator only through messages.
//!
//! ```text
//!  Idle ──start──► Running ◄──resume── Paused
//!                   │  ▲ └──pause──────►
//!        job:required  │ job
//!                   ▼  │
//!               WaitingForJob        any ──stop──► Stopped
//! ```

use meshwork_protocol::{Job, JobResult, MeshError, PeerId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::executor::{JobExecutor, JobInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Idle,
    Running,
    Paused,
    WaitingForJob,
    Stopped,
}

/// Commands delivered to a unit, in send order.
#[derive(Debug)]
pub enum UnitCommand {
    Start,
    /// Leave the command loop; nothing after it is processed.
    Stop,
    Pause,
    Resume,
    Job(Job),
    /// Contents of a requested input file, `None` when it is unavailable.
    File { name: String, bytes: Option<Vec<u8>> },
    /// A requested dependency result, `None` when it is not valid yet.
    Result { uuid: String, result: Option<JobResult> },
}

#[derive(Debug)]
pub enum UnitEvent {
    JobRequired,
    JobFound(Job),
    ResultFound(JobResult),
    ResultRequired(String),
    FileRequired(String),
    FileFound(String),
    Error(MeshError),
}

impl UnitEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobRequired => "job:required",
            Self::JobFound(_) => "job:found",
            Self::ResultFound(_) => "result:found",
            Self::ResultRequired(_) => "result:required",
            Self::FileRequired(_) => "file:required",
            Self::FileFound(_) => "file:found",
            Self::Error(_) => "error",
        }
    }
}

pub struct ExecutionUnit {
    id: usize,
    peer_id: PeerId,
    executor: Arc<dyn JobExecutor>,
    state: UnitState,
    waiting: Arc<AtomicBool>,
    commands: Option<mpsc::UnboundedSender<UnitCommand>>,
    task: Option<JoinHandle<()>>,
}

impl ExecutionUnit {
    pub fn new(id: usize, peer_id: PeerId, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            id,
            peer_id,
            executor,
            state: UnitState::Idle,
            waiting: Arc::new(AtomicBool::new(false)),
            commands: None,
            task: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> UnitState {
        if self.state == UnitState::Running && self.is_waiting_for_job() {
            return UnitState::WaitingForJob;
        }
        self.state
    }

    pub fn is_waiting_for_job(&self) -> bool {
        self.state != UnitState::Paused && self.waiting.load(Ordering::SeqCst)
    }

    /// Spawn the unit's task and return the stream of its events.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<UnitEvent>, MeshError> {
        if self.state != UnitState::Idle {
            return Err(MeshError::invalid(format!(
                "unit {} cannot start from {:?}",
                self.id, self.state
            )));
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let context = UnitContext::new(
            self.id,
            self.peer_id.clone(),
            self.executor.clone(),
            event_tx,
            self.waiting.clone(),
        );
        self.task = Some(tokio::spawn(context.run(command_rx)));
        self.commands = Some(command_tx);
        self.send(UnitCommand::Start)?;
        self.state = UnitState::Running;
        tracing::debug!(unit = self.id, "Execution unit started");
        Ok(event_rx)
    }

    /// Tear the unit down. A stopped unit cannot be restarted; any job in
    /// flight is dropped.
    pub fn stop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(UnitCommand::Stop);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.waiting.store(false, Ordering::SeqCst);
        if self.state != UnitState::Stopped {
            tracing::debug!(unit = self.id, "Execution unit stopped");
        }
        self.state = UnitState::Stopped;
    }

    pub fn pause(&mut self) -> Result<(), MeshError> {
        if self.state != UnitState::Running {
            return Ok(());
        }
        self.send(UnitCommand::Pause)?;
        self.state = UnitState::Paused;
        self.waiting.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), MeshError> {
        if self.state != UnitState::Paused {
            return Ok(());
        }
        self.send(UnitCommand::Resume)?;
        self.state = UnitState::Running;
        Ok(())
    }

    pub fn push_job(&mut self, job: Job) -> Result<(), MeshError> {
        self.waiting.store(false, Ordering::SeqCst);
        self.send(UnitCommand::Job(job))
    }

    pub fn push_file(&self, name: String, bytes: Option<Vec<u8>>) -> Result<(), MeshError> {
        self.send(UnitCommand::File { name, bytes })
    }

    pub fn push_result(&self, uuid: String, result: Option<JobResult>) -> Result<(), MeshError> {
        self.send(UnitCommand::Result { uuid, result })
    }

    fn send(&self, command: UnitCommand) -> Result<(), MeshError> {
        let fault = |reason: &str| MeshError::ExecutionFault {
            unit: self.id,
            reason: reason.into(),
        };
        let commands = self.commands.as_ref().ok_or_else(|| fault("unit is not running"))?;
        commands.send(command).map_err(|_| fault("unit task has exited"))
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct PendingJob {
    job: Job,
    missing_files: HashSet<String>,
    dependency: Option<String>,
}

impl PendingJob {
    fn is_ready(&self) -> bool {
        self.missing_files.is_empty() && self.dependency.is_none()
    }
}

/// State owned by the unit's task.
struct UnitContext {
    id: usize,
    peer_id: PeerId,
    executor: Arc<dyn JobExecutor>,
    events: mpsc::UnboundedSender<UnitEvent>,
    waiting: Arc<AtomicBool>,
    running: bool,
    paused: bool,
    /// Job delivered while paused, accepted on resume.
    held: Option<Job>,
    current: Option<PendingJob>,
    files: HashMap<String, Vec<u8>>,
    results: HashMap<String, JobResult>,
}

impl UnitContext {
    fn new(
        id: usize,
        peer_id: PeerId,
        executor: Arc<dyn JobExecutor>,
        events: mpsc::UnboundedSender<UnitEvent>,
        waiting: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            peer_id,
            executor,
            events,
            waiting,
            running: false,
            paused: false,
            held: None,
            current: None,
            files: HashMap::new(),
            results: HashMap::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<UnitCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                UnitCommand::Start => {
                    self.running = true;
                    self.request_job();
                }
                UnitCommand::Stop => {
                    self.running = false;
                    self.waiting.store(false, Ordering::SeqCst);
                    break;
                }
                UnitCommand::Pause => {
                    self.paused = true;
                    self.waiting.store(false, Ordering::SeqCst);
                }
                UnitCommand::Resume => self.resume().await,
                UnitCommand::Job(job) => self.accept(job).await,
                UnitCommand::File { name, bytes } => self.receive_file(name, bytes).await,
                UnitCommand::Result { uuid, result } => self.receive_result(uuid, result).await,
            }
        }
    }

    fn emit(&self, event: UnitEvent) {
        // receiver gone means the pool was stopped
        let _ = self.events.send(event);
    }

    fn fail(&self, reason: String) {
        tracing::warn!(unit = self.id, "⚠️ {reason}");
        self.emit(UnitEvent::Error(MeshError::ExecutionFault {
            unit: self.id,
            reason,
        }));
    }

    fn request_job(&self) {
        if !self.running || self.paused || self.current.is_some() {
            return;
        }
        if !self.waiting.swap(true, Ordering::SeqCst) {
            self.emit(UnitEvent::JobRequired);
        }
    }

    async fn resume(&mut self) {
        self.paused = false;
        if let Some(job) = self.held.take() {
            self.accept(job).await;
        } else if self.current.is_some() {
            self.try_execute().await;
        } else {
            self.request_job();
        }
    }

    async fn accept(&mut self, job: Job) {
        self.waiting.store(false, Ordering::SeqCst);
        if self.paused {
            if let Some(earlier) = &self.held {
                self.fail(format!(
                    "received job {} while {} is held",
                    job.uuid, earlier.uuid
                ));
                return;
            }
            tracing::debug!(unit = self.id, job = %job.uuid, "Holding job until resume");
            self.held = Some(job);
            return;
        }
        if let Some(busy) = &self.current {
            self.fail(format!(
                "received job {} while {} is in progress",
                job.uuid, busy.job.uuid
            ));
            return;
        }
        self.emit(UnitEvent::JobFound(job.clone()));

        let missing_files: HashSet<String> = job
            .input_files()
            .into_iter()
            .filter(|f| !self.files.contains_key(f))
            .collect();
        let dependency = job
            .dependency()
            .filter(|d| !self.results.contains_key(*d))
            .map(str::to_string);
        for name in &missing_files {
            self.emit(UnitEvent::FileRequired(name.clone()));
        }
        if let Some(uuid) = &dependency {
            self.emit(UnitEvent::ResultRequired(uuid.clone()));
        }
        self.current = Some(PendingJob {
            job,
            missing_files,
            dependency,
        });
        self.try_execute().await;
    }

    async fn receive_file(&mut self, name: String, bytes: Option<Vec<u8>>) {
        let Some(bytes) = bytes else {
            self.abandon(format!("input file {name} is unavailable"));
            return;
        };
        self.emit(UnitEvent::FileFound(name.clone()));
        if let Some(pending) = self.current.as_mut() {
            pending.missing_files.remove(&name);
        }
        self.files.insert(name, bytes);
        self.try_execute().await;
    }

    async fn receive_result(&mut self, uuid: String, result: Option<JobResult>) {
        let Some(result) = result else {
            self.abandon(format!("dependency {uuid} is not available"));
            return;
        };
        if let Some(pending) = self.current.as_mut() {
            if pending.dependency.as_deref() == Some(uuid.as_str()) {
                pending.dependency = None;
            }
        }
        self.results.insert(uuid, result);
        self.try_execute().await;
    }

    /// Give up on the current job; the ledger lease brings it back later.
    fn abandon(&mut self, reason: String) {
        if self.current.take().is_some() {
            self.fail(reason);
            self.request_job();
        }
    }

    async fn try_execute(&mut self) {
        if self.paused || !self.current.as_ref().map(PendingJob::is_ready).unwrap_or(false) {
            return;
        }
        let Some(pending) = self.current.take() else {
            return;
        };
        let job = pending.job;
        let files: BTreeMap<String, Vec<u8>> = job
            .input_files()
            .into_iter()
            .filter_map(|f| self.files.get(&f).map(|b| (f, b.clone())))
            .collect();
        let dependency = job.dependency().and_then(|d| self.results.get(d)).cloned();

        tracing::info!(unit = self.id, job = %job.uuid, "⚙️ Executing job");
        let input = JobInput {
            job: job.clone(),
            files,
            dependency,
        };
        match self.executor.execute(input).await {
            Ok(data) => match JobResult::for_job(&job, data, self.peer_id.clone()) {
                Ok(result) => {
                    tracing::info!(unit = self.id, job = %job.uuid, "Job finished");
                    self.emit(UnitEvent::ResultFound(result));
                }
                Err(e) => self.fail(format!("job {}: {e}", job.uuid)),
            },
            Err(e) => self.fail(format!("job {} failed: {e:#}", job.uuid)),
        }
        self.request_job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;
    use serde_json::{json, Value};

    fn job(v: Value) -> Job {
        Job::new(v.as_object().cloned().unwrap(), "origin").unwrap()
    }

    fn unit<F>(f: F) -> ExecutionUnit
    where
        F: Fn(&JobInput) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        ExecutionUnit::new(0, "me".into(), Arc::new(FnExecutor::new(f)))
    }

    #[tokio::test]
    async fn start_requests_a_job_and_result_follows() {
        let mut u = unit(|input| Ok(json!(input.job.parameters["n"].as_i64().unwrap() * 2)));
        let mut events = u.start().unwrap();
        assert!(matches!(events.recv().await, Some(UnitEvent::JobRequired)));
        assert_eq!(u.state(), UnitState::WaitingForJob);

        let j = job(json!({ "n": 21 }));
        u.push_job(j.clone()).unwrap();
        assert_eq!(u.state(), UnitState::Running);
        assert!(matches!(events.recv().await, Some(UnitEvent::JobFound(found)) if found.uuid == j.uuid));
        match events.recv().await {
            Some(UnitEvent::ResultFound(r)) => {
                assert_eq!(r.data, json!(42));
                assert_eq!(r.job_uuid.as_deref(), Some(j.uuid.as_str()));
                assert_eq!(r.peer_uuid, "me");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(UnitEvent::JobRequired)));
    }

    #[tokio::test]
    async fn inputs_are_requested_before_execution() {
        let mut u = unit(|input| {
            let text = String::from_utf8(input.files["a.txt"].clone())?;
            let dep = input.dependency.as_ref().map(|d| d.data.clone());
            Ok(json!({ "text": text, "dep": dep }))
        });
        let mut events = u.start().unwrap();
        events.recv().await;

        u.push_job(job(json!({ "files": ["a.txt"], "depends_on": "dep-1" }))).unwrap();
        assert_eq!(events.recv().await.unwrap().name(), "job:found");
        assert!(matches!(events.recv().await, Some(UnitEvent::FileRequired(f)) if f == "a.txt"));
        assert!(matches!(events.recv().await, Some(UnitEvent::ResultRequired(d)) if d == "dep-1"));

        u.push_file("a.txt".into(), Some(b"hi".to_vec())).unwrap();
        assert_eq!(events.recv().await.unwrap().name(), "file:found");
        let dep = JobResult::standalone(json!(7), "other").unwrap();
        u.push_result("dep-1".into(), Some(dep)).unwrap();

        match events.recv().await {
            Some(UnitEvent::ResultFound(r)) => assert_eq!(r.data, json!({ "text": "hi", "dep": 7 })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_input_abandons_the_job() {
        let mut u = unit(|_| Ok(json!(null)));
        let mut events = u.start().unwrap();
        events.recv().await;
        u.push_job(job(json!({ "files": ["gone.bin"] }))).unwrap();
        events.recv().await;
        events.recv().await;
        u.push_file("gone.bin".into(), None).unwrap();
        assert!(matches!(
            events.recv().await,
            Some(UnitEvent::Error(MeshError::ExecutionFault { unit: 0, .. }))
        ));
        assert!(matches!(events.recv().await, Some(UnitEvent::JobRequired)));
    }

    #[tokio::test]
    async fn executor_error_becomes_error_event() {
        let mut u = unit(|_| anyhow::bail!("segfault"));
        let mut events = u.start().unwrap();
        events.recv().await;
        u.push_job(job(json!({ "n": 1 }))).unwrap();
        events.recv().await;
        match events.recv().await {
            Some(UnitEvent::Error(e)) => assert!(e.to_string().contains("segfault")),
            other => panic!("unexpected {other:?}"),
        }
        // the unit keeps serving
        assert!(matches!(events.recv().await, Some(UnitEvent::JobRequired)));
    }

    #[tokio::test]
    async fn paused_unit_holds_pushed_job_until_resume() {
        let mut u = unit(|_| Ok(json!(1)));
        let mut events = u.start().unwrap();
        events.recv().await;
        u.pause().unwrap();
        assert_eq!(u.state(), UnitState::Paused);
        assert!(!u.is_waiting_for_job());

        let j = job(json!({ "n": 1 }));
        u.push_job(j.clone()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());

        u.resume().unwrap();
        assert!(matches!(events.recv().await, Some(UnitEvent::JobFound(found)) if found.uuid == j.uuid));
        assert!(matches!(events.recv().await, Some(UnitEvent::ResultFound(_))));
        assert!(matches!(events.recv().await, Some(UnitEvent::JobRequired)));
    }

    #[tokio::test]
    async fn paused_unit_waits_with_ready_inputs() {
        let mut u = unit(|input| Ok(json!(input.files["a.txt"].len())));
        let mut events = u.start().unwrap();
        events.recv().await;
        u.push_job(job(json!({ "files": ["a.txt"] }))).unwrap();
        events.recv().await; // job:found
        events.recv().await; // file:required

        u.pause().unwrap();
        u.push_file("a.txt".into(), Some(b"abc".to_vec())).unwrap();
        assert_eq!(events.recv().await.unwrap().name(), "file:found");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());

        u.resume().unwrap();
        match events.recv().await {
            Some(UnitEvent::ResultFound(r)) => assert_eq!(r.data, json!(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_command_ends_the_task() {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let waiting = Arc::new(AtomicBool::new(false));
        let context = UnitContext::new(
            0,
            "me".into(),
            Arc::new(FnExecutor::new(|_| Ok(json!(1)))),
            event_tx,
            waiting.clone(),
        );
        let task = tokio::spawn(context.run(command_rx));
        command_tx.send(UnitCommand::Start).unwrap();
        command_tx.send(UnitCommand::Stop).unwrap();
        command_tx.send(UnitCommand::Job(job(json!({ "n": 1 })))).unwrap();

        // the sender is still open, so only the command ends the loop
        task.await.unwrap();
        assert!(matches!(events.recv().await, Some(UnitEvent::JobRequired)));
        assert!(events.recv().await.is_none());
        assert!(!waiting.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stopped_unit_cannot_restart() {
        let mut u = unit(|_| Ok(json!(1)));
        let mut events = u.start().unwrap();
        events.recv().await;
        u.stop();
        assert_eq!(u.state(), UnitState::Stopped);
        assert!(u.start().is_err());
        assert!(u.push_job(job(json!({ "n": 1 }))).is_err());
        // the task is gone, so the event stream ends
        assert!(events.recv().await.is_none());
    }
}

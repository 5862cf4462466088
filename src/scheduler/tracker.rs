use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, RunnerError};
use crate::remote::executor::{OutputSink, RunOptions};
use crate::scheduler::events::{EventBus, JobEvent};
use crate::scheduler::job::{ExecutionRequest, JobOutcome, JobRecord, JobStatus};
use crate::scheduler::registry::{BoxedWork, JobHandle, JobRegistry};
use crate::scheduler::store::{JobFilter, JobStore, JobUpdate};
use crate::ssh::transport::OutputChunk;

/// Handed to a unit of work when its job starts.
pub struct JobContext {
    pub job_id: Uuid,
    pub request: ExecutionRequest,
    /// Request timeout, or the scheduler default.
    pub timeout: Duration,
    /// Fires when the job is cancelled while running.
    pub cancel: CancellationToken,
    /// Set for verbose requests; chunks sent here are logged line by line.
    pub output: Option<OutputSink>,
}

impl JobContext {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            timeout: Some(self.timeout),
            sink: self.output.clone(),
            cancel: Some(self.cancel.clone()),
            stdin: None,
        }
    }
}

enum Persist {
    Insert,
    Update,
}

struct Inner {
    config: SchedulerConfig,
    registry: Mutex<JobRegistry>,
    store: Arc<dyn JobStore>,
    /// Serializes store writes so they land in registry order.
    store_lock: Mutex<()>,
    events: EventBus,
    slots: Arc<Semaphore>,
    wakeup: Notify,
    shutdown: CancellationToken,
}

/// Runs submitted work on a bounded pool and tracks every job's lifecycle.
///
/// Jobs start in submission order. At most `pool_capacity` run at once;
/// the rest wait in a FIFO queue. Each job's record moves through
/// queued, running and a terminal status, and every change is persisted
/// before it is broadcast.
///
/// Must be created inside a Tokio runtime. Dropping the last handle stops
/// the dispatcher; unlike [`Scheduler::shutdown`], queued records are left
/// as they are.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    _stop_on_drop: Arc<DropGuard>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn JobStore>) -> Self {
        let capacity = config.pool_capacity.max(1);
        let inner = Arc::new(Inner {
            events: EventBus::new(config.event_buffer),
            config,
            registry: Mutex::new(JobRegistry::default()),
            store,
            store_lock: Mutex::new(()),
            slots: Arc::new(Semaphore::new(capacity)),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(inner.clone().dispatch());
        tracing::info!(capacity, "Scheduler started");

        let stop = inner.shutdown.clone().drop_guard();
        Self {
            inner,
            _stop_on_drop: Arc::new(stop),
        }
    }

    /// Queue `work` for execution and return the new job's id.
    pub async fn submit<F, Fut>(&self, request: ExecutionRequest, work: F) -> Uuid
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutcome>> + Send + 'static,
    {
        let record = JobRecord::new(&request);
        let id = record.id;
        tracing::info!(
            job_id = %id,
            kind = %record.kind,
            host = %record.target_id,
            "Job submitted"
        );

        let work: BoxedWork = Box::new(move |ctx| Box::pin(work(ctx)));
        let mut registry = self.inner.registry.lock().await;
        registry.enqueue(JobHandle::new(record.clone(), request), work);
        self.inner.persist(registry, &record, Persist::Insert).await;
        self.inner.wakeup.notify_one();

        if self.inner.shutdown.is_cancelled() {
            self.cancel(id).await;
        }
        id
    }

    /// Cancel a queued or running job. A queued job's work is never invoked;
    /// a running job is told to stop and is marked cancelled immediately.
    /// Returns false for unknown or already settled jobs.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let inner = &self.inner;
        let mut registry = inner.registry.lock().await;
        let Some(handle) = registry.get_mut(&id) else {
            return false;
        };

        let was_running = handle.record.status == JobStatus::Running;
        if !handle.record.transition(JobStatus::Cancelled, Utc::now()) {
            return false;
        }
        handle.record.error = if was_running {
            "cancelled while running".to_string()
        } else {
            "cancelled before start".to_string()
        };
        if was_running {
            handle.cancel.cancel();
        }
        let record = handle.record.clone();
        if !was_running {
            registry.remove_pending(&id);
        }

        inner.persist(registry, &record, Persist::Update).await;
        inner.retire(record).await;
        tracing::info!(job_id = %id, was_running, "Job cancelled");
        true
    }

    /// Current record for `id`, live or settled.
    pub async fn status(&self, id: Uuid) -> Result<JobRecord> {
        if let Some(handle) = self.inner.registry.lock().await.get(&id) {
            return Ok(handle.record.clone());
        }
        self.inner.store.get(id)?.ok_or(RunnerError::JobNotFound(id))
    }

    /// Resolve once the job reaches a terminal status.
    pub async fn wait(&self, id: Uuid) -> Result<JobRecord> {
        let watcher = self
            .inner
            .registry
            .lock()
            .await
            .get(&id)
            .map(|handle| handle.watch.subscribe());

        if let Some(mut rx) = watcher {
            if let Ok(record) = rx.wait_for(JobRecord::is_terminal).await {
                return Ok(record.clone());
            }
        }
        self.status(id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn history(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.inner.store.query(filter)
    }

    pub async fn running_count(&self) -> usize {
        self.inner.registry.lock().await.count(JobStatus::Running)
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.registry.lock().await.count(JobStatus::Queued)
    }

    /// Stop starting new jobs and cancel everything still queued. Running
    /// jobs are left to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let pending = self.inner.registry.lock().await.pending_ids();
        let mut cancelled = 0;
        for id in pending {
            if self.cancel(id).await {
                cancelled += 1;
            }
        }
        tracing::info!(cancelled, "Scheduler shut down");
    }
}

impl Inner {
    async fn dispatch(self: Arc<Self>) {
        loop {
            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = self.shutdown.cancelled() => return,
            };

            let (ctx, work) = loop {
                if let Some(next) = self.start_next().await {
                    break next;
                }
                tokio::select! {
                    _ = self.wakeup.notified() => {}
                    _ = self.shutdown.cancelled() => return,
                }
            };

            tokio::spawn(self.clone().execute(ctx, work, permit));
        }
    }

    /// Move the oldest queued job to running.
    async fn start_next(&self) -> Option<(JobContext, BoxedWork)> {
        let mut registry = self.registry.lock().await;
        loop {
            let (id, work) = registry.pop_pending()?;
            let Some(handle) = registry.get_mut(&id) else {
                continue;
            };
            if !handle.record.transition(JobStatus::Running, Utc::now()) {
                continue;
            }

            let record = handle.record.clone();
            let ctx = JobContext {
                job_id: id,
                request: handle.request.clone(),
                timeout: handle.request.timeout.unwrap_or(self.config.default_timeout),
                cancel: handle.cancel.clone(),
                output: handle.request.verbose.then(|| log_output(id)),
            };
            handle.watch.send_replace(record.clone());

            self.persist(registry, &record, Persist::Update).await;
            tracing::info!(job_id = %id, host = %record.target_id, "Job started");
            return Some((ctx, work));
        }
    }

    async fn execute(self: Arc<Self>, ctx: JobContext, work: BoxedWork, permit: OwnedSemaphorePermit) {
        let id = ctx.job_id;
        let result = tokio::spawn(async move { work(ctx).await }).await;

        let (status, output, error) = match result {
            Ok(Ok(outcome)) if outcome.success => (JobStatus::Success, outcome.output, outcome.error),
            Ok(Ok(outcome)) => (JobStatus::Failed, outcome.output, outcome.error),
            Ok(Err(e)) => (JobStatus::Failed, String::new(), e.to_string()),
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Job worker panicked");
                (JobStatus::Failed, String::new(), format!("worker panicked: {e}"))
            }
        };

        self.settle(id, status, output, error).await;
        drop(permit);
    }

    async fn settle(&self, id: Uuid, status: JobStatus, output: String, error: String) {
        let mut registry = self.registry.lock().await;
        let Some(handle) = registry.get_mut(&id) else {
            tracing::debug!(job_id = %id, "Discarding result of settled job");
            return;
        };
        if !handle.record.transition(status, Utc::now()) {
            tracing::debug!(
                job_id = %id,
                current = %handle.record.status,
                "Discarding late result"
            );
            return;
        }
        handle.record.output = output;
        handle.record.error = error;
        let record = handle.record.clone();

        self.persist(registry, &record, Persist::Update).await;
        tracing::info!(
            job_id = %id,
            status = %record.status,
            duration_secs = record.duration_secs.unwrap_or_default(),
            "Job finished"
        );
        self.retire(record).await;
    }

    /// Write `record` to the store and broadcast it. The registry lock is
    /// released only after the store lock is held, so writes keep the
    /// order in which the registry changed.
    async fn persist(&self, registry: MutexGuard<'_, JobRegistry>, record: &JobRecord, mode: Persist) {
        let _serial = self.store_lock.lock().await;
        drop(registry);

        let result = match mode {
            Persist::Insert => self.store.insert(record),
            Persist::Update => self.store.update(record.id, &JobUpdate::from_record(record)),
        };
        if let Err(e) = result {
            tracing::error!(job_id = %record.id, error = %e, "Failed to persist job record");
        }
        self.events.publish(JobEvent::from(record));
    }

    /// Drop a settled job from the registry and wake its waiters.
    async fn retire(&self, record: JobRecord) {
        let handle = self.registry.lock().await.remove(&record.id);
        if let Some(handle) = handle {
            handle.watch.send_replace(record);
        }
    }
}

fn log_output(job_id: Uuid) -> OutputSink {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            for line in chunk.text().lines() {
                tracing::info!(job_id = %job_id, stream = %chunk.stream, "{}", line);
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::store::MemoryJobStore;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            pool_capacity: 1,
            default_timeout: Duration::from_secs(1),
            event_buffer: 8,
        }
    }

    #[tokio::test]
    async fn dropping_last_handle_stops_dispatcher() {
        let scheduler = Scheduler::new(config(), Arc::new(MemoryJobStore::new()));
        let clone = scheduler.clone();
        let inner = Arc::downgrade(&scheduler.inner);
        let token = scheduler.inner.shutdown.clone();

        drop(scheduler);
        assert!(!token.is_cancelled());

        drop(clone);
        assert!(token.is_cancelled());

        let mut released = false;
        for _ in 0..50 {
            if inner.upgrade().is_none() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "dispatcher task still holds the scheduler state");
    }
}

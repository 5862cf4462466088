use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::{ExecutionRequest, JobOutcome, JobRecord, JobStatus};
use crate::scheduler::queue::PendingQueue;
use crate::scheduler::tracker::JobContext;

pub(crate) type WorkFuture = Pin<Box<dyn Future<Output = Result<JobOutcome>> + Send>>;
pub(crate) type BoxedWork = Box<dyn FnOnce(JobContext) -> WorkFuture + Send>;

/// Live bookkeeping for one unsettled job.
pub(crate) struct JobHandle {
    pub(crate) record: JobRecord,
    pub(crate) request: ExecutionRequest,
    pub(crate) cancel: CancellationToken,
    pub(crate) watch: watch::Sender<JobRecord>,
}

impl JobHandle {
    pub(crate) fn new(record: JobRecord, request: ExecutionRequest) -> Self {
        let (watch, _) = watch::channel(record.clone());
        Self {
            record,
            request,
            cancel: CancellationToken::new(),
            watch,
        }
    }
}

/// Jobs that are queued or running. Settled jobs leave the registry once
/// their final record is persisted.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<Uuid, JobHandle>,
    pending: PendingQueue<BoxedWork>,
}

impl JobRegistry {
    pub(crate) fn enqueue(&mut self, handle: JobHandle, work: BoxedWork) {
        let id = handle.record.id;
        self.jobs.insert(id, handle);
        self.pending.push_back(id, work);
    }

    pub(crate) fn get(&self, id: &Uuid) -> Option<&JobHandle> {
        self.jobs.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &Uuid) -> Option<&mut JobHandle> {
        self.jobs.get_mut(id)
    }

    pub(crate) fn remove(&mut self, id: &Uuid) -> Option<JobHandle> {
        self.jobs.remove(id)
    }

    pub(crate) fn pop_pending(&mut self) -> Option<(Uuid, BoxedWork)> {
        self.pending.pop_front()
    }

    pub(crate) fn remove_pending(&mut self, id: &Uuid) -> Option<BoxedWork> {
        self.pending.remove(id)
    }

    pub(crate) fn pending_ids(&self) -> Vec<Uuid> {
        self.pending.ids()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs
            .values()
            .filter(|h| h.record.status == status)
            .count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

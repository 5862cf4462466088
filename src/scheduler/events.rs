use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::scheduler::job::{JobRecord, JobStatus};

/// Status change notification, published after the record is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub output: String,
    pub error: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
}

impl From<&JobRecord> for JobEvent {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            status: record.status,
            output: record.output.clone(),
            error: record.error.clone(),
            completed_at: record.completed_at,
            duration_seconds: record.duration_secs.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: JobEvent) {
        // Errors only when nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

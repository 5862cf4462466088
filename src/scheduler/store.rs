use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::error::{Result, RunnerError};
use crate::scheduler::job::{JobKind, JobRecord, JobStatus};

/// Partial update applied to a stored record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

impl JobUpdate {
    /// Snapshot every mutable field of `record`.
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            status: Some(record.status),
            output: Some(record.output.clone()),
            error: Some(record.error.clone()),
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_secs: record.duration_secs,
        }
    }

    /// Apply to `record`. Terminal records and illegal status moves are left
    /// untouched; returns whether anything was applied.
    pub fn apply_to(&self, record: &mut JobRecord) -> bool {
        if record.status.is_terminal() {
            return false;
        }
        if let Some(status) = self.status {
            if status != record.status && !record.status.can_transition_to(status) {
                return false;
            }
            record.status = status;
        }
        if let Some(output) = &self.output {
            record.output.clone_from(output);
        }
        if let Some(error) = &self.error {
            record.error.clone_from(error);
        }
        if self.started_at.is_some() {
            record.started_at = self.started_at;
        }
        if self.completed_at.is_some() {
            record.completed_at = self.completed_at;
        }
        if self.duration_secs.is_some() {
            record.duration_secs = self.duration_secs;
        }
        true
    }
}

/// History query. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub target: Option<String>,
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub within_last_hours: Option<u32>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target = Some(target_id.into());
        self
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn within_last_hours(mut self, hours: u32) -> Self {
        self.within_last_hours = Some(hours);
        self
    }

    pub fn matches(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        if self.target.as_ref().is_some_and(|t| *t != record.target_id) {
            return false;
        }
        if self.kind.is_some_and(|k| k != record.kind) {
            return false;
        }
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if let Some(hours) = self.within_last_hours {
            if record.submitted_at < now - ChronoDuration::hours(i64::from(hours)) {
                return false;
            }
        }
        true
    }
}

/// Persistence for job records. Implementations must never change the
/// status of a record that is already terminal.
pub trait JobStore: Send + Sync {
    fn insert(&self, record: &JobRecord) -> Result<()>;
    fn update(&self, id: Uuid, update: &JobUpdate) -> Result<()>;
    fn get(&self, id: Uuid) -> Result<Option<JobRecord>>;
    /// Matching records, oldest submission first.
    fn query(&self, filter: &JobFilter) -> Result<Vec<JobRecord>>;
}

/// In-process store, mostly for tests and the CLI.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<Uuid, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<Uuid, JobRecord>>> {
        self.records
            .lock()
            .map_err(|_| RunnerError::Store("job store lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.records().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, record: &JobRecord) -> Result<()> {
        let mut records = self.records()?;
        if records.contains_key(&record.id) {
            return Err(RunnerError::Store(format!("job {} already stored", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn update(&self, id: Uuid, update: &JobUpdate) -> Result<()> {
        let mut records = self.records()?;
        let record = records.get_mut(&id).ok_or(RunnerError::JobNotFound(id))?;
        if !update.apply_to(record) {
            tracing::debug!(job_id = %id, status = %record.status, "Ignored update to settled job");
        }
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.records()?.get(&id).cloned())
    }

    fn query(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        let now = Utc::now();
        let mut matches: Vec<JobRecord> = self
            .records()?
            .values()
            .filter(|r| filter.matches(r, now))
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.submitted_at);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::ExecutionRequest;
    use crate::ssh::params::ConnectionParams;

    fn record(host: &str, kind: JobKind) -> JobRecord {
        let request = ExecutionRequest::new(
            ConnectionParams::with_password(host, "deploy", "pw"),
            kind,
            "true",
        );
        JobRecord::new(&request)
    }

    #[test]
    fn terminal_records_are_immutable() {
        let store = MemoryJobStore::new();
        let mut rec = record("web1", JobKind::Command);
        store.insert(&rec).unwrap();

        rec.transition(JobStatus::Cancelled, Utc::now());
        store.update(rec.id, &JobUpdate::from_record(&rec)).unwrap();

        let late = JobUpdate {
            status: Some(JobStatus::Success),
            output: Some("late".to_string()),
            ..JobUpdate::default()
        };
        store.update(rec.id, &late).unwrap();

        let stored = store.get(rec.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.output, "");
    }

    #[test]
    fn illegal_moves_are_ignored() {
        let store = MemoryJobStore::new();
        let rec = record("web1", JobKind::Command);
        store.insert(&rec).unwrap();

        let skip = JobUpdate {
            status: Some(JobStatus::Success),
            ..JobUpdate::default()
        };
        store.update(rec.id, &skip).unwrap();
        assert_eq!(store.get(rec.id).unwrap().unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn update_unknown_job_fails() {
        let store = MemoryJobStore::new();
        let err = store.update(Uuid::new_v4(), &JobUpdate::default()).unwrap_err();
        assert!(matches!(err, RunnerError::JobNotFound(_)));
    }

    #[test]
    fn duplicate_insert_fails() {
        let store = MemoryJobStore::new();
        let rec = record("web1", JobKind::Command);
        store.insert(&rec).unwrap();
        assert!(matches!(store.insert(&rec), Err(RunnerError::Store(_))));
    }

    #[test]
    fn query_filters_and_orders() {
        let store = MemoryJobStore::new();
        let mut old = record("web1", JobKind::Command);
        old.submitted_at = Utc::now() - ChronoDuration::hours(30);
        let a = record("web1", JobKind::Command);
        let b = record("web2", JobKind::Transfer);
        for r in [&old, &a, &b] {
            store.insert(r).unwrap();
        }

        assert_eq!(store.query(&JobFilter::new()).unwrap().len(), 3);

        let web1 = store.query(&JobFilter::new().target("deploy@web1:22")).unwrap();
        assert_eq!(web1.len(), 2);
        assert_eq!(web1[0].id, old.id);

        let recent = store
            .query(&JobFilter::new().target("deploy@web1:22").within_last_hours(24))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, a.id);

        let transfers = store.query(&JobFilter::new().kind(JobKind::Transfer)).unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].id, b.id);

        let queued = store.query(&JobFilter::new().status(JobStatus::Queued)).unwrap();
        assert_eq!(queued.len(), 3);
    }
}

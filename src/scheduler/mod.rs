pub mod events;
pub mod job;
pub mod queue;
pub mod registry;
pub mod store;
pub mod tracker;

pub use events::{EventBus, JobEvent};
pub use job::{ExecutionRequest, JobKind, JobOutcome, JobRecord, JobStatus};
pub use queue::PendingQueue;
pub use registry::JobRegistry;
pub use store::{JobFilter, JobStore, JobUpdate, MemoryJobStore};
pub use tracker::{JobContext, Scheduler};

pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    ArchiveFilter, ArchivedCall, CallId, CallRequest, ScheduleId, ScheduledCall, SiloError,
    TaskResourceRecord,
};

pub use memory::MemoryStore;

pub type PersistenceResult<T> = Result<T, SiloError>;

/// A waiting or running call as persisted for revival after a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedCall {
    pub request: CallRequest,
    pub enqueued_at: DateTime<Utc>,
}

pub trait QueuedCallStore: Send + Sync {
    fn insert_queued(&self, queued: &QueuedCall) -> PersistenceResult<()>;

    fn remove_queued(&self, call_id: CallId) -> PersistenceResult<bool>;

    /// All persisted calls in enqueue order, oldest first.
    fn list_queued(&self) -> PersistenceResult<Vec<QueuedCall>>;

    fn max_call_id(&self) -> PersistenceResult<Option<CallId>>;
}

pub trait ScheduleStore: Send + Sync {
    fn insert_schedule(&self, schedule: &ScheduledCall) -> PersistenceResult<()>;

    fn update_schedule(&self, schedule: &ScheduledCall) -> PersistenceResult<bool>;

    fn remove_schedule(&self, id: ScheduleId) -> PersistenceResult<bool>;

    fn schedule(&self, id: ScheduleId) -> PersistenceResult<Option<ScheduledCall>>;

    fn list_schedules(&self) -> PersistenceResult<Vec<ScheduledCall>>;

    fn max_schedule_id(&self) -> PersistenceResult<Option<ScheduleId>>;
}

pub trait ArchiveStore: Send + Sync {
    fn insert_archived(
        &self,
        archived: &ArchivedCall,
        resources: &[TaskResourceRecord],
    ) -> PersistenceResult<()>;

    fn find_archived(&self, filter: &ArchiveFilter) -> PersistenceResult<Vec<ArchivedCall>>;

    fn resources_for(&self, call_id: CallId) -> PersistenceResult<Vec<TaskResourceRecord>>;

    /// Deletes archived calls (and their resource rows) archived strictly
    /// before the cutoff. Returns how many calls were removed.
    fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> PersistenceResult<usize>;

    fn max_call_id(&self) -> PersistenceResult<Option<CallId>>;
}

/// Runs a blocking store operation off the async runtime's worker.
pub(crate) async fn run_blocking<T, F>(operation: F) -> PersistenceResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> PersistenceResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|err| SiloError::internal(format!("store task failed: {err}")))?
}

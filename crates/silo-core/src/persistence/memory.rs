use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::models::{
    ArchiveFilter, ArchivedCall, CallId, ScheduleId, ScheduledCall, SiloError, SiloResult,
    TaskResourceRecord,
};
use crate::persistence::{
    ArchiveStore, PersistenceResult, QueuedCall, QueuedCallStore, ScheduleStore,
};

/// In-memory implementation of every store trait, for tests and embedded
/// use without a database file.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    queued: Vec<QueuedCall>,
    schedules: BTreeMap<ScheduleId, ScheduledCall>,
    archived: Vec<(ArchivedCall, Vec<TaskResourceRecord>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> SiloResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| SiloError::internal("memory store mutex poisoned"))
    }
}

impl QueuedCallStore for MemoryStore {
    fn insert_queued(&self, queued: &QueuedCall) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.queued.push(queued.clone());
        Ok(())
    }

    fn remove_queued(&self, call_id: CallId) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        let before = state.queued.len();
        state.queued.retain(|queued| queued.request.id != call_id);
        Ok(state.queued.len() != before)
    }

    fn list_queued(&self) -> PersistenceResult<Vec<QueuedCall>> {
        let state = self.lock_state()?;
        let mut queued = state.queued.clone();
        queued.sort_by_key(|entry| entry.enqueued_at);
        Ok(queued)
    }

    fn max_call_id(&self) -> PersistenceResult<Option<CallId>> {
        let state = self.lock_state()?;
        Ok(state.queued.iter().map(|queued| queued.request.id).max())
    }
}

impl ScheduleStore for MemoryStore {
    fn insert_schedule(&self, schedule: &ScheduledCall) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    fn update_schedule(&self, schedule: &ScheduledCall) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        match state.schedules.get_mut(&schedule.id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_schedule(&self, id: ScheduleId) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        Ok(state.schedules.remove(&id).is_some())
    }

    fn schedule(&self, id: ScheduleId) -> PersistenceResult<Option<ScheduledCall>> {
        let state = self.lock_state()?;
        Ok(state.schedules.get(&id).cloned())
    }

    fn list_schedules(&self) -> PersistenceResult<Vec<ScheduledCall>> {
        let state = self.lock_state()?;
        Ok(state.schedules.values().cloned().collect())
    }

    fn max_schedule_id(&self) -> PersistenceResult<Option<ScheduleId>> {
        let state = self.lock_state()?;
        Ok(state.schedules.keys().max().copied())
    }
}

impl ArchiveStore for MemoryStore {
    fn insert_archived(
        &self,
        archived: &ArchivedCall,
        resources: &[TaskResourceRecord],
    ) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.archived.push((archived.clone(), resources.to_vec()));
        Ok(())
    }

    fn find_archived(&self, filter: &ArchiveFilter) -> PersistenceResult<Vec<ArchivedCall>> {
        let state = self.lock_state()?;
        Ok(state
            .archived
            .iter()
            .map(|(archived, _)| archived)
            .filter(|archived| matches_filter(archived, filter))
            .cloned()
            .collect())
    }

    fn resources_for(&self, call_id: CallId) -> PersistenceResult<Vec<TaskResourceRecord>> {
        let state = self.lock_state()?;
        Ok(state
            .archived
            .iter()
            .filter(|(archived, _)| archived.call_id() == call_id)
            .flat_map(|(_, resources)| resources.iter().cloned())
            .collect())
    }

    fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> PersistenceResult<usize> {
        let mut state = self.lock_state()?;
        let before = state.archived.len();
        state
            .archived
            .retain(|(archived, _)| archived.archived_at >= cutoff);
        Ok(before - state.archived.len())
    }

    fn max_call_id(&self) -> PersistenceResult<Option<CallId>> {
        let state = self.lock_state()?;
        Ok(state
            .archived
            .iter()
            .map(|(archived, _)| archived.call_id())
            .max())
    }
}

fn matches_filter(archived: &ArchivedCall, filter: &ArchiveFilter) -> bool {
    if let Some(call_id) = filter.call_id
        && archived.call_id() != call_id
    {
        return false;
    }
    if !filter.tags.is_empty() && !archived.request.has_tags(&filter.tags) {
        return false;
    }
    if filter.finished_after.is_some() || filter.finished_before.is_some() {
        let Some(finish_time) = archived.report.finish_time else {
            return false;
        };
        if let Some(after) = filter.finished_after
            && finish_time < after
        {
            return false;
        }
        if let Some(before) = filter.finished_before
            && finish_time > before
        {
            return false;
        }
    }
    true
}

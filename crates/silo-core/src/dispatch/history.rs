use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use crate::models::{
    ArchiveFilter, ArchivedCall, CallId, CallReport, CallRequest, SiloError, SiloResult,
    TaskResourceRecord,
};
use crate::persistence::{ArchiveStore, run_blocking};

/// Writes finished calls into the archive and applies the retention window.
#[derive(Clone)]
pub struct Archiver {
    store: Arc<dyn ArchiveStore>,
    lifetime: Duration,
}

impl Archiver {
    pub fn new(store: Arc<dyn ArchiveStore>, lifetime: Duration) -> Self {
        Self { store, lifetime }
    }

    /// Copies a terminal request/report pair and its declared resources
    /// into the archive.
    pub async fn archive_call(
        &self,
        request: &CallRequest,
        report: &CallReport,
    ) -> SiloResult<()> {
        let archived = ArchivedCall {
            request: request.clone(),
            report: report.clone(),
            archived_at: Utc::now(),
        };
        let resources = resource_records(request);
        let store = Arc::clone(&self.store);
        run_blocking(move || store.insert_archived(&archived, &resources)).await
    }

    pub async fn find_archived_calls(
        &self,
        filter: ArchiveFilter,
    ) -> SiloResult<Vec<ArchivedCall>> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.find_archived(&filter)).await
    }

    pub async fn find_call_resources(
        &self,
        call_id: CallId,
    ) -> SiloResult<Vec<TaskResourceRecord>> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.resources_for(call_id)).await
    }

    /// Removes archived calls older than the configured lifetime. A zero
    /// lifetime purges everything archived so far.
    pub async fn purge_archived_calls(&self) -> SiloResult<usize> {
        let lifetime = ChronoDuration::from_std(self.lifetime)
            .map_err(|_| SiloError::invalid_input("archived call lifetime out of range"))?;
        let cutoff = Utc::now() - lifetime;
        let store = Arc::clone(&self.store);
        run_blocking(move || store.purge_archived_before(cutoff)).await
    }
}

/// Flattens a request's resource set into one row per (type, id) pair.
pub fn resource_records(request: &CallRequest) -> Vec<TaskResourceRecord> {
    request
        .resources
        .iter()
        .map(|(resource_type, resource_id, operation)| TaskResourceRecord {
            call_id: request.id,
            resource_type,
            resource_id: resource_id.to_string(),
            operation,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{CallTarget, ResourceOperation, ResourceType};
    use crate::persistence::MemoryStore;

    fn archived_request(id: u64) -> CallRequest {
        CallRequest::new(CallId(id), CallTarget::new("noop"))
            .declaring(ResourceType::Repository, "zoo", ResourceOperation::Update)
            .with_archive(true)
    }

    #[tokio::test]
    async fn archives_resources_alongside_the_call() {
        let store = Arc::new(MemoryStore::new());
        let archiver = Archiver::new(store, Duration::from_secs(3600));

        let request = archived_request(7);
        let mut report = CallReport::new(&request);
        report.result = Some(json!({"synced": 12}));
        archiver.archive_call(&request, &report).await.unwrap();

        let found = archiver
            .find_archived_calls(ArchiveFilter::by_call_id(CallId(7)))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].report.result, Some(json!({"synced": 12})));

        let resources = archiver.find_call_resources(CallId(7)).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].resource_type, ResourceType::Repository);
        assert_eq!(resources[0].resource_id, "zoo");
        assert_eq!(resources[0].operation, ResourceOperation::Update);
    }

    #[tokio::test]
    async fn zero_lifetime_purges_immediately() {
        let store = Arc::new(MemoryStore::new());
        let archiver = Archiver::new(store, Duration::ZERO);

        let request = archived_request(3);
        let report = CallReport::new(&request);
        archiver.archive_call(&request, &report).await.unwrap();

        let purged = archiver.purge_archived_calls().await.unwrap();
        assert_eq!(purged, 1);
        let found = archiver
            .find_archived_calls(ArchiveFilter::by_call_id(CallId(3)))
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::call::{CallId, CallReport, CallRequest};
use crate::models::resource::{ResourceOperation, ResourceType};

/// Denormalized copy of a finished request/report pair. Written once when
/// the call completes with `archive` set; read-only afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchivedCall {
    pub request: CallRequest,
    pub report: CallReport,
    pub archived_at: DateTime<Utc>,
}

impl ArchivedCall {
    pub fn call_id(&self) -> CallId {
        self.request.id
    }
}

/// One declared resource operation of an archived call.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskResourceRecord {
    pub call_id: CallId,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub operation: ResourceOperation,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFilter {
    #[serde(default)]
    pub call_id: Option<CallId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub finished_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_before: Option<DateTime<Utc>>,
}

impl ArchiveFilter {
    pub fn by_call_id(call_id: CallId) -> Self {
        Self {
            call_id: Some(call_id),
            ..Self::default()
        }
    }

    pub fn by_tags(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn finished_between(after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        Self {
            finished_after: Some(after),
            finished_before: Some(before),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.call_id.is_none()
            && self.tags.is_empty()
            && self.finished_after.is_none()
            && self.finished_before.is_none()
    }
}

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::resource::{ConflictReason, ResourceOperation, ResourceSet, ResourceType};
use crate::models::schedule::ScheduleId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl Display for CallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Waiting,
    Running,
    Suspended,
    Finished,
    Error,
    Canceled,
    Rejected,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Error | Self::Canceled | Self::Rejected
        )
    }

    /// The set of states a completed call can end in, used as the default
    /// awaited set for postponement dependencies.
    pub fn terminal_states() -> BTreeSet<CallState> {
        [Self::Finished, Self::Error, Self::Canceled, Self::Rejected]
            .into_iter()
            .collect()
    }
}

impl std::str::FromStr for CallState {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            "rejected" => Ok(Self::Rejected),
            _ => Err(()),
        }
    }
}

impl Display for CallState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accepted,
    Postponed,
    Rejected,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Enqueue,
    Dispatch,
    Complete,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Dispatch => "dispatch",
            Self::Complete => "complete",
        }
    }
}

/// Lifecycle hooks referenced by registry key so that persisted requests
/// round-trip without serializing closures.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LifecycleHooks {
    #[serde(default)]
    enqueue: Vec<String>,
    #[serde(default)]
    dispatch: Vec<String>,
    #[serde(default)]
    complete: Vec<String>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event: LifecycleEvent, hook_key: impl Into<String>) -> &mut Self {
        self.keys_mut(event).push(hook_key.into());
        self
    }

    pub fn on(&self, event: LifecycleEvent) -> &[String] {
        match event {
            LifecycleEvent::Enqueue => &self.enqueue,
            LifecycleEvent::Dispatch => &self.dispatch,
            LifecycleEvent::Complete => &self.complete,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enqueue.is_empty() && self.dispatch.is_empty() && self.complete.is_empty()
    }

    pub fn iter_keys(&self) -> impl Iterator<Item = &str> {
        self.enqueue
            .iter()
            .chain(self.dispatch.iter())
            .chain(self.complete.iter())
            .map(String::as_str)
    }

    fn keys_mut(&mut self, event: LifecycleEvent) -> &mut Vec<String> {
        match event {
            LifecycleEvent::Enqueue => &mut self.enqueue,
            LifecycleEvent::Dispatch => &mut self.dispatch,
            LifecycleEvent::Complete => &mut self.complete,
        }
    }
}

/// A stable registry key plus JSON arguments. Persisted requests store the
/// key; the callable is resolved through the target registry at submission
/// and at revival.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallTarget {
    pub key: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl CallTarget {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallDependency {
    pub call_id: CallId,
    pub awaited: BTreeSet<CallState>,
}

impl CallDependency {
    pub fn new(call_id: CallId, awaited: impl IntoIterator<Item = CallState>) -> Self {
        Self {
            call_id,
            awaited: awaited.into_iter().collect(),
        }
    }

    /// Wait for the referenced call to reach any terminal state.
    pub fn terminal(call_id: CallId) -> Self {
        Self {
            call_id,
            awaited: CallState::terminal_states(),
        }
    }

    /// Wait specifically for a successful completion.
    pub fn finished(call_id: CallId) -> Self {
        Self::new(call_id, [CallState::Finished])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: CallId,
    pub target: CallTarget,
    #[serde(default)]
    pub resources: ResourceSet,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub dependencies: Vec<CallDependency>,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub callbacks: LifecycleHooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<ScheduleId>,
}

pub(crate) fn default_weight() -> u32 {
    1
}

impl CallRequest {
    pub fn new(id: CallId, target: CallTarget) -> Self {
        Self {
            id,
            target,
            resources: ResourceSet::new(),
            tags: Vec::new(),
            weight: default_weight(),
            dependencies: Vec::new(),
            archive: false,
            callbacks: LifecycleHooks::new(),
            schedule_id: None,
        }
    }

    pub fn declaring(
        mut self,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        operation: ResourceOperation,
    ) -> Self {
        self.resources.declare(resource_type, resource_id, operation);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn depends_on(mut self, dependency: CallDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_hook(mut self, event: LifecycleEvent, hook_key: impl Into<String>) -> Self {
        self.callbacks.add(event, hook_key);
        self
    }

    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }
}

/// Mutable execution record paired 1:1 with a CallRequest. Snapshots are
/// handed out by value; the live record is owned by the task queue and
/// becomes immutable once a terminal state is reached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallReport {
    pub call_id: CallId,
    pub state: CallState,
    pub admission: Admission,
    #[serde(default)]
    pub reasons: Vec<ConflictReason>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<ScheduleId>,
    #[serde(default)]
    pub progress: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
}

impl CallReport {
    pub fn new(request: &CallRequest) -> Self {
        Self {
            call_id: request.id,
            state: CallState::Waiting,
            admission: Admission::Accepted,
            reasons: Vec::new(),
            tags: request.tags.clone(),
            schedule_id: request.schedule_id,
            progress: serde_json::Value::Null,
            result: None,
            error: None,
            error_detail: None,
            start_time: None,
            finish_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }
}

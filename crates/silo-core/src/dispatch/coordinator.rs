//! Submission front door: validates requests, resolves targets and
//! lifecycle callbacks, applies the resource admission policy, and
//! revives persisted calls after a restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::DispatchConfig;
use crate::dispatch::conflict::{ActiveCall, ConflictVerdict, analyze};
use crate::dispatch::history::Archiver;
use crate::dispatch::queue::TaskQueue;
use crate::dispatch::{AdmissionPolicy, AdmitDecision};
use crate::models::{
    ArchiveFilter, ArchivedCall, CallDependency, CallId, CallReport, CallRequest, CallState,
    CallTarget, SiloError, SiloResult, TaskResourceRecord,
};
use crate::persistence::{QueuedCallStore, run_blocking};
use crate::registry::{HookRegistry, ResolvedHooks, TargetFn, TargetRegistry};

/// Default admission policy. Compatible candidates run as soon as their
/// weight fits; candidates conflicting with live calls queue behind every
/// blocker; candidates blocked by a call that can no longer be waited on
/// are rejected.
pub struct ResourceAdmissionPolicy;

impl AdmissionPolicy for ResourceAdmissionPolicy {
    fn decide(&self, candidate: &CallRequest, live: &[ActiveCall]) -> AdmitDecision {
        let analysis = analyze(&candidate.resources, live);
        match analysis.verdict {
            ConflictVerdict::Compatible => AdmitDecision::Accept,
            ConflictVerdict::Postpone => AdmitDecision::Postpone {
                dependencies: analysis
                    .blocking
                    .iter()
                    .map(|blocker| CallDependency::terminal(*blocker))
                    .collect(),
                reasons: analysis.reasons,
            },
            ConflictVerdict::Reject => AdmitDecision::Reject {
                reasons: analysis.reasons,
            },
        }
    }
}

pub struct Coordinator {
    queue: TaskQueue,
    targets: Arc<TargetRegistry>,
    hooks: Arc<HookRegistry>,
    archiver: Archiver,
    store: Arc<dyn QueuedCallStore>,
    policy: Arc<dyn AdmissionPolicy>,
    next_call_id: AtomicU64,
    concurrency_threshold: u32,
}

impl Coordinator {
    pub fn new(
        config: &DispatchConfig,
        queue: TaskQueue,
        targets: Arc<TargetRegistry>,
        hooks: Arc<HookRegistry>,
        archiver: Archiver,
        store: Arc<dyn QueuedCallStore>,
    ) -> Self {
        Self {
            queue,
            targets,
            hooks,
            archiver,
            store,
            policy: Arc::new(ResourceAdmissionPolicy),
            next_call_id: AtomicU64::new(1),
            concurrency_threshold: config.concurrency_threshold,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AdmissionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn next_call_id(&self) -> CallId {
        CallId(self.next_call_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Moves the id allocator past ids already present in the stores, so
    /// revived and fresh calls never collide.
    pub fn seed_call_ids(&self, highest_used: u64) {
        self.next_call_id
            .fetch_max(highest_used.saturating_add(1), Ordering::SeqCst);
    }

    /// Request draft with a freshly allocated id.
    pub fn new_request(&self, target: CallTarget) -> CallRequest {
        CallRequest::new(self.next_call_id(), target)
    }

    /// Validates and enqueues one call. The returned report is the state
    /// as of admission; rejected calls come back already terminal.
    pub async fn submit(&self, request: CallRequest) -> SiloResult<CallReport> {
        let (operation, hooks) = self.validate(&request)?;
        self.queue
            .submit(request, operation, hooks, self.policy.as_ref())
            .await
    }

    /// Submits a batch of calls that may depend on each other, in an order
    /// where every in-group dependency is already enqueued when its
    /// dependent arrives. Reports come back in input order. A dependency
    /// cycle fails the whole group before anything is enqueued.
    pub async fn submit_group(&self, requests: Vec<CallRequest>) -> SiloResult<Vec<CallReport>> {
        let mut seen = HashSet::new();
        for request in &requests {
            if !seen.insert(request.id) {
                return Err(SiloError::invalid_input(format!(
                    "call id '{}' appears more than once in the group",
                    request.id
                )));
            }
        }
        for request in &requests {
            self.validate(request)?;
        }
        let order = topological_order(&requests)?;

        let input_ids: Vec<CallId> = requests.iter().map(|request| request.id).collect();
        let mut slots: Vec<Option<CallRequest>> = requests.into_iter().map(Some).collect();
        let mut reports_by_id = HashMap::new();
        for index in order {
            let Some(request) = slots[index].take() else {
                continue;
            };
            let report = self.submit(request).await?;
            reports_by_id.insert(report.call_id, report);
        }

        let mut ordered = Vec::with_capacity(input_ids.len());
        for call_id in input_ids {
            if let Some(report) = reports_by_id.remove(&call_id) {
                ordered.push(report);
            }
        }
        Ok(ordered)
    }

    /// See [`TaskQueue::cancel`].
    pub async fn cancel_call(&self, call_id: CallId) -> Option<CallState> {
        self.queue.cancel(call_id).await
    }

    pub async fn suspend_call(&self, call_id: CallId) -> SiloResult<()> {
        self.queue.suspend(call_id).await
    }

    pub async fn resume_call(&self, call_id: CallId) -> SiloResult<()> {
        self.queue.resume(call_id).await
    }

    pub async fn call_report(&self, call_id: CallId) -> Option<CallReport> {
        self.queue.report(call_id).await
    }

    pub async fn find_call_reports(&self, tags: &[String]) -> Vec<CallReport> {
        self.queue.find_reports(tags).await
    }

    pub async fn wait_for_completion(
        &self,
        call_id: CallId,
        wait_timeout: Option<Duration>,
    ) -> SiloResult<CallReport> {
        self.queue.wait_for_terminal(call_id, wait_timeout).await
    }

    pub async fn find_archived_calls(
        &self,
        filter: ArchiveFilter,
    ) -> SiloResult<Vec<ArchivedCall>> {
        self.archiver.find_archived_calls(filter).await
    }

    pub async fn archived_call_resources(
        &self,
        call_id: CallId,
    ) -> SiloResult<Vec<TaskResourceRecord>> {
        self.archiver.find_call_resources(call_id).await
    }

    pub async fn purge_archived_calls(&self) -> SiloResult<usize> {
        self.archiver.purge_archived_calls().await
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Resubmits every call persisted before a restart. Rows are removed
    /// first; submission writes them back. Dependencies on calls that are
    /// no longer known are dropped with a warning, and calls that fail to
    /// submit (for example an unregistered target) are skipped rather than
    /// failing the whole revival. Returns how many calls were revived.
    pub async fn revive_queued_calls(&self) -> SiloResult<usize> {
        let store = Arc::clone(&self.store);
        let rows = run_blocking(move || store.list_queued()).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let batch_ids: HashSet<CallId> = rows.iter().map(|row| row.request.id).collect();
        let ids: Vec<CallId> = batch_ids.iter().copied().collect();
        let store = Arc::clone(&self.store);
        run_blocking(move || {
            for call_id in ids {
                store.remove_queued(call_id)?;
            }
            Ok(())
        })
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let mut request = row.request;
            let before = request.dependencies.len();
            request
                .dependencies
                .retain(|dependency| batch_ids.contains(&dependency.call_id));
            if request.dependencies.len() != before {
                tracing::warn!(
                    call_id = request.id.0,
                    "dropped dependencies on calls no longer known after restart"
                );
            }
            pending.push(request);
        }

        let mut revived = 0;
        let mut placed: HashSet<CallId> = HashSet::new();
        loop {
            let mut progressed = false;
            let mut remaining = Vec::new();
            for request in pending {
                let ready = request
                    .dependencies
                    .iter()
                    .all(|dependency| placed.contains(&dependency.call_id));
                if !ready {
                    remaining.push(request);
                    continue;
                }
                let call_id = request.id;
                match self.submit(request).await {
                    Ok(_) => revived += 1,
                    Err(error) => {
                        tracing::warn!(
                            call_id = call_id.0,
                            message = %error,
                            "skipping revival of persisted call"
                        );
                    }
                }
                placed.insert(call_id);
                progressed = true;
            }
            pending = remaining;
            if pending.is_empty() {
                break;
            }
            if !progressed {
                for request in &pending {
                    tracing::warn!(
                        call_id = request.id.0,
                        "skipping revival of call with circular dependencies"
                    );
                }
                break;
            }
        }
        Ok(revived)
    }

    fn validate(&self, request: &CallRequest) -> SiloResult<(Arc<TargetFn>, ResolvedHooks)> {
        if request.weight > self.concurrency_threshold {
            return Err(SiloError::invalid_input(format!(
                "call weight {} exceeds the concurrency threshold {}",
                request.weight, self.concurrency_threshold
            )));
        }
        for (resource_type, resource_id, _) in request.resources.iter() {
            if resource_id.trim().is_empty() {
                return Err(SiloError::invalid_input(format!(
                    "empty id declared for resource type '{resource_type}'"
                )));
            }
        }
        let terminal = CallState::terminal_states();
        for dependency in &request.dependencies {
            if dependency.call_id == request.id {
                return Err(SiloError::invalid_input(format!(
                    "call '{}' cannot depend on itself",
                    request.id
                )));
            }
            if dependency.awaited.is_empty() {
                return Err(SiloError::invalid_input(format!(
                    "dependency on call '{}' awaits no states",
                    dependency.call_id
                )));
            }
            if !dependency.awaited.is_subset(&terminal) {
                return Err(SiloError::invalid_input(format!(
                    "dependency on call '{}' may only await terminal states",
                    dependency.call_id
                )));
            }
        }
        let operation = self.targets.resolve(&request.target.key)?;
        let hooks = self.hooks.resolve_hooks(&request.callbacks)?;
        Ok((operation, hooks))
    }
}

/// Kahn's ordering over the in-group dependency edges. Dependencies on
/// calls outside the group are left for submission to resolve.
fn topological_order(requests: &[CallRequest]) -> SiloResult<Vec<usize>> {
    let index_of: HashMap<CallId, usize> = requests
        .iter()
        .enumerate()
        .map(|(index, request)| (request.id, index))
        .collect();

    let mut indegree = vec![0usize; requests.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); requests.len()];
    for (index, request) in requests.iter().enumerate() {
        for dependency in &request.dependencies {
            if let Some(&dep_index) = index_of.get(&dependency.call_id) {
                indegree[index] += 1;
                dependents[dep_index].push(index);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..requests.len())
        .filter(|&index| indegree[index] == 0)
        .collect();
    let mut order = Vec::with_capacity(requests.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for &dependent in &dependents[index] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() != requests.len() {
        let stuck = requests
            .iter()
            .enumerate()
            .find(|(index, _)| indegree[*index] > 0)
            .map(|(_, request)| request.id)
            .unwrap_or(CallId(0));
        return Err(SiloError::DependencyCycle { id: stuck });
    }
    Ok(order)
}

//! Weighted FIFO dispatch over submitted calls.
//!
//! Submission and dispatch are decoupled: `submit` admits a call into the
//! queue (or rejects it), and a periodic dispatch cycle walks the queue in
//! submission order, starting every waiting call whose dependencies are
//! met and whose weight still fits under the concurrency threshold. Each
//! started call runs on its own tokio task behind a panic boundary, so a
//! misbehaving target can only fail its own report.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::config::DispatchConfig;
use crate::dispatch::cancel::{CancelToken, CancellationRegistry, RunControl};
use crate::dispatch::conflict::ActiveCall;
use crate::dispatch::history::Archiver;
use crate::dispatch::{AdmissionPolicy, AdmitDecision, ShutdownSignal};
use crate::models::{
    Admission, CallDependency, CallId, CallReport, CallRequest, CallState, LifecycleEvent,
    SiloError, SiloResult,
};
use crate::persistence::{QueuedCall, QueuedCallStore, run_blocking};
use crate::registry::{ResolvedHooks, TargetFn, TargetInvocation};

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Mutex<QueueState>>,
    wake: Arc<Notify>,
    cancellations: Arc<CancellationRegistry>,
    store: Arc<dyn QueuedCallStore>,
    archiver: Archiver,
    concurrency_threshold: u32,
    dispatch_interval: Duration,
    poll_interval: Duration,
    cache_life: Duration,
    backlog_limit: usize,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<CallId, CallEntry>,
    submission_order: Vec<CallId>,
    running_weight: u32,
    completed: HashMap<CallId, CompletedCall>,
    waiters: HashMap<CallId, Arc<Notify>>,
}

struct CallEntry {
    request: CallRequest,
    report: CallReport,
    control: RunControl,
    unmet: Vec<CallDependency>,
    operation: Arc<TargetFn>,
    hooks: ResolvedHooks,
    /// Set until the store row exists; keeps the call out of dispatch so a
    /// crash cannot lose an already-started call.
    awaiting_persist: bool,
}

struct CompletedCall {
    report: CallReport,
    cached_at: Instant,
}

/// Everything a worker needs, captured under the lock at admission.
struct Dispatchable {
    request: CallRequest,
    report: CallReport,
    operation: Arc<TargetFn>,
    control: RunControl,
    hooks: ResolvedHooks,
}

/// Terminal outcome applied to a call's report when it leaves the queue.
enum Disposition {
    Finished(Value),
    Canceled(Option<String>),
    Failed {
        message: String,
        detail: Option<String>,
    },
    Rejected {
        message: String,
    },
}

/// A finished call carried out of the lock: store row removal, complete
/// callbacks, and archiving all happen without holding queue state.
struct Settlement {
    request: CallRequest,
    report: CallReport,
    hooks: ResolvedHooks,
}

impl TaskQueue {
    pub fn new(
        config: &DispatchConfig,
        store: Arc<dyn QueuedCallStore>,
        archiver: Archiver,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueState::default())),
            wake: Arc::new(Notify::new()),
            cancellations,
            store,
            archiver,
            concurrency_threshold: config.concurrency_threshold,
            dispatch_interval: config.dispatch_interval,
            poll_interval: config.task_state_poll_interval,
            cache_life: config.completed_call_cache_life,
            backlog_limit: config.queue_backlog_limit,
        }
    }

    /// Admits a call into the queue, or rejects it on the spot. The policy
    /// runs under the queue lock, so its verdict and the insertion are one
    /// atomic step. Returns the report as of admission; rejected calls come
    /// back already terminal.
    pub async fn submit(
        &self,
        request: CallRequest,
        operation: Arc<TargetFn>,
        hooks: ResolvedHooks,
        policy: &dyn AdmissionPolicy,
    ) -> SiloResult<CallReport> {
        let call_id = request.id;
        let token = CancelToken::new();
        let enqueue_hooks = hooks.clone();

        let (report, rejected) = {
            let mut state = self.inner.lock().await;
            purge_cache(&mut state, self.cache_life);

            if state.entries.contains_key(&call_id) || state.completed.contains_key(&call_id) {
                return Err(SiloError::invalid_input(format!(
                    "call id '{call_id}' was already submitted"
                )));
            }
            if state.entries.len() >= self.backlog_limit {
                return Err(SiloError::QueueFull {
                    limit: self.backlog_limit,
                });
            }

            let mut report = CallReport::new(&request);
            let mut unmet = Vec::new();
            let mut unsatisfiable = None;
            for dependency in &request.dependencies {
                if state.entries.contains_key(&dependency.call_id) {
                    unmet.push(dependency.clone());
                } else if let Some(done) = state.completed.get(&dependency.call_id) {
                    if !dependency.awaited.contains(&done.report.state) {
                        unsatisfiable = Some(format!(
                            "dependency call '{}' already completed as '{}', outside the awaited states",
                            dependency.call_id, done.report.state
                        ));
                        break;
                    }
                } else {
                    return Err(SiloError::UnknownDependency {
                        id: dependency.call_id,
                    });
                }
            }

            let live: Vec<ActiveCall> = state
                .submission_order
                .iter()
                .filter_map(|id| state.entries.get(id))
                .map(|entry| ActiveCall {
                    call_id: entry.request.id,
                    state: entry.report.state,
                    resources: entry.request.resources.clone(),
                })
                .collect();
            let decision = policy.decide(&request, &live);

            if let Some(message) = unsatisfiable {
                report.state = CallState::Rejected;
                report.admission = Admission::Rejected;
                report.error = Some(message);
                report.finish_time = Some(Utc::now());
                cache_completed(&mut state, report.clone());
                (report, true)
            } else {
                match decision {
                    AdmitDecision::Reject { reasons } => {
                        report.state = CallState::Rejected;
                        report.admission = Admission::Rejected;
                        report.reasons = reasons;
                        report.error =
                            Some("rejected by the admission policy".to_string());
                        report.finish_time = Some(Utc::now());
                        cache_completed(&mut state, report.clone());
                        (report, true)
                    }
                    AdmitDecision::Postpone {
                        dependencies,
                        reasons,
                    } => {
                        for dependency in dependencies {
                            if dependency.call_id != call_id
                                && !unmet
                                    .iter()
                                    .any(|existing| existing.call_id == dependency.call_id)
                            {
                                unmet.push(dependency);
                            }
                        }
                        report.admission = Admission::Postponed;
                        report.reasons = reasons;
                        insert_live(
                            &mut state,
                            &request,
                            &report,
                            token.clone(),
                            unmet,
                            operation,
                            hooks,
                        );
                        (report, false)
                    }
                    AdmitDecision::Accept => {
                        insert_live(
                            &mut state,
                            &request,
                            &report,
                            token.clone(),
                            unmet,
                            operation,
                            hooks,
                        );
                        (report, false)
                    }
                }
            }
        };

        if rejected {
            if request.archive
                && let Err(error) = self.archiver.archive_call(&request, &report).await
            {
                tracing::error!(
                    call_id = call_id.0,
                    message = %error,
                    "failed to archive rejected call"
                );
            }
            return Ok(report);
        }

        self.cancellations.register(call_id, token).await;

        let row = QueuedCall {
            request: request.clone(),
            enqueued_at: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        if let Err(error) = run_blocking(move || store.insert_queued(&row)).await {
            let mut state = self.inner.lock().await;
            state.entries.remove(&call_id);
            state.submission_order.retain(|id| *id != call_id);
            state.waiters.remove(&call_id);
            drop(state);
            self.cancellations.remove(call_id).await;
            return Err(error);
        }

        let still_live = {
            let mut state = self.inner.lock().await;
            match state.entries.get_mut(&call_id) {
                Some(entry) => {
                    entry.awaiting_persist = false;
                    true
                }
                None => false,
            }
        };
        if !still_live {
            // the call was canceled while its row was being written; drop
            // the row so it is not revived after a restart
            let store = Arc::clone(&self.store);
            if let Err(error) = run_blocking(move || store.remove_queued(call_id)).await {
                tracing::warn!(
                    call_id = call_id.0,
                    message = %error,
                    "failed to drop row for call canceled during submission"
                );
            }
            self.cancellations.remove(call_id).await;
            return Ok(self.report(call_id).await.unwrap_or(report));
        }

        fire_hooks(LifecycleEvent::Enqueue, &enqueue_hooks, &request, &report);
        self.wake.notify_one();
        Ok(report)
    }

    /// One pass over the queue in submission order: starts every waiting
    /// call whose dependencies are met and whose weight fits under the
    /// threshold. Lighter calls further back are still considered when an
    /// earlier one does not fit. Returns how many calls were started.
    pub async fn dispatch_cycle(&self) -> usize {
        let dispatchable = {
            let mut state = self.inner.lock().await;
            purge_cache(&mut state, self.cache_life);
            collect_dispatchable(&mut state, self.concurrency_threshold)
        };

        let started = dispatchable.len();
        for item in dispatchable {
            fire_hooks(LifecycleEvent::Dispatch, &item.hooks, &item.request, &item.report);
            self.spawn_worker(item);
        }
        started
    }

    /// Requests cancellation. A waiting call is canceled immediately; a
    /// running or suspended call has its token raised and is woken out of
    /// any suspension so it can observe the request. Returns `None` when
    /// there is nothing to do (unknown id or already terminal), otherwise
    /// the state the call was left in.
    pub async fn cancel(&self, call_id: CallId) -> Option<CallState> {
        // raise the flag before touching queue state so a running call can
        // see it even while this task waits for the lock
        self.cancellations.cancel(call_id).await;

        let (settlements, resulting) = {
            let mut state = self.inner.lock().await;
            let current = match state.entries.get(&call_id).map(|entry| entry.report.state) {
                Some(current) => current,
                None => return None,
            };
            match current {
                CallState::Waiting => (
                    finish_locked(&mut state, call_id, Disposition::Canceled(None)),
                    CallState::Canceled,
                ),
                CallState::Running | CallState::Suspended => {
                    if let Some(entry) = state.entries.get(&call_id) {
                        entry.control.gate().interrupt();
                    }
                    (Vec::new(), current)
                }
                other => (Vec::new(), other),
            }
        };

        for settlement in settlements {
            self.settle(settlement).await;
        }
        self.wake.notify_one();
        Some(resulting)
    }

    /// Moves a running call to `Suspended`. The call keeps its weight and
    /// parks at its next checkpoint until resumed.
    pub async fn suspend(&self, call_id: CallId) -> SiloResult<()> {
        let mut state = self.inner.lock().await;
        let Some(entry) = state.entries.get_mut(&call_id) else {
            return match state.completed.get(&call_id) {
                Some(done) => Err(SiloError::InvalidTransition {
                    id: call_id,
                    from: done.report.state,
                    to: CallState::Suspended,
                }),
                None => Err(SiloError::UnknownCall { id: call_id }),
            };
        };
        match entry.report.state {
            CallState::Running => {
                entry.report.state = CallState::Suspended;
                entry.control.gate().engage();
                Ok(())
            }
            CallState::Suspended => Ok(()),
            from => Err(SiloError::InvalidTransition {
                id: call_id,
                from,
                to: CallState::Suspended,
            }),
        }
    }

    pub async fn resume(&self, call_id: CallId) -> SiloResult<()> {
        let mut state = self.inner.lock().await;
        let Some(entry) = state.entries.get_mut(&call_id) else {
            return match state.completed.get(&call_id) {
                Some(done) => Err(SiloError::InvalidTransition {
                    id: call_id,
                    from: done.report.state,
                    to: CallState::Running,
                }),
                None => Err(SiloError::UnknownCall { id: call_id }),
            };
        };
        match entry.report.state {
            CallState::Suspended => {
                entry.report.state = CallState::Running;
                entry.control.gate().release();
                Ok(())
            }
            CallState::Running => Ok(()),
            from => Err(SiloError::InvalidTransition {
                id: call_id,
                from,
                to: CallState::Running,
            }),
        }
    }

    /// Current report for a live or recently completed call.
    pub async fn report(&self, call_id: CallId) -> Option<CallReport> {
        let state = self.inner.lock().await;
        if let Some(entry) = state.entries.get(&call_id) {
            let mut report = entry.report.clone();
            report.progress = entry.control.progress();
            return Some(report);
        }
        state.completed.get(&call_id).map(|done| done.report.clone())
    }

    /// Reports of every live and recently completed call carrying all the
    /// given tags. Live calls come first, in submission order.
    pub async fn find_reports(&self, tags: &[String]) -> Vec<CallReport> {
        let state = self.inner.lock().await;
        let mut reports = Vec::new();
        for call_id in &state.submission_order {
            if let Some(entry) = state.entries.get(call_id)
                && entry.report.has_tags(tags)
            {
                let mut report = entry.report.clone();
                report.progress = entry.control.progress();
                reports.push(report);
            }
        }
        for done in state.completed.values() {
            if done.report.has_tags(tags) {
                reports.push(done.report.clone());
            }
        }
        reports
    }

    /// Blocks until the call reaches a terminal state, checking at the
    /// configured poll interval. `None` waits indefinitely.
    pub async fn wait_for_terminal(
        &self,
        call_id: CallId,
        wait_timeout: Option<Duration>,
    ) -> SiloResult<CallReport> {
        let started = Instant::now();
        loop {
            let notify = {
                let state = self.inner.lock().await;
                if let Some(done) = state.completed.get(&call_id) {
                    return Ok(done.report.clone());
                }
                if !state.entries.contains_key(&call_id) {
                    return Err(SiloError::UnknownCall { id: call_id });
                }
                state.waiters.get(&call_id).cloned()
            };

            if let Some(limit) = wait_timeout
                && started.elapsed() >= limit
            {
                return Err(SiloError::Timeout {
                    id: call_id,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            let step = match wait_timeout {
                Some(limit) => self.poll_interval.min(limit.saturating_sub(started.elapsed())),
                None => self.poll_interval,
            };
            match notify {
                Some(notify) => {
                    let _ = timeout(step, notify.notified()).await;
                }
                None => tokio::time::sleep(step).await,
            }
        }
    }

    pub async fn running_weight(&self) -> u32 {
        self.inner.lock().await.running_weight
    }

    /// Number of calls currently waiting, running, or suspended.
    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Dispatch loop: fires a cycle on every interval tick and whenever a
    /// submission or completion wakes it early.
    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        let mut ticker = tokio::time::interval(self.dispatch_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.wait() => break,
            }
            if shutdown.is_triggered() {
                break;
            }
            self.dispatch_cycle().await;
        }
    }

    fn spawn_worker(&self, dispatchable: Dispatchable) {
        let queue = self.clone();
        let Dispatchable {
            request,
            operation,
            control,
            ..
        } = dispatchable;
        let call_id = request.id;
        let args = request.target.args.clone();
        let watch = control.clone();

        tokio::spawn(async move {
            // the nested task is the panic boundary: a panicking target
            // surfaces as a JoinError instead of taking the worker down
            let guarded =
                tokio::spawn(
                    async move { operation(TargetInvocation { args, control }).await },
                );
            let disposition = match guarded.await {
                Ok(Ok(result)) => {
                    if watch.is_canceled() {
                        Disposition::Canceled(None)
                    } else {
                        Disposition::Finished(result)
                    }
                }
                Ok(Err(error)) => {
                    if error.is_cancellation() || watch.is_canceled() {
                        Disposition::Canceled(Some(error.to_string()))
                    } else {
                        Disposition::Failed {
                            message: error.to_string(),
                            detail: Some(format!("{error:?}")),
                        }
                    }
                }
                Err(join_error) if join_error.is_panic() => Disposition::Failed {
                    message: panic_summary(join_error.into_panic()),
                    detail: None,
                },
                Err(_) => Disposition::Canceled(Some("task aborted".to_string())),
            };
            queue.complete(call_id, disposition).await;
        });
    }

    async fn complete(&self, call_id: CallId, disposition: Disposition) {
        let settlements = {
            let mut state = self.inner.lock().await;
            finish_locked(&mut state, call_id, disposition)
        };
        for settlement in settlements {
            self.settle(settlement).await;
        }
        self.wake.notify_one();
    }

    async fn settle(&self, settlement: Settlement) {
        let Settlement {
            request,
            report,
            hooks,
        } = settlement;
        let call_id = request.id;

        let store = Arc::clone(&self.store);
        if let Err(error) = run_blocking(move || store.remove_queued(call_id)).await {
            tracing::error!(
                call_id = call_id.0,
                message = %error,
                "failed to remove completed call from the store"
            );
        }

        fire_hooks(LifecycleEvent::Complete, &hooks, &request, &report);

        if request.archive
            && let Err(error) = self.archiver.archive_call(&request, &report).await
        {
            tracing::error!(
                call_id = call_id.0,
                message = %error,
                "failed to archive completed call"
            );
        }

        self.cancellations.remove(call_id).await;
    }
}

fn insert_live(
    state: &mut QueueState,
    request: &CallRequest,
    report: &CallReport,
    token: CancelToken,
    unmet: Vec<CallDependency>,
    operation: Arc<TargetFn>,
    hooks: ResolvedHooks,
) {
    let call_id = request.id;
    state.entries.insert(
        call_id,
        CallEntry {
            request: request.clone(),
            report: report.clone(),
            control: RunControl::new(call_id, token),
            unmet,
            operation,
            hooks,
            awaiting_persist: true,
        },
    );
    state.submission_order.push(call_id);
    state.waiters.insert(call_id, Arc::new(Notify::new()));
}

fn collect_dispatchable(state: &mut QueueState, threshold: u32) -> Vec<Dispatchable> {
    let mut picked = Vec::new();
    let QueueState {
        entries,
        submission_order,
        running_weight,
        ..
    } = state;

    for call_id in submission_order.iter() {
        let Some(entry) = entries.get_mut(call_id) else {
            continue;
        };
        if entry.report.state != CallState::Waiting
            || entry.awaiting_persist
            || !entry.unmet.is_empty()
        {
            continue;
        }
        if running_weight.saturating_add(entry.request.weight) > threshold {
            // a lighter call further back may still fit
            continue;
        }

        entry.report.state = CallState::Running;
        entry.report.start_time = Some(Utc::now());
        *running_weight += entry.request.weight;
        picked.push(Dispatchable {
            request: entry.request.clone(),
            report: entry.report.clone(),
            operation: Arc::clone(&entry.operation),
            control: entry.control.clone(),
            hooks: entry.hooks.clone(),
        });
    }
    picked
}

/// Removes the call from the live set, applies its terminal disposition,
/// and cascades: any dependent whose awaited states can no longer be
/// reached is rejected in the same pass.
fn finish_locked(
    state: &mut QueueState,
    call_id: CallId,
    disposition: Disposition,
) -> Vec<Settlement> {
    let mut settlements = Vec::new();
    let mut worklist = vec![(call_id, disposition)];

    while let Some((current_id, disposition)) = worklist.pop() {
        let Some(mut entry) = state.entries.remove(&current_id) else {
            continue;
        };
        state.submission_order.retain(|id| *id != current_id);
        if matches!(
            entry.report.state,
            CallState::Running | CallState::Suspended
        ) {
            state.running_weight = state.running_weight.saturating_sub(entry.request.weight);
        }

        apply_disposition(&mut entry.report, disposition, &entry.control);
        let terminal_state = entry.report.state;
        cache_completed(state, entry.report.clone());
        if let Some(waiter) = state.waiters.get(&current_id) {
            waiter.notify_waiters();
        }

        for (dependent_id, dependent) in state.entries.iter_mut() {
            let mut unsatisfiable = false;
            dependent.unmet.retain(|dependency| {
                if dependency.call_id != current_id {
                    return true;
                }
                if !dependency.awaited.contains(&terminal_state) {
                    unsatisfiable = true;
                }
                false
            });
            if unsatisfiable {
                worklist.push((
                    *dependent_id,
                    Disposition::Rejected {
                        message: format!(
                            "dependency call '{current_id}' completed as '{terminal_state}', outside the awaited states"
                        ),
                    },
                ));
            }
        }

        settlements.push(Settlement {
            request: entry.request,
            report: entry.report,
            hooks: entry.hooks,
        });
    }
    settlements
}

fn apply_disposition(report: &mut CallReport, disposition: Disposition, control: &RunControl) {
    report.finish_time = Some(Utc::now());
    report.progress = control.progress();
    match disposition {
        Disposition::Finished(result) => {
            report.state = CallState::Finished;
            report.result = Some(result);
        }
        Disposition::Canceled(message) => {
            report.state = CallState::Canceled;
            report.error = message;
        }
        Disposition::Failed { message, detail } => {
            report.state = CallState::Error;
            report.error = Some(message);
            report.error_detail = detail;
        }
        Disposition::Rejected { message } => {
            report.state = CallState::Rejected;
            report.error = Some(message);
        }
    }
}

fn cache_completed(state: &mut QueueState, report: CallReport) {
    state.completed.insert(
        report.call_id,
        CompletedCall {
            report,
            cached_at: Instant::now(),
        },
    );
}

fn purge_cache(state: &mut QueueState, cache_life: Duration) {
    let now = Instant::now();
    let QueueState {
        completed, waiters, ..
    } = state;
    completed.retain(|call_id, done| {
        if now.duration_since(done.cached_at) < cache_life {
            true
        } else {
            waiters.remove(call_id);
            false
        }
    });
}

fn fire_hooks(
    event: LifecycleEvent,
    hooks: &ResolvedHooks,
    request: &CallRequest,
    report: &CallReport,
) {
    for hook in hooks.on(event) {
        if std::panic::catch_unwind(AssertUnwindSafe(|| hook(request, report))).is_err() {
            tracing::error!(
                call_id = request.id.0,
                event = event.as_str(),
                "lifecycle callback panicked"
            );
        }
    }
}

fn panic_summary(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}

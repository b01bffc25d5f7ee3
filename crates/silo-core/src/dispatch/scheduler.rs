//! Interval-driven firing of stored schedules.
//!
//! Each pass walks every stored schedule, materializes a call for the
//! ones whose firing instant has arrived, and submits it through the
//! coordinator. Missed instants are skipped rather than burst: a process
//! that was down for three intervals fires once and moves on. Outcomes
//! feed a consecutive-failure counter that disables the schedule past its
//! threshold.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::DispatchConfig;
use crate::dispatch::coordinator::Coordinator;
use crate::dispatch::{Clock, ShutdownSignal};
use crate::models::{
    CallId, CallState, CallTemplate, ScheduleId, ScheduledCall, SiloError, SiloResult,
};
use crate::persistence::{ScheduleStore, run_blocking};

/// Partial update applied to a stored schedule; unset fields keep their
/// current value.
#[derive(Clone, Debug, Default)]
pub struct ScheduleUpdate {
    pub schedule: Option<String>,
    pub failure_threshold: Option<Option<u32>>,
    pub enabled: Option<bool>,
    pub template: Option<CallTemplate>,
}

pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    /// Serializes every read-modify-write of schedule rows, including the
    /// outcome watchers that run after a firing completes.
    update_lock: Arc<Mutex<()>>,
    next_schedule_id: AtomicU64,
}

impl Scheduler {
    pub fn new(
        config: &DispatchConfig,
        coordinator: Arc<Coordinator>,
        store: Arc<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            store,
            clock,
            interval: config.scheduler_dispatch_interval,
            update_lock: Arc::new(Mutex::new(())),
            next_schedule_id: AtomicU64::new(1),
        }
    }

    /// Moves the id allocator past ids already present in the store.
    pub fn seed_schedule_ids(&self, highest_used: u64) {
        self.next_schedule_id
            .fetch_max(highest_used.saturating_add(1), Ordering::SeqCst);
    }

    /// Creates and persists a schedule. New schedules start enabled; the
    /// first firing instant comes from the recurrence's start time, or one
    /// interval from now when none is given.
    pub async fn add_schedule(
        &self,
        template: CallTemplate,
        schedule: impl Into<String>,
        failure_threshold: Option<u32>,
    ) -> SiloResult<ScheduledCall> {
        let _guard = self.update_lock.lock().await;
        let id = ScheduleId(self.next_schedule_id.fetch_add(1, Ordering::SeqCst));
        let row = ScheduledCall::new(
            id,
            template,
            schedule,
            failure_threshold,
            true,
            self.clock.now_utc(),
        )?;
        let stored = row.clone();
        let store = Arc::clone(&self.store);
        run_blocking(move || store.insert_schedule(&stored)).await?;
        Ok(row)
    }

    /// Applies a partial update. Replacing the recurrence restarts the
    /// schedule: fresh `next_run`, fresh bounded-run count, failure
    /// counter cleared. Re-enabling clears the failure counter and skips
    /// past any firings missed while disabled.
    pub async fn update_schedule(
        &self,
        id: ScheduleId,
        update: ScheduleUpdate,
    ) -> SiloResult<ScheduledCall> {
        let _guard = self.update_lock.lock().await;
        let mut row = self
            .load(id)
            .await?
            .ok_or(SiloError::UnknownSchedule { id })?;
        let now = self.clock.now_utc();

        if let Some(template) = update.template {
            row.template = template;
        }
        if let Some(threshold) = update.failure_threshold {
            if threshold == Some(0) {
                return Err(SiloError::invalid_input("failure_threshold must be positive"));
            }
            row.failure_threshold = threshold;
        }
        if let Some(schedule) = update.schedule {
            let replacement = ScheduledCall::new(
                row.id,
                row.template.clone(),
                schedule,
                row.failure_threshold,
                row.enabled,
                now,
            )?;
            row.schedule = replacement.schedule;
            row.first_run = replacement.first_run;
            row.next_run = replacement.next_run;
            row.remaining_runs = replacement.remaining_runs;
            row.consecutive_failures = 0;
        }
        if let Some(enabled) = update.enabled {
            if enabled && !row.enabled {
                row.consecutive_failures = 0;
                row.skip_to_future(now)?;
            }
            row.enabled = enabled;
        }

        self.persist(row.clone()).await?;
        Ok(row)
    }

    pub async fn enable_schedule(&self, id: ScheduleId) -> SiloResult<ScheduledCall> {
        self.update_schedule(
            id,
            ScheduleUpdate {
                enabled: Some(true),
                ..ScheduleUpdate::default()
            },
        )
        .await
    }

    pub async fn disable_schedule(&self, id: ScheduleId) -> SiloResult<ScheduledCall> {
        self.update_schedule(
            id,
            ScheduleUpdate {
                enabled: Some(false),
                ..ScheduleUpdate::default()
            },
        )
        .await
    }

    pub async fn remove_schedule(&self, id: ScheduleId) -> SiloResult<bool> {
        let _guard = self.update_lock.lock().await;
        let store = Arc::clone(&self.store);
        run_blocking(move || store.remove_schedule(id)).await
    }

    pub async fn schedule(&self, id: ScheduleId) -> SiloResult<Option<ScheduledCall>> {
        self.load(id).await
    }

    pub async fn list_schedules(&self) -> SiloResult<Vec<ScheduledCall>> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.list_schedules()).await
    }

    pub async fn find_schedules_by_tags(&self, tags: &[String]) -> SiloResult<Vec<ScheduledCall>> {
        let tags = tags.to_vec();
        let store = Arc::clone(&self.store);
        run_blocking(move || {
            Ok(store
                .list_schedules()?
                .into_iter()
                .filter(|row| row.has_tags(&tags))
                .collect())
        })
        .await
    }

    /// One scheduler pass: fires every enabled schedule whose instant has
    /// arrived, advances recurrences past missed instants, and removes
    /// exhausted rows. Returns how many calls were submitted.
    pub async fn dispatch_due(&self) -> SiloResult<usize> {
        let _guard = self.update_lock.lock().await;
        let now = self.clock.now_utc();
        let store = Arc::clone(&self.store);
        let schedules = run_blocking(move || store.list_schedules()).await?;

        let mut fired = 0;
        for mut row in schedules {
            if !row.enabled {
                match row.skip_to_future(now) {
                    Ok(true) => self.persist(row).await?,
                    Ok(false) => {}
                    Err(error) => tracing::error!(
                        schedule_id = row.id.0,
                        message = %error,
                        "failed to advance disabled schedule"
                    ),
                }
                continue;
            }
            if !row.is_due(now) {
                continue;
            }

            let schedule_id = row.id;
            let request = row
                .template
                .materialize(self.coordinator.next_call_id(), schedule_id);
            let call_id = request.id;
            let submitted = self.coordinator.submit(request).await;
            if let Err(error) = row.advance_after_firing(now) {
                tracing::error!(
                    schedule_id = schedule_id.0,
                    message = %error,
                    "failed to advance schedule after firing"
                );
            }
            match submitted {
                Ok(report) if report.state == CallState::Rejected => {
                    fired += 1;
                    apply_outcome(&mut row, CallState::Rejected);
                }
                Ok(_) => {
                    fired += 1;
                    self.spawn_outcome_watcher(call_id, schedule_id);
                }
                Err(error) => {
                    tracing::error!(
                        schedule_id = schedule_id.0,
                        call_id = call_id.0,
                        message = %error,
                        "scheduled call failed to submit"
                    );
                    apply_outcome(&mut row, CallState::Error);
                }
            }

            if row.is_exhausted() {
                let store = Arc::clone(&self.store);
                run_blocking(move || store.remove_schedule(schedule_id)).await?;
            } else {
                self.persist(row).await?;
            }
        }
        Ok(fired)
    }

    /// Scheduler loop: one `dispatch_due` pass per interval tick.
    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            if shutdown.is_triggered() {
                break;
            }
            if let Err(error) = self.dispatch_due().await {
                tracing::error!(message = %error, "scheduler pass failed");
            }
        }
    }

    fn spawn_outcome_watcher(&self, call_id: CallId, schedule_id: ScheduleId) {
        let coordinator = Arc::clone(&self.coordinator);
        let store = Arc::clone(&self.store);
        let update_lock = Arc::clone(&self.update_lock);
        tokio::spawn(async move {
            let report = match coordinator.wait_for_completion(call_id, None).await {
                Ok(report) => report,
                Err(error) => {
                    tracing::error!(
                        schedule_id = schedule_id.0,
                        call_id = call_id.0,
                        message = %error,
                        "failed to observe scheduled call outcome"
                    );
                    return;
                }
            };

            let _guard = update_lock.lock().await;
            let fetched = {
                let store = Arc::clone(&store);
                run_blocking(move || store.schedule(schedule_id)).await
            };
            let mut row = match fetched {
                Ok(Some(row)) => row,
                // removed or exhausted while the call ran
                Ok(None) => return,
                Err(error) => {
                    tracing::error!(
                        schedule_id = schedule_id.0,
                        message = %error,
                        "failed to load schedule for outcome accounting"
                    );
                    return;
                }
            };
            apply_outcome(&mut row, report.state);
            if let Err(error) = run_blocking(move || store.update_schedule(&row)).await {
                tracing::error!(
                    schedule_id = schedule_id.0,
                    message = %error,
                    "failed to record scheduled call outcome"
                );
            }
        });
    }

    async fn load(&self, id: ScheduleId) -> SiloResult<Option<ScheduledCall>> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.schedule(id)).await
    }

    async fn persist(&self, row: ScheduledCall) -> SiloResult<()> {
        let id = row.id;
        let store = Arc::clone(&self.store);
        let updated = run_blocking(move || store.update_schedule(&row)).await?;
        if updated {
            Ok(())
        } else {
            Err(SiloError::UnknownSchedule { id })
        }
    }
}

/// Failure accounting: a finished call clears the counter, an error or
/// rejection increments it (disabling the schedule past the threshold),
/// and a canceled call leaves it untouched.
fn apply_outcome(row: &mut ScheduledCall, state: CallState) {
    match state {
        CallState::Finished => row.consecutive_failures = 0,
        CallState::Error | CallState::Rejected => {
            row.consecutive_failures = row.consecutive_failures.saturating_add(1);
            if let Some(threshold) = row.failure_threshold
                && row.consecutive_failures >= threshold
            {
                row.enabled = false;
                tracing::warn!(
                    schedule_id = row.id.0,
                    failures = row.consecutive_failures,
                    "schedule disabled after consecutive failures"
                );
            }
        }
        _ => {}
    }
}

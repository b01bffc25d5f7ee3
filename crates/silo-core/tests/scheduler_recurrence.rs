use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use silo_core::config::DispatchConfig;
use silo_core::dispatch::{
    Archiver, CancellationRegistry, Clock, Coordinator, ScheduleUpdate, Scheduler, ShutdownSignal,
    TaskQueue,
};
use silo_core::models::{
    CallState, CallTarget, CallTemplate, ScheduleId, ScheduledCall, SiloError,
};
use silo_core::persistence::MemoryStore;
use silo_core::registry::{HookRegistry, TargetRegistry};

/// Hand-cranked clock so tests control when instants arrive.
struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    fn starting_at(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: std::sync::Mutex::new(start),
        })
    }

    fn advance(&self, step: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + step;
    }

    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap()
}

struct SchedulerStack {
    coordinator: Arc<Coordinator>,
    scheduler: Scheduler,
    clock: Arc<ManualClock>,
    shutdown: Arc<ShutdownSignal>,
}

fn stack(targets: TargetRegistry) -> SchedulerStack {
    let config = DispatchConfig {
        dispatch_interval: Duration::from_millis(20),
        task_state_poll_interval: Duration::from_millis(10),
        ..DispatchConfig::default()
    };
    let store = Arc::new(MemoryStore::new());
    let archiver = Archiver::new(store.clone(), config.archived_call_lifetime);
    let queue = TaskQueue::new(
        &config,
        store.clone(),
        archiver.clone(),
        Arc::new(CancellationRegistry::new()),
    );
    let coordinator = Arc::new(Coordinator::new(
        &config,
        queue,
        Arc::new(targets),
        Arc::new(HookRegistry::new()),
        archiver,
        store.clone(),
    ));
    let clock = ManualClock::starting_at(base_time());
    let scheduler = Scheduler::new(&config, coordinator.clone(), store, clock.clone());

    let shutdown = Arc::new(ShutdownSignal::new());
    let runner_queue = coordinator.queue().clone();
    let signal = shutdown.clone();
    tokio::spawn(async move { runner_queue.run(signal).await });
    SchedulerStack {
        coordinator,
        scheduler,
        clock,
        shutdown,
    }
}

fn counting(runs: Arc<AtomicUsize>) -> TargetRegistry {
    let mut targets = TargetRegistry::new();
    targets.register("mirror.sync", move |_invocation| {
        let runs = runs.clone();
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!("mirrored"))
        }
    });
    targets
}

fn failing(attempts: Arc<AtomicUsize>) -> TargetRegistry {
    let mut targets = TargetRegistry::new();
    targets.register("mirror.sync", move |_invocation| {
        let attempts = attempts.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SiloError::execution("mirror responded 503"))
        }
    });
    targets
}

fn template() -> CallTemplate {
    CallTemplate::new(CallTarget::new("mirror.sync"))
}

/// Outcome accounting runs in a spawned watcher, so schedule rows are
/// polled until the expectation holds.
async fn reload_until(
    scheduler: &Scheduler,
    id: ScheduleId,
    expectation: impl Fn(&ScheduledCall) -> bool,
) -> ScheduledCall {
    for _ in 0..200 {
        if let Some(row) = scheduler.schedule(id).await.unwrap()
            && expectation(&row)
        {
            return row;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("schedule {id} never reached the expected state");
}

#[tokio::test]
async fn a_schedule_fires_when_its_instant_arrives() {
    let runs = Arc::new(AtomicUsize::new(0));
    let stack = stack(counting(runs.clone()));

    let row = stack
        .scheduler
        .add_schedule(template(), "PT1H", None)
        .await
        .unwrap();
    assert_eq!(row.next_run.unwrap(), base_time() + chrono::Duration::hours(1));
    assert!(row.last_run.is_none());

    // nothing due yet
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 0);
    stack.clock.advance(chrono::Duration::minutes(61));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 1);

    let tag = format!("schedule:{}", row.id);
    let reports = stack.coordinator.find_call_reports(&[tag]).await;
    assert_eq!(reports.len(), 1);
    let report = stack
        .coordinator
        .wait_for_completion(reports[0].call_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(report.state, CallState::Finished);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // last_run records the scheduled instant, not the wall clock
    let reloaded = stack.scheduler.schedule(row.id).await.unwrap().unwrap();
    assert_eq!(reloaded.last_run.unwrap(), base_time() + chrono::Duration::hours(1));
    assert_eq!(reloaded.next_run.unwrap(), base_time() + chrono::Duration::hours(2));
    stack.shutdown.trigger();
}

#[tokio::test]
async fn downtime_collapses_missed_firings_into_one() {
    let runs = Arc::new(AtomicUsize::new(0));
    let stack = stack(counting(runs.clone()));

    let row = stack
        .scheduler
        .add_schedule(template(), "PT1H", None)
        .await
        .unwrap();

    // five instants elapse unobserved; only one call fires
    stack.clock.advance(chrono::Duration::hours(5) + chrono::Duration::minutes(2));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 1);

    let tag = format!("schedule:{}", row.id);
    let reports = stack.coordinator.find_call_reports(&[tag]).await;
    assert_eq!(reports.len(), 1);
    stack
        .coordinator
        .wait_for_completion(reports[0].call_id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let reloaded = stack.scheduler.schedule(row.id).await.unwrap().unwrap();
    assert_eq!(reloaded.last_run.unwrap(), base_time() + chrono::Duration::hours(1));
    assert_eq!(reloaded.next_run.unwrap(), base_time() + chrono::Duration::hours(6));
    stack.shutdown.trigger();
}

#[tokio::test]
async fn consecutive_failures_disable_at_the_threshold() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let stack = stack(failing(attempts.clone()));

    let row = stack
        .scheduler
        .add_schedule(template(), "PT1H", Some(2))
        .await
        .unwrap();

    stack.clock.advance(chrono::Duration::minutes(61));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 1);
    let after_first = reload_until(&stack.scheduler, row.id, |r| r.consecutive_failures == 1).await;
    assert!(after_first.enabled);

    stack.clock.advance(chrono::Duration::hours(1));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 1);
    let after_second = reload_until(&stack.scheduler, row.id, |r| r.consecutive_failures == 2).await;
    assert!(!after_second.enabled);

    // disabled rows are skipped, not fired
    stack.clock.advance(chrono::Duration::hours(1));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    stack.shutdown.trigger();
}

#[tokio::test]
async fn reenabling_clears_failures_and_skips_the_backlog() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let stack = stack(failing(attempts));

    let row = stack
        .scheduler
        .add_schedule(template(), "PT1H", Some(1))
        .await
        .unwrap();

    stack.clock.advance(chrono::Duration::minutes(61));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 1);
    reload_until(&stack.scheduler, row.id, |r| !r.enabled && r.consecutive_failures == 1).await;

    // three further instants pass while disabled
    stack.clock.advance(chrono::Duration::hours(3));
    let revived = stack.scheduler.enable_schedule(row.id).await.unwrap();
    assert!(revived.enabled);
    assert_eq!(revived.consecutive_failures, 0);
    assert!(!revived.is_due(stack.clock.now()));

    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 0);
    stack.clock.advance(chrono::Duration::minutes(61));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 1);
    stack.shutdown.trigger();
}

#[tokio::test]
async fn bounded_schedules_exhaust_and_are_removed() {
    let runs = Arc::new(AtomicUsize::new(0));
    let stack = stack(counting(runs.clone()));

    let row = stack
        .scheduler
        .add_schedule(template(), "R2/PT1H", None)
        .await
        .unwrap();
    assert_eq!(row.remaining_runs, Some(2));

    stack.clock.advance(chrono::Duration::minutes(61));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 1);
    let reloaded = stack.scheduler.schedule(row.id).await.unwrap().unwrap();
    assert_eq!(reloaded.remaining_runs, Some(1));

    stack.clock.advance(chrono::Duration::hours(1));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 1);
    // second firing exhausted the schedule; the row is gone
    assert!(stack.scheduler.schedule(row.id).await.unwrap().is_none());

    let tag = format!("schedule:{}", row.id);
    let reports = stack.coordinator.find_call_reports(&[tag]).await;
    assert_eq!(reports.len(), 2);
    for report in reports {
        let done = stack
            .coordinator
            .wait_for_completion(report.call_id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(done.state, CallState::Finished);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    stack.clock.advance(chrono::Duration::hours(1));
    assert_eq!(stack.scheduler.dispatch_due().await.unwrap(), 0);
    stack.shutdown.trigger();
}

#[tokio::test]
async fn replacing_the_recurrence_restarts_it() {
    let runs = Arc::new(AtomicUsize::new(0));
    let stack = stack(counting(runs));

    let row = stack
        .scheduler
        .add_schedule(template(), "PT2H", None)
        .await
        .unwrap();
    assert_eq!(row.next_run.unwrap(), base_time() + chrono::Duration::hours(2));

    stack.clock.advance(chrono::Duration::minutes(30));
    let updated = stack
        .scheduler
        .update_schedule(
            row.id,
            ScheduleUpdate {
                schedule: Some("PT1H".to_string()),
                ..ScheduleUpdate::default()
            },
        )
        .await
        .unwrap();
    // the replacement counts from the moment of the update
    assert_eq!(updated.next_run.unwrap(), base_time() + chrono::Duration::minutes(90));
    assert_eq!(updated.consecutive_failures, 0);

    let error = stack
        .scheduler
        .update_schedule(
            row.id,
            ScheduleUpdate {
                failure_threshold: Some(Some(0)),
                ..ScheduleUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(error, SiloError::InvalidInput { ref message }
        if message.contains("failure_threshold must be positive")));

    let error = stack
        .scheduler
        .update_schedule(ScheduleId(77), ScheduleUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(error, SiloError::UnknownSchedule { id: ScheduleId(77) }));

    let error = stack
        .scheduler
        .add_schedule(template(), "every hour", None)
        .await
        .unwrap_err();
    assert!(matches!(error, SiloError::InvalidInput { .. }));
    stack.shutdown.trigger();
}

#[tokio::test]
async fn schedules_are_findable_by_template_tags() {
    let runs = Arc::new(AtomicUsize::new(0));
    let stack = stack(counting(runs));

    let nightly = stack
        .scheduler
        .add_schedule(
            template().with_tag("tier:nightly").with_tag("content:rpm"),
            "P1D",
            None,
        )
        .await
        .unwrap();
    let hourly = stack
        .scheduler
        .add_schedule(template().with_tag("content:rpm"), "PT1H", None)
        .await
        .unwrap();

    let found = stack
        .scheduler
        .find_schedules_by_tags(&["tier:nightly".to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, nightly.id);

    let rpm = stack
        .scheduler
        .find_schedules_by_tags(&["content:rpm".to_string()])
        .await
        .unwrap();
    assert_eq!(rpm.len(), 2);

    assert!(stack
        .scheduler
        .find_schedules_by_tags(&["content:deb".to_string()])
        .await
        .unwrap()
        .is_empty());

    assert!(stack.scheduler.remove_schedule(hourly.id).await.unwrap());
    assert!(!stack.scheduler.remove_schedule(hourly.id).await.unwrap());
    assert_eq!(stack.scheduler.list_schedules().await.unwrap().len(), 1);
    stack.shutdown.trigger();
}

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use silo_core::config::DispatchConfig;
use silo_core::dispatch::{
    Archiver, CancellationRegistry, Coordinator, ShutdownSignal, TaskQueue,
};
use silo_core::models::{
    ArchiveFilter, ArchivedCall, CallId, CallReport, CallRequest, CallState, CallTarget,
    CallTemplate, ResourceOperation, ResourceType, ScheduleId, ScheduledCall, TaskResourceRecord,
};
use silo_core::persistence::{ArchiveStore, QueuedCall, QueuedCallStore, ScheduleStore};
use silo_core::registry::{HookRegistry, TargetRegistry};
use silo_core::sqlite::SqliteStore;

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("silo-{test_name}-{nanos}.sqlite3"))
}

fn coordinator_over(store: Arc<SqliteStore>, targets: TargetRegistry) -> Arc<Coordinator> {
    let config = DispatchConfig {
        dispatch_interval: Duration::from_millis(20),
        task_state_poll_interval: Duration::from_millis(10),
        ..DispatchConfig::default()
    };
    let archiver = Archiver::new(store.clone(), config.archived_call_lifetime);
    let queue = TaskQueue::new(
        &config,
        store.clone(),
        archiver.clone(),
        Arc::new(CancellationRegistry::new()),
    );
    Arc::new(Coordinator::new(
        &config,
        queue,
        Arc::new(targets),
        Arc::new(HookRegistry::new()),
        archiver,
        store,
    ))
}

fn archived(
    id: u64,
    target_key: &str,
    tags: &[&str],
    finish_time: DateTime<Utc>,
    archived_at: DateTime<Utc>,
) -> ArchivedCall {
    let mut request = CallRequest::new(CallId(id), CallTarget::new(target_key));
    for tag in tags {
        request = request.with_tag(*tag);
    }
    let mut report = CallReport::new(&request);
    report.state = CallState::Finished;
    report.result = Some(json!({"ok": true}));
    report.start_time = Some(finish_time - chrono::Duration::minutes(1));
    report.finish_time = Some(finish_time);
    ArchivedCall {
        request,
        report,
        archived_at,
    }
}

#[tokio::test]
async fn queued_calls_survive_a_process_restart() {
    let path = test_db_path("queued-restart");

    // first process: enqueue without ever dispatching
    {
        let store = Arc::new(SqliteStore::new(&path));
        let mut targets = TargetRegistry::new();
        targets.register("repo.sync", |_invocation| async move { Ok(json!("synced")) });
        let coordinator = coordinator_over(store.clone(), targets);

        let request = coordinator
            .new_request(CallTarget::new("repo.sync"))
            .with_tag("repo:zoo");
        coordinator.submit(request).await.unwrap();
        assert_eq!(store.list_queued().unwrap().len(), 1);
    }

    // second process: revive from the same database and run to completion
    let ran = Arc::new(AtomicBool::new(false));
    let store = Arc::new(SqliteStore::new(&path));
    let mut targets = TargetRegistry::new();
    {
        let ran = ran.clone();
        targets.register("repo.sync", move |_invocation| {
            let ran = ran.clone();
            async move {
                ran.store(true, Ordering::SeqCst);
                Ok(json!("synced"))
            }
        });
    }
    let coordinator = coordinator_over(store.clone(), targets);
    if let Some(CallId(highest)) = QueuedCallStore::max_call_id(store.as_ref()).unwrap() {
        coordinator.seed_call_ids(highest);
    }
    assert_eq!(coordinator.revive_queued_calls().await.unwrap(), 1);

    let shutdown = Arc::new(ShutdownSignal::new());
    let runner_queue = coordinator.queue().clone();
    let signal = shutdown.clone();
    tokio::spawn(async move { runner_queue.run(signal).await });

    let report = coordinator
        .wait_for_completion(CallId(1), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(report.state, CallState::Finished);
    assert!(report.tags.contains(&"repo:zoo".to_string()));
    assert!(ran.load(Ordering::SeqCst));

    // the completed call leaves no revival row behind
    for _ in 0..100 {
        if store.list_queued().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.list_queued().unwrap().is_empty());
    shutdown.trigger();
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn revival_drops_calls_whose_target_vanished() {
    let path = test_db_path("revival-vanished-target");

    {
        let store = Arc::new(SqliteStore::new(&path));
        let mut targets = TargetRegistry::new();
        targets.register("repo.sync", |_invocation| async move { Ok(json!("synced")) });
        let coordinator = coordinator_over(store.clone(), targets);

        let request = coordinator.new_request(CallTarget::new("repo.sync"));
        coordinator.submit(request).await.unwrap();
        assert_eq!(store.list_queued().unwrap().len(), 1);
    }

    // second process boots without the target registered
    let store = Arc::new(SqliteStore::new(&path));
    let coordinator = coordinator_over(store.clone(), TargetRegistry::new());
    assert_eq!(coordinator.revive_queued_calls().await.unwrap(), 0);

    // the orphaned row is gone and nothing entered the queue
    assert!(store.list_queued().unwrap().is_empty());
    assert_eq!(coordinator.queue().live_count().await, 0);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn queued_rows_list_in_enqueue_order_not_id_order() {
    let path = test_db_path("queued-order");
    let store = SqliteStore::new(&path);
    let base = Utc.with_ymd_and_hms(2026, 2, 20, 12, 0, 0).unwrap();

    store
        .insert_queued(&QueuedCall {
            request: CallRequest::new(CallId(9), CallTarget::new("repo.sync")),
            enqueued_at: base,
        })
        .unwrap();
    store
        .insert_queued(&QueuedCall {
            request: CallRequest::new(CallId(1), CallTarget::new("repo.sync")),
            enqueued_at: base + chrono::Duration::minutes(1),
        })
        .unwrap();

    let ids: Vec<CallId> = store
        .list_queued()
        .unwrap()
        .into_iter()
        .map(|row| row.request.id)
        .collect();
    assert_eq!(ids, vec![CallId(9), CallId(1)]);
    assert!(store.remove_queued(CallId(9)).unwrap());
    assert!(!store.remove_queued(CallId(9)).unwrap());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn schedule_rows_round_trip_with_their_offsets() {
    let path = test_db_path("schedule-roundtrip");
    let store = SqliteStore::new(&path);

    let template = CallTemplate::new(CallTarget::new("mirror.sync"))
        .with_tag("tier:nightly")
        .with_archive(true);
    let now = Utc.with_ymd_and_hms(2026, 2, 20, 12, 0, 0).unwrap();
    let row = ScheduledCall::new(
        ScheduleId(4),
        template,
        "R3/2026-03-01T09:30:00+05:30/P1D",
        Some(2),
        true,
        now,
    )
    .unwrap();
    store.insert_schedule(&row).unwrap();

    let fetched = store.schedule(ScheduleId(4)).unwrap().unwrap();
    assert_eq!(fetched, row);
    assert_eq!(fetched.remaining_runs, Some(3));
    assert_eq!(fetched.failure_threshold, Some(2));
    // the declared +05:30 offset survives storage
    let next = fetched.next_run.unwrap();
    assert_eq!(next.offset().local_minus_utc(), 5 * 3600 + 30 * 60);

    let mut mutated = fetched.clone();
    mutated.consecutive_failures = 1;
    mutated.enabled = false;
    mutated.last_run = Some(next);
    assert!(store.update_schedule(&mutated).unwrap());
    let reloaded = store.schedule(ScheduleId(4)).unwrap().unwrap();
    assert_eq!(reloaded, mutated);
    assert!(!reloaded.enabled);

    let mut stray = mutated.clone();
    stray.id = ScheduleId(9);
    assert!(!store.update_schedule(&stray).unwrap());

    assert!(store.remove_schedule(ScheduleId(4)).unwrap());
    assert!(!store.remove_schedule(ScheduleId(4)).unwrap());
    assert!(store.schedule(ScheduleId(4)).unwrap().is_none());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn archives_are_filterable_and_keep_resources() {
    let path = test_db_path("archive-filters");
    let store = SqliteStore::new(&path);
    let base = Utc.with_ymd_and_hms(2026, 2, 20, 10, 0, 0).unwrap();
    let archived_at = Utc.with_ymd_and_hms(2026, 2, 20, 13, 0, 0).unwrap();

    let first = archived(
        1,
        "content.rpm.sync",
        &["action:sync", "repo:zoo"],
        base,
        archived_at,
    );
    let first_resources = [
        TaskResourceRecord {
            call_id: CallId(1),
            resource_type: ResourceType::Repository,
            resource_id: "zoo".to_string(),
            operation: ResourceOperation::Update,
        },
        TaskResourceRecord {
            call_id: CallId(1),
            resource_type: ResourceType::Importer,
            resource_id: "rpm".to_string(),
            operation: ResourceOperation::Read,
        },
    ];
    store.insert_archived(&first, &first_resources).unwrap();
    store
        .insert_archived(
            &archived(
                2,
                "content.rpm.publish",
                &["action:publish", "repo:zoo"],
                base + chrono::Duration::hours(1),
                archived_at,
            ),
            &[],
        )
        .unwrap();
    store
        .insert_archived(
            &archived(
                3,
                "content.rpm.sync",
                &["action:sync", "repo:other"],
                base + chrono::Duration::hours(2),
                archived_at,
            ),
            &[],
        )
        .unwrap();

    let ids = |rows: Vec<ArchivedCall>| -> Vec<CallId> {
        rows.into_iter().map(|row| row.call_id()).collect()
    };

    let syncs = store
        .find_archived(&ArchiveFilter::by_tags(["action:sync"]))
        .unwrap();
    assert_eq!(ids(syncs), vec![CallId(1), CallId(3)]);

    let zoo_syncs = store
        .find_archived(&ArchiveFilter::by_tags(["action:sync", "repo:zoo"]))
        .unwrap();
    assert_eq!(ids(zoo_syncs), vec![CallId(1)]);

    let by_id = store
        .find_archived(&ArchiveFilter::by_call_id(CallId(2)))
        .unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].report.state, CallState::Finished);
    assert_eq!(by_id[0].request.target.key, "content.rpm.publish");

    let window = store
        .find_archived(&ArchiveFilter::finished_between(
            base + chrono::Duration::minutes(30),
            base + chrono::Duration::minutes(90),
        ))
        .unwrap();
    assert_eq!(ids(window), vec![CallId(2)]);

    let everything = store.find_archived(&ArchiveFilter::default()).unwrap();
    assert_eq!(ids(everything), vec![CallId(1), CallId(2), CallId(3)]);

    // resource rows come back ordered by type then id
    let resources = store.resources_for(CallId(1)).unwrap();
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0].resource_type, ResourceType::Importer);
    assert_eq!(resources[0].resource_id, "rpm");
    assert_eq!(resources[1].resource_type, ResourceType::Repository);
    assert_eq!(resources[1].operation, ResourceOperation::Update);
    assert!(store.resources_for(CallId(2)).unwrap().is_empty());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn purge_removes_old_archives_with_their_satellites() {
    let path = test_db_path("archive-purge");
    let store = SqliteStore::new(&path);
    let now = Utc::now();

    let stale = archived(
        1,
        "content.rpm.sync",
        &["stale:yes"],
        now - chrono::Duration::hours(3),
        now - chrono::Duration::hours(2),
    );
    let stale_resources = [TaskResourceRecord {
        call_id: CallId(1),
        resource_type: ResourceType::Repository,
        resource_id: "zoo".to_string(),
        operation: ResourceOperation::Update,
    }];
    store.insert_archived(&stale, &stale_resources).unwrap();
    store
        .insert_archived(
            &archived(2, "content.rpm.sync", &["stale:no"], now, now),
            &[],
        )
        .unwrap();

    assert_eq!(
        store
            .purge_archived_before(now - chrono::Duration::hours(1))
            .unwrap(),
        1
    );

    let remaining = store.find_archived(&ArchiveFilter::default()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].call_id(), CallId(2));
    assert!(store.resources_for(CallId(1)).unwrap().is_empty());
    assert!(store
        .find_archived(&ArchiveFilter::by_tags(["stale:yes"]))
        .unwrap()
        .is_empty());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn max_ids_come_from_each_table_independently() {
    let path = test_db_path("max-ids");
    let store = SqliteStore::new(&path);
    let now = Utc::now();

    assert_eq!(QueuedCallStore::max_call_id(&store).unwrap(), None);
    assert_eq!(ArchiveStore::max_call_id(&store).unwrap(), None);
    assert_eq!(store.max_schedule_id().unwrap(), None);

    store
        .insert_queued(&QueuedCall {
            request: CallRequest::new(CallId(9), CallTarget::new("repo.sync")),
            enqueued_at: now,
        })
        .unwrap();
    assert_eq!(
        QueuedCallStore::max_call_id(&store).unwrap(),
        Some(CallId(9))
    );

    store
        .insert_archived(&archived(12, "repo.sync", &[], now, now), &[])
        .unwrap();
    assert_eq!(
        ArchiveStore::max_call_id(&store).unwrap(),
        Some(CallId(12))
    );

    let schedule = ScheduledCall::new(
        ScheduleId(7),
        CallTemplate::new(CallTarget::new("mirror.sync")),
        "PT1H",
        None,
        true,
        now,
    )
    .unwrap();
    store.insert_schedule(&schedule).unwrap();
    assert_eq!(store.max_schedule_id().unwrap(), Some(ScheduleId(7)));
    let _ = std::fs::remove_file(&path);
}

//! Sqlite-backed implementation of the persistence traits. One file-backed
//! database holds the revival queue, the schedule table, and the archive;
//! every operation opens its own connection and upgrades the schema to the
//! latest migration before touching a table.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::{Connection, params};

use crate::models::{
    ArchiveFilter, ArchivedCall, CallId, ResourceOperation, ResourceType, ScheduleId,
    ScheduledCall, SiloError, TaskResourceRecord,
};
use crate::persistence::{
    ArchiveStore, PersistenceResult, QueuedCall, QueuedCallStore, ScheduleStore,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "silo_schema_migrations";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    /// Walks the schema to `target_version`, applying up migrations when
    /// moving forward and down migrations in reverse when moving back.
    pub fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(SiloError::storage(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }
        if target_version > 0 && migration(target_version).is_none() {
            return Err(SiloError::storage(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current = read_current_version(connection)?;
            if target_version > current {
                for version in (current + 1)..=target_version {
                    let entry = migration(version).expect("validated migration version must exist");
                    apply_up_migration(connection, entry)?;
                }
            } else if target_version < current {
                for version in ((target_version + 1)..=current).rev() {
                    let entry = migration(version).expect("validated migration version must exist");
                    apply_down_migration(connection, entry)?;
                }
            }
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl QueuedCallStore for SqliteStore {
    fn insert_queued(&self, queued: &QueuedCall) -> PersistenceResult<()> {
        self.with_connection("insert_queued", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO queued_calls (call_id, request_json, enqueued_at)
VALUES (?1, ?2, ?3)
",
                params![
                    id_to_i64(queued.request.id.0)?,
                    json_to_text(&queued.request)?,
                    queued.enqueued_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn remove_queued(&self, call_id: CallId) -> PersistenceResult<bool> {
        self.with_connection("remove_queued", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute(
                "DELETE FROM queued_calls WHERE call_id = ?1",
                params![id_to_i64(call_id.0)?],
            )?;
            Ok(deleted > 0)
        })
    }

    fn list_queued(&self) -> PersistenceResult<Vec<QueuedCall>> {
        self.with_connection("list_queued", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT request_json, enqueued_at
FROM queued_calls
ORDER BY enqueued_at, call_id
",
            )?;
            let rows = statement.query_map([], |row| {
                let request_raw: String = row.get(0)?;
                let enqueued_raw: String = row.get(1)?;
                Ok(QueuedCall {
                    request: text_to_json(&request_raw)?,
                    enqueued_at: text_to_utc(&enqueued_raw)?,
                })
            })?;
            rows.collect()
        })
    }

    fn max_call_id(&self) -> PersistenceResult<Option<CallId>> {
        self.with_connection("max_queued_call_id", |connection| {
            ensure_schema_ready(connection)?;
            let max: Option<i64> =
                connection.query_row("SELECT MAX(call_id) FROM queued_calls", [], |row| {
                    row.get(0)
                })?;
            max.map(|value| Ok(CallId(i64_to_id(value)?))).transpose()
        })
    }
}

impl ScheduleStore for SqliteStore {
    fn insert_schedule(&self, schedule: &ScheduledCall) -> PersistenceResult<()> {
        self.with_connection("insert_schedule", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO schedules (
    schedule_id, template_json, schedule, failure_threshold, consecutive_failures,
    enabled, first_run, last_run, next_run, remaining_runs
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
",
                params![
                    id_to_i64(schedule.id.0)?,
                    json_to_text(&schedule.template)?,
                    schedule.schedule.as_str(),
                    schedule.failure_threshold.map(i64::from),
                    i64::from(schedule.consecutive_failures),
                    bool_to_sqlite(schedule.enabled),
                    schedule.first_run.to_rfc3339(),
                    schedule.last_run.map(|at| at.to_rfc3339()),
                    schedule.next_run.map(|at| at.to_rfc3339()),
                    schedule.remaining_runs.map(i64::from),
                ],
            )?;
            Ok(())
        })
    }

    fn update_schedule(&self, schedule: &ScheduledCall) -> PersistenceResult<bool> {
        self.with_connection("update_schedule", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "
UPDATE schedules
SET template_json = ?2, schedule = ?3, failure_threshold = ?4,
    consecutive_failures = ?5, enabled = ?6, first_run = ?7,
    last_run = ?8, next_run = ?9, remaining_runs = ?10
WHERE schedule_id = ?1
",
                params![
                    id_to_i64(schedule.id.0)?,
                    json_to_text(&schedule.template)?,
                    schedule.schedule.as_str(),
                    schedule.failure_threshold.map(i64::from),
                    i64::from(schedule.consecutive_failures),
                    bool_to_sqlite(schedule.enabled),
                    schedule.first_run.to_rfc3339(),
                    schedule.last_run.map(|at| at.to_rfc3339()),
                    schedule.next_run.map(|at| at.to_rfc3339()),
                    schedule.remaining_runs.map(i64::from),
                ],
            )?;
            Ok(updated > 0)
        })
    }

    fn remove_schedule(&self, id: ScheduleId) -> PersistenceResult<bool> {
        self.with_connection("remove_schedule", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute(
                "DELETE FROM schedules WHERE schedule_id = ?1",
                params![id_to_i64(id.0)?],
            )?;
            Ok(deleted > 0)
        })
    }

    fn schedule(&self, id: ScheduleId) -> PersistenceResult<Option<ScheduledCall>> {
        self.with_connection("schedule", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT schedule_id, template_json, schedule, failure_threshold, consecutive_failures,
       enabled, first_run, last_run, next_run, remaining_runs
FROM schedules
WHERE schedule_id = ?1
",
            )?;
            let mut rows = statement.query(params![id_to_i64(id.0)?])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            Ok(Some(schedule_from_row(row)?))
        })
    }

    fn list_schedules(&self) -> PersistenceResult<Vec<ScheduledCall>> {
        self.with_connection("list_schedules", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT schedule_id, template_json, schedule, failure_threshold, consecutive_failures,
       enabled, first_run, last_run, next_run, remaining_runs
FROM schedules
ORDER BY schedule_id
",
            )?;
            let rows = statement.query_map([], schedule_from_row)?;
            rows.collect()
        })
    }

    fn max_schedule_id(&self) -> PersistenceResult<Option<ScheduleId>> {
        self.with_connection("max_schedule_id", |connection| {
            ensure_schema_ready(connection)?;
            let max: Option<i64> =
                connection.query_row("SELECT MAX(schedule_id) FROM schedules", [], |row| {
                    row.get(0)
                })?;
            max.map(|value| Ok(ScheduleId(i64_to_id(value)?))).transpose()
        })
    }
}

impl ArchiveStore for SqliteStore {
    fn insert_archived(
        &self,
        archived: &ArchivedCall,
        resources: &[TaskResourceRecord],
    ) -> PersistenceResult<()> {
        self.with_connection("insert_archived", |connection| {
            ensure_schema_ready(connection)?;
            let call_id = id_to_i64(archived.call_id().0)?;
            let transaction = connection.transaction()?;

            transaction.execute(
                "
INSERT INTO archived_calls (
    call_id, schedule_id, target_key, state, request_json, report_json,
    finish_time, archived_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
",
                params![
                    call_id,
                    archived
                        .request
                        .schedule_id
                        .map(|id| id_to_i64(id.0))
                        .transpose()?,
                    archived.request.target.key.as_str(),
                    archived.report.state.as_str(),
                    json_to_text(&archived.request)?,
                    json_to_text(&archived.report)?,
                    archived.report.finish_time.map(|at| at.to_rfc3339()),
                    archived.archived_at.to_rfc3339(),
                ],
            )?;

            {
                let mut tag_statement = transaction
                    .prepare("INSERT INTO archived_call_tags (call_id, tag) VALUES (?1, ?2)")?;
                for tag in &archived.request.tags {
                    tag_statement.execute(params![call_id, tag.as_str()])?;
                }

                let mut resource_statement = transaction.prepare(
                    "
INSERT INTO task_resources (call_id, resource_type, resource_id, operation)
VALUES (?1, ?2, ?3, ?4)
",
                )?;
                for record in resources {
                    resource_statement.execute(params![
                        id_to_i64(record.call_id.0)?,
                        record.resource_type.as_str(),
                        record.resource_id.as_str(),
                        record.operation.as_str(),
                    ])?;
                }
            }

            transaction.commit()?;
            Ok(())
        })
    }

    fn find_archived(&self, filter: &ArchiveFilter) -> PersistenceResult<Vec<ArchivedCall>> {
        self.with_connection("find_archived", |connection| {
            ensure_schema_ready(connection)?;

            let mut sql = String::from(
                "SELECT request_json, report_json, archived_at FROM archived_calls WHERE 1=1",
            );
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(call_id) = filter.call_id {
                sql.push_str(" AND call_id = ?");
                values.push(Box::new(id_to_i64(call_id.0)?));
            }
            if let Some(after) = filter.finished_after {
                sql.push_str(" AND finish_time IS NOT NULL AND finish_time >= ?");
                values.push(Box::new(after.to_rfc3339()));
            }
            if let Some(before) = filter.finished_before {
                sql.push_str(" AND finish_time IS NOT NULL AND finish_time <= ?");
                values.push(Box::new(before.to_rfc3339()));
            }
            for tag in &filter.tags {
                sql.push_str(
                    " AND call_id IN (SELECT call_id FROM archived_call_tags WHERE tag = ?)",
                );
                values.push(Box::new(tag.clone()));
            }
            sql.push_str(" ORDER BY call_id");

            let mut statement = connection.prepare(&sql)?;
            let bindings: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|value| value.as_ref()).collect();
            let rows = statement.query_map(bindings.as_slice(), |row| {
                let request_raw: String = row.get(0)?;
                let report_raw: String = row.get(1)?;
                let archived_raw: String = row.get(2)?;
                Ok(ArchivedCall {
                    request: text_to_json(&request_raw)?,
                    report: text_to_json(&report_raw)?,
                    archived_at: text_to_utc(&archived_raw)?,
                })
            })?;
            rows.collect()
        })
    }

    fn resources_for(&self, call_id: CallId) -> PersistenceResult<Vec<TaskResourceRecord>> {
        self.with_connection("resources_for", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT resource_type, resource_id, operation
FROM task_resources
WHERE call_id = ?1
ORDER BY resource_type, resource_id
",
            )?;
            let rows = statement.query_map(params![id_to_i64(call_id.0)?], |row| {
                let type_raw: String = row.get(0)?;
                let resource_id: String = row.get(1)?;
                let operation_raw: String = row.get(2)?;
                Ok(TaskResourceRecord {
                    call_id,
                    resource_type: parse_resource_type(&type_raw)?,
                    resource_id,
                    operation: parse_resource_operation(&operation_raw)?,
                })
            })?;
            rows.collect()
        })
    }

    fn purge_archived_before(&self, cutoff: DateTime<Utc>) -> PersistenceResult<usize> {
        self.with_connection("purge_archived_before", |connection| {
            ensure_schema_ready(connection)?;
            let cutoff = cutoff.to_rfc3339();
            let transaction = connection.transaction()?;

            transaction.execute(
                "
DELETE FROM archived_call_tags
WHERE call_id IN (SELECT call_id FROM archived_calls WHERE archived_at < ?1)
",
                params![cutoff.as_str()],
            )?;
            transaction.execute(
                "
DELETE FROM task_resources
WHERE call_id IN (SELECT call_id FROM archived_calls WHERE archived_at < ?1)
",
                params![cutoff.as_str()],
            )?;
            let purged = transaction.execute(
                "DELETE FROM archived_calls WHERE archived_at < ?1",
                params![cutoff.as_str()],
            )?;

            transaction.commit()?;
            Ok(purged)
        })
    }

    fn max_call_id(&self) -> PersistenceResult<Option<CallId>> {
        self.with_connection("max_archived_call_id", |connection| {
            ensure_schema_ready(connection)?;
            let max: Option<i64> =
                connection.query_row("SELECT MAX(call_id) FROM archived_calls", [], |row| {
                    row.get(0)
                })?;
            max.map(|value| Ok(CallId(i64_to_id(value)?))).transpose()
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    Connection::open(database_path)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS silo_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

/// Brings the schema to the latest version before a table is touched. A
/// database created by an older build upgrades in place on first use.
fn ensure_schema_ready(connection: &mut Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let current = read_current_version(connection)?;
    for entry in migrations().iter().filter(|entry| entry.version > current) {
        apply_up_migration(connection, entry)?;
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn schedule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledCall> {
    let schedule_id: i64 = row.get(0)?;
    let template_raw: String = row.get(1)?;
    let schedule: String = row.get(2)?;
    let failure_threshold: Option<i64> = row.get(3)?;
    let consecutive_failures: i64 = row.get(4)?;
    let enabled: i64 = row.get(5)?;
    let first_run_raw: String = row.get(6)?;
    let last_run_raw: Option<String> = row.get(7)?;
    let next_run_raw: Option<String> = row.get(8)?;
    let remaining_runs: Option<i64> = row.get(9)?;

    Ok(ScheduledCall {
        id: ScheduleId(i64_to_id(schedule_id)?),
        template: text_to_json(&template_raw)?,
        schedule,
        failure_threshold: opt_i64_to_u32(failure_threshold)?,
        consecutive_failures: i64_to_u32(consecutive_failures)?,
        enabled: sqlite_to_bool(enabled),
        first_run: text_to_offset(&first_run_raw)?,
        last_run: last_run_raw.as_deref().map(text_to_offset).transpose()?,
        next_run: next_run_raw.as_deref().map(text_to_offset).transpose()?,
        remaining_runs: opt_i64_to_u32(remaining_runs)?,
    })
}

fn storage_error(operation: &str, error: rusqlite::Error) -> SiloError {
    SiloError::storage(operation, error)
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn json_to_text<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| storage_error_sqlite(&format!("failed to serialize record: {error}")))
}

fn text_to_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|error| storage_error_sqlite(&format!("malformed persisted record: {error}")))
}

fn text_to_utc(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    Ok(text_to_offset(raw)?.with_timezone(&Utc))
}

/// Parses an RFC 3339 instant preserving its original UTC offset.
fn text_to_offset(raw: &str) -> rusqlite::Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .map_err(|error| storage_error_sqlite(&format!("malformed persisted timestamp: {error}")))
}

fn parse_resource_type(raw: &str) -> rusqlite::Result<ResourceType> {
    raw.parse::<ResourceType>().map_err(|_| {
        storage_error_sqlite(&format!("unknown resource type '{raw}' in sqlite record"))
    })
}

fn parse_resource_operation(raw: &str) -> rusqlite::Result<ResourceOperation> {
    raw.parse::<ResourceOperation>().map_err(|_| {
        storage_error_sqlite(&format!("unknown resource operation '{raw}' in sqlite record"))
    })
}

fn id_to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("id exceeds i64 range"))
}

fn i64_to_id(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative id in sqlite record"))
}

fn i64_to_u32(value: i64) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| storage_error_sqlite("counter out of range in sqlite record"))
}

fn opt_i64_to_u32(value: Option<i64>) -> rusqlite::Result<Option<u32>> {
    value.map(i64_to_u32).transpose()
}

fn bool_to_sqlite(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

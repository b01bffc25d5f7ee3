#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_dispatch_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS queued_calls (
    call_id INTEGER PRIMARY KEY,
    request_json TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    schedule_id INTEGER PRIMARY KEY,
    template_json TEXT NOT NULL,
    schedule TEXT NOT NULL,
    failure_threshold INTEGER,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    first_run TEXT NOT NULL,
    last_run TEXT,
    next_run TEXT,
    remaining_runs INTEGER
);

CREATE TABLE IF NOT EXISTS archived_calls (
    call_id INTEGER PRIMARY KEY,
    schedule_id INTEGER,
    target_key TEXT NOT NULL,
    state TEXT NOT NULL,
    request_json TEXT NOT NULL,
    report_json TEXT NOT NULL,
    finish_time TEXT,
    archived_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archived_call_tags (
    call_id INTEGER NOT NULL,
    tag TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_resources (
    call_id INTEGER NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    operation TEXT NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS task_resources;
DROP TABLE IF EXISTS archived_call_tags;
DROP TABLE IF EXISTS archived_calls;
DROP TABLE IF EXISTS schedules;
DROP TABLE IF EXISTS queued_calls;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_archive_lookup_indexes",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_archived_call_tags_tag
    ON archived_call_tags (tag, call_id);

CREATE INDEX IF NOT EXISTS idx_archived_calls_archived_at
    ON archived_calls (archived_at);

CREATE INDEX IF NOT EXISTS idx_task_resources_call
    ON task_resources (call_id);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_resources_call;
DROP INDEX IF EXISTS idx_archived_calls_archived_at;
DROP INDEX IF EXISTS idx_archived_call_tags_tag;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}

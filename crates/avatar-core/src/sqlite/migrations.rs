#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_task_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS avatar_tasks (
    task_id INTEGER PRIMARY KEY,
    owner_id TEXT NOT NULL,
    linked_record_id TEXT,
    image_url TEXT NOT NULL,
    audio_url TEXT NOT NULL,
    duration_seconds REAL,
    prompt TEXT,
    seed INTEGER,
    fast_mode INTEGER NOT NULL DEFAULT 0,
    multi_subject INTEGER NOT NULL DEFAULT 0,
    stage TEXT NOT NULL,
    recognition_task_ref TEXT,
    mask_candidates_json TEXT,
    selected_mask_index INTEGER,
    generation_task_ref TEXT,
    result_video_url TEXT,
    result_tagged INTEGER,
    error_message TEXT,
    created_at_unix INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_avatar_tasks_owner_created
    ON avatar_tasks (owner_id, created_at_unix DESC);

CREATE TABLE IF NOT EXISTS task_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    stage TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_events_task
    ON task_events (task_id, event_id);

CREATE TABLE IF NOT EXISTS linked_records (
    record_id TEXT PRIMARY KEY,
    audio_url TEXT,
    updated_at_unix INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS linked_records;
DROP INDEX IF EXISTS idx_task_events_task;
DROP TABLE IF EXISTS task_events;
DROP INDEX IF EXISTS idx_avatar_tasks_owner_created;
DROP TABLE IF EXISTS avatar_tasks;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_failure_record_and_processing_flag",
    up_sql: r#"
ALTER TABLE avatar_tasks ADD COLUMN failure_kind TEXT;
ALTER TABLE avatar_tasks ADD COLUMN failed_stage TEXT;
ALTER TABLE avatar_tasks ADD COLUMN processing INTEGER NOT NULL DEFAULT 0;
"#,
    down_sql: r#"
ALTER TABLE avatar_tasks DROP COLUMN processing;
ALTER TABLE avatar_tasks DROP COLUMN failed_stage;
ALTER TABLE avatar_tasks DROP COLUMN failure_kind;
"#,
};

const MIGRATION_0003: SqliteMigration = SqliteMigration {
    version: 3,
    name: "add_processing_lease_owner_and_expiry",
    up_sql: r#"
ALTER TABLE avatar_tasks ADD COLUMN processing_owner TEXT;
ALTER TABLE avatar_tasks ADD COLUMN lease_expires_at_unix INTEGER;
"#,
    down_sql: r#"
ALTER TABLE avatar_tasks DROP COLUMN lease_expires_at_unix;
ALTER TABLE avatar_tasks DROP COLUMN processing_owner;
"#,
};

const MIGRATIONS: [SqliteMigration; 3] = [MIGRATION_0001, MIGRATION_0002, MIGRATION_0003];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}

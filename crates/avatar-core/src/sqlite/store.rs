use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::models::{
    AvatarTask, CoreError, CoreErrorKind, FailureRecord, NewTask, NewTaskEvent, TaskEventLevel,
    TaskEventRecord, TaskId, TaskPatch, TaskStage,
};
use crate::persistence::{
    LinkedRecordStore, MigrationStore, PersistenceResult, TaskStore, task_not_found,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "avatar_schema_migrations";

const TASK_COLUMNS: &str = "
    task_id, owner_id, linked_record_id, image_url, audio_url, duration_seconds, prompt, seed,
    fast_mode, multi_subject, stage, recognition_task_ref, mask_candidates_json,
    selected_mask_index, generation_task_ref, result_video_url, result_tagged, error_message,
    failure_kind, failed_stage, created_at_unix, updated_at_unix
";

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

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
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

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            create_ledger_table(connection)?;
            recorded_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        let latest = current_schema_version();
        if !(0..=latest).contains(&target_version) {
            return Err(store_error(
                "apply_migration",
                format!("schema version {target_version} is outside 0..={latest}"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            create_ledger_table(connection)?;
            let recorded = recorded_version(connection)?;

            if target_version == recorded {
                // Re-run every step so tables lost behind a recorded version come back.
                for version in 1..=target_version {
                    run_schema_sql(connection, schema_step(version)?.up_sql)?;
                }
            } else if target_version > recorded {
                for version in (recorded + 1)..=target_version {
                    run_schema_step(connection, schema_step(version)?, StepDirection::Forward)?;
                }
            } else {
                for version in ((target_version + 1)..=recorded).rev() {
                    run_schema_step(connection, schema_step(version)?, StepDirection::Backward)?;
                }
            }
            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn create_task(&self, task: &NewTask) -> PersistenceResult<AvatarTask> {
        self.with_connection("create_task", |connection| {
            ensure_schema_ready(connection)?;
            let now = to_unix_seconds(SystemTime::now())?;
            connection.execute(
                "
INSERT INTO avatar_tasks (
    owner_id, linked_record_id, image_url, audio_url, duration_seconds, prompt, seed,
    fast_mode, multi_subject, stage, created_at_unix, updated_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
",
                params![
                    task.owner_id.as_str(),
                    task.linked_record_id.as_deref(),
                    task.image_url.as_str(),
                    task.audio_url.as_str(),
                    task.duration_seconds,
                    task.prompt.as_deref(),
                    task.seed,
                    bool_to_sqlite(task.fast_mode),
                    bool_to_sqlite(task.multi_subject),
                    TaskStage::UploadingAssets.as_str(),
                    now,
                ],
            )?;
            let task_id = TaskId(i64_to_u64(connection.last_insert_rowid())?);
            select_task(connection, task_id)?
                .ok_or_else(|| sqlite_failure("inserted task row could not be read back"))
        })
    }

    fn get_task(&self, id: TaskId) -> PersistenceResult<AvatarTask> {
        self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            select_task(connection, id)
        })?
        .ok_or_else(|| task_not_found(id))
    }

    fn update_task(&self, id: TaskId, patch: &TaskPatch) -> PersistenceResult<AvatarTask> {
        self.with_connection("update_task", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            let Some(mut task) = select_task(&transaction, id)? else {
                return Ok(None);
            };
            task.apply_patch(patch, SystemTime::now());
            write_task(&transaction, &task)?;
            transaction.commit()?;
            Ok(Some(task))
        })?
        .ok_or_else(|| task_not_found(id))
    }

    fn list_tasks_by_owner(&self, owner_id: &str) -> PersistenceResult<Vec<AvatarTask>> {
        self.with_connection("list_tasks_by_owner", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {TASK_COLUMNS}
FROM avatar_tasks
WHERE owner_id = ?1
ORDER BY created_at_unix DESC, task_id DESC
"
            ))?;
            let rows = statement.query_map([owner_id], read_task_row)?;
            rows.collect()
        })
    }

    fn delete_task(&self, id: TaskId) -> PersistenceResult<()> {
        let deleted = self.with_connection("delete_task", |connection| {
            ensure_schema_ready(connection)?;
            let raw_id = task_id_to_i64(id)?;
            let transaction = connection.transaction()?;
            transaction.execute("DELETE FROM task_events WHERE task_id = ?1", [raw_id])?;
            let deleted =
                transaction.execute("DELETE FROM avatar_tasks WHERE task_id = ?1", [raw_id])?;
            transaction.commit()?;
            Ok(deleted)
        })?;

        if deleted == 0 {
            return Err(task_not_found(id));
        }
        Ok(())
    }

    fn try_acquire_processing(
        &self,
        id: TaskId,
        owner: &str,
        ttl: Duration,
    ) -> PersistenceResult<bool> {
        self.with_connection("try_acquire_processing", |connection| {
            ensure_schema_ready(connection)?;
            let raw_id = task_id_to_i64(id)?;
            let now = unix_now()?;
            let updated = connection.execute(
                &format!(
                    "
UPDATE avatar_tasks
SET processing = 1, processing_owner = ?2, lease_expires_at_unix = ?3
WHERE task_id = ?1 AND (processing = 0 OR {})
",
                    lease_expired("?4")
                ),
                params![raw_id, owner, lease_deadline(now, ttl)?, now],
            )?;
            if updated == 1 {
                return Ok(Some(true));
            }
            let exists: Option<i64> = connection
                .query_row(
                    "SELECT task_id FROM avatar_tasks WHERE task_id = ?1",
                    [raw_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(exists.map(|_| false))
        })?
        .ok_or_else(|| task_not_found(id))
    }

    fn refresh_processing(&self, id: TaskId, owner: &str, ttl: Duration) -> PersistenceResult<bool> {
        self.with_connection("refresh_processing", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "
UPDATE avatar_tasks SET lease_expires_at_unix = ?3
WHERE task_id = ?1 AND processing = 1 AND processing_owner = ?2
",
                params![task_id_to_i64(id)?, owner, lease_deadline(unix_now()?, ttl)?],
            )?;
            Ok(updated == 1)
        })
    }

    fn release_processing(&self, id: TaskId, owner: &str) -> PersistenceResult<()> {
        self.with_connection("release_processing", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
UPDATE avatar_tasks
SET processing = 0, processing_owner = NULL, lease_expires_at_unix = NULL
WHERE task_id = ?1 AND processing_owner = ?2
",
                params![task_id_to_i64(id)?, owner],
            )?;
            Ok(())
        })
    }

    fn list_processing(&self) -> PersistenceResult<Vec<AvatarTask>> {
        self.with_connection("list_processing", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM avatar_tasks WHERE processing = 1 ORDER BY task_id"
            ))?;
            let rows = statement.query_map([], read_task_row)?;
            rows.collect()
        })
    }

    fn list_expired_processing(&self) -> PersistenceResult<Vec<AvatarTask>> {
        self.with_connection("list_expired_processing", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM avatar_tasks WHERE processing = 1 AND {} ORDER BY task_id",
                lease_expired("?1")
            ))?;
            let rows = statement.query_map([unix_now()?], read_task_row)?;
            rows.collect()
        })
    }

    fn append_event(&self, event: &NewTaskEvent) -> PersistenceResult<()> {
        let inserted = self.with_connection("append_event", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO task_events (task_id, stage, level, message, created_at_unix)
SELECT ?1, ?2, ?3, ?4, ?5
WHERE EXISTS (SELECT 1 FROM avatar_tasks WHERE task_id = ?1)
",
                params![
                    task_id_to_i64(event.task_id)?,
                    event.stage.as_str(),
                    event.level.as_str(),
                    event.message.as_str(),
                    to_unix_seconds(event.created_at)?,
                ],
            )
        })?;

        if inserted == 0 {
            return Err(task_not_found(event.task_id));
        }
        Ok(())
    }

    fn list_events(&self, id: TaskId) -> PersistenceResult<Vec<TaskEventRecord>> {
        self.with_connection("list_events", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT event_id, task_id, stage, level, message, created_at_unix
FROM task_events
WHERE task_id = ?1
ORDER BY event_id
",
            )?;
            let rows = statement.query_map([task_id_to_i64(id)?], |row| {
                let event_id: i64 = row.get(0)?;
                let task_id: i64 = row.get(1)?;
                let stage_raw: String = row.get(2)?;
                let level_raw: String = row.get(3)?;
                let message: String = row.get(4)?;
                let created_at_unix: i64 = row.get(5)?;

                Ok(TaskEventRecord {
                    id: i64_to_u64(event_id)?,
                    task_id: TaskId(i64_to_u64(task_id)?),
                    stage: parse_stage(&stage_raw)?,
                    level: parse_event_level(&level_raw)?,
                    message,
                    created_at: from_unix_seconds(created_at_unix)?,
                })
            })?;
            rows.collect()
        })
    }
}

impl LinkedRecordStore for SqliteStore {
    fn update_linked_audio(&self, record_id: &str, audio_url: &str) -> PersistenceResult<()> {
        self.with_connection("update_linked_audio", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO linked_records (record_id, audio_url, updated_at_unix)
VALUES (?1, ?2, strftime('%s', 'now'))
ON CONFLICT(record_id) DO UPDATE SET
    audio_url = excluded.audio_url,
    updated_at_unix = excluded.updated_at_unix
",
                params![record_id, audio_url],
            )?;
            Ok(())
        })
    }

    fn linked_audio(&self, record_id: &str) -> PersistenceResult<Option<String>> {
        self.with_connection("linked_audio", |connection| {
            ensure_schema_ready(connection)?;
            let audio_url: Option<Option<String>> = connection
                .query_row(
                    "SELECT audio_url FROM linked_records WHERE record_id = ?1",
                    [record_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(audio_url.flatten())
        })
    }
}

fn select_task(connection: &Connection, id: TaskId) -> rusqlite::Result<Option<AvatarTask>> {
    connection
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM avatar_tasks WHERE task_id = ?1"),
            [task_id_to_i64(id)?],
            read_task_row,
        )
        .optional()
}

fn write_task(connection: &Connection, task: &AvatarTask) -> rusqlite::Result<()> {
    let mask_candidates_json = task
        .mask_candidates
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    let selected_mask_index = task.selected_mask_index.map(to_i64).transpose()?;

    connection.execute(
        "
UPDATE avatar_tasks SET
    image_url = ?2,
    audio_url = ?3,
    stage = ?4,
    recognition_task_ref = ?5,
    mask_candidates_json = ?6,
    selected_mask_index = ?7,
    generation_task_ref = ?8,
    result_video_url = ?9,
    result_tagged = ?10,
    error_message = ?11,
    failure_kind = ?12,
    failed_stage = ?13,
    updated_at_unix = ?14
WHERE task_id = ?1
",
        params![
            task_id_to_i64(task.id)?,
            task.image_url.as_str(),
            task.audio_url.as_str(),
            task.stage.as_str(),
            task.recognition_task_ref.as_deref(),
            mask_candidates_json,
            selected_mask_index,
            task.generation_task_ref.as_deref(),
            task.result_video_url.as_deref(),
            task.result_tagged.map(bool_to_sqlite),
            task.error_message.as_deref(),
            task.failure.map(|failure| failure.kind.as_str()),
            task.failure.map(|failure| failure.stage.as_str()),
            to_unix_seconds(task.updated_at)?,
        ],
    )?;
    Ok(())
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<AvatarTask> {
    let task_id: i64 = row.get(0)?;
    let stage_raw: String = row.get(10)?;
    let mask_candidates_json: Option<String> = row.get(12)?;
    let selected_mask_index: Option<i64> = row.get(13)?;
    let result_tagged: Option<i64> = row.get(16)?;
    let failure_kind_raw: Option<String> = row.get(18)?;
    let failed_stage_raw: Option<String> = row.get(19)?;
    let created_at_unix: i64 = row.get(20)?;
    let updated_at_unix: i64 = row.get(21)?;

    let mask_candidates = mask_candidates_json
        .map(|raw| {
            serde_json::from_str::<Vec<String>>(&raw).map_err(|error| {
                sqlite_failure(&format!("stored mask candidates are not a JSON list: {error}"))
            })
        })
        .transpose()?;

    let failure = match (failure_kind_raw, failed_stage_raw) {
        (Some(kind), Some(stage)) => Some(FailureRecord {
            kind: parse_failure_kind(&kind)?,
            stage: parse_stage(&stage)?,
        }),
        _ => None,
    };

    Ok(AvatarTask {
        id: TaskId(i64_to_u64(task_id)?),
        owner_id: row.get(1)?,
        linked_record_id: row.get(2)?,
        image_url: row.get(3)?,
        audio_url: row.get(4)?,
        duration_seconds: row.get(5)?,
        prompt: row.get(6)?,
        seed: row.get(7)?,
        fast_mode: sqlite_to_bool(row.get(8)?),
        multi_subject: sqlite_to_bool(row.get(9)?),
        stage: parse_stage(&stage_raw)?,
        recognition_task_ref: row.get(11)?,
        mask_candidates,
        selected_mask_index: selected_mask_index.map(i64_to_usize).transpose()?,
        generation_task_ref: row.get(14)?,
        result_video_url: row.get(15)?,
        result_tagged: result_tagged.map(sqlite_to_bool),
        error_message: row.get(17)?,
        failure,
        created_at: from_unix_seconds(created_at_unix)?,
        updated_at: from_unix_seconds(updated_at_unix)?,
    })
}

/// Matches a lease that may be taken over at the unix time bound to `now`:
/// one written before leases had owners, or one past its deadline.
fn lease_expired(now: &str) -> String {
    format!(
        "(processing_owner IS NULL OR lease_expires_at_unix IS NULL OR lease_expires_at_unix <= {now})"
    )
}

fn lease_deadline(now: i64, ttl: Duration) -> rusqlite::Result<i64> {
    let ttl = i64::try_from(ttl.as_secs())
        .map_err(|_| sqlite_failure("lease duration is too long to store"))?;
    Ok(now.saturating_add(ttl))
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    Ok(connection)
}

/// The ledger table records one row per applied schema step.
fn create_ledger_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))
}

fn recorded_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT IFNULL(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    create_ledger_table(connection)?;
    if recorded_version(connection)? < 1 {
        return Err(sqlite_failure(
            "avatar task tables are not initialized; run `avatar migrate` first",
        ));
    }
    Ok(())
}

fn schema_step(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version)
        .ok_or_else(|| sqlite_failure(&format!("no schema step is numbered {version}")))
}

#[derive(Clone, Copy)]
enum StepDirection {
    Forward,
    Backward,
}

/// Runs one schema step and updates the ledger in the same transaction.
fn run_schema_step(
    connection: &mut Connection,
    step: &SqliteMigration,
    direction: StepDirection,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    match direction {
        StepDirection::Forward => {
            run_schema_sql(&transaction, step.up_sql)?;
            transaction.execute(
                &format!(
                    "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix) VALUES (?1, ?2, ?3)"
                ),
                params![step.version, step.name, unix_now()?],
            )?;
        }
        StepDirection::Backward => {
            transaction.execute_batch(step.down_sql)?;
            transaction.execute(
                &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
                [step.version],
            )?;
        }
    }
    transaction.commit()
}

/// Column additions fail on replay, so an already-present column counts as
/// applied.
fn run_schema_sql(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    connection.execute_batch(sql).or_else(|error| {
        if error.to_string().contains("duplicate column name") {
            Ok(())
        } else {
            Err(error)
        }
    })
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    store_error(operation, error.to_string())
}

fn store_error(operation: &str, detail: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("avatar database {operation}: {}", detail.as_ref()),
    )
}

fn sqlite_failure(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_stage(raw: &str) -> rusqlite::Result<TaskStage> {
    raw.parse::<TaskStage>().map_err(|_| {
        sqlite_failure(&format!("stored stage '{raw}' is not a known stage"))
    })
}

fn parse_failure_kind(raw: &str) -> rusqlite::Result<CoreErrorKind> {
    raw.parse::<CoreErrorKind>().map_err(|_| {
        sqlite_failure(&format!("stored failure kind '{raw}' is not recognized"))
    })
}

fn parse_event_level(raw: &str) -> rusqlite::Result<TaskEventLevel> {
    raw.parse::<TaskEventLevel>().map_err(|_| {
        sqlite_failure(&format!("stored event level '{raw}' is not recognized"))
    })
}

fn bool_to_sqlite(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn unix_now() -> rusqlite::Result<i64> {
    to_unix_seconds(SystemTime::now())
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let since_epoch = value
        .duration_since(UNIX_EPOCH)
        .map_err(|_| sqlite_failure("timestamps earlier than 1970 cannot be stored"))?;
    i64::try_from(since_epoch.as_secs())
        .map_err(|_| sqlite_failure("timestamp is too far in the future to store"))
}

fn from_unix_seconds(value: i64) -> rusqlite::Result<SystemTime> {
    let seconds = u64::try_from(value)
        .map_err(|_| sqlite_failure(&format!("stored timestamp {value} is before 1970")))?;
    Ok(UNIX_EPOCH + Duration::from_secs(seconds))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| sqlite_failure(&format!("task id {value} is too large")))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| sqlite_failure(&format!("stored task id {value} is negative")))
}

fn i64_to_usize(value: i64) -> rusqlite::Result<usize> {
    usize::try_from(value)
        .map_err(|_| sqlite_failure(&format!("stored mask index {value} is negative")))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| sqlite_failure(&format!("index {value} is too large")))
}

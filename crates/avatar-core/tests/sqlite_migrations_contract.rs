mod support;

use avatar_core::models::{CoreErrorKind, NewTask};
use avatar_core::persistence::{MigrationStore, TaskStore};
use avatar_core::sqlite::{SqliteStore, current_schema_version, migration, migrations};

use support::temp_db_path;

#[test]
fn migration_versions_are_strictly_increasing() {
    let entries = migrations();
    assert!(!entries.is_empty());

    let mut previous = 0;
    for entry in entries {
        assert!(entry.version > previous);
        previous = entry.version;
    }
}

#[test]
fn migration_lookup_and_schema_version_are_consistent() {
    let latest = current_schema_version();
    let latest_entry = migration(latest).expect("latest migration must exist");
    assert_eq!(latest_entry.version, latest);
    assert!(migration(latest + 1).is_none());
}

#[test]
fn migration_sql_is_defined_for_up_and_down_paths() {
    for entry in migrations() {
        assert!(!entry.name.trim().is_empty(), "migration name must not be empty");
        assert!(!entry.up_sql.trim().is_empty(), "up sql must not be empty");
        assert!(
            !entry.down_sql.trim().is_empty(),
            "down sql must not be empty"
        );
    }
}

#[test]
fn planned_migrations_include_versions_after_requested_version() {
    let store = SqliteStore::new(temp_db_path("planned"));
    let planned = store.planned_migrations(0);

    assert_eq!(planned.len(), migrations().len());
    assert_eq!(planned[0].version, 1);
    assert!(store.planned_migrations(current_schema_version()).is_empty());
}

#[test]
fn fresh_database_migrates_to_latest_and_back() {
    let store = SqliteStore::new(temp_db_path("migrate"));
    assert_eq!(store.current_version().unwrap(), 0);

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
}

#[test]
fn reapplying_the_current_version_is_idempotent() {
    let store = SqliteStore::new(temp_db_path("reapply"));
    store.migrate_to_latest().unwrap();
    let task = store
        .create_task(&NewTask::new("owner", "https://cdn/i.png", "https://cdn/a.wav"))
        .unwrap();

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert_eq!(store.get_task(task.id).unwrap().id, task.id);
}

#[test]
fn undefined_migration_target_fails_with_storage_error() {
    let store = SqliteStore::new(temp_db_path("undefined"));
    let error = store
        .apply_migration(current_schema_version() + 1)
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    assert!(error.message.contains("apply_migration"));
    assert!(error.message.contains(&format!("0..={}", current_schema_version())));

    let error = store.apply_migration(-1).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
}

#[test]
fn task_operations_require_a_migrated_schema() {
    let store = SqliteStore::new(temp_db_path("unmigrated"));
    let error = store
        .create_task(&NewTask::new("owner", "https://cdn/i.png", "https://cdn/a.wav"))
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    assert!(error.message.contains("not initialized"));
    assert!(error.message.contains("avatar migrate"));
}

#[test]
fn legacy_unowned_lease_is_treated_as_expired_after_upgrading() {
    let path = temp_db_path("legacy-lease");
    let store = SqliteStore::new(&path);
    store.apply_migration(2).unwrap();
    let task = store
        .create_task(&NewTask::new("owner", "https://cdn/i.png", "https://cdn/a.wav"))
        .unwrap();
    let connection = rusqlite::Connection::open(&path).unwrap();
    connection
        .execute("UPDATE avatar_tasks SET processing = 1 WHERE task_id = ?1", [task.id.0 as i64])
        .unwrap();

    store.migrate_to_latest().unwrap();
    let expired: Vec<_> = store
        .list_expired_processing()
        .unwrap()
        .into_iter()
        .map(|task| task.id)
        .collect();
    assert_eq!(expired, vec![task.id]);
    assert!(
        store
            .try_acquire_processing(task.id, "recovery", std::time::Duration::from_secs(60))
            .unwrap()
    );
}

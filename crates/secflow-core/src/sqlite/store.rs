use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::models::{
    AdapterOptions, CoreError, CoreErrorKind, FindingsSummary, SkipReason, TaskError, TaskId,
    TaskRecord, TaskStatus, ToolResult, WorkflowId, WorkflowRecord, WorkflowStatus,
};
use crate::persistence::{MigrationStore, PersistenceResult, WorkflowStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "secflow_schema_migrations";

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
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Replays DDL when the version row exists but tables were lost.
                for version in 1..=target_version {
                    execute_batch_tolerant(connection, defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl WorkflowStore for SqliteStore {
    fn create_workflow(&self, workflow: &WorkflowRecord) -> PersistenceResult<()> {
        self.with_connection("create_workflow", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            transaction.execute(
                "
INSERT INTO workflows (
    workflow_id, name, description, target, status, created_at_unix_ms,
    started_at_unix_ms, finished_at_unix_ms, error_message, tags_json
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
",
                params![
                    workflow_id_to_i64(workflow.id)?,
                    workflow.name,
                    workflow.description,
                    workflow.target,
                    workflow.status.as_str(),
                    to_unix_millis(workflow.created_at)?,
                    optional_unix_millis(workflow.started_at)?,
                    optional_unix_millis(workflow.finished_at)?,
                    workflow.error_message,
                    to_json(&workflow.tags)?,
                ],
            )?;
            for (position, task) in workflow.tasks.iter().enumerate() {
                upsert_task_row(&transaction, workflow.id, task, Some(position))?;
            }
            transaction.commit()?;
            Ok(())
        })
    }

    fn update_workflow(&self, workflow: &WorkflowRecord) -> PersistenceResult<()> {
        self.with_connection("update_workflow", |connection| {
            ensure_schema_ready(connection)?;
            let updated = connection.execute(
                "
UPDATE workflows SET
    status = ?2,
    started_at_unix_ms = ?3,
    finished_at_unix_ms = ?4,
    error_message = ?5,
    tags_json = ?6
WHERE workflow_id = ?1
",
                params![
                    workflow_id_to_i64(workflow.id)?,
                    workflow.status.as_str(),
                    optional_unix_millis(workflow.started_at)?,
                    optional_unix_millis(workflow.finished_at)?,
                    workflow.error_message,
                    to_json(&workflow.tags)?,
                ],
            )?;
            if updated == 0 {
                return Err(storage_error_sqlite(&format!(
                    "workflow {} is not stored",
                    workflow.id
                )));
            }
            Ok(())
        })
    }

    fn upsert_task(&self, workflow: WorkflowId, task: &TaskRecord) -> PersistenceResult<()> {
        self.with_connection("upsert_task", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;
            upsert_task_row(&transaction, workflow, task, None)?;
            transaction.commit()?;
            Ok(())
        })
    }

    fn load_workflows(&self) -> PersistenceResult<Vec<WorkflowRecord>> {
        self.with_connection("load_workflows", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT workflow_id, name, description, target, status, created_at_unix_ms,
       started_at_unix_ms, finished_at_unix_ms, error_message, tags_json
FROM workflows
ORDER BY workflow_id
",
            )?;
            let headers = statement.query_map([], |row| {
                let status_raw: String = row.get(4)?;
                let tags_raw: String = row.get(9)?;
                Ok(WorkflowRecord {
                    id: i64_to_workflow_id(row.get(0)?)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    target: row.get(3)?,
                    status: parse_workflow_status(&status_raw)?,
                    created_at: from_unix_millis(row.get(5)?)?,
                    started_at: optional_from_unix_millis(row.get(6)?)?,
                    finished_at: optional_from_unix_millis(row.get(7)?)?,
                    tasks: Vec::new(),
                    tags: from_json::<BTreeSet<String>>(&tags_raw)?,
                    findings_summary: FindingsSummary::new(),
                    error_message: row.get(8)?,
                })
            })?;
            let mut workflows = headers.collect::<rusqlite::Result<Vec<_>>>()?;

            let mut task_statement = connection.prepare(
                "
SELECT task_id, adapter, options_json, depends_on_json, status, result_json,
       error_kind, error_message, skip_reason_json, created_at_unix_ms,
       started_at_unix_ms, finished_at_unix_ms
FROM workflow_tasks
WHERE workflow_id = ?1
ORDER BY position
",
            )?;
            for workflow in &mut workflows {
                let rows = task_statement
                    .query_map([workflow_id_to_i64(workflow.id)?], read_task_row)?;
                workflow.tasks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            }

            Ok(workflows)
        })
    }

    fn next_workflow_id(&self) -> PersistenceResult<WorkflowId> {
        self.with_connection("next_workflow_id", |connection| {
            ensure_schema_ready(connection)?;
            let max: Option<i64> = connection
                .query_row("SELECT MAX(workflow_id) FROM workflows", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .optional()?
                .flatten();
            let next = max.unwrap_or(0).saturating_add(1);
            i64_to_workflow_id(next)
        })
    }
}

fn upsert_task_row(
    transaction: &Transaction<'_>,
    workflow: WorkflowId,
    task: &TaskRecord,
    position: Option<usize>,
) -> rusqlite::Result<()> {
    let position = position.map(to_i64).transpose()?;
    let result_json = task.result.as_ref().map(to_json).transpose()?;
    let skip_reason_json = task.skip_reason.as_ref().map(to_json).transpose()?;
    transaction.execute(
        "
INSERT INTO workflow_tasks (
    workflow_id, task_id, position, adapter, options_json, depends_on_json, status,
    result_json, error_kind, error_message, skip_reason_json, created_at_unix_ms,
    started_at_unix_ms, finished_at_unix_ms
) VALUES (
    ?1, ?2,
    COALESCE(?3, (SELECT COUNT(*) FROM workflow_tasks WHERE workflow_id = ?1)),
    ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
)
ON CONFLICT(workflow_id, task_id) DO UPDATE SET
    status = excluded.status,
    result_json = excluded.result_json,
    error_kind = excluded.error_kind,
    error_message = excluded.error_message,
    skip_reason_json = excluded.skip_reason_json,
    started_at_unix_ms = excluded.started_at_unix_ms,
    finished_at_unix_ms = excluded.finished_at_unix_ms
",
        params![
            workflow_id_to_i64(workflow)?,
            task.id.as_str(),
            position,
            task.adapter,
            to_json(&task.options)?,
            to_json(&task.depends_on)?,
            task.status.as_str(),
            result_json,
            task.error.as_ref().map(|error| error.kind.as_str()),
            task.error.as_ref().map(|error| error.message.as_str()),
            skip_reason_json,
            to_unix_millis(task.created_at)?,
            optional_unix_millis(task.started_at)?,
            optional_unix_millis(task.finished_at)?,
        ],
    )?;
    Ok(())
}

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let options_raw: String = row.get(2)?;
    let depends_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let result_raw: Option<String> = row.get(5)?;
    let error_kind_raw: Option<String> = row.get(6)?;
    let error_message: Option<String> = row.get(7)?;
    let skip_raw: Option<String> = row.get(8)?;

    let error = match error_kind_raw {
        Some(kind) => Some(TaskError {
            kind: kind.parse::<CoreErrorKind>().map_err(|_| {
                storage_error_sqlite(&format!("unknown error kind '{kind}' in sqlite record"))
            })?,
            message: error_message.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(TaskRecord {
        id: TaskId::new(row.get::<_, String>(0)?),
        adapter: row.get(1)?,
        options: from_json::<AdapterOptions>(&options_raw)?,
        depends_on: from_json::<BTreeSet<TaskId>>(&depends_raw)?,
        status: parse_task_status(&status_raw)?,
        result: result_raw
            .as_deref()
            .map(from_json::<ToolResult>)
            .transpose()?,
        error,
        skip_reason: skip_raw
            .as_deref()
            .map(from_json::<SkipReason>)
            .transpose()?,
        created_at: from_unix_millis(row.get(9)?)?,
        started_at: optional_from_unix_millis(row.get(10)?)?,
        finished_at: optional_from_unix_millis(row.get(11)?)?,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
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

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version < current_schema_version() {
        return Err(storage_error_sqlite(&format!(
            "database schema is at version {version}; apply migrations before workflow operations"
        )));
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

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()
}

/// `ALTER TABLE ADD COLUMN` is not idempotent in SQLite; a replay tolerates
/// columns that already exist.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    match connection.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(error) if error.to_string().contains("duplicate column name") => Ok(()),
        Err(error) => Err(error),
    }
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
    transaction.commit()
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}

fn parse_workflow_status(raw: &str) -> rusqlite::Result<WorkflowStatus> {
    raw.parse::<WorkflowStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown workflow status '{raw}' in sqlite record"))
    })
}

fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse::<TaskStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown task status '{raw}' in sqlite record"))
    })
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("invalid JSON column in sqlite record: {error}"))
    })
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

fn optional_unix_millis(value: Option<SystemTime>) -> rusqlite::Result<Option<i64>> {
    value.map(to_unix_millis).transpose()
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn optional_from_unix_millis(value: Option<i64>) -> rusqlite::Result<Option<SystemTime>> {
    value.map(from_unix_millis).transpose()
}

fn workflow_id_to_i64(value: WorkflowId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("workflow id exceeds i64 range"))
}

fn i64_to_workflow_id(value: i64) -> rusqlite::Result<WorkflowId> {
    u64::try_from(value)
        .map(WorkflowId)
        .map_err(|_| storage_error_sqlite("negative workflow id in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

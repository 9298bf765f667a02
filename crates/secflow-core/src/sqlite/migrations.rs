#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_workflow_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS workflows (
    workflow_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    target TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at_unix_ms INTEGER NOT NULL,
    started_at_unix_ms INTEGER,
    finished_at_unix_ms INTEGER,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS workflow_tasks (
    workflow_id INTEGER NOT NULL REFERENCES workflows (workflow_id) ON DELETE CASCADE,
    task_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    adapter TEXT NOT NULL,
    options_json TEXT NOT NULL,
    depends_on_json TEXT NOT NULL,
    status TEXT NOT NULL,
    result_json TEXT,
    error_kind TEXT,
    error_message TEXT,
    created_at_unix_ms INTEGER NOT NULL,
    started_at_unix_ms INTEGER,
    finished_at_unix_ms INTEGER,
    PRIMARY KEY (workflow_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_workflow_tasks_position
    ON workflow_tasks (workflow_id, position);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_workflow_tasks_position;
DROP TABLE IF EXISTS workflow_tasks;
DROP TABLE IF EXISTS workflows;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_workflow_tags_and_skip_reasons",
    up_sql: r#"
ALTER TABLE workflows ADD COLUMN tags_json TEXT NOT NULL DEFAULT '[]';
ALTER TABLE workflow_tasks ADD COLUMN skip_reason_json TEXT;
"#,
    down_sql: r#"
ALTER TABLE workflow_tasks DROP COLUMN skip_reason_json;
ALTER TABLE workflows DROP COLUMN tags_json;
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

//! Database schema definitions and constants.

// Current schema version
pub const SCHEMA_VERSION: u32 = 1;

// Table names
pub const TABLE_SCHEMA_MIGRATIONS: &str = "schema_migrations";
pub const TABLE_WORKSPACES: &str = "workspaces";
pub const TABLE_COMPONENTS: &str = "components";
pub const TABLE_TASKS: &str = "tasks";
pub const TABLE_TASK_EVENTS: &str = "task_events";

// Task event types
pub const EVENT_TASK_STARTED: &str = "TaskStarted";
pub const EVENT_TASK_FINISHED: &str = "TaskFinished";
pub const EVENT_TASK_COMPLETED: &str = "TaskCompleted";

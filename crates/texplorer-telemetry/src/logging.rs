//! Per-project log persistence backing the `show-log` command.
//!
//! Only events that belong to a project are kept: either the event carries a
//! `project` field (as every [`ProjectLogger`](crate::ProjectLogger) line
//! does) or it happens inside a span that does.

use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing::Level;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub at: String,
    pub level: String,
    pub component: Option<String>,
    pub message: String,
    /// Remaining structured fields of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
}

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS project_log (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        project   TEXT NOT NULL,
        at        TEXT NOT NULL,
        level     TEXT NOT NULL,
        component TEXT,
        message   TEXT NOT NULL,
        fields    TEXT
    );
    CREATE INDEX IF NOT EXISTS project_log_by_project ON project_log(project, id);";

/// SQLite store of project log lines.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, project: &str, line: &LogLine) -> Result<(), rusqlite::Error> {
        let fields = line
            .fields
            .as_ref()
            .map(|f| Value::Object(f.clone()).to_string());
        self.conn.lock().execute(
            "INSERT INTO project_log (project, at, level, component, message, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![project, line.at, line.level, line.component, line.message, fields],
        )?;
        Ok(())
    }

    /// The newest `limit` lines of `project`, newest first.
    pub fn recent(&self, project: &str, limit: usize) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, at, level, component, message, fields FROM project_log
             WHERE project = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![project, limit], |row| {
            let fields: Option<String> = row.get(5)?;
            Ok(LogRecord {
                id: row.get(0)?,
                at: row.get(1)?,
                level: row.get(2)?,
                component: row.get(3)?,
                message: row.get(4)?,
                fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
            })
        })?;
        rows.collect()
    }

    /// Lines stored for `project`.
    pub fn count(&self, project: &str) -> Result<usize, rusqlite::Error> {
        let n: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM project_log WHERE project = ?1",
            params![project],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

/// Project and component attached to a span, inherited by events inside it.
struct ProjectScope {
    project: Option<String>,
    component: Option<String>,
}

#[derive(Default)]
struct LogLine {
    project: Option<String>,
    at: String,
    level: String,
    message: String,
    component: Option<String>,
    fields: Option<Map<String, Value>>,
}

impl LogLine {
    fn put(&mut self, name: &str, value: Value) {
        match (name, value) {
            ("message", Value::String(s)) => self.message = s,
            ("project", Value::String(s)) => self.project = Some(s),
            ("component", Value::String(s)) => self.component = Some(s),
            (name, value) => {
                self.fields
                    .get_or_insert_with(Map::new)
                    .insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for LogLine {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field.name(), Value::from(format!("{value:?}")));
    }
}

/// tracing layer feeding a [`SqliteLogSink`] with project events at or
/// above `min_level`.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
    min_level: Level,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>, min_level: Level) -> Self {
        Self { sink, min_level }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut line = LogLine::default();
        attrs.record(&mut line);
        if line.project.is_none() && line.component.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(ProjectScope {
                project: line.project,
                component: line.component,
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        // Level ordering runs from ERROR (least verbose) to TRACE
        let level = *event.metadata().level();
        if level > self.min_level {
            return;
        }

        let mut line = LogLine::default();
        event.record(&mut line);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(inherited) = span.extensions().get::<ProjectScope>() {
                    if line.project.is_none() {
                        line.project.clone_from(&inherited.project);
                    }
                    if line.component.is_none() {
                        line.component.clone_from(&inherited.component);
                    }
                }
            }
        }

        let Some(project) = line.project.take() else {
            return;
        };
        line.at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        line.level = level.as_str().to_ascii_lowercase();
        if let Err(e) = self.sink.append(&project, &line) {
            eprintln!("texplorer-telemetry: failed to persist log line: {e}");
        }
    }
}

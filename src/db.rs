use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::mysql::{MySqlArguments, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, Connection, Decode, Executor, MySql, Row, Statement, Type, TypeInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::error::ToolError;

/// Result of running one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rows(Vec<Map<String, Value>>),
    Done { affected_rows: u64, last_insert_id: u64 },
}

impl Outcome {
    pub fn into_json(self) -> Value {
        match self {
            Outcome::Rows(rows) => rows_to_json(rows),
            Outcome::Done {
                affected_rows,
                last_insert_id,
            } => json!({
                "affected_rows": affected_rows,
                "last_insert_id": last_insert_id,
            }),
        }
    }
}

pub fn rows_to_json(rows: Vec<Map<String, Value>>) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}

/// First value of every row, for single-column listings.
pub fn first_column(rows: Vec<Map<String, Value>>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.into_iter().next().map(|(_, v)| v))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Connected(ConnectionInfo),
    Disconnected,
}

/// The one database connection every handler shares.
#[async_trait]
pub trait Session: Send + Sync {
    /// Run caller-supplied SQL as a single prepared statement with positional
    /// `?` parameters. The server rejects stacked statements on this path.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Outcome, ToolError>;

    /// Run one of our own fixed statements (`SHOW`, `DESCRIBE`, `USE`) over
    /// the text protocol, which accepts statements MySQL will not prepare.
    async fn command(&self, sql: &str) -> Result<Vec<Map<String, Value>>, ToolError>;

    /// Record the default schema after a successful `USE`.
    async fn set_database(&self, database: &str);

    /// Answered without touching the connection, so it never waits behind
    /// a running statement.
    async fn state(&self) -> SessionState;

    async fn close(&self);
}

pub struct MySqlSession {
    conn: Mutex<Option<MySqlConnection>>,
    connected: AtomicBool,
    info: RwLock<ConnectionInfo>,
}

impl MySqlSession {
    /// Opens the connection once. A failure is logged and leaves the session
    /// disconnected rather than aborting the process.
    pub async fn connect(config: &Config) -> Self {
        info!("Connecting to MySQL at {}:{}", config.host, config.port);
        let conn = match MySqlConnection::connect_with(&config.connect_options()).await {
            Ok(conn) => {
                info!("Successfully connected to MySQL database '{}'", config.database);
                Some(conn)
            }
            Err(e) => {
                error!("Database connection failed: {e}");
                None
            }
        };

        Self {
            connected: AtomicBool::new(conn.is_some()),
            conn: Mutex::new(conn),
            info: RwLock::new(ConnectionInfo {
                host: config.host.clone(),
                port: config.port,
                user: config.user.clone(),
                database: config.database.clone(),
            }),
        }
    }

    fn track(&self, e: sqlx::Error) -> ToolError {
        if is_connection_lost(&e) {
            warn!("Database connection lost: {e}");
            self.connected.store(false, Ordering::Relaxed);
        }
        e.into()
    }
}

#[async_trait]
impl Session for MySqlSession {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Outcome, ToolError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(ToolError::NotConnected)?;
        debug!("Executing statement ({} params): {sql}", params.len());

        // The prepare reply tells whether the statement yields a result set.
        let statement = (&mut *conn).prepare(sql).await.map_err(|e| self.track(e))?;
        let returns_rows = !statement.columns().is_empty();
        let query = params.iter().fold(statement.query(), bind_value);

        if returns_rows {
            let rows = query.fetch_all(&mut *conn).await.map_err(|e| self.track(e))?;
            Ok(Outcome::Rows(rows.iter().map(row_to_json).collect()))
        } else {
            let done = query.execute(&mut *conn).await.map_err(|e| self.track(e))?;
            Ok(Outcome::Done {
                affected_rows: done.rows_affected(),
                last_insert_id: done.last_insert_id(),
            })
        }
    }

    async fn command(&self, sql: &str) -> Result<Vec<Map<String, Value>>, ToolError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(ToolError::NotConnected)?;
        debug!("Executing command: {sql}");

        let rows = (&mut *conn).fetch_all(sql).await.map_err(|e| self.track(e))?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn set_database(&self, database: &str) {
        self.info.write().await.database = database.to_string();
    }

    async fn state(&self) -> SessionState {
        if !self.connected.load(Ordering::Relaxed) {
            return SessionState::Disconnected;
        }
        SessionState::Connected(self.info.read().await.clone())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(conn) = self.conn.lock().await.take() {
            info!("Closing database connection");
            if let Err(e) = conn.close().await {
                error!("Failed to close database connection: {e}");
            }
        }
    }
}

/// Errors after which the connection cannot be used again.
fn is_connection_lost(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed
    )
}

/// Quotes a (possibly schema-qualified) name as a MySQL identifier.
/// Backticks are doubled and each `.` separates a part, so the result is
/// always read by the server as identifiers and never as SQL.
pub fn quote_identifier(name: &str) -> String {
    let parts: Vec<String> = name
        .split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect();
    parts.join(".")
}

/// `true` when the trimmed statement starts with `select`, case-insensitively.
pub fn is_select(sql: &str) -> bool {
    sql.trim().to_lowercase().starts_with("select")
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn row_to_json(row: &MySqlRow) -> Map<String, Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| (column.name().to_string(), column_value(row, i)))
        .collect()
}

/// `Some` when the column decodes as `T` (NULL included), `None` on a type mismatch.
fn decode_as<'r, T>(row: &'r MySqlRow, index: usize) -> Option<Value>
where
    T: Decode<'r, MySql> + Type<MySql> + Serialize,
{
    row.try_get::<Option<T>, _>(index).ok().map(|v| json!(v))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColumnKind {
    Signed,
    Unsigned,
    Float,
    Double,
    Decimal,
    Date,
    Time,
    DateTime,
    Timestamp,
    Json,
    Other,
}

fn column_kind(type_name: &str) -> ColumnKind {
    match type_name {
        // TINYINT(1) is reported as BOOLEAN but stays a number on the wire
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => ColumnKind::Signed,
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" | "YEAR" => ColumnKind::Unsigned,
        "FLOAT" => ColumnKind::Float,
        "DOUBLE" => ColumnKind::Double,
        "DECIMAL" => ColumnKind::Decimal,
        "DATE" => ColumnKind::Date,
        "TIME" => ColumnKind::Time,
        "DATETIME" => ColumnKind::DateTime,
        "TIMESTAMP" => ColumnKind::Timestamp,
        "JSON" => ColumnKind::Json,
        _ => ColumnKind::Other,
    }
}

fn column_value(row: &MySqlRow, index: usize) -> Value {
    let type_name = row.columns()[index].type_info().name();

    let value = match column_kind(type_name) {
        ColumnKind::Signed => decode_as::<i64>(row, index),
        ColumnKind::Unsigned => decode_as::<u64>(row, index),
        ColumnKind::Float => decode_as::<f32>(row, index),
        ColumnKind::Double => decode_as::<f64>(row, index),
        // Strings keep full precision
        ColumnKind::Decimal => row
            .try_get::<Option<BigDecimal>, _>(index)
            .ok()
            .map(|v| json!(v.map(|d| d.to_string()))),
        ColumnKind::Date => decode_as::<NaiveDate>(row, index),
        ColumnKind::Time => decode_as::<NaiveTime>(row, index),
        ColumnKind::DateTime => decode_as::<NaiveDateTime>(row, index),
        ColumnKind::Timestamp => decode_as::<DateTime<Utc>>(row, index),
        ColumnKind::Json => row
            .try_get::<Option<Json<Value>>, _>(index)
            .ok()
            .map(|v| v.map(|j| j.0).unwrap_or(Value::Null)),
        ColumnKind::Other => None,
    };

    value.unwrap_or_else(|| fallback_value(row, index))
}

// Text first, then raw bytes (UTF-8 if possible, else a byte array).
fn fallback_value(row: &MySqlRow, index: usize) -> Value {
    if let Ok(text) = row.try_get::<Option<String>, _>(index) {
        return json!(text);
    }
    match row.try_get_unchecked::<Option<Vec<u8>>, _>(index) {
        Ok(Some(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => Value::String(text),
            Err(e) => json!(e.into_bytes()),
        },
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users"), "`users`");
        assert_eq!(quote_identifier("my_table_123"), "`my_table_123`");
        assert_eq!(quote_identifier("shop.users"), "`shop`.`users`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
        assert_eq!(quote_identifier("table with spaces"), "`table with spaces`");
    }

    #[test]
    fn test_quote_identifier_blocks_injection() {
        assert_eq!(
            quote_identifier("users'; DROP TABLE users; --"),
            "`users'; DROP TABLE users; --`"
        );
        assert_eq!(
            quote_identifier("x` ; DROP TABLE users; -- "),
            "`x`` ; DROP TABLE users; -- `"
        );
    }

    #[test]
    fn test_is_select() {
        assert!(is_select("SELECT 1"));
        assert!(is_select("  select * from users"));
        assert!(is_select("\n\tSeLeCt now()"));

        assert!(!is_select("UPDATE t SET x=1"));
        assert!(!is_select("DELETE FROM users"));
        assert!(!is_select("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!is_select(""));
    }

    #[test]
    fn test_outcome_into_json() {
        let mut row = Map::new();
        row.insert("id".into(), json!(1));
        row.insert("name".into(), json!("alice"));
        assert_eq!(
            Outcome::Rows(vec![row]).into_json(),
            json!([{"id": 1, "name": "alice"}])
        );

        let done = Outcome::Done {
            affected_rows: 2,
            last_insert_id: 17,
        };
        assert_eq!(done.into_json(), json!({"affected_rows": 2, "last_insert_id": 17}));
    }

    #[test]
    fn test_first_column() {
        let rows = ["orders", "users"]
            .iter()
            .map(|name| {
                let mut row = Map::new();
                row.insert("Tables_in_shop".into(), json!(name));
                row
            })
            .collect();
        assert_eq!(first_column(rows), vec![json!("orders"), json!("users")]);
        assert!(first_column(Vec::new()).is_empty());
    }

    #[test]
    fn test_boolean_columns_decode_as_numbers() {
        assert_eq!(column_kind("BOOLEAN"), ColumnKind::Signed);
        assert_eq!(column_kind("TINYINT"), ColumnKind::Signed);
        assert_eq!(column_kind("BIGINT UNSIGNED"), ColumnKind::Unsigned);
        assert_eq!(column_kind("DECIMAL"), ColumnKind::Decimal);
        assert_eq!(column_kind("VARCHAR"), ColumnKind::Other);
    }

    #[test]
    fn test_connection_lost_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(is_connection_lost(&sqlx::Error::Io(io)));
        assert!(is_connection_lost(&sqlx::Error::Protocol("bad packet".into())));
        assert!(!is_connection_lost(&sqlx::Error::RowNotFound));
    }

    fn session(connected: bool) -> MySqlSession {
        MySqlSession {
            conn: Mutex::new(None),
            connected: AtomicBool::new(connected),
            info: RwLock::new(ConnectionInfo {
                host: "localhost".into(),
                port: 3306,
                user: "root".into(),
                database: "test".into(),
            }),
        }
    }

    #[tokio::test]
    async fn test_state_does_not_wait_for_running_statement() {
        let session = session(true);
        let _busy = session.conn.lock().await;

        let state = tokio::time::timeout(std::time::Duration::from_secs(1), session.state())
            .await
            .expect("state blocked on the connection lock");
        assert!(matches!(state, SessionState::Connected(info) if info.database == "test"));
    }

    #[tokio::test]
    async fn test_state_after_close_is_disconnected() {
        let session = session(true);
        session.close().await;
        assert_eq!(session.state().await, SessionState::Disconnected);

        let err = session.command("SHOW TABLES").await.unwrap_err();
        assert_eq!(err, ToolError::NotConnected);
    }
}

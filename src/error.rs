use std::fmt;

/// Everything a handler can report back to the caller as `error.message`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolError {
    UnsupportedMethod(String),
    MissingSql,
    MissingTable,
    MissingDatabase,
    InvalidParams(String),
    ReadOnlyViolation,
    NotConnected,
    /// Driver message, passed through untouched
    Database(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::UnsupportedMethod(method) => write!(f, "Unsupported method: {method}"),
            ToolError::MissingSql => write!(f, "SQL query is required"),
            ToolError::MissingTable => write!(f, "Table name is required"),
            ToolError::MissingDatabase => write!(f, "Database name is required"),
            ToolError::InvalidParams(msg) => write!(f, "Invalid params: {msg}"),
            ToolError::ReadOnlyViolation => {
                write!(f, "Only SELECT queries are allowed in read-only mode")
            }
            ToolError::NotConnected => write!(f, "Not connected to database"),
            ToolError::Database(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<sqlx::Error> for ToolError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => ToolError::Database(db.message().to_string()),
            _ => ToolError::Database(e.to_string()),
        }
    }
}

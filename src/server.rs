use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::db::{
    first_column, is_select, quote_identifier, rows_to_json, MySqlSession, Session, SessionState,
};
use crate::error::ToolError;
use crate::rpc::{Call, Request, Response, Tool, ToolsList};

/// What every handler gets: the shared connection and the read-only policy.
pub struct Context {
    pub session: Arc<dyn Session>,
    pub readonly: bool,
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("MySQL stdio server starting ({})", config.summary());
    info!("Server PID: {}", std::process::id());

    let session = Arc::new(MySqlSession::connect(&config).await);
    let ctx = Arc::new(Context {
        session: session.clone(),
        readonly: config.readonly,
    });

    let mut stdout = tokio::io::stdout();
    tokio::select! {
        result = serve(ctx, tokio::io::stdin(), &mut stdout) => {
            result?;
            info!("stdin closed, shutting down");
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, shutting down");
        }
    }

    session.close().await;
    info!("MySQL stdio server shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Reads requests line by line and writes one response line per answered
/// request. Requests run concurrently, so responses may come back out of
/// order; callers correlate on `id`. Returns once input ends and every
/// in-flight request has been answered, or as soon as output fails.
pub async fn serve<R, W>(ctx: Arc<Context>, input: R, output: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    let reading = async move {
        let mut reader = BufReader::new(input);
        let mut line = Vec::new();
        let mut in_flight = JoinSet::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    error!("Error reading from stdin: {e} (error kind: {:?})", e.kind());
                    break;
                }
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            debug!("Received message (len={}): {}", line.len(), String::from_utf8_lossy(&line).trim_end());

            // Not UTF-8, not JSON or not an object: no id to answer, so drop it.
            let request = match serde_json::from_slice::<Request>(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Dropping unparseable line: {e}");
                    continue;
                }
            };

            let ctx = ctx.clone();
            let tx = tx.clone();
            in_flight.spawn(async move {
                let response = handle_request(request, &ctx).await;
                // Output failure stops the whole loop, so a closed channel
                // only happens while this task is being torn down.
                let _ = tx.send(response);
            });

            // Reap finished tasks so the set does not grow without bound.
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        // `tx` drops here and lets the writer finish.
    };

    let writing = async {
        while let Some(response) = rx.recv().await {
            match serde_json::to_string(&response) {
                Ok(line) => {
                    if let Err(e) = write_line(output, &line).await {
                        error!("Failed to write response, stopping: {e}");
                        return Err(e);
                    }
                }
                Err(e) => error!("Failed to serialize response: {e}"),
            }
        }
        Ok(())
    };

    tokio::pin!(reading);
    tokio::pin!(writing);

    // Dropping the reader aborts its in-flight requests.
    tokio::select! {
        _ = &mut reading => writing.await,
        result = &mut writing => result,
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> std::io::Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}

pub async fn handle_request(request: Request, ctx: &Context) -> Response {
    let id = request.id;
    match dispatch(&request.method, request.params, ctx).await {
        Ok(result) => Response::success(id, result),
        Err(e) => {
            debug!("Request {id:?} failed: {e}");
            Response::error(id, e.to_string())
        }
    }
}

async fn dispatch(method: &Value, params: Value, ctx: &Context) -> Result<Value, ToolError> {
    match Call::parse(method, params)? {
        Call::GetTools => Ok(json!(tool_manifest(ctx.readonly))),
        Call::Query { sql, params } => query(ctx, &sql, &params).await,
        Call::ListTables => list_tables(ctx).await,
        Call::DescribeTable { table } => describe_table(ctx, &table).await,
        Call::ListDatabases => list_databases(ctx).await,
        Call::UseDatabase { database } => use_database(ctx, &database).await,
        Call::Status => Ok(status(ctx).await),
    }
}

async fn query(ctx: &Context, sql: &str, params: &[Value]) -> Result<Value, ToolError> {
    if ctx.readonly && !is_select(sql) {
        return Err(ToolError::ReadOnlyViolation);
    }
    let outcome = ctx.session.query(sql, params).await?;
    Ok(outcome.into_json())
}

async fn list_tables(ctx: &Context) -> Result<Value, ToolError> {
    let rows = ctx.session.command("SHOW TABLES").await?;
    Ok(Value::Array(first_column(rows)))
}

async fn describe_table(ctx: &Context, table: &str) -> Result<Value, ToolError> {
    let sql = format!("DESCRIBE {}", quote_identifier(table));
    let rows = ctx.session.command(&sql).await?;
    Ok(rows_to_json(rows))
}

async fn list_databases(ctx: &Context) -> Result<Value, ToolError> {
    let rows = ctx.session.command("SHOW DATABASES").await?;
    Ok(Value::Array(first_column(rows)))
}

async fn use_database(ctx: &Context, database: &str) -> Result<Value, ToolError> {
    let sql = format!("USE {}", quote_identifier(database));
    ctx.session.command(&sql).await?;
    ctx.session.set_database(database).await;
    info!("Switched default database to '{database}'");
    Ok(json!({
        "message": format!("Successfully switched to database '{database}'")
    }))
}

async fn status(ctx: &Context) -> Value {
    match ctx.session.state().await {
        SessionState::Connected(info) => json!({
            "connected": true,
            "host": info.host,
            "port": info.port,
            "user": info.user,
            "database": info.database,
            "readonly": ctx.readonly,
        }),
        SessionState::Disconnected => json!({
            "connected": false,
            "message": "Not connected to database",
        }),
    }
}

fn tool_manifest(readonly: bool) -> ToolsList {
    let no_params = json!({
        "type": "object",
        "properties": {}
    });

    let mut list = ToolsList::default();
    list.add(
        "query",
        Tool {
            description: if readonly {
                "Execute a SELECT query on the MySQL database (read-only mode)".to_string()
            } else {
                "Execute an SQL query on the MySQL database".to_string()
            },
            parameters: json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "SQL query to execute"
                    },
                    "params": {
                        "type": "array",
                        "description": "Positional values for the query's ? placeholders",
                        "items": {
                            "type": "string"
                        }
                    }
                },
                "required": ["sql"]
            }),
        },
    );
    list.add(
        "list_tables",
        Tool {
            description: "List all tables in the current MySQL database".to_string(),
            parameters: no_params.clone(),
        },
    );
    list.add(
        "describe_table",
        Tool {
            description: "Describe the column structure of a MySQL table".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "table": {
                        "type": "string",
                        "description": "Name of the table to describe"
                    }
                },
                "required": ["table"]
            }),
        },
    );
    list.add(
        "list_databases",
        Tool {
            description: "List all databases accessible on the server".to_string(),
            parameters: no_params.clone(),
        },
    );
    list.add(
        "use_database",
        Tool {
            description: "Switch the connection to another database".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "database": {
                        "type": "string",
                        "description": "Name of the database to switch to"
                    }
                },
                "required": ["database"]
            }),
        },
    );
    list.add(
        "status",
        Tool {
            description: "Check the current database connection status".to_string(),
            parameters: no_params,
        },
    );
    list
}

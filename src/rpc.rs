use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ToolError;

/// One input line. Every field is optional on the wire so that a request with
/// a bad `method` can still be answered with its `id`.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// `None` only when the key is absent; an explicit `null` is kept.
    #[serde(default, deserialize_with = "present")]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Value,
    #[serde(default)]
    pub params: Value,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

impl Response {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, message: String) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody { message }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Tool {
    pub description: String,
    pub parameters: Value,
}

/// Tools keyed by name, in declaration order.
#[derive(Debug, Default, Serialize)]
pub struct ToolsList {
    pub tools: Map<String, Value>,
}

impl ToolsList {
    pub fn add(&mut self, name: &str, tool: Tool) {
        self.tools.insert(name.to_string(), json!(tool));
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryArguments {
    pub sql: Option<String>,
    pub params: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TableArguments {
    pub table: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatabaseArguments {
    pub database: Option<String>,
}

/// A request whose method is known and whose parameters have been checked.
#[derive(Debug, PartialEq)]
pub enum Call {
    GetTools,
    Query { sql: String, params: Vec<Value> },
    ListTables,
    DescribeTable { table: String },
    ListDatabases,
    UseDatabase { database: String },
    Status,
}

impl Call {
    pub fn parse(method: &Value, params: Value) -> Result<Self, ToolError> {
        let name = match method {
            Value::String(s) => s.as_str(),
            other => return Err(ToolError::UnsupportedMethod(other.to_string())),
        };

        match name {
            "get_tools" => Ok(Call::GetTools),
            "query" => {
                let args: QueryArguments = arguments(params)?;
                let sql = required(args.sql).ok_or(ToolError::MissingSql)?;
                Ok(Call::Query {
                    sql,
                    params: args.params.unwrap_or_default(),
                })
            }
            "list_tables" => Ok(Call::ListTables),
            "describe_table" => {
                let args: TableArguments = arguments(params)?;
                let table = required(args.table).ok_or(ToolError::MissingTable)?;
                Ok(Call::DescribeTable { table })
            }
            "list_databases" => Ok(Call::ListDatabases),
            "use_database" => {
                let args: DatabaseArguments = arguments(params)?;
                let database = required(args.database).ok_or(ToolError::MissingDatabase)?;
                Ok(Call::UseDatabase { database })
            }
            "status" => Ok(Call::Status),
            other => Err(ToolError::UnsupportedMethod(other.to_string())),
        }
    }
}

fn arguments<T>(params: Value) -> Result<T, ToolError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|e| ToolError::InvalidParams(e.to_string()))
}

// An empty string counts as missing.
fn required(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_fields_default_to_null() {
        let request: Request = serde_json::from_str(r#"{"method":"status"}"#).unwrap();
        assert_eq!(request.id, None);
        assert_eq!(request.method, json!("status"));
        assert_eq!(request.params, Value::Null);
    }

    #[test]
    fn test_non_object_line_is_not_a_request() {
        assert!(serde_json::from_str::<Request>("42").is_err());
        assert!(serde_json::from_str::<Request>("[1,2]").is_err());
        assert!(serde_json::from_str::<Request>("{not json").is_err());
    }

    #[test]
    fn test_response_envelopes() {
        let ok = Response::success(Some(json!(1)), json!(["a", "b"]));
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"id":1,"result":["a","b"]}"#);

        let err = Response::error(Some(json!("req-7")), "Table name is required".into());
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"id":"req-7","error":{"message":"Table name is required"}}"#
        );
    }

    #[test]
    fn test_absent_id_is_left_out_but_null_is_kept() {
        let request: Request = serde_json::from_str(r#"{"method":"x"}"#).unwrap();
        let response = Response::error(request.id, "Unsupported method: x".into());
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"error":{"message":"Unsupported method: x"}}"#
        );

        let request: Request = serde_json::from_str(r#"{"id":null,"method":"x"}"#).unwrap();
        assert_eq!(request.id, Some(Value::Null));
        let response = Response::error(request.id, "Unsupported method: x".into());
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"id":null,"error":{"message":"Unsupported method: x"}}"#
        );
    }

    #[test]
    fn test_tools_list_is_keyed_by_name() {
        let mut list = ToolsList::default();
        list.add(
            "status",
            Tool {
                description: "Check status".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
        );
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            json!({"tools": {"status": {"description": "Check status", "parameters": {"type": "object", "properties": {}}}}})
        );
    }

    #[test]
    fn test_parse_query() {
        let call = Call::parse(
            &json!("query"),
            json!({"sql": "SELECT * FROM users WHERE id = ?", "params": [3]}),
        )
        .unwrap();
        assert_eq!(
            call,
            Call::Query {
                sql: "SELECT * FROM users WHERE id = ?".into(),
                params: vec![json!(3)],
            }
        );

        let call = Call::parse(&json!("query"), json!({"sql": "SELECT 1"})).unwrap();
        assert_eq!(
            call,
            Call::Query {
                sql: "SELECT 1".into(),
                params: vec![],
            }
        );
    }

    #[test]
    fn test_parse_missing_required_params() {
        assert_eq!(Call::parse(&json!("query"), Value::Null), Err(ToolError::MissingSql));
        assert_eq!(Call::parse(&json!("query"), json!({"sql": ""})), Err(ToolError::MissingSql));
        assert_eq!(
            Call::parse(&json!("describe_table"), json!({})),
            Err(ToolError::MissingTable)
        );
        assert_eq!(
            Call::parse(&json!("use_database"), json!({"database": null})),
            Err(ToolError::MissingDatabase)
        );
    }

    #[test]
    fn test_parse_wrong_param_type() {
        let err = Call::parse(&json!("describe_table"), json!({"table": 5})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));
    }

    #[test]
    fn test_parse_unknown_method() {
        assert_eq!(
            Call::parse(&json!("drop_all"), Value::Null),
            Err(ToolError::UnsupportedMethod("drop_all".into()))
        );
        assert_eq!(
            Call::parse(&Value::Null, Value::Null),
            Err(ToolError::UnsupportedMethod("null".into()))
        );
    }

    #[test]
    fn test_parse_parameterless_methods_ignore_params() {
        assert_eq!(Call::parse(&json!("list_tables"), json!({"x": 1})), Ok(Call::ListTables));
        assert_eq!(Call::parse(&json!("list_databases"), Value::Null), Ok(Call::ListDatabases));
        assert_eq!(Call::parse(&json!("status"), Value::Null), Ok(Call::Status));
        assert_eq!(Call::parse(&json!("get_tools"), Value::Null), Ok(Call::GetTools));
    }
}

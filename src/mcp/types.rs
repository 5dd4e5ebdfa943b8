use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC version string sent on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision offered during the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON object used for operation arguments.
pub type JsonObject = Map<String, Value>;

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A push notification received from an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<Implementation>,
}

/// An operation advertised by an endpoint (`tools/list` entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// One parameter of an operation, derived from its input schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: String,
    pub required: bool,
    pub description: Option<String>,
    pub enum_values: Vec<String>,
}

impl OperationDescriptor {
    /// Parameters in name order.
    pub fn parameters(&self) -> Vec<ParameterSpec> {
        let Some(properties) = self
            .input_schema
            .get("properties")
            .and_then(Value::as_object)
        else {
            return Vec::new();
        };

        let required: Vec<&str> = self
            .input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut params: Vec<ParameterSpec> = properties
            .iter()
            .filter_map(|(name, prop)| {
                let prop = prop.as_object()?;
                let kind = prop
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let description = prop
                    .get("description")
                    .and_then(Value::as_str)
                    .filter(|d| !d.is_empty())
                    .map(ToString::to_string);
                let enum_values = prop
                    .get("enum")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Some(ParameterSpec {
                    name: name.clone(),
                    kind,
                    required: required.contains(&name.as_str()),
                    description,
                    enum_values,
                })
            })
            .collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<OperationDescriptor>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
    #[serde(rename = "structuredContent", default)]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// A successful result carrying a single text item.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![serde_json::json!({ "type": "text", "text": text.into() })],
            ..Self::default()
        }
    }

    /// An error result carrying a single text item.
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parameters_from_schema() {
        let op = OperationDescriptor {
            name: "search".to_string(),
            title: None,
            description: None,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What to look for" },
                    "depth": { "type": "string", "enum": ["basic", "advanced"] },
                    "limit": { "type": "integer", "description": "" }
                },
                "required": ["query"]
            }),
        };

        let params = op.parameters();
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["depth", "limit", "query"]);

        assert_eq!(params[0].enum_values, vec!["basic", "advanced"]);
        assert!(!params[0].required);
        assert_eq!(params[1].kind, "integer");
        assert_eq!(params[1].description, None);
        assert!(params[2].required);
        assert_eq!(params[2].description.as_deref(), Some("What to look for"));
    }

    #[test]
    fn test_parameters_without_schema() {
        let op = OperationDescriptor {
            name: "now".to_string(),
            title: None,
            description: None,
            input_schema: Value::Null,
        };
        assert!(op.parameters().is_empty());
    }

    #[test]
    fn test_call_result_wire_names() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [{ "type": "text", "text": "ok" }],
            "isError": true
        }))
        .unwrap();
        assert!(result.is_error);
        assert_eq!(result.content.len(), 1);
        assert!(result.structured_content.is_none());
    }
}

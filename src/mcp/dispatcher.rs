//! Generic `mcp_query` tool: routes `{operation, resource, params}` to the
//! named endpoint and turns the outcome into one text payload for the model.

use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mcp::manager::ConnectionManager;
use crate::mcp::registry::EndpointRegistry;
use crate::mcp::transport::CallContext;
use crate::mcp::types::{CallToolResult, JsonObject, OperationDescriptor};

/// Name of the function advertised to the model.
pub const DISPATCH_TOOL_NAME: &str = "mcp_query";

/// Returned for successful calls that produced no content.
pub const NO_DATA_RESULT: &str = "Tool executed successfully with no return data.";

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Arguments of one `mcp_query` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(default)]
    pub operation: String,
    /// Endpoint name.
    #[serde(default)]
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonObject>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: EndpointRegistry,
    call_timeout: Duration,
    list_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: EndpointRegistry) -> Self {
        Self {
            registry,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            list_timeout: DEFAULT_LIST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    #[must_use]
    pub fn with_list_timeout(mut self, list_timeout: Duration) -> Self {
        self.list_timeout = list_timeout;
        self
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub async fn execute(&self, arguments: &str) -> Result<String> {
        self.execute_with(arguments, &CancellationToken::new()).await
    }

    /// Like [`Dispatcher::execute`], aborting with [`Error::Cancelled`] when
    /// `cancel` fires.
    pub async fn execute_with(&self, arguments: &str, cancel: &CancellationToken) -> Result<String> {
        let request: DispatchRequest =
            serde_json::from_str(arguments).map_err(|e| Error::InvalidArguments(e.to_string()))?;

        if request.resource.is_empty() {
            return Err(Error::MissingField("resource"));
        }
        if request.operation.is_empty() {
            return Err(Error::MissingField("operation"));
        }

        let manager = self
            .registry
            .lookup(&request.resource)
            .ok_or_else(|| Error::EndpointNotFound(request.resource.clone()))?;

        tracing::debug!(
            endpoint = %request.resource,
            operation = %request.operation,
            params = ?request.params,
            "dispatching call"
        );

        let result = self
            .invoke_bounded(&manager, &request, cancel)
            .await
            .map_err(|e| {
                tracing::error!(
                    endpoint = %request.resource,
                    operation = %request.operation,
                    error = %e,
                    "call failed"
                );
                Error::Invocation {
                    endpoint: request.resource.clone(),
                    operation: request.operation.clone(),
                    source: Box::new(e),
                }
            })?;

        if result.is_error {
            let message = format!(
                "Error executing tool {}: {}",
                request.operation,
                render_error_payload(&error_payload(&result))
            );
            tracing::warn!(endpoint = %request.resource, "{message}");
            return Ok(message);
        }

        if result.content.is_empty() {
            tracing::info!(operation = %request.operation, "call returned no content");
            return Ok(NO_DATA_RESULT.to_string());
        }

        Ok(serde_json::to_string(&result.content)?)
    }

    /// Execute a model-issued call. Only [`DISPATCH_TOOL_NAME`] is routed.
    pub async fn execute_call(&self, name: &str, arguments: &str) -> Result<String> {
        if name != DISPATCH_TOOL_NAME {
            return Err(Error::UnsupportedTool(name.to_string()));
        }
        self.execute(arguments).await
    }

    async fn invoke_bounded(
        &self,
        manager: &ConnectionManager,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<CallToolResult> {
        let ctx = CallContext::with_timeout(self.call_timeout).cancelled_by(cancel.clone());
        tokio::time::timeout(
            self.call_timeout,
            manager.invoke(&request.operation, request.params.clone(), &ctx),
        )
        .await
        .map_err(|_elapsed| Error::Timeout {
            method: request.operation.clone(),
            after: self.call_timeout,
        })?
    }

    async fn list_bounded(&self, manager: &ConnectionManager) -> Result<Vec<OperationDescriptor>> {
        let ctx = CallContext::with_timeout(self.list_timeout);
        tokio::time::timeout(self.list_timeout, manager.list_operations(&ctx))
            .await
            .map_err(|_elapsed| Error::Timeout {
                method: "tools/list".to_string(),
                after: self.list_timeout,
            })?
    }

    /// Function definition of the dispatch tool, in the chat-completions
    /// `tools` shape. Operation listings are fetched from every endpoint.
    pub async fn tool_definition(&self) -> Value {
        let names = self.registry.names();

        let listings = join_all(names.iter().map(|name| async move {
            let Some(manager) = self.registry.lookup(name) else {
                tracing::warn!(endpoint = %name, "endpoint vanished while building tool definition");
                return None;
            };
            let described = match self.list_bounded(&manager).await {
                Err(e) => {
                    tracing::error!(endpoint = %name, error = %e, "listing operations failed");
                    format!("For endpoint '{name}': (could not list tools - {e})")
                }
                Ok(ops) if ops.is_empty() => format!("For endpoint '{name}': No tools listed."),
                Ok(ops) => {
                    let details: Vec<String> = ops
                        .iter()
                        .map(|op| format!("'{}'{}", op.name, describe_parameters(op)))
                        .collect();
                    format!(
                        "For endpoint '{name}', available operations are: {}",
                        details.join("; ")
                    )
                }
            };
            Some(described)
        }))
        .await;
        let listings: Vec<String> = listings.into_iter().flatten().collect();

        let mut operation_description =
            "The operation (tool name) to call on the target endpoint. ".to_string();
        if listings.is_empty() {
            operation_description.push_str("No endpoints or tools seem to be available.");
        } else {
            operation_description.push_str("Details per endpoint: ");
            operation_description.push_str(&listings.join(". "));
        }

        let mut resource_description = "The name of the endpoint to target.".to_string();
        if !names.is_empty() {
            resource_description.push_str(" Available endpoints: ");
            resource_description.push_str(&names.join(", "));
        }

        json!({
            "type": "function",
            "function": {
                "name": DISPATCH_TOOL_NAME,
                "description": "Query an MCP (Model Context Protocol) endpoint. Use this to interact with external services or data sources configured as tool endpoints.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "operation": {
                            "type": "string",
                            "description": operation_description
                        },
                        "resource": {
                            "type": "string",
                            "description": resource_description
                        },
                        "params": {
                            "type": "object",
                            "description": "A JSON object containing the arguments for the operation. Can be an empty object if not needed.",
                            "additionalProperties": true
                        }
                    },
                    "required": ["operation", "resource"]
                }
            }
        })
    }
}

/// `" which requires parameters: { ... }"`, or empty when the operation
/// takes none.
pub fn describe_parameters(op: &OperationDescriptor) -> String {
    let params = op.parameters();
    if params.is_empty() {
        return String::new();
    }

    let rendered: Vec<String> = params
        .iter()
        .map(|p| {
            let mut details = vec![format!("type: {}", p.kind)];
            if p.required {
                details.push("required".to_string());
            }
            if let Some(desc) = &p.description {
                details.push(format!("description: '{desc}'"));
            }
            if !p.enum_values.is_empty() {
                details.push(format!("enum: [{}]", p.enum_values.join(", ")));
            }
            format!("'{}' ({})", p.name, details.join(", "))
        })
        .collect();

    format!(" which requires parameters: {{ {} }}", rendered.join(", "))
}

/// Pick the error payload of a result flagged `isError`.
pub fn error_payload(result: &CallToolResult) -> Value {
    if let Some(structured) = &result.structured_content {
        return structured.clone();
    }

    if let [item] = result.content.as_slice() {
        if let Some(text) = item.get("text").and_then(Value::as_str) {
            return serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        }
    }

    Value::Array(result.content.clone())
}

fn message_of(entry: &Value) -> Option<&str> {
    entry.get("message").and_then(Value::as_str)
}

/// Render a tool error payload as one sentence.
pub fn render_error_payload(payload: &Value) -> String {
    match payload {
        Value::Null => return "an unknown error occurred".to_string(),
        Value::Object(fields)
            if !fields.is_empty()
                && fields
                    .values()
                    .all(|v| v.as_array().is_some_and(|a| a.iter().all(Value::is_object))) =>
        {
            let mut sorted: Vec<(&String, &Value)> = fields.iter().collect();
            sorted.sort_by_key(|(field, _)| *field);
            let parts: Vec<String> = sorted
                .into_iter()
                .filter_map(|(field, messages)| {
                    let first = messages.as_array()?.first()?;
                    Some(format!(
                        "parameter '{field}' has an error ({})",
                        message_of(first).unwrap_or_default()
                    ))
                })
                .collect();
            if !parts.is_empty() {
                return parts.join(", ");
            }
        }
        Value::Array(entries) if !entries.is_empty() && entries.iter().all(Value::is_object) => {
            let parts: Vec<&str> = entries
                .iter()
                .filter_map(message_of)
                .filter(|m| !m.is_empty())
                .collect();
            if !parts.is_empty() {
                return parts.join(", ");
            }
        }
        Value::String(s) if !s.is_empty() => return s.clone(),
        _ => {}
    }

    format!("an unspecified error occurred, details: {payload}")
}

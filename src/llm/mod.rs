//! Model-side half of the relay.
//!
//! The language model itself is a black box that yields raw content
//! chunks. This module reassembles the function calls mixed into that
//! stream ([`stream::ToolCallAggregator`]) and drives one conversation turn
//! against the tool endpoints ([`turn::run_turn`]).
//!
//! The message types mirror the chat-completions wire shape so the outcome
//! of a turn can be appended to whatever history store the caller keeps.

pub mod stream;
pub mod turn;

pub use stream::{CLARIFICATION_TOOL_NAME, Chunk, ResolvedToolCall, ToolCallAggregator};
pub use turn::{ToolResult, TurnOutcome, run_turn};

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Role of the message author.
    pub role: MessageRole,
    pub content: String,
    /// Tool call this message answers (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Calls issued by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Assistant message; `tool_calls` is omitted when empty.
    #[must_use]
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        }
    }

    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call made by the assistant.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    /// Type of tool (always "function" for now).
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

/// Function details in a tool call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as JSON string.
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::assistant(
            "",
            vec![ToolCall {
                id: "c1".to_string(),
                call_type: "function".to_string(),
                function: ToolCallFunction {
                    name: "mcp_query".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["tool_calls"][0]["type"], "function");
        assert!(v.get("tool_call_id").is_none());

        let tool = serde_json::to_value(Message::tool("c1", "ok")).unwrap();
        assert_eq!(
            tool,
            json!({ "role": "tool", "content": "ok", "tool_call_id": "c1" })
        );
    }

    #[test]
    fn test_assistant_without_calls_omits_field() {
        let v = serde_json::to_value(Message::assistant("hello", Vec::new())).unwrap();
        assert!(v.get("tool_calls").is_none());
    }
}

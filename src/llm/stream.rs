//! Reassembly of function calls from a raw model content stream.
//!
//! The stream mixes free text with call fragments. A chunk that parses as
//! a non-empty JSON array is a list of fragments
//! `{id?, type?, function?: {name?, arguments?}}`; anything else is text
//! and is kept byte for byte. A fragment with an id opens a call, one
//! without continues the most recent call by appending to its argument
//! text.

use std::{borrow::Cow, collections::HashMap};

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::llm::{ToolCall, ToolCallFunction};
use crate::mcp::types::JsonObject;

/// Tool name the model uses to ask the user a question instead of acting.
pub const CLARIFICATION_TOOL_NAME: &str = "ask_user_for_input";

/// Question used when the clarification call carries none.
pub const DEFAULT_CLARIFICATION_PROMPT: &str =
    "I need more information, but I couldn't form a specific question. Can you provide more details?";

const DEFAULT_CALL_TYPE: &str = "function";

#[derive(Debug, Deserialize)]
struct Fragment {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    call_type: Option<String>,
    #[serde(default)]
    function: Option<FragmentFunction>,
}

#[derive(Debug, Deserialize)]
struct FragmentFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// How one input chunk was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk<'c> {
    /// Literal text, to be shown to the user as is.
    Text(&'c [u8]),
    /// At least one fragment was applied to a call.
    Fragment,
    /// Protocol data that carried nothing to apply.
    Ignored,
}

#[derive(Debug, Clone)]
struct PendingToolCall {
    id: String,
    call_type: String,
    name: Option<String>,
    arguments: String,
}

/// A fully received call with validated arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedToolCall {
    pub id: String,
    pub call_type: String,
    pub name: String,
    pub arguments: JsonObject,
    /// Argument text exactly as streamed.
    pub raw_arguments: String,
}

impl ResolvedToolCall {
    pub fn is_clarification(&self) -> bool {
        self.name == CLARIFICATION_TOOL_NAME
    }

    /// The call in chat-completions message form.
    pub fn to_tool_call(&self) -> ToolCall {
        ToolCall {
            id: self.id.clone(),
            call_type: self.call_type.clone(),
            function: ToolCallFunction {
                name: self.name.clone(),
                arguments: self.raw_arguments.clone(),
            },
        }
    }
}

/// Per-response aggregation state. Feed every chunk to
/// [`ToolCallAggregator::handle`] in order, then call
/// [`ToolCallAggregator::resolve`].
#[derive(Debug, Default)]
pub struct ToolCallAggregator {
    full_text: Vec<u8>,
    calls: Vec<PendingToolCall>,
    index: HashMap<String, usize>,
    current: Option<usize>,
    interrupted: bool,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret one chunk.
    pub fn handle<'c>(&mut self, chunk: &'c [u8]) -> Chunk<'c> {
        let fragments: Vec<Fragment> = serde_json::from_slice(chunk).unwrap_or_default();
        if fragments.is_empty() {
            self.full_text.extend_from_slice(chunk);
            return Chunk::Text(chunk);
        }

        let mut applied = false;
        for fragment in fragments {
            applied |= self.apply(fragment);
        }
        if applied { Chunk::Fragment } else { Chunk::Ignored }
    }

    fn apply(&mut self, fragment: Fragment) -> bool {
        let Some(function) = fragment.function else {
            tracing::trace!(id = ?fragment.id, "fragment without function, ignoring");
            return false;
        };
        let name = function.name.filter(|n| !n.is_empty());
        let arguments = function.arguments.unwrap_or_default();

        let slot = match fragment.id.filter(|id| !id.is_empty()) {
            Some(id) => match self.index.get(&id) {
                Some(&slot) => slot,
                None => {
                    let slot = self.calls.len();
                    self.calls.push(PendingToolCall {
                        id: id.clone(),
                        call_type: fragment
                            .call_type
                            .filter(|t| !t.is_empty())
                            .unwrap_or_else(|| DEFAULT_CALL_TYPE.to_string()),
                        name: None,
                        arguments: String::new(),
                    });
                    self.index.insert(id, slot);
                    slot
                }
            },
            None => match self.current {
                Some(slot) => slot,
                None => {
                    tracing::debug!("continuation fragment without an open call, ignoring");
                    return false;
                }
            },
        };

        let call = &mut self.calls[slot];
        if call.name.is_none() {
            if let Some(name) = name {
                if name == CLARIFICATION_TOOL_NAME {
                    tracing::debug!(id = %call.id, "clarification requested");
                    self.interrupted = true;
                }
                call.name = Some(name);
            }
        }
        call.arguments.push_str(&arguments);
        self.current = Some(slot);
        true
    }

    /// All text received so far, decoded lossily.
    pub fn full_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.full_text)
    }

    /// All text received so far, byte for byte.
    pub fn full_text_bytes(&self) -> &[u8] {
        &self.full_text
    }

    /// Whether the model asked the user a question.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    /// Validate every call in arrival order. The first call whose
    /// arguments are not a JSON object fails the whole resolution.
    pub fn resolve(&self) -> Result<Vec<ResolvedToolCall>> {
        self.calls
            .iter()
            .map(|call| {
                let arguments = parse_arguments(call)?;
                Ok(ResolvedToolCall {
                    id: call.id.clone(),
                    call_type: call.call_type.clone(),
                    name: call.name.clone().unwrap_or_default(),
                    arguments,
                    raw_arguments: call.arguments.clone(),
                })
            })
            .collect()
    }

    /// The question of the clarification call, if the model made one.
    pub fn clarification_question(&self) -> Option<String> {
        if !self.interrupted {
            return None;
        }
        let question = self
            .calls
            .iter()
            .find(|c| c.name.as_deref() == Some(CLARIFICATION_TOOL_NAME))
            .and_then(|c| serde_json::from_str::<Value>(&c.arguments).ok())
            .and_then(|args| {
                args.get("question")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(ToString::to_string)
            });
        Some(question.unwrap_or_else(|| DEFAULT_CLARIFICATION_PROMPT.to_string()))
    }
}

fn parse_arguments(call: &PendingToolCall) -> Result<JsonObject> {
    let malformed = |reason: String| {
        tracing::error!(id = %call.id, arguments = %call.arguments, "invalid tool call arguments");
        Error::MalformedArguments {
            call_id: call.id.clone(),
            reason,
        }
    };

    match serde_json::from_str::<Value>(&call.arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(malformed(format!("expected a JSON object, got {other}"))),
        Err(e) => Err(malformed(e.to_string())),
    }
}

//! One conversation turn: model stream in, tool results out.

use anyhow::Context;
use futures::{Stream, StreamExt, future::join_all};

use crate::llm::Message;
use crate::llm::stream::{Chunk, ResolvedToolCall, ToolCallAggregator};
use crate::mcp::dispatcher::Dispatcher;

/// Output of one dispatched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model asked the user a question; nothing was dispatched.
    Clarification {
        question: String,
        calls: Vec<ResolvedToolCall>,
    },
    /// Calls were dispatched; one result per call, in call order.
    ToolResults {
        text: String,
        calls: Vec<ResolvedToolCall>,
        results: Vec<ToolResult>,
    },
    /// Plain answer without calls.
    Reply { text: String },
}

impl TurnOutcome {
    /// Messages to append to the conversation history.
    pub fn messages(&self) -> Vec<Message> {
        match self {
            Self::Clarification { question, .. } => vec![Message::assistant(question.clone(), Vec::new())],
            Self::ToolResults {
                text,
                calls,
                results,
            } => {
                let mut messages = Vec::with_capacity(results.len() + 1);
                messages.push(Message::assistant(
                    text.clone(),
                    calls.iter().map(ResolvedToolCall::to_tool_call).collect(),
                ));
                messages.extend(
                    results
                        .iter()
                        .map(|r| Message::tool(r.call_id.clone(), r.output.clone())),
                );
                messages
            }
            Self::Reply { text } => vec![Message::assistant(text.clone(), Vec::new())],
        }
    }
}

/// Consume one model response. Text chunks are passed to `on_text` as
/// they arrive; calls are resolved once the stream ends and dispatched
/// unless the model asked for clarification.
pub async fn run_turn<S, B, F>(
    stream: S,
    dispatcher: &Dispatcher,
    mut on_text: F,
) -> anyhow::Result<TurnOutcome>
where
    S: Stream<Item = anyhow::Result<B>>,
    B: AsRef<[u8]>,
    F: FnMut(&[u8]),
{
    let mut aggregator = ToolCallAggregator::new();

    futures::pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("model stream failed")?;
        if let Chunk::Text(text) = aggregator.handle(chunk.as_ref()) {
            on_text(text);
        }
    }

    let calls = aggregator
        .resolve()
        .context("model produced malformed tool calls")?;
    let text = aggregator.full_text().into_owned();

    if let Some(question) = aggregator.clarification_question() {
        tracing::info!(%question, "model asked for clarification");
        return Ok(TurnOutcome::Clarification { question, calls });
    }
    if calls.is_empty() {
        return Ok(TurnOutcome::Reply { text });
    }

    tracing::debug!(count = calls.len(), "dispatching tool calls");
    let results = join_all(calls.iter().map(|call| async move {
        let output = match dispatcher.execute_call(&call.name, &call.raw_arguments).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(id = %call.id, tool = %call.name, error = %e, "tool call failed");
                format!("Error executing tool {}: {e}", call.name)
            }
        };
        ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output,
        }
    }))
    .await;

    Ok(TurnOutcome::ToolResults {
        text,
        calls,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MessageRole;
    use crate::mcp::manager::tests::MockConnector;
    use crate::mcp::manager::{ConnectionManager, ManagerSettings};
    use crate::mcp::registry::EndpointRegistry;
    use crate::mcp::transport::Connector;
    use serde_json::json;
    use std::sync::Arc;

    fn chunks(items: Vec<String>) -> impl Stream<Item = anyhow::Result<Vec<u8>>> {
        futures::stream::iter(items.into_iter().map(|s| Ok(s.into_bytes())))
    }

    async fn dispatcher() -> Dispatcher {
        let connector: Arc<dyn Connector> = Arc::new(MockConnector::default());
        let manager = Arc::new(ConnectionManager::new(
            "time",
            connector,
            ManagerSettings::default(),
        ));
        manager.start().await.unwrap();
        let registry = EndpointRegistry::new();
        registry.register(manager);
        Dispatcher::new(registry)
    }

    #[tokio::test]
    async fn test_plain_reply_streams_text() {
        let dispatcher = Dispatcher::new(EndpointRegistry::new());
        let mut shown = Vec::new();
        let outcome = run_turn(
            chunks(vec!["Hello".into(), ", world".into()]),
            &dispatcher,
            |t| shown.extend_from_slice(t),
        )
        .await
        .unwrap();

        assert_eq!(shown, b"Hello, world");
        assert_eq!(
            outcome,
            TurnOutcome::Reply {
                text: "Hello, world".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_calls_dispatched_in_order() {
        let dispatcher = dispatcher().await;
        let first = json!([{ "id": "c1", "type": "function", "function": {
            "name": "mcp_query",
            "arguments": "{\"resource\":\"time\",\"operation\":\"now\"}"
        }}]);
        let second = json!([{ "id": "c2", "type": "function", "function": {
            "name": "web_search",
            "arguments": "{}"
        }}]);

        let outcome = run_turn(
            chunks(vec!["Checking".into(), first.to_string(), second.to_string()]),
            &dispatcher,
            |_| {},
        )
        .await
        .unwrap();

        let TurnOutcome::ToolResults { text, results, .. } = &outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(text, "Checking");
        assert_eq!(results[0].call_id, "c1");
        assert!(results[0].output.contains("now ok"));
        assert_eq!(results[1].output, "Error executing tool web_search: unsupported tool: web_search");

        let messages = outcome.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(messages[0].tool_calls.as_ref().map(Vec::len), Some(2));
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_clarification_skips_dispatch() {
        let dispatcher = Dispatcher::new(EndpointRegistry::new());
        let ask = json!([{ "id": "q1", "function": {
            "name": "ask_user_for_input",
            "arguments": "{\"question\":\"Which city?\"}"
        }}]);

        let outcome = run_turn(chunks(vec![ask.to_string()]), &dispatcher, |_| {})
            .await
            .unwrap();
        match &outcome {
            TurnOutcome::Clarification { question, calls } => {
                assert_eq!(question, "Which city?");
                assert_eq!(calls.len(), 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(outcome.messages()[0].content, "Which city?");
    }

    #[tokio::test]
    async fn test_malformed_calls_fail_turn() {
        let dispatcher = Dispatcher::new(EndpointRegistry::new());
        let broken = json!([{ "id": "c1", "function": { "name": "mcp_query", "arguments": "{\"resource\":" } }]);
        let err = run_turn(chunks(vec![broken.to_string()]), &dispatcher, |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("malformed tool calls"));
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let dispatcher = Dispatcher::new(EndpointRegistry::new());
        let stream = futures::stream::iter(vec![
            Ok(b"partial".to_vec()),
            Err(anyhow::anyhow!("connection reset")),
        ]);
        let err = run_turn(stream, &dispatcher, |_| {}).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection reset"));
    }
}

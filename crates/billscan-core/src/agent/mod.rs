//! Agentic extraction: the model reads the document through tools and ends
//! the conversation by calling `submit_invoice`.

use anyhow::{bail, Result};
use tracing::{debug, warn};

pub mod client;
pub mod prompts;
pub mod resolver;
pub mod schema;
pub mod tools;

pub use client::{ChatClient, ChatMessage, HttpChatClient};
pub use resolver::ModelResolver;
pub use schema::{Entry, StructuredExtraction};

use client::ToolDefinition;
use tools::{ToolContext, ToolInvocation};

const MAX_ITERATIONS: usize = 12;

#[derive(Debug)]
pub struct AgentOutcome {
    pub extraction: StructuredExtraction,
    /// Full conversation, kept with the document for audit.
    pub raw_conversation: Vec<ChatMessage>,
}

/// Run the extraction conversation to completion.
///
/// Returns an error if the model never submits within the iteration budget
/// or the transport fails; tool-level mistakes (unknown tool, bad arguments,
/// invalid submission payload) are reported back to the model instead.
pub async fn agentic_extract(
    client: &dyn ChatClient,
    model: &str,
    full_text: &str,
    pages: Vec<String>,
) -> Result<AgentOutcome> {
    let ctx = ToolContext {
        full_text: full_text.to_string(),
        pages,
    };
    let tool_defs: Vec<ToolDefinition> = tools::tool_definitions();

    let mut messages = vec![
        ChatMessage::system(prompts::SYSTEM_PROMPT),
        ChatMessage::user(prompts::build_user_prompt(full_text, ctx.pages.len())),
    ];

    for iteration in 0..MAX_ITERATIONS {
        let result = client.complete(model, &messages, &tool_defs).await?;
        messages.push(result.assistant_message.clone());

        if result.tool_calls.is_empty() {
            // Prose without a tool call does not finish the job.
            debug!(iteration, "model replied with prose only, nudging");
            messages.push(ChatMessage::user(
                "Use the submit_invoice tool to submit the extracted data. \
Do not reply with plain text.",
            ));
            continue;
        }

        for call in &result.tool_calls {
            let invocation = match ToolInvocation::parse(&call.name, &call.arguments) {
                Ok(inv) => inv,
                Err(message) => {
                    warn!(tool = %call.name, %message, "rejected tool call");
                    messages.push(ChatMessage::tool_result(call.id.clone(), message));
                    continue;
                }
            };

            if let ToolInvocation::SubmitInvoice { payload } = &invocation {
                match serde_json::from_value::<StructuredExtraction>(payload.clone()) {
                    Ok(extraction) => {
                        messages.push(ChatMessage::tool_result(call.id.clone(), "invoice received"));
                        return Ok(AgentOutcome {
                            extraction,
                            raw_conversation: messages,
                        });
                    }
                    Err(e) => {
                        messages.push(ChatMessage::tool_result(
                            call.id.clone(),
                            format!("Submission rejected, fix and resubmit: {e}"),
                        ));
                        continue;
                    }
                }
            }

            let output = invocation.execute(&ctx);
            messages.push(ChatMessage::tool_result(call.id.clone(), output));
        }
    }

    bail!("model did not submit invoice data within {MAX_ITERATIONS} turns")
}

#[cfg(test)]
mod agent_tests {
    use super::*;
    use async_trait::async_trait;
    use client::{CompletedToolCall, CompletionResult, WireFunctionCall, WireToolCall};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Plays back a fixed sequence of assistant turns and records what it
    /// was sent.
    struct ScriptedClient {
        turns: Mutex<Vec<CompletionResult>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedClient {
        fn new(turns: Vec<CompletionResult>) -> Self {
            let mut turns = turns;
            turns.reverse();
            Self {
                turns: Mutex::new(turns),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<CompletionResult> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.turns
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    fn tool_turn(calls: Vec<(&str, &str, Value)>) -> CompletionResult {
        let wire: Vec<WireToolCall> = calls
            .iter()
            .map(|(id, name, args)| WireToolCall {
                id: id.to_string(),
                call_type: "function".to_string(),
                function: WireFunctionCall {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            })
            .collect();
        let parsed = calls
            .into_iter()
            .map(|(id, name, args)| CompletedToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args,
            })
            .collect();
        CompletionResult {
            text: None,
            tool_calls: parsed,
            assistant_message: ChatMessage {
                role: "assistant".to_string(),
                content: None,
                tool_calls: Some(wire),
                tool_call_id: None,
            },
        }
    }

    fn prose_turn(text: &str) -> CompletionResult {
        CompletionResult {
            text: Some(text.to_string()),
            tool_calls: vec![],
            assistant_message: ChatMessage {
                role: "assistant".to_string(),
                content: Some(text.to_string()),
                tool_calls: None,
                tool_call_id: None,
            },
        }
    }

    fn submit(payload: Value) -> CompletionResult {
        tool_turn(vec![("call_submit", "submit_invoice", payload)])
    }

    #[tokio::test]
    async fn test_tools_then_submit() {
        let client = ScriptedClient::new(vec![
            tool_turn(vec![("c1", "search_text", json!({"query": "total"}))]),
            submit(json!({
                "supplier_name": "Acme Corp",
                "total_amount": 115.0,
                "entries": [{"label": "Total", "amount": 115.0, "type": "total"}]
            })),
        ]);

        let outcome = agentic_extract(
            &client,
            "test-model",
            "Acme Corp\nTotal 115.00",
            vec!["Acme Corp\nTotal 115.00".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(outcome.extraction.supplier_name.as_deref(), Some("Acme Corp"));
        assert_eq!(outcome.extraction.entries.len(), 1);

        // The second request must carry the search result back to the model.
        let seen = client.seen.lock().unwrap();
        let second = &seen[1];
        let tool_msg = second.iter().find(|m| m.role == "tool").unwrap();
        assert!(tool_msg.content.as_deref().unwrap().contains("Total 115.00"));
    }

    #[tokio::test]
    async fn test_prose_reply_gets_nudged() {
        let client = ScriptedClient::new(vec![
            prose_turn("The supplier appears to be Acme Corp."),
            submit(json!({"entries": []})),
        ]);

        let outcome = agentic_extract(&client, "m", "text", vec![])
            .await
            .unwrap();
        assert!(outcome.extraction.entries.is_empty());

        let seen = client.seen.lock().unwrap();
        let nudge = seen[1].last().unwrap();
        assert_eq!(nudge.role, "user");
        assert!(nudge.content.as_deref().unwrap().contains("submit_invoice"));
    }

    #[tokio::test]
    async fn test_unknown_tool_reported_not_fatal() {
        let client = ScriptedClient::new(vec![
            tool_turn(vec![("c1", "fetch_url", json!({"url": "http://x"}))]),
            submit(json!({"entries": []})),
        ]);

        agentic_extract(&client, "m", "text", vec![]).await.unwrap();

        let seen = client.seen.lock().unwrap();
        let error_result = seen[1].iter().find(|m| m.role == "tool").unwrap();
        assert_eq!(
            error_result.content.as_deref(),
            Some("Unknown tool: fetch_url")
        );
    }

    #[tokio::test]
    async fn test_invalid_submission_asks_for_resubmit() {
        let client = ScriptedClient::new(vec![
            submit(json!({"entries": "not an array"})),
            submit(json!({"entries": []})),
        ]);

        let outcome = agentic_extract(&client, "m", "text", vec![]).await.unwrap();
        assert!(outcome.extraction.entries.is_empty());

        let seen = client.seen.lock().unwrap();
        let rejection = seen[1].iter().find(|m| m.role == "tool").unwrap();
        assert!(rejection
            .content
            .as_deref()
            .unwrap()
            .contains("Submission rejected"));
    }

    #[tokio::test]
    async fn test_iteration_budget_exhausted() {
        let turns = (0..MAX_ITERATIONS)
            .map(|_| tool_turn(vec![("c", "search_text", json!({"query": "x"}))]))
            .collect();
        let client = ScriptedClient::new(turns);
        let err = agentic_extract(&client, "m", "text", vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not submit"));
    }
}

//! Verification pass: cross-check an OCR-derived extraction against the
//! document's broken-but-digit-accurate text layer.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::agent::client::{ChatClient, ChatMessage};
use crate::agent::prompts;
use crate::agent::schema::StructuredExtraction;

#[derive(Debug, Deserialize)]
pub struct Verification {
    pub corrected: StructuredExtraction,
    pub corrections: Vec<String>,
}

/// One model round trip, no tools. The model sees the extraction and the
/// text layer side by side and returns corrections plus the corrected data.
pub async fn verify_extraction(
    client: &dyn ChatClient,
    model: &str,
    extraction: &StructuredExtraction,
    text_layer: &str,
) -> Result<Verification> {
    let extraction_json =
        serde_json::to_string_pretty(extraction).context("failed to serialize extraction")?;
    let messages = [
        ChatMessage::system(prompts::VERIFY_SYSTEM_PROMPT),
        ChatMessage::user(prompts::build_verify_prompt(&extraction_json, text_layer)),
    ];

    let result = client.complete(model, &messages, &[]).await?;
    let text = result
        .text
        .ok_or_else(|| anyhow!("verification model returned no text"))?;
    let body = extract_json_object(&text)
        .ok_or_else(|| anyhow!("verification response contained no JSON object"))?;
    serde_json::from_str(body).context("failed to parse verification response")
}

/// The first balanced `{...}` in the text. Models wrap JSON in prose or
/// code fences often enough that plain from_str on the whole reply fails.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::client::{CompletionResult, ToolDefinition};
    use async_trait::async_trait;

    struct CannedReply(String);

    #[async_trait]
    impl ChatClient for CannedReply {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<CompletionResult> {
            Ok(CompletionResult {
                text: Some(self.0.clone()),
                tool_calls: vec![],
                assistant_message: ChatMessage::user(self.0.clone()),
            })
        }
    }

    fn sample_extraction() -> StructuredExtraction {
        StructuredExtraction {
            supplier_name: Some("Acme Corp".to_string()),
            invoice_number: Some("INV-1O01".to_string()),
            total_amount: Some(115.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_corrections_applied() {
        let reply = r#"Looked it over, here is the result:
```json
{"corrections": ["invoice_number: INV-1O01 corrected to INV-1001"],
 "corrected": {"supplier_name": "Acme Corp", "invoice_number": "INV-1001", "total_amount": 115.0}}
```"#;
        let client = CannedReply(reply.to_string());
        let verification =
            verify_extraction(&client, "m", &sample_extraction(), "INV-1001 layer text")
                .await
                .unwrap();
        assert_eq!(verification.corrections.len(), 1);
        assert_eq!(
            verification.corrected.invoice_number.as_deref(),
            Some("INV-1001")
        );
    }

    #[tokio::test]
    async fn test_zero_corrections_returns_data_unchanged() {
        let extraction = sample_extraction();
        let reply = format!(
            r#"{{"corrections": [], "corrected": {}}}"#,
            serde_json::to_string(&extraction).unwrap()
        );
        let client = CannedReply(reply);
        let verification = verify_extraction(&client, "m", &extraction, "layer")
            .await
            .unwrap();
        assert!(verification.corrections.is_empty());
        assert_eq!(verification.corrected, extraction);
    }

    #[tokio::test]
    async fn test_non_json_reply_is_an_error() {
        let client = CannedReply("everything looks fine to me".to_string());
        let err = verify_extraction(&client, "m", &sample_extraction(), "layer")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn test_balanced_object_extraction() {
        let text = r#"prefix {"a": {"b": "}"}} suffix"#;
        assert_eq!(extract_json_object(text), Some(r#"{"a": {"b": "}"}}"#));
    }
}

//! Where pipeline results land. The trait keeps the pipeline independent of
//! any particular persistence layer; `MemoryStore` backs the CLI and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::agent::client::ChatMessage;
use crate::agent::schema::StructuredExtraction;
use crate::extract::OcrTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Uploading,
    Extracting,
    Processing,
    Verifying,
    Draft,
    Exception,
    Error,
}

/// Final output for a successfully processed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResult {
    pub display_name: String,
    pub extraction: StructuredExtraction,
    pub raw_conversation: Vec<ChatMessage>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn set_status(&self, document_id: &str, status: DocumentStatus);
    /// Raw text and tier are stored as soon as extraction finishes, before
    /// any model work, so an LLM failure never loses the extracted text.
    async fn record_raw_extraction(&self, document_id: &str, tier: OcrTier, raw_text: &str);
    async fn record_result(&self, document_id: &str, result: DocumentResult);
    async fn record_error(&self, document_id: &str, message: &str);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentRecord {
    pub status: Option<DocumentStatus>,
    pub status_history: Vec<DocumentStatus>,
    pub ocr_tier: Option<OcrTier>,
    pub raw_text: Option<String>,
    pub result: Option<DocumentResult>,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, DocumentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, document_id: &str) -> Option<DocumentRecord> {
        self.records.lock().unwrap().get(document_id).cloned()
    }

    fn with_record(&self, document_id: &str, f: impl FnOnce(&mut DocumentRecord)) {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(document_id.to_string()).or_default();
        f(record);
        record.updated_at = Some(Utc::now());
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn set_status(&self, document_id: &str, status: DocumentStatus) {
        self.with_record(document_id, |r| {
            r.status = Some(status);
            r.status_history.push(status);
        });
    }

    async fn record_raw_extraction(&self, document_id: &str, tier: OcrTier, raw_text: &str) {
        self.with_record(document_id, |r| {
            r.ocr_tier = Some(tier);
            r.raw_text = Some(raw_text.to_string());
        });
    }

    async fn record_result(&self, document_id: &str, result: DocumentResult) {
        self.with_record(document_id, |r| r.result = Some(result));
    }

    async fn record_error(&self, document_id: &str, message: &str) {
        self.with_record(document_id, |r| r.error = Some(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_history_preserved() {
        let store = MemoryStore::new();
        store.set_status("doc1", DocumentStatus::Queued).await;
        store.set_status("doc1", DocumentStatus::Extracting).await;
        store.set_status("doc1", DocumentStatus::Draft).await;

        let record = store.get("doc1").unwrap();
        assert_eq!(record.status, Some(DocumentStatus::Draft));
        assert_eq!(
            record.status_history,
            vec![
                DocumentStatus::Queued,
                DocumentStatus::Extracting,
                DocumentStatus::Draft
            ]
        );
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DocumentStatus::Extracting).unwrap();
        assert_eq!(json, "\"extracting\"");
    }
}

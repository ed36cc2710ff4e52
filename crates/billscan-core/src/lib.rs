//! Billscan core: an invoice extraction pipeline.
//!
//! Documents flow through tiered text extraction (embedded text layer,
//! fast OCR, deep OCR), an agentic LLM pass that produces structured
//! invoice data, and an optional verification pass that cross-checks OCR
//! output against the document's own text layer. The [`scheduler`] module
//! ties the stages together; everything else is usable on its own.

pub mod agent;
pub mod config;
pub mod display;
pub mod extract;
pub mod pdf;
pub mod scheduler;
pub mod store;
pub mod verify;
pub mod worker;

pub use agent::{ChatClient, HttpChatClient, ModelResolver, StructuredExtraction};
pub use config::{Config, Settings};
pub use extract::{ExtractionResult, OcrTier, QualityThresholds, TierController};
pub use scheduler::{PipelineJob, Scheduler};
pub use store::{DocumentStatus, DocumentStore, MemoryStore};
pub use worker::{spawn_manager, WorkerConfig, WorkerError, WorkerHandle};

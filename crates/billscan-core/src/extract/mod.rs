//! Tiered text extraction.
//!
//! Three strategies, cheapest first:
//!
//! 1. Text layer (lopdf, in-process) - clean digital PDFs
//! 2. Fast OCR (worker process) - scans, photos, broken fonts
//! 3. Deep OCR (worker process) - poor quality input the fast pass fumbles
//!
//! Escalation is driven by quality heuristics: a text layer full of
//! `(cid:` garbage or replacement characters falls through to OCR, and a
//! fast-OCR result with low word confidence falls through to deep OCR.
//! Tiers 2 and 3 run under the caller-supplied OCR mutex, so OCR memory
//! pressure stays bounded no matter how many documents are in flight.

mod quality;

pub use quality::{OcrConfidence, QualityThresholds, QualityVerdict, TextLayerVerdict};

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::pdf::{self, TextLayer};
use crate::worker::WorkerHandle;

/// Which strategy produced an extraction. Serialized as 1/2/3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrTier {
    TextLayer,
    FastOcr,
    DeepOcr,
}

impl OcrTier {
    pub fn as_u8(self) -> u8 {
        match self {
            OcrTier::TextLayer => 1,
            OcrTier::FastOcr => 2,
            OcrTier::DeepOcr => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OcrTier::TextLayer),
            2 => Some(OcrTier::FastOcr),
            3 => Some(OcrTier::DeepOcr),
            _ => None,
        }
    }
}

impl Serialize for OcrTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for OcrTier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        OcrTier::from_u8(value)
            .ok_or_else(|| D::Error::custom(format!("invalid OCR tier: {}", value)))
    }
}

/// One extraction attempt's output.
///
/// Invariant: `pages.len() == total_pages`, and `full_text` is the pages
/// concatenated in order. Not persisted itself; only what the downstream
/// stages derive from it survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(rename = "fullText")]
    pub full_text: String,
    pub pages: Vec<String>,
    #[serde(rename = "totalPages")]
    pub total_pages: usize,
    #[serde(rename = "ocrTier")]
    pub ocr_tier: OcrTier,
    /// Raw text layer kept alongside OCR output when the layer exists but is
    /// broken. Ground truth for the verification pass.
    #[serde(rename = "textLayerRef", skip_serializing_if = "Option::is_none")]
    pub text_layer_ref: Option<String>,
}

/// Non-PDF uploads that go straight to OCR.
const IMAGE_EXTENSIONS: &[&str] = &[
    "heic", "heif", "jpg", "jpeg", "png", "tiff", "tif", "bmp", "webp",
];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// What the OCR worker sends back for a `fast_ocr`/`deep_ocr` request.
#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(rename = "fullText")]
    full_text: String,
    pages: Vec<String>,
    #[serde(rename = "totalPages")]
    total_pages: usize,
    confidence: Option<OcrConfidence>,
}

/// Chooses the cheapest tier likely to succeed and escalates otherwise.
pub struct TierController {
    worker: WorkerHandle,
    ocr_mutex: Arc<Mutex<()>>,
    thresholds: QualityThresholds,
}

impl TierController {
    pub fn new(
        worker: WorkerHandle,
        ocr_mutex: Arc<Mutex<()>>,
        thresholds: QualityThresholds,
    ) -> Self {
        Self {
            worker,
            ocr_mutex,
            thresholds,
        }
    }

    /// Extract text, escalating 1 → 2 → 3 as quality checks fail.
    pub async fn extract_document(&self, path: &Path) -> Result<ExtractionResult> {
        if is_image(path) {
            debug!(path = %path.display(), "Image file - skipping text layer");
            return self.run_ocr(path, None).await;
        }

        // Tier 1
        let mut broken_layer = None;
        match pdf::extract_text_layer(path) {
            Ok(layer) => {
                let verdict = quality::assess_text_layer(&layer.full_text, &self.thresholds);
                if verdict.accept {
                    info!(pages = layer.total_pages, "Text layer accepted");
                    return Ok(from_text_layer(layer));
                }
                info!(reason = %verdict.reason, "Text layer rejected - falling back to OCR");
                if verdict.broken {
                    broken_layer = Some(layer.full_text);
                }
            }
            Err(e) => {
                info!(error = %e, "Text layer extraction failed - falling back to OCR");
            }
        }

        self.run_ocr(path, broken_layer).await
    }

    /// Force a specific OCR tier, bypassing escalation. Used when a human
    /// retries a poor first pass with a heavier tier.
    pub async fn extract_with_tier(&self, path: &Path, tier: OcrTier) -> Result<ExtractionResult> {
        if tier == OcrTier::TextLayer {
            let layer = pdf::extract_text_layer(path)?;
            return Ok(from_text_layer(layer));
        }

        // Best-effort broken text layer for cross-checking.
        let text_layer_ref = if is_image(path) {
            None
        } else {
            pdf::extract_text_layer(path).ok().and_then(|layer| {
                let verdict = quality::assess_text_layer(&layer.full_text, &self.thresholds);
                verdict.broken.then_some(layer.full_text)
            })
        };

        let _ocr_guard = self.ocr_mutex.lock().await;
        let op = match tier {
            OcrTier::FastOcr => "fast_ocr",
            OcrTier::DeepOcr => "deep_ocr",
            OcrTier::TextLayer => unreachable!("handled above"),
        };
        let response = self.ocr_request(op, path).await?;
        Ok(from_ocr(response, tier, text_layer_ref))
    }

    /// Tier 2, escalating to tier 3 when the fast pass looks unreliable.
    /// Holds the OCR mutex across both attempts.
    async fn run_ocr(
        &self,
        path: &Path,
        broken_layer: Option<String>,
    ) -> Result<ExtractionResult> {
        let _ocr_guard = self.ocr_mutex.lock().await;

        let fast = self.ocr_request("fast_ocr", path).await?;
        let verdict = quality::assess_ocr(
            &fast.full_text,
            fast.confidence.as_ref(),
            broken_layer.as_deref(),
            &self.thresholds,
        );
        if verdict.accept {
            info!(reason = %verdict.reason, "Fast OCR accepted");
            return Ok(from_ocr(fast, OcrTier::FastOcr, broken_layer));
        }

        info!(reason = %verdict.reason, "Fast OCR rejected - escalating to deep OCR");
        let deep = self.ocr_request("deep_ocr", path).await?;
        Ok(from_ocr(deep, OcrTier::DeepOcr, broken_layer))
    }

    async fn ocr_request(&self, op: &str, path: &Path) -> Result<OcrResponse> {
        let request = serde_json::json!({
            "op": op,
            "path": path.to_string_lossy(),
        });
        let response = self
            .worker
            .request(request)
            .await
            .with_context(|| format!("{} request failed", op))?;
        let parsed: OcrResponse = serde_json::from_value(response)
            .with_context(|| format!("{} response malformed", op))?;
        if parsed.pages.len() != parsed.total_pages {
            bail!(
                "{} response malformed: {} page(s) but totalPages={}",
                op,
                parsed.pages.len(),
                parsed.total_pages
            );
        }
        Ok(parsed)
    }
}

fn from_text_layer(layer: TextLayer) -> ExtractionResult {
    ExtractionResult {
        full_text: layer.full_text,
        total_pages: layer.total_pages,
        pages: layer.pages,
        ocr_tier: OcrTier::TextLayer,
        text_layer_ref: None,
    }
}

fn from_ocr(
    response: OcrResponse,
    tier: OcrTier,
    text_layer_ref: Option<String>,
) -> ExtractionResult {
    ExtractionResult {
        full_text: response.full_text,
        pages: response.pages,
        total_pages: response.total_pages,
        ocr_tier: tier,
        text_layer_ref,
    }
}

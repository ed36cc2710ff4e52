use std::path::Path;

use anyhow::{Context, Result};

/// Text layer pulled straight out of a PDF, one entry per page.
#[derive(Debug, Clone)]
pub struct TextLayer {
    /// All pages joined in order.
    pub full_text: String,
    /// Per-page text, 1-indexed by position.
    pub pages: Vec<String>,
    pub total_pages: usize,
}

/// Extract the embedded text layer from a PDF file.
///
/// This is the cheap tier: no rendering, no models, just the text the PDF
/// already carries. Scanned documents come back (near) empty and broken
/// fonts come back as garbage; quality assessment is the caller's job.
pub fn extract_text_layer(path: &Path) -> Result<TextLayer> {
    let pdf_bytes = std::fs::read(path).context("Failed to read PDF file")?;
    extract_text_layer_from_bytes(&pdf_bytes)
}

/// Extract the text layer from PDF bytes already in memory.
pub fn extract_text_layer_from_bytes(pdf_bytes: &[u8]) -> Result<TextLayer> {
    let doc = lopdf::Document::load_mem(pdf_bytes).context("Failed to parse PDF")?;

    let mut page_numbers: Vec<u32> = doc.get_pages().keys().cloned().collect();
    page_numbers.sort();

    let mut pages = Vec::with_capacity(page_numbers.len());
    for page_num in &page_numbers {
        let mut page_text = doc.extract_text(&[*page_num]).unwrap_or_default();
        while page_text.ends_with('\n') {
            page_text.pop();
        }
        pages.push(page_text);
    }

    let full_text = pages.join("\n\n");
    tracing::debug!(
        chars = full_text.len(),
        pages = pages.len(),
        "Extracted text layer"
    );

    Ok(TextLayer {
        full_text,
        total_pages: pages.len(),
        pages,
    })
}

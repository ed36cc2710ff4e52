//! Display names for processed documents: `YYYYMMDD Supplier $total.pdf`
//! style, degrading to whatever parts were actually extracted.

use chrono::NaiveDate;

use crate::agent::schema::StructuredExtraction;

/// Build a human-scannable name from the extraction. Falls back to the
/// original filename when nothing usable was extracted.
pub fn generate_display_name(extraction: &StructuredExtraction, original_filename: &str) -> String {
    let mut parts = Vec::new();

    if let Some(date) = extraction
        .invoice_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    {
        parts.push(date.format("%Y%m%d").to_string());
    }

    if let Some(supplier) = extraction.supplier_name.as_deref() {
        let cleaned = sanitize(supplier);
        if !cleaned.is_empty() {
            parts.push(cleaned);
        }
    }

    if let Some(total) = extraction.total_amount {
        parts.push(format!("${total:.2}"));
    }

    if parts.is_empty() {
        original_filename.to_string()
    } else {
        parts.join(" ")
    }
}

/// Strip characters that are unsafe in filenames and collapse whitespace.
fn sanitize(name: &str) -> String {
    let filtered: String = name
        .chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                ' '
            } else {
                c
            }
        })
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

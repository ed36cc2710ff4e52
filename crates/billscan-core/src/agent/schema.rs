//! The structured document the agent is asked to produce.

use serde::{Deserialize, Serialize};

/// One line of the invoice, including summary rows (subtotal, tax, total).
///
/// `attrs` carries whatever per-line detail the document exposes (unit,
/// unit_amount, unit_price, extra1..) without forcing a fixed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub label: String,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(rename = "type", default)]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

/// Extraction output for one document. Every header field is optional; the
/// model omits what the document does not state rather than guessing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredExtraction {
    #[serde(default)]
    pub supplier_name: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub invoice_date: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub gst_amount: Option<f64>,
    #[serde(default)]
    pub gst_number: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl StructuredExtraction {
    /// Append a line to `notes`, creating it if absent.
    pub fn push_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(note);
            }
            None => self.notes = Some(note.to_string()),
        }
    }
}

//! Quality heuristics deciding when to escalate between tiers.
//!
//! The numbers are policy, not contract: the defaults were tuned against a
//! corpus of real utility bills and retail receipts where the hardest clean
//! scan scored 88% mean confidence, so the bar sits just under that.

use serde::Deserialize;
use std::collections::HashSet;

/// Escalation thresholds. Construct with `QualityThresholds::default()` and
/// override fields for stricter or looser policy.
#[derive(Debug, Clone)]
pub struct QualityThresholds {
    /// Minimum mean OCR word confidence (percent).
    pub min_confidence: f64,
    /// Maximum share of low-confidence words.
    pub max_low_confidence_ratio: f64,
    /// Minimum trimmed OCR text length in chars.
    pub min_ocr_text_len: usize,
    /// Minimum share of text-layer numbers the OCR output must reproduce.
    pub min_number_match_ratio: f64,
    /// Minimum trimmed text-layer length before it counts as usable.
    pub min_text_layer_len: usize,
    /// Replacement characters tolerated before the layer counts as broken.
    pub max_replacement_chars: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_confidence: 80.0,
            max_low_confidence_ratio: 0.10,
            min_ocr_text_len: 50,
            min_number_match_ratio: 0.5,
            min_text_layer_len: 100,
            max_replacement_chars: 20,
        }
    }
}

/// Per-document confidence stats reported by the fast OCR tier.
#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfidence {
    pub mean: f64,
    pub per_page: Vec<f64>,
    pub low_confidence_words: u64,
    pub total_words: u64,
}

#[derive(Debug, Clone)]
pub struct QualityVerdict {
    pub accept: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct TextLayerVerdict {
    pub accept: bool,
    pub reason: String,
    /// A broken layer (garbled, not merely absent) is still worth keeping
    /// as a cross-reference for verification.
    pub broken: bool,
}

/// Is the embedded text layer usable as-is, or does this document need OCR?
pub fn assess_text_layer(full_text: &str, thresholds: &QualityThresholds) -> TextLayerVerdict {
    let has_cid_garbage = full_text.contains("(cid:");
    let replacement_count = full_text.matches('\u{fffd}').count();
    let has_replacement_garbage = replacement_count > thresholds.max_replacement_chars;
    let has_minimal_text = full_text.trim().len() < thresholds.min_text_layer_len;

    if !has_cid_garbage && !has_replacement_garbage && !has_minimal_text {
        return TextLayerVerdict {
            accept: true,
            reason: "text layer OK".to_string(),
            broken: false,
        };
    }

    let broken = has_cid_garbage || has_replacement_garbage;
    let reason = if has_minimal_text && !broken {
        "minimal text (possibly scanned/image PDF)".to_string()
    } else {
        format!(
            "broken text (cid:{}, replacements:{})",
            has_cid_garbage, replacement_count
        )
    };

    TextLayerVerdict {
        accept: false,
        reason,
        broken,
    }
}

/// Is the fast-OCR output good enough, or should we escalate to deep OCR?
///
/// For image documents the call rests on confidence and text density; for
/// digital PDFs with a (broken) text layer, the numbers in the OCR output
/// are also cross-referenced against the layer.
pub fn assess_ocr(
    full_text: &str,
    confidence: Option<&OcrConfidence>,
    text_layer: Option<&str>,
    thresholds: &QualityThresholds,
) -> QualityVerdict {
    if let Some(conf) = confidence {
        if conf.mean < thresholds.min_confidence {
            return QualityVerdict {
                accept: false,
                reason: format!(
                    "confidence {:.1}% < {:.0}% threshold",
                    conf.mean, thresholds.min_confidence
                ),
            };
        }

        if conf.total_words > 0 {
            let low_ratio = conf.low_confidence_words as f64 / conf.total_words as f64;
            if low_ratio > thresholds.max_low_confidence_ratio {
                return QualityVerdict {
                    accept: false,
                    reason: format!(
                        "{:.0}% low-confidence words > {:.0}% threshold",
                        low_ratio * 100.0,
                        thresholds.max_low_confidence_ratio * 100.0
                    ),
                };
            }
        }
    }

    let trimmed_len = full_text.trim().len();
    if trimmed_len < thresholds.min_ocr_text_len {
        return QualityVerdict {
            accept: false,
            reason: format!(
                "extracted text too short ({} < {} chars)",
                trimmed_len, thresholds.min_ocr_text_len
            ),
        };
    }

    if let Some(layer) = text_layer {
        if layer.trim().len() > thresholds.min_text_layer_len {
            let layer_numbers = extract_numbers(layer);
            if layer_numbers.len() > 3 {
                let ocr_numbers = extract_numbers(full_text);
                let matched = layer_numbers.intersection(&ocr_numbers).count();
                let ratio = matched as f64 / layer_numbers.len() as f64;
                if ratio < thresholds.min_number_match_ratio {
                    return QualityVerdict {
                        accept: false,
                        reason: format!(
                            "number cross-ref: {}/{} matched ({:.0}% < {:.0}%)",
                            matched,
                            layer_numbers.len(),
                            ratio * 100.0,
                            thresholds.min_number_match_ratio * 100.0
                        ),
                    };
                }
            }
        }
    }

    let reason = match confidence {
        Some(conf) => format!(
            "confidence {:.1}%, {}/{} low-conf words",
            conf.mean, conf.low_confidence_words, conf.total_words
        ),
        None => format!("{} chars extracted", trimmed_len),
    };
    QualityVerdict {
        accept: true,
        reason,
    }
}

/// Distinct number-like tokens: digits at both ends, at least three chars,
/// with currency commas stripped so "1,234.50" and "1234.50" compare equal.
/// Two-digit incidentals (quantities, day-of-month) are too common on both
/// sides to carry any cross-reference signal.
fn extract_numbers(text: &str) -> HashSet<String> {
    let mut numbers = HashSet::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            let mut end = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_digit() || matches!(bytes[i], b',' | b'.' | b'-' | b'/'))
            {
                if bytes[i].is_ascii_digit() {
                    end = i;
                }
                i += 1;
            }
            if end - start >= 2 {
                let token: String = text[start..=end].chars().filter(|c| *c != ',').collect();
                numbers.insert(token);
            }
        } else {
            i += 1;
        }
    }
    numbers
}

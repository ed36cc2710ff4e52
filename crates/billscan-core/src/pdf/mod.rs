//! PDF text-layer access (tier 1).

mod extractor;

pub use extractor::{extract_text_layer, extract_text_layer_from_bytes, TextLayer};

#[cfg(test)]
pub(crate) use extractor::tests::build_pdf;

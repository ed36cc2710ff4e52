//! Tools the extraction agent may call against the document text.
//!
//! Dispatch is a closed enum: a tool name outside it is answered with an
//! error string the model sees as the tool result, never a crash.

use serde_json::{json, Value};

use super::client::ToolDefinition;

const MAX_SEARCH_MATCHES: usize = 20;
const DEFAULT_CONTEXT_LINES: usize = 5;

/// The document text a tool call runs against.
pub struct ToolContext {
    pub full_text: String,
    pub pages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    GetPageText { page: i64 },
    SearchText { query: String },
    GetTextAround { keyword: String, context_lines: usize },
    SubmitInvoice { payload: Value },
}

impl ToolInvocation {
    /// Map a wire-level tool call to an invocation. The Err string goes
    /// straight back to the model as the tool result.
    pub fn parse(name: &str, args: &Value) -> Result<Self, String> {
        match name {
            "get_page_text" => {
                let page = args
                    .get("page")
                    .and_then(Value::as_i64)
                    .ok_or("get_page_text requires an integer 'page' argument")?;
                Ok(Self::GetPageText { page })
            }
            "search_text" => {
                let query = args
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or("search_text requires a 'query' argument")?;
                Ok(Self::SearchText {
                    query: query.to_string(),
                })
            }
            "get_text_around" => {
                let keyword = args
                    .get("keyword")
                    .and_then(Value::as_str)
                    .ok_or("get_text_around requires a 'keyword' argument")?;
                let context_lines = args
                    .get("context_lines")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_CONTEXT_LINES);
                Ok(Self::GetTextAround {
                    keyword: keyword.to_string(),
                    context_lines,
                })
            }
            "submit_invoice" => Ok(Self::SubmitInvoice {
                payload: args.clone(),
            }),
            other => Err(format!("Unknown tool: {other}")),
        }
    }

    /// `SubmitInvoice` is terminal and handled by the caller; the other three
    /// produce a textual tool result here.
    pub fn execute(&self, ctx: &ToolContext) -> String {
        match self {
            Self::GetPageText { page } => get_page_text(ctx, *page),
            Self::SearchText { query } => search_text(ctx, query),
            Self::GetTextAround {
                keyword,
                context_lines,
            } => get_text_around(ctx, keyword, *context_lines),
            Self::SubmitInvoice { .. } => "invoice received".to_string(),
        }
    }
}

fn get_page_text(ctx: &ToolContext, page: i64) -> String {
    if page < 1 || page as usize > ctx.pages.len() {
        return format!(
            "Page {page} is out of range. The document has {} page(s).",
            ctx.pages.len()
        );
    }
    ctx.pages[page as usize - 1].clone()
}

/// Each match is reported with one line of context either side.
fn search_text(ctx: &ToolContext, query: &str) -> String {
    let needle = query.to_lowercase();
    let lines: Vec<&str> = ctx.full_text.lines().collect();
    let mut blocks = Vec::new();
    let mut total = 0;
    for (idx, line) in lines.iter().enumerate() {
        if !line.to_lowercase().contains(&needle) {
            continue;
        }
        total += 1;
        if blocks.len() < MAX_SEARCH_MATCHES {
            let start = idx.saturating_sub(1);
            let end = (idx + 2).min(lines.len());
            let block: Vec<String> = (start..end)
                .map(|n| format!("line {}: {}", n + 1, lines[n].trim()))
                .collect();
            blocks.push(block.join("\n"));
        }
    }

    if total == 0 {
        return format!("No matches found for \"{query}\".");
    }
    let mut out = format!("{total} match(es) for \"{query}\":\n");
    out.push_str(&blocks.join("\n--\n"));
    if total > MAX_SEARCH_MATCHES {
        out.push_str(&format!("\n(showing the first {MAX_SEARCH_MATCHES})"));
    }
    out
}

fn get_text_around(ctx: &ToolContext, keyword: &str, context_lines: usize) -> String {
    let needle = keyword.to_lowercase();
    let lines: Vec<&str> = ctx.full_text.lines().collect();
    let hit = lines
        .iter()
        .position(|line| line.to_lowercase().contains(&needle));
    match hit {
        None => format!("Keyword \"{keyword}\" not found in the document."),
        Some(idx) => {
            let start = idx.saturating_sub(context_lines);
            let end = (idx + context_lines + 1).min(lines.len());
            lines[start..end].join("\n")
        }
    }
}

/// Schemas advertised to the model, submit_invoice last.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_page_text".to_string(),
            description: "Get the full text of one page of the document (1-based page number)."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "page": {"type": "integer", "description": "1-based page number"}
                },
                "required": ["page"]
            }),
        },
        ToolDefinition {
            name: "search_text".to_string(),
            description: "Search the document text for a string (case-insensitive). Returns each matching line with one line of context either side.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Text to search for"}
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "get_text_around".to_string(),
            description: "Get the lines surrounding the first occurrence of a keyword.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "keyword": {"type": "string", "description": "Keyword to locate"},
                    "context_lines": {"type": "integer", "description": "Lines of context either side (default 5)"}
                },
                "required": ["keyword"]
            }),
        },
        ToolDefinition {
            name: "submit_invoice".to_string(),
            description: "Submit the final structured invoice data. Call this exactly once, when extraction is complete.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "supplier_name": {"type": "string"},
                    "invoice_number": {"type": "string"},
                    "invoice_date": {"type": "string", "description": "ISO date YYYY-MM-DD"},
                    "due_date": {"type": "string", "description": "ISO date YYYY-MM-DD"},
                    "total_amount": {"type": "number"},
                    "gst_amount": {"type": "number"},
                    "gst_number": {"type": "string"},
                    "currency": {"type": "string"},
                    "entries": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "label": {"type": "string"},
                                "amount": {"type": "number"},
                                "type": {"type": "string", "description": "line | subtotal | tax | total | due"},
                                "attrs": {"type": "object"}
                            },
                            "required": ["label"]
                        }
                    },
                    "notes": {"type": "string"}
                },
                "required": ["entries"]
            }),
        },
    ]
}

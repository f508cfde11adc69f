//! Raw provider message → `CanonicalMessage`.
//!
//! Never fails: missing headers fall back to placeholders, undecodable
//! parts are skipped, and markup is reduced to text best-effort.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use scraper::{Html, Node};

use crate::mailbox::{MessagePart, RawMessage};
use crate::pipeline::types::CanonicalMessage;

pub const NO_SUBJECT: &str = "No Subject";
pub const UNKNOWN_SENDER: &str = "Unknown Sender";
pub const UNKNOWN_DATE: &str = "Unknown Date";

const TEXT_PLAIN: &str = "text/plain";
const TEXT_HTML: &str = "text/html";

/// Reduce a provider message to subject, sender, date and plain-text body.
pub fn normalize(raw: &RawMessage) -> CanonicalMessage {
    CanonicalMessage {
        id: raw.id.clone(),
        subject: raw.header("Subject").unwrap_or(NO_SUBJECT).to_string(),
        sender: raw.header("From").unwrap_or(UNKNOWN_SENDER).to_string(),
        date: raw.header("Date").unwrap_or(UNKNOWN_DATE).to_string(),
        body: extract_body(&raw.payload),
    }
}

/// Plain-text body of a part tree.
///
/// A single-part message is decoded directly. Multipart messages prefer the
/// first non-empty `text/plain` leaf (depth-first), then the first
/// `text/html` leaf.
pub fn extract_body(payload: &MessagePart) -> String {
    match payload {
        MessagePart::Leaf { mime_type, data } => {
            let text = data.as_deref().and_then(decode_payload).unwrap_or_default();
            if mime_type.eq_ignore_ascii_case(TEXT_HTML) {
                html_to_text(&text)
            } else {
                text
            }
        }
        MessagePart::Container { .. } => {
            if let Some(plain) = first_leaf(payload, TEXT_PLAIN) {
                return plain;
            }
            first_leaf(payload, TEXT_HTML)
                .map(|html| html_to_text(&html))
                .unwrap_or_default()
        }
    }
}

/// Depth-first search for a leaf of `wanted` type that decodes to a non-empty string.
fn first_leaf(part: &MessagePart, wanted: &str) -> Option<String> {
    match part {
        MessagePart::Leaf { mime_type, data } if mime_type.eq_ignore_ascii_case(wanted) => data
            .as_deref()
            .and_then(decode_payload)
            .filter(|text| !text.is_empty()),
        MessagePart::Leaf { .. } => None,
        MessagePart::Container { parts, .. } => {
            parts.iter().find_map(|child| first_leaf(child, wanted))
        }
    }
}

/// Decode a base64url payload, padded or not. Bytes are read as lossy UTF-8.
pub fn decode_payload(data: &str) -> Option<String> {
    let trimmed = data.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Text content of an HTML document, one trimmed text node per line.
/// `script` and `style` contents are dropped.
pub fn html_to_text(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let document = Html::parse_document(html);
    let mut lines = Vec::new();
    for node in document.tree.nodes() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            matches!(a.value(), Node::Element(el) if matches!(el.name(), "script" | "style"))
        });
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed);
        }
    }
    lines.join("\n")
}

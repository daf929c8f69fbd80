//! Secure Attachments - Oversize Text
//!
//! Message bodies longer than the inline threshold travel as a text
//! attachment, with a truncated copy kept inline.

use serde::{Deserialize, Serialize};

use crate::attachment::PendingAttachment;

/// Inline formatting applied to a span of the body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum BodyRangeStyle {
    Bold,
    Italic,
    Spoiler,
    Strikethrough,
    Monospace,
    Mention { service_id: String },
}

/// A styled span, in byte offsets into the body text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRange {
    pub start: usize,
    pub length: usize,
    #[serde(flatten)]
    pub style: BodyRangeStyle,
}

impl BodyRange {
    pub fn end(&self) -> usize {
        self.start.saturating_add(self.length)
    }
}

/// Message text plus its formatting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub text: String,
    #[serde(default)]
    pub ranges: Vec<BodyRange>,
}

impl MessageBody {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ranges: Vec::new(),
        }
    }
}

/// Outcome of preparing a message body for sending
#[derive(Debug, Clone)]
pub enum PreparedText {
    /// Short enough to send inline
    Inline(MessageBody),
    /// Truncated inline body plus the full text as an attachment
    Oversize {
        truncated: MessageBody,
        attachment: PendingAttachment,
    },
}

impl PreparedText {
    pub fn inline_body(&self) -> &MessageBody {
        match self {
            PreparedText::Inline(body) => body,
            PreparedText::Oversize { truncated, .. } => truncated,
        }
    }
}

/// Largest char boundary not after `max_bytes`
fn floor_char_boundary(text: &str, max_bytes: usize) -> usize {
    if max_bytes >= text.len() {
        return text.len();
    }
    (0..=max_bytes)
        .rev()
        .find(|&index| text.is_char_boundary(index))
        .unwrap_or(0)
}

/// Cut a body to at most `max_bytes`, clipping or dropping ranges past the
/// cut. Returns `None` when the body already fits.
pub fn truncate_body(body: &MessageBody, max_bytes: usize) -> Option<MessageBody> {
    if body.text.len() <= max_bytes {
        return None;
    }

    let cut = floor_char_boundary(&body.text, max_bytes);
    let text = body.text[..cut].to_string();

    let ranges = body
        .ranges
        .iter()
        .filter(|range| range.start < cut)
        .map(|range| BodyRange {
            start: range.start,
            length: range.end().min(cut) - range.start,
            style: range.style.clone(),
        })
        .filter(|range| range.length > 0)
        .collect();

    Some(MessageBody { text, ranges })
}

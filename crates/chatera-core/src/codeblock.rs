//! Fenced code-block extraction over partial markdown.
//!
//! The extractor is re-run against the whole accumulated text of a message after
//! every token, since a fence can close many tokens after it opened. A block whose
//! closing fence has not arrived yet runs to the end of the text and is reported as
//! incomplete.

use std::sync::OnceLock;

use regex::Regex;

use crate::ids::{CodeBlockId, ConversationId, MessageId};
use crate::types::CodeBlock;

const FENCE: &str = "```";

fn fence_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?s)```([^\n`]*)(?:\n(.*?))?(```|\z)").expect("fence regex must compile")
    })
}

/// Extract every fenced region of `text` as a [`CodeBlock`].
///
/// Block ids are derived from `message_id` and the block's ordinal, so calling this
/// again on a longer prefix of the same message yields the same ids for blocks
/// already seen. A dangling opening fence is reported as an empty incomplete block
/// so that the last block's completeness always tracks fence parity.
#[must_use]
pub fn extract_code_blocks(
    text: &str,
    conversation_id: Option<&ConversationId>,
    message_id: &MessageId,
) -> Vec<CodeBlock> {
    fence_regex()
        .captures_iter(text)
        .enumerate()
        .map(|(ordinal, caps)| {
            let language = caps
                .get(1)
                .and_then(|m| m.as_str().split_whitespace().next())
                .unwrap_or_default()
                .to_string();
            let is_complete = caps.get(3).is_some_and(|m| m.as_str() == FENCE);
            let raw = caps.get(2).map_or("", |m| m.as_str());
            let content = if is_complete {
                raw.strip_suffix('\n').unwrap_or(raw)
            } else {
                raw
            };

            CodeBlock {
                id: CodeBlockId::derive(message_id, ordinal),
                conversation_id: conversation_id.cloned(),
                message_id: message_id.clone(),
                language,
                content: content.to_string(),
                is_complete,
            }
        })
        .collect()
}

/// Number of triple-backtick fence markers in `text`.
#[must_use]
pub fn fence_count(text: &str) -> usize {
    text.matches(FENCE).count()
}
